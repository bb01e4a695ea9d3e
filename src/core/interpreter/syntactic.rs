use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use super::{Interpretation, OutputInterpreter};

/// Balanced regions tried after the greedy candidate fails to parse.
const MAX_BALANCED_ATTEMPTS: usize = 32;

/// Finds the JSON embedded in agent output and repairs informal JSON
/// (unquoted keys, trailing commas, single quotes) before parsing it.
pub struct SyntacticInterpreter;

impl SyntacticInterpreter {
    pub fn interpret_text(raw: &str) -> Interpretation {
        match extract_json(raw) {
            Some(json) => Interpretation::from_json(json, raw),
            None => Interpretation::PlainText(raw.to_string()),
        }
    }
}

#[async_trait]
impl OutputInterpreter for SyntacticInterpreter {
    fn name(&self) -> &'static str {
        "syntactic"
    }

    async fn interpret(&self, raw: &str) -> Interpretation {
        Self::interpret_text(raw)
    }
}

/// Greedy candidate: from the first `{`/`[` to the last matching closer.
pub fn find_json_candidate(text: &str) -> Option<&str> {
    let start = text.find(['{', '['])?;
    let closer = if text[start..].starts_with('{') { '}' } else { ']' };
    let end = text.rfind(closer)?;
    if end <= start {
        return None;
    }
    Some(&text[start..=end])
}

/// Strict JSON first, then JSON5 as the repair pass.
pub fn parse_lenient(candidate: &str) -> Option<Value> {
    match serde_json::from_str::<Value>(candidate) {
        Ok(value) => Some(value),
        Err(strict) => match json5::from_str::<Value>(candidate) {
            Ok(value) => {
                debug!("Repaired informal JSON ({})", strict);
                Some(value)
            }
            Err(_) => None,
        },
    }
}

fn extract_json(raw: &str) -> Option<Value> {
    if let Some(value) = find_json_candidate(raw).and_then(parse_lenient) {
        return Some(value);
    }
    balanced_regions(raw)
        .take(MAX_BALANCED_ATTEMPTS)
        .find_map(parse_lenient)
}

/// Every region that starts at an opener and ends at its balancing closer,
/// skipping brackets inside string literals.
fn balanced_regions(text: &str) -> impl Iterator<Item = &str> {
    text.char_indices()
        .filter(|(_, c)| *c == '{' || *c == '[')
        .filter_map(move |(start, _)| balanced_end(&text[start..]).map(|len| &text[start..start + len]))
}

/// Byte length of the balanced region at the start of `text`.
fn balanced_end(text: &str) -> Option<usize> {
    let mut stack: Vec<char> = Vec::new();
    let mut quote: Option<char> = None;
    let mut escaped = false;

    for (i, c) in text.char_indices() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '"' | '\'' => quote = Some(c),
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                if stack.pop() != Some(c) {
                    return None;
                }
                if stack.is_empty() {
                    return Some(i + c.len_utf8());
                }
            }
            _ => {}
        }
    }
    None
}
