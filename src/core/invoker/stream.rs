//! Line-delimited JSON events emitted by the agent program in stream mode.

use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// A complete assistant turn (text and/or thinking blocks).
    ThinkingBlock(String),
    /// A partial chunk of the turn being generated.
    ThinkingDelta(String),
    /// The authoritative final answer.
    Result { text: String, is_error: bool },
}

/// Parses one stdout line. `Ok(None)` for events that carry nothing we use
/// (system/init, tool use, ...), `Err` when the line is not JSON at all.
pub fn parse_event(line: &str) -> Result<Option<StreamEvent>, serde_json::Error> {
    let value: Value = serde_json::from_str(line)?;
    let event = match value.get("type").and_then(Value::as_str) {
        Some("assistant") => assistant_text(&value).map(StreamEvent::ThinkingBlock),
        Some("stream_event") => delta_text(&value).map(StreamEvent::ThinkingDelta),
        Some("result") => Some(StreamEvent::Result {
            text: value
                .get("result")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            is_error: value
                .get("is_error")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        }),
        _ => None,
    };
    Ok(event)
}

fn assistant_text(value: &Value) -> Option<String> {
    let blocks = value.pointer("/message/content")?.as_array()?;
    let parts: Vec<&str> = blocks
        .iter()
        .filter_map(|block| match block.get("type").and_then(Value::as_str) {
            Some("text") => block.get("text").and_then(Value::as_str),
            Some("thinking") => block.get("thinking").and_then(Value::as_str),
            _ => None,
        })
        .filter(|text| !text.is_empty())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n"))
    }
}

fn delta_text(value: &Value) -> Option<String> {
    let event = value.get("event")?;
    if event.get("type").and_then(Value::as_str) != Some("content_block_delta") {
        return None;
    }
    let delta = event.get("delta")?;
    let text = match delta.get("type").and_then(Value::as_str) {
        Some("text_delta") => delta.get("text"),
        Some("thinking_delta") => delta.get("thinking"),
        _ => None,
    }?;
    text.as_str()
        .filter(|t| !t.is_empty())
        .map(str::to_string)
}

/// Running view of a stream: the thinking text shown to readers while the
/// agent works, plus the final result once it arrives.
#[derive(Debug, Default)]
pub struct StreamAccumulator {
    pub thinking: String,
    pub result: Option<(String, bool)>,
    pub raw: String,
}

impl StreamAccumulator {
    /// Folds one event in; returns true when the thinking text changed.
    pub fn apply(&mut self, event: StreamEvent) -> bool {
        match event {
            StreamEvent::ThinkingBlock(text) => {
                if !self.thinking.is_empty() && !self.thinking.ends_with('\n') {
                    self.thinking.push('\n');
                }
                self.thinking.push_str(&text);
                true
            }
            StreamEvent::ThinkingDelta(text) => {
                self.thinking.push_str(&text);
                true
            }
            StreamEvent::Result { text, is_error } => {
                self.result = Some((text, is_error));
                false
            }
        }
    }

    /// The final result event wins; then the accumulated assistant text; then raw stdout.
    pub fn final_text(&self) -> String {
        if let Some((text, _)) = &self.result {
            return text.clone();
        }
        if !self.thinking.trim().is_empty() {
            return self.thinking.clone();
        }
        self.raw.clone()
    }

    pub fn reported_error(&self) -> bool {
        matches!(self.result, Some((_, true)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_assistant_blocks() {
        let line = r#"{"type":"assistant","message":{"content":[
            {"type":"thinking","thinking":"Look at main.rs"},
            {"type":"tool_use","name":"Read"},
            {"type":"text","text":"Reading the file"}]}}"#;
        assert_eq!(
            parse_event(line).unwrap(),
            Some(StreamEvent::ThinkingBlock(
                "Look at main.rs\nReading the file".into()
            ))
        );
    }

    #[test]
    fn parses_partial_deltas() {
        let line = r#"{"type":"stream_event","event":{"type":"content_block_delta",
            "delta":{"type":"text_delta","text":"Fix"}}}"#;
        assert_eq!(
            parse_event(line).unwrap(),
            Some(StreamEvent::ThinkingDelta("Fix".into()))
        );
        let start = r#"{"type":"stream_event","event":{"type":"message_start"}}"#;
        assert_eq!(parse_event(start).unwrap(), None);
    }

    #[test]
    fn parses_result_and_error_flag() {
        let ok = r#"{"type":"result","subtype":"success","is_error":false,"result":"Fixed."}"#;
        assert_eq!(
            parse_event(ok).unwrap(),
            Some(StreamEvent::Result {
                text: "Fixed.".into(),
                is_error: false
            })
        );
        let failed = r#"{"type":"result","subtype":"error_max_turns","is_error":true}"#;
        assert_eq!(
            parse_event(failed).unwrap(),
            Some(StreamEvent::Result {
                text: String::new(),
                is_error: true
            })
        );
    }

    #[test]
    fn ignores_unknown_events_and_rejects_noise() {
        assert_eq!(
            parse_event(r#"{"type":"system","subtype":"init"}"#).unwrap(),
            None
        );
        assert!(parse_event("warning: something odd").is_err());
    }

    #[test]
    fn accumulator_prefers_result_text() {
        let mut acc = StreamAccumulator::default();
        assert!(acc.apply(StreamEvent::ThinkingBlock("step one".into())));
        assert!(acc.apply(StreamEvent::ThinkingBlock("step two".into())));
        assert_eq!(acc.thinking, "step one\nstep two");
        assert_eq!(acc.final_text(), "step one\nstep two");

        assert!(!acc.apply(StreamEvent::Result {
            text: "done".into(),
            is_error: false
        }));
        assert_eq!(acc.final_text(), "done");
        assert!(!acc.reported_error());
    }

    #[test]
    fn accumulator_falls_back_to_raw_output() {
        let acc = StreamAccumulator {
            raw: "{\"type\":\"system\"}\n".into(),
            ..Default::default()
        };
        assert_eq!(acc.final_text(), "{\"type\":\"system\"}\n");
    }
}
