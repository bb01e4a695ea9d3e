use anyhow::{Context, Result};
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::io::AsyncReadExt;

use super::InterpretArgs;
use crate::core::config::PockConfig;
use crate::core::interpreter::{
    self, DelegatedInterpreter, Interpretation, NormalizerClient, ReplyItem, SharedInterpreter,
};

fn item_json(item: &ReplyItem) -> Value {
    json!({
        "response": item.response,
        "for": item.recipient,
        "blockId": item.block_id,
        "action": item.action_tag,
        "executionOrder": item.execution_order,
    })
}

/// Prints what the dispatcher would make of one captured agent output.
pub async fn run_interpret(config: &PockConfig, args: InterpretArgs) -> Result<()> {
    let raw = match args.input.as_deref() {
        None | Some("-") => {
            let mut buf = String::new();
            tokio::io::stdin()
                .read_to_string(&mut buf)
                .await
                .context("reading agent output from stdin")?;
            buf
        }
        Some(path) => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path))?,
    };

    let interpreter: SharedInterpreter = if args.delegated {
        Arc::new(DelegatedInterpreter::new(NormalizerClient::from_config(
            &config.interpreter,
        )))
    } else {
        interpreter::from_config(&config.interpreter)
    };

    let interpretation = interpreter.interpret(raw.trim()).await;
    let structured = matches!(interpretation, Interpretation::Structured { .. });
    let items: Vec<Value> = interpretation.into_items().iter().map(item_json).collect();
    let report = json!({
        "interpreter": interpreter.name(),
        "structured": structured,
        "items": items,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
