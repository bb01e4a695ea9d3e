mod interpret;
mod serve;

use anyhow::{Result, anyhow};
use console::style;

use crate::core::block::{current_block, is_block_completed};
use crate::core::config::{self, PockConfig};
use crate::core::interpreter::NormalizerClient;
use crate::core::terminal::{self, GuideSection, print_error};

fn print_help() {
    terminal::print_banner();

    GuideSection::new("Core")
        .command("serve", "Run the dispatch scheduler and the HTTP API")
        .text("Options: --api-host <host>  --api-port <port>  --tick-ms <ms>")
        .print();

    GuideSection::new("Diagnostics")
        .command("block <dir>", "Print the current block number of a working dir")
        .command(
            "interpret [--delegated] <file|->",
            "Show the replies an agent output would produce",
        )
        .command("probe", "Check the normalization service")
        .print();

    GuideSection::new("Environment")
        .text(&format!(
            "{}  data directory (default ~/.pock)",
            style(config::DATA_DIR_ENV).bold()
        ))
        .print();

    println!(
        "\n {} {} <command> [options]\n",
        style("Usage:").bold(),
        style("pock").green()
    );
}

/// Flags of `pock serve`, applied over the values from `config.toml`.
pub(crate) fn parse_serve_flags(
    args: &[String],
    start: usize,
    mut api_host: String,
    mut api_port: u16,
    mut tick_ms: u64,
) -> (String, u16, u64) {
    let mut i = start;
    while i < args.len() {
        match args[i].as_str() {
            "--api-port" => {
                if i + 1 < args.len() {
                    api_port = args[i + 1].parse().unwrap_or(api_port);
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--api-host" => {
                if i + 1 < args.len() {
                    api_host = args[i + 1].clone();
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--tick-ms" => {
                if i + 1 < args.len() {
                    tick_ms = args[i + 1]
                        .parse()
                        .ok()
                        .filter(|ms| *ms > 0)
                        .unwrap_or(tick_ms);
                    i += 2;
                } else {
                    i += 1;
                }
            }
            _ => i += 1,
        }
    }
    (api_host, api_port, tick_ms)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct InterpretArgs {
    pub delegated: bool,
    /// File to read; `None` or `-` reads stdin.
    pub input: Option<String>,
}

pub(crate) fn parse_interpret_args(args: &[String], start: usize) -> InterpretArgs {
    let mut delegated = false;
    let mut input = None;
    for arg in args.iter().skip(start) {
        match arg.as_str() {
            "--delegated" | "-d" => delegated = true,
            _ if input.is_none() => input = Some(arg.clone()),
            _ => {}
        }
    }
    InterpretArgs { delegated, input }
}

pub async fn run_main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let data_dir = config::data_dir();

    let Some(cmd) = args.get(1).map(String::as_str) else {
        print_help();
        return Ok(());
    };

    match cmd {
        "serve" => {
            let mut config = PockConfig::load(&data_dir)?;
            let (api_host, api_port, tick_ms) = parse_serve_flags(
                &args,
                2,
                config.server.host.clone(),
                config.server.port,
                config.scheduler.tick_ms,
            );
            config.server.host = api_host;
            config.server.port = api_port;
            config.scheduler.tick_ms = tick_ms;
            serve::run_serve(config, data_dir).await
        }
        "block" => {
            let Some(dir) = args.get(2) else {
                return Err(anyhow!("Usage: pock block <dir>"));
            };
            let dir = std::path::Path::new(dir);
            let block = current_block(dir);
            println!("{}", block);
            if is_block_completed(dir, block) {
                terminal::print_info(&format!("Block {} is marked completed", block));
            }
            Ok(())
        }
        "interpret" => {
            let config = PockConfig::load(&data_dir)?;
            interpret::run_interpret(&config, parse_interpret_args(&args, 2)).await
        }
        "probe" => {
            let config = PockConfig::load(&data_dir)?;
            let client = NormalizerClient::from_config(&config.interpreter);
            terminal::print_status("Normalizer", client.base_url());
            if client.is_available().await {
                terminal::print_success("Normalization service is reachable");
                Ok(())
            } else {
                terminal::print_warn(
                    "Delegated interpretation will fall back to syntactic extraction",
                );
                Err(anyhow!(
                    "Normalization service at {} is not reachable",
                    client.base_url()
                ))
            }
        }
        "help" | "--help" | "-h" => {
            print_help();
            Ok(())
        }
        _ => {
            print_error(&format!("Unknown command: {}", cmd));
            print_help();
            Ok(())
        }
    }
}
