//! RELP gateway binary.
//!
//! Listens for RELP connections and appends every received message to a
//! JSON-lines file.
//!
//! ```text
//! relp-gateway <output.jsonl> [<address:port>]
//! ```
//!
//! `RELP_GATEWAY_CONFIG` may name a JSON config file; the address argument
//! overrides its `bind_addr`. Logs go to stderr, filtered by `RUST_LOG`
//! (default `info`).

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use relp_gateway::{JsonLinesSink, RelpServer, Result, ServerConfig};
use tracing_subscriber::EnvFilter;

const CONFIG_ENV: &str = "RELP_GATEWAY_CONFIG";

#[derive(Debug, PartialEq, Eq)]
struct Args {
    output: PathBuf,
    bind_addr: Option<String>,
}

fn parse_args(args: &[String]) -> Option<Args> {
    match args {
        [output] => Some(Args {
            output: PathBuf::from(output),
            bind_addr: None,
        }),
        [output, addr] => Some(Args {
            output: PathBuf::from(output),
            bind_addr: Some(addr.clone()),
        }),
        _ => None,
    }
}

async fn run(args: Args) -> Result<()> {
    let mut config = match std::env::var_os(CONFIG_ENV) {
        Some(path) => ServerConfig::from_json_file(path)?,
        None => ServerConfig::default(),
    };
    if let Some(addr) = args.bind_addr {
        config.bind_addr = addr;
    }

    let sink = Arc::new(JsonLinesSink::open(&args.output)?);
    tracing::info!(output = %args.output.display(), "writing messages");

    RelpServer::bind(config, sink).await?.run().await
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let argv: Vec<String> = std::env::args().collect();
    let program = argv.first().map(String::as_str).unwrap_or("relp-gateway");
    let Some(args) = parse_args(argv.get(1..).unwrap_or_default()) else {
        eprintln!("Syntax: {} <output.jsonl> [<address:port>]", program);
        return ExitCode::from(1);
    };

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "gateway stopped");
            ExitCode::FAILURE
        }
    }
}
