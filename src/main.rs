//! Browser Bridge Relay - the native-messaging host launched by the browser.
//!
//! stdout carries protocol frames only, so logs go to a file or stderr.

use std::path::PathBuf;

use anyhow::Result;
use browser_bridge::{relay, BridgeConfig, BridgeError, RelayExit};
use clap::Parser;
use mimalloc::MiMalloc;

/// Global allocator configured per M-MIMALLOC-APPS guideline.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

// CLI
#[derive(Parser)]
#[command(name = "browser-bridge-relay")]
#[command(version)]
#[command(about = "Native-messaging relay between a browser extension and the credential store")]
struct Cli {
    /// Broker socket path (overrides config and BROWSER_BRIDGE_SOCKET)
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Arguments the browser appends (manifest path, extension origin); ignored.
    #[arg(hide = true, trailing_var_arg = true, allow_hyphen_values = true)]
    browser_args: Vec<String>,
}

fn init_logging() {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"));
    builder.format_timestamp_secs();
    match std::env::var("BROWSER_BRIDGE_LOG_FILE") {
        Ok(path) => match std::fs::File::create(&path) {
            Ok(file) => {
                builder.target(env_logger::Target::Pipe(Box::new(file)));
            }
            Err(e) => {
                eprintln!("Failed to create log file at {path}: {e}");
                builder.target(env_logger::Target::Stderr);
            }
        },
        Err(_) => {
            builder.target(env_logger::Target::Stderr);
        }
    }
    builder.init();
}

async fn run(cli: Cli) -> Result<RelayExit> {
    let mut config = BridgeConfig::load()?;
    if let Some(socket) = cli.socket {
        config.socket_path = socket;
    }
    log::debug!("[Relay] Ignoring browser arguments: {:?}", cli.browser_args);

    let exit = relay::run_at(
        &config.socket_path,
        tokio::io::stdin(),
        tokio::io::stdout(),
        config.max_message_length,
    )
    .await?;
    Ok(exit)
}

#[tokio::main]
async fn main() {
    init_logging();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(_) => std::process::exit(0),
        Err(e) => {
            match e.downcast_ref::<BridgeError>() {
                Some(BridgeError::FrameTooLarge { .. }) => {
                    log::error!("Browser sent an oversized message: {e}");
                }
                _ => log::error!("Relay failed: {e:#}"),
            }
            std::process::exit(1);
        }
    }
}
