use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    time::timeout,
};
use tracing::warn;

use chat_relay::{
    cli::{Cli, Command, ServerArgs},
    client,
    display::{self, DisplaySink},
    server::{Server, ServerConfig, ServerHandle},
};

/// How long the display gets to flush after the server stops.
const CONSOLE_DRAIN: Duration = Duration::from_secs(1);
/// Stdin is read on a blocking thread that cannot be cancelled; don't wait on it forever.
const RUNTIME_GRACE: Duration = Duration::from_millis(500);

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let runtime = tokio::runtime::Runtime::new()?;
    let result = runtime.block_on(async {
        match cli.command {
            Command::Server(args) => run_server(args).await,
            Command::Client(args) => client::run(args).await,
        }
    });
    runtime.shutdown_timeout(RUNTIME_GRACE);

    result
}

async fn run_server(args: ServerArgs) -> Result<()> {
    let (display, events) = DisplaySink::channel(args.display_capacity);
    let console = tokio::spawn(display::run_console(events));

    let result = match Server::bind(ServerConfig::from(&args), display.clone()).await {
        Ok(server) => {
            let operator = tokio::spawn(relay_operator_input(server.handle()));
            server.run_until_ctrl_c().await;
            // The stdin task holds the last server handle, and with it a display sink.
            operator.abort();
            let _ = operator.await;
            Ok(())
        }
        Err(err) => Err(err.into()),
    };

    drop(display);
    match timeout(CONSOLE_DRAIN, console).await {
        Ok(Ok(Err(err))) => warn!(error = ?err, "display output failed"),
        Ok(Err(err)) => warn!(error = ?err, "display task panicked"),
        Err(_) => warn!("display still busy at exit"),
        Ok(Ok(Ok(()))) => {}
    }

    result
}

/// Operator lines typed on stdin are announced to every client.
async fn relay_operator_input(handle: ServerHandle) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let text = line.trim();
                if !text.is_empty() {
                    handle.announce(text).await;
                }
            }
            Ok(None) => break,
            Err(err) => {
                warn!(error = ?err, "failed to read operator input");
                break;
            }
        }
    }
}
