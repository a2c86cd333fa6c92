use std::{net::SocketAddr, time::Duration};

use clap::{Args, Parser, Subcommand};

use crate::server::ServerConfig;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay, accepting TCP clients and rebroadcasting their lines.
    Server(ServerArgs),
    /// Connect to a relay and chat from the terminal.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Socket address to listen on. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "0.0.0.0:1234")]
    pub listen: SocketAddr,

    /// Seconds a new connection has to send its name.
    #[arg(long, default_value_t = 30)]
    pub handshake_timeout_secs: u64,

    /// Upper bound on a single write to one client, in milliseconds.
    #[arg(long, default_value_t = 5000)]
    pub write_timeout_ms: u64,

    /// Longest line a client may send, in bytes. Longer lines disconnect it.
    #[arg(long, default_value_t = 64 * 1024)]
    pub max_line_bytes: usize,

    /// Lines the operator display may queue before dropping output.
    #[arg(long, default_value_t = 1024)]
    pub display_capacity: usize,
}

impl From<&ServerArgs> for ServerConfig {
    fn from(args: &ServerArgs) -> Self {
        Self {
            listen: args.listen,
            handshake_timeout: Duration::from_secs(args.handshake_timeout_secs),
            write_timeout: Duration::from_millis(args.write_timeout_ms),
            max_line_len: args.max_line_bytes,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Nickname sent as the handshake line.
    #[arg(long)]
    pub name: String,

    /// Address of the relay to connect to.
    #[arg(long, default_value = "127.0.0.1:1234")]
    pub server: SocketAddr,
}
