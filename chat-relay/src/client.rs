use std::fmt;

use anyhow::{Context, Result};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader, Lines, Stdin},
    net::{
        TcpStream, ToSocketAddrs,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
};
use tracing::{info, warn};

use crate::cli::ClientArgs;

/// A connected, handshaken chat participant.
pub struct ChatClient {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl ChatClient {
    /// Connects and sends `name` as the handshake line.
    pub async fn connect<A>(addr: A, name: &str) -> Result<Self>
    where
        A: ToSocketAddrs + fmt::Display,
    {
        let name = name.trim();
        if name.is_empty() {
            anyhow::bail!("a nickname is required to connect");
        }

        let stream = TcpStream::connect(&addr)
            .await
            .with_context(|| format!("failed to connect to {addr}"))?;
        info!("connected to {}", addr);

        let (reader, writer) = stream.into_split();
        let mut client = Self {
            lines: BufReader::new(reader).lines(),
            writer,
        };
        client
            .send_line(name)
            .await
            .context("failed to send nickname")?;
        Ok(client)
    }

    pub async fn send_line(&mut self, text: &str) -> io::Result<()> {
        self.writer.write_all(text.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await
    }

    /// Next relayed line, or `None` once the server closes the connection.
    /// Cancel safe.
    pub async fn next_line(&mut self) -> io::Result<Option<String>> {
        self.lines.next_line().await
    }

    /// Half-closes the connection; the server sees end of stream.
    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.writer.shutdown().await
    }
}

/// Interactive client: stdin lines go to the relay, relayed lines go to stdout.
pub async fn run(args: ClientArgs) -> Result<()> {
    let mut client = ChatClient::connect(args.server, &args.name).await?;
    write_stdout("Connected to server.").await?;

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    run_client_loop(&mut client, &mut stdin).await?;
    if let Err(error) = client.shutdown().await {
        warn!(?error, "failed to shutdown client writer cleanly");
    }

    Ok(())
}

async fn run_client_loop(
    client: &mut ChatClient,
    stdin: &mut Lines<BufReader<Stdin>>,
) -> Result<()> {
    loop {
        select! {
            relayed = client.next_line() => {
                if !handle_relayed_line(relayed).await? {
                    break;
                }
            }
            typed = stdin.next_line() => {
                if !handle_stdin_input(typed?, client).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                if let Err(error) = ctrl_c {
                    warn!(?error, "ctrl-c handler failed");
                }
                break;
            }
        }
    }
    Ok(())
}

async fn handle_relayed_line(relayed: io::Result<Option<String>>) -> Result<bool> {
    match relayed {
        Ok(Some(line)) => {
            write_stdout(&line).await?;
            Ok(true)
        }
        Ok(None) => {
            write_stdout("Disconnected from server.").await?;
            Ok(false)
        }
        Err(err) => {
            write_stdout(&format!("Connection to server lost: {err}")).await?;
            Ok(false)
        }
    }
}

async fn handle_stdin_input(typed: Option<String>, client: &mut ChatClient) -> Result<bool> {
    let Some(typed) = typed else {
        return Ok(false);
    };

    let text = typed.trim_end_matches('\r');
    if text.is_empty() {
        return Ok(true);
    }

    if text.trim().eq_ignore_ascii_case("/quit") {
        write_stdout("Leaving chat.").await?;
        return Ok(false);
    }

    client.send_line(text).await?;
    Ok(true)
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}
