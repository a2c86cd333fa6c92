use std::{collections::HashSet, net::SocketAddr, time::Duration};

use anyhow::{Result, anyhow};
use chat_relay::{ChatClient, DisplayEvent, DisplaySink, Server, ServerConfig, ServerHandle};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::{Instant, sleep, timeout, timeout_at},
};

const WAIT: Duration = Duration::from_secs(3);

struct TestRelay {
    addr: SocketAddr,
    handle: ServerHandle,
    events: mpsc::Receiver<DisplayEvent>,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl TestRelay {
    async fn start() -> Result<Self> {
        Self::start_with(|_| {}).await
    }

    async fn start_with(configure: impl FnOnce(&mut ServerConfig)) -> Result<Self> {
        let mut config = ServerConfig {
            listen: "127.0.0.1:0".parse()?,
            handshake_timeout: Duration::from_millis(500),
            write_timeout: Duration::from_secs(1),
            ..ServerConfig::default()
        };
        configure(&mut config);
        let (display, events) = DisplaySink::channel(1024);
        let server = Server::bind(config, display).await?;
        let addr = server.local_addr()?;
        let handle = server.handle();

        let (shutdown, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            server
                .run_until(async move {
                    let _ = shutdown_rx.await;
                })
                .await;
        });

        Ok(Self {
            addr,
            handle,
            events,
            shutdown,
            task,
        })
    }

    /// Connects and waits for the client's own join announcement.
    async fn join(&self, name: &str) -> Result<ChatClient> {
        let mut client = ChatClient::connect(self.addr, name).await?;
        let own_join = format!("[{name}] Entered the chat.");
        loop {
            if expect_line(&mut client).await? == own_join {
                return Ok(client);
            }
        }
    }

    async fn wait_for_sessions(&self, expected: usize) -> Result<()> {
        let deadline = Instant::now() + WAIT;
        while self.handle.session_count() != expected {
            if Instant::now() >= deadline {
                return Err(anyhow!(
                    "expected {expected} sessions, registry holds {}",
                    self.handle.session_count()
                ));
            }
            sleep(Duration::from_millis(10)).await;
        }
        Ok(())
    }

    async fn wait_for_display(&mut self, needle: &str) -> Result<String> {
        let deadline = Instant::now() + WAIT;
        loop {
            let event = timeout_at(deadline, self.events.recv())
                .await
                .map_err(|_| anyhow!("no display line containing '{needle}'"))?
                .ok_or_else(|| anyhow!("display closed"))?;
            if event.text.contains(needle) {
                return Ok(event.text);
            }
        }
    }

    async fn stop(self) -> Result<mpsc::Receiver<DisplayEvent>> {
        let _ = self.shutdown.send(());
        timeout(WAIT, self.task).await??;
        Ok(self.events)
    }
}

async fn expect_line(client: &mut ChatClient) -> Result<String> {
    match timeout(WAIT, client.next_line()).await {
        Ok(Ok(Some(line))) => Ok(line),
        Ok(Ok(None)) => Err(anyhow!("connection closed while waiting for a line")),
        Ok(Err(err)) => Err(err.into()),
        Err(_) => Err(anyhow!("timed out waiting for a line")),
    }
}

async fn expect_closed(client: &mut ChatClient) -> Result<()> {
    match timeout(WAIT, client.next_line()).await {
        Ok(Ok(None)) => Ok(()),
        Ok(Ok(Some(line))) => Err(anyhow!("expected end of stream, got '{line}'")),
        Ok(Err(err)) => Err(err.into()),
        Err(_) => Err(anyhow!("timed out waiting for end of stream")),
    }
}

async fn expect_server_hangup(stream: &mut TcpStream) -> Result<()> {
    let mut buf = [0u8; 64];
    let read = timeout(WAIT, stream.read(&mut buf)).await??;
    if read != 0 {
        return Err(anyhow!("expected hangup, got {read} bytes"));
    }
    Ok(())
}

#[tokio::test]
async fn join_chat_and_leave() -> Result<()> {
    let relay = TestRelay::start().await?;

    let mut alice = relay.join("alice").await?;
    let mut bob = relay.join("bob").await?;
    assert_eq!(expect_line(&mut alice).await?, "[bob] Entered the chat.");

    alice.send_line("hi").await?;
    assert_eq!(expect_line(&mut bob).await?, "[alice] hi");
    assert_eq!(expect_line(&mut alice).await?, "[alice] hi");

    alice.shutdown().await?;
    assert_eq!(expect_line(&mut bob).await?, "[alice] Left the chat.");
    expect_closed(&mut alice).await?;
    relay.wait_for_sessions(1).await?;

    relay.stop().await?;
    Ok(())
}

#[tokio::test]
async fn emoticons_are_substituted_once() -> Result<()> {
    let relay = TestRelay::start().await?;
    let mut alice = relay.join("alice").await?;
    let mut bob = relay.join("bob").await?;
    assert_eq!(expect_line(&mut alice).await?, "[bob] Entered the chat.");

    alice.send_line("hello:)").await?;
    assert_eq!(expect_line(&mut bob).await?, "[alice] hello😊");

    alice.send_line(":( <3").await?;
    assert_eq!(expect_line(&mut bob).await?, "[alice] ☹ ❤");

    relay.stop().await?;
    Ok(())
}

#[tokio::test]
async fn blank_name_is_rejected_without_touching_the_registry() -> Result<()> {
    let mut relay = TestRelay::start().await?;
    let _alice = relay.join("alice").await?;
    relay.wait_for_sessions(1).await?;
    let before = relay.handle.session_count();

    let mut stream = TcpStream::connect(relay.addr).await?;
    stream.write_all(b"   \t \n").await?;
    expect_server_hangup(&mut stream).await?;

    let report = relay.wait_for_display("failed").await?;
    assert!(report.contains("name must not be empty"), "{report}");
    assert_eq!(relay.handle.session_count(), before);

    relay.stop().await?;
    Ok(())
}

#[tokio::test]
async fn hangup_before_handshake_is_contained() -> Result<()> {
    let mut relay = TestRelay::start().await?;
    let mut alice = relay.join("alice").await?;

    drop(TcpStream::connect(relay.addr).await?);
    relay.wait_for_display("Handshake with").await?;

    let mut silent = TcpStream::connect(relay.addr).await?;
    expect_server_hangup(&mut silent).await?;

    assert_eq!(relay.handle.session_count(), 1);
    alice.send_line("still here").await?;
    assert_eq!(expect_line(&mut alice).await?, "[alice] still here");

    relay.stop().await?;
    Ok(())
}

#[tokio::test]
async fn lines_from_one_client_arrive_in_order() -> Result<()> {
    let relay = TestRelay::start().await?;
    let mut alice = relay.join("alice").await?;
    let mut bob = relay.join("bob").await?;
    assert_eq!(expect_line(&mut alice).await?, "[bob] Entered the chat.");

    for n in 0..100 {
        alice.send_line(&format!("m{n}")).await?;
    }
    for n in 0..100 {
        assert_eq!(expect_line(&mut bob).await?, format!("[alice] m{n}"));
    }

    relay.stop().await?;
    Ok(())
}

#[tokio::test]
async fn concurrent_joins_and_departures_keep_registry_consistent() -> Result<()> {
    let relay = TestRelay::start().await?;

    let mut joins = Vec::new();
    for n in 0..16 {
        let addr = relay.addr;
        joins.push(tokio::spawn(async move {
            let name = format!("user{n}");
            let mut client = ChatClient::connect(addr, &name).await?;
            let own_join = format!("[{name}] Entered the chat.");
            while expect_line(&mut client).await? != own_join {}
            anyhow::Ok(client)
        }));
    }

    let mut clients = Vec::new();
    for join in joins {
        clients.push(join.await??);
    }
    relay.wait_for_sessions(16).await?;

    let ids: HashSet<_> = relay
        .handle
        .registry()
        .snapshot()
        .iter()
        .map(|session| session.id())
        .collect();
    assert_eq!(ids.len(), 16);
    assert!(
        relay
            .handle
            .registry()
            .snapshot()
            .iter()
            .all(|session| session.is_active())
    );

    for client in clients.iter_mut() {
        client.shutdown().await?;
    }
    relay.wait_for_sessions(0).await?;

    relay.stop().await?;
    Ok(())
}

#[tokio::test]
async fn duplicate_display_names_are_allowed() -> Result<()> {
    let relay = TestRelay::start().await?;
    let mut first = relay.join("sam").await?;
    let _second = relay.join("sam").await?;

    assert_eq!(expect_line(&mut first).await?, "[sam] Entered the chat.");
    relay.wait_for_sessions(2).await?;

    relay.stop().await?;
    Ok(())
}

#[tokio::test]
async fn operator_announcement_reaches_everyone() -> Result<()> {
    let relay = TestRelay::start().await?;
    let mut alice = relay.join("alice").await?;
    let mut bob = relay.join("bob").await?;
    assert_eq!(expect_line(&mut alice).await?, "[bob] Entered the chat.");

    let report = relay.handle.announce("maintenance at noon <3").await;
    assert_eq!(report.delivered, 2);
    assert!(report.failed.is_empty());

    assert_eq!(expect_line(&mut alice).await?, "[Server]: maintenance at noon ❤");
    assert_eq!(expect_line(&mut bob).await?, "[Server]: maintenance at noon ❤");

    relay.stop().await?;
    Ok(())
}

#[tokio::test]
async fn shutdown_closes_every_session_once() -> Result<()> {
    let relay = TestRelay::start().await?;
    let mut alice = relay.join("alice").await?;
    let mut bob = relay.join("bob").await?;
    assert_eq!(expect_line(&mut alice).await?, "[bob] Entered the chat.");
    let handle = relay.handle.clone();

    let mut events = relay.stop().await?;

    for client in [&mut alice, &mut bob] {
        assert_eq!(expect_line(client).await?, "[Server]: Server shutting down.");
        expect_closed(client).await?;
    }
    assert_eq!(handle.session_count(), 0);

    let mut texts = Vec::new();
    while let Ok(event) = events.try_recv() {
        texts.push(event.text);
    }
    assert!(texts.iter().any(|text| text == "Server stopped; closed 2 session(s)"));
    Ok(())
}

#[tokio::test]
async fn undecodable_bytes_are_relayed_lossily() -> Result<()> {
    let relay = TestRelay::start().await?;
    let mut alice = relay.join("alice").await?;

    let mut eve = TcpStream::connect(relay.addr).await?;
    eve.write_all(b"eve\n").await?;
    assert_eq!(expect_line(&mut alice).await?, "[eve] Entered the chat.");

    eve.write_all(b"caf\xe9\n").await?;
    assert_eq!(expect_line(&mut alice).await?, "[eve] caf\u{FFFD}");
    relay.wait_for_sessions(2).await?;

    relay.stop().await?;
    Ok(())
}

#[tokio::test]
async fn whitespace_only_lines_are_relayed() -> Result<()> {
    let relay = TestRelay::start().await?;
    let mut alice = relay.join("alice").await?;

    alice.send_line("   ").await?;
    alice.send_line("x").await?;
    assert_eq!(expect_line(&mut alice).await?, "[alice]    ");
    assert_eq!(expect_line(&mut alice).await?, "[alice] x");

    relay.stop().await?;
    Ok(())
}

#[tokio::test]
async fn oversize_line_ends_only_that_session() -> Result<()> {
    let mut relay = TestRelay::start_with(|config| config.max_line_len = 16).await?;
    let mut alice = relay.join("alice").await?;
    let mut bob = relay.join("bob").await?;
    assert_eq!(expect_line(&mut alice).await?, "[bob] Entered the chat.");

    bob.send_line(&"x".repeat(100)).await?;
    assert_eq!(expect_line(&mut alice).await?, "[bob] Left the chat.");
    let report = relay.wait_for_display("Error with client [bob]").await?;
    assert!(report.contains("exceeds 16 bytes"), "{report}");
    relay.wait_for_sessions(1).await?;

    alice.send_line("still here").await?;
    assert_eq!(expect_line(&mut alice).await?, "[alice] still here");

    relay.stop().await?;
    Ok(())
}

#[tokio::test]
async fn stalled_reader_is_evicted_without_holding_up_others() -> Result<()> {
    let mut relay =
        TestRelay::start_with(|config| config.write_timeout = Duration::from_millis(200)).await?;
    let mut alice = relay.join("alice").await?;

    // Handshakes, then never reads; its socket buffers fill up eventually.
    let mut mallory = TcpStream::connect(relay.addr).await?;
    mallory.write_all(b"mallory\n").await?;
    assert_eq!(expect_line(&mut alice).await?, "[mallory] Entered the chat.");
    relay.wait_for_sessions(2).await?;

    let payload = "y".repeat(60_000);
    let expected = format!("[alice] {payload}");
    let started = Instant::now();
    let mut sent = 0;
    while relay.handle.session_count() == 2 && sent < 400 {
        alice.send_line(&payload).await?;
        assert_eq!(expect_line(&mut alice).await?, expected);
        sent += 1;
    }
    relay.wait_for_sessions(1).await?;
    assert!(
        started.elapsed() < Duration::from_secs(20),
        "fan-out stalled behind the blocked peer"
    );

    relay
        .wait_for_display("Failed to deliver to [mallory]")
        .await?;
    relay.wait_for_display("[mallory] has left the chat").await?;

    alice.send_line("after").await?;
    let mut departures = 0;
    loop {
        let line = expect_line(&mut alice).await?;
        if line == "[alice] after" {
            break;
        }
        if line == "[mallory] Left the chat." {
            departures += 1;
        }
    }
    assert_eq!(departures, 1);

    drop(mallory);
    relay.stop().await?;
    Ok(())
}

#[tokio::test]
async fn display_closes_once_server_and_handles_are_gone() -> Result<()> {
    let relay = TestRelay::start().await?;
    let mut alice = relay.join("alice").await?;

    let mut events = relay.stop().await?;
    assert_eq!(expect_line(&mut alice).await?, "[Server]: Server shutting down.");
    expect_closed(&mut alice).await?;

    let deadline = Instant::now() + WAIT;
    loop {
        match timeout_at(deadline, events.recv()).await {
            Ok(Some(_)) => continue,
            Ok(None) => break,
            Err(_) => return Err(anyhow!("display still open after the server stopped")),
        }
    }
    Ok(())
}
