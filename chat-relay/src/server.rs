use std::{
    future::Future,
    io,
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use futures_util::future::join_all;
use tracing::{info, warn};

use crate::{
    broadcast::{BroadcastReport, Broadcaster, Origin},
    display::DisplaySink,
    error::ServerError,
    format::{chat_line, format_message, left_line, server_line},
    listener::Listener,
    registry::Registry,
    session::{DEFAULT_MAX_LINE_LEN, Session},
};

pub const DEFAULT_PORT: u16 = 1234;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub handshake_timeout: Duration,
    pub write_timeout: Duration,
    /// Longest line accepted from a client; a longer one ends its session.
    pub max_line_len: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            handshake_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(5),
            max_line_len: DEFAULT_MAX_LINE_LEN,
        }
    }
}

/// State shared by the accept loop and every session task.
pub(crate) struct Relay {
    pub(crate) config: ServerConfig,
    pub(crate) registry: Arc<Registry>,
    pub(crate) broadcaster: Broadcaster,
    pub(crate) display: DisplaySink,
}

impl Relay {
    pub(crate) fn new(config: ServerConfig, display: DisplaySink) -> Self {
        let registry = Arc::new(Registry::new());
        let broadcaster = Broadcaster::new(Arc::clone(&registry), display.clone());
        Self {
            config,
            registry,
            broadcaster,
            display,
        }
    }

    /// Read loop for an admitted session. Returns once the session is gone
    /// for good: removed, departure announced, transport closed.
    pub(crate) async fn run_session(&self, session: Arc<Session>) {
        let id = session.id();
        let name = session.label().to_string();

        loop {
            match session.read_line().await {
                Ok(text) => self.relay_chat(&session, &name, &text).await,
                Err(err) => {
                    if !err.is_orderly() {
                        warn!(session = id, %name, error = ?err, "client read failed");
                        self.display
                            .post_error(format!("Error with client [{name}]: {err}"));
                    }
                    break;
                }
            }
        }

        self.registry.remove(id);
        self.broadcaster
            .broadcast(Origin::Session(id), left_line(&name))
            .await;
        self.display.post_line(format!("[{name}] has left the chat"));
        session.close().await;
        info!(session = id, %name, "client left");
    }

    async fn relay_chat(&self, session: &Session, name: &str, text: &str) {
        let text = format_message(text);
        self.broadcaster
            .broadcast(Origin::Session(session.id()), chat_line(name, &text))
            .await;
        self.display.post_line(format!("[{name}]: {text}"));
    }

    async fn announce(&self, text: &str) -> BroadcastReport {
        let line = server_line(&format_message(text));
        self.display.post_line(line.clone());
        self.broadcaster.broadcast(Origin::Server, line).await
    }

    async fn shutdown(&self) {
        info!("relay shutting down");
        self.announce("Server shutting down.").await;

        let sessions = self.registry.drain();
        join_all(sessions.iter().map(|session| session.close())).await;
        self.display
            .post_line(format!("Server stopped; closed {} session(s)", sessions.len()));
    }
}

pub struct Server {
    listener: Listener,
    relay: Arc<Relay>,
}

impl Server {
    /// Binds the listening socket. A bind failure is reported once on the
    /// display and returned; nothing else about the server is fatal.
    pub async fn bind(config: ServerConfig, display: DisplaySink) -> Result<Self, ServerError> {
        let relay = Arc::new(Relay::new(config, display));
        let listener = Listener::bind(Arc::clone(&relay)).await?;
        Ok(Self { listener, relay })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            relay: Arc::clone(&self.relay),
        }
    }

    /// Accepts clients until `shutdown` resolves, then closes every session.
    pub async fn run_until<F>(self, shutdown: F)
    where
        F: Future<Output = ()> + Send,
    {
        let Server { listener, relay } = self;
        listener.run_until(shutdown).await;
        relay.shutdown().await;
    }

    pub async fn run_until_ctrl_c(self) {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

/// Operator access to a running server.
#[derive(Clone)]
pub struct ServerHandle {
    relay: Arc<Relay>,
}

impl ServerHandle {
    /// Sends `[Server]: <text>` to every session.
    pub async fn announce(&self, text: &str) -> BroadcastReport {
        self.relay.announce(text).await
    }

    pub fn registry(&self) -> &Registry {
        &self.relay.registry
    }

    pub fn session_count(&self) -> usize {
        self.relay.registry.len()
    }
}
