//! Accept loop and admission of new connections.

use std::{future::Future, io, net::SocketAddr, sync::Arc, time::Duration};

use tokio::{
    net::{TcpListener, TcpStream},
    select,
    time::sleep,
};
use tracing::{error, info, warn};

use crate::{
    broadcast::Origin,
    error::ServerError,
    format::joined_line,
    server::Relay,
    session::Session,
};

/// Pause after a failed accept so a persistent error (fd exhaustion) does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

pub(crate) struct Listener {
    inner: TcpListener,
    relay: Arc<Relay>,
}

impl Listener {
    pub(crate) async fn bind(relay: Arc<Relay>) -> Result<Self, ServerError> {
        let addr = relay.config.listen;
        match TcpListener::bind(addr).await {
            Ok(inner) => {
                let local = inner.local_addr().unwrap_or(addr);
                info!(%local, "relay listening");
                relay
                    .display
                    .post_line(format!("Waiting for client connections on {local}"));
                Ok(Self { inner, relay })
            }
            Err(source) => {
                error!(%addr, error = ?source, "failed to bind listener");
                relay
                    .display
                    .post_error(format!("Error starting server: {source}"));
                Err(ServerError::Bind { addr, source })
            }
        }
    }

    pub(crate) fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    pub(crate) async fn run_until<F>(self, shutdown: F)
    where
        F: Future<Output = ()> + Send,
    {
        let Listener { inner, relay } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => break,
                accept_result = inner.accept() => {
                    if !handle_accept_result(accept_result, &relay) {
                        sleep(ACCEPT_BACKOFF).await;
                    }
                }
            }
        }
    }
}

fn handle_accept_result(
    result: io::Result<(TcpStream, SocketAddr)>,
    relay: &Arc<Relay>,
) -> bool {
    match result {
        Ok((stream, peer)) => {
            relay.display.post_line(format!("Client connected: {peer}"));
            spawn_connection(stream, peer, relay);
            true
        }
        Err(err) => {
            warn!(error = ?err, "failed to accept connection");
            relay
                .display
                .post_error(format!("Error accepting client connection: {err}"));
            false
        }
    }
}

fn spawn_connection(stream: TcpStream, peer: SocketAddr, relay: &Arc<Relay>) {
    let relay = Arc::clone(relay);
    let session = Session::from_tcp(
        relay.registry.next_session_id(),
        stream,
        relay.config.write_timeout,
    )
    .with_max_line_len(relay.config.max_line_len);
    tokio::spawn(async move {
        if let Some(session) = admit(&relay, session, peer).await {
            relay.run_session(session).await;
        }
    });
}

/// Handshake, registration and join announcement. `None` means the
/// connection was turned away and already closed.
async fn admit(relay: &Relay, session: Session, peer: SocketAddr) -> Option<Arc<Session>> {
    let session = Arc::new(session);

    let name = match session.handshake(relay.config.handshake_timeout).await {
        Ok(name) => name.to_string(),
        Err(err) => {
            warn!(%peer, error = ?err, "handshake failed");
            relay
                .display
                .post_error(format!("Handshake with {peer} failed: {err}"));
            session.close().await;
            return None;
        }
    };

    if let Err(err) = relay.registry.add(Arc::clone(&session)) {
        warn!(%peer, %name, error = ?err, "session rejected");
        relay
            .display
            .post_error(format!("Rejected [{name}] from {peer}: {err}"));
        session.close().await;
        return None;
    }

    info!(%peer, session = session.id(), %name, "client joined");
    relay
        .broadcaster
        .broadcast(Origin::Session(session.id()), joined_line(&name))
        .await;
    relay
        .display
        .post_line(format!("[{name}] has entered the chat"));

    Some(session)
}
