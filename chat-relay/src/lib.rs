//! Line-oriented TCP chat relay.
//!
//! Clients connect, send one line with their display name, and from then on
//! every line they send is rebroadcast to every connected client as
//! `[name] text`. Joins and departures are announced the same way.
//!
//! - [`session`] wraps one connection: handshake, line reads, serialized
//!   writes, idempotent close.
//! - [`registry`] is the single synchronized set of admitted sessions.
//! - [`broadcast`] fans a line out to one registry snapshot and evicts
//!   recipients whose writes fail.
//! - `listener` accepts connections and admits them after the handshake.
//! - [`server`] ties it together: per-session read loops, operator
//!   announcements, graceful shutdown.
//! - [`display`] is the operator output queue; [`format`] renders wire lines.
//! - [`client`] and [`cli`] back the `chat-relay` binary.

pub mod broadcast;
pub mod cli;
pub mod client;
pub mod display;
pub mod error;
pub mod format;
mod listener;
pub mod registry;
pub mod server;
pub mod session;

pub use broadcast::{BroadcastReport, Broadcaster, Origin, OutboundMessage};
pub use client::ChatClient;
pub use display::{DisplayEvent, DisplayLevel, DisplaySink};
pub use error::{RegistryError, ServerError, SessionError};
pub use registry::Registry;
pub use server::{Server, ServerConfig, ServerHandle};
pub use session::{Session, SessionId, SessionState};
