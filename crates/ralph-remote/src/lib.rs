//! ralph-remote: the remote control plane.
//!
//! A WebSocket server ([`server::RemoteServer`]) with a two-tier token
//! scheme ([`auth::AuthStore`]): a long-lived server token persisted to
//! disk and short-lived in-memory connection tokens issued per client.
//! Every auth attempt and authenticated request lands in the append-only
//! [`audit::AuditLog`] before its response is sent.
//!
//! The server dispatches into whatever implements
//! [`server::ControlBackend`]; the engine wiring lives in the CLI, keeping
//! this crate transport-only.

pub mod audit;
pub mod auth;
pub mod client;
pub mod protocol;
pub mod remotes;
pub mod server;

pub use audit::{AuditEntry, AuditLog};
pub use auth::{AuthStore, ConnectionToken, ServerToken};
pub use client::RemoteClient;
pub use remotes::{RemoteEntry, RemotesFile};
pub use server::{ControlBackend, RemoteServer, RemoteServerConfig, RemoteServerState};
