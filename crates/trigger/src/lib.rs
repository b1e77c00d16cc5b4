//! `trigger` crate: a long-lived outbound WebSocket connection that feeds a
//! workflow host.
//!
//! - [`codec`] turns inbound frames into [`DecodedMessage`]s and outbound
//!   values into text frames.
//! - [`sandbox`] runs the operator's open-script in an isolated Lua state
//!   that can only reach an injected capability set.
//! - [`connection`] owns the socket: connect, open, reconnect, shutdown.
//! - [`bridge`] and [`auth`] are the seams to the host system and to the
//!   credential provider.

pub mod auth;
pub mod bridge;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod sandbox;

pub use auth::{AuthContext, AuthProvider, StaticAuthProvider};
pub use bridge::{HostBridge, MemoryStaticData, StaticDataStore};
pub use codec::{decode, encode, DecodedMessage, InboundFrame};
pub use config::TriggerConfig;
pub use connection::{ConnectionManager, ConnectionState};
pub use error::{AuthError, SandboxError, TriggerError};
pub use sandbox::{MessageChannel, ParameterSource, SandboxContext, SandboxExecutor, SandboxLimits};
