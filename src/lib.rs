//! Browser Bridge - connects browser extensions to a local credential store.
//!
//! A browser launches one Relay process per extension and talks to it over
//! native messaging. Each Relay forwards to a single Unix socket served by the
//! [`SessionBroker`] embedded in the credential-store application.
//!
//! # Architecture
//!
//! - **Relay** - stateless stdio to socket forwarder ([`relay`])
//! - **SessionBroker** - socket server, per-connection sessions, broadcasts ([`broker`])
//! - **Session crypto** - X25519 handshake and sealed payloads ([`crypto`])
//!
//! # Modules
//!
//! - [`broker`] - listener, connection registry and session state machine
//! - [`client`] - extension-side counterpart of a broker session
//! - [`config`] - configuration loading
//! - [`framing`] - native-messaging frame codec
//! - [`protocol`] - JSON message types
//! - [`store`] - credential store and approval interfaces

// Library modules
pub mod broker;
pub mod client;
pub mod config;
pub mod constants;
pub mod crypto;
pub mod error;
pub mod framing;
pub mod protocol;
pub mod relay;
pub mod store;

// Re-export commonly used types
pub use broker::{ConnectionId, ConnectionState, SessionBroker};
pub use client::ClientSession;
pub use config::BridgeConfig;
pub use error::{BridgeError, Result};
pub use protocol::{Action, Notification, Request, Response};
pub use relay::RelayExit;
pub use store::{Approval, AssociationApprover, AssociationRequest, CredentialStore};
