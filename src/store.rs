//! Collaborator interfaces consumed by the broker.
//!
//! The credential store and the association approval UI live in the host
//! application. The broker only sees them through these traits and never
//! assumes a call returns immediately.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::broker::ConnectionId;

/// One credential returned to an associated client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    /// Entry identifier.
    pub uuid: String,
    /// Entry title.
    pub name: String,
    /// Username.
    pub login: String,
    /// Password.
    pub password: String,
}

/// Fields for a new store entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryFields {
    /// Page URL.
    #[serde(default)]
    pub url: String,
    /// Form submit URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submit_url: Option<String>,
    /// Username.
    #[serde(default)]
    pub login: String,
    /// Password.
    #[serde(default)]
    pub password: String,
    /// Entry title; the store picks one from the URL when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Target group.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
}

/// Password generation request. `None` fields use the store's profile.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PasswordPolicy {
    /// Number of characters.
    #[serde(default)]
    pub length: Option<usize>,
    /// Include symbols.
    #[serde(default)]
    pub symbols: Option<bool>,
}

/// Failure reported by the credential store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct StoreError(pub String);

/// The long-lived credential store the broker answers from.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Whether the store is locked.
    async fn is_locked(&self) -> bool;

    /// Credentials matching `url` (and `submit_url` when given).
    async fn find_credentials(
        &self,
        url: &str,
        submit_url: Option<&str>,
    ) -> Result<Vec<Credential>, StoreError>;

    /// Create a new entry.
    async fn create_entry(&self, fields: EntryFields) -> Result<(), StoreError>;

    /// Generate a password.
    async fn generate_password(&self, policy: &PasswordPolicy) -> Result<String, StoreError>;

    /// Lock the store. The resulting lock-state event is the host's to emit.
    async fn lock(&self) -> Result<(), StoreError>;
}

/// A client asking to be associated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssociationRequest {
    /// Connection making the request.
    pub connection_id: ConnectionId,
    /// Proposed identity name.
    pub client_name: String,
    /// Base64 public key the client used for this session's handshake.
    pub public_key: String,
    /// Optional long-term identity key supplied in the `associate` body.
    pub identity_key: Option<String>,
}

/// Decision from the approval UI.
#[derive(Debug)]
pub enum Approval {
    /// Associate now.
    Approved,
    /// Refuse.
    Denied,
    /// Awaiting the user. Resolves to `true` for approval; a dropped sender
    /// counts as a denial.
    Pending(oneshot::Receiver<bool>),
}

/// User-facing approval of new client identities.
#[async_trait]
pub trait AssociationApprover: Send + Sync {
    /// Decide whether `request` may be associated.
    async fn approve(&self, request: AssociationRequest) -> Approval;
}
