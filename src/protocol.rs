//! JSON message types exchanged over the broker socket.
//!
//! # Outer envelope
//!
//! ```json
//! { "action": "get-credentials", "clientID": "...", "message": "<b64>", "nonce": "<b64>" }
//! ```
//!
//! The handshake (`change-public-keys`) carries `publicKey` and `nonce` in
//! the clear. Every other request carries its real body encrypted in
//! `message`; the decrypted body is itself a JSON object whose `action` must
//! match the envelope's.
//!
//! Responses mirror `action` and carry either `message` + `nonce` or an
//! `error` / `errorCode` pair. Broadcast notifications are bare envelopes
//! holding only `action`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::BridgeError;
use crate::store::{Credential, EntryFields, PasswordPolicy};

/// Action tags understood by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    /// Public-key handshake.
    ChangePublicKeys,
    /// Bind a client identity to the connection.
    Associate,
    /// Check that the connection is bound to a given identity.
    TestAssociate,
    /// Look up credentials for a URL.
    GetCredentials,
    /// Create a store entry.
    CreateEntry,
    /// Ask the store for a fresh password.
    GeneratePassword,
    /// Query the store's lock state.
    GetLockState,
    /// Lock the store.
    LockStore,
    /// Notification: store was locked.
    StoreLocked,
    /// Notification: store was unlocked.
    StoreUnlocked,
}

impl Action {
    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ChangePublicKeys => "change-public-keys",
            Self::Associate => "associate",
            Self::TestAssociate => "test-associate",
            Self::GetCredentials => "get-credentials",
            Self::CreateEntry => "create-entry",
            Self::GeneratePassword => "generate-password",
            Self::GetLockState => "get-lock-state",
            Self::LockStore => "lock-store",
            Self::StoreLocked => "store-locked",
            Self::StoreUnlocked => "store-unlocked",
        }
    }

    /// Whether the action is answered by the credential store once associated.
    pub fn is_store_query(self) -> bool {
        matches!(
            self,
            Self::TestAssociate
                | Self::GetCredentials
                | Self::CreateEntry
                | Self::GeneratePassword
                | Self::GetLockState
                | Self::LockStore
        )
    }
}

impl FromStr for Action {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "change-public-keys" => Self::ChangePublicKeys,
            "associate" => Self::Associate,
            "test-associate" => Self::TestAssociate,
            "get-credentials" => Self::GetCredentials,
            "create-entry" => Self::CreateEntry,
            "generate-password" => Self::GeneratePassword,
            "get-lock-state" => Self::GetLockState,
            "lock-store" => Self::LockStore,
            "store-locked" => Self::StoreLocked,
            "store-unlocked" => Self::StoreUnlocked,
            _ => return Err(BridgeError::IncorrectAction),
        })
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request envelope as received from a peer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    /// Action tag, kept verbatim so responses can mirror unknown actions.
    pub action: String,
    /// Extension-chosen client identifier, echoed back.
    #[serde(rename = "clientID", default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Base64 ciphertext (encrypted actions only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Base64 nonce.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    /// Base64 client public key (handshake only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
}

/// Response envelope sent to a peer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    /// Mirrors the request's action.
    pub action: String,
    /// Echo of the request's client identifier.
    #[serde(rename = "clientID", default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Base64 ciphertext.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Base64 nonce the message was sealed with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    /// Broker public key (handshake only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    /// Protocol version (handshake only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// `"true"` on a successful handshake.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<String>,
    /// Human-readable error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Numeric error code, as a string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

impl Response {
    /// Error response for `action`.
    pub fn error(action: &str, client_id: Option<String>, err: &BridgeError) -> Self {
        Self {
            action: action.to_string(),
            client_id,
            error: Some(err.to_string()),
            error_code: Some(err.code().to_string()),
            ..Self::default()
        }
    }

    /// Whether this response reports an error.
    pub fn is_error(&self) -> bool {
        self.error_code.is_some()
    }

    /// Compact JSON bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("Response serialization cannot fail")
    }
}

/// Unsolicited messages broadcast to every live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notification {
    /// The store was locked.
    StoreLocked,
    /// The store was unlocked.
    StoreUnlocked,
}

impl Notification {
    /// Notification for a lock-state change.
    pub fn for_lock_state(locked: bool) -> Self {
        if locked {
            Self::StoreLocked
        } else {
            Self::StoreUnlocked
        }
    }

    /// Action tag of the notification.
    pub fn action(self) -> Action {
        match self {
            Self::StoreLocked => Action::StoreLocked,
            Self::StoreUnlocked => Action::StoreUnlocked,
        }
    }

    /// Encoded notification.
    pub fn to_bytes(self) -> Vec<u8> {
        Response {
            action: self.action().as_str().to_string(),
            ..Response::default()
        }
        .to_bytes()
    }
}

// ─── Decrypted payloads ────────────────────────────────────────────────────

/// Common header of every decrypted payload.
#[derive(Debug, Clone, Deserialize)]
pub struct PayloadHeader {
    /// Must equal the envelope action.
    pub action: String,
}

/// `associate` body.
#[derive(Debug, Clone, Deserialize)]
pub struct AssociatePayload {
    /// Client identity name to bind, e.g. `"Test Browser"`.
    pub id: String,
    /// Optional long-term identity key the extension wants remembered.
    #[serde(default)]
    pub key: Option<String>,
}

/// `test-associate` body.
#[derive(Debug, Clone, Deserialize)]
pub struct TestAssociatePayload {
    /// Identity the extension believes it is bound to.
    pub id: String,
}

/// `get-credentials` body.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetCredentialsPayload {
    /// Page URL to match.
    #[serde(default)]
    pub url: String,
    /// Form submit URL, when different from `url`.
    #[serde(default)]
    pub submit_url: Option<String>,
}

/// `create-entry` body.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateEntryPayload {
    /// Entry fields.
    #[serde(flatten)]
    pub fields: EntryFields,
}

/// `generate-password` body.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GeneratePasswordPayload {
    /// Requested policy; store defaults when absent.
    #[serde(flatten)]
    pub policy: PasswordPolicy,
}

/// Decrypted reply bodies.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ReplyBody {
    /// `associate` / `test-associate`.
    Association {
        /// Mirrored action.
        action: String,
        /// Bound identity.
        id: String,
        /// Protocol version.
        version: String,
        /// Always `"true"`.
        success: String,
    },
    /// `get-credentials`.
    Credentials {
        /// Mirrored action.
        action: String,
        /// Number of entries.
        count: usize,
        /// Matching entries.
        entries: Vec<Credential>,
        /// Always `"true"`.
        success: String,
    },
    /// `generate-password`.
    Password {
        /// Mirrored action.
        action: String,
        /// Generated password.
        password: String,
        /// Always `"true"`.
        success: String,
    },
    /// `get-lock-state`.
    LockState {
        /// Mirrored action.
        action: String,
        /// Current state.
        locked: bool,
        /// Always `"true"`.
        success: String,
    },
    /// Plain acknowledgement (`create-entry`, `lock-store`).
    Ack {
        /// Mirrored action.
        action: String,
        /// Always `"true"`.
        success: String,
    },
}

impl ReplyBody {
    /// Compact JSON bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("ReplyBody serialization cannot fail")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_names_round_trip() {
        for action in [
            Action::ChangePublicKeys,
            Action::Associate,
            Action::TestAssociate,
            Action::GetCredentials,
            Action::CreateEntry,
            Action::GeneratePassword,
            Action::GetLockState,
            Action::LockStore,
            Action::StoreLocked,
            Action::StoreUnlocked,
        ] {
            assert_eq!(action.as_str().parse::<Action>().unwrap(), action);
        }
        assert!("get-logins".parse::<Action>().is_err());
    }

    #[test]
    fn test_request_uses_wire_field_names() {
        let req: Request = serde_json::from_str(
            r#"{"action":"change-public-keys","publicKey":"AAA=","nonce":"BBB=","clientID":"ext-1"}"#,
        )
        .unwrap();
        assert_eq!(req.action, "change-public-keys");
        assert_eq!(req.public_key.as_deref(), Some("AAA="));
        assert_eq!(req.nonce.as_deref(), Some("BBB="));
        assert_eq!(req.client_id.as_deref(), Some("ext-1"));
        assert!(req.message.is_none());
    }

    #[test]
    fn test_error_response_shape() {
        let resp = Response::error("get-credentials", Some("c".into()), &BridgeError::ReplayRejected);
        let value: serde_json::Value = serde_json::from_slice(&resp.to_bytes()).unwrap();
        assert_eq!(value["action"], "get-credentials");
        assert_eq!(value["clientID"], "c");
        assert_eq!(value["errorCode"], "10");
        assert!(value.get("message").is_none());
        assert!(resp.is_error());
    }

    #[test]
    fn test_notification_is_bare_action() {
        let bytes = Notification::for_lock_state(true).to_bytes();
        assert_eq!(bytes, br#"{"action":"store-locked"}"#);
        let bytes = Notification::for_lock_state(false).to_bytes();
        assert_eq!(bytes, br#"{"action":"store-unlocked"}"#);
    }

    #[test]
    fn test_create_entry_payload_flattens_fields() {
        let payload: CreateEntryPayload = serde_json::from_str(
            r#"{"action":"create-entry","url":"https://example.com","login":"alice","password":"pw"}"#,
        )
        .unwrap();
        assert_eq!(payload.fields.url, "https://example.com");
        assert_eq!(payload.fields.login, "alice");
        assert_eq!(payload.fields.password, "pw");
    }
}
