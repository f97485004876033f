//! Per-connection handshake and dispatch state machine.
//!
//! ```text
//! AwaitingHandshake ──change-public-keys──► KeyExchanged ──associate──► Associated ──query──► Active
//!         ▲                                      ▲                                          │
//!         └──────────── (any state) ─────────────┴──────── change-public-keys resets ───────┘
//! ```
//!
//! A [`Session`] is owned by its connection's read task and advanced one
//! message at a time, so nonce checks and transitions never interleave.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::watch;

use super::decoder::Decoded;
use super::ConnectionId;
use crate::constants::PROTOCOL_VERSION;
use crate::crypto::{self, Nonce, SessionKeypair, SessionKeys};
use crate::error::{BridgeError, Result};
use crate::protocol::{
    Action, AssociatePayload, CreateEntryPayload, GeneratePasswordPayload, GetCredentialsPayload,
    PayloadHeader, ReplyBody, Request, Response, TestAssociatePayload,
};
use crate::store::{Approval, AssociationApprover, AssociationRequest, CredentialStore};

/// Lifecycle of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConnectionState {
    /// Accepted; only `change-public-keys` is allowed.
    AwaitingHandshake,
    /// Session key established; only `associate` is allowed.
    KeyExchanged,
    /// Client identity approved.
    Associated,
    /// At least one store query has been served.
    Active,
    /// Transport closed.
    Closed,
}

impl ConnectionState {
    /// Whether store queries are allowed.
    pub fn is_associated(self) -> bool {
        matches!(self, Self::Associated | Self::Active)
    }
}

/// What the connection should do after a message.
#[derive(Debug)]
pub(crate) struct Outcome {
    /// Response to queue, if any.
    pub reply: Option<Response>,
    /// Close the connection once the reply is flushed.
    pub close: bool,
}

/// Keys and counters of an established session.
struct Established {
    keys: SessionKeys,
    client_public_key: String,
    last_inbound: Nonce,
    last_outbound: Nonce,
}

impl Established {
    /// Next outbound nonce: above both the request nonce and every nonce
    /// already sent.
    fn next_outbound(&mut self, request_nonce: &Nonce) -> Nonce {
        let mut next = request_nonce.increment();
        if next <= self.last_outbound {
            next = self.last_outbound.increment();
        }
        self.last_outbound = next;
        next
    }
}

/// Handshake and dispatch state for one connection.
pub(crate) struct Session {
    id: ConnectionId,
    state: watch::Sender<ConnectionState>,
    established: Option<Established>,
    client_name: Option<String>,
    store: Arc<dyn CredentialStore>,
    approver: Arc<dyn AssociationApprover>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("client_name", &self.client_name)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub(crate) fn new(
        id: ConnectionId,
        state: watch::Sender<ConnectionState>,
        store: Arc<dyn CredentialStore>,
        approver: Arc<dyn AssociationApprover>,
    ) -> Self {
        state.send_replace(ConnectionState::AwaitingHandshake);
        Self {
            id,
            state,
            established: None,
            client_name: None,
            store,
            approver,
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn set_state(&self, next: ConnectionState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            log::debug!("[Broker] {} {:?} -> {:?}", self.id, prev, next);
        }
    }

    /// Mark the session closed. Terminal.
    pub(crate) fn close(&mut self) {
        self.established = None;
        self.set_state(ConnectionState::Closed);
    }

    /// Handle one decoded message from the peer.
    pub(crate) async fn handle(&mut self, decoded: Decoded) -> Outcome {
        let value = match decoded {
            Decoded::Message(value) => value,
            Decoded::Malformed(reason) => {
                log::warn!("[Broker] {} sent malformed JSON: {reason}", self.id);
                return Outcome {
                    reply: Some(Response::error("", None, &BridgeError::Parse(reason))),
                    close: false,
                };
            }
        };

        let action_hint = value
            .get("action")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let request: Request = match serde_json::from_value(value) {
            Ok(request) => request,
            Err(e) => {
                let err = BridgeError::Parse(e.to_string());
                return Outcome {
                    reply: Some(Response::error(&action_hint, None, &err)),
                    close: false,
                };
            }
        };

        let client_id = request.client_id.clone();
        let result = match request.action.parse::<Action>() {
            Ok(Action::ChangePublicKeys) => self.handshake(&request),
            Ok(action) if action == Action::Associate || action.is_store_query() => {
                self.handle_encrypted(action, &request).await
            }
            _ => Err(BridgeError::IncorrectAction),
        };

        match result {
            Ok(mut response) => {
                response.client_id = client_id;
                Outcome { reply: Some(response), close: false }
            }
            Err(err) => {
                log::warn!("[Broker] {} '{}' rejected: {err}", self.id, request.action);
                Outcome {
                    reply: Some(Response::error(&request.action, client_id, &err)),
                    close: err.is_fatal(),
                }
            }
        }
    }

    /// `change-public-keys`: derive fresh session keys.
    ///
    /// Allowed from any state. A repeat handshake discards the old key, the
    /// nonce counters and the association.
    fn handshake(&mut self, request: &Request) -> Result<Response> {
        let public_key = request
            .public_key
            .as_deref()
            .ok_or_else(|| BridgeError::Parse("missing publicKey".into()))?;
        let nonce = Nonce::from_base64(
            request
                .nonce
                .as_deref()
                .ok_or_else(|| BridgeError::Parse("missing nonce".into()))?,
        )?;
        let peer_bytes = crypto::decode_base64(public_key).or(Err(BridgeError::InvalidPeerKey))?;

        let keypair = SessionKeypair::generate();
        let keys = crypto::derive_session_keys(&keypair, &peer_bytes)?;

        if self.established.is_some() {
            log::info!("[Broker] {} reset its session", self.id);
        }

        let reply_nonce = nonce.increment();
        self.established = Some(Established {
            keys,
            client_public_key: public_key.to_string(),
            last_inbound: nonce,
            last_outbound: reply_nonce,
        });
        self.client_name = None;
        self.set_state(ConnectionState::KeyExchanged);

        Ok(Response {
            action: Action::ChangePublicKeys.as_str().to_string(),
            public_key: Some(keypair.public_key_base64()),
            nonce: Some(reply_nonce.to_base64()),
            version: Some(PROTOCOL_VERSION.to_string()),
            success: Some("true".to_string()),
            ..Response::default()
        })
    }

    /// Authenticate, decrypt and dispatch an encrypted action.
    async fn handle_encrypted(&mut self, action: Action, request: &Request) -> Result<Response> {
        let state = self.state();
        let (nonce, plaintext) = {
            let Some(established) = self.established.as_mut() else {
                return Err(BridgeError::SessionNotEstablished);
            };
            if state == ConnectionState::KeyExchanged && action != Action::Associate {
                return Err(BridgeError::NotAssociated);
            }

            let nonce = Nonce::from_base64(
                request
                    .nonce
                    .as_deref()
                    .ok_or_else(|| BridgeError::Parse("missing nonce".into()))?,
            )?;
            if nonce <= established.last_inbound {
                return Err(BridgeError::ReplayRejected);
            }

            let ciphertext = crypto::decode_base64(
                request
                    .message
                    .as_deref()
                    .ok_or_else(|| BridgeError::Parse("missing message".into()))?,
            )?;
            let plaintext = crypto::decrypt(&established.keys.client_to_broker, &nonce, &ciphertext)?;
            established.last_inbound = nonce;
            (nonce, plaintext)
        };

        let inner: Value = serde_json::from_slice(&plaintext)
            .map_err(|e| BridgeError::Parse(format!("invalid payload: {e}")))?;
        let header: PayloadHeader = parse_payload(&inner)?;
        if header.action != action.as_str() {
            return Err(BridgeError::IncorrectAction);
        }

        let body = self.dispatch(action, &inner).await?;

        let established = self
            .established
            .as_mut()
            .ok_or(BridgeError::SessionNotEstablished)?;
        let reply_nonce = established.next_outbound(&nonce);
        let sealed = crypto::encrypt(
            &established.keys.broker_to_client,
            &reply_nonce,
            &body.to_bytes(),
        );

        Ok(Response {
            action: action.as_str().to_string(),
            message: Some(crypto::encode_base64(&sealed)),
            nonce: Some(reply_nonce.to_base64()),
            ..Response::default()
        })
    }

    async fn dispatch(&mut self, action: Action, inner: &Value) -> Result<ReplyBody> {
        if action == Action::Associate {
            return self.associate(parse_payload(inner)?).await;
        }

        // Only a served query counts; a rejected one leaves the state alone.
        let body = self.query(action, inner).await?;
        if self.state() == ConnectionState::Associated {
            self.set_state(ConnectionState::Active);
        }
        Ok(body)
    }

    async fn query(&mut self, action: Action, inner: &Value) -> Result<ReplyBody> {
        let action_name = action.as_str().to_string();
        let success = "true".to_string();

        match action {
            Action::TestAssociate => {
                let payload: TestAssociatePayload = parse_payload(inner)?;
                match &self.client_name {
                    Some(name) if *name == payload.id => Ok(ReplyBody::Association {
                        action: action_name,
                        id: name.clone(),
                        version: PROTOCOL_VERSION.to_string(),
                        success,
                    }),
                    _ => Err(BridgeError::NotAssociated),
                }
            }
            Action::GetCredentials => {
                let payload: GetCredentialsPayload = parse_payload(inner)?;
                if self.store.is_locked().await {
                    return Err(BridgeError::StoreLocked);
                }
                if payload.url.is_empty() {
                    return Err(BridgeError::NoUrlProvided);
                }
                let entries = self
                    .store
                    .find_credentials(&payload.url, payload.submit_url.as_deref())
                    .await
                    .map_err(|e| BridgeError::Store(e.0))?;
                if entries.is_empty() {
                    return Err(BridgeError::NoCredentialsFound);
                }
                Ok(ReplyBody::Credentials {
                    action: action_name,
                    count: entries.len(),
                    entries,
                    success,
                })
            }
            Action::CreateEntry => {
                let payload: CreateEntryPayload = parse_payload(inner)?;
                if self.store.is_locked().await {
                    return Err(BridgeError::StoreLocked);
                }
                if payload.fields.url.is_empty() {
                    return Err(BridgeError::NoUrlProvided);
                }
                self.store
                    .create_entry(payload.fields)
                    .await
                    .map_err(|e| BridgeError::Store(e.0))?;
                Ok(ReplyBody::Ack { action: action_name, success })
            }
            Action::GeneratePassword => {
                let payload: GeneratePasswordPayload = parse_payload(inner)?;
                let password = self
                    .store
                    .generate_password(&payload.policy)
                    .await
                    .map_err(|e| BridgeError::Store(e.0))?;
                Ok(ReplyBody::Password { action: action_name, password, success })
            }
            Action::GetLockState => Ok(ReplyBody::LockState {
                action: action_name,
                locked: self.store.is_locked().await,
                success,
            }),
            Action::LockStore => {
                self.store.lock().await.map_err(|e| BridgeError::Store(e.0))?;
                Ok(ReplyBody::Ack { action: action_name, success })
            }
            Action::ChangePublicKeys
            | Action::Associate
            | Action::StoreLocked
            | Action::StoreUnlocked => Err(BridgeError::IncorrectAction),
        }
    }

    /// `associate`: ask the approver and bind the identity on approval.
    ///
    /// A pending approval holds this connection (and only this connection)
    /// in `KeyExchanged` until the user decides.
    async fn associate(&mut self, payload: AssociatePayload) -> Result<ReplyBody> {
        if payload.id.trim().is_empty() {
            return Err(BridgeError::Parse("empty client identity".into()));
        }
        let public_key = self
            .established
            .as_ref()
            .map(|e| e.client_public_key.clone())
            .ok_or(BridgeError::SessionNotEstablished)?;

        let request = AssociationRequest {
            connection_id: self.id,
            client_name: payload.id.clone(),
            public_key,
            identity_key: payload.key,
        };

        let approved = match self.approver.approve(request).await {
            Approval::Approved => true,
            Approval::Denied => false,
            Approval::Pending(decision) => {
                log::info!("[Broker] {} association '{}' pending approval", self.id, payload.id);
                decision.await.unwrap_or(false)
            }
        };
        if !approved {
            return Err(BridgeError::AssociationDenied);
        }

        log::info!("[Broker] {} associated as '{}'", self.id, payload.id);
        self.client_name = Some(payload.id.clone());
        if !self.state().is_associated() {
            self.set_state(ConnectionState::Associated);
        }

        Ok(ReplyBody::Association {
            action: Action::Associate.as_str().to_string(),
            id: payload.id,
            version: PROTOCOL_VERSION.to_string(),
            success: "true".to_string(),
        })
    }
}

fn parse_payload<T: DeserializeOwned>(inner: &Value) -> Result<T> {
    T::deserialize(inner).map_err(|e| BridgeError::Parse(format!("invalid payload: {e}")))
}
