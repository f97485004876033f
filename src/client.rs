//! Extension-side session helper.
//!
//! Builds and opens the messages an extension exchanges with the broker:
//! the handshake, then sealed requests with a strictly increasing nonce.
//! Hosts use it in their own tests and diagnostics; the broker never does.

use serde_json::Value;

use crate::crypto::{self, Nonce, SessionKeypair, SessionKeys};
use crate::error::{BridgeError, Result};
use crate::protocol::{Action, Request, Response};

/// Client half of one broker session.
#[derive(Debug)]
pub struct ClientSession {
    client_id: String,
    keypair: SessionKeypair,
    keys: Option<SessionKeys>,
    last_sent: Nonce,
    last_received: Option<Nonce>,
}

impl ClientSession {
    /// New session with a fresh keypair and a random starting nonce.
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            keypair: SessionKeypair::generate(),
            keys: None,
            last_sent: Nonce::random(),
            last_received: None,
        }
    }

    /// Base64 public key of this session.
    pub fn public_key(&self) -> String {
        self.keypair.public_key_base64()
    }

    /// Nonce of the most recent request.
    pub fn last_nonce(&self) -> Nonce {
        self.last_sent
    }

    /// Whether the handshake has completed.
    pub fn is_established(&self) -> bool {
        self.keys.is_some()
    }

    #[cfg(test)]
    pub(crate) fn session_keys(&self) -> Option<&SessionKeys> {
        self.keys.as_ref()
    }

    fn next_nonce(&mut self) -> Nonce {
        self.last_sent = self.last_sent.increment();
        self.last_sent
    }

    /// `change-public-keys` request. Starts over if called again.
    pub fn handshake_request(&mut self) -> Request {
        self.keypair = SessionKeypair::generate();
        self.keys = None;
        self.last_received = None;
        let nonce = self.next_nonce();
        Request {
            action: Action::ChangePublicKeys.as_str().to_string(),
            client_id: Some(self.client_id.clone()),
            public_key: Some(self.public_key()),
            nonce: Some(nonce.to_base64()),
            message: None,
        }
    }

    /// Derive the session keys from the broker's handshake response.
    ///
    /// # Errors
    ///
    /// The broker's error if the response reports one, or
    /// [`BridgeError::InvalidPeerKey`] for a bad broker key.
    pub fn complete_handshake(&mut self, response: &Response) -> Result<()> {
        if let Some(error) = &response.error {
            return Err(BridgeError::Parse(format!("handshake refused: {error}")));
        }
        let public_key = response
            .public_key
            .as_deref()
            .ok_or_else(|| BridgeError::Parse("missing publicKey".into()))?;
        let broker_key = crypto::decode_base64(public_key).or(Err(BridgeError::InvalidPeerKey))?;
        self.keys = Some(crypto::derive_session_keys(&self.keypair, &broker_key)?);
        if let Some(nonce) = response.nonce.as_deref() {
            self.last_received = Some(Nonce::from_base64(nonce)?);
        }
        Ok(())
    }

    /// Seal `body` as an `action` request using the next nonce.
    ///
    /// `action` is inserted into `body`, which must be a JSON object.
    pub fn seal(&mut self, action: Action, body: Value) -> Result<Request> {
        let nonce = self.next_nonce();
        self.seal_with_nonce(action, body, nonce)
    }

    /// Seal with an explicit nonce, bypassing the counter.
    pub fn seal_with_nonce(&self, action: Action, mut body: Value, nonce: Nonce) -> Result<Request> {
        let keys = self.keys.as_ref().ok_or(BridgeError::SessionNotEstablished)?;
        let object = body
            .as_object_mut()
            .ok_or_else(|| BridgeError::Parse("request body must be an object".into()))?;
        object.insert("action".into(), Value::String(action.as_str().to_string()));

        let plaintext = serde_json::to_vec(&body).map_err(|e| BridgeError::Parse(e.to_string()))?;
        let sealed = crypto::encrypt(&keys.client_to_broker, &nonce, &plaintext);
        Ok(Request {
            action: action.as_str().to_string(),
            client_id: Some(self.client_id.clone()),
            message: Some(crypto::encode_base64(&sealed)),
            nonce: Some(nonce.to_base64()),
            public_key: None,
        })
    }

    /// Decrypt an encrypted response body.
    ///
    /// # Errors
    ///
    /// [`BridgeError::ReplayRejected`] if the response nonce does not advance,
    /// [`BridgeError::AuthenticationFailed`] if it does not verify.
    pub fn open(&mut self, response: &Response) -> Result<Value> {
        let keys = self.keys.as_ref().ok_or(BridgeError::SessionNotEstablished)?;
        let nonce = Nonce::from_base64(
            response
                .nonce
                .as_deref()
                .ok_or_else(|| BridgeError::Parse("missing nonce".into()))?,
        )?;
        if self.last_received.is_some_and(|last| nonce <= last) {
            return Err(BridgeError::ReplayRejected);
        }
        let ciphertext = crypto::decode_base64(
            response
                .message
                .as_deref()
                .ok_or_else(|| BridgeError::Parse("missing message".into()))?,
        )?;
        let plaintext = crypto::decrypt(&keys.broker_to_client, &nonce, &ciphertext)?;
        self.last_received = Some(nonce);
        serde_json::from_slice(&plaintext).map_err(|e| BridgeError::Parse(e.to_string()))
    }
}
