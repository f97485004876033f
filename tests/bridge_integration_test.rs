//! End-to-end tests: browser frames → Relay → broker socket → store, and back.
//!
//! The browser side is a pair of in-memory pipes standing in for the Relay's
//! stdin and stdout; the broker listens on a real socket in a temp dir.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use browser_bridge::constants::MAX_MESSAGE_LENGTH;
use browser_bridge::framing::{read_frame, write_frame};
use browser_bridge::store::{Credential, EntryFields, PasswordPolicy, StoreError};
use browser_bridge::{
    relay, Action, Approval, AssociationApprover, AssociationRequest, BridgeConfig, BridgeError,
    ClientSession, ConnectionState, CredentialStore, RelayExit, Request, Response, SessionBroker,
};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::io::{duplex, DuplexStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

const TIMEOUT: Duration = Duration::from_secs(5);

struct ExampleStore;

#[async_trait]
impl CredentialStore for ExampleStore {
    async fn is_locked(&self) -> bool {
        false
    }

    async fn find_credentials(
        &self,
        url: &str,
        _submit_url: Option<&str>,
    ) -> Result<Vec<Credential>, StoreError> {
        if url == "https://example.com" {
            Ok(vec![Credential {
                uuid: "7c1d".into(),
                name: "example.com".into(),
                login: "alice".into(),
                password: "correct horse".into(),
            }])
        } else {
            Ok(Vec::new())
        }
    }

    async fn create_entry(&self, _fields: EntryFields) -> Result<(), StoreError> {
        Err(StoreError("read-only".into()))
    }

    async fn generate_password(&self, _policy: &PasswordPolicy) -> Result<String, StoreError> {
        Err(StoreError("no generator".into()))
    }

    async fn lock(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Forwards every association request to the test.
struct PromptingApprover(mpsc::UnboundedSender<(AssociationRequest, oneshot::Sender<bool>)>);

#[async_trait]
impl AssociationApprover for PromptingApprover {
    async fn approve(&self, request: AssociationRequest) -> Approval {
        let (tx, rx) = oneshot::channel();
        let _ = self.0.send((request, tx));
        Approval::Pending(rx)
    }
}

type Prompts = mpsc::UnboundedReceiver<(AssociationRequest, oneshot::Sender<bool>)>;

fn start_broker(dir: &TempDir) -> (SessionBroker, Prompts) {
    let config = BridgeConfig {
        socket_path: dir.path().join("bridge.sock"),
        max_message_length: MAX_MESSAGE_LENGTH,
        handshake_timeout_secs: None,
    };
    let (prompts_tx, prompts) = mpsc::unbounded_channel();
    let broker = SessionBroker::new(
        config,
        Arc::new(ExampleStore),
        Arc::new(PromptingApprover(prompts_tx)),
    );
    broker.start_default().unwrap();
    (broker, prompts)
}

/// The browser end of a running Relay.
struct Browser {
    stdin: DuplexStream,
    stdout: DuplexStream,
    pending: VecDeque<Value>,
    relay: JoinHandle<browser_bridge::Result<RelayExit>>,
}

impl Browser {
    fn launch(broker: &SessionBroker) -> Self {
        let (stdin, relay_stdin) = duplex(64 * 1024);
        let (relay_stdout, stdout) = duplex(64 * 1024);
        let socket_path = broker.socket_path().unwrap();
        let relay = tokio::spawn(async move {
            relay::run_at(&socket_path, relay_stdin, relay_stdout, MAX_MESSAGE_LENGTH).await
        });
        Self { stdin, stdout, pending: VecDeque::new(), relay }
    }

    async fn send(&mut self, request: &Request) {
        write_frame(&mut self.stdin, &serde_json::to_vec(request).unwrap())
            .await
            .unwrap();
    }

    /// Next message; one frame may hold several.
    async fn recv_value(&mut self) -> Option<Value> {
        loop {
            if let Some(value) = self.pending.pop_front() {
                return Some(value);
            }
            let frame = tokio::time::timeout(TIMEOUT, read_frame(&mut self.stdout, MAX_MESSAGE_LENGTH))
                .await
                .expect("timed out waiting for the relay")
                .unwrap()?;
            for value in serde_json::Deserializer::from_slice(&frame).into_iter::<Value>() {
                self.pending.push_back(value.unwrap());
            }
        }
    }

    async fn call(&mut self, request: &Request) -> Response {
        self.send(request).await;
        serde_json::from_value(self.recv_value().await.expect("relay closed")).unwrap()
    }

    async fn exit(self) -> browser_bridge::Result<RelayExit> {
        tokio::time::timeout(TIMEOUT, self.relay)
            .await
            .expect("relay did not exit")
            .unwrap()
    }
}

async fn wait_for_connections(broker: &SessionBroker, expected: usize) {
    tokio::time::timeout(TIMEOUT, async {
        while broker.connection_count() != expected {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("connection count never settled");
}

#[tokio::test]
async fn test_extension_fetches_credentials_through_relay() {
    let dir = TempDir::new().unwrap();
    let (broker, mut prompts) = start_broker(&dir);
    let mut browser = Browser::launch(&broker);
    let mut client = ClientSession::new("ext-1");

    let response = browser.call(&client.handshake_request()).await;
    client.complete_handshake(&response).unwrap();
    wait_for_connections(&broker, 1).await;
    let id = broker.connection_ids()[0];
    assert_eq!(broker.connection_state(id), Some(ConnectionState::KeyExchanged));

    let associate = client.seal(Action::Associate, json!({ "id": "Test Browser" })).unwrap();
    browser.send(&associate).await;
    let (request, decision) = prompts.recv().await.unwrap();
    assert_eq!(request.client_name, "Test Browser");
    assert_eq!(request.connection_id, id);

    let mut state = broker.watch_state(id).unwrap();
    decision.send(true).unwrap();
    let response: Response = serde_json::from_value(browser.recv_value().await.unwrap()).unwrap();
    assert_eq!(client.open(&response).unwrap()["id"], "Test Browser");
    state
        .wait_for(|s| *s == ConnectionState::Associated)
        .await
        .unwrap();

    let request = client
        .seal(Action::GetCredentials, json!({ "url": "https://example.com" }))
        .unwrap();
    let response = browser.call(&request).await;
    let body = client.open(&response).unwrap();
    assert_eq!(body["count"], 1);
    assert_eq!(body["entries"][0]["login"], "alice");
    assert_eq!(body["entries"][0]["password"], "correct horse");
    assert_eq!(broker.connection_state(id), Some(ConnectionState::Active));

    // Store failures come back as protocol errors.
    let request = client.seal(Action::GeneratePassword, json!({})).unwrap();
    let response = browser.call(&request).await;
    assert_eq!(response.error_code.as_deref(), Some("17"));

    broker.stop().await;
    assert_eq!(browser.exit().await.unwrap(), RelayExit::SocketClosed);
}

#[tokio::test]
async fn test_lock_state_reaches_every_relay() {
    let dir = TempDir::new().unwrap();
    let (broker, _prompts) = start_broker(&dir);
    let mut browsers: Vec<Browser> = (0..3).map(|_| Browser::launch(&broker)).collect();
    wait_for_connections(&broker, 3).await;

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    broker.forward_lock_events(events_rx);
    events_tx.send(true).unwrap();

    for browser in &mut browsers {
        assert_eq!(browser.recv_value().await.unwrap(), json!({ "action": "store-locked" }));
    }

    // Closing the browser side ends that relay and frees its connection.
    let browser = browsers.pop().unwrap();
    let Browser { stdin, stdout, relay, .. } = browser;
    drop(stdin);
    assert_eq!(relay.await.unwrap().unwrap(), RelayExit::StdinClosed);
    drop(stdout);
    wait_for_connections(&broker, 2).await;

    assert_eq!(broker.notify_lock_state(false), 2);
    broker.stop().await;
}

#[tokio::test]
async fn test_oversized_browser_frame_stops_relay() {
    let dir = TempDir::new().unwrap();
    let (broker, _prompts) = start_broker(&dir);
    let mut browser = Browser::launch(&broker);

    let declared = u32::try_from(MAX_MESSAGE_LENGTH + 1).unwrap();
    tokio::io::AsyncWriteExt::write_all(&mut browser.stdin, &declared.to_le_bytes())
        .await
        .unwrap();

    let err = browser.exit().await.unwrap_err();
    assert!(matches!(err, BridgeError::FrameTooLarge { .. }));
    wait_for_connections(&broker, 0).await;
    broker.stop().await;
}

#[tokio::test]
async fn test_relay_without_broker_fails() {
    let dir = TempDir::new().unwrap();
    let (_stdin, relay_stdin) = duplex(64);
    let (relay_stdout, _stdout) = duplex(64);
    let err = relay::run_at(
        &dir.path().join("missing.sock"),
        relay_stdin,
        relay_stdout,
        MAX_MESSAGE_LENGTH,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, BridgeError::Io(_)));
}
