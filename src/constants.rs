//! Protocol constants for the browser bridge.
//!
//! Everything that both sides of a socket must agree on lives here, grouped
//! by the layer that uses it.
//!
//! # Categories
//!
//! - **Framing**: native-messaging frame limits
//! - **Endpoint**: socket naming
//! - **Crypto**: key and nonce sizes

use std::time::Duration;

// ============================================================================
// Framing
// ============================================================================

/// Maximum size of a single native-messaging message (1 MiB).
///
/// Browsers cap host-bound messages at this size. The Relay treats a larger
/// declared length as fatal; the broker applies the same bound to the bytes
/// it buffers for one unfinished message.
pub const MAX_MESSAGE_LENGTH: usize = 1024 * 1024;

/// Size of the native-messaging length prefix.
pub const FRAME_HEADER_LEN: usize = 4;

/// Socket read buffer size for both the broker and the Relay.
pub const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Decoded messages a connection buffers while an earlier one is handled.
/// Reading pauses at this depth until the backlog drains.
pub const MAX_QUEUED_MESSAGES: usize = 64;

// ============================================================================
// Endpoint
// ============================================================================

/// File name of the broker socket inside the runtime directory.
pub const SOCKET_FILE_NAME: &str = "org.browser-bridge.BrowserServer";

/// Maximum path length for a Unix domain socket.
///
/// `sun_path` is 104 bytes on macOS and 108 on Linux; use the smaller one.
pub const MAX_SOCKET_PATH: usize = 104;

/// Back-off after a failed `accept()` before trying again.
pub const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// How long `stop()` waits for each connection to flush queued writes.
pub const STOP_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

// ============================================================================
// Crypto
// ============================================================================

/// X25519 public key length.
pub const PUBLIC_KEY_LEN: usize = 32;

/// Session key length (XChaCha20-Poly1305).
pub const SESSION_KEY_LEN: usize = 32;

/// Nonce length (XChaCha20-Poly1305 extended nonce).
pub const NONCE_LEN: usize = 24;

/// HKDF info for the key sealing client requests.
pub const CLIENT_KEY_INFO: &[u8] = b"browser-bridge client to broker v1";

/// HKDF info for the key sealing broker replies.
pub const BROKER_KEY_INFO: &[u8] = b"browser-bridge broker to client v1";

/// Protocol version reported in handshake responses.
pub const PROTOCOL_VERSION: &str = env!("CARGO_PKG_VERSION");
