//! Signer backed by an external key-custody daemon.
//!
//! The daemon listens on a Unix socket and speaks one JSON request per line:
//!
//! ```text
//! -> {"id":"3","method":"nip44_encrypt","params":{"plaintext":"..","pubkey":".."}}
//! <- {"id":"3","result":"AgB..."}
//! ```
//!
//! Each request opens its own connection and is bounded by
//! [`REQUEST_TIMEOUT`]. The secret key never enters this process.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::event::{parse_pubkey, Event, PublicKey, UnsignedEvent};
use crate::signer::{Signer, SignerError};

pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// `~/.noorsigner/noorsigner.sock`.
pub fn default_socket_path() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(".noorsigner")
        .join("noorsigner.sock")
}

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    id: String,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

/// One JSON-RPC call per connection to the daemon socket.
struct RpcClient {
    socket_path: PathBuf,
    next_id: AtomicU64,
}

pub struct DaemonSigner {
    rpc: RpcClient,
    public_key: PublicKey,
}

impl DaemonSigner {
    /// Connect to the daemon and ask it for the active public key.
    pub async fn connect(socket_path: impl AsRef<Path>) -> Result<Self, SignerError> {
        let rpc = RpcClient {
            socket_path: socket_path.as_ref().to_path_buf(),
            next_id: AtomicU64::new(1),
        };
        let hex = rpc.call_string("get_public_key", json!({})).await?;
        let public_key = parse_pubkey(&hex)?;
        crate::tlog!(
            "signer: daemon at {} serving {}",
            rpc.socket_path.display(),
            crate::logging::pubkey(&public_key.to_hex())
        );
        Ok(Self { rpc, public_key })
    }
}

impl RpcClient {
    async fn call(&self, method: &str, params: Value) -> Result<Value, SignerError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed).to_string();
        let request = RpcRequest {
            id: id.clone(),
            method,
            params,
        };
        let line = serde_json::to_string(&request)
            .map_err(|e| SignerError::Backend(format!("encode request: {e}")))?;

        let response = tokio::time::timeout(REQUEST_TIMEOUT, self.round_trip(line))
            .await
            .map_err(|_| {
                SignerError::Unavailable(
                    "request timed out; the daemon may have crashed or is unresponsive".into(),
                )
            })??;

        let parsed: RpcResponse = serde_json::from_str(response.trim_end())
            .map_err(|e| SignerError::Backend(format!("decode response: {e}")))?;
        if parsed.id.as_deref().is_some_and(|rid| rid != id) {
            return Err(SignerError::Backend(format!(
                "response id {:?} does not match request {id}",
                parsed.id
            )));
        }
        if let Some(error) = parsed.error {
            return Err(SignerError::Backend(error));
        }
        parsed
            .result
            .ok_or_else(|| SignerError::Backend(format!("{method}: empty result")))
    }

    #[cfg(unix)]
    async fn round_trip(&self, line: String) -> Result<String, SignerError> {
        use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
        use tokio::net::UnixStream;

        let mut stream = UnixStream::connect(&self.socket_path).await.map_err(|e| {
            SignerError::Unavailable(format!(
                "failed to connect to signer daemon at {}: {e}; is it running?",
                self.socket_path.display()
            ))
        })?;
        stream
            .write_all(line.as_bytes())
            .await
            .map_err(|e| SignerError::Unavailable(format!("send request: {e}")))?;
        stream
            .write_all(b"\n")
            .await
            .map_err(|e| SignerError::Unavailable(format!("send request: {e}")))?;

        let mut reader = BufReader::new(stream);
        let mut response = String::new();
        let read = reader
            .read_line(&mut response)
            .await
            .map_err(|e| SignerError::Unavailable(format!("read response: {e}")))?;
        if read == 0 {
            return Err(SignerError::Unavailable("daemon closed the connection".into()));
        }
        Ok(response)
    }

    #[cfg(not(unix))]
    async fn round_trip(&self, _line: String) -> Result<String, SignerError> {
        Err(SignerError::Unavailable(
            "signer daemon transport requires Unix sockets".into(),
        ))
    }

    async fn call_string(&self, method: &str, params: Value) -> Result<String, SignerError> {
        match self.call(method, params).await? {
            Value::String(s) => Ok(s),
            other => Err(SignerError::Backend(format!(
                "{method}: expected string result, got {other}"
            ))),
        }
    }
}

#[async_trait]
impl Signer for DaemonSigner {
    fn public_key(&self) -> PublicKey {
        self.public_key
    }

    async fn sign_event(&self, unsigned: UnsignedEvent) -> Result<Event, SignerError> {
        let params = serde_json::to_value(&unsigned)
            .map_err(|e| SignerError::Backend(format!("encode event: {e}")))?;
        let result = self.rpc.call("sign_event", json!({ "event": params })).await?;
        let event: Event = serde_json::from_value(result)
            .map_err(|e| SignerError::Backend(format!("decode signed event: {e}")))?;
        event
            .verify()
            .map_err(|e| SignerError::Backend(format!("daemon returned a bad signature: {e}")))?;
        if event.pubkey != self.public_key {
            return Err(SignerError::Backend(
                "daemon signed with an unexpected key".into(),
            ));
        }
        Ok(event)
    }

    async fn encrypt(
        &self,
        plaintext: &str,
        counterparty: &PublicKey,
    ) -> Result<String, SignerError> {
        self.rpc
            .call_string(
                "nip44_encrypt",
                json!({ "plaintext": plaintext, "pubkey": counterparty.to_hex() }),
            )
            .await
    }

    async fn decrypt(
        &self,
        payload: &str,
        counterparty: &PublicKey,
    ) -> Result<String, SignerError> {
        self.rpc
            .call_string(
                "nip44_decrypt",
                json!({ "payload": payload, "pubkey": counterparty.to_hex() }),
            )
            .await
    }

    async fn legacy_decrypt(
        &self,
        payload: &str,
        counterparty: &PublicKey,
    ) -> Result<String, SignerError> {
        self.rpc
            .call_string(
                "nip04_decrypt",
                json!({ "payload": payload, "pubkey": counterparty.to_hex() }),
            )
            .await
    }
}
