//! Transport sessions -- one per pooled endpoint.
//!
//! Two families, selected by endpoint scheme. `http(s)://` sends one
//! envelope per POST with the token as a bearer header. `ws(s)://` keeps a
//! persistent socket: the first frame after connect must be `authorize`,
//! every subsequent frame is `{id, action, data}`, and replies correlate by
//! id so they may arrive out of order. Sockets connect lazily on the first
//! request and redial after a broken send.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use pylon_protocol::{PeerRequest, PeerResponse, SocketReply, TransportKind};

use crate::TransportError;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;
type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<SocketReply>>>>;

/// One outbound RPC session. The variant is fixed by the endpoint scheme
/// when the pool creates the stub.
#[derive(Debug)]
pub enum Session {
    Http(HttpSession),
    Socket(SocketSession),
}

impl Session {
    pub(crate) fn for_endpoint(
        endpoint: &str,
        http: reqwest::Client,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Session, TransportError> {
        match TransportKind::from_endpoint(endpoint)? {
            TransportKind::Http => Ok(Session::Http(HttpSession {
                client: http,
                endpoint: endpoint.to_string(),
            })),
            TransportKind::Socket => Ok(Session::Socket(SocketSession::new(
                endpoint,
                connect_timeout,
                request_timeout,
            ))),
        }
    }

    pub fn endpoint(&self) -> &str {
        match self {
            Session::Http(s) => &s.endpoint,
            Session::Socket(s) => &s.endpoint,
        }
    }

    /// Send one `{action, data}` envelope and await the `{success, error?}`
    /// reply. A `success: false` reply is not an `Err`: the request was
    /// delivered and answered; stubs decide what rejection means.
    pub async fn request<R: Serialize>(
        &self,
        token: &str,
        action: &str,
        request: &R,
    ) -> Result<PeerResponse, TransportError> {
        match self {
            Session::Http(s) => s.request(token, action, request).await,
            Session::Socket(s) => s.request(token, action, request).await,
        }
    }
}

/// Request/response transport: one envelope per HTTP POST.
#[derive(Debug)]
pub struct HttpSession {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpSession {
    async fn request<R: Serialize>(
        &self,
        token: &str,
        action: &str,
        request: &R,
    ) -> Result<PeerResponse, TransportError> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(token)
            .json(request)
            .send()
            .await
            .map_err(|e| TransportError::Rpc {
                action: action.to_string(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED
            || status == reqwest::StatusCode::FORBIDDEN
        {
            return Err(TransportError::AuthRejected);
        }
        if !status.is_success() {
            return Err(TransportError::Rpc {
                action: action.to_string(),
                reason: format!("http status {status}"),
            });
        }
        response.json().await.map_err(|e| TransportError::Rpc {
            action: action.to_string(),
            reason: format!("malformed reply: {e}"),
        })
    }
}

/// Persistent-socket transport with id-correlated frames.
#[derive(Debug)]
pub struct SocketSession {
    endpoint: String,
    connect_timeout: Duration,
    request_timeout: Duration,
    next_id: AtomicU64,
    inner: Mutex<Option<SocketInner>>,
}

#[derive(Debug)]
struct SocketInner {
    sink: WsSink,
    pending: Pending,
    reader: JoinHandle<()>,
}

impl Drop for SocketInner {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

impl SocketSession {
    pub(crate) fn new(
        endpoint: impl Into<String>,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Self {
        SocketSession {
            endpoint: endpoint.into(),
            connect_timeout,
            request_timeout,
            next_id: AtomicU64::new(1),
            inner: Mutex::new(None),
        }
    }

    async fn request<R: Serialize>(
        &self,
        token: &str,
        action: &str,
        request: &R,
    ) -> Result<PeerResponse, TransportError> {
        let mut guard = self.inner.lock().await;
        if guard.is_none() {
            *guard = Some(self.connect(token).await?);
        }
        // Just checked; the lock is held.
        let Some(inner) = guard.as_mut() else {
            return Err(TransportError::Rpc {
                action: action.to_string(),
                reason: "socket unavailable".into(),
            });
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = frame_json(id, request)?;
        let (tx, rx) = oneshot::channel();
        inner.pending.lock().await.insert(id, tx);

        if let Err(e) = inner.sink.send(Message::Text(frame.into())).await {
            // Broken pipe: drop the connection so the next request redials.
            *guard = None;
            return Err(TransportError::Rpc {
                action: action.to_string(),
                reason: e.to_string(),
            });
        }
        let pending = Arc::clone(&inner.pending);
        // Release the session before waiting, so later requests interleave
        // and out-of-order replies have something to correlate against.
        drop(guard);

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(reply)) => Ok(PeerResponse {
                success: reply.success,
                error: reply.error,
            }),
            Ok(Err(_)) => Err(TransportError::Rpc {
                action: action.to_string(),
                reason: "socket closed before reply".into(),
            }),
            Err(_) => {
                pending.lock().await.remove(&id);
                Err(TransportError::Timeout {
                    action: action.to_string(),
                    after: self.request_timeout,
                })
            }
        }
    }

    async fn connect(&self, token: &str) -> Result<SocketInner, TransportError> {
        let connect_err = |reason: String| TransportError::Connect {
            endpoint: self.endpoint.clone(),
            reason,
        };

        let (ws, _response) = tokio::time::timeout(self.connect_timeout, connect_async(&self.endpoint))
            .await
            .map_err(|_| connect_err("connect timed out".into()))?
            .map_err(|e| connect_err(e.to_string()))?;
        let (sink, stream) = ws.split();
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let mut inner = SocketInner {
            sink,
            pending: Arc::clone(&pending),
            reader: tokio::spawn(read_replies(stream, pending)),
        };

        // First frame on a fresh socket: authorize.
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        inner.pending.lock().await.insert(id, tx);
        let frame = frame_json(
            id,
            &PeerRequest::Authorize {
                token: token.to_string(),
            },
        )?;
        inner
            .sink
            .send(Message::Text(frame.into()))
            .await
            .map_err(|e| connect_err(e.to_string()))?;

        let reply = tokio::time::timeout(self.request_timeout, rx)
            .await
            .map_err(|_| connect_err("authorize timed out".into()))?
            .map_err(|_| connect_err("socket closed during authorize".into()))?;
        if !reply.success {
            return Err(TransportError::AuthRejected);
        }
        tracing::debug!(endpoint = %self.endpoint, "socket session established");
        Ok(inner)
    }
}

/// Reader half of a socket session: routes replies to their waiters by id.
/// When the stream ends, dropping the pending senders wakes every waiter
/// with a closed-channel error.
async fn read_replies(mut stream: WsStream, pending: Pending) {
    while let Some(frame) = stream.next().await {
        let frame = match frame {
            Ok(f) => f,
            Err(e) => {
                tracing::debug!(error = %e, "socket read failed");
                break;
            }
        };
        let text = match frame {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        match serde_json::from_str::<SocketReply>(text.as_str()) {
            Ok(reply) => {
                let waiter = pending.lock().await.remove(&reply.id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(reply);
                    }
                    None => tracing::debug!(id = reply.id, "socket reply with no waiter"),
                }
            }
            Err(e) => tracing::debug!(error = %e, "unparseable socket reply"),
        }
    }
    pending.lock().await.clear();
}

/// Serialize an envelope with the correlation id injected alongside the
/// `action`/`data` fields.
fn frame_json<R: Serialize>(id: u64, request: &R) -> Result<String, TransportError> {
    let mut value =
        serde_json::to_value(request).map_err(|e| TransportError::Encode(e.to_string()))?;
    match value.as_object_mut() {
        Some(map) => {
            map.insert("id".into(), serde_json::Value::from(id));
        }
        None => {
            return Err(TransportError::Encode(
                "request envelope must be a JSON object".into(),
            ))
        }
    }
    serde_json::to_string(&value).map_err(|e| TransportError::Encode(e.to_string()))
}
