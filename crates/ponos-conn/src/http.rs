//! HTTP/2 control transport.
//!
//! Performers serve their control surface over cleartext HTTP/2 (prior
//! knowledge):
//!
//! - `GET /healthz`: 2xx when the performer is ready for tasks
//! - `POST /tasks`: JSON `TaskRequest` in, JSON `TaskResult` out
//!
//! Non-2xx responses are mapped onto `ConnError` classes so the connection
//! manager can tell transient from permanent failures.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{CONTENT_TYPE, USER_AGENT};
use http::{Method, Request, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http2::{self, SendRequest};
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::debug;

use ponos_core::{TaskRequest, TaskResult};

use crate::error::{ConnError, ConnResult};
use crate::transport::{ChannelState, Connector, PerformerChannel};

const HEALTH_PATH: &str = "/healthz";
const TASKS_PATH: &str = "/tasks";
const CLIENT_NAME: &str = concat!("ponos/", env!("CARGO_PKG_VERSION"));

/// Dials performers over TCP and negotiates HTTP/2.
#[derive(Debug, Clone, Default)]
pub struct HttpConnector {
    task_timeout: Option<Duration>,
}

impl HttpConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound every `POST /tasks` call.
    pub fn with_task_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.task_timeout = timeout;
        self
    }
}

#[async_trait]
impl Connector for HttpConnector {
    async fn connect(&self, endpoint: &str) -> ConnResult<Arc<dyn PerformerChannel>> {
        let stream = TcpStream::connect(endpoint)
            .await
            .map_err(|e| classify_io(endpoint, e))?;
        let _ = stream.set_nodelay(true);

        let (sender, conn) = http2::handshake(TokioExecutor::new(), TokioIo::new(stream))
            .await
            .map_err(classify_hyper)?;

        let driver_endpoint = endpoint.to_string();
        let driver = tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(error = %e, endpoint = %driver_endpoint, "http2 connection ended");
            }
        });

        debug!(%endpoint, "http2 channel established");
        Ok(Arc::new(HttpChannel {
            endpoint: endpoint.to_string(),
            sender,
            driver,
            closed: AtomicBool::new(false),
            task_timeout: self.task_timeout,
        }))
    }
}

/// One HTTP/2 connection to a performer.
pub struct HttpChannel {
    endpoint: String,
    sender: SendRequest<Full<Bytes>>,
    driver: JoinHandle<()>,
    closed: AtomicBool,
    task_timeout: Option<Duration>,
}

impl HttpChannel {
    async fn send(&self, method: Method, path: &str, body: Bytes) -> ConnResult<Bytes> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ConnError::Closed);
        }
        let mut builder = Request::builder()
            .method(method)
            .uri(format!("http://{}{}", self.endpoint, path))
            .header(USER_AGENT, CLIENT_NAME);
        if !body.is_empty() {
            builder = builder.header(CONTENT_TYPE, "application/json");
        }
        let request = builder
            .body(Full::new(body))
            .map_err(|e| ConnError::InvalidArgument(e.to_string()))?;

        let mut sender = self.sender.clone();
        sender.ready().await.map_err(classify_hyper)?;
        let response = sender.send_request(request).await.map_err(classify_hyper)?;
        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(classify_hyper)?
            .to_bytes();

        if status.is_success() {
            Ok(body)
        } else {
            Err(classify_status(status, &body))
        }
    }
}

#[async_trait]
impl PerformerChannel for HttpChannel {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn state(&self) -> ChannelState {
        if self.closed.load(Ordering::Acquire) {
            ChannelState::Shutdown
        } else if self.sender.is_closed() {
            ChannelState::TransientFailure
        } else if self.sender.is_ready() {
            ChannelState::Ready
        } else {
            ChannelState::Idle
        }
    }

    async fn wait_ready(&self) -> ConnResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ConnError::Closed);
        }
        let mut sender = self.sender.clone();
        sender.ready().await.map_err(classify_hyper)
    }

    async fn health_check(&self) -> ConnResult<()> {
        self.send(Method::GET, HEALTH_PATH, Bytes::new()).await?;
        Ok(())
    }

    async fn execute_task(&self, task: TaskRequest) -> ConnResult<TaskResult> {
        let body = serde_json::to_vec(&task)
            .map_err(|e| ConnError::InvalidArgument(format!("encode task: {e}")))?;
        let call = self.send(Method::POST, TASKS_PATH, Bytes::from(body));
        let response = match self.task_timeout {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .map_err(|_| ConnError::Timeout(format!("task {} after {limit:?}", task.task_id)))??,
            None => call.await?,
        };
        serde_json::from_slice(&response)
            .map_err(|e| ConnError::Protocol(format!("decode task result: {e}")))
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.driver.abort();
            debug!(endpoint = %self.endpoint, "http2 channel closed");
        }
    }
}

impl Drop for HttpChannel {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

fn classify_io(endpoint: &str, e: std::io::Error) -> ConnError {
    use std::io::ErrorKind;
    match e.kind() {
        ErrorKind::ConnectionRefused
        | ErrorKind::ConnectionReset
        | ErrorKind::NotFound
        | ErrorKind::AddrNotAvailable => ConnError::Unavailable(format!("{endpoint}: {e}")),
        ErrorKind::TimedOut => ConnError::Timeout(format!("{endpoint}: {e}")),
        ErrorKind::InvalidInput => ConnError::InvalidArgument(format!("{endpoint}: {e}")),
        _ => ConnError::Transport(format!("{endpoint}: {e}")),
    }
}

fn classify_hyper(e: hyper::Error) -> ConnError {
    if e.is_timeout() {
        ConnError::Timeout(e.to_string())
    } else if e.is_closed() || e.is_canceled() {
        ConnError::Unavailable(e.to_string())
    } else if e.is_parse() || e.is_user() {
        ConnError::Protocol(e.to_string())
    } else {
        ConnError::Transport(e.to_string())
    }
}

/// Map a non-2xx response onto an error class.
pub fn classify_status(status: StatusCode, body: &[u8]) -> ConnError {
    let text = String::from_utf8_lossy(body).trim().to_string();
    let message = if text.is_empty() {
        status.canonical_reason().unwrap_or("no reason").to_string()
    } else {
        text
    };
    match status {
        StatusCode::SERVICE_UNAVAILABLE | StatusCode::BAD_GATEWAY => {
            ConnError::Unavailable(message)
        }
        StatusCode::TOO_MANY_REQUESTS => ConnError::ResourceExhausted(message),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ConnError::PermissionDenied(message),
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
            ConnError::InvalidArgument(message)
        }
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => ConnError::Timeout(message),
        _ => ConnError::Remote {
            status: status.as_u16(),
            message,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_map_onto_error_classes() {
        assert!(matches!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE, b""),
            ConnError::Unavailable(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, b"slow down"),
            ConnError::ResourceExhausted(m) if m == "slow down"
        ));
        assert!(matches!(
            classify_status(StatusCode::FORBIDDEN, b""),
            ConnError::PermissionDenied(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::UNPROCESSABLE_ENTITY, b"bad payload"),
            ConnError::InvalidArgument(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::GATEWAY_TIMEOUT, b""),
            ConnError::Timeout(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::INTERNAL_SERVER_ERROR, b""),
            ConnError::Remote { status: 500, .. }
        ));
    }

    #[test]
    fn empty_body_uses_reason_phrase() {
        let err = classify_status(StatusCode::SERVICE_UNAVAILABLE, b"  ");
        assert_eq!(err.to_string(), "endpoint unavailable: Service Unavailable");
    }

    #[tokio::test]
    async fn refused_connection_is_retryable() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let err = HttpConnector::new()
            .connect(&format!("127.0.0.1:{port}"))
            .await
            .err()
            .unwrap();
        assert!(err.is_retryable(), "unexpected error: {err}");
    }
}
