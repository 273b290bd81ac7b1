//! Outbound HTTP request executor.
//!
//! A state machine over [`Connector`](crate::client::Connector) and
//! [`Connection`](crate::Connection):
//! `INIT → CONNECT → CONNECTED → SUBMIT → SUBMITTED → COMPLETE | ERROR`.
//! Transitions are checked; a bad step is logged and dropped rather
//! than corrupting the machine. On a terminal state the connection is
//! released and the awaiting caller resumes exactly once, either with
//! the response or with a descriptive error.

use crate::client::{Connector, HttpClient};
use crate::http::{HttpResponse, Method};
use crate::uri::{Scheme, Uri};
use crate::{Connection, Error, Result};
use bytes::Bytes;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{trace, warn};

/// Default cap on the submit/response exchange.
pub const SUBMIT_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Init,
    Connect,
    Connected,
    Submit,
    Submitted,
    Complete,
    Error,
}

/// Executes one HTTP request against a remote server.
#[derive(Debug)]
pub struct HttpRequestExecutor {
    uri: Uri,
    method: Method,
    body: Bytes,
    content_type: String,
    connect_ttl: Duration,
    submit_ttl: Duration,

    // Observable from other tasks while `execute` runs.
    state: Mutex<State>,
    error: Mutex<String>,
}

impl HttpRequestExecutor {
    pub fn new(uri: Uri, method: Method, body: impl Into<Bytes>, content_type: &str) -> Self {
        HttpRequestExecutor {
            uri,
            method,
            body: body.into(),
            content_type: content_type.to_string(),
            connect_ttl: crate::client::CONNECT_TTL,
            submit_ttl: SUBMIT_TTL,
            state: Mutex::new(State::Init),
            error: Mutex::new("No run".to_string()),
        }
    }

    /// Override the connect and submit deadlines.
    pub fn with_timeouts(mut self, connect_ttl: Duration, submit_ttl: Duration) -> Self {
        self.connect_ttl = connect_ttl;
        self.submit_ttl = submit_ttl;
        self
    }

    pub fn state(&self) -> State {
        *self.state.lock().unwrap()
    }

    /// Descriptive message of the last failure; empty while running
    /// and after success.
    pub fn error(&self) -> String {
        self.error.lock().unwrap().clone()
    }

    pub fn has_failed(&self) -> bool {
        self.state() == State::Error
    }

    /// Move the machine forward; a transition from any other state
    /// than `from` is a bad step and is dropped.
    fn step(&self, from: State, to: State, label: &str) -> bool {
        let mut state = self.state.lock().unwrap();
        if *state != from {
            warn!(current = ?*state, "bad step: {label}");
            return false;
        }
        trace!(?to, "{label}");
        *state = to;
        true
    }

    fn fail(&self, message: String) -> Error {
        *self.error.lock().unwrap() = message.clone();
        *self.state.lock().unwrap() = State::Error;
        Error::Execution(message)
    }

    /// Drive the request to a terminal state.
    ///
    /// Resolves once, with either the response or a single error; a
    /// connection that dies mid-exchange surfaces here as that one
    /// error.
    #[tracing::instrument(skip_all, fields(uri = %self.uri))]
    pub async fn execute(&self) -> Result<HttpResponse> {
        if !self.step(State::Init, State::Connect, "connect") {
            return Err(Error::Execution("executor already ran".into()));
        }
        self.error.lock().unwrap().clear();

        if self.uri.scheme() == Scheme::Http && self.uri.is_secure() {
            return Err(self.fail("no tls connector is configured for https".into()));
        }

        let port = if self.uri.port() == 0 { 80 } else { self.uri.port() };
        let connector = Connector::new(self.uri.host(), port).with_ttl(self.connect_ttl);

        let socket = match connector.connect().await {
            Ok(socket) => socket,
            Err(err) => {
                return Err(self.fail(format!("fail connect ← {err}")));
            }
        };

        if !self.step(State::Connect, State::Connected, "connected") {
            return Err(Error::Execution("executor state corrupted".into()));
        }

        let request =
            HttpClient::build_request(&self.uri, self.method, self.body.clone(), &self.content_type);

        self.step(State::Connected, State::Submit, "submit");

        let mut connection = Connection::new(socket);
        if let Err(err) = connection.write_request(&request).await {
            return Err(self.fail(format!("fail submit ← {err}")));
        }

        self.step(State::Submit, State::Submitted, "submitted");

        let response = match timeout(self.submit_ttl, connection.read_response()).await {
            Ok(Ok(Some(response))) => response,
            Ok(Ok(None)) => {
                return Err(self.fail("fail processing ← server closed before responding".into()));
            }
            Ok(Err(err)) => {
                return Err(self.fail(format!("fail processing ← {err}")));
            }
            Err(_elapsed) => {
                return Err(self.fail(format!(
                    "fail processing ← no response within {:?}",
                    self.submit_ttl
                )));
            }
        };

        self.step(State::Submitted, State::Complete, "complete");
        // Dropping the connection here releases the socket; the peer
        // was asked to close anyway.
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::StatusCode;
    use crate::server;
    use crate::transport::{self, ServerTransport, TransportConfig};
    use tokio::net::TcpListener;

    async fn spawn_echo_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let t = ServerTransport::new(&TransportConfig::new(format!("exec-{}", addr.port())))
            .unwrap();
        t.bind_handler(
            "/echo",
            transport::handler(|context| async move {
                Ok(HttpResponse::text(StatusCode::OK, context.request.body))
            }),
        )
        .unwrap();
        tokio::spawn(server::run(listener, t, std::future::pending::<()>()));
        format!("127.0.0.1:{}", addr.port())
    }

    #[tokio::test]
    async fn test_post_roundtrip() {
        let addr = spawn_echo_server().await;
        let uri = Uri::parse(&format!("http://{addr}/echo")).unwrap();
        let executor = HttpRequestExecutor::new(uri, Method::Post, "hello", "text/plain");

        let response = executor.execute().await.unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(&response.body[..], b"hello");
        assert_eq!(executor.state(), State::Complete);
        assert!(!executor.has_failed());
        assert!(executor.error().is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_host_fails_with_error() {
        let uri = Uri::parse("http://127.0.0.1:1/x").unwrap();
        let executor = HttpRequestExecutor::new(uri, Method::Get, "", "")
            .with_timeouts(Duration::from_secs(2), Duration::from_secs(2));

        let result = executor.execute().await;
        assert!(result.is_err());
        assert!(executor.has_failed());
        assert!(!executor.error().is_empty());
        assert_eq!(executor.state(), State::Error);
    }

    #[tokio::test]
    async fn test_second_run_is_a_bad_step() {
        let addr = spawn_echo_server().await;
        let uri = Uri::parse(&format!("http://{addr}/echo")).unwrap();
        let executor = HttpRequestExecutor::new(uri, Method::Post, "x", "text/plain");

        executor.execute().await.unwrap();
        // The machine is terminal; a re-run is dropped.
        assert!(executor.execute().await.is_err());
        assert_eq!(executor.state(), State::Complete);
    }

    #[tokio::test]
    async fn test_server_closing_mid_exchange_resumes_once() {
        // A listener that accepts and immediately drops the socket.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else { break };
                drop(socket);
            }
        });

        let uri = Uri::parse(&format!("http://127.0.0.1:{}/x", addr.port())).unwrap();
        let executor = HttpRequestExecutor::new(uri, Method::Get, "", "")
            .with_timeouts(Duration::from_secs(2), Duration::from_secs(2));

        let result = executor.execute().await;
        assert!(result.is_err());
        assert!(executor.has_failed());
    }
}
