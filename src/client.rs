//! Outbound connections: the connector and a thin HTTP client.

use crate::http::{HttpRequest, HttpResponse, Method};
use crate::uri::{Scheme, Uri};
use crate::{Connection, Error, Result};
use bytes::Bytes;
use std::time::Duration;
use tokio::net::{lookup_host, TcpStream};
use tokio::time::timeout;
use tracing::{debug, warn};

/// Default cap on establishing an outbound connection.
pub const CONNECT_TTL: Duration = Duration::from_secs(15);

/// Resolves a host and tries each candidate address in turn.
///
/// A per-address failure rotates to the next address; only when the
/// whole list is exhausted (or the TTL fires) does the connector fail,
/// and it fails exactly once.
#[derive(Debug, Clone)]
pub struct Connector {
    host: String,
    port: u16,
    ttl: Duration,
}

impl Connector {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Connector {
            host: host.into(),
            port,
            ttl: CONNECT_TTL,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Resolve and connect.
    pub async fn connect(&self) -> Result<TcpStream> {
        match timeout(self.ttl, self.try_candidates()).await {
            Ok(result) => result,
            Err(_elapsed) => Err(Error::Timeout(format!(
                "connect to {}:{} did not finish within {:?}",
                self.host, self.port, self.ttl
            ))),
        }
    }

    async fn try_candidates(&self) -> Result<TcpStream> {
        let addrs = lookup_host((self.host.as_str(), self.port)).await?;

        let mut last_error: Option<std::io::Error> = None;
        for addr in addrs {
            debug!(%addr, "connecting");
            match TcpStream::connect(addr).await {
                Ok(socket) => return Ok(socket),
                Err(err) => {
                    warn!(%addr, %err, "connect failed, rotating to next address");
                    last_error = Some(err);
                }
            }
        }

        Err(match last_error {
            Some(err) => Error::Io(err),
            None => Error::ConnectionClosed(format!(
                "no addresses resolved for {}:{}",
                self.host, self.port
            )),
        })
    }
}

/// Established connection with an HTTP server.
///
/// Backed by a single `TcpStream`, `HttpClient` provides basic request
/// execution (no pooling, retrying, ...).
#[derive(Debug)]
pub struct HttpClient {
    /// The TCP connection decorated with the HTTP encoder / decoder,
    /// implemented using a buffered `TcpStream`.
    connection: Connection<TcpStream>,
}

impl HttpClient {
    /// Connect to the authority of `uri`.
    pub async fn connect(uri: &Uri) -> Result<HttpClient> {
        if !matches!(uri.scheme(), Scheme::Http | Scheme::Undefined) {
            return Err(Error::Config(format!(
                "http client can't speak to `{uri}`"
            )));
        }
        if uri.is_secure() {
            return Err(Error::Config(
                "no tls connector is configured for https".into(),
            ));
        }

        let port = if uri.port() == 0 { 80 } else { uri.port() };
        let socket = Connector::new(uri.host(), port).connect().await?;
        Ok(HttpClient {
            connection: Connection::new(socket),
        })
    }

    /// Build the wire request for `uri` the way the executor submits
    /// it: explicit `Host`, `Connection: close`, body only for POST.
    pub fn build_request(
        uri: &Uri,
        method: Method,
        body: impl Into<Bytes>,
        content_type: &str,
    ) -> HttpRequest {
        let mut request = HttpRequest::new(method, uri.clone());
        request
            .headers
            .set("Host", format!("{}:{}", uri.host(), uri.port()));
        request.headers.set("Connection", "close");
        if method == Method::Post {
            if !content_type.is_empty() {
                request.headers.set("Content-Type", content_type);
            }
            request.body = body.into();
        }
        request
    }

    /// Submit a request and wait for its response.
    #[tracing::instrument(skip_all, fields(path = %request.uri.path()))]
    pub async fn execute(&mut self, request: &HttpRequest) -> Result<HttpResponse> {
        self.connection.write_request(request).await?;
        match self.connection.read_response().await? {
            Some(response) => Ok(response),
            None => Err(Error::ConnectionClosed(
                "server closed before responding".into(),
            )),
        }
    }

    /// One-shot GET of `uri`.
    pub async fn get(uri: &Uri) -> Result<HttpResponse> {
        let mut client = HttpClient::connect(uri).await?;
        let request = HttpClient::build_request(uri, Method::Get, Bytes::new(), "");
        client.execute(&request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_request_shape() {
        let uri = Uri::parse("http://example.com:8080/api/x?q=1").unwrap();
        let request =
            HttpClient::build_request(&uri, Method::Post, "payload", "application/json");
        assert_eq!(request.headers.get("host"), Some("example.com:8080"));
        assert_eq!(request.headers.get("connection"), Some("close"));
        assert_eq!(request.headers.get("content-type"), Some("application/json"));
        assert_eq!(&request.body[..], b"payload");

        let wire = request.encode();
        let text = std::str::from_utf8(&wire).unwrap();
        assert!(text.starts_with("POST /api/x?q=1 HTTP/1.1\r\n"));
        assert!(text.contains("Content-Length: 7\r\n"));
    }

    #[test]
    fn test_get_request_has_no_body() {
        let uri = Uri::parse("http://example.com/").unwrap();
        let request = HttpClient::build_request(&uri, Method::Get, "ignored", "");
        assert!(request.body.is_empty());
    }

    #[tokio::test]
    async fn test_connector_fails_exactly_once_when_exhausted() {
        // Port 1 on loopback is essentially never listening; every
        // resolved address fails and the connector errors once.
        let connector =
            Connector::new("127.0.0.1", 1).with_ttl(Duration::from_secs(5));
        let result = connector.connect().await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_connector_ttl() {
        // A blackhole address (TEST-NET-1) never answers the SYN.
        let connector =
            Connector::new("192.0.2.1", 81).with_ttl(Duration::from_millis(100));
        match connector.connect().await {
            Err(Error::Timeout(msg)) => assert!(!msg.is_empty()),
            Err(Error::Io(_)) => {} // some environments reject fast instead
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_https_needs_tls_connector() {
        let uri = Uri::parse("https://example.com/").unwrap();
        assert!(matches!(
            HttpClient::connect(&uri).await,
            Err(Error::Config(_))
        ));
    }
}
