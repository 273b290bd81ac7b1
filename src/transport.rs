//! Named server transports and their registry.
//!
//! A [`ServerTransport`] ties a set of acceptors (host/port pairs) to a
//! URI routing table. Services bind handlers to path prefixes; at
//! request time the longest bound prefix wins. `enable` spawns the
//! accept loops onto the runtime, `disable` signals them to stop.

use crate::http::{HttpRequest, HttpResponse};
use crate::registry::Registry;
use crate::server;
use crate::telemetry::{self, Metric};
use crate::{Error, Result};
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, LazyLock, Mutex, RwLock};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

/// One listening socket of a transport.
#[derive(Debug, Clone)]
pub struct AcceptorConfig {
    pub host: String,
    pub port: u16,
    /// Reserved for TLS-wrapping transport types; the built-in `http`
    /// type rejects it.
    pub tls: bool,
}

/// Configuration of a transport, dispatched on `kind` through the
/// transport factory.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub name: String,
    /// The `type` discriminator the factory dispatches on.
    pub kind: String,
    pub acceptors: Vec<AcceptorConfig>,
    /// URI prefixes the transport expects to serve; purely
    /// informational until a handler is bound.
    pub bindings: Vec<String>,
    /// Per-transport inbound buffer cap.
    pub inbound_cap: usize,
}

impl TransportConfig {
    pub fn new(name: impl Into<String>) -> Self {
        TransportConfig {
            name: name.into(),
            kind: "http".to_string(),
            acceptors: Vec::new(),
            bindings: Vec::new(),
            inbound_cap: crate::connection::DEFAULT_INBOUND_CAP,
        }
    }

    pub fn acceptor(mut self, host: impl Into<String>, port: u16) -> Self {
        self.acceptors.push(AcceptorConfig {
            host: host.into(),
            port,
            tls: false,
        });
        self
    }
}

/// Per-message view handed to a bound handler.
#[derive(Debug)]
pub struct HttpContext {
    pub request: HttpRequest,
    pub peer: Option<SocketAddr>,
    pub transport: String,
}

impl HttpContext {
    /// Decode the query string through the `uri` serializer.
    pub fn query_input(&self) -> Result<crate::SVal> {
        crate::serialization::create("uri")?.decode(self.request.uri.query())
    }
}

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<HttpResponse>> + Send>>;

/// A message-completion callback bound to a URI prefix.
pub type Handler = Arc<dyn Fn(HttpContext) -> HandlerFuture + Send + Sync>;

/// Wrap an async closure into a [`Handler`].
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(HttpContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<HttpResponse>> + Send + 'static,
{
    Arc::new(move |context| Box::pin(f(context)))
}

/// Accept-loop state of an enabled transport; dropping the broadcast
/// sender tells every loop and in-flight handler to wind down.
#[derive(Debug)]
struct Active {
    notify_shutdown: broadcast::Sender<()>,
    shutdown_complete_rx: mpsc::Receiver<()>,
}

/// A named server transport.
pub struct ServerTransport {
    name: String,
    acceptors: Vec<AcceptorConfig>,
    inbound_cap: usize,
    bindings: RwLock<Vec<(String, Handler)>>,
    active: Mutex<Option<Active>>,
    /// Handle to the owning `Arc`, for spawning accept loops.
    weak_self: std::sync::Weak<ServerTransport>,

    pub metric_connect_count: Arc<Metric>,
    pub metric_request_count: Arc<Metric>,
    pub metric_avg_request_per_sec: Arc<Metric>,
    pub metric_avg_execution_time: Arc<Metric>,
}

impl std::fmt::Debug for ServerTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerTransport")
            .field("name", &self.name)
            .field("acceptors", &self.acceptors)
            .finish_non_exhaustive()
    }
}

impl ServerTransport {
    /// Build from a config; no sockets are bound until `enable`.
    pub fn new(config: &TransportConfig) -> Result<Arc<ServerTransport>> {
        if config.name.is_empty() {
            return Err(Error::Config("field name undefined".into()));
        }
        if let Some(acceptor) = config.acceptors.iter().find(|a| a.tls) {
            return Err(Error::Config(format!(
                "acceptor {}:{} requests tls, which the `http` transport type does not provide",
                acceptor.host, acceptor.port
            )));
        }

        let name = &config.name;
        Ok(Arc::new_cyclic(|weak| ServerTransport {
            name: name.clone(),
            acceptors: config.acceptors.clone(),
            inbound_cap: config.inbound_cap,
            bindings: RwLock::new(Vec::new()),
            active: Mutex::new(None),
            weak_self: weak.clone(),
            metric_connect_count: telemetry::metric_counted(
                &format!("transport/{name}/connections"),
                1,
            ),
            metric_request_count: telemetry::metric_counted(
                &format!("transport/{name}/requests"),
                1,
            ),
            metric_avg_request_per_sec: telemetry::metric_windowed(
                &format!("transport/{name}/requests_per_second"),
                Duration::from_secs(15),
            ),
            metric_avg_execution_time: telemetry::metric_windowed(
                &format!("transport/{name}/requests_exec_time"),
                Duration::from_secs(15),
            ),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn inbound_cap(&self) -> usize {
        self.inbound_cap
    }

    /// Bind `handler` to a URI path prefix.
    ///
    /// Rebinding the same prefix is a configuration error; bindings are
    /// wired once at startup.
    pub fn bind_handler(&self, uri: &str, handler: Handler) -> Result<()> {
        let path = uri.trim();
        if path.is_empty() || !path.starts_with('/') {
            return Err(Error::Config(format!("can't bind bad uri `{uri}`")));
        }
        let mut bindings = self.bindings.write().unwrap();
        if bindings.iter().any(|(bound, _)| bound == path) {
            return Err(Error::Config(format!("uri `{path}` is already bound")));
        }
        bindings.push((path.to_string(), handler));
        // Longest prefix first, so lookup can take the first match.
        bindings.sort_by(|(a, _), (b, _)| b.len().cmp(&a.len()));
        debug!(transport = %self.name, %path, "handler bound");
        Ok(())
    }

    /// Longest-prefix handler lookup for a request path.
    pub fn find_handler(&self, path: &str) -> Option<Handler> {
        let bindings = self.bindings.read().unwrap();
        bindings
            .iter()
            .find(|(prefix, _)| path.starts_with(prefix.as_str()))
            .map(|(_, handler)| handler.clone())
    }

    /// Bind the acceptors and spawn their accept loops.
    ///
    /// Idempotent: an already enabled transport stays as it is.
    pub async fn enable(&self) -> Result<()> {
        {
            let active = self.active.lock().unwrap();
            if active.is_some() {
                debug!(transport = %self.name, "transport already enabled");
                return Ok(());
            }
        }

        // An `enable` call implies a live `Arc` somewhere.
        let this = self.weak_self.upgrade().ok_or_else(|| {
            Error::Config(format!("transport `{}` is being dropped", self.name))
        })?;

        let (notify_shutdown, _) = broadcast::channel(1);
        let (shutdown_complete_tx, shutdown_complete_rx) = mpsc::channel(1);

        for acceptor in &self.acceptors {
            let addr = format!("{}:{}", acceptor.host, acceptor.port);
            let listener = TcpListener::bind(&addr).await.map_err(|e| {
                Error::Config(format!("can't bind acceptor on {addr}: {e}"))
            })?;
            info!(transport = %self.name, %addr, "acceptor bound");
            tokio::spawn(server::serve(
                listener,
                this.clone(),
                notify_shutdown.clone(),
                shutdown_complete_tx.clone(),
            ));
        }

        let mut active = self.active.lock().unwrap();
        *active = Some(Active {
            notify_shutdown,
            shutdown_complete_rx,
        });
        Ok(())
    }

    /// Signal the accept loops to stop. In-flight handlers finish
    /// their current message first.
    pub fn disable(&self) {
        let mut active = self.active.lock().unwrap();
        if let Some(active) = active.take() {
            info!(transport = %self.name, "transport disabled");
            drop(active.notify_shutdown);
            // The completion receiver drops here; loops notice the
            // closed channel as they exit.
            drop(active.shutdown_complete_rx);
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.active.lock().unwrap().is_some()
    }

    /// Disable and wait until every accept loop and in-flight handler
    /// of this transport has wound down.
    pub async fn disable_and_drain(&self) {
        let taken = {
            let mut active = self.active.lock().unwrap();
            active.take()
        };
        if let Some(active) = taken {
            info!(transport = %self.name, "transport disabled, draining");
            drop(active.notify_shutdown);
            let mut rx = active.shutdown_complete_rx;
            let _ = rx.recv().await;
        }
    }
}

type TransportCreator = Arc<dyn Fn(&TransportConfig) -> Result<Arc<ServerTransport>> + Send + Sync>;

/// The transport registry plus the `type`-keyed factory behind
/// [`Transports::add`].
pub struct Transports {
    factory: Registry<TransportCreator>,
    registry: Registry<Arc<ServerTransport>>,
}

impl Default for Transports {
    fn default() -> Self {
        Self::new()
    }
}

impl Transports {
    /// A registry with the built-in `http` type registered.
    pub fn new() -> Self {
        let transports = Transports {
            factory: Registry::new(),
            registry: Registry::new(),
        };
        let _ = transports
            .factory
            .register("http", Arc::new(ServerTransport::new) as TransportCreator);
        transports
    }

    /// Register a transport type constructor (first write wins).
    pub fn register_type(&self, kind: &str, creator: TransportCreator) -> Result<()> {
        self.factory.register(kind, creator)
    }

    /// Construct a transport from `config` via the factory and
    /// register it under its name.
    pub fn add(&self, config: &TransportConfig) -> Result<Arc<ServerTransport>> {
        let creator = self.factory.get(&config.kind).ok_or_else(|| {
            Error::Config(format!("unknown transport type `{}`", config.kind))
        })?;
        let transport = creator(config)?;
        self.registry
            .register(transport.name().to_string(), transport.clone())?;
        Ok(transport)
    }

    pub fn get(&self, name: &str) -> Option<Arc<ServerTransport>> {
        self.registry.get(name)
    }

    /// Disable and drop a transport.
    pub fn del(&self, name: &str) {
        if let Some(transport) = self.registry.remove(name) {
            transport.disable();
        }
    }

    pub async fn enable(&self, name: &str) -> Result<()> {
        match self.get(name) {
            Some(transport) => transport.enable().await,
            None => Ok(()),
        }
    }

    pub fn disable(&self, name: &str) {
        if let Some(transport) = self.get(name) {
            transport.disable();
        }
    }

    pub async fn enable_all(&self) -> Result<()> {
        for name in self.registry.keys() {
            self.enable(&name).await?;
        }
        Ok(())
    }

    pub fn disable_all(&self) {
        for name in self.registry.keys() {
            self.disable(&name);
        }
    }

    /// Visit every registered transport, name-ordered.
    pub fn for_each(&self, mut visit: impl FnMut(&Arc<ServerTransport>)) {
        self.registry.for_each(|_, transport| visit(transport));
    }
}

static GLOBAL: LazyLock<Transports> = LazyLock::new(Transports::new);

/// The process-wide transport registry.
pub fn transports() -> &'static Transports {
    &GLOBAL
}

/// Telemetry writes on the request path of a transport.
pub(crate) fn note_request(transport: &ServerTransport) {
    transport.metric_request_count.add_value(1.0);
    transport.metric_avg_request_per_sec.add_value(1.0);
}

pub(crate) fn note_execution(transport: &ServerTransport, elapsed: Duration) {
    transport
        .metric_avg_execution_time
        .add_value(elapsed.as_secs_f64());
}

pub(crate) fn note_connection(transport: &ServerTransport, delta: f64) {
    transport.metric_connect_count.add_value(delta);
    if delta > 0.0 {
        debug!(transport = %transport.name, "connection admitted");
    }
}

/// Warn-and-drop for handlers that panic or misbehave; keeps one bad
/// connection from affecting the accept loop.
pub(crate) fn note_handler_failure(transport: &ServerTransport, cause: &Error) {
    warn!(transport = %transport.name, %cause, "handler failed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::StatusCode;

    fn noop_handler() -> Handler {
        handler(|_context| async { Ok(HttpResponse::text(StatusCode::OK, "ok")) })
    }

    #[test]
    fn test_longest_prefix_routing() {
        let transport =
            ServerTransport::new(&TransportConfig::new("t-route")).unwrap();
        transport.bind_handler("/", noop_handler()).unwrap();
        transport.bind_handler("/api", noop_handler()).unwrap();
        transport.bind_handler("/api/deep", noop_handler()).unwrap();

        let bindings = transport.bindings.read().unwrap();
        let prefixes: Vec<_> = bindings.iter().map(|(p, _)| p.as_str()).collect();
        assert_eq!(prefixes, ["/api/deep", "/api", "/"]);
        drop(bindings);

        assert!(transport.find_handler("/api/deep/x").is_some());
        assert!(transport.find_handler("/nowhere").is_some()); // root catches all
    }

    #[test]
    fn test_no_binding_no_handler() {
        let transport =
            ServerTransport::new(&TransportConfig::new("t-none")).unwrap();
        transport.bind_handler("/only", noop_handler()).unwrap();
        assert!(transport.find_handler("/other").is_none());
    }

    #[test]
    fn test_rebinding_is_error() {
        let transport =
            ServerTransport::new(&TransportConfig::new("t-rebind")).unwrap();
        transport.bind_handler("/x", noop_handler()).unwrap();
        assert!(transport.bind_handler("/x", noop_handler()).is_err());
        assert!(transport.bind_handler("no-slash", noop_handler()).is_err());
    }

    #[test]
    fn test_registry_dispatches_on_type() {
        let transports = Transports::new();
        let config = TransportConfig::new("t-add");
        let transport = transports.add(&config).unwrap();
        assert_eq!(transport.name(), "t-add");
        assert!(transports.get("t-add").is_some());

        // Duplicate name rejected.
        assert!(transports.add(&config).is_err());

        let mut unknown = TransportConfig::new("t-unknown");
        unknown.kind = "quic".to_string();
        assert!(transports.add(&unknown).is_err());
    }

    #[test]
    fn test_tls_rejected_by_http_type() {
        let mut config = TransportConfig::new("t-tls");
        config.acceptors.push(AcceptorConfig {
            host: "127.0.0.1".into(),
            port: 443,
            tls: true,
        });
        assert!(ServerTransport::new(&config).is_err());
    }

    #[test]
    fn test_for_each_sees_all() {
        let transports = Transports::new();
        transports.add(&TransportConfig::new("b")).unwrap();
        transports.add(&TransportConfig::new("a")).unwrap();
        let mut names = Vec::new();
        transports.for_each(|t| names.push(t.name().to_string()));
        assert_eq!(names, ["a", "b"]);
    }
}
