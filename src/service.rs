//! Services: named action tables dispatching structured requests.
//!
//! An inbound message is a value tree carrying a `request` name, an
//! auxiliary `_` block with the request id and confirmation counters,
//! and a `data` payload. Dispatch resolves the action by name, runs
//! it, and formats the reply envelope; every step is counted in
//! telemetry under `<svc>/<action>/…`.

use crate::http::{HttpResponse, Method, StatusCode};
use crate::registry::Registry;
use crate::telemetry;
use crate::transport::{self, ServerTransport};
use crate::{Error, Result, SObj, SVal};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// One decoded request on its way to an action.
#[derive(Debug)]
pub struct Action {
    name: String,
    request_id: i64,
    last_confirmed_response: i64,
    last_confirmed_event: i64,
    data: SVal,
    answer_sent: bool,
}

impl Action {
    /// Pull the action name, auxiliary block and payload out of the
    /// input tree.
    pub fn new(input: SVal) -> Result<Action> {
        let mut input = input
            .into_object()
            .map_err(|_| Error::Handler("input data isn't an object".into()))?;

        let name = input
            .get_str("request")
            .map(str::to_string)
            .ok_or_else(|| Error::Handler("request name undefined".into()))?;

        let mut request_id = 0;
        let mut last_confirmed_response = 0;
        let mut last_confirmed_event = 0;
        if let Some(aux) = input.get("_").as_object() {
            aux.try_lookup_int("ri", &mut request_id);
            aux.try_lookup_int("cr", &mut last_confirmed_response);
            aux.try_lookup_int("ce", &mut last_confirmed_event);
        }

        let data = input.extract("data");

        Ok(Action {
            name,
            request_id,
            last_confirmed_response,
            last_confirmed_event,
            data,
            answer_sent: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn request_id(&self) -> i64 {
        self.request_id
    }

    pub fn last_confirmed_response(&self) -> i64 {
        self.last_confirmed_response
    }

    pub fn last_confirmed_event(&self) -> i64 {
        self.last_confirmed_event
    }

    pub fn data(&self) -> &SVal {
        &self.data
    }

    fn aux(&self) -> Option<SObj> {
        if self.request_id == 0 {
            return None;
        }
        let mut aux = SObj::new();
        aux.emplace("ri", self.request_id);
        Some(aux)
    }

    /// Build the success envelope. Answering twice is an internal
    /// error.
    pub fn response(&mut self, data: SVal) -> Result<SObj> {
        if self.answer_sent {
            return Err(Error::Handler("answer already sent".into()));
        }
        self.answer_sent = true;

        let mut envelope = SObj::new();
        if let Some(aux) = self.aux() {
            envelope.emplace("_", aux);
        }
        envelope.emplace("response", self.name.as_str());
        if !data.is_null() {
            envelope.emplace("data", data);
        }
        Ok(envelope)
    }

    /// Build the error envelope.
    pub fn error(&mut self, message: &str, data: SVal) -> Result<SObj> {
        if self.answer_sent {
            return Err(Error::Handler("answer already sent".into()));
        }
        self.answer_sent = true;

        let mut envelope = SObj::new();
        if let Some(aux) = self.aux() {
            envelope.emplace("_", aux);
        }
        envelope.emplace("error", self.name.as_str());
        envelope.emplace("message", message);
        if !data.is_null() {
            envelope.emplace("data", data);
        }
        Ok(envelope)
    }
}

type ActionFuture = Pin<Box<dyn Future<Output = Result<SVal>> + Send>>;

/// Business logic of one action: payload in, payload out.
pub type ActionHandler = Arc<dyn Fn(SVal) -> ActionFuture + Send + Sync>;

/// Wrap an async closure into an [`ActionHandler`].
pub fn action<F, Fut>(f: F) -> ActionHandler
where
    F: Fn(SVal) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<SVal>> + Send + 'static,
{
    Arc::new(move |data| Box::pin(f(data)))
}

/// A named action table.
pub struct Service {
    name: String,
    actions: Registry<ActionHandler>,
    /// Handle to the owning `Arc`, for handler closures.
    weak_self: std::sync::Weak<Service>,
}

impl Service {
    pub fn new(name: impl Into<String>) -> Arc<Service> {
        Arc::new_cyclic(|weak| Service {
            name: name.into(),
            actions: Registry::new(),
            weak_self: weak.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register an action (first write wins).
    pub fn register_action(&self, name: &str, handler: ActionHandler) -> Result<()> {
        self.actions.register(name, handler)
    }

    fn count(&self, action: &str, which: &str) {
        telemetry::metric_counted(&format!("{}/{action}/{which}", self.name), 1).add_value(1.0);
    }

    /// Dispatch one decoded input to its action and produce the reply
    /// envelope.
    pub async fn dispatch(&self, input: SVal) -> SObj {
        let mut action = match Action::new(input) {
            Ok(action) => action,
            Err(err) => {
                self.count("_unparsed", "invalid");
                warn!(service = %self.name, %err, "invalid request");
                let mut envelope = SObj::new();
                envelope.emplace("status", false);
                envelope.emplace("message", err.to_string());
                return envelope;
            }
        };

        let name = action.name().to_string();
        self.count(&name, "count");
        telemetry::metric_windowed(
            &format!("{}/{name}/avg_per_sec", self.name),
            Duration::from_secs(15),
        )
        .add_value(1.0);

        let Some(handler) = self.actions.get(&name) else {
            self.count(&name, "invalid");
            debug!(service = %self.name, action = %name, "unknown action");
            return action
                .error("unknown action", SVal::Null)
                .unwrap_or_default();
        };

        let started = Instant::now();
        let outcome = handler(action.data().clone()).await;
        telemetry::metric_windowed(
            &format!("{}/{name}/avg_exec_time", self.name),
            Duration::from_secs(15),
        )
        .add_value(started.elapsed().as_secs_f64());

        match outcome {
            Ok(data) => {
                self.count(&name, "success");
                action.response(data).unwrap_or_default()
            }
            Err(err) => {
                self.count(&name, "fail");
                warn!(service = %self.name, action = %name, %err, "action failed");
                action
                    .error(&err.to_string(), SVal::Null)
                    .unwrap_or_default()
            }
        }
    }

    /// Bind this service to a transport URI.
    ///
    /// POST bodies are decoded as JSON; GET requests read their input
    /// from the query string. The reply envelope goes back as JSON.
    pub fn bind_to_transport(&self, transport: &ServerTransport, uri: &str) -> Result<()> {
        let service = self.weak_self.upgrade().ok_or_else(|| {
            Error::Config(format!("service `{}` is being dropped", self.name))
        })?;
        transport.bind_handler(
            uri,
            transport::handler(move |context| {
                let service = service.clone();
                async move {
                    let input = if context.request.method == Method::Post
                        && !context.request.body.is_empty()
                    {
                        let body = std::str::from_utf8(&context.request.body)
                            .map_err(|e| Error::Protocol(format!("bad request body: {e}")))?;
                        crate::serialization::create("json")?.decode(body)?
                    } else {
                        context.query_input()?
                    };

                    let envelope = service.dispatch(input).await;
                    let body =
                        crate::serialization::create("json")?.encode(&SVal::Object(envelope))?;
                    Ok(HttpResponse::json(StatusCode::OK, body))
                }
            }),
        )
    }
}
