//! Core of an application-server framework.
//!
//! forja provides buffered connections with an HTTP/1.1 codec, named
//! server transports routing URI prefixes to handlers, an outbound HTTP
//! request executor, sliding-window telemetry behind a live status
//! endpoint, a database connection pool with per-task capture affinity,
//! sessions with counter/limit/generator containers, and write-once
//! factory registries.

pub mod application;
pub mod client;
pub mod compression;
pub mod connection;
pub mod db;
pub mod error;
pub mod executor;
pub mod http;
pub mod mechanics;
pub mod registry;
pub mod serialization;
pub mod server;
pub mod service;
pub mod session;
pub mod sobj;
pub mod status;
pub mod telemetry;
pub mod transport;
pub mod uri;

pub use connection::Connection;
pub use error::Error;
pub use http::{HttpRequest, HttpResponse, Method, StatusCode, Version};
pub use sobj::{SObj, SVal};
pub use uri::Uri;

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_HOST: &str = "0.0.0.0";

pub type Result<T> = std::result::Result<T, crate::error::Error>;
