//! `offline-gateway` emulates a managed API gateway on a developer machine.
//!
//! Declared HTTP events become live routes; every request is turned into the event a serverless
//! backend would receive, the matching handler is invoked in-process, and its result (or failure)
//! is shaped back into an HTTP response the way the gateway would.
//!
//! Core modules:
//! - [`jsonpath`], [`util`], [`context`]: the data model exposed to mapping templates
//! - [`vtl`]: the mapping-template interpreter
//! - [`templates`]: per-route request/response template resolution
//! - [`routes`], [`cors`]: route table construction and matching
//! - [`handler`]: handler resolution with invalidate-and-reload
//! - [`invoke`], [`requests`], [`response`]: the per-request invocation lifecycle
//! - [`server`]: axum wiring

pub mod config;
pub mod context;
pub mod cors;
pub mod error;
pub mod handler;
pub mod invoke;
pub mod jsonpath;
pub mod requests;
pub mod response;
pub mod routes;
pub(crate) mod serde_ext;
pub mod server;
pub mod service;
pub mod templates;
pub mod util;
pub mod vtl;

pub use offline_handler::{HandlerError, InvocationInfo, ProxyResponse};
