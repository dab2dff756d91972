//! RouterX: a multi-tenant LLM gateway.
//!
//! One OpenAI-shaped HTTP surface in front of heterogeneous upstream model
//! providers. The request pipeline is admission → model resolution →
//! candidate planning → dispatch (circuit-guarded, with transparent
//! failover) → streaming bridge → accounting. Durable state, volatile
//! counters, and metrics sit behind the [`store::Store`], [`cache::Cache`],
//! and [`metrics::MetricsSink`] ports.

pub mod accounting;
pub mod cache;
pub mod circuit;
pub mod config;
pub mod error;
pub mod http;
pub mod limiter;
pub mod metrics;
pub mod observability;
pub mod providers;
pub mod router;
pub mod store;
pub mod types;
pub mod util;

pub use error::GatewayError;
