//! Custom actix-web middleware.
//!
//! Request logging is handled by `tracing_actix_web::TracingLogger`, which
//! opens a span per request so that everything logged while handling it
//! carries the request id.

pub mod metrics;

pub use metrics::MetricsMiddleware;
