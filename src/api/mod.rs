//! HTTP API Module
//!
//! Combines the cluster RPC wire protocol ([`crate::cluster::api`]) and the
//! driver REST surface ([`http`]) into one axum router, nested under their
//! configured base paths.

mod http;

pub use http::router as driver_router;
