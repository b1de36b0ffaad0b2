//! HTTP API: routing, bearer authentication and error mapping over the auth service.

pub mod app;
pub mod context;
pub mod middleware;
