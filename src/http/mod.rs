//! HTTP surface: the gate as axum middleware and the server hosting it.

mod middleware;
mod server;

pub use middleware::{admission_gate, failure, gated, rejection};
pub use server::{app, HttpServer};
