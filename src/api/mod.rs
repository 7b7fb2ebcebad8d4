//! HTTP API Module

mod http;

pub use http::{router, AppState};
