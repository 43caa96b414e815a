//! API surface: REST routes and the WebSocket session endpoint.

pub mod rest;
pub mod ws;

pub use rest::router::create_router;
