//! The Host Gateway: an authenticated HTTP command executor with
//! per-bridge allowlists, path-traversal-safe working-directory
//! validation, timeout supervision, and bounded subprocess I/O (§4.2),
//! plus the client used to reach it from the bridge session manager (§6).

pub mod auth;
pub mod client;
pub mod server;
pub mod types;

pub use client::GatewayClient;
pub use server::{clamp_timeout, create_router, start_server, BridgeConfig, GatewayConfig, GatewayError};
pub use types::{ErrorBody, GatewayRequest, GatewayResult, HealthResponse};
