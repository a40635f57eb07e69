//! The Host Gateway HTTP server: authenticate, validate, execute, respond.
//! No business logic beyond allowlist enforcement (§4.2).

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use thiserror::Error;
use tokio::net::TcpListener;

use super::auth::{constant_time_eq, extract_bearer};
use super::types::{ErrorBody, GatewayRequest, GatewayResult, HealthResponse};

/// Maximum accepted request body size, per §4.2 point 2 / §8 boundary test.
pub const MAX_BODY_BYTES: usize = 1_048_576;

/// Environment variables stripped from every spawned subprocess so the
/// invoked tool cannot believe it is itself running inside a recursive
/// invocation (§4.2).
pub const DEFAULT_RECURSION_GUARD_VARS: [&str; 2] =
    ["CLAUDE_CODE_ENTRYPOINT", "CIANAPARROT_BRIDGE_DEPTH"];

/// A single named bridge's allowlists, resolved at load time.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Permitted `argv[0]` basenames.
    pub allowed_commands: HashSet<String>,
    /// Real, canonicalized allowed working-directory prefixes. An empty
    /// list forbids every `cwd` supplied in a request (Open Question 1 in
    /// `DESIGN.md`): omitting `cwd` entirely is still unrestricted.
    pub allowed_cwd: Vec<PathBuf>,
}

/// The gateway server's full configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// The bearer token required on every request. Empty tokens are
    /// rejected at construction, not at request time.
    pub token: String,
    /// Named bridges.
    pub bridges: HashMap<String, BridgeConfig>,
    /// Fallback timeout in seconds, used when a request supplies none.
    pub default_timeout: u64,
    /// Environment variable names stripped before spawning.
    pub recursion_guard_vars: Vec<String>,
}

/// Errors constructing a [`GatewayConfig`].
#[derive(Debug, Error)]
pub enum GatewayConfigError {
    /// No token, or an empty token, was configured.
    #[error("gateway.token must be a non-empty value")]
    MissingToken,
}

impl GatewayConfig {
    /// Validates that the token is present and non-empty, per "a
    /// missing/empty configured token aborts server startup" (§4.2).
    pub fn validate(&self) -> Result<(), GatewayConfigError> {
        if self.token.trim().is_empty() {
            return Err(GatewayConfigError::MissingToken);
        }
        Ok(())
    }
}

/// Errors produced during the validation pipeline or execution, each
/// carrying its own HTTP status per the §6 wire contract.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Missing or incorrect bearer token.
    #[error("unauthorized")]
    Unauthorized,
    /// Body exceeded [`MAX_BODY_BYTES`].
    #[error("request body too large")]
    TooLarge,
    /// Body was not valid JSON, or `argv` was empty.
    #[error("bad request: {reason}")]
    BadRequest {
        /// Why the request was rejected.
        reason: String,
    },
    /// Unknown bridge, disallowed command basename, or disallowed cwd.
    #[error("forbidden: {reason}")]
    Forbidden {
        /// Why the request was rejected.
        reason: String,
    },
    /// The subprocess could not be spawned for a reason other than "not
    /// found" (e.g. permission denied).
    #[error("spawn error: {reason}")]
    SpawnError {
        /// A description of the spawn failure.
        reason: String,
    },
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = match &self {
            GatewayError::Unauthorized => StatusCode::UNAUTHORIZED,
            GatewayError::TooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            GatewayError::BadRequest { .. } => StatusCode::BAD_REQUEST,
            GatewayError::Forbidden { .. } => StatusCode::FORBIDDEN,
            GatewayError::SpawnError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(ErrorBody { error: self.to_string() })).into_response()
    }
}

fn authenticate(config: &GatewayConfig, headers: &HeaderMap) -> Result<(), GatewayError> {
    let presented = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(extract_bearer)
        .unwrap_or_default();
    if constant_time_eq(config.token.as_bytes(), presented.as_bytes()) {
        Ok(())
    } else {
        Err(GatewayError::Unauthorized)
    }
}

fn resolve_bridge<'a>(
    config: &'a GatewayConfig,
    name: &str,
) -> Result<&'a BridgeConfig, GatewayError> {
    config.bridges.get(name).ok_or_else(|| GatewayError::Forbidden {
        reason: format!(
            "unknown bridge '{name}'; known bridges: {}",
            config.bridges.keys().cloned().collect::<Vec<_>>().join(", ")
        ),
    })
}

fn validate_argv(bridge: &BridgeConfig, argv: &[String]) -> Result<(), GatewayError> {
    let Some(first) = argv.first() else {
        return Err(GatewayError::BadRequest {
            reason: "cmd must not be empty".into(),
        });
    };
    let basename = Path::new(first)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(first);
    if bridge.allowed_commands.contains(basename) {
        Ok(())
    } else {
        Err(GatewayError::Forbidden {
            reason: format!("command '{basename}' not allowed for this bridge"),
        })
    }
}

/// Resolves `cwd` against the bridge's allowlist per §4.2 point 6 / Open
/// Question 1. A `None` cwd always passes. A `Some` cwd must canonicalize to
/// a path equal to, or a descendant of, one of `allowed_cwd`.
fn validate_cwd(bridge: &BridgeConfig, cwd: Option<&str>) -> Result<Option<PathBuf>, GatewayError> {
    let Some(requested) = cwd else {
        return Ok(None);
    };
    let real = std::fs::canonicalize(requested).map_err(|_| GatewayError::Forbidden {
        reason: "cwd not allowed".into(),
    })?;
    let allowed = bridge
        .allowed_cwd
        .iter()
        .any(|prefix| real == *prefix || real.starts_with(prefix));
    if allowed {
        Ok(Some(real))
    } else {
        Err(GatewayError::Forbidden {
            reason: "cwd not allowed".into(),
        })
    }
}

/// Clamps a requested timeout per §4.2 point 7: `0` means "no limit" and is
/// passed through; any positive value is clamped to 600.
#[must_use]
pub fn clamp_timeout(requested: Option<u64>, default_timeout: u64) -> u64 {
    match requested {
        None => default_timeout.min(600),
        Some(0) => 0,
        Some(secs) => secs.min(600),
    }
}

async fn execute_subprocess(
    argv: &[String],
    cwd: Option<&Path>,
    timeout_secs: u64,
    recursion_guard_vars: &[String],
) -> Result<GatewayResult, GatewayError> {
    let mut command = tokio::process::Command::new(&argv[0]);
    command
        .args(&argv[1..])
        .kill_on_drop(true)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped());
    for var in recursion_guard_vars {
        command.env_remove(var);
    }
    if let Some(cwd) = cwd {
        command.current_dir(cwd);
    }

    let child = match command.spawn() {
        Ok(child) => child,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(GatewayResult {
                stdout: String::new(),
                stderr: format!("{}: command not found", argv[0]),
                returncode: 127,
                error: None,
            });
        }
        Err(err) => {
            return Err(GatewayError::SpawnError {
                reason: err.to_string(),
            });
        }
    };

    let wait = child.wait_with_output();
    if timeout_secs == 0 {
        let output = wait.await.map_err(|err| GatewayError::SpawnError {
            reason: err.to_string(),
        })?;
        return Ok(output_to_result(&output));
    }

    match tokio::time::timeout(Duration::from_secs(timeout_secs), wait).await {
        Ok(Ok(output)) => Ok(output_to_result(&output)),
        Ok(Err(err)) => Err(GatewayError::SpawnError {
            reason: err.to_string(),
        }),
        Err(_elapsed) => Ok(GatewayResult {
            stdout: String::new(),
            stderr: "Command timed out".into(),
            returncode: -1,
            error: None,
        }),
    }
}

fn output_to_result(output: &std::process::Output) -> GatewayResult {
    GatewayResult {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        returncode: output.status.code().unwrap_or(-1),
        error: None,
    }
}

#[derive(Clone)]
struct GatewayState {
    config: Arc<GatewayConfig>,
}

async fn health_handler(State(state): State<GatewayState>) -> impl IntoResponse {
    let mut bridges: Vec<String> = state.config.bridges.keys().cloned().collect();
    bridges.sort();
    Json(HealthResponse {
        status: "ok".into(),
        bridges,
    })
}

// Takes the raw `Request` rather than a body-consuming extractor (`Bytes`,
// `Json`) so the body is never buffered before `handle_execute` gets a
// chance to authenticate first, per the validation pipeline's order
// (§4.2: authenticate, *then* reject oversized bodies).
async fn execute_handler(State(state): State<GatewayState>, request: axum::extract::Request) -> Response {
    let (parts, body) = request.into_parts();
    match handle_execute(&state.config, &parts.headers, body).await {
        Ok(result) => (StatusCode::OK, Json(result)).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn handle_execute(
    config: &GatewayConfig,
    headers: &HeaderMap,
    body: axum::body::Body,
) -> Result<GatewayResult, GatewayError> {
    authenticate(config, headers)?;

    // Read at most one byte past the cap: a drastically oversized body is
    // never fully buffered in memory, and exactly `MAX_BODY_BYTES` is still
    // accepted.
    let body = axum::body::to_bytes(body, MAX_BODY_BYTES + 1)
        .await
        .map_err(|_| GatewayError::TooLarge)?;
    if body.len() > MAX_BODY_BYTES {
        return Err(GatewayError::TooLarge);
    }

    let request: GatewayRequest =
        serde_json::from_slice(&body).map_err(|err| GatewayError::BadRequest {
            reason: err.to_string(),
        })?;
    let bridge = resolve_bridge(config, &request.bridge)?;
    validate_argv(bridge, &request.argv)?;
    let cwd = validate_cwd(bridge, request.cwd.as_deref())?;
    let timeout_secs = clamp_timeout(request.timeout, config.default_timeout);
    tracing::info!(bridge = %request.bridge, argv0 = %request.argv[0], "gateway executing command");
    execute_subprocess(
        &request.argv,
        cwd.as_deref(),
        timeout_secs,
        &config.recursion_guard_vars,
    )
    .await
}

/// Builds the gateway's axum router.
#[must_use]
pub fn create_router(config: GatewayConfig) -> Router {
    let state = GatewayState {
        config: Arc::new(config),
    };
    Router::new()
        .route("/health", get(health_handler))
        .route("/execute", post(execute_handler))
        .with_state(state)
}

/// Binds a listener on `addr` and returns it alongside the router, without
/// serving yet (mirrors the teacher's split start/serve pattern so tests can
/// bind an OS-assigned port).
pub async fn start_server(
    config: GatewayConfig,
    addr: SocketAddr,
) -> Result<(TcpListener, SocketAddr, Router), std::io::Error> {
    config
        .validate()
        .map_err(|err| std::io::Error::other(err.to_string()))?;
    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    let router = create_router(config);
    Ok((listener, local_addr, router))
}

/// Serves `router` on `listener` until the process is killed.
pub async fn serve(listener: TcpListener, router: Router) -> Result<(), std::io::Error> {
    axum::serve(listener, router).await
}

/// Serves `router` on `listener` until `shutdown` resolves, then drains
/// in-flight requests before returning.
pub async fn serve_with_graceful_shutdown(
    listener: TcpListener,
    router: Router,
    shutdown: tokio_util::sync::CancellationToken,
) -> Result<(), std::io::Error> {
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}
