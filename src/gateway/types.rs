//! Wire types shared by the gateway server and client (§6 stable contract).

use serde::{Deserialize, Serialize};

/// A request to execute a command through an allowlisted bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayRequest {
    /// The bridge to execute under.
    pub bridge: String,
    /// The argv vector; `cmd[0]` is the command, the rest are arguments.
    #[serde(rename = "cmd")]
    pub argv: Vec<String>,
    /// An optional working directory override.
    #[serde(default)]
    pub cwd: Option<String>,
    /// An optional timeout in seconds. `0` or absent means "use the
    /// server's default", which is itself clamped to `[0, 600]`.
    #[serde(default)]
    pub timeout: Option<u64>,
}

/// The result of executing a command. Process-level failures (binary not
/// found, timeout) are represented as normal field values, not as a
/// different response shape.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayResult {
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
    /// Process exit code; `127` = binary not found, `-1` = timeout.
    pub returncode: i32,
    /// Set only for transport-level errors (connection refused, etc); when
    /// set, `returncode` is left at its default of `0`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The `/health` response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Always `"ok"`.
    pub status: String,
    /// The configured bridge names.
    pub bridges: Vec<String>,
}

/// The JSON body returned alongside non-2xx status codes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    /// A short, non-internal error description.
    pub error: String,
}
