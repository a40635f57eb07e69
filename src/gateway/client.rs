//! Async HTTP client that maps transport failures to a uniform
//! [`GatewayResult`] envelope and preserves bridge-reported exit codes.

use std::time::Duration;

use super::types::{GatewayRequest, GatewayResult};

/// A client for the Host Gateway's `/execute` endpoint.
pub struct GatewayClient {
    base_url: String,
    token: String,
    http: reqwest::Client,
}

impl GatewayClient {
    /// Creates a client pointed at `base_url` (e.g. `http://localhost:8088`)
    /// authenticating with `token`.
    #[must_use]
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            token: token.into(),
            http: reqwest::Client::new(),
        }
    }

    /// Sends `request` to the gateway. Transport failures (connection
    /// refused, client-side timeout, non-2xx auth failures) never return
    /// `Err`; they are folded into a [`GatewayResult`] with `error` set and
    /// `returncode` left at `0`, per §7's "transport error" rule — the
    /// caller always gets a result it can reason about.
    pub async fn execute(&self, request: &GatewayRequest) -> GatewayResult {
        let url = format!("{}/execute", self.base_url.trim_end_matches('/'));
        let wire_timeout = request.timeout.unwrap_or(0).max(1).min(600);
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .timeout(Duration::from_secs(wire_timeout + 5))
            .json(request)
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(err) => {
                return GatewayResult {
                    stdout: String::new(),
                    stderr: String::new(),
                    returncode: 0,
                    error: Some(format!("transport error: {err}")),
                };
            }
        };

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return GatewayResult {
                stdout: String::new(),
                stderr: String::new(),
                returncode: 0,
                error: Some(format!("gateway returned {status}: {body}")),
            };
        }

        match response.json::<GatewayResult>().await {
            Ok(result) => result,
            Err(err) => GatewayResult {
                stdout: String::new(),
                stderr: String::new(),
                returncode: 0,
                error: Some(format!("malformed gateway response: {err}")),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connection_refused_is_folded_into_error_field() {
        // Nothing listens on this port; the client must not panic or
        // propagate an `Err`.
        let client = GatewayClient::new("http://127.0.0.1:1", "token");
        let result = client
            .execute(&GatewayRequest {
                bridge: "claude-code".into(),
                argv: vec!["echo".into()],
                cwd: None,
                timeout: Some(1),
            })
            .await;
        assert_eq!(result.returncode, 0);
        assert!(result.error.is_some());
    }
}
