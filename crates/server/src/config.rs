//! Environment-variable configuration for the gateway.
//!
//! Recognized variables:
//!
//! ```text
//! GATEWAY_UPSTREAMS              (required) JSON {"domain": "url", ...}
//! GATEWAY_NAME                   server name (default "toolgate")
//! GATEWAY_HOST                   bind address (default "0.0.0.0")
//! GATEWAY_PORT                   bind port (default 8080)
//! GATEWAY_INSTRUCTIONS           custom handshake instructions (wins over dynamic)
//! GATEWAY_REGISTRY_AUTH_TOKEN    bearer token for discovery connections
//! GATEWAY_DOMAIN_DESCRIPTIONS    JSON {"domain": "description", ...}
//! GATEWAY_UPSTREAM_HEADERS       JSON {"domain": {"Header": "value"}, ...}
//! GATEWAY_REFRESH_INTERVAL       seconds between refreshes; <= 0 disables
//! GATEWAY_HOOK_MODULE            registered hook-factory name
//! GATEWAY_REGISTRATION_TOKEN     enables the registration REST API
//! GATEWAY_CORS_ORIGINS           comma-separated allowed origins ('*' = any)
//! GATEWAY_UPSTREAM_TIMEOUT_SECS  per-request upstream timeout (default 30)
//! LOG_LEVEL                      tracing filter (default "info")
//! ```
//!
//! Invalid values (unparseable JSON, non-numeric port) abort startup with
//! a descriptive error; the process exits non-zero.

use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::time::Duration;

const DEFAULT_NAME: &str = "toolgate";
const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 8080;
const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

/// Fully parsed gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// `domain -> url` for every configured upstream.
    pub upstreams: BTreeMap<String, String>,
    pub name: String,
    pub host: String,
    pub port: u16,
    /// Custom instructions; `None` means build them dynamically.
    pub instructions: Option<String>,
    /// Bearer token attached to discovery connections.
    pub registry_auth_token: Option<String>,
    pub domain_descriptions: BTreeMap<String, String>,
    /// Static per-domain headers attached to every request to that domain.
    pub upstream_headers: BTreeMap<String, BTreeMap<String, String>>,
    /// Background refresh cadence; `None` disables the loop.
    pub refresh_interval: Option<Duration>,
    /// Name of a registered hook factory.
    pub hook_module: Option<String>,
    /// Shared secret protecting the registration REST API; `None` leaves
    /// the endpoints unmounted.
    pub registration_token: Option<String>,
    pub cors_origins: Vec<String>,
    pub upstream_timeout: Duration,
}

impl GatewayConfig {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        let upstreams: BTreeMap<String, String> =
            parse_json_env("GATEWAY_UPSTREAMS")?.context(
                "GATEWAY_UPSTREAMS is required (JSON object mapping domain names to URLs)",
            )?;
        if upstreams.is_empty() {
            bail!("GATEWAY_UPSTREAMS must name at least one upstream");
        }

        let port = match std::env::var("GATEWAY_PORT") {
            Ok(raw) => raw
                .parse::<u16>()
                .with_context(|| format!("invalid GATEWAY_PORT value: {raw}"))?,
            Err(_) => DEFAULT_PORT,
        };

        let refresh_interval = match non_empty_env("GATEWAY_REFRESH_INTERVAL") {
            Some(raw) => {
                let seconds: i64 = raw
                    .parse()
                    .with_context(|| format!("invalid GATEWAY_REFRESH_INTERVAL: {raw}"))?;
                (seconds > 0).then(|| Duration::from_secs(seconds as u64))
            }
            None => None,
        };

        let upstream_timeout = match non_empty_env("GATEWAY_UPSTREAM_TIMEOUT_SECS") {
            Some(raw) => {
                let seconds: u64 = raw
                    .parse()
                    .with_context(|| format!("invalid GATEWAY_UPSTREAM_TIMEOUT_SECS: {raw}"))?;
                Duration::from_secs(seconds)
            }
            None => DEFAULT_UPSTREAM_TIMEOUT,
        };

        let cors_origins = non_empty_env("GATEWAY_CORS_ORIGINS")
            .map(|raw| {
                raw.split(',')
                    .map(|origin| origin.trim().to_string())
                    .filter(|origin| !origin.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            upstreams,
            name: non_empty_env("GATEWAY_NAME").unwrap_or_else(|| DEFAULT_NAME.into()),
            host: non_empty_env("GATEWAY_HOST").unwrap_or_else(|| DEFAULT_HOST.into()),
            port,
            instructions: non_empty_env("GATEWAY_INSTRUCTIONS"),
            registry_auth_token: non_empty_env("GATEWAY_REGISTRY_AUTH_TOKEN"),
            domain_descriptions: parse_json_env("GATEWAY_DOMAIN_DESCRIPTIONS")?
                .unwrap_or_default(),
            upstream_headers: parse_json_env("GATEWAY_UPSTREAM_HEADERS")?.unwrap_or_default(),
            refresh_interval,
            hook_module: non_empty_env("GATEWAY_HOOK_MODULE"),
            registration_token: non_empty_env("GATEWAY_REGISTRATION_TOKEN"),
            cors_origins,
            upstream_timeout,
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Discovery headers derived from the registry auth token.
    pub fn registry_auth_headers(&self) -> BTreeMap<String, String> {
        self.registry_auth_token
            .as_ref()
            .map(|token| {
                BTreeMap::from([("Authorization".to_string(), format!("Bearer {token}"))])
            })
            .unwrap_or_default()
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

/// Parse a JSON-valued environment variable. Absent or empty variables
/// yield `Ok(None)`; present-but-invalid JSON is a startup error.
fn parse_json_env<T: DeserializeOwned>(name: &str) -> Result<Option<T>> {
    let Some(raw) = non_empty_env(name) else {
        return Ok(None);
    };
    let value =
        serde_json::from_str(&raw).with_context(|| format!("invalid JSON in {name}: {raw}"))?;
    Ok(Some(value))
}
