//! Gateway configuration loaded from YAML.
//!
//! Everything here is about how the emulator behaves locally; what gets served comes from the
//! service definition at `service_path` (see [`crate::service`]).

use std::{net::SocketAddr, path::PathBuf};

use serde::Deserialize;

use crate::{cors::CorsPolicy, serde_ext};

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 3000))
}

fn default_prefix() -> String {
    "/".to_string()
}

fn default_max_body_bytes() -> usize {
    6 * 1024 * 1024
}

#[derive(Debug, Clone, Deserialize)]
/// Top-level gateway configuration.
pub struct GatewayConfig {
    #[serde(default = "default_listen_addr")]
    /// Address the gateway listens on (e.g. `127.0.0.1:3000`).
    pub listen_addr: SocketAddr,
    /// Path to the serverless-style service YAML. Handler modules and template files are resolved
    /// relative to its directory.
    pub service_path: PathBuf,

    #[serde(default = "default_prefix")]
    /// Prefix prepended to every route path.
    pub prefix: String,

    #[serde(default)]
    /// Overrides `provider.stage` from the service file.
    pub stage: Option<String>,

    #[serde(default)]
    /// Keep loaded handler modules across requests instead of reloading them every time.
    pub skip_cache_invalidation: bool,

    #[serde(default)]
    /// Disable the per-function timeout race.
    pub no_timeout: bool,

    #[serde(default)]
    /// Principal reported to handlers when the request carries none. Falls back to the
    /// `PRINCIPAL_ID` environment variable.
    pub principal_id: Option<String>,

    #[serde(
        default = "default_max_body_bytes",
        deserialize_with = "serde_ext::de_usize_or_string"
    )]
    /// Maximum accepted request body size.
    pub max_body_bytes: usize,

    #[serde(default)]
    /// Policy applied to routes declaring `cors: true`, and the base for `cors: {...}` overrides.
    pub cors: CorsPolicy,
}

impl GatewayConfig {
    /// Parse a YAML gateway config from bytes.
    pub fn from_yaml_bytes(bytes: &[u8]) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_slice(bytes)?)
    }

    /// The principal handed to handlers when no authenticated principal is present.
    pub fn principal_fallback(&self) -> Option<String> {
        self.principal_id
            .clone()
            .or_else(|| std::env::var("PRINCIPAL_ID").ok())
            .filter(|p| !p.is_empty())
    }
}
