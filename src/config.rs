use anyhow::Context;
use std::env;
use std::net::{IpAddr, SocketAddr};

use crate::error::TryOnError;

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 5002;
const DEFAULT_MAX_BODY_BYTES: u64 = 32 * 1024 * 1024;
const DEFAULT_LOCATION: &str = "global";

/// Listener settings, read once at startup.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: IpAddr,
    pub port: u16,
    pub max_body_bytes: u64,
}

impl ServerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let host: IpAddr = env::var("TRYON_HOST")
            .unwrap_or_else(|_| DEFAULT_HOST.to_string())
            .parse()
            .context("TRYON_HOST is not a valid IP address")?;
        let port: u16 = match env::var("TRYON_PORT") {
            Ok(v) => v.parse().context("TRYON_PORT is not a valid port")?,
            Err(_) => DEFAULT_PORT,
        };
        let max_body_bytes: u64 = match env::var("TRYON_MAX_BODY_BYTES") {
            Ok(v) => v
                .parse()
                .context("TRYON_MAX_BODY_BYTES is not a valid byte count")?,
            Err(_) => DEFAULT_MAX_BODY_BYTES,
        };

        Ok(ServerConfig {
            host,
            port,
            max_body_bytes,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

/// Where the remote client points. Resolved when the client is first needed,
/// not at startup, so a missing project surfaces as a failed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VertexSettings {
    pub project: String,
    pub location: String,
    pub endpoint: String,
}

impl VertexSettings {
    pub fn from_env() -> Result<Self, TryOnError> {
        Self::resolve(
            env::var("GOOGLE_CLOUD_PROJECT").ok(),
            env::var("GOOGLE_CLOUD_LOCATION").ok(),
            env::var("VERTEX_API_ENDPOINT").ok(),
        )
    }

    pub fn resolve(
        project: Option<String>,
        location: Option<String>,
        endpoint: Option<String>,
    ) -> Result<Self, TryOnError> {
        let project = project
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| {
                TryOnError::Configuration(
                    "GOOGLE_CLOUD_PROJECT environment variable must be set".to_string(),
                )
            })?;
        let location = location
            .filter(|l| !l.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_LOCATION.to_string());
        let endpoint = endpoint
            .filter(|e| !e.trim().is_empty())
            .map(|e| e.trim_end_matches('/').to_string())
            .unwrap_or_else(|| default_endpoint(&location));

        Ok(VertexSettings {
            project,
            location,
            endpoint,
        })
    }
}

fn default_endpoint(location: &str) -> String {
    if location == DEFAULT_LOCATION {
        "https://aiplatform.googleapis.com".to_string()
    } else {
        format!("https://{}-aiplatform.googleapis.com", location)
    }
}
