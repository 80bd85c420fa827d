//! Ambient credential discovery for Google Cloud.
//!
//! Sources are tried in order: an explicit access token in the environment,
//! the application-default credentials file, then the metadata server of the
//! hosting VM or container. Tokens are cached until shortly before expiry.

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use log::{debug, info};
use reqwest::Client;
use serde_derive::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;

use crate::error::TryOnError;

const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const DEFAULT_METADATA_HOST: &str = "metadata.google.internal";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);
const METADATA_TIMEOUT: Duration = Duration::from_secs(3);
/// Lifetime assumed when the issuer does not say.
const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(300);

#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Bearer token for the cloud-platform scope.
    async fn token(&self) -> Result<String, TryOnError>;

    /// Drops any cached token so the next call fetches a new one.
    async fn invalidate(&self);
}

fn auth_error(msg: impl std::fmt::Display) -> TryOnError {
    TryOnError::Remote(format!("authentication failed: {}", msg))
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AdcFile {
    AuthorizedUser {
        client_id: String,
        client_secret: String,
        refresh_token: String,
        #[serde(default = "default_token_uri")]
        token_uri: String,
    },
    ServiceAccount {
        client_email: String,
        private_key: String,
        #[serde(default = "default_token_uri")]
        token_uri: String,
    },
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

impl AdcFile {
    fn load(path: &Path) -> Result<Self, TryOnError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| auth_error(format!("cannot read {}: {}", path.display(), e)))?;
        serde_json::from_str(&raw)
            .map_err(|e| auth_error(format!("unsupported credentials in {}: {}", path.display(), e)))
    }
}

#[derive(Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: u64,
    exp: u64,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

impl CachedToken {
    fn new(value: String, lifetime: Option<Duration>) -> Self {
        CachedToken {
            value,
            expires_at: Instant::now() + lifetime.unwrap_or(DEFAULT_TOKEN_LIFETIME),
        }
    }

    fn from_response(resp: TokenResponse) -> Self {
        Self::new(resp.access_token, resp.expires_in.map(Duration::from_secs))
    }

    fn is_fresh(&self) -> bool {
        Instant::now() + EXPIRY_MARGIN < self.expires_at
    }
}

/// Credentials found in the hosting environment.
pub struct AmbientCredentials {
    http: Client,
    env_token: Option<String>,
    adc_path: Option<PathBuf>,
    metadata_host: String,
    cached: Mutex<Option<CachedToken>>,
}

impl AmbientCredentials {
    pub fn from_env(http: Client) -> Self {
        let adc_path = env::var("GOOGLE_APPLICATION_CREDENTIALS")
            .ok()
            .map(PathBuf::from)
            .or_else(well_known_adc_path);
        Self::with_sources(
            http,
            env::var("GOOGLE_OAUTH_ACCESS_TOKEN").ok(),
            adc_path,
            env::var("GCE_METADATA_HOST").unwrap_or_else(|_| DEFAULT_METADATA_HOST.to_string()),
        )
    }

    pub fn with_sources(
        http: Client,
        env_token: Option<String>,
        adc_path: Option<PathBuf>,
        metadata_host: String,
    ) -> Self {
        AmbientCredentials {
            http,
            env_token: env_token.filter(|t| !t.trim().is_empty()),
            adc_path,
            metadata_host,
            cached: Mutex::new(None),
        }
    }

    async fn fetch(&self) -> Result<CachedToken, TryOnError> {
        if let Some(token) = &self.env_token {
            debug!("using access token from GOOGLE_OAUTH_ACCESS_TOKEN");
            return Ok(CachedToken::new(token.clone(), None));
        }

        if let Some(path) = self.adc_path.as_deref().filter(|p| p.exists()) {
            debug!("using application default credentials at {}", path.display());
            return match AdcFile::load(path)? {
                AdcFile::AuthorizedUser {
                    client_id,
                    client_secret,
                    refresh_token,
                    token_uri,
                } => {
                    let form = [
                        ("grant_type", "refresh_token"),
                        ("client_id", client_id.as_str()),
                        ("client_secret", client_secret.as_str()),
                        ("refresh_token", refresh_token.as_str()),
                    ];
                    self.exchange(&token_uri, &form).await
                }
                AdcFile::ServiceAccount {
                    client_email,
                    private_key,
                    token_uri,
                } => {
                    let assertion = sign_assertion(&client_email, &private_key, &token_uri)?;
                    let form = [
                        ("grant_type", JWT_BEARER_GRANT),
                        ("assertion", assertion.as_str()),
                    ];
                    self.exchange(&token_uri, &form).await
                }
            };
        }

        self.metadata_server_token().await
    }

    async fn exchange(
        &self,
        token_uri: &str,
        form: &[(&str, &str)],
    ) -> Result<CachedToken, TryOnError> {
        let response = self
            .http
            .post(token_uri)
            .form(form)
            .send()
            .await
            .map_err(auth_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(auth_error(format!("token endpoint returned {}: {}", status, body)));
        }

        let token: TokenResponse = response.json().await.map_err(auth_error)?;
        Ok(CachedToken::from_response(token))
    }

    async fn metadata_server_token(&self) -> Result<CachedToken, TryOnError> {
        let url = format!(
            "http://{}/computeMetadata/v1/instance/service-accounts/default/token",
            self.metadata_host
        );
        let response = self
            .http
            .get(&url)
            .header("Metadata-Flavor", "Google")
            .timeout(METADATA_TIMEOUT)
            .send()
            .await
            .map_err(|e| auth_error(format!("no credentials found in the environment ({})", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(auth_error(format!("metadata server returned {}", status)));
        }

        let token: TokenResponse = response.json().await.map_err(auth_error)?;
        Ok(CachedToken::from_response(token))
    }
}

#[async_trait]
impl TokenSource for AmbientCredentials {
    async fn token(&self) -> Result<String, TryOnError> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref().filter(|t| t.is_fresh()) {
            return Ok(token.value.clone());
        }

        let fresh = self.fetch().await?;
        info!("obtained Google Cloud access token");
        let value = fresh.value.clone();
        *cached = Some(fresh);
        Ok(value)
    }

    async fn invalidate(&self) {
        *self.cached.lock().await = None;
    }
}

fn well_known_adc_path() -> Option<PathBuf> {
    env::var("HOME").ok().map(|home| {
        PathBuf::from(home)
            .join(".config")
            .join("gcloud")
            .join("application_default_credentials.json")
    })
}

fn sign_assertion(client_email: &str, private_key: &str, token_uri: &str) -> Result<String, TryOnError> {
    let iat = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(auth_error)?
        .as_secs();
    let claims = AssertionClaims {
        iss: client_email,
        scope: CLOUD_PLATFORM_SCOPE,
        aud: token_uri,
        iat,
        exp: iat + 3600,
    };
    let key = EncodingKey::from_rsa_pem(private_key.as_bytes()).map_err(auth_error)?;
    jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &key).map_err(auth_error)
}
