//! Client for the Vertex AI virtual try-on model.

pub mod auth;

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use log::debug;
use reqwest::{Client, StatusCode};
use serde_derive::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::VertexSettings;
use crate::error::TryOnError;
use auth::{AmbientCredentials, TokenSource};

pub const TRYON_MODEL: &str = "virtual-try-on-preview-08-04";

/// One image produced by the remote model.
#[derive(Debug, Clone)]
pub struct GeneratedImage {
    pub image_bytes: Vec<u8>,
    pub mime_type: Option<String>,
}

/// The remote try-on capability: compose product images onto a person image.
#[async_trait]
pub trait Recontext: Send + Sync {
    async fn recontext(
        &self,
        model: &str,
        person_image: &Path,
        product_images: &[PathBuf],
    ) -> Result<Vec<GeneratedImage>, TryOnError>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PredictRequest {
    instances: Vec<Instance>,
    parameters: Parameters,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Instance {
    person_image: ImageSlot,
    product_images: Vec<ImageSlot>,
}

#[derive(Serialize)]
struct ImageSlot {
    image: InlineImage,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InlineImage {
    bytes_base64_encoded: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Parameters {
    sample_count: u32,
}

#[derive(Deserialize)]
struct PredictResponse {
    #[serde(default)]
    predictions: Vec<Prediction>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Prediction {
    bytes_base64_encoded: Option<String>,
    mime_type: Option<String>,
}

async fn inline_file(path: &Path) -> Result<ImageSlot, TryOnError> {
    let bytes = tokio::fs::read(path).await?;
    Ok(ImageSlot {
        image: InlineImage {
            bytes_base64_encoded: general_purpose::STANDARD.encode(bytes),
        },
    })
}

/// Talks to the `predict` REST method of a Vertex AI publisher model.
pub struct VertexClient {
    http: Client,
    settings: VertexSettings,
    credentials: Arc<dyn TokenSource>,
}

impl VertexClient {
    /// Builds a client that authenticates with whatever the host provides.
    pub fn connect(settings: VertexSettings) -> Result<Self, TryOnError> {
        let http = Client::builder()
            .build()
            .map_err(|e| TryOnError::Configuration(format!("failed to build HTTP client: {}", e)))?;
        let credentials = Arc::new(AmbientCredentials::from_env(http.clone()));
        Ok(Self::with_credentials(http, settings, credentials))
    }

    pub fn with_credentials(
        http: Client,
        settings: VertexSettings,
        credentials: Arc<dyn TokenSource>,
    ) -> Self {
        VertexClient {
            http,
            settings,
            credentials,
        }
    }

    fn predict_url(&self, model: &str) -> String {
        format!(
            "{}/v1/projects/{}/locations/{}/publishers/google/models/{}:predict",
            self.settings.endpoint, self.settings.project, self.settings.location, model
        )
    }
}

#[async_trait]
impl Recontext for VertexClient {
    async fn recontext(
        &self,
        model: &str,
        person_image: &Path,
        product_images: &[PathBuf],
    ) -> Result<Vec<GeneratedImage>, TryOnError> {
        let mut products = Vec::with_capacity(product_images.len());
        for path in product_images {
            products.push(inline_file(path).await?);
        }

        let request = PredictRequest {
            instances: vec![Instance {
                person_image: inline_file(person_image).await?,
                product_images: products,
            }],
            parameters: Parameters { sample_count: 1 },
        };

        let token = self.credentials.token().await?;
        let url = self.predict_url(model);
        debug!("POST {}", url);

        let response = self
            .http
            .post(&url)
            .bearer_auth(token)
            .json(&request)
            .send()
            .await
            .map_err(|e| TryOnError::Remote(format!("request to Vertex AI failed: {}", e)))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            self.credentials.invalidate().await;
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TryOnError::Remote(format!(
                "Vertex AI returned {}: {}",
                status, body
            )));
        }

        let parsed: PredictResponse = response
            .json()
            .await
            .map_err(|e| TryOnError::Remote(format!("unexpected Vertex AI response: {}", e)))?;

        parsed
            .predictions
            .into_iter()
            .filter_map(|p| {
                let mime_type = p.mime_type;
                p.bytes_base64_encoded.map(|b64| (b64, mime_type))
            })
            .map(|(b64, mime_type)| {
                let image_bytes = general_purpose::STANDARD.decode(b64).map_err(|e| {
                    TryOnError::Remote(format!("generated image is not valid base64: {}", e))
                })?;
                Ok(GeneratedImage {
                    image_bytes,
                    mime_type,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warp::http::StatusCode;
    use warp::Filter;

    fn settings(endpoint: String) -> VertexSettings {
        VertexSettings {
            project: "demo-project".into(),
            location: "us-central1".into(),
            endpoint,
        }
    }

    fn token(value: &str) -> Arc<dyn TokenSource> {
        Arc::new(AmbientCredentials::with_sources(
            Client::new(),
            Some(value.to_string()),
            None,
            "127.0.0.1:1".into(),
        ))
    }

    fn staged(dir: &tempfile::TempDir, name: &str, bytes: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, bytes).unwrap();
        path
    }

    #[tokio::test]
    async fn sends_predict_request_and_decodes_predictions() {
        let route = warp::post()
            .and(warp::path!(
                "v1" / "projects" / "demo-project" / "locations" / "us-central1" / "publishers"
                    / "google" / "models" / String
            ))
            .and(warp::header::exact("authorization", "Bearer test-token"))
            .and(warp::body::json())
            .map(|model: String, body: serde_json::Value| {
                assert_eq!(model, format!("{}:predict", TRYON_MODEL));
                let instance = &body["instances"][0];
                let person = instance["personImage"]["image"]["bytesBase64Encoded"]
                    .as_str()
                    .unwrap();
                let products = instance["productImages"].as_array().unwrap();
                assert_eq!(products.len(), 1);
                assert_eq!(body["parameters"]["sampleCount"], 1);
                // Echo the person bytes back as the generated image.
                warp::reply::json(&serde_json::json!({
                    "predictions": [{ "mimeType": "image/png", "bytesBase64Encoded": person }]
                }))
            });
        let (addr, server) = warp::serve(route).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(server);

        let dir = tempfile::tempdir().unwrap();
        let person = staged(&dir, "person.png", b"person-bytes");
        let garment = staged(&dir, "garment.png", b"garment-bytes");

        let client = VertexClient::with_credentials(
            Client::new(),
            settings(format!("http://{}", addr)),
            token("test-token"),
        );
        let images = client
            .recontext(TRYON_MODEL, &person, &[garment])
            .await
            .unwrap();

        assert_eq!(images.len(), 1);
        assert_eq!(images[0].image_bytes, b"person-bytes");
        assert_eq!(images[0].mime_type.as_deref(), Some("image/png"));
    }

    #[tokio::test]
    async fn non_success_status_is_a_remote_error() {
        let route = warp::any().map(|| {
            warp::reply::with_status("quota exceeded", StatusCode::TOO_MANY_REQUESTS)
        });
        let (addr, server) = warp::serve(route).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(server);

        let dir = tempfile::tempdir().unwrap();
        let person = staged(&dir, "person.png", b"p");
        let garment = staged(&dir, "garment.png", b"g");

        let client = VertexClient::with_credentials(
            Client::new(),
            settings(format!("http://{}", addr)),
            token("t"),
        );
        let err = client
            .recontext(TRYON_MODEL, &person, &[garment])
            .await
            .unwrap_err();

        assert!(matches!(err, TryOnError::Remote(_)));
        assert!(err.to_string().contains("429"));
        assert!(err.to_string().contains("quota exceeded"));
    }

    #[tokio::test]
    async fn predictions_without_bytes_are_skipped() {
        let route = warp::post().map(|| {
            warp::reply::json(&serde_json::json!({
                "predictions": [{ "mimeType": "image/png", "raiFilteredReason": "filtered" }]
            }))
        });
        let (addr, server) = warp::serve(route).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(server);

        let dir = tempfile::tempdir().unwrap();
        let person = staged(&dir, "person.png", b"p");
        let garment = staged(&dir, "garment.png", b"g");

        let client = VertexClient::with_credentials(
            Client::new(),
            settings(format!("http://{}", addr)),
            token("t"),
        );
        let images = client
            .recontext(TRYON_MODEL, &person, &[garment])
            .await
            .unwrap();
        assert!(images.is_empty());
    }

    #[derive(Default)]
    struct CountingToken {
        invalidations: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl TokenSource for CountingToken {
        async fn token(&self) -> Result<String, TryOnError> {
            Ok("stale".into())
        }

        async fn invalidate(&self) {
            self.invalidations
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn unauthorized_clears_cached_credentials() {
        let route = warp::any()
            .map(|| warp::reply::with_status("token expired", StatusCode::UNAUTHORIZED));
        let (addr, server) = warp::serve(route).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(server);

        let dir = tempfile::tempdir().unwrap();
        let person = staged(&dir, "person.png", b"p");
        let garment = staged(&dir, "garment.png", b"g");

        let credentials = Arc::new(CountingToken::default());
        let client = VertexClient::with_credentials(
            Client::new(),
            settings(format!("http://{}", addr)),
            credentials.clone(),
        );
        let err = client
            .recontext(TRYON_MODEL, &person, &[garment])
            .await
            .unwrap_err();

        assert!(err.to_string().contains("401"));
        assert_eq!(
            credentials
                .invalidations
                .load(std::sync::atomic::Ordering::SeqCst),
            1
        );
    }

    #[test]
    fn predict_url_targets_publisher_model() {
        let client = VertexClient::with_credentials(
            Client::new(),
            settings("https://us-central1-aiplatform.googleapis.com".into()),
            token("t"),
        );
        assert_eq!(
            client.predict_url(TRYON_MODEL),
            "https://us-central1-aiplatform.googleapis.com/v1/projects/demo-project/locations/us-central1/publishers/google/models/virtual-try-on-preview-08-04:predict"
        );
    }
}
