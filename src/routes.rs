use base64::{engine::general_purpose, Engine as _};
use bytes::Bytes;
use log::{debug, error, info, warn};
use serde_derive::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

use crate::client::ClientSlot;
use crate::codec::base64_to_image;
use crate::error::TryOnError;
use crate::staging::StagedImages;
use crate::vertex::TRYON_MODEL;

const SERVICE_NAME: &str = "Vertex AI Virtual Try-On";

#[derive(Deserialize)]
struct TryOnRequest {
    person_image: Option<String>,
    garment_image: Option<String>,
}

#[derive(Serialize)]
struct TryOnResponse {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    result_image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    bytes_used: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl TryOnResponse {
    fn ok(result_image: String, bytes_used: usize) -> Self {
        TryOnResponse {
            success: true,
            result_image: Some(result_image),
            bytes_used: Some(bytes_used),
            error: None,
        }
    }

    fn failure(error: String) -> Self {
        TryOnResponse {
            success: false,
            result_image: None,
            bytes_used: None,
            error: Some(error),
        }
    }
}

#[derive(Serialize)]
#[serde(untagged)]
enum HealthResponse {
    Ok {
        status: &'static str,
        service: &'static str,
        model: &'static str,
    },
    Error {
        status: &'static str,
        error: String,
    },
}

pub fn routes(
    slot: Arc<ClientSlot>,
    max_body_bytes: u64,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let health = warp::path("health")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_slot(slot.clone()))
        .and_then(health_check);

    let tryon = warp::path("tryon")
        .and(warp::path::end())
        .and(warp::post())
        .and(with_slot(slot))
        .and(warp::body::content_length_limit(max_body_bytes))
        .and(warp::body::bytes())
        .and_then(virtual_tryon);

    let cors = warp::cors()
        .allow_any_origin()
        .allow_methods(vec!["GET", "POST", "OPTIONS"])
        .allow_headers(vec!["content-type"]);

    health
        .or(tryon)
        .recover(handle_rejection)
        .with(cors)
        .with(warp::log("tryon_proxy"))
}

fn with_slot(
    slot: Arc<ClientSlot>,
) -> impl Filter<Extract = (Arc<ClientSlot>,), Error = Infallible> + Clone {
    warp::any().map(move || slot.clone())
}

async fn health_check(slot: Arc<ClientSlot>) -> Result<warp::reply::Response, Infallible> {
    let reply = match slot.get() {
        Ok(_) => warp::reply::with_status(
            warp::reply::json(&HealthResponse::Ok {
                status: "ok",
                service: SERVICE_NAME,
                model: TRYON_MODEL,
            }),
            StatusCode::OK,
        ),
        Err(e) => {
            error!("health check failed: {}", e);
            warp::reply::with_status(
                warp::reply::json(&HealthResponse::Error {
                    status: "error",
                    error: e.to_string(),
                }),
                StatusCode::INTERNAL_SERVER_ERROR,
            )
        }
    };
    Ok(reply.into_response())
}

async fn virtual_tryon(slot: Arc<ClientSlot>, body: Bytes) -> Result<impl Reply, Rejection> {
    let now = Instant::now();

    let response = run_tryon(&slot, &body)
        .await
        .map_err(warp::reject::custom)?;

    info!("try-on finished in {} ms", now.elapsed().as_millis());
    Ok(warp::reply::json(&response))
}

fn parse_request(body: &[u8]) -> Result<(String, String), TryOnError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(TryOnError::MissingFields);
    }

    let request: Option<TryOnRequest> =
        serde_json::from_slice(body).map_err(|e| TryOnError::MalformedBody(e.to_string()))?;

    match request {
        Some(TryOnRequest {
            person_image: Some(person),
            garment_image: Some(garment),
        }) => Ok((person, garment)),
        _ => Err(TryOnError::MissingFields),
    }
}

async fn run_tryon(slot: &ClientSlot, body: &[u8]) -> Result<TryOnResponse, TryOnError> {
    let client = slot.get()?;
    let (person, garment) = parse_request(body)?;

    let staged = tokio::task::spawn_blocking(move || {
        let person_img = base64_to_image(&person)?;
        let garment_img = base64_to_image(&garment)?;
        StagedImages::write(&person_img, &garment_img)
    })
    .await??;

    debug!("staged inputs in {}", staged.dir().display());
    info!("Generating virtual try-on...");
    let generated = client
        .recontext(TRYON_MODEL, staged.person(), &[staged.garment().to_path_buf()])
        .await?;

    let image = generated
        .into_iter()
        .next()
        .ok_or_else(|| TryOnError::Remote("remote service returned no generated images".into()))?;
    let bytes_used = image.image_bytes.len();
    let result_image = general_purpose::STANDARD.encode(&image.image_bytes);

    drop(staged);
    info!(
        "Generated {} image using {} bytes",
        image.mime_type.as_deref().unwrap_or("image"),
        bytes_used
    );

    Ok(TryOnResponse::ok(result_image, bytes_used))
}

async fn handle_rejection(err: Rejection) -> Result<impl Reply, Infallible> {
    let (code, message) = if let Some(e) = err.find::<TryOnError>() {
        if e.status().is_client_error() {
            warn!("rejected try-on request: {}", e);
        } else {
            error!("try-on failed: {}", e);
        }
        (e.status(), e.to_string())
    } else if err.is_not_found() {
        (StatusCode::NOT_FOUND, "Not found".to_string())
    } else if err.find::<warp::reject::PayloadTooLarge>().is_some() {
        (
            StatusCode::PAYLOAD_TOO_LARGE,
            "Request body too large".to_string(),
        )
    } else if err.find::<warp::reject::LengthRequired>().is_some() {
        (
            StatusCode::LENGTH_REQUIRED,
            "Content-Length header required".to_string(),
        )
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        (
            StatusCode::METHOD_NOT_ALLOWED,
            "Method not allowed".to_string(),
        )
    } else {
        error!("unhandled rejection: {:?}", err);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Internal server error".to_string(),
        )
    };

    Ok(warp::reply::with_status(
        warp::reply::json(&TryOnResponse::failure(message)),
        code,
    ))
}
