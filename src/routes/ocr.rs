//! OCR request endpoint
//!
//! Accepts a JSON body with exactly one of `image_path` or `image_base64`,
//! validates it, and enqueues a task with a bounded admission wait. The
//! response is always 200 once a task was admitted; OCR failures travel
//! in-band in the body.

use std::path::PathBuf;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::Method;
use axum::Json;
use base64::Engine as _;
use serde::Deserialize;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::dispatch::{OcrOutcome, OcrTask};
use crate::error::{AppError, Result};
use crate::imgproc;
use crate::state::AppState;

/// Bounded wait for a slot in the intake queue.
const ADMISSION_TIMEOUT: Duration = Duration::from_secs(10);

/// Accepted data-URL prefixes for base64 payloads.
const DATA_URL_PREFIXES: &[&str] = &[
    "data:image/jpeg;base64,",
    "data:image/png;base64,",
    "data:image/gif;base64,",
];

#[derive(Debug, Deserialize)]
pub struct OcrRequest {
    #[serde(default)]
    pub image_path: Option<String>,
    #[serde(default)]
    pub image_base64: Option<String>,
}

/// Validated task input: a readable image file path or decoded image bytes.
#[derive(Debug)]
enum TaskInput {
    Path(PathBuf),
    Data(Vec<u8>),
}

pub async fn handle_ocr(
    State(state): State<AppState>,
    method: Method,
    body: Bytes,
) -> Result<Json<OcrOutcome>> {
    if method != Method::POST {
        info!(method = %method, "unsupported request method");
        return Err(AppError::MethodNotAllowed);
    }

    let request: OcrRequest =
        serde_json::from_slice(&body).map_err(|e| AppError::MalformedJson(e.to_string()))?;
    let input = validate_request(request).await?;

    debug!("OCR request validated, queueing task");
    let (response_tx, response_rx) = oneshot::channel();
    let task = match input {
        TaskInput::Path(path) => OcrTask {
            image_path: Some(path),
            image_data: None,
            response: response_tx,
        },
        TaskInput::Data(data) => OcrTask {
            image_path: None,
            image_data: Some(data),
            response: response_tx,
        },
    };

    submit(state.task_sender(), task, state.cancel_token(), ADMISSION_TIMEOUT).await?;

    match response_rx.await {
        Ok(outcome) => Ok(Json(outcome)),
        // The handler side dropped without responding; only possible while
        // the server is tearing down.
        Err(_) => Ok(Json(OcrOutcome::error("server shutting down"))),
    }
}

/// Enforce that exactly one image source is present and well-formed.
async fn validate_request(request: OcrRequest) -> Result<TaskInput> {
    let path = request.image_path.filter(|p| !p.is_empty());
    let base64_content = request.image_base64.filter(|b| !b.is_empty());

    match (path, base64_content) {
        (Some(path), None) => {
            let data = tokio::fs::read(&path)
                .await
                .map_err(|e| AppError::UnsupportedImage(format!("cannot read {}: {}", path, e)))?;
            imgproc::detect_format(&data)
                .map_err(|e| AppError::UnsupportedImage(e.to_string()))?;
            Ok(TaskInput::Path(PathBuf::from(path)))
        }
        (None, Some(content)) => {
            let prefix = DATA_URL_PREFIXES
                .iter()
                .find(|p| content.starts_with(*p))
                .ok_or_else(|| {
                    AppError::UnsupportedImage(
                        "base64 image must start with a data:image/{jpeg,png,gif};base64, prefix"
                            .to_string(),
                    )
                })?;
            // Strip the prefix before decoding; feeding the full data URL
            // to the decoder would reject every valid payload.
            let encoded = &content[prefix.len()..];
            let data = base64::engine::general_purpose::STANDARD
                .decode(encoded)
                .map_err(|e| AppError::InvalidBase64(e.to_string()))?;
            imgproc::detect_format(&data)
                .map_err(|e| AppError::UnsupportedImage(e.to_string()))?;
            Ok(TaskInput::Data(data))
        }
        _ => Err(AppError::MissingImage),
    }
}

/// Enqueue with a deadline. A full queue or a shutdown in progress both
/// surface as 503.
async fn submit(
    queue: &mpsc::Sender<OcrTask>,
    task: OcrTask,
    cancel: &CancellationToken,
    deadline: Duration,
) -> Result<()> {
    tokio::select! {
        sent = tokio::time::timeout(deadline, queue.send(task)) => match sent {
            Ok(Ok(())) => Ok(()),
            _ => Err(AppError::Busy),
        },
        _ = cancel.cancelled() => Err(AppError::Busy),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn png_base64() -> String {
        let img = image::GrayImage::from_fn(4, 4, |x, y| image::Luma([(x * 60 + y) as u8]));
        let mut buf = Vec::new();
        image::DynamicImage::ImageLuma8(img)
            .write_to(
                &mut std::io::Cursor::new(&mut buf),
                image::ImageFormat::Png,
            )
            .unwrap();
        base64::engine::general_purpose::STANDARD.encode(buf)
    }

    #[tokio::test]
    async fn valid_data_url_is_decoded() {
        let request = OcrRequest {
            image_path: None,
            image_base64: Some(format!("data:image/png;base64,{}", png_base64())),
        };
        let input = validate_request(request).await.unwrap();
        assert!(matches!(input, TaskInput::Data(data) if !data.is_empty()));
    }

    #[tokio::test]
    async fn missing_prefix_is_not_acceptable() {
        let request = OcrRequest {
            image_path: None,
            image_base64: Some(png_base64()),
        };
        let err = validate_request(request).await.unwrap_err();
        assert!(matches!(err, AppError::UnsupportedImage(_)));
    }

    #[tokio::test]
    async fn undecodable_base64_is_bad_request() {
        let request = OcrRequest {
            image_path: None,
            image_base64: Some("data:image/png;base64,@@not-base64@@".to_string()),
        };
        let err = validate_request(request).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidBase64(_)));
    }

    #[tokio::test]
    async fn decoded_payload_must_be_a_supported_image() {
        let encoded = base64::engine::general_purpose::STANDARD.encode(b"plain text");
        let request = OcrRequest {
            image_path: None,
            image_base64: Some(format!("data:image/png;base64,{}", encoded)),
        };
        let err = validate_request(request).await.unwrap_err();
        assert!(matches!(err, AppError::UnsupportedImage(_)));
    }

    #[tokio::test]
    async fn neither_or_both_sources_are_rejected() {
        let neither = OcrRequest {
            image_path: None,
            image_base64: None,
        };
        assert!(matches!(
            validate_request(neither).await.unwrap_err(),
            AppError::MissingImage
        ));

        let both = OcrRequest {
            image_path: Some("/tmp/image.png".to_string()),
            image_base64: Some(format!("data:image/png;base64,{}", png_base64())),
        };
        assert!(matches!(
            validate_request(both).await.unwrap_err(),
            AppError::MissingImage
        ));

        // Empty strings count as absent.
        let empty = OcrRequest {
            image_path: Some(String::new()),
            image_base64: Some(String::new()),
        };
        assert!(matches!(
            validate_request(empty).await.unwrap_err(),
            AppError::MissingImage
        ));
    }

    #[tokio::test]
    async fn unreadable_path_is_not_acceptable() {
        let request = OcrRequest {
            image_path: Some("/nonexistent/scan.png".to_string()),
            image_base64: None,
        };
        let err = validate_request(request).await.unwrap_err();
        assert!(matches!(err, AppError::UnsupportedImage(_)));
    }

    #[tokio::test]
    async fn submit_times_out_when_the_queue_is_full() {
        let (tx, _rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();

        let (first, _keep) = oneshot::channel();
        tx.send(OcrTask {
            image_path: None,
            image_data: Some(Vec::new()),
            response: first,
        })
        .await
        .unwrap();

        let (second, _keep2) = oneshot::channel();
        let task = OcrTask {
            image_path: None,
            image_data: Some(Vec::new()),
            response: second,
        };
        let err = submit(&tx, task, &cancel, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Busy));
    }

    #[tokio::test]
    async fn submit_returns_busy_on_shutdown() {
        let (tx, _rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();

        let (first, _keep) = oneshot::channel();
        tx.send(OcrTask {
            image_path: None,
            image_data: Some(Vec::new()),
            response: first,
        })
        .await
        .unwrap();

        cancel.cancel();
        let (second, _keep2) = oneshot::channel();
        let task = OcrTask {
            image_path: None,
            image_data: Some(Vec::new()),
            response: second,
        };
        let err = submit(&tx, task, &cancel, Duration::from_secs(10))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Busy));
    }
}
