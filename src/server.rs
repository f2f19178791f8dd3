use crate::{
    describe::Describer,
    error::DescribeError,
    messages::{DEFAULT_PROMPT, DescribeResponse, DescribeUrlRequest, effective_prompt},
    upload::{ImageSource, UploadStore},
};
use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Multipart, State, rejection::JsonRejection},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use futures::TryStreamExt;
use serde_json::json;
use std::sync::Arc;
use tokio_util::io::StreamReader;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub describer: Describer,
    pub uploads: Arc<UploadStore>,
}

pub fn router(state: AppState, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/", get(|| async { "Welcome to the image description service!" }))
        .route("/health", get(get_health))
        .route("/describe_url/", post(post_describe_url))
        .route("/describe_upload/", post(post_describe_upload))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .with_state(state)
}

async fn get_health(State(state): State<AppState>) -> impl IntoResponse {
    match state.describer.slot().engine() {
        Some(engine) => (
            StatusCode::OK,
            Json(json!({
                "status": "ok",
                "engine": engine.state().as_str(),
                "model": engine.info(),
            })),
        ),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "unavailable" })),
        ),
    }
}

async fn post_describe_url(
    State(state): State<AppState>,
    payload: Result<Json<DescribeUrlRequest>, JsonRejection>,
) -> (StatusCode, Json<DescribeResponse>) {
    let payload = match payload {
        Ok(Json(payload)) => payload,
        Err(rejection) => {
            log::warn!("Rejected URL request: {}", rejection.body_text());
            return (
                rejection.status(),
                Json(DescribeResponse::failure(
                    rejection.body_text(),
                    DEFAULT_PROMPT.to_string(),
                )),
            );
        }
    };

    let prompt = effective_prompt(payload.prompt_text);
    log::info!("Received URL request: {}, prompt: '{prompt}'", payload.image_url);

    let source = ImageSource::Url(payload.image_url);
    let result = state.describer.describe(&source.reference(), &prompt).await;

    (StatusCode::OK, Json(into_response(result, prompt)))
}

async fn post_describe_upload(
    State(state): State<AppState>,
    multipart: Multipart,
) -> (StatusCode, Json<DescribeResponse>) {
    // detached, so the upload is still released if the client goes away
    match tokio::spawn(describe_upload(state, multipart)).await {
        Ok(reply) => reply,
        Err(e) => {
            let failure = DescribeError::Unexpected(format!("upload task failed: {e}"));
            let prompt = DEFAULT_PROMPT.to_string();
            (StatusCode::OK, Json(into_response(Err(failure), prompt)))
        }
    }
}

async fn describe_upload(
    state: AppState,
    mut multipart: Multipart,
) -> (StatusCode, Json<DescribeResponse>) {
    let mut stored: Option<ImageSource> = None;
    let mut prompt_text = None;
    let mut failure = None;

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => {
                failure = Some(DescribeError::Unexpected(format!("malformed multipart body: {e}")));
                break;
            }
        };

        let name = field.name().map(str::to_owned);
        match name.as_deref() {
            Some("image") if stored.is_none() => {
                let filename = field.file_name().map(str::to_owned);
                let reader = StreamReader::new(field.map_err(std::io::Error::other));
                match state.uploads.persist(filename.as_deref(), reader).await {
                    Ok(source) => {
                        log::info!(
                            "Received upload {}, saved to {}",
                            filename.as_deref().unwrap_or("<unnamed>"),
                            source.reference()
                        );
                        stored = Some(source);
                    }
                    Err(e) => {
                        failure = Some(DescribeError::Unexpected(e.to_string()));
                        break;
                    }
                }
            }
            Some("prompt_text") => match field.text().await {
                Ok(text) => prompt_text = Some(text),
                Err(e) => {
                    failure = Some(DescribeError::Unexpected(format!("invalid prompt_text field: {e}")));
                    break;
                }
            },
            // unknown fields are skipped when dropped
            _ => {}
        }
    }

    let prompt = effective_prompt(prompt_text);

    let result = match (&stored, failure) {
        (_, Some(e)) => Err(e),
        (None, None) => {
            log::warn!("Upload request without an image part");
            return (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(DescribeResponse::failure(
                    "missing required form field 'image'",
                    prompt,
                )),
            );
        }
        (Some(source), None) => {
            log::info!("Describing upload with prompt: '{prompt}'");
            state.describer.describe(&source.reference(), &prompt).await
        }
    };

    if let Some(source) = &stored {
        state.uploads.release(source).await;
    }

    (StatusCode::OK, Json(into_response(result, prompt)))
}

fn into_response(result: Result<String, DescribeError>, prompt: String) -> DescribeResponse {
    match result {
        Ok(description) => DescribeResponse::success(description, prompt),
        Err(e) => {
            log::warn!("Describe request failed ({}): {e}", e.status());
            DescribeResponse::failure(e, prompt)
        }
    }
}
