use crate::{server::SharedState, stream::CONTENT_TYPE};
use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use std::convert::Infallible;
use thiserror::Error;
use tokio_stream::StreamExt;
use tracing::instrument;

#[derive(Error, Debug)]
pub enum VideoStreamError {
    #[error("Http builder error: {0}")]
    HttpBuilderError(String),
}

#[instrument(skip(state))]
pub async fn video_feed(State(state): State<SharedState>) -> Result<Response, VideoStreamError> {
    state.metrics.record_stream_opened("/video_feed");

    let stream = state.pipeline.spawn_stream().map(Ok::<_, Infallible>);
    let body = Body::from_stream(stream);

    let response = Response::builder()
        .header(header::CONTENT_TYPE, CONTENT_TYPE)
        .header(header::CACHE_CONTROL, "no-cache")
        .body(body)
        .map_err(|e| VideoStreamError::HttpBuilderError(e.to_string()))?;

    Ok(response)
}

impl IntoResponse for VideoStreamError {
    fn into_response(self) -> Response {
        let status = match self {
            VideoStreamError::HttpBuilderError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}
