//! `X-Corgi-Processing-Time` instrumentation

use axum::{extract::Request, middleware::Next, response::Response};
use http::HeaderValue;
use std::time::Instant;

/// Header carrying total processing time in milliseconds
pub const PROCESSING_TIME_HEADER: &str = "x-corgi-processing-time";

/// Stamp every response with its total processing time, and a default
/// `X-Corgi-Source` for locally served responses that set none.
pub async fn processing_time(request: Request, next: Next) -> Response {
    let started = Instant::now();
    let mut response = next.run(request).await;

    let millis = started.elapsed().as_millis().to_string();
    if let Ok(value) = HeaderValue::from_str(&millis) {
        response
            .headers_mut()
            .insert(PROCESSING_TIME_HEADER, value);
    }
    if !response.headers().contains_key(crate::proxy::SOURCE_HEADER) {
        response.headers_mut().insert(
            crate::proxy::SOURCE_HEADER,
            HeaderValue::from_static("service"),
        );
    }
    response
}
