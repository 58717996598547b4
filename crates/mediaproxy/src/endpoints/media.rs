use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, State};
use axum::http::{Method, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};

use mediaproxy_service::coordinator::{FetchCoordinator, Fetched};

/// Serves the media identified by the end of the request target.
///
/// Denied, malformed and failed requests all look the same to the client.
pub async fn serve_media(
    State(coordinator): State<Arc<FetchCoordinator>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    method: Method,
    uri: Uri,
) -> Response {
    sentry::configure_scope(|scope| {
        scope.set_transaction(Some("GET /{id}"));
    });

    // the raw target, neither decoded nor normalized
    let target = uri
        .path_and_query()
        .map(|target| target.as_str())
        .unwrap_or_else(|| uri.path());

    match coordinator.get(peer.ip(), method.as_str(), target).await {
        Fetched::Found { id, contents } => (
            [
                (header::CONTENT_TYPE, "audio/mpeg".to_owned()),
                (
                    header::CONTENT_DISPOSITION,
                    format!("attachment; filename=\"{id}.mp3\""),
                ),
                (header::EXPIRES, "0".to_owned()),
                (header::ACCEPT_RANGES, "bytes".to_owned()),
                (header::CONTENT_LENGTH, contents.len().to_string()),
            ],
            contents,
        )
            .into_response(),
        Fetched::NotFound | Fetched::Denied => not_found(),
    }
}

fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        [(header::CONTENT_TYPE, "text/plain;charset=utf-8")],
        "404",
    )
        .into_response()
}
