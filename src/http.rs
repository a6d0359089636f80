use crate::cache::{CacheKey, Flight};
use crate::landing;
use crate::metrics::refresh_metrics;
use crate::pipeline::{self, JOKE_PATH, Outcome};
use crate::state::AppState;
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, Uri, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Bytes re-escaped when a decoded path goes back out in a `Location` header.
const LOCATION_ESCAPES: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'+')
    .add(b'<')
    .add(b'>')
    .add(b'\\')
    .add(b'^')
    .add(b'`')
    .add(b'{')
    .add(b'|')
    .add(b'}');

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(landing::index))
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/status", get(status))
        .fallback(meme)
        .with_state(state)
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn status(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let cache_bytes = state.cache.size_bytes().await?;
    Ok(Json(serde_json::json!({
        "templates": state.registry.len(),
        "cache_bytes": cache_bytes,
        "renders_in_flight": state.compositor.renders_in_flight(),
        "max_concurrent_renders": state.config.max_concurrent_renders,
        "version": env!("CARGO_PKG_VERSION"),
    })))
}

async fn metrics(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    refresh_metrics(&state).await;
    let body = state.metrics.gather()?;
    Ok((
        [(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; version=0.0.4"),
        )],
        body,
    )
        .into_response())
}

async fn meme(
    State(state): State<Arc<AppState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    if method != Method::GET && method != Method::HEAD {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }
    let raw_path = uri
        .path_and_query()
        .map(|path_and_query| path_and_query.as_str())
        .unwrap_or_else(|| uri.path());
    let key = state.cache.key_for(raw_path);
    if let Some(bytes) = cached_body(&state, &key).await {
        return image_response(&state, bytes, true, &headers);
    }

    // Followers whose leader cached nothing render on their own, outside the flight.
    let _leader = match state.singleflight.acquire(&key.hash) {
        Flight::Leader(leader) => Some(leader),
        Flight::Follower(follower) => {
            if follower.wait(render_wait_timeout(&state)).await {
                if let Some(bytes) = cached_body(&state, &key).await {
                    return image_response(&state, bytes, true, &headers);
                }
            }
            debug!(path = %raw_path, "singleflight leader left no cached result");
            None
        }
    };

    let request_host = headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok());
    let self_host = state.self_host(request_host).to_string();
    match pipeline::build_meme(&state, raw_path, &self_host).await {
        Outcome::Image(bytes) => {
            if let Err(err) = state.cache.store(&key, &bytes).await {
                warn!(error = ?err, path = %raw_path, "response cache store failed");
            }
            image_response(&state, bytes, false, &headers)
        }
        Outcome::RedirectCanonical(path) => {
            let location = utf8_percent_encode(&path, LOCATION_ESCAPES).to_string();
            redirect(&location, &image_cache_control(&state))
        }
        Outcome::RedirectJoke => redirect(JOKE_PATH, &image_cache_control(&state)),
        Outcome::RedirectError(kind) => redirect(&kind.location(), "no-store"),
    }
}

async fn cached_body(state: &AppState, key: &CacheKey) -> Option<Vec<u8>> {
    match state.cache.load(key).await {
        Ok(Some(bytes)) => {
            state.metrics.observe_cache_lookup(true);
            state.metrics.observe_meme_outcome("image");
            Some(bytes)
        }
        Ok(None) => {
            state.metrics.observe_cache_lookup(false);
            None
        }
        Err(err) => {
            warn!(error = ?err, path = %key.path.display(), "response cache read failed");
            state.metrics.observe_cache_lookup(false);
            None
        }
    }
}

fn render_wait_timeout(state: &AppState) -> Duration {
    state.config.fetch_timeout + state.config.render_timeout.max(Duration::from_secs(10))
}

fn image_cache_control(state: &AppState) -> String {
    format!("public, max-age={}", state.config.image_cache_seconds)
}

fn image_response(
    state: &AppState,
    bytes: Vec<u8>,
    cache_hit: bool,
    request_headers: &HeaderMap,
) -> Response {
    let etag = etag_for(&bytes);
    let cache_control = image_cache_control(state);
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_str(&cache_control).unwrap_or(HeaderValue::from_static("no-store")),
    );
    if let Ok(value) = HeaderValue::from_str(&etag) {
        headers.insert(header::ETAG, value);
    }
    headers.insert(
        "X-Cache",
        HeaderValue::from_static(if cache_hit { "HIT" } else { "MISS" }),
    );
    if matches_etag(request_headers, &etag) {
        return (StatusCode::NOT_MODIFIED, headers).into_response();
    }
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(mime::IMAGE_JPEG.as_ref())
            .unwrap_or(HeaderValue::from_static("image/jpeg")),
    );
    (headers, bytes).into_response()
}

fn redirect(location: &str, cache_control: &str) -> Response {
    let mut headers = HeaderMap::new();
    match HeaderValue::from_str(location) {
        Ok(value) => {
            headers.insert(header::LOCATION, value);
        }
        Err(_) => {
            headers.insert(header::LOCATION, HeaderValue::from_static("/"));
        }
    }
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_str(cache_control).unwrap_or(HeaderValue::from_static("no-store")),
    );
    (StatusCode::FOUND, headers).into_response()
}

fn etag_for(bytes: &[u8]) -> String {
    let digest = hex::encode(Sha256::digest(bytes));
    format!("\"{}\"", &digest[..32])
}

fn matches_etag(headers: &HeaderMap, etag: &str) -> bool {
    let header_value = match headers.get(header::IF_NONE_MATCH) {
        Some(value) => value.to_str().unwrap_or(""),
        None => return false,
    };
    if header_value.trim() == "*" {
        return true;
    }
    header_value
        .split(',')
        .map(|item| item.trim())
        .any(|value| value == etag)
}

fn route_group(path: &str) -> &'static str {
    match path {
        "/" => "index",
        "/healthz" => "health",
        "/metrics" => "metrics",
        "/status" => "status",
        _ => "meme",
    }
}

/// Counts every response by route group and status.
pub async fn track_requests(
    state: Arc<AppState>,
    request: axum::http::Request<Body>,
    next: Next,
) -> Response {
    let method = request.method().clone();
    let route_group = route_group(request.uri().path());
    let _inflight = state.metrics.inflight_guard();
    let response = next.run(request).await;
    state
        .metrics
        .observe_http_request(route_group, method.as_str(), response.status().as_str());
    let bytes_out = response
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(0);
    state.metrics.add_http_response_bytes(route_group, bytes_out);
    response
}

pub struct ApiError {
    pub status: StatusCode,
    pub body: Value,
}

impl ApiError {
    pub fn new(status: StatusCode, message: &str) -> Self {
        Self {
            status,
            body: serde_json::json!({ "error": message }),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(error: anyhow::Error) -> Self {
        warn!(error = ?error, "request failed");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "request failed")
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use crate::fetch::tests::spawn_image_host;
    use crate::state::test_state;
    use axum::body::to_bytes;
    use axum::http::Request;
    use tempfile::tempdir;
    use tower::ServiceExt;

    fn app(state: AppState) -> Router {
        router(Arc::new(state))
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header(header::HOST, "memes.example.com:8080")
            .body(Body::empty())
            .unwrap()
    }

    fn location(response: &Response) -> &str {
        response
            .headers()
            .get(header::LOCATION)
            .unwrap()
            .to_str()
            .unwrap()
    }

    fn header_str<'a>(response: &'a Response, name: &str) -> &'a str {
        response.headers().get(name).unwrap().to_str().unwrap()
    }

    #[tokio::test]
    async fn template_meme_is_served_as_cacheable_jpeg() {
        let dir = tempdir().unwrap();
        let app = app(test_state(test_config(dir.path())));
        let response = app
            .oneshot(get_request("/HELLO_WORLD/BYE/standard.jpg"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(header_str(&response, "content-type"), "image/jpeg");
        assert_eq!(
            header_str(&response, "cache-control"),
            "public, max-age=31104000"
        );
        assert_eq!(header_str(&response, "x-cache"), "MISS");
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let decoded = image::load_from_memory(&body).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (550, 400));
    }

    #[tokio::test]
    async fn repeat_request_is_a_byte_identical_cache_hit() {
        let dir = tempdir().unwrap();
        let app = app(test_state(test_config(dir.path())));
        let first = app
            .clone()
            .oneshot(get_request("/one/two/troll.jpg"))
            .await
            .unwrap();
        assert_eq!(header_str(&first, "x-cache"), "MISS");
        let etag = header_str(&first, "etag").to_string();
        let first_body = to_bytes(first.into_body(), usize::MAX).await.unwrap();

        let second = app
            .clone()
            .oneshot(get_request("/one/two/troll.jpg"))
            .await
            .unwrap();
        assert_eq!(header_str(&second, "x-cache"), "HIT");
        assert_eq!(header_str(&second, "etag"), etag);
        let second_body = to_bytes(second.into_body(), usize::MAX).await.unwrap();
        assert_eq!(first_body, second_body);

        let conditional = app
            .oneshot(
                Request::builder()
                    .uri("/one/two/troll.jpg")
                    .header(header::IF_NONE_MATCH, etag)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(conditional.status(), StatusCode::NOT_MODIFIED);
    }

    #[tokio::test]
    async fn cache_hits_count_as_image_outcomes() {
        let dir = tempdir().unwrap();
        let state = Arc::new(test_state(test_config(dir.path())));
        let app = router(state.clone());
        for expected in ["MISS", "HIT", "HIT"] {
            let response = app
                .clone()
                .oneshot(get_request("/one/two/yuno.jpg"))
                .await
                .unwrap();
            assert_eq!(header_str(&response, "x-cache"), expected);
        }
        let text = state.metrics.gather().unwrap();
        assert!(text.contains("memegen_meme_requests_total{outcome=\"image\"} 3"));
        assert!(text.contains("memegen_cache_lookups_total{result=\"hit\"} 2"));
    }

    #[tokio::test]
    async fn alias_serves_same_image_as_name() {
        let dir = tempdir().unwrap();
        let app = app(test_state(test_config(dir.path())));
        let by_alias = app
            .clone()
            .oneshot(get_request("/a/b/YUNO.JPG"))
            .await
            .unwrap();
        let by_name = app.oneshot(get_request("/a/b/y_u_no.jpg")).await.unwrap();
        let alias_body = to_bytes(by_alias.into_body(), usize::MAX).await.unwrap();
        let name_body = to_bytes(by_name.into_body(), usize::MAX).await.unwrap();
        assert_eq!(alias_body, name_body);
    }

    #[tokio::test]
    async fn unknown_template_redirects_with_invalid() {
        let dir = tempdir().unwrap();
        let app = app(test_state(test_config(dir.path())));
        let response = app
            .oneshot(get_request("/a/b/not_a_meme.jpg"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(location(&response), "/?error=invalid");
        assert_eq!(header_str(&response, "cache-control"), "no-store");
    }

    #[tokio::test]
    async fn missing_segments_redirect_with_tokens() {
        let dir = tempdir().unwrap();
        let app = app(test_state(test_config(dir.path())));
        let response = app.oneshot(get_request("/standard.jpg")).await.unwrap();
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(location(&response), "/?error=tokens");
    }

    #[tokio::test]
    async fn spaces_redirect_to_underscored_path() {
        let dir = tempdir().unwrap();
        let app = app(test_state(test_config(dir.path())));
        let response = app
            .oneshot(get_request("/hello+world/caf%C3%A9%20time/standard.jpg"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(
            location(&response),
            "/hello_world/caf%C3%A9_time/standard.jpg"
        );
    }

    #[tokio::test]
    async fn self_referential_url_redirects_to_trollface() {
        let dir = tempdir().unwrap();
        let app = app(test_state(test_config(dir.path())));
        let response = app
            .oneshot(get_request(
                "/a/b/http://memes.example.com/x/y/standard.jpg",
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(location(&response), JOKE_PATH);
    }

    #[tokio::test]
    async fn slow_remote_redirects_with_url_error() {
        let dir = tempdir().unwrap();
        let addr = spawn_image_host().await;
        let mut config = test_config(dir.path());
        config.fetch_timeout = Duration::from_millis(300);
        let state = test_state(config);
        let transient_dir = state.config.transient_dir.clone();
        let app = app(state);
        let response = app
            .oneshot(get_request(&format!("/a/b/http://{addr}/slow.png")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(location(&response), "/?error=url");
        assert_eq!(std::fs::read_dir(transient_dir).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn index_shows_error_message_and_short_cache() {
        let dir = tempdir().unwrap();
        let app = app(test_state(test_config(dir.path())));
        let response = app.oneshot(get_request("/?error=tokens")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(header_str(&response, "cache-control"), "public, max-age=300");
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let html = String::from_utf8(body.to_vec()).unwrap();
        assert!(html.contains("Yo dawg, you are missing some url parameters, try harder."));
        assert!(html.contains("y_u_no <small>(yuno)</small>"));
    }

    #[tokio::test]
    async fn health_and_metrics_endpoints_respond() {
        let dir = tempdir().unwrap();
        let app = app(test_state(test_config(dir.path())));
        let response = app.clone().oneshot(get_request("/healthz")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let response = app.clone().oneshot(get_request("/metrics")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(String::from_utf8_lossy(&body).contains("memegen_templates_loaded 3"));
        let response = app.oneshot(get_request("/status")).await.unwrap();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["templates"], 3);
    }

    #[tokio::test]
    async fn post_is_not_allowed() {
        let dir = tempdir().unwrap();
        let app = app(test_state(test_config(dir.path())));
        let response = app
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/a/b/standard.jpg")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[test]
    fn etag_matching_handles_lists_and_wildcards() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::IF_NONE_MATCH,
            HeaderValue::from_static("\"abc\", \"def\""),
        );
        assert!(matches_etag(&headers, "\"def\""));
        assert!(!matches_etag(&headers, "\"xyz\""));
        headers.insert(header::IF_NONE_MATCH, HeaderValue::from_static("*"));
        assert!(matches_etag(&headers, "\"xyz\""));
    }
}
