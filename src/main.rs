#![allow(clippy::collapsible_if)]

mod cache;
mod compositor;
mod config;
mod fetch;
mod http;
mod landing;
mod metrics;
mod pipeline;
mod state;
mod templates;
mod tokenizer;
mod transient;

use crate::cache::ResponseCache;
use crate::config::Config;
use crate::state::AppState;
use crate::templates::TemplateRegistry;
use anyhow::Context;
use axum::Router;
use axum::body::HttpBody;
use axum::http::{Response, header};
use axum::middleware;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::compression::{
    CompressionLayer,
    predicate::{DefaultPredicate, Predicate},
};
use tower_http::sensitive_headers::SetSensitiveHeadersLayer;
use tower_http::trace::{DefaultMakeSpan, TraceLayer};
use tracing::{info, warn};

#[derive(Clone)]
struct NoImageCompression {
    inner: DefaultPredicate,
}

impl NoImageCompression {
    fn new() -> Self {
        Self {
            inner: DefaultPredicate::new(),
        }
    }
}

impl Predicate for NoImageCompression {
    fn should_compress<B>(&self, response: &Response<B>) -> bool
    where
        B: HttpBody,
    {
        if let Some(content_type) = response.headers().get(header::CONTENT_TYPE) {
            if let Ok(content_type) = content_type.to_str() {
                if content_type.starts_with("image/") {
                    return false;
                }
            }
        }
        self.inner.should_compress(response)
    }
}

fn build_app(state: Arc<AppState>) -> Router {
    let max_in_flight = if state.config.max_in_flight_requests == 0 {
        usize::MAX
    } else {
        state.config.max_in_flight_requests
    };
    let tracking_state = state.clone();
    http::router(state)
        .layer(CompressionLayer::new().compress_when(NoImageCompression::new()))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().include_headers(false)),
        )
        .layer(SetSensitiveHeadersLayer::new([
            header::AUTHORIZATION,
            header::COOKIE,
            header::SET_COOKIE,
        ]))
        .layer(middleware::from_fn(move |request, next| {
            let state = tracking_state.clone();
            async move { http::track_requests(state, request, next).await }
        }))
        .layer(ConcurrencyLimitLayer::new(max_in_flight))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = Config::from_env()?;
    let registry = TemplateRegistry::load(&config.catalog_path, &config.templates_dir)
        .with_context(|| format!("load meme catalog {}", config.catalog_path.display()))?;
    if registry.is_empty() {
        warn!(catalog = %config.catalog_path.display(), "meme catalog is empty");
    }
    for name in registry.names() {
        if let Ok(entry) = registry.resolve(name) {
            if !entry.image_path.exists() {
                warn!(template = %name, path = %entry.image_path.display(), "template image missing");
            }
        }
    }
    info!(
        templates = registry.len(),
        cache_dir = %config.cache_dir.display(),
        transient_dir = %config.transient_dir.display(),
        font = ?config.font_path,
        fetch_timeout_ms = config.fetch_timeout.as_millis() as u64,
        max_concurrent_renders = config.max_concurrent_renders,
        public_host = ?config.public_host,
        "startup config summary"
    );

    let cache = ResponseCache::new(&config)?;
    let metrics = Arc::new(metrics::Metrics::new());
    let state = Arc::new(AppState::new(config, registry, cache.clone(), metrics)?);

    let cache_evict_interval = state.config.cache_evict_interval;
    if !cache_evict_interval.is_zero() {
        tokio::spawn(async move {
            cache.evict_loop(cache_evict_interval).await;
        });
    }

    let app = build_app(state.clone());

    let addr = format!("{}:{}", state.config.host, state.config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(address = %addr, "memegen listening");
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}
