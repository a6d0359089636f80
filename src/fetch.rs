use crate::config::Config;
use crate::transient::TransientAsset;
use anyhow::{Context, Result};
use bytes::BytesMut;
use image::imageops::FilterType;
use image::{DynamicImage, ImageReader, Rgba, RgbaImage};
use reqwest::StatusCode;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task;
use tracing::debug;
use url::Url;

const MAX_REDIRECTS: usize = 10;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("remote url points back at this server")]
    SelfReferential,
    #[error("invalid remote url {url}")]
    InvalidUrl { url: String },
    #[error("remote fetch timed out after {timeout:?}")]
    Timeout { timeout: Duration },
    #[error("remote fetch failed from {url}: {status}")]
    UpstreamStatus { status: StatusCode, url: String },
    #[error("remote fetch failed from {url}")]
    Upstream {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("remote image exceeds {limit} bytes")]
    TooLarge { limit: usize },
    #[error("remote image would normalize to {width}x{height}, over {limit} pixels")]
    TooManyPixels { width: u32, height: u32, limit: u64 },
    #[error("remote content is not an image")]
    NotAnImage,
    #[error("transient store failed")]
    Store(#[source] anyhow::Error),
}

impl FetchError {
    /// Short label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SelfReferential => "self_referential",
            Self::InvalidUrl { .. } => "invalid_url",
            Self::Timeout { .. } => "timeout",
            Self::UpstreamStatus { .. } => "upstream_status",
            Self::Upstream { .. } => "upstream",
            Self::TooLarge { .. } => "too_large",
            Self::TooManyPixels { .. } => "too_many_pixels",
            Self::NotAnImage => "not_an_image",
            Self::Store(_) => "store",
        }
    }
}

#[derive(Clone)]
pub struct RemoteImageFetcher {
    client: reqwest::Client,
    config: Arc<Config>,
}

impl RemoteImageFetcher {
    pub fn new(config: Arc<Config>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.fetch_timeout)
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .user_agent(concat!("memegen/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("build reqwest client")?;
        Ok(Self { client, config })
    }

    /// Downloads `raw_url`, normalizes it to a JPEG of the working width and parks it in a
    /// transient file owned by the caller.
    pub async fn fetch(
        &self,
        raw_url: &str,
        host_to_exclude: &str,
    ) -> Result<TransientAsset, FetchError> {
        if is_self_referential(raw_url, host_to_exclude) {
            return Err(FetchError::SelfReferential);
        }
        let normalized = normalize_scheme(raw_url);
        let url = Url::parse(&normalized).map_err(|_| FetchError::InvalidUrl {
            url: normalized.clone(),
        })?;
        if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
            return Err(FetchError::InvalidUrl { url: normalized });
        }

        let started = Instant::now();
        let timeout = self.config.fetch_timeout;
        let bytes = tokio::time::timeout(timeout, self.download(url.clone()))
            .await
            .map_err(|_| FetchError::Timeout { timeout })??;
        debug!(
            url = %url,
            size = bytes.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "fetched remote image"
        );

        let width = self.config.remote_working_width;
        let max_pixels = self.config.max_decoded_pixels;
        let dir = self.config.transient_dir.clone();
        normalize_image(bytes, width, max_pixels, dir).await
    }

    async fn download(&self, url: Url) -> Result<Vec<u8>, FetchError> {
        let mut response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|err| classify_reqwest(err, &url, self.config.fetch_timeout))?;
        if !response.status().is_success() {
            return Err(FetchError::UpstreamStatus {
                status: response.status(),
                url: url.to_string(),
            });
        }
        let limit = self.config.max_remote_bytes;
        if let Some(length) = response.content_length() {
            if length > limit as u64 {
                return Err(FetchError::TooLarge { limit });
            }
        }
        let mut buffer = BytesMut::with_capacity(std::cmp::min(limit, 64 * 1024));
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|err| classify_reqwest(err, &url, self.config.fetch_timeout))?
        {
            if buffer.len().saturating_add(chunk.len()) > limit {
                return Err(FetchError::TooLarge { limit });
            }
            buffer.extend_from_slice(&chunk);
        }
        Ok(buffer.to_vec())
    }
}

fn classify_reqwest(err: reqwest::Error, url: &Url, timeout: Duration) -> FetchError {
    if err.is_timeout() {
        return FetchError::Timeout { timeout };
    }
    FetchError::Upstream {
        url: url.to_string(),
        source: err,
    }
}

pub fn is_self_referential(url: &str, host: &str) -> bool {
    let host = host.trim();
    if host.is_empty() {
        return false;
    }
    url.to_ascii_lowercase()
        .contains(&host.to_ascii_lowercase())
}

/// Rebuilds exactly one `://` after the scheme. Some clients collapse `//` in paths, so
/// `http:/host`, `http:host` and `http:///host` all show up.
pub fn normalize_scheme(url: &str) -> String {
    for scheme in ["https", "http"] {
        let prefix_len = scheme.len() + 1;
        let Some(prefix) = url.get(..prefix_len) else {
            continue;
        };
        if prefix.eq_ignore_ascii_case(&format!("{scheme}:")) {
            let rest = url[prefix_len..].trim_start_matches('/');
            return format!("{scheme}://{rest}");
        }
    }
    url.to_string()
}

async fn normalize_image(
    bytes: Vec<u8>,
    width: u32,
    max_pixels: u64,
    dir: PathBuf,
) -> Result<TransientAsset, FetchError> {
    let jpeg = task::spawn_blocking(move || -> Result<Vec<u8>, FetchError> {
        let image = decode_raster(&bytes, max_pixels).ok_or(FetchError::NotAnImage)?;
        let height = scale_height(image.height(), image.width(), width).max(1);
        if (width as u64).saturating_mul(height as u64) > max_pixels {
            return Err(FetchError::TooManyPixels {
                width,
                height,
                limit: max_pixels,
            });
        }
        let resized = image::imageops::resize(&image, width, height, FilterType::Lanczos3);
        encode_jpeg(&flatten_on_white(resized)).map_err(|_| FetchError::NotAnImage)
    })
    .await
    .map_err(|err| FetchError::Store(err.into()))??;
    TransientAsset::create(&dir, "normalized", &jpeg).map_err(FetchError::Store)
}

pub(crate) fn decode_raster(bytes: &[u8], max_pixels: u64) -> Option<RgbaImage> {
    let mut reader = ImageReader::new(std::io::Cursor::new(bytes))
        .with_guessed_format()
        .ok()?;
    reader.limits(raster_limits(max_pixels));
    let image = reader.decode().ok()?;
    if image.width() == 0 || image.height() == 0 {
        return None;
    }
    let pixels = (image.width() as u64).saturating_mul(image.height() as u64);
    if pixels > max_pixels {
        return None;
    }
    Some(image.to_rgba8())
}

fn raster_limits(max_pixels: u64) -> image::Limits {
    let max_dim = max_pixels.min(u32::MAX as u64) as u32;
    let mut limits = image::Limits::default();
    limits.max_image_width = Some(max_dim);
    limits.max_image_height = Some(max_dim);
    limits.max_alloc = Some(max_pixels.saturating_mul(4));
    limits
}

fn scale_height(original_height: u32, original_width: u32, target_width: u32) -> u32 {
    if original_width == 0 {
        return original_height;
    }
    let ratio = target_width as f64 / original_width as f64;
    (original_height as f64 * ratio).round() as u32
}

fn flatten_on_white(image: RgbaImage) -> RgbaImage {
    let mut canvas = RgbaImage::from_pixel(image.width(), image.height(), Rgba([255, 255, 255, 255]));
    image::imageops::overlay(&mut canvas, &image, 0, 0);
    canvas
}

pub(crate) fn encode_jpeg(image: &RgbaImage) -> image::ImageResult<Vec<u8>> {
    let rgb = DynamicImage::ImageRgba8(image.clone()).to_rgb8();
    let mut bytes = Vec::new();
    let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut bytes, 90);
    encoder.encode(
        rgb.as_raw(),
        rgb.width(),
        rgb.height(),
        image::ColorType::Rgb8.into(),
    )?;
    Ok(bytes)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::test_config;
    use axum::Router;
    use axum::http::{StatusCode as HttpStatus, header};
    use axum::response::{IntoResponse, Redirect};
    use axum::routing::get;
    use image::{ImageFormat, RgbImage};
    use std::net::SocketAddr;
    use tempfile::tempdir;
    use tokio::net::TcpListener;

    pub(crate) fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let image = RgbImage::from_pixel(width, height, image::Rgb([40, 120, 200]));
        let mut bytes = Vec::new();
        image
            .write_to(&mut std::io::Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        bytes
    }

    pub(crate) async fn spawn_image_host() -> SocketAddr {
        let app = Router::new()
            .route(
                "/cat.png",
                get(|| async { ([(header::CONTENT_TYPE, "image/png")], png_bytes(300, 200)) }),
            )
            .route("/moved", get(|| async { Redirect::temporary("/cat.png") }))
            .route("/page.html", get(|| async { "<html>not an image</html>" }))
            .route(
                "/missing.png",
                get(|| async { HttpStatus::NOT_FOUND.into_response() }),
            )
            .route(
                "/slow.png",
                get(|| async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    png_bytes(10, 10)
                }),
            );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    fn fetcher(root: &std::path::Path, timeout: Duration) -> RemoteImageFetcher {
        let mut config = test_config(root);
        config.fetch_timeout = timeout;
        std::fs::create_dir_all(&config.transient_dir).unwrap();
        RemoteImageFetcher::new(Arc::new(config)).unwrap()
    }

    fn transient_files(root: &std::path::Path) -> usize {
        std::fs::read_dir(root.join("transient")).unwrap().count()
    }

    #[test]
    fn scheme_separator_is_rebuilt() {
        assert_eq!(normalize_scheme("http:/example.com/a.jpg"), "http://example.com/a.jpg");
        assert_eq!(normalize_scheme("https:/example.com"), "https://example.com");
        assert_eq!(normalize_scheme("http:///example.com"), "http://example.com");
        assert_eq!(normalize_scheme("http://example.com"), "http://example.com");
        assert_eq!(
            normalize_scheme("https://example.com/a?next=http://b"),
            "https://example.com/a?next=http://b"
        );
    }

    #[test]
    fn self_reference_matches_host_case_insensitively() {
        assert!(is_self_referential("http://Memes.Example.com/a/b/c.jpg", "memes.example.com"));
        assert!(!is_self_referential("http://other.com/x.jpg", "memes.example.com"));
        assert!(!is_self_referential("http://other.com/x.jpg", ""));
    }

    #[tokio::test]
    async fn fetch_normalizes_to_working_width() {
        let dir = tempdir().unwrap();
        let addr = spawn_image_host().await;
        let fetcher = fetcher(dir.path(), Duration::from_secs(3));
        let asset = fetcher
            .fetch(&format!("http:/{addr}/cat.png"), "memes.example.com")
            .await
            .unwrap();
        let image = image::open(asset.path()).unwrap();
        assert_eq!(image.width(), 600);
        assert_eq!(image.height(), 400);
        drop(asset);
        assert_eq!(transient_files(dir.path()), 0);
    }

    #[tokio::test]
    async fn fetch_follows_redirects() {
        let dir = tempdir().unwrap();
        let addr = spawn_image_host().await;
        let fetcher = fetcher(dir.path(), Duration::from_secs(3));
        let asset = fetcher
            .fetch(&format!("http://{addr}/moved"), "memes.example.com")
            .await
            .unwrap();
        assert!(asset.path().exists());
    }

    #[tokio::test]
    async fn html_is_not_an_image() {
        let dir = tempdir().unwrap();
        let addr = spawn_image_host().await;
        let fetcher = fetcher(dir.path(), Duration::from_secs(3));
        let err = fetcher
            .fetch(&format!("http://{addr}/page.html"), "memes.example.com")
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::NotAnImage));
        assert_eq!(transient_files(dir.path()), 0);
    }

    #[tokio::test]
    async fn upstream_status_is_reported() {
        let dir = tempdir().unwrap();
        let addr = spawn_image_host().await;
        let fetcher = fetcher(dir.path(), Duration::from_secs(3));
        let err = fetcher
            .fetch(&format!("http://{addr}/missing.png"), "memes.example.com")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            FetchError::UpstreamStatus { status, .. } if status == StatusCode::NOT_FOUND
        ));
    }

    #[tokio::test]
    async fn slow_upstream_times_out_without_leftovers() {
        let dir = tempdir().unwrap();
        let addr = spawn_image_host().await;
        let fetcher = fetcher(dir.path(), Duration::from_millis(300));
        let started = Instant::now();
        let err = fetcher
            .fetch(&format!("http://{addr}/slow.png"), "memes.example.com")
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(transient_files(dir.path()), 0);
    }

    #[tokio::test]
    async fn self_referential_url_is_never_fetched() {
        let dir = tempdir().unwrap();
        let fetcher = fetcher(dir.path(), Duration::from_secs(3));
        let err = fetcher
            .fetch("http://memes.example.com/a/b/c.jpg", "memes.example.com")
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::SelfReferential));
    }

    #[tokio::test]
    async fn tall_narrow_image_is_rejected_before_resize() {
        let dir = tempdir().unwrap();
        let transient = dir.path().join("transient");
        std::fs::create_dir_all(&transient).unwrap();
        // 1x50 decodes under the cap but would normalize to 600x30000.
        let err = normalize_image(png_bytes(1, 50), 600, 50, transient)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            FetchError::TooManyPixels {
                width: 600,
                height: 30_000,
                limit: 50
            }
        ));
        assert_eq!(transient_files(dir.path()), 0);
    }

    #[tokio::test]
    async fn oversized_body_is_rejected() {
        let dir = tempdir().unwrap();
        let addr = spawn_image_host().await;
        let mut config = test_config(dir.path());
        config.max_remote_bytes = 16;
        std::fs::create_dir_all(&config.transient_dir).unwrap();
        let fetcher = RemoteImageFetcher::new(Arc::new(config)).unwrap();
        let err = fetcher
            .fetch(&format!("http://{addr}/cat.png"), "memes.example.com")
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::TooLarge { limit: 16 }));
    }
}
