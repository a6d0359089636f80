use anyhow::{Context, Result, anyhow};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub catalog_path: PathBuf,
    pub templates_dir: PathBuf,
    pub font_path: Option<PathBuf>,
    pub cache_dir: PathBuf,
    pub cache_ttl: Duration,
    pub cache_max_size_bytes: u64,
    pub cache_evict_interval: Duration,
    pub cache_touch_interval: Duration,
    pub transient_dir: PathBuf,
    pub fetch_timeout: Duration,
    pub max_remote_bytes: usize,
    pub max_decoded_pixels: u64,
    pub remote_working_width: u32,
    pub remote_render_width: u32,
    pub caption_band_height: u32,
    pub caption_font_size: f32,
    pub max_concurrent_renders: usize,
    pub render_timeout: Duration,
    pub max_in_flight_requests: usize,
    pub public_host: Option<String>,
    pub index_cache_seconds: u64,
    pub image_cache_seconds: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = parse_u16("PORT", 8080);
        let catalog_path = PathBuf::from(
            env::var("MEME_CATALOG").unwrap_or_else(|_| "memes.yml".to_string()),
        );
        let templates_dir = PathBuf::from(
            env::var("MEME_TEMPLATES_DIR").unwrap_or_else(|_| "public/images/meme".to_string()),
        );
        let font_path = parse_font_path("MEME_FONT_PATH", "lib/impact.ttf");
        let cache_dir = PathBuf::from(
            env::var("CACHE_DIR").unwrap_or_else(|_| "/var/cache/memegen".to_string()),
        );
        let transient_dir = env::var("TRANSIENT_DIR")
            .ok()
            .map(PathBuf::from)
            .unwrap_or_else(env::temp_dir);

        let remote_working_width = parse_u32("REMOTE_WORKING_WIDTH", 600);
        let remote_render_width = parse_u32("REMOTE_RENDER_WIDTH", 550);
        let caption_band_height = parse_u32("CAPTION_BAND_HEIGHT", 120);
        if remote_working_width == 0 || remote_render_width == 0 || caption_band_height == 0 {
            return Err(anyhow!(
                "REMOTE_WORKING_WIDTH, REMOTE_RENDER_WIDTH and CAPTION_BAND_HEIGHT must be positive"
            ));
        }
        let caption_font_size = parse_f32("CAPTION_FONT_SIZE", 56.0);
        if !(caption_font_size.is_finite() && caption_font_size > 0.0) {
            return Err(anyhow!("CAPTION_FONT_SIZE must be a positive number"));
        }

        let public_host = env::var("PUBLIC_HOST")
            .ok()
            .map(|value| value.trim().to_ascii_lowercase())
            .filter(|value| !value.is_empty());

        let config = Config {
            host,
            port,
            catalog_path,
            templates_dir,
            font_path,
            cache_dir,
            cache_ttl: Duration::from_secs(parse_u64("CACHE_TTL_SECONDS", 31_104_000)),
            cache_max_size_bytes: parse_u64("CACHE_MAX_SIZE_BYTES", 1024 * 1024 * 1024),
            cache_evict_interval: Duration::from_secs(parse_u64(
                "CACHE_EVICT_INTERVAL_SECONDS",
                300,
            )),
            cache_touch_interval: Duration::from_secs(parse_u64(
                "CACHE_TOUCH_INTERVAL_SECONDS",
                3600,
            )),
            transient_dir,
            fetch_timeout: Duration::from_secs(parse_u64("FETCH_TIMEOUT_SECONDS", 3).max(1)),
            max_remote_bytes: parse_usize("MAX_REMOTE_BYTES", 10 * 1024 * 1024),
            max_decoded_pixels: parse_u64("MAX_DECODED_PIXELS", 40_000_000),
            remote_working_width,
            remote_render_width,
            caption_band_height,
            caption_font_size,
            max_concurrent_renders: parse_usize("MAX_CONCURRENT_RENDERS", 4).max(1),
            render_timeout: Duration::from_secs(parse_u64("RENDER_TIMEOUT_SECONDS", 10)),
            max_in_flight_requests: parse_usize("MAX_IN_FLIGHT_REQUESTS", 256),
            public_host,
            index_cache_seconds: parse_u64("INDEX_CACHE_SECONDS", 300),
            image_cache_seconds: parse_u64("IMAGE_CACHE_SECONDS", 31_104_000),
        };
        std::fs::create_dir_all(&config.transient_dir).with_context(|| {
            format!(
                "create transient dir {}",
                config.transient_dir.display()
            )
        })?;
        Ok(config)
    }
}

fn parse_u16(key: &str, default: u16) -> u16 {
    env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

fn parse_u32(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

fn parse_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

fn parse_f32(key: &str, default: f32) -> f32 {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(default)
}

/// An explicitly empty value disables the bundled font and relies on system fonts.
fn parse_font_path(key: &str, default: &str) -> Option<PathBuf> {
    match env::var(key) {
        Ok(value) if value.trim().is_empty() => None,
        Ok(value) => Some(PathBuf::from(value.trim())),
        Err(_) => Some(PathBuf::from(default)),
    }
}

#[cfg(test)]
pub(crate) fn test_config(root: &std::path::Path) -> Config {
    Config {
        host: "127.0.0.1".to_string(),
        port: 0,
        catalog_path: root.join("memes.yml"),
        templates_dir: root.join("templates"),
        font_path: None,
        cache_dir: root.join("cache"),
        cache_ttl: Duration::from_secs(3600),
        cache_max_size_bytes: 1024 * 1024 * 1024,
        cache_evict_interval: Duration::from_secs(0),
        cache_touch_interval: Duration::from_secs(0),
        transient_dir: root.join("transient"),
        fetch_timeout: Duration::from_secs(3),
        max_remote_bytes: 4 * 1024 * 1024,
        max_decoded_pixels: 16_000_000,
        remote_working_width: 600,
        remote_render_width: 550,
        caption_band_height: 120,
        caption_font_size: 56.0,
        max_concurrent_renders: 2,
        render_timeout: Duration::from_secs(30),
        max_in_flight_requests: 0,
        public_host: None,
        index_cache_seconds: 300,
        image_cache_seconds: 31_104_000,
    }
}
