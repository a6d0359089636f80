use crate::cache::{ResponseCache, Singleflight};
use crate::compositor::Compositor;
use crate::config::Config;
use crate::fetch::RemoteImageFetcher;
use crate::metrics::Metrics;
use crate::templates::TemplateRegistry;
use anyhow::Result;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<TemplateRegistry>,
    pub fetcher: RemoteImageFetcher,
    pub compositor: Compositor,
    pub cache: ResponseCache,
    pub singleflight: Singleflight,
    pub metrics: Arc<Metrics>,
}

impl AppState {
    pub fn new(
        config: Config,
        registry: TemplateRegistry,
        cache: ResponseCache,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        let config = Arc::new(config);
        let fetcher = RemoteImageFetcher::new(config.clone())?;
        let compositor = Compositor::new(&config);
        metrics.set_templates_loaded(registry.len());
        Ok(Self {
            config,
            registry: Arc::new(registry),
            fetcher,
            compositor,
            cache,
            singleflight: Singleflight::new(),
            metrics,
        })
    }

    /// Host that remote URLs must not point at. `PUBLIC_HOST` wins over the request's `Host`.
    pub fn self_host<'a>(&'a self, request_host: Option<&'a str>) -> &'a str {
        if let Some(host) = self.config.public_host.as_deref() {
            return host;
        }
        request_host.map(strip_port).unwrap_or("")
    }
}

fn strip_port(host: &str) -> &str {
    let host = host.trim();
    if let Some(rest) = host.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    match host.rsplit_once(':') {
        Some((name, port)) if !name.contains(':') && port.chars().all(|c| c.is_ascii_digit()) => {
            name
        }
        _ => host,
    }
}

#[cfg(test)]
pub(crate) const TEST_CATALOG: &str = r#"
standard:
  :alias: standard
  :width: 550
trollface:
  :alias: troll
  :width: 500
y_u_no:
  :alias: yuno
  :width: 450
"#;

/// A state over a temp dir with three solid-color templates on disk.
#[cfg(test)]
pub(crate) fn test_state(config: Config) -> AppState {
    use image::{ImageFormat, RgbImage};
    std::fs::create_dir_all(&config.templates_dir).unwrap();
    std::fs::create_dir_all(&config.transient_dir).unwrap();
    for (name, width, height) in [("standard", 550, 400), ("trollface", 500, 400), ("y_u_no", 450, 350)] {
        RgbImage::from_pixel(width, height, image::Rgb([60, 90, 120]))
            .save_with_format(config.templates_dir.join(format!("{name}.jpg")), ImageFormat::Jpeg)
            .unwrap();
    }
    let registry = TemplateRegistry::from_yaml(TEST_CATALOG, &config.templates_dir).unwrap();
    let cache = ResponseCache::new(&config).unwrap();
    AppState::new(config, registry, cache, Arc::new(Metrics::new())).unwrap()
}
