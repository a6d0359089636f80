use crate::config::Config;
use crate::fetch::{decode_raster, encode_jpeg};
use image::{Rgba, RgbaImage};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task;
use tracing::{debug, warn};

const FALLBACK_FAMILIES: &str = "Impact, Anton, Oswald, sans-serif";
const REFERENCE_SIZE: f32 = 100.0;
const MIN_FONT_SIZE: f32 = 12.0;
const FONT_SIZE_STEP: f32 = 2.0;
const LINE_HEIGHT: f32 = 1.1;
const ASCENT: f32 = 0.8;
const STROKE_WIDTH: f32 = 2.0;
const BAND_PADDING: f32 = 4.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Anchor {
    North,
    South,
}

/// One compositing pass: burn `caption` into the working image at `anchor`.
#[derive(Debug, Clone)]
pub struct RenderJob {
    pub caption: String,
    pub anchor: Anchor,
    pub width: u32,
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("read base image {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("base image {path} is not decodable")]
    Decode { path: PathBuf },
    #[error("caption markup rejected")]
    Caption(#[from] usvg::Error),
    #[error("cannot allocate a {width}x{height} caption band")]
    Band { width: u32, height: u32 },
    #[error("encode jpeg")]
    Encode(#[from] image::ImageError),
    #[error("render timed out after {timeout:?}")]
    Timeout { timeout: Duration },
    #[error("render worker failed")]
    Worker(#[from] task::JoinError),
    #[error("render pool closed")]
    Closed,
}

/// Font database and caption styling shared by every render.
#[derive(Clone)]
pub struct CaptionStyle {
    fonts: Arc<usvg::fontdb::Database>,
    families: String,
    band_height: u32,
    max_font_size: f32,
}

impl CaptionStyle {
    pub fn new(font_path: Option<&Path>, band_height: u32, max_font_size: f32) -> Self {
        let mut fonts = usvg::fontdb::Database::new();
        fonts.load_system_fonts();
        let mut families = FALLBACK_FAMILIES.to_string();
        if let Some(path) = font_path {
            match font_family(path) {
                Some(family) => {
                    if let Err(err) = fonts.load_font_file(path) {
                        warn!(error = ?err, path = %path.display(), "caption font load failed");
                    } else {
                        families = format!("'{}', {FALLBACK_FAMILIES}", escape_xml(&family));
                    }
                }
                None => {
                    warn!(path = %path.display(), "caption font missing, using system fonts");
                }
            }
        }
        debug!(faces = fonts.len(), families = %families, "caption fonts ready");
        Self {
            fonts: Arc::new(fonts),
            families,
            band_height,
            max_font_size: max_font_size.max(MIN_FONT_SIZE),
        }
    }

    fn options(&self) -> usvg::Options<'static> {
        usvg::Options {
            fontdb: self.fonts.clone(),
            ..Default::default()
        }
    }
}

fn font_family(path: &Path) -> Option<String> {
    let mut probe = usvg::fontdb::Database::new();
    probe.load_font_file(path).ok()?;
    probe
        .faces()
        .next()
        .and_then(|face| face.families.first())
        .map(|(name, _)| name.clone())
}

/// Renders captions onto template or downloaded images.
#[derive(Clone)]
pub struct Compositor {
    style: CaptionStyle,
    max_pixels: u64,
    permits: Arc<Semaphore>,
    max_renders: usize,
    timeout: Duration,
}

impl Compositor {
    pub fn new(config: &Config) -> Self {
        let style = CaptionStyle::new(
            config.font_path.as_deref(),
            config.caption_band_height,
            config.caption_font_size,
        );
        let max_renders = config.max_concurrent_renders.max(1);
        Self {
            style,
            max_pixels: config.max_decoded_pixels,
            permits: Arc::new(Semaphore::new(max_renders)),
            max_renders,
            timeout: config.render_timeout,
        }
    }

    pub fn renders_in_flight(&self) -> usize {
        self.max_renders
            .saturating_sub(self.permits.available_permits())
    }

    /// Burns `top` in at the north edge, then `bottom` at the south edge of the same image,
    /// and returns the JPEG encoding.
    pub async fn render(
        &self,
        base_image: &Path,
        top: &str,
        bottom: &str,
        width: u32,
    ) -> Result<Vec<u8>, RenderError> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| RenderError::Closed)?;
        let jobs = [
            RenderJob {
                caption: top.to_string(),
                anchor: Anchor::North,
                width,
            },
            RenderJob {
                caption: bottom.to_string(),
                anchor: Anchor::South,
                width,
            },
        ];
        let style = self.style.clone();
        let max_pixels = self.max_pixels;
        let path = base_image.to_path_buf();
        // The permit travels with the blocking work, so a timed-out render still counts
        // against the limit until its thread finishes.
        let work = task::spawn_blocking(move || {
            let _permit = permit;
            render_blocking(&style, &path, &jobs, max_pixels)
        });
        if self.timeout.is_zero() {
            return work.await?;
        }
        match tokio::time::timeout(self.timeout, work).await {
            Ok(result) => result?,
            Err(_) => Err(RenderError::Timeout {
                timeout: self.timeout,
            }),
        }
    }
}

fn render_blocking(
    style: &CaptionStyle,
    path: &Path,
    jobs: &[RenderJob],
    max_pixels: u64,
) -> Result<Vec<u8>, RenderError> {
    let bytes = std::fs::read(path).map_err(|source| RenderError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let mut working = decode_raster(&bytes, max_pixels).ok_or_else(|| RenderError::Decode {
        path: path.to_path_buf(),
    })?;
    for job in jobs {
        apply_caption(&mut working, job, style)?;
    }
    Ok(encode_jpeg(&working)?)
}

/// One pass: rasterize the caption band and composite it over `working` in place.
pub fn apply_caption(
    working: &mut RgbaImage,
    job: &RenderJob,
    style: &CaptionStyle,
) -> Result<(), RenderError> {
    let band = caption_band(&job.caption, job.width, style)?;
    composite_band(working, &band, job.anchor);
    Ok(())
}

pub fn composite_band(working: &mut RgbaImage, band: &RgbaImage, anchor: Anchor) {
    let x = (working.width() as i64 - band.width() as i64) / 2;
    let y = match anchor {
        Anchor::North => 0,
        Anchor::South => working.height() as i64 - band.height() as i64,
    };
    image::imageops::overlay(working, band, x, y);
}

/// Rasterizes `text` into a transparent `width x band_height` band: bold face, white fill,
/// black stroke, centered both ways.
pub fn caption_band(text: &str, width: u32, style: &CaptionStyle) -> Result<RgbaImage, RenderError> {
    let height = style.band_height;
    let mut pixmap = tiny_skia::Pixmap::new(width, height).ok_or(RenderError::Band { width, height })?;
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.is_empty() {
        return Ok(RgbaImage::new(width, height));
    }
    let metrics = measure_words(&words, style)?;
    let available = (width as f32 - 2.0 * BAND_PADDING).max(1.0);
    let layout = fit_caption(&words, &metrics, available, height as f32, style.max_font_size);
    let svg = band_svg(&layout, width, height, &style.families);
    let tree = usvg::Tree::from_str(&svg, &style.options())?;
    resvg::render(&tree, tiny_skia::Transform::default(), &mut pixmap.as_mut());
    Ok(pixmap_to_image(&pixmap))
}

fn pixmap_to_image(pixmap: &tiny_skia::Pixmap) -> RgbaImage {
    let mut image = RgbaImage::new(pixmap.width(), pixmap.height());
    for (target, source) in image.pixels_mut().zip(pixmap.pixels()) {
        let color = source.demultiply();
        *target = Rgba([color.red(), color.green(), color.blue(), color.alpha()]);
    }
    image
}

/// Word advances at `REFERENCE_SIZE`, scaled linearly for other sizes.
#[derive(Debug, Clone)]
pub(crate) struct WordMetrics {
    pub widths: Vec<f32>,
    pub space: f32,
}

fn measure_words(words: &[&str], style: &CaptionStyle) -> Result<WordMetrics, RenderError> {
    let mut svg = String::with_capacity(256 + words.len() * 64);
    svg.push_str(
        r#"<svg xmlns="http://www.w3.org/2000/svg" width="100000" height="200" viewBox="0 0 100000 200">"#,
    );
    let mut push_text = |id: &str, text: &str| {
        svg.push_str(&format!(
            r#"<text id="{id}" x="0" y="150" font-family="{families}" font-weight="bold" font-size="{REFERENCE_SIZE}">{text}</text>"#,
            families = style.families,
            text = escape_xml(text),
        ));
    };
    for (index, word) in words.iter().enumerate() {
        push_text(&format!("w{index}"), word);
    }
    push_text("pair", "I I");
    push_text("solid", "II");
    svg.push_str("</svg>");

    let tree = usvg::Tree::from_str(&svg, &style.options())?;
    let mut measured: HashMap<String, f32> = HashMap::new();
    collect_text_widths(tree.root(), &mut measured);

    let widths = words
        .iter()
        .enumerate()
        .map(|(index, word)| {
            measured
                .get(&format!("w{index}"))
                .copied()
                .unwrap_or_else(|| estimate_width(word))
        })
        .collect();
    let space = match (measured.get("pair"), measured.get("solid")) {
        (Some(pair), Some(solid)) if pair > solid => pair - solid,
        _ => REFERENCE_SIZE * 0.25,
    };
    Ok(WordMetrics { widths, space })
}

fn collect_text_widths(group: &usvg::Group, out: &mut HashMap<String, f32>) {
    for child in group.children() {
        match child {
            usvg::Node::Group(inner) => collect_text_widths(inner.as_ref(), out),
            usvg::Node::Text(text) => {
                let width = text.bounding_box().width();
                if width.is_finite() && width > 0.0 && !text.id().is_empty() {
                    out.insert(text.id().to_string(), width);
                }
            }
            usvg::Node::Path(_) | usvg::Node::Image(_) => {}
        }
    }
}

/// Used when no installed face can shape the word.
fn estimate_width(word: &str) -> f32 {
    word.chars().count() as f32 * REFERENCE_SIZE * 0.6
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct CaptionLayout {
    pub font_size: f32,
    pub lines: Vec<String>,
}

/// Picks the largest size not above `max_size` whose greedy word wrap fits the band.
pub(crate) fn fit_caption(
    words: &[&str],
    metrics: &WordMetrics,
    max_width: f32,
    max_height: f32,
    max_size: f32,
) -> CaptionLayout {
    let mut size = max_size;
    loop {
        let (lines, overflow) = wrap_words(words, metrics, size / REFERENCE_SIZE, max_width);
        let block_height = lines.len() as f32 * size * LINE_HEIGHT;
        let fits = !overflow && block_height <= max_height;
        if fits || size <= MIN_FONT_SIZE {
            return CaptionLayout {
                font_size: size,
                lines,
            };
        }
        size = (size - FONT_SIZE_STEP).max(MIN_FONT_SIZE);
    }
}

fn wrap_words(words: &[&str], metrics: &WordMetrics, scale: f32, max_width: f32) -> (Vec<String>, bool) {
    let mut lines: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut current_width = 0.0f32;
    let mut overflow = false;
    let space = metrics.space * scale;
    for (word, width) in words.iter().zip(metrics.widths.iter()) {
        let width = width * scale;
        if width > max_width {
            overflow = true;
        }
        if current.is_empty() {
            current.push_str(word);
            current_width = width;
        } else if current_width + space + width <= max_width {
            current.push(' ');
            current.push_str(word);
            current_width += space + width;
        } else {
            lines.push(std::mem::take(&mut current));
            current.push_str(word);
            current_width = width;
        }
    }
    if !current.is_empty() {
        lines.push(current);
    }
    (lines, overflow)
}

fn band_svg(layout: &CaptionLayout, width: u32, height: u32, families: &str) -> String {
    let size = layout.font_size;
    let line_height = size * LINE_HEIGHT;
    let block_height = layout.lines.len() as f32 * line_height;
    let top = (height as f32 - block_height) / 2.0;
    let center = width as f32 / 2.0;
    let mut svg = String::with_capacity(512);
    svg.push_str(&format!(
        r#"<svg xmlns="http://www.w3.org/2000/svg" width="{width}" height="{height}" viewBox="0 0 {width} {height}">"#
    ));
    svg.push_str(&format!(
        r##"<text text-anchor="middle" font-family="{families}" font-weight="bold" font-size="{size}" fill="#ffffff" stroke="#000000" stroke-width="{STROKE_WIDTH}">"##
    ));
    for (index, line) in layout.lines.iter().enumerate() {
        let baseline = top + index as f32 * line_height + (line_height - size) / 2.0 + size * ASCENT;
        svg.push_str(&format!(
            r#"<tspan x="{center}" y="{baseline}">{}</tspan>"#,
            escape_xml(line)
        ));
    }
    svg.push_str("</text></svg>");
    svg
}

/// Caption text is data: markup characters are escaped and characters XML cannot carry are
/// dropped.
pub(crate) fn escape_xml(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            '\t' | '\n' | '\r' => out.push(' '),
            ch if ch.is_control() => {}
            ch => out.push(ch),
        }
    }
    out
}
