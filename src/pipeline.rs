use crate::fetch::FetchError;
use crate::state::AppState;
use crate::tokenizer::{self, RequestTokens, Selector, TokenizeError};
use std::time::Instant;
use tracing::{debug, warn};

pub const JOKE_PATH: &str = "/i_see/what_you_did_there/trollface.jpg";

/// Error classes surfaced to clients as `/?error=<kind>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Invalid,
    Tokens,
    Url,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Invalid => "invalid",
            Self::Tokens => "tokens",
            Self::Url => "url",
        }
    }

    pub fn from_query(value: &str) -> Option<Self> {
        match value {
            "invalid" => Some(Self::Invalid),
            "tokens" => Some(Self::Tokens),
            "url" => Some(Self::Url),
            _ => None,
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            Self::Invalid => {
                "Y U NO PICK A VALID MEME?! But seriously, the meme name you provided is not valid."
            }
            Self::Tokens => "Yo dawg, you are missing some url parameters, try harder.",
            Self::Url => "WAT. That url wasn't an image",
        }
    }

    pub fn location(self) -> String {
        format!("/?error={}", self.as_str())
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    Image(Vec<u8>),
    RedirectCanonical(String),
    RedirectError(ErrorKind),
    RedirectJoke,
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Image(_) => "image",
            Self::RedirectCanonical(_) => "canonical",
            Self::RedirectError(kind) => kind.as_str(),
            Self::RedirectJoke => "joke",
        }
    }
}

/// Runs one meme request end to end. Every failure is classified once into a redirect; nothing
/// is retried.
pub async fn build_meme(state: &AppState, raw_path: &str, self_host: &str) -> Outcome {
    let outcome = classify(state, raw_path, self_host).await;
    state.metrics.observe_meme_outcome(outcome.label());
    outcome
}

async fn classify(state: &AppState, raw_path: &str, self_host: &str) -> Outcome {
    let tokens = match tokenizer::tokenize(raw_path) {
        Ok(tokens) => tokens,
        Err(TokenizeError::MalformedPath { canonical }) => {
            return Outcome::RedirectCanonical(canonical);
        }
        Err(err @ TokenizeError::MissingTokens { .. }) => {
            warn!(path = %raw_path, error = %err, "meme request rejected");
            return Outcome::RedirectError(ErrorKind::Tokens);
        }
    };
    match &tokens.selector {
        Selector::Template(selector) => render_template(state, raw_path, selector, &tokens).await,
        Selector::RemoteUrl(url) => render_remote(state, raw_path, url, &tokens, self_host).await,
    }
}

async fn render_template(
    state: &AppState,
    raw_path: &str,
    selector: &str,
    tokens: &RequestTokens,
) -> Outcome {
    let entry = match state.registry.resolve(selector) {
        Ok(entry) => entry,
        Err(err) => {
            warn!(path = %raw_path, error = %err, "meme request rejected");
            return Outcome::RedirectError(ErrorKind::Invalid);
        }
    };
    let started = Instant::now();
    let result = state
        .compositor
        .render(&entry.image_path, &tokens.top_text, &tokens.bottom_text, entry.width)
        .await;
    state
        .metrics
        .observe_render_duration("template", started.elapsed());
    match result {
        Ok(bytes) => {
            debug!(template = %entry.name, size = bytes.len(), "rendered template meme");
            Outcome::Image(bytes)
        }
        Err(err) => {
            warn!(path = %raw_path, template = %entry.name, error = ?err, "template render failed");
            Outcome::RedirectError(ErrorKind::Invalid)
        }
    }
}

async fn render_remote(
    state: &AppState,
    raw_path: &str,
    url: &str,
    tokens: &RequestTokens,
    self_host: &str,
) -> Outcome {
    let started = Instant::now();
    let asset = match state.fetcher.fetch(url, self_host).await {
        Ok(asset) => {
            state
                .metrics
                .observe_fetch_duration("ok", started.elapsed());
            asset
        }
        Err(FetchError::SelfReferential) => {
            debug!(path = %raw_path, "remote url points back here");
            return Outcome::RedirectJoke;
        }
        Err(err) => {
            state
                .metrics
                .observe_fetch_duration("error", started.elapsed());
            state.metrics.observe_fetch_failure(err.kind());
            warn!(path = %raw_path, kind = err.kind(), error = ?err, "remote fetch failed");
            return Outcome::RedirectError(ErrorKind::Url);
        }
    };
    let started = Instant::now();
    let result = state
        .compositor
        .render(
            asset.path(),
            &tokens.top_text,
            &tokens.bottom_text,
            state.config.remote_render_width,
        )
        .await;
    state
        .metrics
        .observe_render_duration("remote", started.elapsed());
    drop(asset);
    match result {
        Ok(bytes) => Outcome::Image(bytes),
        Err(err) => {
            warn!(path = %raw_path, error = ?err, "remote render failed");
            Outcome::RedirectError(ErrorKind::Url)
        }
    }
}
