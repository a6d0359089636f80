use percent_encoding::percent_decode_str;
use std::borrow::Cow;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    Template(String),
    RemoteUrl(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestTokens {
    pub top_text: String,
    pub bottom_text: String,
    pub selector: Selector,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenizeError {
    #[error("path contains spaces, canonical form is {canonical}")]
    MalformedPath { canonical: String },
    #[error("expected /top/bottom/template, got {segments} segments")]
    MissingTokens { segments: usize },
}

/// Splits a raw request path (query string included) into caption texts and a selector.
pub fn tokenize(raw_path: &str) -> Result<RequestTokens, TokenizeError> {
    let path = unescape(raw_path);
    if path.contains(' ') {
        return Err(TokenizeError::MalformedPath {
            canonical: path.replace(' ', "_"),
        });
    }

    let mut segments: Vec<&str> = path.split('/').collect();
    while segments.len() > 1 && segments.last() == Some(&"") {
        segments.pop();
    }
    if segments.len() > 3 && segments.first().is_some_and(|first| first.is_empty()) {
        segments.remove(0);
    }

    if let Some(url) = remote_url(&path) {
        let top = segments.first().copied().unwrap_or_default();
        let bottom = segments.get(1).copied().unwrap_or_default();
        return Ok(RequestTokens {
            top_text: top_caption(top),
            bottom_text: caption(bottom),
            selector: Selector::RemoteUrl(url.to_string()),
        });
    }

    if segments.len() != 3 {
        return Err(TokenizeError::MissingTokens {
            segments: segments.len(),
        });
    }
    Ok(RequestTokens {
        top_text: top_caption(segments[0]),
        bottom_text: caption(segments[1]),
        selector: Selector::Template(segments[2].to_string()),
    })
}

/// Form-style unescape: `+` is a space, invalid UTF-8 becomes U+FFFD.
fn unescape(raw: &str) -> String {
    let plus_decoded: Cow<'_, str> = if raw.contains('+') {
        Cow::Owned(raw.replace('+', " "))
    } else {
        Cow::Borrowed(raw)
    };
    percent_decode_str(&plus_decoded)
        .decode_utf8_lossy()
        .into_owned()
}

/// Finds the first `/http:/` or `/https:/` and returns everything after the slash.
fn remote_url(path: &str) -> Option<&str> {
    let mut offset = 0;
    while let Some(found) = path[offset..].find("/http") {
        let start = offset + found + 1;
        let rest = &path[start..];
        if rest.starts_with("http:/") || rest.starts_with("https:/") {
            return Some(rest);
        }
        offset = start;
    }
    None
}

fn caption(token: &str) -> String {
    token.to_uppercase().replace('_', " ")
}

fn top_caption(token: &str) -> String {
    let text = caption(token);
    if text.is_empty() { " ".to_string() } else { text }
}
