use crate::pipeline::ErrorKind;
use crate::state::AppState;
use axum::extract::{Query, State};
use axum::http::{HeaderValue, header};
use axum::response::{Html, IntoResponse, Response};
use serde::Deserialize;
use std::sync::Arc;

const INDEX_HEAD: &str = r#"<!doctype html>
<html lang="en">
  <head>
    <meta charset="utf-8" />
    <meta name="viewport" content="width=device-width,initial-scale=1" />
    <title>Meme Generator</title>
    <style>
      body { font-family: system-ui, sans-serif; max-width: 860px; margin: 40px auto; padding: 0 16px; }
      code, pre { background: #f4f4f4; padding: 2px 6px; border-radius: 4px; }
      pre { padding: 12px; overflow-x: auto; }
      .error { background: #fde8e8; border: 1px solid #f5b5b5; padding: 12px; border-radius: 4px; }
      ul.templates { columns: 3; }
    </style>
  </head>
  <body>
    <h1>Meme Generator</h1>
"#;

const INDEX_USAGE: &str = r#"    <h3>Built-in template</h3>
    <pre>GET /{top_text}/{bottom_text}/{template}.jpg</pre>
    <h3>Any image on the web</h3>
    <pre>GET /{top_text}/{bottom_text}/http://example.com/picture.png</pre>
    <p>Underscores become spaces. Leave the top text empty with <code>//bottom_text/template.jpg</code>.</p>
"#;

const INDEX_TAIL: &str = "  </body>\n</html>\n";

#[derive(Debug, Default, Deserialize)]
pub struct IndexQuery {
    pub error: Option<String>,
}

pub async fn index(
    State(state): State<Arc<AppState>>,
    Query(query): Query<IndexQuery>,
) -> Response {
    let error = query.error.as_deref().and_then(ErrorKind::from_query);
    let templates: Vec<(&str, &str)> = state
        .registry
        .names()
        .into_iter()
        .filter_map(|name| state.registry.resolve(name).ok())
        .map(|entry| (entry.name.as_str(), entry.alias.as_str()))
        .collect();
    let mut response = Html(render_index(error, &templates)).into_response();
    let cache_control = format!("public, max-age={}", state.config.index_cache_seconds);
    if let Ok(value) = HeaderValue::from_str(&cache_control) {
        response.headers_mut().insert(header::CACHE_CONTROL, value);
    }
    response.headers_mut().insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    response
}

/// `templates` holds `(name, alias)` pairs in display order.
pub fn render_index(error: Option<ErrorKind>, templates: &[(&str, &str)]) -> String {
    let mut html = String::with_capacity(INDEX_HEAD.len() + INDEX_USAGE.len() + templates.len() * 64);
    html.push_str(INDEX_HEAD);
    if let Some(kind) = error {
        html.push_str(&format!(
            "    <p class=\"error\">{}</p>\n",
            escape_html(kind.message())
        ));
    }
    html.push_str(INDEX_USAGE);
    if !templates.is_empty() {
        html.push_str("    <h3>Templates</h3>\n    <ul class=\"templates\">\n");
        for (name, alias) in templates {
            let label = if name == alias {
                escape_html(name)
            } else {
                format!("{} <small>({})</small>", escape_html(name), escape_html(alias))
            };
            html.push_str(&format!(
                "      <li><a href=\"/one_does_not/simply_walk_into/{}.jpg\">{label}</a></li>\n",
                escape_html(alias)
            ));
        }
        html.push_str("    </ul>\n");
    }
    html.push_str(INDEX_TAIL);
    html
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            ch => out.push(ch),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_error_shows_its_message() {
        let html = render_index(Some(ErrorKind::Url), &[]);
        assert!(html.contains("WAT. That url wasn&#39;t an image"));
        assert!(html.starts_with("<!doctype html>"));
    }

    #[test]
    fn no_error_shows_no_message() {
        let html = render_index(None, &[("standard", "standard")]);
        assert!(!html.contains("class=\"error\""));
        assert!(html.contains("/one_does_not/simply_walk_into/standard.jpg"));
    }

    #[test]
    fn aliases_are_listed_next_to_names() {
        let html = render_index(None, &[("y_u_no", "yuno")]);
        assert!(html.contains("y_u_no <small>(yuno)</small>"));
        assert!(html.contains("/yuno.jpg"));
    }
}
