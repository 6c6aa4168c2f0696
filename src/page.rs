//! Landing page with an editor pre-filled from the query string

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Deserialize;

use crate::protocol::clamp_timeout;
use crate::server::AppState;

const TEMPLATE: &str = include_str!("../templates/index.html");
const DEFAULT_VERSION: &str = "latest";

#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
    code: Option<String>,
    files: Option<String>,
    workload: Option<String>,
    version: Option<String>,
    timeout: Option<String>,
}

#[derive(Debug, PartialEq)]
pub struct PageData {
    pub code: String,
    pub workload: String,
    pub version: String,
    pub timeout: u64,
    pub files: String,
}

impl PageData {
    /// `code` and `files` arrive base64 encoded; empty parameters count as absent
    pub fn from_query(query: PageQuery, max_timeout_ms: u64) -> Result<Self, String> {
        let code = decode_param(query.code, "code")?.unwrap_or_default();
        let files = decode_param(query.files, "files")?.unwrap_or_else(|| "{}".to_string());

        let timeout = match non_empty(query.timeout) {
            Some(raw) => {
                let requested: i64 = raw
                    .trim()
                    .parse()
                    .map_err(|e| format!("Bad timeout: {}", e))?;
                clamp_timeout(requested, max_timeout_ms).as_millis() as u64
            }
            None => max_timeout_ms,
        };

        Ok(Self {
            code,
            workload: non_empty(query.workload).unwrap_or_default(),
            version: non_empty(query.version).unwrap_or_else(|| DEFAULT_VERSION.to_string()),
            timeout,
            files,
        })
    }

    pub fn render(&self) -> String {
        let timeout = self.timeout.to_string();
        render_template(TEMPLATE, |name| match name {
            "code" => Some(self.code.as_str()),
            "files" => Some(self.files.as_str()),
            "workload" => Some(self.workload.as_str()),
            "version" => Some(self.version.as_str()),
            "timeout" => Some(timeout.as_str()),
            _ => None,
        })
    }
}

pub async fn index_handler(
    State(state): State<AppState>,
    Query(query): Query<PageQuery>,
) -> Response {
    match PageData::from_query(query, state.evaluator.max_timeout_ms()) {
        Ok(data) => Html(data.render()).into_response(),
        Err(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

fn decode_param(value: Option<String>, name: &str) -> Result<Option<String>, String> {
    let Some(encoded) = non_empty(value) else {
        return Ok(None);
    };
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|_| format!("Failed to decode {} parameter", name))?;
    Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
}

/// Substitute `{{name}}` placeholders in one pass, HTML-escaping each value.
/// Unknown placeholders are left as they are.
fn render_template<'a>(template: &str, lookup: impl Fn(&str) -> Option<&'a str>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let name = &after[..end];
                match lookup(name.trim()) {
                    Some(value) => out.push_str(&escape_html(value)),
                    None => {
                        out.push_str("{{");
                        out.push_str(name);
                        out.push_str("}}");
                    }
                }
                rest = &after[end + 2..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

fn escape_html(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}
