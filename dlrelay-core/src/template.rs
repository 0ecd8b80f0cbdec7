//! Placeholder substitution for served pages and scripts.

use std::path::Path;

use crate::config::Config;

pub const MEASUREMENT_ID_TOKEN: &str = "{{GA4_PROPERTY}}";
pub const ENDPOINT_TOKEN: &str = "{{SERVER_CONTAINER_URL}}";

/// Used for `{{SERVER_CONTAINER_URL}}` when no endpoint is configured.
pub const DEFAULT_ENDPOINT: &str = "https://localhost:8888";

/// Values substituted into text files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateVars {
    pub measurement_id: String,
    pub endpoint: String,
}

impl TemplateVars {
    pub fn from_config(config: &Config) -> Self {
        Self {
            measurement_id: config.relay.measurement_id.clone(),
            endpoint: config
                .relay
                .server_container_url
                .clone()
                .filter(|url| !url.is_empty())
                .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
        }
    }

    /// Replace every occurrence of both tokens.
    pub fn substitute(&self, text: &str) -> String {
        text.replace(MEASUREMENT_ID_TOKEN, &self.measurement_id)
            .replace(ENDPOINT_TOKEN, &self.endpoint)
    }
}

/// Content type for files that get substitution, `None` for everything else.
pub fn template_content_type(path: &Path) -> Option<&'static str> {
    match extension(path).as_deref() {
        Some("js") => Some("application/javascript"),
        Some("html") => Some("text/html"),
        _ => None,
    }
}

/// Content type for files served unchanged, guessed from the extension.
pub fn static_content_type(path: &Path) -> String {
    mime_guess::from_path(path)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}
