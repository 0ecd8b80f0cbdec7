//! dlrelay-serve - local development server for the relay test site
//!
//! Serves `/src/*` from the script root and everything else from the site
//! root. `.js` and `.html` files have `{{GA4_PROPERTY}}` and
//! `{{SERVER_CONTAINER_URL}}` substituted; other files are sent unchanged.
//!
//! Configuration comes from `$XDG_CONFIG_HOME/dlrelay/config.toml`, with
//! `GA4_PROPERTY`, `SERVER_CONTAINER_URL` and `PORT` taking precedence.

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::{header, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use dlrelay_core::template::{static_content_type, template_content_type, TemplateVars};
use dlrelay_core::Config;
use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;

/// What the handlers need to resolve and render files
struct ServeState {
    vars: TemplateVars,
    site_root: PathBuf,
    script_root: PathBuf,
}

impl ServeState {
    fn from_config(config: &Config) -> Self {
        Self {
            vars: TemplateVars::from_config(config),
            site_root: config.server.site_root.clone(),
            script_root: config.server.script_root.clone(),
        }
    }

    /// Map a request path onto a file path. `None` for anything that would
    /// leave its root.
    fn resolve(&self, request_path: &str) -> Option<PathBuf> {
        let decoded = urlencoding::decode(request_path).ok()?;
        let (root, relative) = match decoded.strip_prefix("/src/") {
            Some(rest) => (&self.script_root, rest),
            None => (&self.site_root, decoded.trim_start_matches('/')),
        };

        let relative = Path::new(relative);
        if !relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
        {
            return None;
        }
        Some(root.join(relative))
    }
}

fn create_router(state: Arc<ServeState>) -> Router {
    Router::new()
        .route("/", get(index))
        .fallback(serve_file)
        .with_state(state)
}

async fn index(State(state): State<Arc<ServeState>>) -> Response {
    let path = state.site_root.join("index.html");
    match tokio::fs::read_to_string(&path).await {
        Ok(content) => render(&state.vars, &content, "text/html"),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Failed to read index.html");
            (StatusCode::INTERNAL_SERVER_ERROR, "Error reading index.html").into_response()
        }
    }
}

async fn serve_file(State(state): State<Arc<ServeState>>, uri: Uri) -> Response {
    let Some(path) = state.resolve(uri.path()) else {
        return not_found();
    };

    match tokio::fs::metadata(&path).await {
        Ok(meta) if meta.is_file() => {}
        _ => return not_found(),
    }

    if let Some(content_type) = template_content_type(&path) {
        return match tokio::fs::read_to_string(&path).await {
            Ok(content) => render(&state.vars, &content, content_type),
            Err(e) => read_error(&path, e),
        };
    }

    match tokio::fs::read(&path).await {
        Ok(bytes) => ([(header::CONTENT_TYPE, static_content_type(&path))], bytes).into_response(),
        Err(e) => read_error(&path, e),
    }
}

fn render(vars: &TemplateVars, content: &str, content_type: &'static str) -> Response {
    ([(header::CONTENT_TYPE, content_type)], vars.substitute(content)).into_response()
}

fn read_error(path: &Path, e: std::io::Error) -> Response {
    tracing::warn!(path = %path.display(), error = %e, "Failed to read file");
    (StatusCode::INTERNAL_SERVER_ERROR, "Error reading file").into_response()
}

fn not_found() -> Response {
    (StatusCode::NOT_FOUND, "Not Found").into_response()
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load().context("failed to load configuration")?;
    let _log_guard = dlrelay_core::logging::init(&config.logging, config.relay.debug)
        .context("failed to initialize logging")?;

    let state = Arc::new(ServeState::from_config(&config));
    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));

    println!("Template server running on http://localhost:{}", config.server.port);
    println!("GA4 Property: {}", state.vars.measurement_id);
    println!("Server Container URL: {}", state.vars.endpoint);
    println!(
        "Serving {} (and /src/ from {}) with placeholder substitution",
        state.site_root.display(),
        state.script_root.display()
    );

    tracing::info!(address = %addr, "Starting development server");

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind to {}", addr))?;

    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    tracing::info!("Development server stopped");
    Ok(())
}

/// Waits for CTRL+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received CTRL+C, shutting down"),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down"),
    }
}
