use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::rejection::JsonRejection,
    extract::{Path, State},
    http::{Request, StatusCode},
    response::{Html, IntoResponse},
    routing::{delete, get},
    Json, Router,
};
use axum_server::tls_rustls::RustlsConfig;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tera::Tera;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::azure::auth::{AccessToken, CredentialProvider};
use crate::azure::graph::{DirectoryClient, GraphError, NewUser, User};
use crate::comms::error::ApiError;
use crate::config::Config;
use crate::utils::temp_file::CertificateFile;

type SharedState = Arc<AppState>;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct AppState {
    pub templates: Option<Arc<Tera>>,
    pub static_dir: String,
    pub credentials: CredentialProvider,
    pub directory: DirectoryClient,
}

impl AppState {
    pub fn new(
        config: Arc<Config>,
        http_client: reqwest::Client,
        templates_dir: &str,
        static_dir: &str,
    ) -> Self {
        let pattern = format!("{}/**/*.html", templates_dir.trim_end_matches('/'));
        let templates = match Tera::new(&pattern) {
            Ok(t) => {
                debug!("Loaded {} templates", t.get_template_names().count());
                Some(Arc::new(t))
            }
            Err(e) => {
                error!("Template parsing error: {}", e);
                None
            }
        };

        let credentials = CredentialProvider::for_graph(http_client.clone(), &config);
        let directory =
            DirectoryClient::new(http_client, &config.graph_api_url, config.role_concurrency);

        Self {
            templates,
            static_dir: static_dir.to_string(),
            credentials,
            directory,
        }
    }

    async fn graph_token(&self) -> Result<AccessToken, ApiError> {
        self.credentials.acquire_token().await.map_err(|e| {
            error!(error = %e, "failed to acquire graph token");
            ApiError::internal("Error getting access token")
        })
    }

    fn render(&self, template: &str, failure: &str) -> Result<Html<String>, ApiError> {
        let templates = self.templates.as_ref().ok_or_else(|| {
            error!("templates not loaded");
            ApiError::internal(failure)
        })?;
        templates
            .render(template, &tera::Context::new())
            .map(Html)
            .map_err(|e| {
                error!("Template render error: {}", e);
                ApiError::internal(failure)
            })
    }
}

async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

async fn home_page(State(state): State<SharedState>) -> Result<Html<String>, ApiError> {
    state.render("home.html", "Error loading homepage")
}

async fn users_page(State(state): State<SharedState>) -> Result<Html<String>, ApiError> {
    state.render("users.html", "Error loading users page")
}

// Token per request; no caching between calls
async fn list_users(State(state): State<SharedState>) -> Result<Json<Vec<User>>, ApiError> {
    let token = state.graph_token().await?;
    let users = state.directory.list_users(&token).await.map_err(|e| {
        error!(error = %e, "failed to fetch users");
        ApiError::internal("Error fetching users")
    })?;
    Ok(Json(users))
}

async fn create_user(
    State(state): State<SharedState>,
    payload: Result<Json<NewUser>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(new_user) = payload.map_err(|e| {
        warn!(error = %e, "rejected create user payload");
        ApiError::bad_request("Error decoding user data")
    })?;
    if new_user.display_name.trim().is_empty() || new_user.user_principal_name.trim().is_empty() {
        return Err(ApiError::bad_request(
            "displayName and userPrincipalName are required",
        ));
    }

    let token = state.graph_token().await?;
    state
        .directory
        .create_user(&token, &new_user)
        .await
        .map_err(|e| {
            error!(error = %e, "failed to create user");
            ApiError::internal("Error creating user")
        })?;

    Ok((StatusCode::CREATED, "User created successfully"))
}

async fn delete_user(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = id.trim();
    if id.is_empty() {
        return Err(ApiError::bad_request("User ID is required"));
    }

    let token = state.graph_token().await?;
    state
        .directory
        .delete_user(&token, id)
        .await
        .map_err(|e| match e {
            GraphError::InvalidId(_) => ApiError::bad_request("Invalid user ID"),
            e => {
                error!(user_id = %id, error = %e, "failed to delete user");
                ApiError::internal(format!("Error deleting user: {}", e))
            }
        })?;

    Ok((StatusCode::OK, "User deleted successfully"))
}

async fn missing_user_id() -> ApiError {
    ApiError::bad_request("User ID is required")
}

pub fn create_router(state: SharedState) -> Router {
    let static_files = ServeDir::new(&state.static_dir);

    Router::new()
        .route("/", get(home_page))
        .route("/users", get(users_page))
        .route("/health", get(health))
        .route("/api/users", get(list_users).post(create_user))
        .route("/api/users/", delete(missing_user_id))
        .route("/api/users/{id}", delete(delete_user))
        .nest_service("/static", static_files)
        .layer(
            TraceLayer::new_for_http().make_span_with(|req: &Request<Body>| {
                info_span!(
                    "request",
                    method = %req.method(),
                    uri = %req.uri(),
                    request_id = %Uuid::new_v4()
                )
            }),
        )
        .with_state(state)
}

/// Serve the router over TLS until ctrl-c or SIGTERM.
///
/// `certificate` holds the PEM certificate chain and private key in one file.
pub async fn serve(state: SharedState, addr: SocketAddr, certificate: &CertificateFile) -> Result<()> {
    let tls = RustlsConfig::from_pem_file(certificate.path(), certificate.path())
        .await
        .context("loading TLS certificate bundle")?;

    let handle = axum_server::Handle::new();
    tokio::spawn(shutdown_on_signal(handle.clone()));

    let app = create_router(state);
    info!("HTTPS server listening on {}", addr);
    axum_server::bind_rustls(addr, tls)
        .handle(handle)
        .serve(app.into_make_service())
        .await
        .with_context(|| format!("serving on {}", addr))?;

    info!("HTTPS server stopped");
    Ok(())
}

async fn shutdown_on_signal(handle: axum_server::Handle) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(?err, "failed to install ctrl-c handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => warn!(?err, "failed to install sigterm handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received");
    handle.graceful_shutdown(Some(SHUTDOWN_GRACE));
}
