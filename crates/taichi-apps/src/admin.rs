//! Administration application
//!
//! Synchronous request/response application mounted as the gateway's
//! catch-all. It serves the health probe, the welcome page and read-only
//! views of the loaded configuration.

use std::sync::Arc;

use axum::http::{Method, StatusCode};
use chrono::{DateTime, Utc};
use serde::Serialize;
use taichi_config::Configuration;
use taichi_core::{AppRequest, AppResponse, AppResult, RequestResponseApp};
use tracing::debug;

/// Release string shown to users
pub const RELEASE: &str = "0.9.9.17-DEV";

/// Text served at `/`
pub const WELCOME_MESSAGE: &str = concat!(
    "TaiChi OS\n",
    "Version : 0.9.9.17-DEV\n",
    "GITHUB : https://github.com/Xingsandesu\n"
);

#[derive(Debug, Serialize)]
struct Health {
    status: &'static str,
    version: &'static str,
    started_at: DateTime<Utc>,
    uptime_secs: i64,
}

#[derive(Debug, Serialize)]
struct InstallCommands {
    commands: Vec<String>,
    one_line: String,
}

#[derive(Debug, Serialize)]
struct NotFound<'a> {
    error: &'static str,
    message: String,
    path: &'a str,
}

/// Administration API over the loaded [`Configuration`]
#[derive(Debug, Clone)]
pub struct AdminApp {
    config: Arc<Configuration>,
    started_at: DateTime<Utc>,
}

impl AdminApp {
    pub fn new(config: Arc<Configuration>) -> Self {
        Self {
            config,
            started_at: Utc::now(),
        }
    }

    fn health(&self) -> AppResult<AppResponse> {
        let now = Utc::now();
        AppResponse::json(
            StatusCode::OK,
            &Health {
                status: "ok",
                version: RELEASE,
                started_at: self.started_at,
                uptime_secs: (now - self.started_at).num_seconds(),
            },
        )
    }

    fn install_commands(&self) -> AppResult<AppResponse> {
        AppResponse::json(
            StatusCode::OK,
            &InstallCommands {
                commands: self.config.install_docker_commands(),
                one_line: self.config.get_docker_shell_command().to_string(),
            },
        )
    }

    fn not_found(&self, request: &AppRequest) -> AppResult<AppResponse> {
        debug!(method = %request.method, path = %request.path, "No admin route");
        AppResponse::json(
            StatusCode::NOT_FOUND,
            &NotFound {
                error: "not_found",
                message: format!("{} {} not found", request.method, request.path),
                path: &request.path,
            },
        )
    }
}

impl RequestResponseApp for AdminApp {
    fn call(&self, request: AppRequest) -> AppResult<AppResponse> {
        if request.method != Method::GET && request.method != Method::HEAD {
            return self.not_found(&request);
        }

        match request.path.as_str() {
            "/health" => self.health(),
            "/" => Ok(AppResponse::text(StatusCode::OK, WELCOME_MESSAGE)),
            "/api/config" => AppResponse::json(StatusCode::OK, self.config.as_ref()),
            "/api/docker/install-commands" => self.install_commands(),
            _ => self.not_found(&request),
        }
    }
}
