//! Runtime knobs the orchestrator needs that are not part of any
//! per-run `RunRequest`: image names, credentials seeded into the
//! sandbox database, container resource limits, and timeouts.
//!
//! Matches the config-struct-with-explicit-`Default` idiom
//! `mockforge-chaos`'s `config.rs` uses for its own service
//! configuration (§11.4): a plain `Deserialize` struct loadable from an
//! optional TOML file, with every field defaulted so a bare `serve`
//! invocation works against a local Docker daemon out of the box.

use serde::{Deserialize, Serialize};

/// Sandbox topology configuration: image references, seeded
/// credentials, and lifecycle timeouts shared by every run this
/// orchestrator instance manages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Docker network name prefix; the run's short id is appended.
    pub network_prefix: String,
    /// Image reference for the sandboxed database container.
    pub postgres_image: String,
    /// Seed database role created in the sandbox database.
    pub postgres_user: String,
    /// Seed database role password.
    pub postgres_password: String,
    /// Seed database name.
    pub postgres_db: String,
    /// Port the database listens on inside the sandbox network.
    pub postgres_port: u16,
    /// Memory limit, in bytes, applied to the database container.
    pub database_memory_limit_bytes: i64,
    /// Seconds to poll `pg_isready` before giving up on readiness.
    pub readiness_timeout_seconds: u32,
    /// Image reference for the wire-protocol proxy container.
    pub proxy_image: String,
    /// Port the proxy listens on inside the sandbox network.
    pub proxy_listen_port: u16,
    /// Grace period, in seconds, given to a container on `stop` before
    /// it is killed. `None` lets the Docker daemon's own default apply.
    pub stop_grace_seconds: Option<i64>,
    /// Directory captured container logs are written under, one
    /// subdirectory per run id. `None` skips log capture entirely.
    pub logs_dir: Option<std::path::PathBuf>,
    /// Whether `execute_run` tears the sandbox down itself once the
    /// run reaches a terminal state, or leaves cleanup to a caller
    /// (e.g. a test harness inspecting containers post-mortem).
    pub cleanup_on_finish: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            network_prefix: "chaostrace-net".to_string(),
            postgres_image: "postgres:16-alpine".to_string(),
            postgres_user: "chaostrace".to_string(),
            postgres_password: "chaostrace".to_string(),
            postgres_db: "sandbox".to_string(),
            postgres_port: 5432,
            database_memory_limit_bytes: 512 * 1024 * 1024,
            readiness_timeout_seconds: 30,
            proxy_image: "chaostrace/proxy:latest".to_string(),
            proxy_listen_port: 6432,
            stop_grace_seconds: Some(5),
            logs_dir: None,
            cleanup_on_finish: true,
        }
    }
}
