//! §4.8 Run Orchestrator: stands up one run's isolated sandbox
//! (network + database + proxy + agent containers), watches the agent
//! to completion or timeout, assigns a verdict, and tears the sandbox
//! back down.
//!
//! Grounded on `original_source/chaostrace/control_plane/services/
//! orchestrator.py`'s `RunOrchestrator`: the same
//! initialize/monitor/finalize/cleanup phases, the same verdict
//! mapping, and the same `finally`-discipline cleanup, reimplemented
//! against `bollard` instead of the `docker` Python SDK.

mod config;
mod verdict;

pub use config::OrchestratorConfig;
pub use verdict::verdict_for;

use std::collections::HashMap as StdHashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, LogsOptions, RemoveContainerOptions,
    StopContainerOptions,
};
use bollard::exec::CreateExecOptions;
use bollard::network::CreateNetworkOptions;
use bollard::secret::HostConfig;
use bollard::Docker;
use chaostrace_foundation::now;
use chaostrace_model::{
    Event, EventEnvelope, RunId, RunListResponse, RunRequest, RunResponse, RunState, RunStatus,
    RunSummary, RunLifecycleEvent, SandboxHandles, Verdict,
};
use chaostrace_store::EventStore;
use futures::StreamExt;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Errors surfaced while bringing up, monitoring, or tearing down a
/// run's sandbox.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// The Docker daemon rejected a request.
    #[error("docker error: {0}")]
    Docker(#[from] bollard::errors::Error),
    /// `request.validate()` rejected the run request.
    #[error("invalid run request: {0}")]
    InvalidRequest(String),
    /// The database never became ready within the readiness timeout.
    #[error("database did not become ready within {0}s")]
    DatabaseNotReady(u32),
    /// No run with this id is known to the orchestrator.
    #[error("unknown run: {0}")]
    UnknownRun(RunId),
}

/// One run's sandbox lifecycle task plus the means to cancel it
/// (§4.8's "`terminate_run` cancels the run task").
struct RunHandle {
    task: JoinHandle<()>,
}

/// Manages every run's sandbox lifecycle. Cheap to clone — an
/// `Arc`-backed handle sharing one Docker client, one registry, and
/// one event store.
#[derive(Clone)]
pub struct RunOrchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    docker: Docker,
    config: OrchestratorConfig,
    store: EventStore,
    runs: RwLock<StdHashMap<RunId, RunState>>,
    handles: AsyncMutex<StdHashMap<RunId, RunHandle>>,
}

impl RunOrchestrator {
    /// Build an orchestrator around an already-connected Docker
    /// client.
    pub fn new(docker: Docker, config: OrchestratorConfig, store: EventStore) -> Self {
        Self {
            inner: Arc::new(Inner {
                docker,
                config,
                store,
                runs: RwLock::new(StdHashMap::new()),
                handles: AsyncMutex::new(StdHashMap::new()),
            }),
        }
    }

    /// Connect to the local Docker daemon via its default socket.
    pub fn connect_local(config: OrchestratorConfig, store: EventStore) -> Result<Self, OrchestratorError> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self::new(docker, config, store))
    }

    /// Accept a run request, mint its id, and spawn its sandbox
    /// lifecycle task. Returns immediately with `status=PENDING`
    /// (§4.8's contract).
    pub async fn create_run(&self, request: RunRequest) -> Result<RunResponse, OrchestratorError> {
        request.validate().map_err(OrchestratorError::InvalidRequest)?;

        let run_id = RunId::new();
        let state = RunState::new(run_id, request);
        self.inner.runs.write().insert(run_id, state);

        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            execute_run(inner, run_id).await;
        });
        self.inner.handles.lock().await.insert(run_id, RunHandle { task });

        Ok(RunResponse { run_id, status: RunStatus::Pending })
    }

    /// A snapshot of one run's current state.
    pub fn get_run_status(&self, run_id: RunId) -> Option<RunState> {
        self.inner.runs.read().get(&run_id).cloned()
    }

    /// A newest-first page of run summaries (§4.8's concurrent-read
    /// registry).
    pub fn list_runs(&self, page: usize, page_size: usize) -> RunListResponse {
        let runs = self.inner.runs.read();
        let mut summaries: Vec<RunSummary> = runs.values().map(RunSummary::from).collect();
        summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let total = summaries.len();
        let page = page.max(1);
        let start = (page - 1) * page_size;
        let page_items = summaries.into_iter().skip(start).take(page_size).collect();
        RunListResponse { runs: page_items, total, page, page_size }
    }

    /// Cancel a run's lifecycle task, mark it TERMINATED, and run
    /// cleanup. Returns `false` if no such run was known or it had
    /// already reached a terminal state.
    pub async fn terminate_run(&self, run_id: RunId) -> bool {
        let already_terminal = self
            .inner
            .runs
            .read()
            .get(&run_id)
            .map(|s| s.is_terminal())
            .unwrap_or(true);
        if already_terminal {
            return false;
        }

        if let Some(handle) = self.inner.handles.lock().await.remove(&run_id) {
            handle.task.abort();
        }

        transition(&self.inner, run_id, RunStatus::Terminated, "Run terminated by operator".to_string(), None).await;
        cleanup_run(Arc::clone(&self.inner), run_id).await;
        true
    }
}

async fn execute_run(inner: Arc<Inner>, run_id: RunId) {
    let result = initialize_run(&inner, run_id).await;

    let outcome = match result {
        Ok(()) => monitor_run(&inner, run_id).await,
        Err(err) => {
            error!(%run_id, %err, "run initialization failed");
            transition(&inner, run_id, RunStatus::Failed, err.to_string(), None).await;
            Err(err)
        }
    };

    if let Err(err) = outcome {
        warn!(%run_id, %err, "run ended with an error");
    } else {
        finalize_run(&inner, run_id).await;
    }

    if inner.config.cleanup_on_finish {
        cleanup_run(Arc::clone(&inner), run_id).await;
    }
}

async fn initialize_run(inner: &Arc<Inner>, run_id: RunId) -> Result<(), OrchestratorError> {
    transition(inner, run_id, RunStatus::Initializing, "Creating sandbox topology".to_string(), None).await;

    let request = inner
        .runs
        .read()
        .get(&run_id)
        .map(|s| s.request.clone())
        .ok_or(OrchestratorError::UnknownRun(run_id))?;

    let network_name = format!("{}-{}", inner.config.network_prefix, short_id(run_id));
    create_network(inner, &network_name).await?;
    set_handle(inner, run_id, |h| h.network_id = Some(network_name.clone()));

    let db_name = format!("chaostrace-db-{}", short_id(run_id));
    start_postgres(inner, &db_name, &network_name).await?;
    set_handle(inner, run_id, |h| h.database_container_id = Some(db_name.clone()));
    wait_for_postgres(inner, &db_name).await?;

    let proxy_name = format!("chaostrace-proxy-{}", short_id(run_id));
    start_proxy(inner, &proxy_name, &network_name, &db_name, run_id).await?;
    set_handle(inner, run_id, |h| h.proxy_container_id = Some(proxy_name.clone()));

    let agent_name = format!("chaostrace-agent-{}", short_id(run_id));
    start_agent(inner, &agent_name, &network_name, &proxy_name, &request).await?;
    set_handle(inner, run_id, |h| h.agent_container_id = Some(agent_name.clone()));

    {
        let mut runs = inner.runs.write();
        if let Some(state) = runs.get_mut(&run_id) {
            state.started_at = Some(now());
        }
    }
    transition(inner, run_id, RunStatus::Running, "Agent container started".to_string(), None).await;
    Ok(())
}

async fn monitor_run(inner: &Arc<Inner>, run_id: RunId) -> Result<(), OrchestratorError> {
    let (timeout_seconds, agent_name) = {
        let runs = inner.runs.read();
        let state = runs.get(&run_id).ok_or(OrchestratorError::UnknownRun(run_id))?;
        (state.request.timeout_seconds, state.handles.agent_container_id.clone())
    };
    let Some(agent_name) = agent_name else {
        transition(inner, run_id, RunStatus::Failed, "agent container was never started".to_string(), None).await;
        return Ok(());
    };

    let start = now();
    loop {
        sleep(StdDuration::from_secs(1)).await;
        let elapsed = (now() - start).num_seconds().max(0) as u32;
        if elapsed >= timeout_seconds {
            transition(inner, run_id, RunStatus::Terminated, "Run timed out".to_string(), None).await;
            return Ok(());
        }

        match inner.docker.inspect_container(&agent_name, None).await {
            Ok(inspect) => {
                let state = inspect.state.unwrap_or_default();
                let running = state.running.unwrap_or(false);
                if !running {
                    let exit_code = state.exit_code.unwrap_or(-1);
                    if exit_code == 0 {
                        transition(inner, run_id, RunStatus::Completed, "Agent exited successfully".to_string(), None).await;
                    } else {
                        transition(
                            inner,
                            run_id,
                            RunStatus::Failed,
                            format!("Agent exited with code {exit_code}"),
                            None,
                        )
                        .await;
                    }
                    return Ok(());
                }
            }
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => {
                transition(inner, run_id, RunStatus::Failed, "Agent container not found".to_string(), None).await;
                return Ok(());
            }
            Err(err) => return Err(OrchestratorError::Docker(err)),
        }
    }
}

async fn finalize_run(inner: &Arc<Inner>, run_id: RunId) {
    let status = {
        let runs = inner.runs.read();
        let Some(state) = runs.get(&run_id) else { return };
        state.status
    };

    // The event store, not this run's in-memory counters, is the
    // authoritative source for what actually happened on the wire
    // (§4.4) — pull the live tallies from it rather than fields this
    // struct would otherwise have to keep in lockstep with the proxy.
    let stats = inner.store.get_run_stats(run_id).await.unwrap_or_default();
    let verdict = verdict::verdict_for(status, !stats.violation_reasons.is_empty(), stats.blocked_events);

    let mut runs = inner.runs.write();
    if let Some(state) = runs.get_mut(&run_id) {
        state.verdict = Some(verdict);
        state.ended_at.get_or_insert(now());
        state.total_statements = stats.sql_events;
        state.blocked_statements = stats.blocked_events;
        state.chaos_events_fired = stats.chaos_events;
        state.violation_reasons = stats.violation_reasons;
    }
}

async fn cleanup_run(inner: Arc<Inner>, run_id: RunId) {
    let handles = {
        let runs = inner.runs.read();
        runs.get(&run_id).map(|s| s.handles.clone())
    };
    let Some(handles) = handles else { return };

    transition_silent(&inner, run_id, RunStatus::Cleanup).await;

    for container in [&handles.agent_container_id, &handles.proxy_container_id, &handles.database_container_id] {
        if let Some(name) = container {
            capture_logs(&inner, run_id, name).await;
        }
    }
    for container in [&handles.agent_container_id, &handles.proxy_container_id, &handles.database_container_id] {
        if let Some(name) = container {
            remove_container(&inner, name).await;
        }
    }
    if let Some(network_id) = &handles.network_id {
        remove_network(&inner, network_id).await;
    }
}

async fn capture_logs(inner: &Arc<Inner>, run_id: RunId, container_name: &str) {
    let Some(dir) = inner.config.logs_dir.as_ref() else { return };
    let run_dir = dir.join(run_id.to_string());
    if let Err(err) = std::fs::create_dir_all(&run_dir) {
        warn!(%run_id, %err, "failed to create run log directory");
        return;
    }

    let options = LogsOptions::<String> { stdout: true, stderr: true, ..Default::default() };
    let mut stream = inner.docker.logs(container_name, Some(options));
    let mut buffer = Vec::new();
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(log_output) => buffer.extend_from_slice(&log_output.into_bytes()),
            Err(err) => {
                warn!(%run_id, container = container_name, %err, "failed to read container logs");
                break;
            }
        }
    }
    let log_path = run_dir.join(format!("{container_name}.log"));
    if let Err(err) = std::fs::write(&log_path, &buffer) {
        warn!(%run_id, %err, "failed to write captured container logs");
    }
}

async fn remove_container(inner: &Arc<Inner>, name: &str) {
    let stop_opts = StopContainerOptions { t: inner.config.stop_grace_seconds };
    if let Err(err) = inner.docker.stop_container(name, Some(stop_opts)).await {
        if !is_not_found(&err) {
            warn!(container = name, %err, "failed to stop container");
        }
    }
    let remove_opts = RemoveContainerOptions { force: true, ..Default::default() };
    if let Err(err) = inner.docker.remove_container(name, Some(remove_opts)).await {
        if !is_not_found(&err) {
            warn!(container = name, %err, "failed to remove container");
        }
    }
}

async fn remove_network(inner: &Arc<Inner>, network_id: &str) {
    if let Err(err) = inner.docker.remove_network(network_id).await {
        if !is_not_found(&err) {
            warn!(network = network_id, %err, "failed to remove network");
        }
    }
}

fn is_not_found(err: &bollard::errors::Error) -> bool {
    matches!(err, bollard::errors::Error::DockerResponseServerError { status_code: 404, .. })
}

async fn create_network(inner: &Arc<Inner>, name: &str) -> Result<(), OrchestratorError> {
    let options = CreateNetworkOptions {
        name: name.to_string(),
        driver: "bridge".to_string(),
        internal: true,
        check_duplicate: true,
        ..Default::default()
    };
    inner.docker.create_network(options).await?;
    Ok(())
}

async fn start_postgres(inner: &Arc<Inner>, name: &str, network_name: &str) -> Result<(), OrchestratorError> {
    let env = vec![
        format!("POSTGRES_USER={}", inner.config.postgres_user),
        format!("POSTGRES_PASSWORD={}", inner.config.postgres_password),
        format!("POSTGRES_DB={}", inner.config.postgres_db),
    ];
    let host_config = HostConfig {
        network_mode: Some(network_name.to_string()),
        memory: Some(inner.config.database_memory_limit_bytes),
        ..Default::default()
    };
    let config = ContainerConfig {
        image: Some(inner.config.postgres_image.clone()),
        env: Some(env),
        host_config: Some(host_config),
        ..Default::default()
    };
    let options = CreateContainerOptions { name: name.to_string(), platform: None };
    inner.docker.create_container(Some(options), config).await?;
    inner.docker.start_container::<String>(name, None).await?;
    Ok(())
}

async fn wait_for_postgres(inner: &Arc<Inner>, name: &str) -> Result<(), OrchestratorError> {
    for _ in 0..inner.config.readiness_timeout_seconds {
        let exec = inner
            .docker
            .create_exec(
                name,
                CreateExecOptions {
                    cmd: Some(vec!["pg_isready".to_string(), "-U".to_string(), inner.config.postgres_user.clone()]),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await?;
        inner.docker.start_exec(&exec.id, None).await?;
        if let Ok(inspect) = inner.docker.inspect_exec(&exec.id).await {
            if inspect.exit_code == Some(0) {
                return Ok(());
            }
        }
        sleep(StdDuration::from_secs(1)).await;
    }
    Err(OrchestratorError::DatabaseNotReady(inner.config.readiness_timeout_seconds))
}

async fn start_proxy(
    inner: &Arc<Inner>,
    name: &str,
    network_name: &str,
    db_container_name: &str,
    run_id: RunId,
) -> Result<(), OrchestratorError> {
    let env = vec![
        format!("RUN_ID={run_id}"),
        format!("DB_HOST={db_container_name}"),
        format!("DB_PORT={}", inner.config.postgres_port),
        format!("PROXY_LISTEN_PORT={}", inner.config.proxy_listen_port),
        format!("POSTGRES_USER={}", inner.config.postgres_user),
        format!("POSTGRES_PASSWORD={}", inner.config.postgres_password),
        format!("POSTGRES_DB={}", inner.config.postgres_db),
    ];
    let host_config = HostConfig { network_mode: Some(network_name.to_string()), ..Default::default() };
    let config = ContainerConfig {
        image: Some(inner.config.proxy_image.clone()),
        env: Some(env),
        host_config: Some(host_config),
        ..Default::default()
    };
    let options = CreateContainerOptions { name: name.to_string(), platform: None };
    inner.docker.create_container(Some(options), config).await?;
    inner.docker.start_container::<String>(name, None).await?;
    Ok(())
}

async fn start_agent(
    inner: &Arc<Inner>,
    name: &str,
    network_name: &str,
    proxy_container_name: &str,
    request: &RunRequest,
) -> Result<(), OrchestratorError> {
    let mut env = vec![
        format!("DB_HOST={proxy_container_name}"),
        format!("DB_PORT={}", inner.config.proxy_listen_port),
    ];
    env.extend(request.environment.iter().map(|(k, v)| format!("{k}={v}")));

    let host_config = HostConfig { network_mode: Some(network_name.to_string()), ..Default::default() };
    let config = ContainerConfig {
        image: Some(request.agent_entry.clone()),
        env: Some(env),
        host_config: Some(host_config),
        ..Default::default()
    };
    let options = CreateContainerOptions { name: name.to_string(), platform: None };
    inner.docker.create_container(Some(options), config).await?;
    inner.docker.start_container::<String>(name, None).await?;
    Ok(())
}

fn short_id(run_id: RunId) -> String {
    run_id.to_string().chars().filter(|c| *c != '-').take(12).collect()
}

fn set_handle(inner: &Arc<Inner>, run_id: RunId, mutate: impl FnOnce(&mut SandboxHandles)) {
    let mut runs = inner.runs.write();
    if let Some(state) = runs.get_mut(&run_id) {
        mutate(&mut state.handles);
    }
}

async fn transition(
    inner: &Arc<Inner>,
    run_id: RunId,
    new_status: RunStatus,
    message: String,
    verdict: Option<Verdict>,
) {
    let previous_status = {
        let mut runs = inner.runs.write();
        let Some(state) = runs.get_mut(&run_id) else { return };
        let previous = format!("{:?}", state.status).to_lowercase();
        state.status = new_status;
        if new_status == RunStatus::Failed {
            state.error_message = Some(message.clone());
        }
        if state.is_terminal() {
            state.ended_at.get_or_insert(now());
        }
        previous
    };

    let event = Event::RunLifecycle(RunLifecycleEvent {
        envelope: EventEnvelope::new(run_id),
        previous_status: Some(previous_status),
        new_status: format!("{new_status:?}").to_lowercase(),
        message,
        verdict,
    });
    inner.store.emit(event);
}

async fn transition_silent(inner: &Arc<Inner>, run_id: RunId, new_status: RunStatus) {
    let mut runs = inner.runs.write();
    if let Some(state) = runs.get_mut(&run_id) {
        state.status = new_status;
    }
}

/// Mint a run id, exposed for callers assembling test fixtures without
/// constructing a full [`RunOrchestrator`].
pub fn new_run_id() -> RunId {
    RunId(Uuid::new_v4())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chaostrace_model::RunStatus as Status;

    #[test]
    fn verdict_mapping_matches_the_lifecycle_table() {
        assert_eq!(verdict::verdict_for(Status::Completed, false, 0), Verdict::Pass);
        assert_eq!(verdict::verdict_for(Status::Completed, false, 3), Verdict::Warn);
        assert_eq!(verdict::verdict_for(Status::Completed, true, 0), Verdict::Fail);
        assert_eq!(verdict::verdict_for(Status::Failed, false, 0), Verdict::Fail);
        assert_eq!(verdict::verdict_for(Status::Terminated, false, 0), Verdict::Incomplete);
    }
}
