//! §4.5 Chaos Hooks: the effector that actually changes database or
//! session state when a chaos trigger fires. Grounded on the handler
//! dispatch in the reference `ChaosHooks` class: one method per
//! [`ChaosActionType`], a connection pool against the sandboxed
//! database, and a couple of pieces of shared state (the latency
//! override, the pending-timeout flag) that the proxy consults
//! directly rather than through this struct's async API.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chaostrace_foundation::Timestamp;
use chaostrace_model::{ChaosAction, ChaosActionType, RunId};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use sqlx::PgPool;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::Duration;
use tracing::warn;

/// Errors a hook handler can surface. Per §4.5's failure semantics,
/// none of these abort the scheduler — the caller logs and continues.
#[derive(Error, Debug)]
pub enum ChaosError {
    /// The action failed while talking to the sandboxed database.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    /// A required field for this action type was absent.
    #[error("{action_type:?} requires field `{field}`")]
    MissingField {
        /// The action type that was missing a field.
        action_type: ChaosActionType,
        /// The field name.
        field: &'static str,
    },
}

/// Context carried from the triggering event into template resolution
/// and the fired action.
#[derive(Debug, Clone, Default)]
pub struct ActionContext {
    /// The run this action executes on behalf of.
    pub run_id: Option<RunId>,
    /// Tables referenced by the event that triggered this action.
    pub tables: Vec<String>,
}

/// Outcome of one executed chaos action, handed back to the scheduler
/// to build the resulting [`chaostrace_model::ChaosEvent`].
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    /// Which action type ran.
    pub action_type: ChaosActionType,
    /// Resolved target, if the action named one.
    pub target: Option<String>,
    /// Duration of the effect, if bounded.
    pub duration_seconds: Option<u64>,
    /// Human-readable summary for logs and the chaos event.
    pub detail: String,
}

/// A single writer (a hook), many readers (every proxy connection),
/// read lazily (§10.7): a reader treats the override as expired once
/// `now >= deadline`, with no separate removal task.
#[derive(Debug, Clone, Copy)]
struct Expiring<T> {
    value: T,
    deadline: Timestamp,
}

fn active<T: Copy>(slot: &RwLock<Option<Expiring<T>>>) -> Option<T> {
    let guard = slot.read();
    match *guard {
        Some(Expiring { value, deadline }) if chaostrace_foundation::now() < deadline => Some(value),
        _ => None,
    }
}

fn set_expiring<T>(slot: &RwLock<Option<Expiring<T>>>, value: T, duration_seconds: u64) {
    let deadline = chaostrace_foundation::now() + chrono::Duration::seconds(duration_seconds as i64);
    *slot.write() = Some(Expiring { value, deadline });
}

/// The advisory-only flags §4.5's table lists as having no literal
/// database effect: the proxy or topology controller may consult
/// these, but nothing here enforces them.
#[derive(Default)]
struct AdvisoryState {
    disk_full: RwLock<Option<Expiring<()>>>,
    memory_pressure: RwLock<Option<Expiring<()>>>,
    cpu_throttle: RwLock<Option<Expiring<u8>>>,
    network_partition: RwLock<Option<Expiring<()>>>,
    packet_loss: RwLock<Option<Expiring<u8>>>,
}

/// Effector for every chaos action type. One instance per run, owning
/// a pool of connections into that run's sandboxed database.
pub struct ChaosHooks {
    pool: PgPool,
    agent_role: String,
    latency_override: RwLock<Option<Expiring<u64>>>,
    timeout_pending: AtomicBool,
    advisory: AdvisoryState,
    active_locks: Mutex<HashMap<String, oneshot::Sender<()>>>,
}

impl ChaosHooks {
    /// Connect to the sandboxed database this run's agent talks to.
    /// `agent_role` is the database role `REVOKE_CREDENTIALS` rotates.
    pub async fn connect(database_url: &str, agent_role: impl Into<String>) -> Result<Self, ChaosError> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self {
            pool,
            agent_role: agent_role.into(),
            latency_override: RwLock::new(None),
            timeout_pending: AtomicBool::new(false),
            advisory: AdvisoryState::default(),
            active_locks: Mutex::new(HashMap::new()),
        })
    }

    /// Execute one chaos action (§4.5's dispatch table).
    pub async fn execute(
        &self,
        action: &ChaosAction,
        context: &ActionContext,
    ) -> Result<ExecutionResult, ChaosError> {
        match action.action_type {
            ChaosActionType::LockTable => self.lock_table(action, context).await,
            ChaosActionType::AddLatency => self.add_latency(action),
            ChaosActionType::SimulateTimeout => self.simulate_timeout(action),
            ChaosActionType::RevokeCredentials => self.revoke_credentials(action).await,
            ChaosActionType::RenameColumn => self.rename_column(action, context).await,
            ChaosActionType::ChangeColumnType => self.change_column_type(action, context).await,
            ChaosActionType::DropIndex => self.drop_index(action).await,
            ChaosActionType::DiskFull => Ok(self.advisory_bool(action, &self.advisory.disk_full, "disk_full")),
            ChaosActionType::MemoryPressure => {
                Ok(self.advisory_bool(action, &self.advisory.memory_pressure, "memory_pressure"))
            }
            ChaosActionType::CpuThrottle => self.advisory_percent(action, &self.advisory.cpu_throttle, "cpu_throttle"),
            ChaosActionType::NetworkPartition => {
                Ok(self.advisory_bool(action, &self.advisory.network_partition, "network_partition"))
            }
            ChaosActionType::PacketLoss => self.advisory_percent(action, &self.advisory.packet_loss, "packet_loss"),
        }
    }

    /// Resolve `{event.tables[0]}` and `{run.id}` against `context`,
    /// leaving unknown tokens verbatim (§4.5 template resolution).
    fn resolve_template(&self, raw: &str, context: &ActionContext) -> String {
        let mut resolved = raw.to_string();
        if let Some(table) = context.tables.first() {
            resolved = resolved.replace("{event.tables[0]}", table);
        }
        if let Some(run_id) = context.run_id {
            resolved = resolved.replace("{run.id}", &run_id.to_string());
        }
        resolved
    }

    fn require_field<'a>(
        &self,
        action_type: ChaosActionType,
        field: &'static str,
        value: &'a Option<String>,
    ) -> Result<&'a str, ChaosError> {
        value
            .as_deref()
            .ok_or(ChaosError::MissingField { action_type, field })
    }

    async fn lock_table(&self, action: &ChaosAction, context: &ActionContext) -> Result<ExecutionResult, ChaosError> {
        let table = self.require_field(ChaosActionType::LockTable, "table", &action.table)?;
        let table = self.resolve_template(table, context);
        let duration = action.duration_seconds.unwrap_or(10);

        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN").execute(&mut *conn).await?;
        sqlx::query(&format!("LOCK TABLE {table} IN ACCESS EXCLUSIVE MODE"))
            .execute(&mut *conn)
            .await?;

        let (cancel_tx, mut cancel_rx) = oneshot::channel();
        if let Some(previous) = self.active_locks.lock().insert(table.clone(), cancel_tx) {
            let _ = previous.send(());
        }
        let released_table = table.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(duration)) => {}
                _ = &mut cancel_rx => {}
            }
            if let Err(err) = sqlx::query("ROLLBACK").execute(&mut *conn).await {
                warn!(table = %released_table, %err, "failed to release chaos table lock");
            }
        });

        Ok(ExecutionResult {
            action_type: ChaosActionType::LockTable,
            target: Some(table),
            duration_seconds: Some(duration),
            detail: format!("held exclusive lock for {duration}s"),
        })
    }

    /// Release every outstanding table lock without waiting for its
    /// duration to elapse (scheduler `stop()`, §4.5's cancellation
    /// requirement).
    pub fn release_all_locks(&self) {
        for (_, cancel_tx) in self.active_locks.lock().drain() {
            let _ = cancel_tx.send(());
        }
    }

    fn add_latency(&self, action: &ChaosAction) -> Result<ExecutionResult, ChaosError> {
        let latency_ms = action
            .latency_ms
            .ok_or(ChaosError::MissingField { action_type: ChaosActionType::AddLatency, field: "latency_ms" })?;
        let duration = action.duration_seconds.unwrap_or(10);
        set_expiring(&self.latency_override, latency_ms, duration);
        Ok(ExecutionResult {
            action_type: ChaosActionType::AddLatency,
            target: None,
            duration_seconds: Some(duration),
            detail: format!("added {latency_ms}ms latency for {duration}s"),
        })
    }

    /// The latency, in milliseconds, every proxy connection should
    /// sleep before forwarding its next statement. `None` once the
    /// override has expired.
    pub fn current_latency_ms(&self) -> Option<u64> {
        active(&self.latency_override)
    }

    fn simulate_timeout(&self, _action: &ChaosAction) -> Result<ExecutionResult, ChaosError> {
        self.timeout_pending.store(true, Ordering::SeqCst);
        Ok(ExecutionResult {
            action_type: ChaosActionType::SimulateTimeout,
            target: None,
            duration_seconds: None,
            detail: "flagged next statement for a synthesized connection-closed error".to_string(),
        })
    }

    /// Consume the pending-timeout flag, if set. The proxy calls this
    /// once per statement; a `true` result means it must synthesize a
    /// connection-closed error instead of forwarding.
    pub fn take_pending_timeout(&self) -> bool {
        self.timeout_pending.swap(false, Ordering::SeqCst)
    }

    async fn revoke_credentials(&self, _action: &ChaosAction) -> Result<ExecutionResult, ChaosError> {
        let mut rng = rand::rng();
        let new_password: String = (0..24).map(|_| rng.sample(rand::distr::Alphanumeric) as char).collect();
        let sql = format!("ALTER USER {} WITH PASSWORD '{}'", self.agent_role, new_password);
        sqlx::query(&sql).execute(&self.pool).await?;
        Ok(ExecutionResult {
            action_type: ChaosActionType::RevokeCredentials,
            target: Some(self.agent_role.clone()),
            duration_seconds: None,
            detail: "rotated agent database credentials".to_string(),
        })
    }

    async fn rename_column(&self, action: &ChaosAction, context: &ActionContext) -> Result<ExecutionResult, ChaosError> {
        let table = self.require_field(ChaosActionType::RenameColumn, "table", &action.table)?;
        let table = self.resolve_template(table, context);
        let column = self.require_field(ChaosActionType::RenameColumn, "column", &action.column)?;
        let new_name = self.require_field(ChaosActionType::RenameColumn, "new_name", &action.new_name)?;
        let sql = format!("ALTER TABLE {table} RENAME COLUMN {column} TO {new_name}");
        sqlx::query(&sql).execute(&self.pool).await?;
        Ok(ExecutionResult {
            action_type: ChaosActionType::RenameColumn,
            target: Some(format!("{table}.{column}")),
            duration_seconds: None,
            detail: format!("renamed {table}.{column} to {new_name}"),
        })
    }

    async fn change_column_type(
        &self,
        action: &ChaosAction,
        context: &ActionContext,
    ) -> Result<ExecutionResult, ChaosError> {
        let table = self.require_field(ChaosActionType::ChangeColumnType, "table", &action.table)?;
        let table = self.resolve_template(table, context);
        let column = self.require_field(ChaosActionType::ChangeColumnType, "column", &action.column)?;
        let new_type = self.require_field(ChaosActionType::ChangeColumnType, "new_type", &action.new_type)?;
        let sql = format!(
            "ALTER TABLE {table} ALTER COLUMN {column} TYPE {new_type} USING {column}::{new_type}"
        );
        sqlx::query(&sql).execute(&self.pool).await?;
        Ok(ExecutionResult {
            action_type: ChaosActionType::ChangeColumnType,
            target: Some(format!("{table}.{column}")),
            duration_seconds: None,
            detail: format!("changed {table}.{column} to {new_type}"),
        })
    }

    async fn drop_index(&self, action: &ChaosAction) -> Result<ExecutionResult, ChaosError> {
        let index_name = action
            .parameters
            .get("index_name")
            .and_then(|v| v.as_str())
            .ok_or(ChaosError::MissingField { action_type: ChaosActionType::DropIndex, field: "index_name" })?;
        sqlx::query(&format!("DROP INDEX IF EXISTS {index_name}"))
            .execute(&self.pool)
            .await?;
        Ok(ExecutionResult {
            action_type: ChaosActionType::DropIndex,
            target: Some(index_name.to_string()),
            duration_seconds: None,
            detail: format!("dropped index {index_name}"),
        })
    }

    fn advisory_bool(&self, action: &ChaosAction, slot: &RwLock<Option<Expiring<()>>>, name: &str) -> ExecutionResult {
        let duration = action.duration_seconds.unwrap_or(10);
        set_expiring(slot, (), duration);
        ExecutionResult {
            action_type: action.action_type,
            target: None,
            duration_seconds: Some(duration),
            detail: format!("set advisory flag {name} for {duration}s"),
        }
    }

    fn advisory_percent(
        &self,
        action: &ChaosAction,
        slot: &RwLock<Option<Expiring<u8>>>,
        name: &str,
    ) -> Result<ExecutionResult, ChaosError> {
        let percentage = action
            .percentage
            .ok_or(ChaosError::MissingField { action_type: action.action_type, field: "percentage" })?;
        let duration = action.duration_seconds.unwrap_or(10);
        set_expiring(slot, percentage, duration);
        Ok(ExecutionResult {
            action_type: action.action_type,
            target: None,
            duration_seconds: Some(duration),
            detail: format!("set advisory flag {name} to {percentage}% for {duration}s"),
        })
    }

    /// Whether a `disk_full` advisory is currently active.
    pub fn disk_full_active(&self) -> bool {
        active(&self.advisory.disk_full).is_some()
    }

    /// Whether a `memory_pressure` advisory is currently active.
    pub fn memory_pressure_active(&self) -> bool {
        active(&self.advisory.memory_pressure).is_some()
    }

    /// The current CPU-throttle percentage, if an advisory is active.
    pub fn cpu_throttle_percent(&self) -> Option<u8> {
        active(&self.advisory.cpu_throttle)
    }

    /// Whether a `network_partition` advisory is currently active.
    pub fn network_partition_active(&self) -> bool {
        active(&self.advisory.network_partition).is_some()
    }

    /// The current packet-loss percentage, if an advisory is active.
    pub fn packet_loss_percent(&self) -> Option<u8> {
        active(&self.advisory.packet_loss)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chaostrace_model::ChaosActionType;

    fn action(action_type: ChaosActionType) -> ChaosAction {
        ChaosAction {
            action_type,
            table: None,
            column: None,
            duration_seconds: None,
            delay_seconds: 0,
            latency_ms: None,
            new_name: None,
            new_type: None,
            percentage: None,
            parameters: Default::default(),
        }
    }

    #[test]
    fn template_resolution_substitutes_known_tokens() {
        let hooks = ChaosHooks {
            pool: PgPool::connect_lazy("postgres://localhost/nonexistent").unwrap(),
            agent_role: "agent".to_string(),
            latency_override: RwLock::new(None),
            timeout_pending: AtomicBool::new(false),
            advisory: AdvisoryState::default(),
            active_locks: Mutex::new(HashMap::new()),
        };
        let context = ActionContext {
            run_id: Some(RunId::new()),
            tables: vec!["orders".to_string()],
        };
        let resolved = hooks.resolve_template("prefix_{event.tables[0]}_{run.id}", &context);
        assert!(resolved.starts_with("prefix_orders_"));
        assert!(resolved.contains(&context.run_id.unwrap().to_string()));
    }

    #[test]
    fn unknown_template_tokens_are_left_verbatim() {
        let hooks = ChaosHooks {
            pool: PgPool::connect_lazy("postgres://localhost/nonexistent").unwrap(),
            agent_role: "agent".to_string(),
            latency_override: RwLock::new(None),
            timeout_pending: AtomicBool::new(false),
            advisory: AdvisoryState::default(),
            active_locks: Mutex::new(HashMap::new()),
        };
        let context = ActionContext::default();
        assert_eq!(hooks.resolve_template("{unknown.token}", &context), "{unknown.token}");
    }

    #[test]
    fn pending_timeout_is_consumed_once() {
        let hooks = ChaosHooks {
            pool: PgPool::connect_lazy("postgres://localhost/nonexistent").unwrap(),
            agent_role: "agent".to_string(),
            latency_override: RwLock::new(None),
            timeout_pending: AtomicBool::new(false),
            advisory: AdvisoryState::default(),
            active_locks: Mutex::new(HashMap::new()),
        };
        hooks.simulate_timeout(&action(ChaosActionType::SimulateTimeout)).unwrap();
        assert!(hooks.take_pending_timeout());
        assert!(!hooks.take_pending_timeout());
    }

    #[test]
    fn latency_override_expires() {
        let hooks = ChaosHooks {
            pool: PgPool::connect_lazy("postgres://localhost/nonexistent").unwrap(),
            agent_role: "agent".to_string(),
            latency_override: RwLock::new(None),
            timeout_pending: AtomicBool::new(false),
            advisory: AdvisoryState::default(),
            active_locks: Mutex::new(HashMap::new()),
        };
        let mut a = action(ChaosActionType::AddLatency);
        a.latency_ms = Some(500);
        a.duration_seconds = Some(0);
        hooks.add_latency(&a).unwrap();
        // duration_seconds=0 means the deadline is already in the past.
        assert_eq!(hooks.current_latency_ms(), None);
    }
}
