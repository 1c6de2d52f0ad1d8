//! One proxied connection's lifecycle: relay the startup handshake
//! untouched, then alternate between forwarding whatever the client
//! sends and, for a simple-query message, running it through the
//! analyze/score/police/record pipeline before deciding whether to
//! forward it, block it with a synthesized error, or drop it to
//! simulate a hung connection.
//!
//! Grounded on `original_source/chaostrace/db_proxy/proxy_server.py`'s
//! `DBProxyConnection.handle`/`_proxy_client_to_server`/`_handle_query`.
//! The reference runs both directions as independent `asyncio` tasks,
//! each owning its own socket half, and a blocked statement's response
//! is written straight back down the client socket from inside the
//! client-to-server task. Rust's split `TcpStream` halves give each
//! direction exclusive ownership of one writer, so here the client
//! writer is owned by a dedicated writer task and everything that
//! needs to reach the client — the upstream relay, or a synthesized
//! blocked/timeout response — goes through a channel into that task.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use chaostrace_analyzer::StatementAnalyzer;
use chaostrace_chaos::{ChaosHooks, ChaosScheduler};
use chaostrace_model::{Event, EventEnvelope, PolicyAction, RunId, SqlEvent};
use chaostrace_policy::PolicyEngine;
use chaostrace_risk::RiskScorer;
use chaostrace_store::EventStore;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::debug;

use crate::wire::{self, BLOCKED_SQLSTATE};
use crate::ProxyError;

/// The shared, stateless-per-query machinery one proxy listener wires
/// once and clones (via `Arc`) into every connection it accepts.
pub struct ProxyPipeline {
    /// The run this proxy instance belongs to.
    pub run_id: RunId,
    /// Dialect-aware statement parser.
    pub analyzer: StatementAnalyzer,
    /// Deterministic risk scorer.
    pub risk_scorer: RiskScorer,
    /// Compiled policy engine for this run's policy profile.
    pub policy: Arc<PolicyEngine>,
    /// Chaos effector, if this run has an active chaos scenario.
    pub chaos_hooks: Option<Arc<ChaosHooks>>,
    /// Chaos scheduler, if this run has an active chaos scenario.
    pub chaos_scheduler: Option<ChaosScheduler>,
    /// Durable event log.
    pub store: EventStore,
}

/// Depth of the per-connection client-writer channel: one slot per
/// in-flight upstream chunk plus headroom for an interleaved
/// synthesized response. This proxy is not a high-fanout multiplexer,
/// so a small bound is plenty.
const CLIENT_WRITER_CHANNEL_CAPACITY: usize = 64;

/// Handle one client connection end to end: relay the startup
/// handshake, then loop intercepting simple queries until the client
/// disconnects.
pub async fn handle_connection(
    client: TcpStream,
    upstream_addr: SocketAddr,
    pipeline: Arc<ProxyPipeline>,
) -> Result<(), ProxyError> {
    client.set_nodelay(true).ok();
    let server = TcpStream::connect(upstream_addr).await?;
    server.set_nodelay(true).ok();

    let (mut client_read, client_write) = client.into_split();
    let (mut server_read, mut server_write) = server.into_split();

    if let Some(startup) = wire::read_startup_message(&mut client_read).await? {
        server_write.write_all(&startup).await?;
    } else {
        return Ok(());
    }

    let (to_client_tx, mut to_client_rx) = mpsc::channel::<Vec<u8>>(CLIENT_WRITER_CHANNEL_CAPACITY);
    let relay_tx = to_client_tx.clone();
    let main_tx = to_client_tx;

    let client_writer_task = tokio::spawn(async move {
        let mut client_write = client_write;
        while let Some(chunk) = to_client_rx.recv().await {
            if client_write.write_all(&chunk).await.is_err() {
                break;
            }
        }
    });

    let relay_task = tokio::spawn(async move {
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            match server_read.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if relay_tx.send(buf[..n].to_vec()).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    loop {
        let message = match wire::read_tagged_message(&mut client_read).await {
            Ok(Some(message)) => message,
            Ok(None) => break,
            Err(err) => {
                debug!(%err, "client connection read failed");
                break;
            }
        };

        if message.tag == wire::QUERY {
            match handle_query(&message.payload, &pipeline).await {
                QueryOutcome::Forward => {
                    server_write.write_all(&wire::reassemble(message.tag, &message.payload)).await?;
                }
                QueryOutcome::Block(response) => {
                    if main_tx.send(response).await.is_err() {
                        break;
                    }
                }
                QueryOutcome::SimulateTimeout => {}
            }
        } else {
            server_write.write_all(&wire::reassemble(message.tag, &message.payload)).await?;
        }
    }

    drop(server_write);
    drop(main_tx);
    let _ = relay_task.await;
    let _ = client_writer_task.await;
    Ok(())
}

enum QueryOutcome {
    Forward,
    Block(Vec<u8>),
    SimulateTimeout,
}

async fn handle_query(payload: &[u8], pipeline: &ProxyPipeline) -> QueryOutcome {
    let start = Instant::now();
    let sql = wire::parse_simple_query(payload);

    let parsed = pipeline.analyzer.parse(&sql);
    let risk = pipeline.risk_scorer.assess(&parsed);
    let evaluation = pipeline.policy.evaluate(&sql, &parsed, risk.rows_estimated);
    let action = evaluation.action();

    let latency_ms = start.elapsed().as_secs_f64() * 1000.0;
    let violation_reason = evaluation.violation_reasons.first().cloned();

    let event = SqlEvent {
        envelope: EventEnvelope::new(pipeline.run_id),
        statement: sql.clone(),
        statement_hash: parsed.statement_hash.clone(),
        sql_type: parsed.sql_type,
        tables: parsed.tables.iter().cloned().collect(),
        has_where_clause: parsed.has_where_clause(),
        risk_level: risk.risk_level,
        risk_factors: risk.risk_factors.clone(),
        rows_estimated: risk.rows_estimated,
        policy_action: action,
        policy_rule_matched: evaluation.matched_rules.first().cloned(),
        violation_reason,
        latency_ms,
        rows_affected: None,
        execution_error: None,
    };

    pipeline.store.emit(Event::Sql(event.clone()));
    if let Some(scheduler) = &pipeline.chaos_scheduler {
        scheduler.on_sql_event(&event);
    }

    match action {
        PolicyAction::Block => {
            let reason = event
                .violation_reason
                .clone()
                .unwrap_or_else(|| "statement blocked by policy".to_string());
            let message = format!("Query blocked: {reason}");
            let mut response = wire::build_error_response("ERROR", BLOCKED_SQLSTATE, &message);
            response.extend_from_slice(&wire::build_ready_for_query(b'I'));
            QueryOutcome::Block(response)
        }
        PolicyAction::Allow | PolicyAction::AllowFlagged => {
            if let Some(hooks) = &pipeline.chaos_hooks {
                if hooks.take_pending_timeout() {
                    return QueryOutcome::SimulateTimeout;
                }
                if let Some(delay_ms) = hooks.current_latency_ms() {
                    tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
                }
            }
            QueryOutcome::Forward
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chaostrace_model::{ForbiddenSqlRule, HoneypotConfig, PolicySeverity};

    async fn test_pipeline() -> ProxyPipeline {
        let policy = chaostrace_model::PolicyDefinition {
            name: "test".to_string(),
            version: "1.0".to_string(),
            description: String::new(),
            forbidden_sql: vec![ForbiddenSqlRule {
                pattern: r"DROP\s+DATABASE".to_string(),
                severity: PolicySeverity::Critical,
                message: Some("DROP DATABASE is never allowed".to_string()),
                case_sensitive: false,
            }],
            table_restrictions: vec![],
            row_limits: vec![],
            honeypots: HoneypotConfig::default(),
            fail_on_unknown_table: false,
            require_transaction: false,
            max_query_length: 10_000,
        };
        ProxyPipeline {
            run_id: RunId::new(),
            analyzer: StatementAnalyzer::new(),
            risk_scorer: RiskScorer::new(),
            policy: Arc::new(PolicyEngine::from_definition(policy).unwrap()),
            chaos_hooks: None,
            chaos_scheduler: None,
            store: EventStore::open_in_memory(1_000).await.unwrap(),
        }
    }

    #[tokio::test]
    async fn allowed_query_forwards() {
        let pipeline = test_pipeline().await;
        let mut payload = b"SELECT 1".to_vec();
        payload.push(0);
        assert!(matches!(handle_query(&payload, &pipeline).await, QueryOutcome::Forward));
    }

    #[tokio::test]
    async fn forbidden_pattern_is_blocked_with_a_synthesized_response() {
        let pipeline = test_pipeline().await;
        let mut payload = b"DROP DATABASE sandbox".to_vec();
        payload.push(0);
        match handle_query(&payload, &pipeline).await {
            QueryOutcome::Block(response) => {
                assert_eq!(response[0], b'E');
            }
            _ => panic!("expected the statement to be blocked"),
        }
    }

    #[tokio::test]
    async fn blocked_query_is_recorded_in_the_event_store() {
        let pipeline = test_pipeline().await;
        let mut payload = b"DROP DATABASE sandbox".to_vec();
        payload.push(0);
        handle_query(&payload, &pipeline).await;
        let mut stats = pipeline.store.get_run_stats(pipeline.run_id).await.unwrap();
        for _ in 0..50 {
            if stats.blocked_events == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            stats = pipeline.store.get_run_stats(pipeline.run_id).await.unwrap();
        }
        assert_eq!(stats.blocked_events, 1);
    }
}
