//! SQLite audit trail.
//!
//! Persists breaker transitions, tier transitions and finished healing
//! attempts so they survive the process. Old rows are pruned by age.
//!
//! [`AuditStore`] does the SQL synchronously. [`AuditSink`] is the telemetry
//! face: it only enqueues, and a writer thread owns all disk I/O.

use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::Mutex;
use rusqlite::Connection;

use crate::breaker::StateTransition;
use crate::clock::{self, Clock};
use crate::error::AuditError;
use crate::healing::HealingAttemptRecord;
use crate::telemetry::TelemetrySink;
use crate::tier::TierTransitionEvent;

pub struct AuditStore {
    conn: Mutex<Connection>,
}

/// Open (or create) the audit database and ensure schema exists.
pub fn open_db(db_path: &str) -> Result<Connection, AuditError> {
    let path = Path::new(db_path);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let conn = Connection::open(db_path)?;
    init_schema(&conn)?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> Result<(), AuditError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS breaker_transitions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            service TEXT NOT NULL,
            from_state TEXT NOT NULL,
            to_state TEXT NOT NULL,
            reason TEXT NOT NULL,
            at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_breaker_service ON breaker_transitions(service, id);
        CREATE INDEX IF NOT EXISTS idx_breaker_at ON breaker_transitions(at);

        CREATE TABLE IF NOT EXISTS tier_transitions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            from_tier TEXT NOT NULL,
            to_tier TEXT NOT NULL,
            cause TEXT NOT NULL,
            ux_impact REAL NOT NULL,
            at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_tier_at ON tier_transitions(at);

        -- One row per finished attempt; traces stored as JSON
        CREATE TABLE IF NOT EXISTS healing_attempts (
            attempt_id TEXT PRIMARY KEY,
            failure_kind TEXT NOT NULL,
            service TEXT NOT NULL,
            severity TEXT NOT NULL,
            outcome TEXT NOT NULL,
            failure TEXT,
            actions TEXT NOT NULL,
            criteria TEXT NOT NULL,
            started_at TEXT NOT NULL,
            finished_at TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_healing_service ON healing_attempts(service, started_at);

        CREATE TABLE IF NOT EXISTS meta (
            key TEXT PRIMARY KEY,
            value TEXT
        );
        ",
    )?;
    Ok(())
}

/// Fixed-width UTC timestamps so text comparison orders them correctly.
fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// JSON string of a serde value, without the surrounding quotes for plain strings.
fn label<T: serde::Serialize>(value: &T) -> Result<String, AuditError> {
    let v = serde_json::to_value(value)?;
    Ok(match v {
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    })
}

impl AuditStore {
    pub fn open(db_path: &str) -> Result<Self, AuditError> {
        Ok(Self {
            conn: Mutex::new(open_db(db_path)?),
        })
    }

    pub fn record_breaker_transition(
        &self,
        service: &str,
        t: &StateTransition,
    ) -> Result<(), AuditError> {
        self.conn.lock().execute(
            "INSERT INTO breaker_transitions (service, from_state, to_state, reason, at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                service,
                t.from.to_string(),
                t.to.to_string(),
                t.reason.as_str(),
                ts(t.at),
            ],
        )?;
        Ok(())
    }

    pub fn record_tier_transition(&self, event: &TierTransitionEvent) -> Result<(), AuditError> {
        self.conn.lock().execute(
            "INSERT INTO tier_transitions (from_tier, to_tier, cause, ux_impact, at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                event.from_tier,
                event.to_tier,
                event.cause.to_string(),
                event.ux_impact,
                ts(event.at),
            ],
        )?;
        Ok(())
    }

    pub fn record_healing_attempt(&self, record: &HealingAttemptRecord) -> Result<(), AuditError> {
        let failure = record
            .failure
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        self.conn.lock().execute(
            "INSERT OR REPLACE INTO healing_attempts
             (attempt_id, failure_kind, service, severity, outcome, failure,
              actions, criteria, started_at, finished_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            rusqlite::params![
                record.attempt_id.to_string(),
                record.failure_kind,
                record.service,
                record.severity.to_string(),
                label(&record.outcome)?,
                failure,
                serde_json::to_string(&record.actions_executed)?,
                serde_json::to_string(&record.criteria_results)?,
                ts(record.started_at),
                record.finished_at.map(ts),
            ],
        )?;
        Ok(())
    }

    /// Transitions recorded for `service`, oldest first, as (from, to, reason).
    pub fn breaker_history(&self, service: &str) -> Result<Vec<(String, String, String)>, AuditError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT from_state, to_state, reason FROM breaker_transitions
             WHERE service = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(rusqlite::params![service], |r| {
                Ok((r.get(0)?, r.get(1)?, r.get(2)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// (attempt_id, outcome) for every stored attempt on `service`.
    pub fn healing_outcomes(&self, service: &str) -> Result<Vec<(String, String)>, AuditError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT attempt_id, outcome FROM healing_attempts
             WHERE service = ?1 ORDER BY started_at",
        )?;
        let rows = stmt
            .query_map(rusqlite::params![service], |r| Ok((r.get(0)?, r.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn tier_transition_count(&self) -> Result<i64, AuditError> {
        let n = self
            .conn
            .lock()
            .query_row("SELECT COUNT(*) FROM tier_transitions", [], |r| r.get(0))?;
        Ok(n)
    }

    /// Delete rows older than `cutoff`. Returns the number of rows removed.
    pub fn prune(&self, cutoff: DateTime<Utc>) -> Result<usize, AuditError> {
        let cutoff = ts(cutoff);
        let conn = self.conn.lock();
        let mut removed = 0;
        removed += conn.execute(
            "DELETE FROM breaker_transitions WHERE at < ?1",
            rusqlite::params![cutoff],
        )?;
        removed += conn.execute(
            "DELETE FROM tier_transitions WHERE at < ?1",
            rusqlite::params![cutoff],
        )?;
        removed += conn.execute(
            "DELETE FROM healing_attempts WHERE COALESCE(finished_at, started_at) < ?1",
            rusqlite::params![cutoff],
        )?;
        conn.execute(
            "INSERT OR REPLACE INTO meta (key, value) VALUES ('last_prune_cutoff', ?1)",
            rusqlite::params![cutoff],
        )?;
        Ok(removed)
    }
}

const QUEUE_DEPTH: usize = 1024;
const PRUNE_INTERVAL: Duration = Duration::from_secs(3600);

enum AuditMessage {
    Breaker(String, StateTransition),
    Tier(TierTransitionEvent),
    Healing(Box<HealingAttemptRecord>),
    Flush(Sender<()>),
    Shutdown,
}

/// Queue-backed sink in front of an [`AuditStore`].
///
/// Events are dropped (with a warning) when the queue is full rather than
/// stalling the caller. Rows older than `retention` are pruned when the
/// writer starts and then hourly.
pub struct AuditSink {
    store: Arc<AuditStore>,
    tx: Sender<AuditMessage>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl AuditSink {
    pub fn spawn(
        store: Arc<AuditStore>,
        retention: Duration,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, AuditError> {
        let (tx, rx) = bounded(QUEUE_DEPTH);
        let writer_store = Arc::clone(&store);
        let worker = thread::Builder::new()
            .name("fault-audit".to_string())
            .spawn(move || writer_loop(&writer_store, &rx, retention, clock.as_ref()))?;
        Ok(Self {
            store,
            tx,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn store(&self) -> &AuditStore {
        &self.store
    }

    /// Block until every event enqueued so far has been written.
    pub fn flush(&self) {
        let (ack_tx, ack_rx) = bounded(1);
        if self.tx.send(AuditMessage::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.recv();
        }
    }

    fn enqueue(&self, message: AuditMessage) {
        match self.tx.try_send(message) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => tracing::warn!("audit: queue full, event dropped"),
            Err(TrySendError::Disconnected(_)) => tracing::warn!("audit: writer stopped, event dropped"),
        }
    }
}

impl Drop for AuditSink {
    fn drop(&mut self) {
        let _ = self.tx.send(AuditMessage::Shutdown);
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                tracing::warn!("audit: writer thread panicked");
            }
        }
    }
}

fn prune_expired(store: &AuditStore, retention: Duration, now: DateTime<Utc>) {
    match store.prune(clock::sub(now, retention)) {
        Ok(0) => {}
        Ok(removed) => tracing::info!(removed, "audit: pruned expired rows"),
        Err(e) => tracing::warn!(error = %e, "audit: prune failed"),
    }
}

fn writer_loop(
    store: &AuditStore,
    rx: &Receiver<AuditMessage>,
    retention: Duration,
    clock: &dyn Clock,
) {
    let mut last_prune = clock.now();
    prune_expired(store, retention, last_prune);
    loop {
        let message = rx.recv_timeout(PRUNE_INTERVAL);
        let now = clock.now();
        if clock::elapsed(last_prune, now) >= PRUNE_INTERVAL {
            prune_expired(store, retention, now);
            last_prune = now;
        }
        let written = match message {
            Ok(AuditMessage::Breaker(service, t)) => store.record_breaker_transition(&service, &t),
            Ok(AuditMessage::Tier(event)) => store.record_tier_transition(&event),
            Ok(AuditMessage::Healing(record)) => store.record_healing_attempt(&record),
            Ok(AuditMessage::Flush(ack)) => {
                let _ = ack.send(());
                Ok(())
            }
            Ok(AuditMessage::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => Ok(()),
        };
        if let Err(e) = written {
            tracing::warn!(error = %e, "audit: event not stored");
        }
    }
    tracing::debug!("audit writer stopped");
}

impl TelemetrySink for AuditSink {
    fn breaker_transition(&self, service: &str, transition: &StateTransition) {
        self.enqueue(AuditMessage::Breaker(service.to_string(), transition.clone()));
    }

    fn tier_transition(&self, event: &TierTransitionEvent) {
        self.enqueue(AuditMessage::Tier(event.clone()));
    }

    fn healing_completed(&self, record: &HealingAttemptRecord) {
        self.enqueue(AuditMessage::Healing(Box::new(record.clone())));
    }
}
