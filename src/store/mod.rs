// =============================================================================
// Persistence Layer — SQLite store for the learning loop
// =============================================================================
//
// Transactional store for anomalies, decisions, user actions, outcomes,
// pattern quality, threshold overrides, durable pending-outcome jobs, and
// causal observations.
//
// Key properties:
//   - WAL mode for concurrent reads during writes
//   - Prepared statement caching on every hot path
//   - All writes are upsert-safe on natural keys (last writer wins)
//   - busy_timeout bounds every operation instead of failing fast
//   - Timestamps stored as RFC 3339 TEXT (lexicographically ordered)
// =============================================================================

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::agent::{Decision, SignalStory};
use crate::detect::Anomaly;
use crate::learning::causal::CausalObservation;
use crate::regime::{Horizon, MarketRegime, TimeOfDay};
use crate::types::{DecisionState, PatternQuality, PatternType, Severity, UserActionKind};

/// Schema with performance pragmas. Executed as one batch at open.
const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA busy_timeout = 30000;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS anomalies (
    id              TEXT PRIMARY KEY,
    symbol          TEXT NOT NULL,
    pattern_type    TEXT NOT NULL,
    severity        TEXT NOT NULL,
    z_score         REAL NOT NULL,
    price           REAL NOT NULL,
    volume          INTEGER NOT NULL,
    detected_at     TEXT NOT NULL,
    agent_decision  TEXT,
    agent_confidence REAL,
    agent_reason    TEXT,
    context         TEXT,
    sources         TEXT,
    thought_process TEXT,
    story_json      TEXT
);

CREATE INDEX IF NOT EXISTS idx_anomalies_detected
    ON anomalies(detected_at DESC);
CREATE INDEX IF NOT EXISTS idx_anomalies_symbol
    ON anomalies(symbol, detected_at DESC);

CREATE TABLE IF NOT EXISTS user_actions (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    anomaly_id  TEXT NOT NULL,
    user_id     TEXT NOT NULL,
    action      TEXT NOT NULL,
    notes       TEXT,
    recorded_at TEXT NOT NULL,
    UNIQUE(anomaly_id, user_id)
);

CREATE TABLE IF NOT EXISTS anomaly_outcomes (
    anomaly_id       TEXT PRIMARY KEY,
    user_id          TEXT NOT NULL,
    agent_decision   TEXT NOT NULL,
    agent_confidence REAL NOT NULL,
    user_action      TEXT NOT NULL,
    return_15m       REAL,
    return_1h        REAL,
    return_4h        REAL,
    return_1d        REAL,
    was_profitable   INTEGER NOT NULL,
    agent_correct    INTEGER NOT NULL,
    created_at       TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_outcomes_user
    ON anomaly_outcomes(user_id, created_at DESC);

CREATE TABLE IF NOT EXISTS pattern_quality (
    user_id        TEXT NOT NULL,
    pattern_type   TEXT NOT NULL,
    symbol         TEXT NOT NULL,
    accuracy       REAL NOT NULL,
    review_rate    REAL NOT NULL,
    trade_rate     REAL NOT NULL,
    avg_return     REAL NOT NULL,
    sample_size    INTEGER NOT NULL,
    agent_accuracy REAL NOT NULL,
    updated_at     TEXT NOT NULL,
    PRIMARY KEY (user_id, pattern_type, symbol)
);

CREATE TABLE IF NOT EXISTS detection_thresholds (
    user_id           TEXT NOT NULL,
    pattern_type      TEXT NOT NULL,
    symbol            TEXT NOT NULL,
    z_score_threshold REAL NOT NULL,
    reason            TEXT NOT NULL,
    updated_at        TEXT NOT NULL,
    PRIMARY KEY (user_id, pattern_type, symbol)
);

CREATE TABLE IF NOT EXISTS pending_outcomes (
    anomaly_id          TEXT PRIMARY KEY,
    user_id             TEXT NOT NULL,
    symbol              TEXT NOT NULL,
    pattern_type        TEXT NOT NULL,
    entry_price         REAL NOT NULL,
    agent_decision      TEXT NOT NULL,
    agent_confidence    REAL NOT NULL,
    detected_at         TEXT NOT NULL,
    regime              TEXT NOT NULL,
    horizon             TEXT NOT NULL,
    time_of_day         TEXT NOT NULL,
    day_of_week         INTEGER NOT NULL,
    next_interval_index INTEGER NOT NULL,
    fire_at             TEXT NOT NULL,
    returns_json        TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_pending_fire_at
    ON pending_outcomes(fire_at);

CREATE TABLE IF NOT EXISTS causal_observations (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    pattern_type TEXT NOT NULL,
    regime       TEXT NOT NULL,
    horizon      TEXT NOT NULL,
    time_of_day  TEXT NOT NULL,
    day_of_week  INTEGER NOT NULL,
    success      INTEGER NOT NULL,
    observed_at  TEXT NOT NULL
);
"#;

// =============================================================================
// Row types
// =============================================================================

/// A closed outcome row: one per anomaly that survived rejection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutcomeRow {
    pub anomaly_id: String,
    pub user_id: String,
    pub agent_decision: DecisionState,
    pub agent_confidence: f64,
    pub user_action: UserActionKind,
    pub return_15m: Option<f64>,
    pub return_1h: Option<f64>,
    pub return_4h: Option<f64>,
    pub return_1d: Option<f64>,
    pub was_profitable: bool,
    pub agent_correct: bool,
    pub created_at: DateTime<Utc>,
}

/// Durable follow-up job for one anomaly: survives restarts and drives the
/// outcome scheduler. Carries the decision-time context so the causal
/// learner can be fed at finalization. `returns` maps interval label ->
/// sampled forward return (None = attempted but unavailable).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingOutcomeJob {
    pub anomaly_id: String,
    pub user_id: String,
    pub symbol: String,
    pub pattern_type: PatternType,
    pub entry_price: f64,
    pub agent_decision: DecisionState,
    pub agent_confidence: f64,
    pub detected_at: DateTime<Utc>,
    pub regime: MarketRegime,
    pub horizon: Horizon,
    pub time_of_day: TimeOfDay,
    pub day_of_week: u8,
    pub next_interval_index: usize,
    pub fire_at: DateTime<Utc>,
    pub returns: BTreeMap<String, Option<f64>>,
}

/// Anomaly summary for the signals feed (API collaborator contract). The
/// decision state, composite, reason, and story are surfaced verbatim.
#[derive(Debug, Clone, Serialize)]
pub struct PendingAnomaly {
    pub id: String,
    pub symbol: String,
    pub pattern_type: PatternType,
    pub severity: Severity,
    pub z_score: f64,
    pub price: f64,
    pub detected_at: DateTime<Utc>,
    pub agent_decision: DecisionState,
    pub agent_confidence: f64,
    pub agent_reason: String,
    pub story: Option<SignalStory>,
}

/// Anomaly awaiting follow-up after a restart lost its pending job row.
#[derive(Debug, Clone)]
pub struct RecoveredAnomaly {
    pub id: String,
    pub symbol: String,
    pub pattern_type: PatternType,
    pub price: f64,
    pub detected_at: DateTime<Utc>,
    pub agent_decision: DecisionState,
    pub agent_confidence: f64,
}

// =============================================================================
// Database
// =============================================================================

/// SQLite-backed store shared across the engine via `Arc`.
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) the database at `path` and apply the schema.
    pub fn open(path: &str) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        let conn = Connection::open_with_flags(path, flags)
            .with_context(|| format!("failed to open database at {path}"))?;

        conn.execute_batch(SCHEMA_SQL)
            .context("failed to initialize database schema")?;

        let anomaly_count: i64 = conn
            .query_row("SELECT COUNT(*) FROM anomalies", [], |row| row.get(0))
            .unwrap_or(0);
        let pending_count: i64 = conn
            .query_row("SELECT COUNT(*) FROM pending_outcomes", [], |row| row.get(0))
            .unwrap_or(0);

        info!(
            path,
            anomalies = anomaly_count,
            pending_outcomes = pending_count,
            "database opened"
        );

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory database")?;
        conn.execute_batch(SCHEMA_SQL)
            .context("failed to initialize database schema")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // -------------------------------------------------------------------------
    // Anomalies & decisions
    // -------------------------------------------------------------------------

    /// Persist an anomaly together with its decision in one atomic upsert.
    /// Re-detections of the same anomaly update the decision fields.
    pub fn save_anomaly(&self, anomaly: &Anomaly, decision: &Decision) -> Result<()> {
        let story_json =
            serde_json::to_string(&decision.story).context("failed to serialize story")?;

        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "INSERT INTO anomalies
               (id, symbol, pattern_type, severity, z_score, price, volume,
                detected_at, agent_decision, agent_confidence, agent_reason,
                context, sources, thought_process, story_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
             ON CONFLICT(id) DO UPDATE SET
                agent_decision = excluded.agent_decision,
                agent_confidence = excluded.agent_confidence,
                agent_reason = excluded.agent_reason,
                story_json = excluded.story_json",
        )?;

        stmt.execute(params![
            anomaly.id,
            anomaly.symbol,
            anomaly.pattern_type.as_str(),
            anomaly.severity.as_str(),
            anomaly.z_score,
            anomaly.price,
            anomaly.volume as i64,
            anomaly.detected_at.to_rfc3339(),
            decision.state.as_str(),
            decision.confidence.composite,
            decision.reason,
            anomaly.context,
            anomaly.sources,
            anomaly.thought_process,
            story_json,
        ])?;

        debug!(anomaly_id = %anomaly.id, state = %decision.state, "anomaly saved");
        Ok(())
    }

    /// Anomalies detected inside a time range, newest first: the query
    /// surface the API layer reads signals from.
    pub fn anomalies_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PendingAnomaly>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT a.id, a.symbol, a.pattern_type, a.severity, a.z_score, a.price,
                    a.detected_at, a.agent_decision, a.agent_confidence, a.agent_reason,
                    a.story_json
             FROM anomalies a
             WHERE a.detected_at >= ?1 AND a.detected_at < ?2
               AND a.agent_decision IS NOT NULL
             ORDER BY a.detected_at DESC
             LIMIT ?3",
        )?;

        let rows = stmt.query_map(
            params![from.to_rfc3339(), to.to_rfc3339(), limit as i64],
            row_to_pending_anomaly,
        )?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row??);
        }
        Ok(out)
    }

    /// Anomalies the user has not acted on yet, newest first, ignores
    /// excluded.
    pub fn list_pending_anomalies(&self, user_id: &str, limit: usize) -> Result<Vec<PendingAnomaly>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT a.id, a.symbol, a.pattern_type, a.severity, a.z_score, a.price,
                    a.detected_at, a.agent_decision, a.agent_confidence, a.agent_reason,
                    a.story_json
             FROM anomalies a
             LEFT JOIN user_actions ua
               ON a.id = ua.anomaly_id AND ua.user_id = ?1
             WHERE ua.id IS NULL
               AND a.agent_decision IS NOT NULL
               AND a.agent_decision != 'ignore'
             ORDER BY a.detected_at DESC
             LIMIT ?2",
        )?;

        let rows = stmt.query_map(params![user_id, limit as i64], row_to_pending_anomaly)?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row??);
        }
        Ok(out)
    }

    // -------------------------------------------------------------------------
    // User actions
    // -------------------------------------------------------------------------

    /// Record a user action. At most one per (anomaly, user); the latest by
    /// `recorded_at` wins — an older write never clobbers a newer one.
    pub fn save_user_action(
        &self,
        anomaly_id: &str,
        user_id: &str,
        action: UserActionKind,
        notes: Option<&str>,
        recorded_at: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "INSERT INTO user_actions (anomaly_id, user_id, action, notes, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(anomaly_id, user_id) DO UPDATE SET
                action = excluded.action,
                notes = excluded.notes,
                recorded_at = excluded.recorded_at
             WHERE excluded.recorded_at >= user_actions.recorded_at",
        )?;
        stmt.execute(params![
            anomaly_id,
            user_id,
            action.as_str(),
            notes,
            recorded_at.to_rfc3339(),
        ])?;
        Ok(())
    }

    /// The recorded action for (anomaly, user), if any.
    pub fn read_user_action(
        &self,
        anomaly_id: &str,
        user_id: &str,
    ) -> Result<Option<UserActionKind>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT action FROM user_actions
             WHERE anomaly_id = ?1 AND user_id = ?2",
        )?;
        let action: Option<String> = stmt
            .query_row(params![anomaly_id, user_id], |row| row.get(0))
            .map(Some)
            .or_else(ignore_not_found)?;

        action.map(|s| parse_action(&s)).transpose()
    }

    // -------------------------------------------------------------------------
    // Outcomes
    // -------------------------------------------------------------------------

    /// Persist the closed outcome for an anomaly. Keyed by anomaly id.
    pub fn save_outcome(&self, outcome: &OutcomeRow) -> Result<()> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "INSERT INTO anomaly_outcomes
               (anomaly_id, user_id, agent_decision, agent_confidence, user_action,
                return_15m, return_1h, return_4h, return_1d,
                was_profitable, agent_correct, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT(anomaly_id) DO UPDATE SET
                user_action = excluded.user_action,
                return_15m = excluded.return_15m,
                return_1h = excluded.return_1h,
                return_4h = excluded.return_4h,
                return_1d = excluded.return_1d,
                was_profitable = excluded.was_profitable,
                agent_correct = excluded.agent_correct,
                created_at = excluded.created_at",
        )?;

        stmt.execute(params![
            outcome.anomaly_id,
            outcome.user_id,
            outcome.agent_decision.as_str(),
            outcome.agent_confidence,
            outcome.user_action.as_str(),
            outcome.return_15m,
            outcome.return_1h,
            outcome.return_4h,
            outcome.return_1d,
            outcome.was_profitable as i64,
            outcome.agent_correct as i64,
            outcome.created_at.to_rfc3339(),
        ])?;

        info!(
            anomaly_id = %outcome.anomaly_id,
            user_action = %outcome.user_action,
            was_profitable = outcome.was_profitable,
            agent_correct = outcome.agent_correct,
            "outcome written"
        );
        Ok(())
    }

    /// Outcome rows for `user_id` newer than `days` days before `now`.
    pub fn recent_outcomes(
        &self,
        user_id: &str,
        days: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutcomeRow>> {
        let cutoff = (now - Duration::days(days)).to_rfc3339();
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT anomaly_id, user_id, agent_decision, agent_confidence, user_action,
                    return_15m, return_1h, return_4h, return_1d,
                    was_profitable, agent_correct, created_at
             FROM anomaly_outcomes
             WHERE user_id = ?1 AND created_at > ?2
             ORDER BY created_at DESC",
        )?;

        let rows = stmt.query_map(params![user_id, cutoff], row_to_outcome)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row??);
        }
        Ok(out)
    }

    // -------------------------------------------------------------------------
    // Pattern quality
    // -------------------------------------------------------------------------

    /// Recompute quality for the (user, pattern, symbol) triple as an exact
    /// aggregation over every matching outcome row, then upsert it. Returns
    /// the fresh row, or `None` when the triple has no outcomes yet.
    pub fn recompute_pattern_quality(
        &self,
        user_id: &str,
        pattern: PatternType,
        symbol: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<PatternQuality>> {
        let conn = self.conn.lock();

        let mut stmt = conn.prepare_cached(
            "SELECT COUNT(*),
                    AVG(CASE WHEN o.was_profitable != 0 THEN 1.0 ELSE 0.0 END),
                    AVG(CASE WHEN o.user_action IN ('reviewed', 'traded') THEN 1.0 ELSE 0.0 END),
                    AVG(CASE WHEN o.user_action = 'traded' THEN 1.0 ELSE 0.0 END),
                    AVG(COALESCE(o.return_1d, o.return_4h, o.return_1h, 0)),
                    AVG(CASE WHEN o.agent_correct != 0 THEN 1.0 ELSE 0.0 END)
             FROM anomaly_outcomes o
             JOIN anomalies a ON o.anomaly_id = a.id
             WHERE o.user_id = ?1 AND a.pattern_type = ?2 AND a.symbol = ?3",
        )?;

        let (sample_size, accuracy, review_rate, trade_rate, avg_return, agent_accuracy): (
            i64,
            Option<f64>,
            Option<f64>,
            Option<f64>,
            Option<f64>,
            Option<f64>,
        ) = stmt.query_row(params![user_id, pattern.as_str(), symbol], |row| {
            Ok((
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
                row.get(5)?,
            ))
        })?;

        if sample_size == 0 {
            return Ok(None);
        }

        let quality = PatternQuality {
            user_id: user_id.to_string(),
            pattern_type: pattern,
            symbol: symbol.to_string(),
            accuracy: accuracy.unwrap_or(0.0),
            review_rate: review_rate.unwrap_or(0.0),
            trade_rate: trade_rate.unwrap_or(0.0),
            avg_return: avg_return.unwrap_or(0.0),
            sample_size: sample_size as u32,
            agent_accuracy: agent_accuracy.unwrap_or(0.0),
            updated_at: now,
        };

        let mut stmt = conn.prepare_cached(
            "INSERT INTO pattern_quality
               (user_id, pattern_type, symbol, accuracy, review_rate, trade_rate,
                avg_return, sample_size, agent_accuracy, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(user_id, pattern_type, symbol) DO UPDATE SET
                accuracy = excluded.accuracy,
                review_rate = excluded.review_rate,
                trade_rate = excluded.trade_rate,
                avg_return = excluded.avg_return,
                sample_size = excluded.sample_size,
                agent_accuracy = excluded.agent_accuracy,
                updated_at = excluded.updated_at",
        )?;
        stmt.execute(params![
            quality.user_id,
            quality.pattern_type.as_str(),
            quality.symbol,
            quality.accuracy,
            quality.review_rate,
            quality.trade_rate,
            quality.avg_return,
            quality.sample_size as i64,
            quality.agent_accuracy,
            quality.updated_at.to_rfc3339(),
        ])?;

        info!(
            user_id,
            pattern = %pattern,
            symbol,
            sample_size = quality.sample_size,
            accuracy = format!("{:.2}", quality.accuracy),
            "quality updated"
        );

        Ok(Some(quality))
    }

    /// Read the stored quality row for a triple.
    pub fn read_pattern_quality(
        &self,
        user_id: &str,
        pattern: PatternType,
        symbol: &str,
    ) -> Result<Option<PatternQuality>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT user_id, pattern_type, symbol, accuracy, review_rate, trade_rate,
                    avg_return, sample_size, agent_accuracy, updated_at
             FROM pattern_quality
             WHERE user_id = ?1 AND pattern_type = ?2 AND symbol = ?3",
        )?;

        stmt.query_row(params![user_id, pattern.as_str(), symbol], row_to_quality)
            .map(Some)
            .or_else(ignore_not_found)?
            .transpose()
    }

    /// All quality rows with at least `min_samples` outcomes (adaptive job
    /// input), largest samples first.
    pub fn quality_rows(&self, min_samples: u32) -> Result<Vec<PatternQuality>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT user_id, pattern_type, symbol, accuracy, review_rate, trade_rate,
                    avg_return, sample_size, agent_accuracy, updated_at
             FROM pattern_quality
             WHERE sample_size >= ?1
             ORDER BY sample_size DESC",
        )?;

        let rows = stmt.query_map(params![min_samples as i64], row_to_quality)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row??);
        }
        Ok(out)
    }

    // -------------------------------------------------------------------------
    // Detection threshold overrides
    // -------------------------------------------------------------------------

    /// Upsert a per-(user, pattern, symbol) z-threshold override.
    pub fn upsert_threshold(
        &self,
        user_id: &str,
        pattern: PatternType,
        symbol: &str,
        z_threshold: f64,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "INSERT INTO detection_thresholds
               (user_id, pattern_type, symbol, z_score_threshold, reason, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(user_id, pattern_type, symbol) DO UPDATE SET
                z_score_threshold = excluded.z_score_threshold,
                reason = excluded.reason,
                updated_at = excluded.updated_at",
        )?;
        stmt.execute(params![
            user_id,
            pattern.as_str(),
            symbol,
            z_threshold,
            reason,
            now.to_rfc3339(),
        ])?;

        info!(
            user_id,
            pattern = %pattern,
            symbol,
            z_threshold,
            reason,
            "threshold adjusted"
        );
        Ok(())
    }

    /// Stored override for one triple.
    pub fn read_threshold(
        &self,
        user_id: &str,
        pattern: PatternType,
        symbol: &str,
    ) -> Result<Option<f64>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT z_score_threshold FROM detection_thresholds
             WHERE user_id = ?1 AND pattern_type = ?2 AND symbol = ?3",
        )?;
        stmt.query_row(params![user_id, pattern.as_str(), symbol], |row| row.get(0))
            .map(Some)
            .or_else(ignore_not_found)
            .map_err(Into::into)
    }

    /// All overrides for (user, symbol) as a pattern -> threshold map — the
    /// detector reads this before each evaluation.
    pub fn thresholds_for(
        &self,
        user_id: &str,
        symbol: &str,
    ) -> Result<HashMap<PatternType, f64>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT pattern_type, z_score_threshold FROM detection_thresholds
             WHERE user_id = ?1 AND symbol = ?2",
        )?;

        let rows = stmt.query_map(params![user_id, symbol], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
        })?;

        let mut out = HashMap::new();
        for row in rows {
            let (pattern, z) = row?;
            out.insert(parse_pattern(&pattern)?, z);
        }
        Ok(out)
    }

    // -------------------------------------------------------------------------
    // Pending outcome jobs
    // -------------------------------------------------------------------------

    /// Enqueue (or refresh) the durable follow-up job for an anomaly.
    pub fn enqueue_pending_outcome(&self, job: &PendingOutcomeJob) -> Result<()> {
        let returns_json =
            serde_json::to_string(&job.returns).context("failed to serialize returns")?;

        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "INSERT INTO pending_outcomes
               (anomaly_id, user_id, symbol, pattern_type, entry_price, agent_decision,
                agent_confidence, detected_at, regime, horizon, time_of_day, day_of_week,
                next_interval_index, fire_at, returns_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
             ON CONFLICT(anomaly_id) DO UPDATE SET
                next_interval_index = excluded.next_interval_index,
                fire_at = excluded.fire_at,
                returns_json = excluded.returns_json",
        )?;
        stmt.execute(params![
            job.anomaly_id,
            job.user_id,
            job.symbol,
            job.pattern_type.as_str(),
            job.entry_price,
            job.agent_decision.as_str(),
            job.agent_confidence,
            job.detected_at.to_rfc3339(),
            job.regime.as_str(),
            job.horizon.as_str(),
            job.time_of_day.as_str(),
            job.day_of_week as i64,
            job.next_interval_index as i64,
            job.fire_at.to_rfc3339(),
            returns_json,
        ])?;

        debug!(anomaly_id = %job.anomaly_id, fire_at = %job.fire_at, "pending outcome enqueued");
        Ok(())
    }

    /// Jobs whose `fire_at` has passed, oldest first.
    pub fn due_pending_outcomes(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PendingOutcomeJob>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT anomaly_id, user_id, symbol, pattern_type, entry_price, agent_decision,
                    agent_confidence, detected_at, regime, horizon, time_of_day, day_of_week,
                    next_interval_index, fire_at, returns_json
             FROM pending_outcomes
             WHERE fire_at <= ?1
             ORDER BY fire_at ASC
             LIMIT ?2",
        )?;

        let rows = stmt.query_map(params![now.to_rfc3339(), limit as i64], row_to_job)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row??);
        }
        Ok(out)
    }

    /// Remove a job once its outcome row has been written.
    pub fn delete_pending_outcome(&self, anomaly_id: &str) -> Result<()> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare_cached("DELETE FROM pending_outcomes WHERE anomaly_id = ?1")?;
        stmt.execute(params![anomaly_id])?;
        Ok(())
    }

    /// Non-ignored anomalies that have neither an outcome nor a pending job
    /// — follow-ups lost to a crash before the job row was written.
    pub fn recovery_candidates(&self) -> Result<Vec<RecoveredAnomaly>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT a.id, a.symbol, a.pattern_type, a.price, a.detected_at,
                    a.agent_decision, a.agent_confidence
             FROM anomalies a
             LEFT JOIN anomaly_outcomes o ON o.anomaly_id = a.id
             LEFT JOIN pending_outcomes p ON p.anomaly_id = a.id
             WHERE o.anomaly_id IS NULL
               AND p.anomaly_id IS NULL
               AND a.agent_decision IS NOT NULL
               AND a.agent_decision != 'ignore'",
        )?;

        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, f64>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, f64>(6)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (id, symbol, pattern, price, detected_at, decision, confidence) = row?;
            out.push(RecoveredAnomaly {
                id,
                symbol,
                pattern_type: parse_pattern(&pattern)?,
                price,
                detected_at: parse_ts(&detected_at)?,
                agent_decision: parse_state(&decision)?,
                agent_confidence: confidence,
            });
        }
        Ok(out)
    }

    // -------------------------------------------------------------------------
    // Causal observations
    // -------------------------------------------------------------------------

    /// Append one causal observation (outcome-persistence path only).
    pub fn append_causal_observation(&self, obs: &CausalObservation) -> Result<()> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "INSERT INTO causal_observations
               (pattern_type, regime, horizon, time_of_day, day_of_week, success, observed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )?;
        stmt.execute(params![
            obs.pattern_type.as_str(),
            obs.regime.as_str(),
            obs.horizon.as_str(),
            obs.time_of_day.as_str(),
            obs.day_of_week as i64,
            obs.success as i64,
            obs.observed_at.to_rfc3339(),
        ])?;
        Ok(())
    }

    /// Observations newer than `days` days before `now` (learner warm-up).
    pub fn load_causal_observations(
        &self,
        days: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<CausalObservation>> {
        let cutoff = (now - Duration::days(days)).to_rfc3339();
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT pattern_type, regime, horizon, time_of_day, day_of_week, success, observed_at
             FROM causal_observations
             WHERE observed_at > ?1
             ORDER BY observed_at ASC",
        )?;

        let rows = stmt.query_map(params![cutoff], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, i64>(5)?,
                row.get::<_, String>(6)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (pattern, regime, horizon, tod, dow, success, observed_at) = row?;
            out.push(CausalObservation {
                pattern_type: parse_pattern(&pattern)?,
                regime: parse_regime(&regime)?,
                horizon: parse_horizon(&horizon)?,
                time_of_day: parse_time_of_day(&tod)?,
                day_of_week: dow as u8,
                success: success != 0,
                observed_at: parse_ts(&observed_at)?,
            });
        }
        Ok(out)
    }
}

// =============================================================================
// Row mapping & parsing helpers
// =============================================================================

fn ignore_not_found<T>(err: rusqlite::Error) -> rusqlite::Result<Option<T>> {
    match err {
        rusqlite::Error::QueryReturnedNoRows => Ok(None),
        other => Err(other),
    }
}

type SqlRow<'a, 'b> = &'a rusqlite::Row<'b>;

fn row_to_pending_anomaly(row: SqlRow<'_, '_>) -> rusqlite::Result<Result<PendingAnomaly>> {
    let pattern: String = row.get(2)?;
    let severity: String = row.get(3)?;
    let detected_at: String = row.get(6)?;
    let decision: String = row.get(7)?;
    let reason: Option<String> = row.get(9)?;
    let story_json: Option<String> = row.get(10)?;

    Ok((|| {
        Ok(PendingAnomaly {
            id: row.get(0)?,
            symbol: row.get(1)?,
            pattern_type: parse_pattern(&pattern)?,
            severity: parse_severity(&severity)?,
            z_score: row.get(4)?,
            price: row.get(5)?,
            detected_at: parse_ts(&detected_at)?,
            agent_decision: parse_state(&decision)?,
            agent_confidence: row.get(8)?,
            agent_reason: reason.unwrap_or_default(),
            story: story_json
                .as_deref()
                .and_then(|s| serde_json::from_str(s).ok()),
        })
    })())
}

fn row_to_outcome(row: SqlRow<'_, '_>) -> rusqlite::Result<Result<OutcomeRow>> {
    let decision: String = row.get(2)?;
    let action: String = row.get(4)?;
    let created_at: String = row.get(11)?;

    Ok((|| {
        Ok(OutcomeRow {
            anomaly_id: row.get(0)?,
            user_id: row.get(1)?,
            agent_decision: parse_state(&decision)?,
            agent_confidence: row.get(3)?,
            user_action: parse_action(&action)?,
            return_15m: row.get(5)?,
            return_1h: row.get(6)?,
            return_4h: row.get(7)?,
            return_1d: row.get(8)?,
            was_profitable: row.get::<_, i64>(9)? != 0,
            agent_correct: row.get::<_, i64>(10)? != 0,
            created_at: parse_ts(&created_at)?,
        })
    })())
}

fn row_to_quality(row: SqlRow<'_, '_>) -> rusqlite::Result<Result<PatternQuality>> {
    let pattern: String = row.get(1)?;
    let updated_at: String = row.get(9)?;

    Ok((|| {
        Ok(PatternQuality {
            user_id: row.get(0)?,
            pattern_type: parse_pattern(&pattern)?,
            symbol: row.get(2)?,
            accuracy: row.get(3)?,
            review_rate: row.get(4)?,
            trade_rate: row.get(5)?,
            avg_return: row.get(6)?,
            sample_size: row.get::<_, i64>(7)? as u32,
            agent_accuracy: row.get(8)?,
            updated_at: parse_ts(&updated_at)?,
        })
    })())
}

fn row_to_job(row: SqlRow<'_, '_>) -> rusqlite::Result<Result<PendingOutcomeJob>> {
    let pattern: String = row.get(3)?;
    let decision: String = row.get(5)?;
    let detected_at: String = row.get(7)?;
    let regime: String = row.get(8)?;
    let horizon: String = row.get(9)?;
    let time_of_day: String = row.get(10)?;
    let fire_at: String = row.get(13)?;
    let returns_json: String = row.get(14)?;

    Ok((|| {
        Ok(PendingOutcomeJob {
            anomaly_id: row.get(0)?,
            user_id: row.get(1)?,
            symbol: row.get(2)?,
            pattern_type: parse_pattern(&pattern)?,
            entry_price: row.get(4)?,
            agent_decision: parse_state(&decision)?,
            agent_confidence: row.get(6)?,
            detected_at: parse_ts(&detected_at)?,
            regime: parse_regime(&regime)?,
            horizon: parse_horizon(&horizon)?,
            time_of_day: parse_time_of_day(&time_of_day)?,
            day_of_week: row.get::<_, i64>(11)? as u8,
            next_interval_index: row.get::<_, i64>(12)? as usize,
            fire_at: parse_ts(&fire_at)?,
            returns: serde_json::from_str(&returns_json)
                .context("failed to parse returns_json")?,
        })
    })())
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("bad timestamp in database: {s}"))
}

fn parse_pattern(s: &str) -> Result<PatternType> {
    PatternType::parse(s).with_context(|| format!("bad pattern_type in database: {s}"))
}

fn parse_severity(s: &str) -> Result<Severity> {
    match s {
        "low" => Ok(Severity::Low),
        "medium" => Ok(Severity::Medium),
        "high" => Ok(Severity::High),
        "critical" => Ok(Severity::Critical),
        _ => anyhow::bail!("bad severity in database: {s}"),
    }
}

fn parse_state(s: &str) -> Result<DecisionState> {
    DecisionState::parse(s).with_context(|| format!("bad agent_decision in database: {s}"))
}

fn parse_action(s: &str) -> Result<UserActionKind> {
    UserActionKind::parse(s).with_context(|| format!("bad user_action in database: {s}"))
}

fn parse_regime(s: &str) -> Result<MarketRegime> {
    let regime = match s {
        "trending_up" => MarketRegime::TrendingUp,
        "trending_down" => MarketRegime::TrendingDown,
        "ranging" => MarketRegime::Ranging,
        "high_volatility" => MarketRegime::HighVolatility,
        "low_volatility" => MarketRegime::LowVolatility,
        "breakout" => MarketRegime::Breakout,
        "unknown" => MarketRegime::Unknown,
        _ => anyhow::bail!("bad regime in database: {s}"),
    };
    Ok(regime)
}

fn parse_horizon(s: &str) -> Result<Horizon> {
    let horizon = match s {
        "scalp" => Horizon::Scalp,
        "intraday" => Horizon::Intraday,
        "swing" => Horizon::Swing,
        "positional" => Horizon::Positional,
        _ => anyhow::bail!("bad horizon in database: {s}"),
    };
    Ok(horizon)
}

fn parse_time_of_day(s: &str) -> Result<TimeOfDay> {
    let tod = match s {
        "open" => TimeOfDay::Open,
        "mid" => TimeOfDay::Mid,
        "close" => TimeOfDay::Close,
        "after_hours" => TimeOfDay::AfterHours,
        _ => anyhow::bail!("bad time_of_day in database: {s}"),
    };
    Ok(tod)
}
