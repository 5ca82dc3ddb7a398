//! Persistence gateway: case records and per-request outcomes in SQLite.
//!
//! Cases are keyed on `(case_number, court_id, bench_id)`. Re-extracting a
//! known case updates it in place; only status, stage and next hearing date
//! are overwritten. Each write is one transaction.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, SecondsFormat, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Transaction};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use crate::core::types::{CaseRecord, OutcomeRecord, RunOutcome, SearchType, StoreStats, UpsertSummary};
use crate::core::{PortalError, PortalResult};

const DATE_FORMAT: &str = "%Y-%m-%d";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS cases (
    id                 INTEGER PRIMARY KEY AUTOINCREMENT,
    case_number        TEXT NOT NULL,
    court_id           TEXT NOT NULL,
    bench_id           TEXT NOT NULL,
    filing_date        TEXT,
    registration_date  TEXT,
    next_hearing_date  TEXT,
    petitioner         TEXT NOT NULL,
    respondent         TEXT NOT NULL,
    status             TEXT NOT NULL,
    stage              TEXT,
    captcha_attempt    INTEGER NOT NULL,
    first_request_id   TEXT NOT NULL,
    last_request_id    TEXT NOT NULL,
    first_seen_at      TEXT NOT NULL,
    last_seen_at       TEXT NOT NULL,
    UNIQUE (case_number, court_id, bench_id)
);
CREATE INDEX IF NOT EXISTS idx_cases_court_bench ON cases (court_id, bench_id);

CREATE TABLE IF NOT EXISTS run_outcomes (
    id                  INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id              TEXT NOT NULL,
    request_id          TEXT NOT NULL,
    court_id            TEXT NOT NULL,
    bench_id            TEXT NOT NULL,
    search_type         TEXT NOT NULL,
    query               TEXT NOT NULL,
    outcome             TEXT NOT NULL,
    outcome_json        TEXT NOT NULL,
    result_count        INTEGER NOT NULL,
    failure_kind        TEXT,
    captcha_attempts    INTEGER NOT NULL,
    pipeline_attempts   INTEGER NOT NULL,
    topology_refreshes  INTEGER NOT NULL,
    recorded_at         TEXT NOT NULL,
    UNIQUE (run_id, request_id)
);
CREATE INDEX IF NOT EXISTS idx_outcomes_recorded_at ON run_outcomes (recorded_at);
CREATE INDEX IF NOT EXISTS idx_outcomes_outcome ON run_outcomes (outcome);
";

#[async_trait]
pub trait CaseStore: Send + Sync {
    /// Insert new cases, update changed ones. One transaction per call.
    async fn upsert(&self, records: &[CaseRecord]) -> PortalResult<UpsertSummary>;

    /// Store one request's terminal outcome. A second outcome for the same
    /// `(run_id, request_id)` is a [`PortalError::PersistenceConflict`].
    async fn record_outcome(&self, outcome: &OutcomeRecord) -> PortalResult<()>;

    /// Records and their SUCCESS outcome, atomically.
    async fn commit_success(&self, records: &[CaseRecord], outcome: &OutcomeRecord) -> PortalResult<UpsertSummary>;

    async fn stats(&self) -> PortalResult<StoreStats>;

    async fn get_case(&self, case_number: &str, court_id: &str, bench_id: &str) -> PortalResult<Option<CaseRecord>>;

    async fn outcomes_for_run(&self, run_id: &str) -> PortalResult<Vec<OutcomeRecord>>;
}

fn timestamp(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn date_text(d: &Option<NaiveDate>) -> Option<String> {
    d.map(|d| d.format(DATE_FORMAT).to_string())
}

fn parse_date_text(s: Option<String>) -> Option<NaiveDate> {
    s.and_then(|s| NaiveDate::parse_from_str(&s, DATE_FORMAT).ok())
}

fn upsert_tx(tx: &Transaction<'_>, records: &[CaseRecord]) -> PortalResult<UpsertSummary> {
    let mut summary = UpsertSummary::default();

    for rec in records {
        let seen_at = timestamp(&rec.extracted_at);
        let next_hearing = date_text(&rec.next_hearing_date);

        let existing: Option<(i64, String, Option<String>, Option<String>)> = tx
            .query_row(
                "SELECT id, status, stage, next_hearing_date FROM cases
                 WHERE case_number = ?1 AND court_id = ?2 AND bench_id = ?3",
                params![rec.case_number, rec.court_id, rec.bench_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;

        match existing {
            None => {
                tx.execute(
                    "INSERT INTO cases (
                        case_number, court_id, bench_id, filing_date, registration_date,
                        next_hearing_date, petitioner, respondent, status, stage,
                        captcha_attempt, first_request_id, last_request_id, first_seen_at, last_seen_at
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?12, ?13, ?13)",
                    params![
                        rec.case_number,
                        rec.court_id,
                        rec.bench_id,
                        date_text(&rec.filing_date),
                        date_text(&rec.registration_date),
                        next_hearing,
                        rec.petitioner,
                        rec.respondent,
                        rec.status,
                        rec.stage,
                        rec.captcha_attempt,
                        rec.request_id,
                        seen_at,
                    ],
                )?;
                summary.inserted += 1;
            }
            Some((id, status, stage, hearing)) => {
                let changed = status != rec.status || stage != rec.stage || hearing != next_hearing;
                if changed {
                    tx.execute(
                        "UPDATE cases SET status = ?1, stage = ?2, next_hearing_date = ?3,
                             captcha_attempt = ?4, last_request_id = ?5, last_seen_at = ?6
                         WHERE id = ?7",
                        params![
                            rec.status,
                            rec.stage,
                            next_hearing,
                            rec.captcha_attempt,
                            rec.request_id,
                            seen_at,
                            id
                        ],
                    )?;
                    debug!(case = %rec.case_number, "store: status changed ({} -> {})", status, rec.status);
                    summary.updated += 1;
                } else {
                    tx.execute(
                        "UPDATE cases SET last_request_id = ?1, last_seen_at = ?2 WHERE id = ?3",
                        params![rec.request_id, seen_at, id],
                    )?;
                    summary.unchanged += 1;
                }
            }
        }
    }
    Ok(summary)
}

fn insert_outcome_tx(tx: &Transaction<'_>, rec: &OutcomeRecord) -> PortalResult<()> {
    let outcome_json =
        serde_json::to_string(&rec.outcome).map_err(|e| PortalError::Persistence(e.to_string()))?;
    let failure_kind = match &rec.outcome {
        RunOutcome::Failed { reason } => Some(reason.kind.as_str()),
        _ => None,
    };

    let result = tx.execute(
        "INSERT INTO run_outcomes (
            run_id, request_id, court_id, bench_id, search_type, query, outcome, outcome_json,
            result_count, failure_kind, captcha_attempts, pipeline_attempts, topology_refreshes, recorded_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        params![
            rec.run_id,
            rec.request_id,
            rec.court_id,
            rec.bench_id,
            rec.search_type.as_str(),
            rec.query,
            rec.outcome.label(),
            outcome_json,
            rec.outcome.result_count() as i64,
            failure_kind,
            rec.captcha_attempts,
            rec.pipeline_attempts,
            rec.topology_refreshes,
            timestamp(&rec.recorded_at),
        ],
    );

    match result {
        Ok(_) => Ok(()),
        Err(rusqlite::Error::SqliteFailure(err, _)) if err.code == ErrorCode::ConstraintViolation => {
            Err(PortalError::PersistenceConflict {
                run_id: rec.run_id.clone(),
                request_id: rec.request_id.clone(),
            })
        }
        Err(e) => Err(e.into()),
    }
}

fn parse_search_type(s: &str) -> SearchType {
    match s {
        "case_number" => SearchType::CaseNumber,
        _ => SearchType::PartyName,
    }
}

/// SQLite-backed [`CaseStore`]. Blocking calls run on the blocking pool.
#[derive(Clone)]
pub struct SqliteCaseStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteCaseStore {
    /// Open (creating parent directories and schema as needed).
    pub fn open(path: &Path) -> PortalResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    PortalError::Persistence(format!("cannot create {}: {}", parent.display(), e))
                })?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        let store = Self::init(conn)?;
        info!("💾 Case store ready at {}", path.display());
        Ok(store)
    }

    pub fn in_memory() -> PortalResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> PortalResult<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn blocking<T, F>(&self, f: F) -> PortalResult<T>
    where
        F: FnOnce(&mut Connection) -> PortalResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| PortalError::Persistence("store mutex poisoned".into()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| PortalError::Persistence(format!("store task failed: {}", e)))?
    }
}

#[async_trait]
impl CaseStore for SqliteCaseStore {
    async fn upsert(&self, records: &[CaseRecord]) -> PortalResult<UpsertSummary> {
        let records = records.to_vec();
        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            let summary = upsert_tx(&tx, &records)?;
            tx.commit()?;
            Ok(summary)
        })
        .await
    }

    async fn record_outcome(&self, outcome: &OutcomeRecord) -> PortalResult<()> {
        let outcome = outcome.clone();
        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            insert_outcome_tx(&tx, &outcome)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn commit_success(&self, records: &[CaseRecord], outcome: &OutcomeRecord) -> PortalResult<UpsertSummary> {
        let records = records.to_vec();
        let outcome = outcome.clone();
        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            let summary = upsert_tx(&tx, &records)?;
            insert_outcome_tx(&tx, &outcome)?;
            tx.commit()?;
            Ok(summary)
        })
        .await
    }

    async fn stats(&self) -> PortalResult<StoreStats> {
        let since = timestamp(&(Utc::now() - ChronoDuration::hours(24)));
        self.blocking(move |conn| {
            let (total, successful, failed, results): (i64, i64, i64, i64) = conn.query_row(
                "SELECT COUNT(*),
                        COALESCE(SUM(outcome IN ('success', 'no_results')), 0),
                        COALESCE(SUM(outcome IN ('failed', 'exhausted_retries')), 0),
                        COALESCE(SUM(result_count), 0)
                 FROM run_outcomes",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )?;
            let recent: i64 = conn.query_row(
                "SELECT COUNT(*) FROM run_outcomes WHERE recorded_at >= ?1",
                params![since],
                |row| row.get(0),
            )?;
            let cases: i64 = conn.query_row("SELECT COUNT(*) FROM cases", [], |row| row.get(0))?;

            Ok(StoreStats {
                total_searches: total as u64,
                successful_searches: successful as u64,
                failed_searches: failed as u64,
                total_results: results as u64,
                recent_searches: recent as u64,
                success_rate: if total > 0 {
                    successful as f64 / total as f64 * 100.0
                } else {
                    0.0
                },
                total_cases: cases as u64,
            })
        })
        .await
    }

    async fn get_case(&self, case_number: &str, court_id: &str, bench_id: &str) -> PortalResult<Option<CaseRecord>> {
        let key = (case_number.to_string(), court_id.to_string(), bench_id.to_string());
        self.blocking(move |conn| {
            let row = conn
                .query_row(
                    "SELECT case_number, court_id, bench_id, filing_date, registration_date,
                            next_hearing_date, petitioner, respondent, status, stage,
                            captcha_attempt, last_request_id, last_seen_at
                     FROM cases WHERE case_number = ?1 AND court_id = ?2 AND bench_id = ?3",
                    params![key.0, key.1, key.2],
                    |row| {
                        let seen: String = row.get(12)?;
                        Ok(CaseRecord {
                            case_number: row.get(0)?,
                            court_id: row.get(1)?,
                            bench_id: row.get(2)?,
                            filing_date: parse_date_text(row.get(3)?),
                            registration_date: parse_date_text(row.get(4)?),
                            next_hearing_date: parse_date_text(row.get(5)?),
                            petitioner: row.get(6)?,
                            respondent: row.get(7)?,
                            status: row.get(8)?,
                            stage: row.get(9)?,
                            captcha_attempt: row.get(10)?,
                            request_id: row.get(11)?,
                            extracted_at: DateTime::parse_from_rfc3339(&seen)
                                .map(|t| t.with_timezone(&Utc))
                                .unwrap_or_else(|_| Utc::now()),
                        })
                    },
                )
                .optional()?;
            Ok(row)
        })
        .await
    }

    async fn outcomes_for_run(&self, run_id: &str) -> PortalResult<Vec<OutcomeRecord>> {
        let run_id = run_id.to_string();
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT run_id, request_id, court_id, bench_id, search_type, query, outcome_json,
                        captcha_attempts, pipeline_attempts, topology_refreshes, recorded_at
                 FROM run_outcomes WHERE run_id = ?1 ORDER BY id",
            )?;
            let rows = stmt.query_map(params![run_id], |row| {
                Ok((
                    (
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                    ),
                    row.get::<_, String>(6)?,
                    (row.get::<_, u32>(7)?, row.get::<_, u32>(8)?, row.get::<_, u32>(9)?),
                    row.get::<_, String>(10)?,
                ))
            })?;

            let mut out = Vec::new();
            for row in rows {
                let ((run_id, request_id, court_id, bench_id, search_type, query), json, counts, at) = row?;
                let outcome: RunOutcome =
                    serde_json::from_str(&json).map_err(|e| PortalError::Persistence(e.to_string()))?;
                let recorded_at = DateTime::parse_from_rfc3339(&at)
                    .map_err(|e| PortalError::Persistence(e.to_string()))?
                    .with_timezone(&Utc);
                out.push(OutcomeRecord {
                    run_id,
                    request_id,
                    court_id,
                    bench_id,
                    search_type: parse_search_type(&search_type),
                    query,
                    outcome,
                    captcha_attempts: counts.0,
                    pipeline_attempts: counts.1,
                    topology_refreshes: counts.2,
                    recorded_at,
                });
            }
            Ok(out)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{FailureKind, FailureReason};

    fn record(case_number: &str, status: &str) -> CaseRecord {
        CaseRecord {
            case_number: case_number.into(),
            filing_date: NaiveDate::from_ymd_opt(2021, 3, 4),
            registration_date: None,
            next_hearing_date: NaiveDate::from_ymd_opt(2024, 5, 6),
            petitioner: "A Kumar".into(),
            respondent: "State".into(),
            status: status.into(),
            stage: None,
            court_id: "C1".into(),
            bench_id: "B1".into(),
            request_id: "req-1".into(),
            captcha_attempt: 1,
            extracted_at: Utc::now(),
        }
    }

    fn outcome(run: &str, request: &str, outcome: RunOutcome) -> OutcomeRecord {
        OutcomeRecord {
            run_id: run.into(),
            request_id: request.into(),
            court_id: "C1".into(),
            bench_id: "B1".into(),
            search_type: SearchType::CaseNumber,
            query: "1234/2021".into(),
            outcome,
            captcha_attempts: 1,
            pipeline_attempts: 1,
            topology_refreshes: 0,
            recorded_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let store = tokio_test::assert_ok!(SqliteCaseStore::in_memory());
        let batch = vec![record("WP 1/2021", "Pending"), record("WP 2/2021", "Pending")];

        let first = store.upsert(&batch).await.unwrap();
        assert_eq!(first.inserted, 2);

        let second = store.upsert(&batch).await.unwrap();
        assert_eq!(second.inserted, 0);
        assert_eq!(second.updated, 0);
        assert_eq!(second.unchanged, 2);
    }

    #[tokio::test]
    async fn test_status_change_updates_in_place() {
        let store = SqliteCaseStore::in_memory().unwrap();
        store.upsert(&[record("WP 1/2021", "Pending")]).await.unwrap();

        let mut changed = record("WP 1/2021", "Disposed");
        changed.petitioner = "Someone Else".into();
        let summary = store.upsert(&[changed]).await.unwrap();
        assert_eq!(summary.updated, 1);
        assert_eq!(summary.inserted, 0);

        let stored = store.get_case("WP 1/2021", "C1", "B1").await.unwrap().unwrap();
        assert_eq!(stored.status, "Disposed");
        // Non-status fields keep their first-seen values.
        assert_eq!(stored.petitioner, "A Kumar");
        assert_eq!(store.stats().await.unwrap().total_cases, 1);
    }

    #[tokio::test]
    async fn test_natural_key_spans_benches() {
        let store = SqliteCaseStore::in_memory().unwrap();
        let mut other_bench = record("WP 1/2021", "Pending");
        other_bench.bench_id = "B2".into();
        let summary = store
            .upsert(&[record("WP 1/2021", "Pending"), other_bench])
            .await
            .unwrap();
        assert_eq!(summary.inserted, 2);
    }

    #[tokio::test]
    async fn test_duplicate_outcome_is_a_conflict() {
        let store = SqliteCaseStore::in_memory().unwrap();
        store
            .record_outcome(&outcome("run-1", "req-1", RunOutcome::NoResults))
            .await
            .unwrap();
        let err = tokio_test::assert_err!(
            store
                .record_outcome(&outcome("run-1", "req-1", RunOutcome::NoResults))
                .await
        );
        assert!(matches!(err, PortalError::PersistenceConflict { .. }));

        // Same request id in a later run is fine.
        store
            .record_outcome(&outcome("run-2", "req-1", RunOutcome::NoResults))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_commit_success_rolls_back_on_conflict() {
        let store = SqliteCaseStore::in_memory().unwrap();
        let ok = RunOutcome::Success {
            records: 1,
            truncated: false,
        };
        store
            .record_outcome(&outcome("run-1", "req-1", ok.clone()))
            .await
            .unwrap();

        let err = store
            .commit_success(&[record("WP 9/2021", "Pending")], &outcome("run-1", "req-1", ok))
            .await
            .unwrap_err();
        assert!(matches!(err, PortalError::PersistenceConflict { .. }));
        assert!(store.get_case("WP 9/2021", "C1", "B1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stats() {
        let store = SqliteCaseStore::in_memory().unwrap();
        store
            .commit_success(
                &[record("WP 1/2021", "Pending"), record("WP 2/2021", "Pending")],
                &outcome(
                    "run-1",
                    "a",
                    RunOutcome::Success {
                        records: 2,
                        truncated: false,
                    },
                ),
            )
            .await
            .unwrap();
        store
            .record_outcome(&outcome(
                "run-1",
                "b",
                RunOutcome::Failed {
                    reason: FailureReason {
                        kind: FailureKind::Timeout,
                        message: "slow".into(),
                    },
                },
            ))
            .await
            .unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total_searches, 2);
        assert_eq!(stats.successful_searches, 1);
        assert_eq!(stats.failed_searches, 1);
        assert_eq!(stats.total_results, 2);
        assert_eq!(stats.recent_searches, 2);
        assert_eq!(stats.total_cases, 2);
        assert!((stats.success_rate - 50.0).abs() < f64::EPSILON);

        let outcomes = store.outcomes_for_run("run-1").await.unwrap();
        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[1].outcome.label(), "failed");
    }

    #[tokio::test]
    async fn test_open_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("cases.db");
        let store = SqliteCaseStore::open(&path).unwrap();
        store.upsert(&[record("WP 1/2021", "Pending")]).await.unwrap();
        assert!(path.exists());
    }
}
