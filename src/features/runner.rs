//! Batch runner: fans requests out over isolated browser sessions.
//!
//! Concurrency is bounded by `workers`. Every request ends with exactly one
//! persisted outcome, whether it succeeded, failed, could not get a session,
//! or was cancelled before or during its run. One request's failure never
//! affects another's.

use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::artifacts::ArtifactWriter;
use super::orchestrator::{SearchOrchestrator, SearchProgress, SearchReport, SearchState};
use super::store::CaseStore;
use crate::core::types::{CaseRecord, FailureKind, OutcomeRecord, RunOutcome, SearchRequest, UpsertSummary};
use crate::core::PortalError;
use crate::scraping::SessionFactory;

#[derive(Debug, Default, Clone)]
pub struct BatchSummary {
    pub run_id: String,
    /// One per request, in submission order.
    pub outcomes: Vec<OutcomeRecord>,
    pub inserted: usize,
    pub updated: usize,
    pub elapsed_ms: u64,
}

impl BatchSummary {
    pub fn count(&self, label: &str) -> usize {
        self.outcomes.iter().filter(|o| o.outcome.label() == label).count()
    }
}

pub struct BatchRunner {
    run_id: String,
    orchestrator: Arc<SearchOrchestrator>,
    sessions: Arc<dyn SessionFactory>,
    store: Arc<dyn CaseStore>,
    artifacts: Option<Arc<ArtifactWriter>>,
    workers: usize,
    cancel: CancellationToken,
}

fn report_for(request: &SearchRequest, outcome: RunOutcome) -> SearchReport {
    SearchReport {
        request_id: request.id.clone(),
        outcome,
        records: Vec::new(),
        final_state: SearchState::Error,
        captcha_attempts: 0,
        pipeline_attempts: 0,
        topology_refreshes: 0,
    }
}

fn failed(err: PortalError) -> RunOutcome {
    RunOutcome::Failed {
        reason: err.failure_reason(),
    }
}

impl BatchRunner {
    pub fn new(
        run_id: impl Into<String>,
        orchestrator: Arc<SearchOrchestrator>,
        sessions: Arc<dyn SessionFactory>,
        store: Arc<dyn CaseStore>,
        workers: usize,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            orchestrator,
            sessions,
            store,
            artifacts: None,
            workers: workers.max(1),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_artifacts(mut self, artifacts: Arc<ArtifactWriter>) -> Self {
        self.artifacts = Some(artifacts);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Cancelling this token stops the batch at the next suspension point.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn run(&self, requests: Vec<SearchRequest>) -> BatchSummary {
        let start = Instant::now();
        let total = requests.len();
        info!(run = %self.run_id, "🚀 Starting batch of {} searches (workers: {})", total, self.workers);

        let mut results: Vec<(usize, OutcomeRecord, UpsertSummary)> = stream::iter(requests.into_iter().enumerate())
            .map(|(idx, request)| async move {
                let (outcome, summary) = self.process(&request).await;
                (idx, outcome, summary)
            })
            .buffer_unordered(self.workers)
            .collect()
            .await;
        results.sort_by_key(|(idx, _, _)| *idx);

        let mut summary = BatchSummary {
            run_id: self.run_id.clone(),
            elapsed_ms: start.elapsed().as_millis() as u64,
            ..Default::default()
        };
        for (_, outcome, upsert) in results {
            summary.inserted += upsert.inserted;
            summary.updated += upsert.updated;
            summary.outcomes.push(outcome);
        }

        info!(
            run = %self.run_id,
            success = summary.count("success"),
            no_results = summary.count("no_results"),
            failed = summary.count("failed"),
            exhausted = summary.count("exhausted_retries"),
            inserted = summary.inserted,
            updated = summary.updated,
            "✅ Batch finished in {}ms",
            summary.elapsed_ms
        );
        summary
    }

    async fn process(&self, request: &SearchRequest) -> (OutcomeRecord, UpsertSummary) {
        if self.cancel.is_cancelled() {
            return self.finish(request, report_for(request, failed(PortalError::Cancelled))).await;
        }

        let opened = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(PortalError::Cancelled),
            opened = self.sessions.open() => opened,
        };
        let mut session = match opened {
            Ok(s) => s,
            Err(PortalError::Cancelled) => {
                return self.finish(request, report_for(request, failed(PortalError::Cancelled))).await;
            }
            Err(e) => {
                warn!(request = %request.id, "no browser session: {}", e);
                let reason = match e {
                    PortalError::Session(_) => e,
                    other => PortalError::Session(other.to_string()),
                };
                return self.finish(request, report_for(request, failed(reason))).await;
            }
        };

        let progress = SearchProgress::default();
        let report = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                warn!(
                    request = %request.id,
                    captcha_attempts = progress.captcha_attempts(),
                    "search cancelled"
                );
                SearchReport {
                    captcha_attempts: progress.captcha_attempts(),
                    pipeline_attempts: progress.pipeline_attempts(),
                    topology_refreshes: progress.topology_refreshes(),
                    ..report_for(request, failed(PortalError::Cancelled))
                }
            }
            report = self.orchestrator.run_tracked(session.driver(), request, &progress) => report,
        };

        let cancelled = matches!(
            &report.outcome,
            RunOutcome::Failed { reason } if reason.kind == FailureKind::Cancelled
        );
        if !report.outcome.is_success() && !matches!(report.outcome, RunOutcome::NoResults) && !cancelled {
            if let Some(artifacts) = &self.artifacts {
                artifacts.capture_failure(session.driver(), &request.id).await;
            }
        }
        session.release().await;

        self.finish(request, report).await
    }

    /// Persist the single outcome for `request`.
    async fn finish(&self, request: &SearchRequest, report: SearchReport) -> (OutcomeRecord, UpsertSummary) {
        let mut record = OutcomeRecord {
            run_id: self.run_id.clone(),
            request_id: request.id.clone(),
            court_id: request.court_id.clone(),
            bench_id: request.bench_id.clone(),
            search_type: request.search_type(),
            query: request.query.describe(),
            outcome: report.outcome,
            captcha_attempts: report.captcha_attempts,
            pipeline_attempts: report.pipeline_attempts,
            topology_refreshes: report.topology_refreshes,
            recorded_at: Utc::now(),
        };

        let upsert = self.persist(&mut record, &report.records).await;
        if let Some(artifacts) = &self.artifacts {
            artifacts.append_outcome(&record).await;
        }
        (record, upsert)
    }

    async fn persist(&self, record: &mut OutcomeRecord, records: &[CaseRecord]) -> UpsertSummary {
        let result = if record.outcome.is_success() {
            self.store.commit_success(records, record).await
        } else {
            self.store.record_outcome(record).await.map(|_| UpsertSummary::default())
        };

        match result {
            Ok(summary) => {
                if record.outcome.is_success() {
                    info!(
                        request = %record.request_id,
                        inserted = summary.inserted,
                        updated = summary.updated,
                        unchanged = summary.unchanged,
                        "💾 Stored {} case records",
                        records.len()
                    );
                }
                summary
            }
            Err(e @ PortalError::PersistenceConflict { .. }) => {
                // An outcome for this request already exists in this run; the
                // first one stands and nothing else is written.
                error!(run = %record.run_id, request = %record.request_id, "🚨 data integrity: {}", e);
                record.outcome = failed(e);
                UpsertSummary::default()
            }
            Err(e) => {
                error!(request = %record.request_id, "persisting outcome failed: {}", e);
                let was_success = record.outcome.is_success();
                record.outcome = failed(e);
                if was_success {
                    // The success transaction rolled back; store the failure instead.
                    if let Err(e2) = self.store.record_outcome(record).await {
                        error!(request = %record.request_id, "recording persistence failure failed: {}", e2);
                    }
                }
                UpsertSummary::default()
            }
        }
    }
}
