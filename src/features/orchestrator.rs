//! Search orchestrator: drives one request through the portal form.
//!
//! ```text
//! Init → CourtSelected → BenchSelected → FormFilled → CaptchaPending → Submitted
//!                                                        ↑   (rejected)  │
//!                                                        └───────────────┤
//!                                           ResultsReady | NoResults | Error
//! ```
//!
//! Three retry budgets, each independent:
//! * topology refresh: a court/bench missing from the topology or the live
//!   dropdown triggers at most one refresh per request;
//! * CAPTCHA attempts: capped per request, monotonic across restarts;
//! * whole pipeline: navigation timeouts restart from `Init` with
//!   exponential backoff.

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use backoff::ExponentialBackoffBuilder;
use chrono::Utc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::captcha::CaptchaResolver;
use super::extract::{Extraction, PageSignal, ResultExtractor};
use super::navigation;
use super::topology::Topology;
use crate::core::types::{CaptchaChallenge, CaseRecord, RunOutcome, SearchQuery, SearchRequest};
use crate::core::{PortalConfig, PortalError, PortalResult};
use crate::scraping::PortalDriver;

const SIGNAL_POLL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchState {
    Init,
    CourtSelected,
    BenchSelected,
    FormFilled,
    CaptchaPending,
    Submitted,
    ResultsReady,
    NoResults,
    Error,
}

impl SearchState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SearchState::ResultsReady | SearchState::NoResults | SearchState::Error)
    }
}

// ── Retry policies ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_interval: Duration,
    pub max_interval: Duration,
}

impl RetryPolicy {
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_interval: Duration::ZERO,
            max_interval: Duration::ZERO,
        }
    }

    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_interval)
            .with_max_interval(self.max_interval)
            .with_max_elapsed_time(None)
            .build()
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicies {
    /// Topology refreshes allowed per request.
    pub topology_refresh: RetryPolicy,
    /// CAPTCHA submissions allowed per request.
    pub captcha: RetryPolicy,
    /// Whole-pipeline runs allowed per request (first run included).
    pub pipeline: RetryPolicy,
}

impl RetryPolicies {
    pub fn from_config(cfg: &PortalConfig) -> Self {
        Self {
            topology_refresh: RetryPolicy::immediate(1),
            captcha: RetryPolicy::immediate(cfg.captcha_max_attempts),
            pipeline: RetryPolicy {
                max_attempts: cfg.pipeline_max_attempts,
                initial_interval: Duration::from_millis(500),
                max_interval: Duration::from_secs(5),
            },
        }
    }
}

// ── Reports ──────────────────────────────────────────────────────────────────

/// Everything one orchestrated request produced.
#[derive(Debug, Clone)]
pub struct SearchReport {
    pub request_id: String,
    pub outcome: RunOutcome,
    pub records: Vec<CaseRecord>,
    pub final_state: SearchState,
    pub captcha_attempts: u32,
    pub pipeline_attempts: u32,
    pub topology_refreshes: u32,
}

enum Terminal {
    Results(Extraction),
    NoResults,
}

/// Attempt counters of one search, readable while it is still running.
#[derive(Debug, Default)]
pub struct SearchProgress {
    captcha_attempts: AtomicU32,
    pipeline_attempts: AtomicU32,
    topology_refreshes: AtomicU32,
}

impl SearchProgress {
    pub fn captcha_attempts(&self) -> u32 {
        self.captcha_attempts.load(Ordering::Acquire)
    }

    pub fn pipeline_attempts(&self) -> u32 {
        self.pipeline_attempts.load(Ordering::Acquire)
    }

    pub fn topology_refreshes(&self) -> u32 {
        self.topology_refreshes.load(Ordering::Acquire)
    }

    fn bump(counter: &AtomicU32) -> u32 {
        counter.fetch_add(1, Ordering::AcqRel) + 1
    }
}

struct RunContext<'a> {
    request: &'a SearchRequest,
    state: SearchState,
    progress: &'a SearchProgress,
}

impl RunContext<'_> {
    fn enter(&mut self, next: SearchState) {
        debug!(request = %self.request.id, from = ?self.state, to = ?next, "search state");
        self.state = next;
    }
}

// ── Local validation ─────────────────────────────────────────────────────────

fn validate_year(year: u16) -> PortalResult<()> {
    let max = chrono::Datelike::year(&Utc::now()) as u16 + 1;
    if (1900..=max).contains(&year) {
        Ok(())
    } else {
        Err(PortalError::FormValidation(format!("year {} out of range", year)))
    }
}

/// Checks the portal would reject client-side anyway.
pub fn validate_request(request: &SearchRequest) -> PortalResult<()> {
    if request.court_id.trim().is_empty() || request.bench_id.trim().is_empty() {
        return Err(PortalError::FormValidation("court and bench are required".into()));
    }
    if request.max_results == 0 {
        return Err(PortalError::FormValidation("max_results must be positive".into()));
    }
    match &request.query {
        SearchQuery::PartyName { name, year, .. } => {
            if name.trim().chars().count() < 3 {
                return Err(PortalError::FormValidation(
                    "party name needs at least 3 characters".into(),
                ));
            }
            if let Some(y) = year {
                validate_year(*y)?;
            }
        }
        SearchQuery::CaseNumber { number, year, .. } => {
            let number = number.trim();
            if number.is_empty() || !number.chars().all(|c| c.is_ascii_digit()) {
                return Err(PortalError::FormValidation(format!(
                    "case number '{}' must be numeric",
                    number
                )));
            }
            validate_year(*year)?;
        }
    }
    Ok(())
}

// ── Orchestrator ─────────────────────────────────────────────────────────────

pub struct SearchOrchestrator {
    cfg: Arc<PortalConfig>,
    topology: Arc<Topology>,
    resolver: CaptchaResolver,
    extractor: Arc<ResultExtractor>,
    policies: RetryPolicies,
}

impl SearchOrchestrator {
    pub fn new(
        cfg: Arc<PortalConfig>,
        topology: Arc<Topology>,
        resolver: CaptchaResolver,
        extractor: Arc<ResultExtractor>,
    ) -> Self {
        let policies = RetryPolicies::from_config(&cfg);
        Self {
            cfg,
            topology,
            resolver,
            extractor,
            policies,
        }
    }

    pub fn with_policies(mut self, policies: RetryPolicies) -> Self {
        self.policies = policies;
        self
    }

    pub fn policies(&self) -> &RetryPolicies {
        &self.policies
    }

    /// Drive `request` to a terminal state. Never fails: every error becomes
    /// the report's outcome.
    pub async fn run(&self, portal: &mut dyn PortalDriver, request: &SearchRequest) -> SearchReport {
        self.run_tracked(portal, request, &SearchProgress::default()).await
    }

    /// Like [`run`](Self::run), publishing attempt counts to `progress` as
    /// they happen so a caller that abandons the future still has them.
    pub async fn run_tracked(
        &self,
        portal: &mut dyn PortalDriver,
        request: &SearchRequest,
        progress: &SearchProgress,
    ) -> SearchReport {
        let mut ctx = RunContext {
            request,
            state: SearchState::Init,
            progress,
        };
        let mut backoff = self.policies.pipeline.backoff();

        info!(
            request = %request.id,
            court = %request.court_id,
            bench = %request.bench_id,
            search_type = request.search_type().as_str(),
            "search: {}",
            request.query.describe()
        );

        let result = loop {
            let pipeline_attempt = SearchProgress::bump(&progress.pipeline_attempts);
            ctx.enter(SearchState::Init);
            match self.run_pipeline(portal, &mut ctx).await {
                Err(e) if e.is_transient() && pipeline_attempt < self.policies.pipeline.max_attempts => {
                    let delay = backoff
                        .next_backoff()
                        .unwrap_or(self.policies.pipeline.max_interval);
                    warn!(
                        request = %request.id,
                        attempt = pipeline_attempt,
                        "search: {}; restarting pipeline in {:?}",
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                other => break other,
            }
        };

        let (outcome, records) = match result {
            Ok(Terminal::Results(extraction)) => {
                ctx.enter(SearchState::ResultsReady);
                if extraction.truncated {
                    warn!(
                        request = %request.id,
                        kept = extraction.records.len(),
                        total = extraction.total_rows,
                        "search: results truncated to max_results"
                    );
                }
                (
                    RunOutcome::Success {
                        records: extraction.records.len(),
                        truncated: extraction.truncated,
                    },
                    extraction.records,
                )
            }
            Ok(Terminal::NoResults) => {
                ctx.enter(SearchState::NoResults);
                (RunOutcome::NoResults, Vec::new())
            }
            Err(PortalError::ExhaustedRetries { attempts }) => {
                ctx.enter(SearchState::Error);
                warn!(request = %request.id, attempts, "search: captcha attempts exhausted");
                (RunOutcome::ExhaustedRetries { attempts }, Vec::new())
            }
            Err(e) => {
                ctx.enter(SearchState::Error);
                warn!(request = %request.id, "search failed: {}", e);
                (RunOutcome::Failed { reason: e.failure_reason() }, Vec::new())
            }
        };

        info!(
            request = %request.id,
            outcome = outcome.label(),
            records = records.len(),
            captcha_attempts = progress.captcha_attempts(),
            pipeline_attempts = progress.pipeline_attempts(),
            "search finished"
        );

        SearchReport {
            request_id: request.id.clone(),
            outcome,
            records,
            final_state: ctx.state,
            captcha_attempts: progress.captcha_attempts(),
            pipeline_attempts: progress.pipeline_attempts(),
            topology_refreshes: progress.topology_refreshes(),
        }
    }

    async fn run_pipeline(&self, portal: &mut dyn PortalDriver, ctx: &mut RunContext<'_>) -> PortalResult<Terminal> {
        let request = ctx.request;
        validate_request(request)?;
        self.ensure_in_topology(portal, ctx).await?;

        navigation::open_search_form(portal, &self.cfg).await?;
        self.select_court(portal, ctx).await?;
        ctx.enter(SearchState::CourtSelected);

        self.select_bench(portal, ctx).await?;
        ctx.enter(SearchState::BenchSelected);

        self.fill_form(portal, request).await?;
        ctx.enter(SearchState::FormFilled);

        self.captcha_loop(portal, ctx).await
    }

    /// Spend the request's single topology refresh, or fail with `reason`.
    async fn refresh_topology(
        &self,
        portal: &mut dyn PortalDriver,
        ctx: &mut RunContext<'_>,
        seen_generation: u64,
        reason: String,
    ) -> PortalResult<()> {
        if ctx.progress.topology_refreshes() >= self.policies.topology_refresh.max_attempts {
            return Err(PortalError::Navigation(reason));
        }
        SearchProgress::bump(&ctx.progress.topology_refreshes);
        info!(request = %ctx.request.id, "search: {}; refreshing topology", reason);
        self.topology
            .refresh(portal, &ctx.request.court_id, seen_generation)
            .await?;
        Ok(())
    }

    async fn ensure_in_topology(&self, portal: &mut dyn PortalDriver, ctx: &mut RunContext<'_>) -> PortalResult<()> {
        let (court, bench) = (&ctx.request.court_id, &ctx.request.bench_id);
        let seen = self.topology.generation();
        if self.topology.has_bench(portal, court, bench).await? {
            return Ok(());
        }
        let reason = format!("bench {} not listed for court {}", bench, court);
        self.refresh_topology(portal, ctx, seen, reason.clone()).await?;
        if self.topology.has_bench(portal, court, bench).await? {
            Ok(())
        } else {
            Err(PortalError::Navigation(reason))
        }
    }

    async fn select_court(&self, portal: &mut dyn PortalDriver, ctx: &mut RunContext<'_>) -> PortalResult<()> {
        let seen = self.topology.generation();
        match navigation::select_court(portal, &self.cfg, &ctx.request.court_id).await {
            Err(PortalError::Navigation(msg)) => {
                self.refresh_topology(portal, ctx, seen, msg).await?;
                navigation::open_search_form(portal, &self.cfg).await?;
                navigation::select_court(portal, &self.cfg, &ctx.request.court_id).await
            }
            other => other,
        }
    }

    async fn select_bench(&self, portal: &mut dyn PortalDriver, ctx: &mut RunContext<'_>) -> PortalResult<()> {
        let seen = self.topology.generation();
        let bench_select = &self.cfg.selectors.bench_select;
        match portal.select(bench_select, &ctx.request.bench_id).await {
            Err(PortalError::Navigation(msg)) => {
                self.refresh_topology(portal, ctx, seen, msg).await?;
                navigation::open_search_form(portal, &self.cfg).await?;
                navigation::select_court(portal, &self.cfg, &ctx.request.court_id).await?;
                portal.select(bench_select, &ctx.request.bench_id).await
            }
            other => other,
        }
    }

    async fn fill_form(&self, portal: &mut dyn PortalDriver, request: &SearchRequest) -> PortalResult<()> {
        let sel = &self.cfg.selectors;
        let wait = self.cfg.element_timeout();

        match &request.query {
            SearchQuery::PartyName { name, year, status } => {
                portal.click(&sel.party_name_tab).await?;
                portal.wait_for(&sel.party_name_input, wait).await?;
                portal.fill(&sel.party_name_input, name.trim()).await?;
                if let Some(y) = year {
                    portal.fill(&sel.party_year_input, &y.to_string()).await?;
                }
                let radio = sel.party_status_radio.replace("{}", status.form_value());
                if let Err(e) = portal.click(&radio).await {
                    debug!("status filter radio not clickable ({}); portal default applies", e);
                }
            }
            SearchQuery::CaseNumber {
                case_type,
                number,
                year,
            } => {
                portal.click(&sel.case_number_tab).await?;
                portal.wait_for(&sel.case_number_input, wait).await?;
                let case_type = case_type.trim();
                if !case_type.is_empty() {
                    portal
                        .select(&sel.case_type_select, case_type)
                        .await
                        .map_err(|e| match e {
                            PortalError::Navigation(_) => PortalError::FormValidation(format!(
                                "case type '{}' is not offered by this bench",
                                case_type
                            )),
                            other => other,
                        })?;
                }
                portal.fill(&sel.case_number_input, number.trim()).await?;
                portal.fill(&sel.case_year_input, &year.to_string()).await?;
            }
        }

        if let Some(msg) = portal.read(&sel.validation_message).await? {
            if !msg.is_empty() {
                return Err(PortalError::FormValidation(msg));
            }
        }
        Ok(())
    }

    async fn captcha_loop(&self, portal: &mut dyn PortalDriver, ctx: &mut RunContext<'_>) -> PortalResult<Terminal> {
        let sel = &self.cfg.selectors;
        let max = self.policies.captcha.max_attempts;

        loop {
            let spent = ctx.progress.captcha_attempts();
            if spent >= max {
                return Err(PortalError::ExhaustedRetries { attempts: spent });
            }

            portal
                .wait_for(&sel.captcha_image, self.cfg.captcha_render_timeout())
                .await?;
            let attempt = SearchProgress::bump(&ctx.progress.captcha_attempts);
            let challenge = CaptchaChallenge {
                image: portal.capture(&sel.captcha_image).await?,
                attempt,
            };
            ctx.enter(SearchState::CaptchaPending);

            let answer = self.resolver.solve(&challenge).await;
            drop(challenge);

            let before = portal.content().await?;
            portal.fill(&sel.captcha_input, &answer.text).await?;
            portal.click(&sel.submit_button).await?;
            ctx.enter(SearchState::Submitted);

            let (signal, html) = self.await_signal(portal, &before).await?;
            match signal {
                PageSignal::Rows => {
                    let extraction = self
                        .extractor
                        .extract(&html, ctx.request, attempt, Utc::now())?;
                    if extraction.records.is_empty() {
                        return Err(PortalError::Parse("result rows carried no case numbers".into()));
                    }
                    return Ok(Terminal::Results(extraction));
                }
                PageSignal::NoResults => return Ok(Terminal::NoResults),
                PageSignal::CaptchaRejected => {
                    warn!(
                        request = %ctx.request.id,
                        max,
                        confidence = answer.confidence,
                        "search: {}",
                        PortalError::CaptchaRejected { attempt }
                    );
                    if attempt >= max {
                        return Err(PortalError::ExhaustedRetries { attempts: attempt });
                    }
                    if let Err(e) = portal.click(&sel.captcha_refresh).await {
                        debug!("captcha refresh link unavailable ({}); waiting for re-render", e);
                    }
                }
                PageSignal::Unrecognised => {
                    return Err(PortalError::Parse("unrecognised response page".into()));
                }
            }
        }
    }

    /// Poll until the page differs from `before` and shows a known signal.
    ///
    /// A page that changed but never settled into a known layout comes back
    /// as `Unrecognised`; only a page that never changed is a timeout.
    async fn await_signal(&self, portal: &mut dyn PortalDriver, before: &str) -> PortalResult<(PageSignal, String)> {
        let timeout = self.cfg.element_timeout();
        let start = Instant::now();
        let mut changed: Option<String> = None;
        loop {
            let html = portal.content().await?;
            if html != before {
                let signal = self.extractor.classify(&html);
                if signal != PageSignal::Unrecognised {
                    return Ok((signal, html));
                }
                changed = Some(html);
            }
            if start.elapsed() >= timeout {
                return match changed {
                    Some(html) => Ok((PageSignal::Unrecognised, html)),
                    None => Err(PortalError::timeout("search response", timeout.as_millis() as u64)),
                };
            }
            tokio::time::sleep(SIGNAL_POLL).await;
        }
    }
}
