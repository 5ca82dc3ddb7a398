use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

// ── Topology ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HighCourt {
    /// Dropdown option value on the portal (e.g. `"26"` for Delhi).
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Bench {
    pub id: String,
    /// Parent court, by identifier only.
    pub court_id: String,
    pub name: String,
}

// ── Search requests ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchType {
    PartyName,
    CaseNumber,
}

impl SearchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchType::PartyName => "party_name",
            SearchType::CaseNumber => "case_number",
        }
    }
}

/// Pending/disposed filter offered by the party-name form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaseStatusFilter {
    Pending,
    Disposed,
    #[default]
    Both,
}

impl CaseStatusFilter {
    /// Value of the matching radio button on the portal form.
    pub fn form_value(&self) -> &'static str {
        match self {
            CaseStatusFilter::Pending => "Pending",
            CaseStatusFilter::Disposed => "Disposed",
            CaseStatusFilter::Both => "Both",
        }
    }
}

impl std::str::FromStr for CaseStatusFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(CaseStatusFilter::Pending),
            "disposed" => Ok(CaseStatusFilter::Disposed),
            "both" => Ok(CaseStatusFilter::Both),
            other => Err(format!("unknown case status filter '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SearchQuery {
    PartyName {
        name: String,
        #[serde(default)]
        year: Option<u16>,
        #[serde(default)]
        status: CaseStatusFilter,
    },
    CaseNumber {
        case_type: String,
        number: String,
        year: u16,
    },
}

impl SearchQuery {
    /// Human-readable form used in logs and the outcome table.
    pub fn describe(&self) -> String {
        match self {
            SearchQuery::PartyName { name, year, .. } => match year {
                Some(y) => format!("{} ({})", name.trim(), y),
                None => name.trim().to_string(),
            },
            SearchQuery::CaseNumber {
                case_type,
                number,
                year,
            } => {
                let case_type = case_type.trim();
                if case_type.is_empty() {
                    format!("{}/{}", number.trim(), year)
                } else {
                    format!("{} {}/{}", case_type, number.trim(), year)
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchRequest {
    pub id: String,
    pub court_id: String,
    pub bench_id: String,
    pub query: SearchQuery,
    pub max_results: usize,
}

impl SearchRequest {
    pub fn new(
        court_id: impl Into<String>,
        bench_id: impl Into<String>,
        query: SearchQuery,
        max_results: usize,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            court_id: court_id.into(),
            bench_id: bench_id.into(),
            query,
            max_results,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn search_type(&self) -> SearchType {
        match self.query {
            SearchQuery::PartyName { .. } => SearchType::PartyName,
            SearchQuery::CaseNumber { .. } => SearchType::CaseNumber,
        }
    }
}

/// Queue-file shape of a request. `id` and `max_results` are optional and
/// resolved against the run configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SearchRequestSpec {
    #[serde(default)]
    pub id: Option<String>,
    pub court_id: String,
    pub bench_id: String,
    pub query: SearchQuery,
    #[serde(default)]
    pub max_results: Option<usize>,
}

impl SearchRequestSpec {
    pub fn into_request(self, default_max_results: usize) -> SearchRequest {
        let req = SearchRequest::new(
            self.court_id,
            self.bench_id,
            self.query,
            self.max_results.unwrap_or(default_max_results),
        );
        match self.id {
            Some(id) if !id.trim().is_empty() => req.with_id(id.trim()),
            _ => req,
        }
    }
}

// ── CAPTCHA ──────────────────────────────────────────────────────────────────

/// One rendered challenge. Discarded after a single solve attempt.
#[derive(Clone)]
pub struct CaptchaChallenge {
    pub image: Vec<u8>,
    /// 1-based, monotonically increasing within one request.
    pub attempt: u32,
}

impl std::fmt::Debug for CaptchaChallenge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptchaChallenge")
            .field("image_bytes", &self.image.len())
            .field("attempt", &self.attempt)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CaptchaAnswer {
    pub text: String,
    /// 0.0 ..= 1.0. Zero means the answer is a placeholder.
    pub confidence: f32,
}

// ── Records ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseRecord {
    pub case_number: String,
    pub filing_date: Option<NaiveDate>,
    pub registration_date: Option<NaiveDate>,
    pub next_hearing_date: Option<NaiveDate>,
    pub petitioner: String,
    pub respondent: String,
    pub status: String,
    pub stage: Option<String>,
    pub court_id: String,
    pub bench_id: String,
    pub request_id: String,
    /// CAPTCHA attempt whose submission produced this record.
    pub captcha_attempt: u32,
    pub extracted_at: DateTime<Utc>,
}

impl CaseRecord {
    pub fn natural_key(&self) -> (&str, &str, &str) {
        (&self.case_number, &self.court_id, &self.bench_id)
    }
}

// ── Outcomes ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Navigation,
    FormValidation,
    Timeout,
    Parse,
    PortalUnavailable,
    SessionUnavailable,
    Persistence,
    Cancelled,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Navigation => "navigation",
            FailureKind::FormValidation => "form_validation",
            FailureKind::Timeout => "timeout",
            FailureKind::Parse => "parse",
            FailureKind::PortalUnavailable => "portal_unavailable",
            FailureKind::SessionUnavailable => "session_unavailable",
            FailureKind::Persistence => "persistence",
            FailureKind::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReason {
    pub kind: FailureKind,
    pub message: String,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    Success { records: usize, truncated: bool },
    NoResults,
    Failed { reason: FailureReason },
    ExhaustedRetries { attempts: u32 },
}

impl RunOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            RunOutcome::Success { .. } => "success",
            RunOutcome::NoResults => "no_results",
            RunOutcome::Failed { .. } => "failed",
            RunOutcome::ExhaustedRetries { .. } => "exhausted_retries",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Success { .. })
    }

    pub fn result_count(&self) -> usize {
        match self {
            RunOutcome::Success { records, .. } => *records,
            _ => 0,
        }
    }
}

/// Persisted form of one request's terminal outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutcomeRecord {
    pub run_id: String,
    pub request_id: String,
    pub court_id: String,
    pub bench_id: String,
    pub search_type: SearchType,
    pub query: String,
    pub outcome: RunOutcome,
    pub captcha_attempts: u32,
    pub pipeline_attempts: u32,
    pub topology_refreshes: u32,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpsertSummary {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreStats {
    pub total_searches: u64,
    pub successful_searches: u64,
    pub failed_searches: u64,
    pub total_results: u64,
    pub recent_searches: u64,
    pub success_rate: f64,
    pub total_cases: u64,
}
