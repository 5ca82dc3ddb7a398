#![allow(dead_code)]

//! Scripted in-memory portal used by the integration tests.
//!
//! Behaves like the eCourts Case Status form at the level the orchestrator
//! sees it: court and bench dropdowns, a CAPTCHA image, and a submit button
//! whose responses are queued by the test.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hc_case_scout::core::config::PortalSelectors;
use hc_case_scout::core::types::{CaseStatusFilter, SearchQuery, SearchRequest};
use hc_case_scout::core::{PortalConfig, PortalError, PortalResult};
use hc_case_scout::features::captcha::{CaptchaResolver, PlaceholderSolver};
use hc_case_scout::features::extract::ResultExtractor;
use hc_case_scout::features::orchestrator::{RetryPolicies, RetryPolicy, SearchOrchestrator};
use hc_case_scout::features::topology::Topology;
use hc_case_scout::scraping::{PortalDriver, PortalSession, SelectOption, SessionFactory};

pub const PNG: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0];

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// What the portal does when the search button is pressed.
#[derive(Debug, Clone)]
pub enum Response {
    Rejected,
    Rows(Vec<Row>),
    NoRecords,
    /// Page never changes.
    Silent,
    /// Arbitrary markup, e.g. a redesigned results page.
    Html(&'static str),
}

#[derive(Debug, Clone)]
pub struct Row {
    pub case_number: &'static str,
    pub parties: &'static str,
    pub next_date: &'static str,
    pub status: &'static str,
}

pub fn row(case_number: &'static str, status: &'static str) -> Row {
    Row {
        case_number,
        parties: "A Kumar vs State of Delhi",
        next_date: "12-03-2024",
        status,
    }
}

#[derive(Default)]
pub struct World {
    pub courts: Vec<(String, String)>,
    pub benches: HashMap<String, Vec<(String, String)>>,
    /// `(court, bench id, bench name)` that only shows up once the bench
    /// dropdown has been listed `reveal_after` times.
    pub late_bench: Option<(String, String, String)>,
    pub reveal_after: u32,
    pub bench_listings: u32,
    pub responses: VecDeque<Response>,
    pub navigate_failures: u32,
    pub validation_message: Option<String>,
    pub fail_open: bool,

    pub navigations: u32,
    pub submits: u32,
    pub opened: u32,
    pub released: u32,
}

pub type SharedWorld = Arc<Mutex<World>>;

impl World {
    /// One court `C1` with benches `B1` and `B2`.
    pub fn standard() -> SharedWorld {
        let mut w = World::default();
        w.courts = vec![
            ("C1".into(), "High Court of Delhi".into()),
            ("C2".into(), "Bombay High Court".into()),
        ];
        w.benches.insert(
            "C1".into(),
            vec![("B1".into(), "Principal Bench".into()), ("B2".into(), "Circuit Bench".into())],
        );
        w.benches.insert("C2".into(), vec![("B1".into(), "Principal Seat".into())]);
        Arc::new(Mutex::new(w))
    }

    fn bench_list(&self, court: &str) -> Vec<(String, String)> {
        let mut list = self.benches.get(court).cloned().unwrap_or_default();
        if let Some((c, id, name)) = &self.late_bench {
            if c == court && self.bench_listings >= self.reveal_after {
                list.push((id.clone(), name.clone()));
            }
        }
        list
    }
}

pub fn script(world: &SharedWorld, responses: Vec<Response>) {
    world.lock().unwrap().responses = responses.into();
}

enum Page {
    Blank,
    Form { error: Option<String> },
    Html(String),
}

pub struct FakePortal {
    world: SharedWorld,
    sel: PortalSelectors,
    page: Page,
    court: Option<String>,
    nonce: u32,
}

impl FakePortal {
    pub fn new(world: SharedWorld) -> Self {
        Self {
            world,
            sel: PortalSelectors::default(),
            page: Page::Blank,
            court: None,
            nonce: 0,
        }
    }

    fn results_html(rows: &[Row]) -> String {
        let mut body = String::from(
            "<tr><th>Sr No</th><th>Case Number</th><th>Petitioner vs Respondent</th>\
             <th>Next Date</th><th>Status</th></tr>",
        );
        for (i, r) in rows.iter().enumerate() {
            body.push_str(&format!(
                "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>",
                i + 1,
                r.case_number,
                r.parties,
                r.next_date,
                r.status
            ));
        }
        format!("<html><body><div id=\"showList\"><table>{}</table></div></body></html>", body)
    }

    fn submit(&mut self) {
        let response = {
            let mut w = self.world.lock().unwrap();
            w.submits += 1;
            w.responses.pop_front().unwrap_or(Response::NoRecords)
        };
        match response {
            Response::Rejected => {
                self.nonce += 1;
                self.page = Page::Form {
                    error: Some("Invalid Captcha".into()),
                };
            }
            Response::Rows(rows) => self.page = Page::Html(Self::results_html(&rows)),
            Response::NoRecords => {
                self.page = Page::Html(
                    "<html><body><div id=\"showList\"><span class=\"norecord\">Record Not Found</span></div></body></html>"
                        .into(),
                )
            }
            Response::Silent => {}
            Response::Html(html) => self.page = Page::Html(html.to_string()),
        }
    }

    fn timeout(what: &str) -> PortalError {
        PortalError::timeout(what, 1)
    }
}

#[async_trait]
impl PortalDriver for FakePortal {
    async fn navigate(&mut self, _url: &str, _timeout: Duration) -> PortalResult<()> {
        let mut w = self.world.lock().unwrap();
        w.navigations += 1;
        if w.navigate_failures > 0 {
            w.navigate_failures -= 1;
            return Err(Self::timeout("page load"));
        }
        self.page = Page::Form { error: None };
        self.court = None;
        Ok(())
    }

    async fn select(&mut self, selector: &str, value: &str) -> PortalResult<()> {
        let w = self.world.lock().unwrap();
        if selector == self.sel.court_select {
            if w.courts.iter().any(|(id, _)| id == value) {
                self.court = Some(value.to_string());
                return Ok(());
            }
            return Err(PortalError::Navigation(format!("option '{}' not offered", value)));
        }
        if selector == self.sel.bench_select {
            let court = self.court.clone().unwrap_or_default();
            if w.bench_list(&court).iter().any(|(id, _)| id == value) {
                return Ok(());
            }
            return Err(PortalError::Navigation(format!("option '{}' not offered", value)));
        }
        Ok(())
    }

    async fn fill(&mut self, _selector: &str, _text: &str) -> PortalResult<()> {
        match self.page {
            Page::Form { .. } => Ok(()),
            _ => Err(PortalError::Navigation("no form on page".into())),
        }
    }

    async fn click(&mut self, selector: &str) -> PortalResult<()> {
        if selector == self.sel.submit_button {
            self.submit();
        }
        Ok(())
    }

    async fn wait_for(&mut self, selector: &str, _timeout: Duration) -> PortalResult<()> {
        if self.sel.popup_buttons.iter().any(|s| s == selector) {
            return Err(Self::timeout(selector));
        }
        if selector == format!("{} option:nth-child(2)", self.sel.bench_select) {
            let w = self.world.lock().unwrap();
            let court = self.court.clone().unwrap_or_default();
            return if w.bench_list(&court).is_empty() {
                Err(Self::timeout(selector))
            } else {
                Ok(())
            };
        }
        match self.page {
            Page::Blank => Err(Self::timeout(selector)),
            _ => Ok(()),
        }
    }

    async fn read(&mut self, selector: &str) -> PortalResult<Option<String>> {
        if selector == self.sel.validation_message {
            return Ok(self.world.lock().unwrap().validation_message.clone());
        }
        Ok(None)
    }

    async fn options(&mut self, selector: &str) -> PortalResult<Vec<SelectOption>> {
        let mut w = self.world.lock().unwrap();
        let opt = |value: &str, text: &str| SelectOption {
            value: value.into(),
            text: text.into(),
        };
        if selector == self.sel.court_select {
            let mut out = vec![opt("0", "Select High Court")];
            out.extend(w.courts.iter().map(|(id, name)| opt(id, name)));
            return Ok(out);
        }
        if selector == self.sel.bench_select {
            let court = self.court.clone().unwrap_or_default();
            let mut out = vec![opt("0", "Select Bench")];
            out.extend(w.bench_list(&court).iter().map(|(id, name)| opt(id, name)));
            w.bench_listings += 1;
            return Ok(out);
        }
        Ok(Vec::new())
    }

    async fn content(&mut self) -> PortalResult<String> {
        Ok(match &self.page {
            Page::Blank => "<html><body></body></html>".to_string(),
            Page::Form { error } => format!(
                "<html><body><form><select id=\"sess_state_code\"></select>\
                 <img id=\"captcha_image\" src=\"securimage_show.php?{}\">\
                 <span id=\"errSpan\">{}</span></form></body></html>",
                self.nonce,
                error.clone().unwrap_or_default()
            ),
            Page::Html(html) => html.clone(),
        })
    }

    async fn capture(&mut self, _selector: &str) -> PortalResult<Vec<u8>> {
        Ok(PNG.to_vec())
    }

    async fn screenshot(&mut self) -> PortalResult<Vec<u8>> {
        Ok(PNG.to_vec())
    }

    async fn press_escape(&mut self) -> PortalResult<()> {
        Ok(())
    }
}

#[async_trait]
impl PortalSession for FakePortal {
    fn driver(&mut self) -> &mut dyn PortalDriver {
        self
    }

    async fn release(self: Box<Self>) {
        self.world.lock().unwrap().released += 1;
    }
}

pub struct FakeSessions {
    pub world: SharedWorld,
}

#[async_trait]
impl SessionFactory for FakeSessions {
    async fn open(&self) -> PortalResult<Box<dyn PortalSession>> {
        {
            let mut w = self.world.lock().unwrap();
            if w.fail_open {
                return Err(PortalError::Session("browser failed to launch".into()));
            }
            w.opened += 1;
        }
        Ok(Box::new(FakePortal::new(Arc::clone(&self.world))))
    }
}

// ── Builders ─────────────────────────────────────────────────────────────────

pub fn test_config(captcha_max_attempts: u32) -> Arc<PortalConfig> {
    Arc::new(PortalConfig {
        captcha_max_attempts,
        pipeline_max_attempts: 3,
        element_timeout_ms: 300,
        navigation_timeout_ms: 300,
        captcha_render_timeout_ms: 300,
        ..Default::default()
    })
}

pub struct Harness {
    pub cfg: Arc<PortalConfig>,
    pub topology: Arc<Topology>,
    pub orchestrator: Arc<SearchOrchestrator>,
}

pub fn harness(cfg: Arc<PortalConfig>) -> Harness {
    let topology = Arc::new(Topology::new(Arc::clone(&cfg)));
    let extractor = Arc::new(ResultExtractor::new(&cfg.selectors).unwrap());
    let resolver = CaptchaResolver::new(Arc::new(PlaceholderSolver), Duration::from_secs(1));
    let policies = RetryPolicies {
        pipeline: RetryPolicy {
            max_attempts: cfg.pipeline_max_attempts,
            initial_interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(5),
        },
        ..RetryPolicies::from_config(&cfg)
    };
    let orchestrator = Arc::new(
        SearchOrchestrator::new(Arc::clone(&cfg), Arc::clone(&topology), resolver, extractor)
            .with_policies(policies),
    );
    Harness {
        cfg,
        topology,
        orchestrator,
    }
}

pub fn case_number_request(court: &str, bench: &str, number: &str, year: u16) -> SearchRequest {
    SearchRequest::new(
        court,
        bench,
        SearchQuery::CaseNumber {
            case_type: "WP(C)".into(),
            number: number.into(),
            year,
        },
        20,
    )
}

pub fn party_request(court: &str, bench: &str, name: &str) -> SearchRequest {
    SearchRequest::new(
        court,
        bench,
        SearchQuery::PartyName {
            name: name.into(),
            year: Some(2021),
            status: CaseStatusFilter::Pending,
        },
        20,
    )
}
