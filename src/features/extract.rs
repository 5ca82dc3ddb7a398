//! Results-page classification and case-table extraction.
//!
//! Raw HTML stops here: callers get a [`PageSignal`] or typed
//! [`CaseRecord`]s, never DOM fragments.

use aho_corasick::{AhoCorasick, AhoCorasickBuilder};
use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use std::collections::HashSet;
use std::sync::OnceLock;

use crate::core::config::PortalSelectors;
use crate::core::types::{CaseRecord, SearchRequest};
use crate::core::{PortalError, PortalResult};

const CAPTCHA_REJECTION_PHRASES: &[&str] = &[
    "invalid captcha",
    "incorrect captcha",
    "wrong captcha",
    "captcha mismatch",
    "captcha code does not match",
    "captcha does not match",
    "invalid security code",
];

const NO_RESULTS_PHRASES: &[&str] = &[
    "record not found",
    "records not found",
    "no record found",
    "no records found",
    "no data found",
    "no matching record",
    "no cases found",
];

/// What the post-submit page is showing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageSignal {
    Rows,
    NoResults,
    CaptchaRejected,
    /// Still loading, or a layout we do not know.
    Unrecognised,
}

/// Records pulled from one results page.
#[derive(Debug, Clone)]
pub struct Extraction {
    pub records: Vec<CaseRecord>,
    /// Unique rows on the page before the cap was applied.
    pub total_rows: usize,
    pub truncated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Column {
    Serial,
    CaseNumber,
    Parties,
    Petitioner,
    Respondent,
    FilingDate,
    RegistrationDate,
    NextDate,
    Status,
    Stage,
    Ignored,
}

fn classify_header(text: &str) -> Column {
    let t = text.to_lowercase();
    let t = t.trim();
    if t.starts_with("sr") || t.starts_with("s.no") || t.starts_with("s. no") || t.contains("serial") {
        Column::Serial
    } else if t.contains("case") && (t.contains("no") || t.contains("number") || t.contains("type")) {
        Column::CaseNumber
    } else if (t.contains("petitioner") && t.contains("respondent")) || t.contains("party") {
        Column::Parties
    } else if t.contains("petitioner") || t.contains("appellant") {
        Column::Petitioner
    } else if t.contains("respondent") {
        Column::Respondent
    } else if t.contains("filing") {
        Column::FilingDate
    } else if t.contains("registration") {
        Column::RegistrationDate
    } else if t.contains("next") || t.contains("hearing") {
        Column::NextDate
    } else if t.contains("stage") {
        Column::Stage
    } else if t.contains("status") {
        Column::Status
    } else {
        Column::Ignored
    }
}

/// Column order used when the table carries no header row.
const POSITIONAL_COLUMNS: &[Column] = &[
    Column::CaseNumber,
    Column::Parties,
    Column::NextDate,
    Column::Status,
];

fn party_split_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\s+(?:vs\.?|versus|v/s\.?)\s+").expect("valid party split regex")
    })
}

fn date_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\b(\d{1,2}[-/.]\d{1,2}[-/.]\d{4}|\d{4}-\d{2}-\d{2})\b").expect("valid date regex")
    })
}

fn phrase_matcher(phrases: &[&str]) -> AhoCorasick {
    AhoCorasickBuilder::new()
        .ascii_case_insensitive(true)
        .build(phrases)
        .expect("valid phrase patterns")
}

/// Parse the portal's `DD-MM-YYYY` style dates; embedded dates
/// (`"Next Date: 12-03-2024"`) are found too.
pub fn parse_date(text: &str) -> Option<NaiveDate> {
    let m = date_regex().find(text)?;
    let s = m.as_str();
    ["%d-%m-%Y", "%d/%m/%Y", "%d.%m.%Y", "%Y-%m-%d"]
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(s, fmt).ok())
}

/// Split `"A Vs B"` into petitioner and respondent.
pub fn split_parties(text: &str) -> (String, String) {
    let mut parts = party_split_regex().splitn(text, 2);
    let petitioner = parts.next().map(collapse_ws).unwrap_or_default();
    let respondent = parts.next().map(collapse_ws).unwrap_or_default();
    (petitioner, respondent)
}

fn collapse_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn element_text(el: &ElementRef<'_>) -> String {
    collapse_ws(&el.text().collect::<Vec<_>>().join(" "))
}

fn parse_selector(css: &str) -> PortalResult<Selector> {
    Selector::parse(css).map_err(|e| PortalError::Parse(format!("bad selector '{}': {}", css, e)))
}

pub struct ResultExtractor {
    results_table: Selector,
    message_areas: Vec<Selector>,
    row: Selector,
    cell: Selector,
    header_cell: Selector,
    rejection: AhoCorasick,
    no_results: AhoCorasick,
}

impl ResultExtractor {
    pub fn new(selectors: &PortalSelectors) -> PortalResult<Self> {
        Ok(Self {
            results_table: parse_selector(&selectors.results_table)?,
            message_areas: vec![
                parse_selector(&selectors.captcha_error)?,
                parse_selector(&selectors.no_results)?,
            ],
            row: parse_selector("tr")?,
            cell: parse_selector("td")?,
            header_cell: parse_selector("th")?,
            rejection: phrase_matcher(CAPTCHA_REJECTION_PHRASES),
            no_results: phrase_matcher(NO_RESULTS_PHRASES),
        })
    }

    fn data_rows<'a>(&self, table: ElementRef<'a>) -> Vec<ElementRef<'a>> {
        table
            .select(&self.row)
            .filter(|tr| {
                let cells: Vec<_> = tr.select(&self.cell).collect();
                // Single-cell rows are colspan banners ("No record found").
                cells.len() >= 2 && cells.iter().any(|c| !element_text(c).is_empty())
            })
            .collect()
    }

    fn message_texts(&self, doc: &Html) -> Vec<String> {
        self.message_areas
            .iter()
            .flat_map(|sel| doc.select(sel).map(|el| element_text(&el)))
            .filter(|t| !t.is_empty())
            .collect()
    }

    /// Decide what a post-submit page is showing.
    ///
    /// Result rows win over a simultaneous "no records" banner.
    pub fn classify(&self, html: &str) -> PageSignal {
        let doc = Html::parse_document(html);

        let tables: Vec<_> = doc.select(&self.results_table).collect();
        if tables.iter().any(|t| !self.data_rows(*t).is_empty()) {
            return PageSignal::Rows;
        }

        let messages = self.message_texts(&doc);
        if messages.iter().any(|m| self.rejection.is_match(m)) {
            return PageSignal::CaptchaRejected;
        }
        if messages.iter().any(|m| self.no_results.is_match(m)) {
            return PageSignal::NoResults;
        }
        if let Some(table) = tables.first() {
            let text = element_text(table);
            if self.rejection.is_match(&text) {
                return PageSignal::CaptchaRejected;
            }
            // A rendered results table with nothing in it is an explicit empty answer.
            return PageSignal::NoResults;
        }

        PageSignal::Unrecognised
    }

    fn column_layout(&self, table: ElementRef<'_>) -> Vec<Column> {
        let header_row = table
            .select(&self.row)
            .find(|tr| tr.select(&self.header_cell).next().is_some());
        match header_row {
            Some(tr) => tr
                .select(&self.header_cell)
                .map(|th| classify_header(&element_text(&th)))
                .collect(),
            None => POSITIONAL_COLUMNS.to_vec(),
        }
    }

    /// Parse the results table into records for `request`, capped at
    /// `request.max_results`.
    pub fn extract(
        &self,
        html: &str,
        request: &SearchRequest,
        captcha_attempt: u32,
        extracted_at: DateTime<Utc>,
    ) -> PortalResult<Extraction> {
        let doc = Html::parse_document(html);
        let table = doc
            .select(&self.results_table)
            .find(|t| !self.data_rows(*t).is_empty())
            .or_else(|| doc.select(&self.results_table).next())
            .ok_or_else(|| PortalError::Parse("results table not found".into()))?;

        let layout = self.column_layout(table);
        if !layout.contains(&Column::CaseNumber) {
            return Err(PortalError::Parse(format!(
                "results table has no case-number column (layout: {:?})",
                layout
            )));
        }

        let mut seen = HashSet::new();
        let mut records = Vec::new();
        let mut total_rows = 0usize;

        for tr in self.data_rows(table) {
            let cells: Vec<String> = tr.select(&self.cell).map(|td| element_text(&td)).collect();
            let Some(record) = self.build_record(&layout, &cells, request, captcha_attempt, extracted_at) else {
                continue;
            };
            if !seen.insert(record.case_number.clone()) {
                continue;
            }
            total_rows += 1;
            if records.len() < request.max_results {
                records.push(record);
            }
        }

        Ok(Extraction {
            truncated: total_rows > records.len(),
            records,
            total_rows,
        })
    }

    fn build_record(
        &self,
        layout: &[Column],
        cells: &[String],
        request: &SearchRequest,
        captcha_attempt: u32,
        extracted_at: DateTime<Utc>,
    ) -> Option<CaseRecord> {
        let mut record = CaseRecord {
            case_number: String::new(),
            filing_date: None,
            registration_date: None,
            next_hearing_date: None,
            petitioner: String::new(),
            respondent: String::new(),
            status: String::new(),
            stage: None,
            court_id: request.court_id.clone(),
            bench_id: request.bench_id.clone(),
            request_id: request.id.clone(),
            captcha_attempt,
            extracted_at,
        };

        for (column, text) in layout.iter().zip(cells) {
            if text.is_empty() {
                continue;
            }
            match column {
                Column::CaseNumber => record.case_number = text.clone(),
                Column::Parties => {
                    let (p, r) = split_parties(text);
                    record.petitioner = p;
                    record.respondent = r;
                }
                Column::Petitioner => record.petitioner = text.clone(),
                Column::Respondent => record.respondent = text.clone(),
                Column::FilingDate => record.filing_date = parse_date(text),
                Column::RegistrationDate => record.registration_date = parse_date(text),
                Column::NextDate => record.next_hearing_date = parse_date(text),
                Column::Status => record.status = text.clone(),
                Column::Stage => record.stage = Some(text.clone()),
                Column::Serial | Column::Ignored => {}
            }
        }

        if record.case_number.is_empty() {
            return None;
        }
        if record.status.is_empty() {
            record.status = "unknown".to_string();
        }
        Some(record)
    }
}
