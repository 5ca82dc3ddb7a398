use std::path::{Path, PathBuf};
use std::time::Duration;

// ---------------------------------------------------------------------------
// ScoutConfig: file-based config loader (case-scout.json) with env-var fallback
// ---------------------------------------------------------------------------

pub const DEFAULT_BASE_URL: &str = "https://hcservices.ecourts.gov.in/hcservices/main.php";

pub const ENV_CONFIG_PATH: &str = "CASE_SCOUT_CONFIG";
pub const ENV_CHROME_EXECUTABLE: &str = "CHROME_EXECUTABLE";

/// CSS selectors for every portal element the pipeline touches.
///
/// Defaults match the eCourts High Court services markup. Any field left out
/// of `case-scout.json` keeps its default.
#[derive(serde::Deserialize, Clone, Debug)]
#[serde(default)]
pub struct PortalSelectors {
    /// Link/tab candidates that open the Case Status section, tried in order.
    pub case_status_links: Vec<String>,
    /// Start-up modal dismiss buttons, tried in order.
    pub popup_buttons: Vec<String>,
    pub court_select: String,
    pub bench_select: String,
    pub party_name_tab: String,
    pub case_number_tab: String,
    pub party_name_input: String,
    pub party_year_input: String,
    /// Radio button for the pending/disposed/both filter; `{}` is replaced by the value.
    pub party_status_radio: String,
    pub case_type_select: String,
    pub case_number_input: String,
    pub case_year_input: String,
    pub captcha_image: String,
    pub captcha_input: String,
    pub captcha_refresh: String,
    pub submit_button: String,
    pub validation_message: String,
    pub results_table: String,
    pub no_results: String,
    pub captcha_error: String,
}

impl Default for PortalSelectors {
    fn default() -> Self {
        Self {
            case_status_links: vec![
                "#leftPaneMenuCS".into(),
                "a[title='Case Status']".into(),
                "#case_status_link".into(),
            ],
            popup_buttons: vec![
                "#bs_alert .close".into(),
                ".modal.show button.btn-close".into(),
                ".modal button".into(),
                "input[value='OK']".into(),
                "button[onclick*='close']".into(),
            ],
            court_select: "#sess_state_code".into(),
            bench_select: "#court_complex_code".into(),
            party_name_tab: "#CSpartyName".into(),
            case_number_tab: "#CScaseNumber".into(),
            party_name_input: "#petres_name".into(),
            party_year_input: "#rgyearP".into(),
            party_status_radio: "input[name='radPCD'][value='{}']".into(),
            case_type_select: "#case_type".into(),
            case_number_input: "#search_case_no".into(),
            case_year_input: "#rgyear".into(),
            captcha_image: "#captcha_image".into(),
            captcha_input: "#captcha".into(),
            captcha_refresh: "#captcha_container_2 a, a[onclick*='refreshCaptcha']".into(),
            submit_button: "#goResetDiv input[value='Go'], input[value='Go']".into(),
            validation_message: "#errSpan, .alert-danger-cust".into(),
            results_table: "#showList table, table#dispTable, table#searchResults".into(),
            no_results: "#showList .norecord, #errSpan1".into(),
            captcha_error: "#errSpan, #txtmsg".into(),
        }
    }
}

/// Top-level config loaded from `case-scout.json`.
///
/// Every field is optional; `resolve()` applies env-var fallbacks and defaults.
#[derive(serde::Deserialize, Default, Clone, Debug)]
pub struct ScoutConfig {
    pub headless: Option<bool>,
    pub max_results: Option<usize>,
    pub captcha_max_attempts: Option<u32>,
    pub navigation_timeout_ms: Option<u64>,
    pub element_timeout_ms: Option<u64>,
    pub captcha_render_timeout_ms: Option<u64>,
    pub pipeline_max_attempts: Option<u32>,
    pub workers: Option<usize>,
    pub base_url: Option<String>,
    pub database_path: Option<String>,
    pub artifacts_dir: Option<String>,
    pub captcha_solver_url: Option<String>,
    /// Never logged.
    pub captcha_solver_key: Option<String>,
    pub chrome_executable: Option<String>,
    #[serde(default)]
    pub selectors: PortalSelectors,
}

/// Fully resolved run configuration.
#[derive(Clone, Debug)]
pub struct PortalConfig {
    pub headless: bool,
    pub max_results: usize,
    pub captcha_max_attempts: u32,
    pub navigation_timeout_ms: u64,
    pub element_timeout_ms: u64,
    pub captcha_render_timeout_ms: u64,
    pub pipeline_max_attempts: u32,
    pub workers: usize,
    pub base_url: String,
    pub database_path: PathBuf,
    pub artifacts_dir: PathBuf,
    pub captcha_solver_url: Option<String>,
    pub captcha_solver_key: Option<String>,
    pub chrome_executable: Option<String>,
    pub selectors: PortalSelectors,
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            headless: true,
            max_results: 20,
            captcha_max_attempts: 5,
            navigation_timeout_ms: 30_000,
            element_timeout_ms: 15_000,
            captcha_render_timeout_ms: 10_000,
            pipeline_max_attempts: 3,
            workers: 1,
            base_url: DEFAULT_BASE_URL.to_string(),
            database_path: default_database_path(),
            artifacts_dir: PathBuf::from("proofs"),
            captcha_solver_url: None,
            captcha_solver_key: None,
            chrome_executable: None,
            selectors: PortalSelectors::default(),
        }
    }
}

impl PortalConfig {
    pub fn page_load_timeout(&self) -> Duration {
        Duration::from_millis(self.navigation_timeout_ms)
    }

    pub fn element_timeout(&self) -> Duration {
        Duration::from_millis(self.element_timeout_ms)
    }

    pub fn captcha_render_timeout(&self) -> Duration {
        Duration::from_millis(self.captcha_render_timeout_ms)
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_string(key).and_then(|v| v.parse().ok())
}

fn env_bool(key: &str) -> Option<bool> {
    let v = env_string(key)?.to_ascii_lowercase();
    match v.as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn non_empty(v: &Option<String>) -> Option<String> {
    v.as_ref()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn default_database_path() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".case-scout").join("cases.db"))
        .unwrap_or_else(|| PathBuf::from("cases.db"))
}

impl ScoutConfig {
    /// JSON field → env var → default, per field.
    pub fn resolve(&self) -> PortalConfig {
        let d = PortalConfig::default();
        PortalConfig {
            headless: self.headless.or_else(|| env_bool("HEADLESS")).unwrap_or(d.headless),
            max_results: self
                .max_results
                .or_else(|| env_parse("MAX_RESULTS"))
                .unwrap_or(d.max_results),
            captcha_max_attempts: self
                .captcha_max_attempts
                .or_else(|| env_parse("CAPTCHA_MAX_ATTEMPTS"))
                .unwrap_or(d.captcha_max_attempts)
                .max(1),
            navigation_timeout_ms: self
                .navigation_timeout_ms
                .or_else(|| env_parse("NAVIGATION_TIMEOUT_MS"))
                .unwrap_or(d.navigation_timeout_ms),
            element_timeout_ms: self
                .element_timeout_ms
                .or_else(|| env_parse("ELEMENT_TIMEOUT_MS"))
                .unwrap_or(d.element_timeout_ms),
            captcha_render_timeout_ms: self
                .captcha_render_timeout_ms
                .or_else(|| env_parse("CAPTCHA_RENDER_TIMEOUT_MS"))
                .unwrap_or(d.captcha_render_timeout_ms),
            pipeline_max_attempts: self
                .pipeline_max_attempts
                .or_else(|| env_parse("PIPELINE_MAX_ATTEMPTS"))
                .unwrap_or(d.pipeline_max_attempts)
                .max(1),
            workers: self
                .workers
                .or_else(|| env_parse("WORKERS"))
                .unwrap_or(d.workers)
                .max(1),
            base_url: non_empty(&self.base_url)
                .or_else(|| env_string("BASE_URL"))
                .unwrap_or(d.base_url),
            database_path: non_empty(&self.database_path)
                .or_else(|| env_string("DATABASE_PATH"))
                .map(PathBuf::from)
                .unwrap_or(d.database_path),
            artifacts_dir: non_empty(&self.artifacts_dir)
                .or_else(|| env_string("ARTIFACTS_DIR"))
                .map(PathBuf::from)
                .unwrap_or(d.artifacts_dir),
            captcha_solver_url: non_empty(&self.captcha_solver_url)
                .or_else(|| env_string("CAPTCHA_SOLVER_URL")),
            captcha_solver_key: non_empty(&self.captcha_solver_key)
                .or_else(|| env_string("CAPTCHA_SOLVER_KEY")),
            chrome_executable: non_empty(&self.chrome_executable)
                .or_else(chrome_executable_override),
            selectors: self.selectors.clone(),
        }
    }
}

/// Load `case-scout.json` from standard locations.
///
/// Search order (first found wins):
/// 1. explicit path (`--config`) or `CASE_SCOUT_CONFIG`
/// 2. `./case-scout.json`
/// 3. `~/.case-scout/case-scout.json`
///
/// Missing file → `ScoutConfig::default()` (all env-var fallbacks apply).
/// Parse error → log a warning, return `ScoutConfig::default()`.
pub fn load_scout_config(explicit: Option<&Path>) -> ScoutConfig {
    let mut candidates: Vec<PathBuf> = vec![PathBuf::from("case-scout.json")];
    if let Some(home) = dirs::home_dir() {
        candidates.push(home.join(".case-scout").join("case-scout.json"));
    }
    if let Some(env_path) = env_string(ENV_CONFIG_PATH) {
        candidates.insert(0, PathBuf::from(env_path));
    }
    if let Some(p) = explicit {
        candidates.insert(0, p.to_path_buf());
    }

    for path in &candidates {
        let Ok(contents) = std::fs::read_to_string(path) else {
            continue;
        };
        return match serde_json::from_str::<ScoutConfig>(&contents) {
            Ok(cfg) => {
                tracing::info!("case-scout.json loaded from {}", path.display());
                cfg
            }
            Err(e) => {
                tracing::warn!(
                    "case-scout.json parse error at {}: {}; using defaults",
                    path.display(),
                    e
                );
                ScoutConfig::default()
            }
        };
    }

    ScoutConfig::default()
}

/// Optional override for the Chromium-family browser executable.
///
/// Only returns a value when `CHROME_EXECUTABLE` is set to an existing path.
pub fn chrome_executable_override() -> Option<String> {
    let p = env_string(ENV_CHROME_EXECUTABLE)?;
    if Path::new(&p).exists() {
        Some(p)
    } else {
        None
    }
}
