//! Chromium process management for portal sessions.
//!
//! * Locating a Chromium-family executable (config, `PATH`, then the usual
//!   install locations for the OS).
//! * [`SessionPool`]: one long-lived browser process handing out isolated
//!   browser contexts, one per portal session.
//! * [`wait_until_stable`] for the portal's AJAX-driven pages.
//!
//! The search pipeline never touches these types directly; it only sees the
//! `PortalDriver` / `PortalSession` traits from `scraping::portal`.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chromiumoxide::browser::BrowserConfig;
use chromiumoxide::cdp::browser_protocol::browser::BrowserContextId;
use chromiumoxide::cdp::browser_protocol::target::{
    CreateBrowserContextParams, CreateTargetParams,
};
use chromiumoxide::handler::viewport::Viewport;
use chromiumoxide::{Browser, Page};
use futures::StreamExt;
use rand::seq::IndexedRandom;
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::portal::{CdpSession, PortalSession, SessionFactory};
use crate::core::{PortalError, PortalResult};

const VIEWPORT: (u32, u32) = (1366, 900);

// ── User agents ──────────────────────────────────────────────────────────────

const DESKTOP_USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/134.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/133.0.0.0 Safari/537.36 Edg/133.0.0.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/134.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/133.0.0.0 Safari/537.36",
];

/// A desktop User-Agent, picked at random per browser launch.
pub fn random_user_agent() -> &'static str {
    DESKTOP_USER_AGENTS
        .choose(&mut rand::rng())
        .copied()
        .unwrap_or(DESKTOP_USER_AGENTS[0])
}

// ── Executable discovery ─────────────────────────────────────────────────────

/// Binary names looked up on `PATH`, best first.
const PATH_NAMES: &[&str] = &[
    "google-chrome",
    "google-chrome-stable",
    "chromium",
    "chromium-browser",
    "chrome",
    "brave-browser",
];

#[cfg(target_os = "linux")]
const INSTALL_PATHS: &[&str] = &[
    "/usr/bin/google-chrome",
    "/usr/bin/chromium",
    "/usr/bin/chromium-browser",
    "/snap/bin/chromium",
    "/usr/bin/brave-browser",
];

#[cfg(target_os = "macos")]
const INSTALL_PATHS: &[&str] = &[
    "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
    "/Applications/Chromium.app/Contents/MacOS/Chromium",
    "/Applications/Brave Browser.app/Contents/MacOS/Brave Browser",
];

#[cfg(target_os = "windows")]
const INSTALL_PATHS: &[&str] = &[
    r"C:\Program Files\Google\Chrome\Application\chrome.exe",
    r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe",
    r"C:\Program Files (x86)\Microsoft\Edge\Application\msedge.exe",
    r"C:\Program Files\BraveSoftware\Brave-Browser\Application\brave.exe",
];

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
const INSTALL_PATHS: &[&str] = &[];

fn on_path(names: &[&str]) -> Option<String> {
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var).find_map(|dir| {
        names
            .iter()
            .map(|name| dir.join(name))
            .find(|candidate| candidate.is_file())
            .map(|p| p.to_string_lossy().into_owned())
    })
}

/// Locate a Chromium-family browser (Chrome → Chromium → Brave).
///
/// `CHROME_EXECUTABLE` wins when it points at an existing file.
pub fn find_chrome_executable() -> Option<String> {
    crate::core::config::chrome_executable_override()
        .or_else(|| on_path(PATH_NAMES))
        .or_else(|| {
            INSTALL_PATHS
                .iter()
                .find(|p| Path::new(p).exists())
                .map(|p| p.to_string())
        })
}

// ── Launch configuration ─────────────────────────────────────────────────────

const LAUNCH_ARGS: &[&str] = &[
    "--disable-gpu",
    "--no-sandbox",
    "--disable-setuid-sandbox",
    "--disable-dev-shm-usage",
    "--disable-extensions",
    "--disable-background-networking",
    "--disable-sync",
    "--no-first-run",
    "--no-default-browser-check",
    "--mute-audio",
];

/// `headless = false` opens a visible window, which is handy when the portal
/// changes its markup and the selectors need re-checking by eye.
pub fn build_browser_config(exe: &str, headless: bool, width: u32, height: u32) -> Result<BrowserConfig> {
    let builder = LAUNCH_ARGS.iter().fold(
        BrowserConfig::builder()
            .chrome_executable(exe)
            .window_size(width, height)
            .viewport(Viewport {
                width,
                height,
                device_scale_factor: Some(1.0),
                emulating_mobile: false,
                is_landscape: true,
                has_touch: false,
            }),
        |b, arg| b.arg(*arg),
    );
    let builder = builder.arg(format!("--user-agent={}", random_user_agent()));
    let builder = if headless { builder } else { builder.with_head() };

    builder
        .build()
        .map_err(|e| anyhow!("invalid browser config for {}: {}", exe, e))
}

// ── Session pool ─────────────────────────────────────────────────────────────

/// One browser process, many isolated sessions.
///
/// Each `open()` creates a fresh CDP browser context (separate cookies and
/// storage) with a single tab, so concurrent searches never share portal
/// session state. If the browser crashes, the next `open()` restarts it.
pub struct SessionPool {
    exe: String,
    headless: bool,
    inner: Mutex<Option<Browser>>,
}

impl SessionPool {
    /// Create a pool for the given executable. Browser is lazy-started.
    pub fn new(exe: impl Into<String>, headless: bool) -> Arc<Self> {
        Arc::new(Self {
            exe: exe.into(),
            headless,
            inner: Mutex::new(None),
        })
    }

    /// Create a pool using the configured or auto-discovered executable.
    pub fn from_config(cfg: &crate::core::PortalConfig) -> Result<Arc<Self>> {
        let exe = cfg
            .chrome_executable
            .clone()
            .or_else(find_chrome_executable)
            .ok_or_else(|| anyhow!("No browser found. Install Chrome or Chromium, or set CHROME_EXECUTABLE."))?;
        Ok(Self::new(exe, cfg.headless))
    }

    async fn launch(&self) -> Result<Browser> {
        info!("🚀 Session pool: launching browser ({})", self.exe);
        let config = build_browser_config(&self.exe, self.headless, VIEWPORT.0, VIEWPORT.1)?;
        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| anyhow!("failed to launch ({}): {}", self.exe, e))?;
        tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    warn!("CDP handler error: {}", e);
                }
            }
        });
        Ok(browser)
    }

    async fn open_page(self: &Arc<Self>) -> Result<(Page, BrowserContextId)> {
        let mut guard = self.inner.lock().await;

        if guard.is_none() {
            *guard = Some(self.launch().await?);
        }

        let browser = guard
            .as_mut()
            .ok_or_else(|| anyhow!("browser missing after launch"))?;

        let context = match browser
            .create_browser_context(CreateBrowserContextParams::default())
            .await
        {
            Ok(id) => id,
            Err(e) => {
                warn!("🔄 Session pool: browser unresponsive ({}), restarting...", e);
                if let Some(mut old) = guard.take() {
                    let _ = old.close().await;
                }
                let fresh = self.launch().await?;
                let id = fresh
                    .create_browser_context(CreateBrowserContextParams::default())
                    .await
                    .map_err(|e| anyhow!("failed to create browser context: {}", e))?;
                *guard = Some(fresh);
                id
            }
        };

        let browser = guard
            .as_ref()
            .ok_or_else(|| anyhow!("browser missing after restart"))?;
        let params = CreateTargetParams::builder()
            .url("about:blank")
            .browser_context_id(context.clone())
            .build()
            .map_err(|e| anyhow!("invalid target params: {}", e))?;
        let page = browser
            .new_page(params)
            .await
            .map_err(|e| anyhow!("failed to open tab: {}", e))?;
        Ok((page, context))
    }

    /// Tear down one session's browser context. Best-effort.
    pub(crate) async fn dispose(&self, context: BrowserContextId) {
        let mut guard = self.inner.lock().await;
        if let Some(browser) = guard.as_mut() {
            if let Err(e) = browser.dispose_browser_context(context).await {
                warn!("Session pool: failed to dispose browser context: {}", e);
            }
        }
    }

    /// Gracefully close the pooled browser instance.
    pub async fn shutdown(&self) {
        let mut guard = self.inner.lock().await;
        if let Some(mut b) = guard.take() {
            let _ = b.close().await;
            info!("🛑 Session pool shut down");
        }
    }
}

#[async_trait]
impl SessionFactory for Arc<SessionPool> {
    async fn open(&self) -> PortalResult<Box<dyn PortalSession>> {
        let (page, context) = self
            .open_page()
            .await
            .map_err(|e| PortalError::Session(e.to_string()))?;
        Ok(Box::new(CdpSession::new(page, context, Arc::clone(self))))
    }
}

impl Drop for SessionPool {
    fn drop(&mut self) {
        // Drop cannot await; spawn the close so no Chromium process is left behind.
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };

        if let Ok(mut guard) = self.inner.try_lock() {
            if let Some(mut browser) = guard.take() {
                handle.spawn(async move {
                    let _ = browser.close().await;
                });
            }
        }
    }
}

// ── Page settling ────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct LoadProbe {
    ready: bool,
    resources: u64,
}

const LOAD_PROBE_JS: &str = "({ ready: document.readyState === 'complete', \
    resources: performance.getEntriesByType('resource').length })";

/// Poll until `document.readyState` is `complete` and no new resource entries
/// have appeared for `quiet_ms`.
///
/// Returns `false` only when the deadline passed before the document ever
/// reached `complete`; a page that loaded but kept fetching counts as settled.
pub async fn wait_until_stable(page: &Page, quiet_ms: u64, timeout_ms: u64) -> bool {
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    let quiet = Duration::from_millis(quiet_ms);
    let mut loaded = false;
    let mut seen_resources = 0u64;
    let mut quiet_since = Instant::now();

    while Instant::now() < deadline {
        let probe = match page.evaluate(LOAD_PROBE_JS).await {
            Ok(v) => v.into_value::<LoadProbe>().ok(),
            Err(e) => {
                debug!("load probe failed: {}", e);
                None
            }
        };

        match probe {
            Some(p) if p.ready => {
                loaded = true;
                if p.resources != seen_resources {
                    seen_resources = p.resources;
                    quiet_since = Instant::now();
                } else if quiet_since.elapsed() >= quiet {
                    return true;
                }
            }
            _ => quiet_since = Instant::now(),
        }

        tokio::time::sleep(Duration::from_millis(250)).await;
    }

    debug!(loaded, "page did not settle within {}ms", timeout_ms);
    loaded
}
