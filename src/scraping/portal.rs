//! Portal automation seam.
//!
//! The orchestrator depends only on [`PortalDriver`]: navigate, select, fill,
//! click, wait-for, read, plus a few read-only helpers (dropdown options, page
//! HTML, element capture, screenshot). Any engine implementing these is
//! interchangeable; [`CdpSession`] is the chromiumoxide implementation.

use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::browser::BrowserContextId;
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::page::ScreenshotParams;
use chromiumoxide::Page;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::browser_manager::{self, SessionPool};
use crate::core::{PortalError, PortalResult};

/// One `<option>` of a `<select>`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SelectOption {
    pub value: String,
    pub text: String,
}

#[async_trait]
pub trait PortalDriver: Send {
    /// Load `url` and wait for the document to settle.
    async fn navigate(&mut self, url: &str, timeout: Duration) -> PortalResult<()>;

    /// Choose `value` in the dropdown matched by `selector` and fire `change`.
    async fn select(&mut self, selector: &str, value: &str) -> PortalResult<()>;

    /// Replace the text of the input matched by `selector`.
    async fn fill(&mut self, selector: &str, text: &str) -> PortalResult<()>;

    async fn click(&mut self, selector: &str) -> PortalResult<()>;

    /// Wait until `selector` matches a rendered element.
    async fn wait_for(&mut self, selector: &str, timeout: Duration) -> PortalResult<()>;

    /// Visible text of the first element matching `selector`, if any.
    async fn read(&mut self, selector: &str) -> PortalResult<Option<String>>;

    async fn options(&mut self, selector: &str) -> PortalResult<Vec<SelectOption>>;

    /// Full rendered DOM as HTML.
    async fn content(&mut self) -> PortalResult<String>;

    /// PNG of the element matched by `selector`.
    async fn capture(&mut self, selector: &str) -> PortalResult<Vec<u8>>;

    /// Full-page PNG.
    async fn screenshot(&mut self) -> PortalResult<Vec<u8>>;

    async fn press_escape(&mut self) -> PortalResult<()>;
}

/// A driver bound to an isolated browser session that must be released.
#[async_trait]
pub trait PortalSession: PortalDriver {
    fn driver(&mut self) -> &mut dyn PortalDriver;

    async fn release(self: Box<Self>);
}

/// Hands out fresh, isolated sessions.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn open(&self) -> PortalResult<Box<dyn PortalSession>>;
}

// ─────────────────────────────────────────────────────────────────────────────
// chromiumoxide implementation
// ─────────────────────────────────────────────────────────────────────────────

const POLL_MS: u64 = 250;

fn js_str(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| "\"\"".to_string())
}

/// One tab inside its own browser context.
pub struct CdpSession {
    page: Option<Page>,
    context: Option<BrowserContextId>,
    pool: Arc<SessionPool>,
}

impl CdpSession {
    pub(crate) fn new(page: Page, context: BrowserContextId, pool: Arc<SessionPool>) -> Self {
        Self {
            page: Some(page),
            context: Some(context),
            pool,
        }
    }

    fn page(&self) -> PortalResult<&Page> {
        self.page
            .as_ref()
            .ok_or_else(|| PortalError::Session("session already released".into()))
    }

    async fn eval<T: serde::de::DeserializeOwned>(&self, script: String) -> PortalResult<T> {
        self.page()?
            .evaluate(script)
            .await
            .map_err(|e| PortalError::Session(format!("script failed: {}", e)))?
            .into_value::<T>()
            .map_err(|e| PortalError::Session(format!("unexpected script result: {}", e)))
    }
}

#[async_trait]
impl PortalDriver for CdpSession {
    async fn navigate(&mut self, url: &str, timeout: Duration) -> PortalResult<()> {
        let page = self.page()?;
        match tokio::time::timeout(timeout, page.goto(url)).await {
            Err(_) => return Err(PortalError::timeout(format!("page load {}", url), timeout.as_millis() as u64)),
            Ok(Err(e)) => return Err(PortalError::PortalUnavailable(format!("{}: {}", url, e))),
            Ok(Ok(_)) => {}
        }
        if !browser_manager::wait_until_stable(page, 750, timeout.as_millis() as u64).await {
            return Err(PortalError::timeout(
                format!("document ready {}", url),
                timeout.as_millis() as u64,
            ));
        }
        Ok(())
    }

    async fn select(&mut self, selector: &str, value: &str) -> PortalResult<()> {
        let script = format!(
            r#"(() => {{
                const el = document.querySelector({sel});
                if (!el) return "missing";
                const opt = Array.from(el.options || []).find(o => o.value === {val});
                if (!opt) return "no_option";
                el.value = {val};
                el.dispatchEvent(new Event('change', {{ bubbles: true }}));
                return "ok";
            }})()"#,
            sel = js_str(selector),
            val = js_str(value)
        );
        match self.eval::<String>(script).await?.as_str() {
            "ok" => Ok(()),
            "no_option" => Err(PortalError::Navigation(format!(
                "option '{}' not offered by {}",
                value, selector
            ))),
            _ => Err(PortalError::Navigation(format!("dropdown {} not found", selector))),
        }
    }

    async fn fill(&mut self, selector: &str, text: &str) -> PortalResult<()> {
        let script = format!(
            r#"(() => {{
                const el = document.querySelector({sel});
                if (!el) return false;
                el.focus();
                el.value = {val};
                el.dispatchEvent(new Event('input', {{ bubbles: true }}));
                el.dispatchEvent(new Event('change', {{ bubbles: true }}));
                return true;
            }})()"#,
            sel = js_str(selector),
            val = js_str(text)
        );
        if self.eval::<bool>(script).await? {
            Ok(())
        } else {
            Err(PortalError::Navigation(format!("field {} not found", selector)))
        }
    }

    async fn click(&mut self, selector: &str) -> PortalResult<()> {
        let el = self
            .page()?
            .find_element(selector)
            .await
            .map_err(|e| PortalError::Navigation(format!("{}: {}", selector, e)))?;
        el.click()
            .await
            .map_err(|e| PortalError::Navigation(format!("click {}: {}", selector, e)))?;
        Ok(())
    }

    async fn wait_for(&mut self, selector: &str, timeout: Duration) -> PortalResult<()> {
        // `<option>` elements have no client rects; presence is enough for them.
        let script = format!(
            r#"(() => {{
                const el = document.querySelector({sel});
                if (!el) return false;
                return el.tagName === 'OPTION' || el.getClientRects().length > 0;
            }})()"#,
            sel = js_str(selector)
        );
        let start = std::time::Instant::now();
        loop {
            match self.eval::<bool>(script.clone()).await {
                Ok(true) => return Ok(()),
                Ok(false) => {}
                // Mid-navigation evaluation errors are expected; keep polling.
                Err(e) => debug!("wait_for {}: {}", selector, e),
            }
            if start.elapsed() >= timeout {
                return Err(PortalError::timeout(selector, timeout.as_millis() as u64));
            }
            tokio::time::sleep(Duration::from_millis(POLL_MS)).await;
        }
    }

    async fn read(&mut self, selector: &str) -> PortalResult<Option<String>> {
        let script = format!(
            r#"(() => {{
                const el = document.querySelector({sel});
                return el ? (el.innerText || el.textContent || "") : null;
            }})()"#,
            sel = js_str(selector)
        );
        let text: Option<String> = self.eval(script).await?;
        Ok(text.map(|t| t.trim().to_string()))
    }

    async fn options(&mut self, selector: &str) -> PortalResult<Vec<SelectOption>> {
        let script = format!(
            r#"(() => {{
                const el = document.querySelector({sel});
                if (!el) return null;
                return Array.from(el.options || []).map(o => ({{ value: o.value, text: o.textContent.trim() }}));
            }})()"#,
            sel = js_str(selector)
        );
        let opts: Option<Vec<SelectOption>> = self.eval(script).await?;
        opts.ok_or_else(|| PortalError::Navigation(format!("dropdown {} not found", selector)))
    }

    async fn content(&mut self) -> PortalResult<String> {
        self.page()?
            .content()
            .await
            .map_err(|e| PortalError::Session(format!("failed to read page content: {}", e)))
    }

    async fn capture(&mut self, selector: &str) -> PortalResult<Vec<u8>> {
        let el = self
            .page()?
            .find_element(selector)
            .await
            .map_err(|e| PortalError::Navigation(format!("{}: {}", selector, e)))?;
        el.screenshot(CaptureScreenshotFormat::Png)
            .await
            .map_err(|e| PortalError::Session(format!("capture {}: {}", selector, e)))
    }

    async fn screenshot(&mut self) -> PortalResult<Vec<u8>> {
        let params = ScreenshotParams::builder()
            .format(CaptureScreenshotFormat::Png)
            .full_page(true)
            .build();
        self.page()?
            .screenshot(params)
            .await
            .map_err(|e| PortalError::Session(format!("screenshot failed: {}", e)))
    }

    async fn press_escape(&mut self) -> PortalResult<()> {
        let script = r#"(() => {
            for (const type of ['keydown', 'keyup']) {
                document.dispatchEvent(new KeyboardEvent(type, { key: 'Escape', keyCode: 27, bubbles: true }));
            }
            return true;
        })()"#;
        self.eval::<bool>(script.to_string()).await.map(|_| ())
    }
}

#[async_trait]
impl PortalSession for CdpSession {
    fn driver(&mut self) -> &mut dyn PortalDriver {
        self
    }

    async fn release(mut self: Box<Self>) {
        if let Some(page) = self.page.take() {
            if let Err(e) = page.close().await {
                warn!("Portal session: tab close error (non-fatal): {}", e);
            }
        }
        if let Some(context) = self.context.take() {
            self.pool.dispose(context).await;
        }
    }
}

impl Drop for CdpSession {
    fn drop(&mut self) {
        // Sessions dropped without `release()` (panics, aborted tasks) still
        // get their context torn down.
        let (Some(context), Ok(handle)) = (self.context.take(), tokio::runtime::Handle::try_current()) else {
            return;
        };
        let page = self.page.take();
        let pool = Arc::clone(&self.pool);
        handle.spawn(async move {
            if let Some(page) = page {
                let _ = page.close().await;
            }
            pool.dispose(context).await;
        });
    }
}
