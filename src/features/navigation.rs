//! Portal form navigation shared by topology discovery and the search
//! pipeline: open the Case Status form, read dropdowns, pick a court.

use std::time::Duration;
use tracing::{debug, info};

use crate::core::types::{Bench, HighCourt};
use crate::core::{PortalConfig, PortalResult};
use crate::scraping::{PortalDriver, SelectOption};

const POPUP_PROBE: Duration = Duration::from_millis(300);

/// `"Select High Court"`, `value="0"` and blank entries are not real choices.
pub fn is_placeholder(opt: &SelectOption) -> bool {
    let value = opt.value.trim();
    value.is_empty() || value == "0" || opt.text.to_lowercase().contains("select")
}

/// Close the start-up modal if one is showing. Best-effort.
pub async fn dismiss_popup(portal: &mut dyn PortalDriver, cfg: &PortalConfig) {
    for sel in &cfg.selectors.popup_buttons {
        if portal.wait_for(sel, POPUP_PROBE).await.is_ok() && portal.click(sel).await.is_ok() {
            info!("Dismissed popup using selector: {}", sel);
            return;
        }
    }
    if let Err(e) = portal.press_escape().await {
        debug!("popup escape failed (non-critical): {}", e);
    }
}

/// Load the portal and bring up the Case Status search form.
pub async fn open_search_form(portal: &mut dyn PortalDriver, cfg: &PortalConfig) -> PortalResult<()> {
    portal.navigate(&cfg.base_url, cfg.page_load_timeout()).await?;
    dismiss_popup(portal, cfg).await;

    let mut opened = false;
    for sel in &cfg.selectors.case_status_links {
        if portal.click(sel).await.is_ok() {
            info!("Opened Case Status section using {}", sel);
            opened = true;
            break;
        }
    }
    if !opened {
        info!("Proceeding with loaded page (no explicit Case Status link found)");
    }
    dismiss_popup(portal, cfg).await;

    portal
        .wait_for(&cfg.selectors.court_select, cfg.page_load_timeout())
        .await
}

pub async fn court_options(portal: &mut dyn PortalDriver, cfg: &PortalConfig) -> PortalResult<Vec<HighCourt>> {
    let opts = portal.options(&cfg.selectors.court_select).await?;
    Ok(opts
        .into_iter()
        .filter(|o| !is_placeholder(o))
        .map(|o| HighCourt {
            id: o.value.trim().to_string(),
            name: o.text.trim().to_string(),
        })
        .collect())
}

/// Choose a court and wait for its bench dropdown to populate.
pub async fn select_court(portal: &mut dyn PortalDriver, cfg: &PortalConfig, court_id: &str) -> PortalResult<()> {
    portal.select(&cfg.selectors.court_select, court_id).await?;
    let populated = format!("{} option:nth-child(2)", cfg.selectors.bench_select);
    portal.wait_for(&populated, cfg.element_timeout()).await
}

pub async fn bench_options(
    portal: &mut dyn PortalDriver,
    cfg: &PortalConfig,
    court_id: &str,
) -> PortalResult<Vec<Bench>> {
    let opts = portal.options(&cfg.selectors.bench_select).await?;
    Ok(opts
        .into_iter()
        .filter(|o| !is_placeholder(o))
        .map(|o| Bench {
            id: o.value.trim().to_string(),
            court_id: court_id.to_string(),
            name: o.text.trim().to_string(),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opt(value: &str, text: &str) -> SelectOption {
        SelectOption {
            value: value.into(),
            text: text.into(),
        }
    }

    #[test]
    fn test_placeholders() {
        assert!(is_placeholder(&opt("", "--")));
        assert!(is_placeholder(&opt("0", "Select High Court")));
        assert!(is_placeholder(&opt("1", "Select Bench")));
        assert!(!is_placeholder(&opt("26", "High Court of Delhi")));
    }
}
