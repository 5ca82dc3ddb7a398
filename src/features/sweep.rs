//! Court-wide sweeps: one party-name search on every bench of each target
//! High Court.

use std::sync::Arc;
use tracing::{info, warn};

use super::topology::Topology;
use crate::core::types::{Bench, CaseStatusFilter, HighCourt, SearchQuery, SearchRequest};
use crate::core::{PortalError, PortalResult};
use crate::scraping::PortalDriver;

/// Delhi and Karnataka.
pub const DEFAULT_COURTS: &[&str] = &["26", "3"];
pub const DEFAULT_PARTY: &str = "kumar";

#[derive(Debug, Clone)]
pub struct SweepPlan {
    pub court_ids: Vec<String>,
    pub party: String,
    pub year: Option<u16>,
    pub status: CaseStatusFilter,
}

impl Default for SweepPlan {
    fn default() -> Self {
        Self {
            court_ids: DEFAULT_COURTS.iter().map(|c| c.to_string()).collect(),
            party: DEFAULT_PARTY.to_string(),
            year: None,
            status: CaseStatusFilter::Both,
        }
    }
}

/// `"26, 3,,26"` → `["26", "3"]`.
pub fn parse_court_list(list: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for id in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        if !out.iter().any(|o| o == id) {
            out.push(id.to_string());
        }
    }
    out
}

impl SweepPlan {
    /// Target courts (in dropdown order) with their benches.
    ///
    /// Courts the portal does not list, and courts whose benches cannot be
    /// read, are skipped with a warning. Fails only when no target court is
    /// listed at all.
    pub async fn listing(
        &self,
        topology: &Topology,
        portal: &mut dyn PortalDriver,
    ) -> PortalResult<Vec<(HighCourt, Arc<Vec<Bench>>)>> {
        let courts = topology.discover_courts(portal).await?;
        let targets: Vec<HighCourt> = courts
            .iter()
            .filter(|c| self.court_ids.contains(&c.id))
            .cloned()
            .collect();

        for id in &self.court_ids {
            if !targets.iter().any(|c| &c.id == id) {
                warn!("Court value {} is not offered by the portal", id);
            }
        }
        if targets.is_empty() {
            let available: Vec<&str> = courts.iter().map(|c| c.name.as_str()).collect();
            info!("Available courts: {:?}", available);
            return Err(PortalError::Navigation(format!(
                "none of the courts [{}] are listed",
                self.court_ids.join(", ")
            )));
        }

        let mut out = Vec::with_capacity(targets.len());
        for court in targets {
            match topology.discover_benches(portal, &court.id).await {
                Ok(benches) if benches.is_empty() => {
                    warn!("No benches found for {}, skipping", court.name);
                }
                Ok(benches) => {
                    info!("Benches found: {} for {}", benches.len(), court.name);
                    out.push((court, benches));
                }
                Err(e) => warn!("Failed to enumerate benches for {}: {}", court.name, e),
            }
        }
        Ok(out)
    }

    pub fn requests(&self, listing: &[(HighCourt, Arc<Vec<Bench>>)], max_results: usize) -> Vec<SearchRequest> {
        listing
            .iter()
            .flat_map(|(court, benches)| {
                benches.iter().map(move |bench| {
                    SearchRequest::new(
                        court.id.clone(),
                        bench.id.clone(),
                        SearchQuery::PartyName {
                            name: self.party.clone(),
                            year: self.year,
                            status: self.status,
                        },
                        max_results,
                    )
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bench(court: &str, id: &str) -> Bench {
        Bench {
            id: id.into(),
            court_id: court.into(),
            name: format!("Bench {}", id),
        }
    }

    #[test]
    fn test_parse_court_list_dedupes() {
        assert_eq!(parse_court_list("26, 3,,26"), vec!["26", "3"]);
        assert!(parse_court_list(" , ").is_empty());
    }

    #[test]
    fn test_one_request_per_bench() {
        let listing = vec![
            (
                HighCourt {
                    id: "26".into(),
                    name: "High Court of Delhi".into(),
                },
                Arc::new(vec![bench("26", "1")]),
            ),
            (
                HighCourt {
                    id: "3".into(),
                    name: "High Court of Karnataka".into(),
                },
                Arc::new(vec![bench("3", "1"), bench("3", "2"), bench("3", "3")]),
            ),
        ];
        let plan = SweepPlan {
            year: Some(2022),
            ..Default::default()
        };
        let reqs = plan.requests(&listing, 15);

        assert_eq!(reqs.len(), 4);
        let keys: Vec<(&str, &str)> = reqs.iter().map(|r| (r.court_id.as_str(), r.bench_id.as_str())).collect();
        assert_eq!(keys, vec![("26", "1"), ("3", "1"), ("3", "2"), ("3", "3")]);
        assert!(reqs.iter().all(|r| r.max_results == 15));
        assert!(matches!(
            &reqs[0].query,
            SearchQuery::PartyName { name, year: Some(2022), .. } if name == "kumar"
        ));
        // Fresh id per request so outcomes never collide.
        assert_ne!(reqs[1].id, reqs[2].id);
    }
}
