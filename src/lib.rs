pub mod core;
pub mod features;
pub mod scraping;

// --- Primary core exports ---
pub use core::types;
pub use core::types::*;
pub use core::{PortalConfig, PortalError, PortalResult};

pub use features::{
    ArtifactWriter, BatchRunner, BatchSummary, CaptchaResolver, CaseStore, SearchOrchestrator,
    SearchReport, SqliteCaseStore, SweepPlan, Topology,
};
pub use scraping::{PortalDriver, PortalSession, SessionFactory, SessionPool};
