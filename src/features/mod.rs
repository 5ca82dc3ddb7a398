pub mod artifacts;
pub mod captcha;
pub mod extract;
pub mod navigation;
pub mod orchestrator;
pub mod runner;
pub mod store;
pub mod sweep;
pub mod topology;

pub use artifacts::ArtifactWriter;
pub use captcha::{CaptchaResolver, CaptchaSolver, HttpCaptchaSolver, PlaceholderSolver};
pub use extract::{PageSignal, ResultExtractor};
pub use orchestrator::{RetryPolicies, RetryPolicy, SearchOrchestrator, SearchProgress, SearchReport, SearchState};
pub use runner::{BatchRunner, BatchSummary};
pub use store::{CaseStore, SqliteCaseStore};
pub use sweep::SweepPlan;
pub use topology::Topology;
