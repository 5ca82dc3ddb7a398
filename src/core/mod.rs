pub mod config;
pub mod error;
pub mod types;

pub use config::{PortalConfig, PortalSelectors, ScoutConfig};
pub use error::{PortalError, PortalResult};
