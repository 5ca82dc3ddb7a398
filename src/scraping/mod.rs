pub mod browser_manager;
pub mod portal;

pub use browser_manager::SessionPool;
pub use portal::{CdpSession, PortalDriver, PortalSession, SelectOption, SessionFactory};
