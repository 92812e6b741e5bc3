//! Transport layer for management endpoint connections

pub mod factory;
pub mod trust;

pub use factory::{ClientFactory, TransportOptions};
pub use trust::TrustConfig;
