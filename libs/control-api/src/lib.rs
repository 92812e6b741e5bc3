//! Control API models

pub mod models;

pub use models::*;
