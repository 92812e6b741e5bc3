//! Application wiring and lifecycle

pub mod options;
pub mod run;
pub mod state;

pub use options::AppOptions;
pub use state::AppState;
