//! Background workers

pub mod dispatcher;
pub mod scheduler;

pub use dispatcher::Dispatcher;
