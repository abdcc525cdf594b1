pub mod clock;
pub mod domain;
pub mod engine;
pub mod error;
pub mod monitor;
pub mod observable;
pub mod persistence;
pub mod session;
pub mod store;
pub mod ticker;
pub mod tracker;

#[cfg(test)]
pub(crate) mod testing;

pub use engine::{EngineOptions, SessionRuntime, TaskEngine};
pub use error::{Result, TaskError};
