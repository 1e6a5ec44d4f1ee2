//! Core building blocks shared by the engine

pub mod clock;
pub mod error;
pub mod state;

pub use clock::MonotonicClock;
pub use error::{EngineError, ErrorReporter, TracingReporter};
pub use state::AppState;
