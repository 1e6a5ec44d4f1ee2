//! Parent/child session orchestration

pub mod coordinator;
pub mod summary;
mod watchdog;

pub use coordinator::{
    ChildInfo, Coordinator, PlanDecision, SpawnChildRequest, SpawnedChild, WaitOutcome,
};
