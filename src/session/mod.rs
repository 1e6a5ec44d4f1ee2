//! Session engine: registry, turn lifecycle, streaming and notifications

pub mod backend;
pub mod batcher;
pub mod claude;
pub mod events;
pub mod manager;
pub mod notify;
pub mod registry;
pub mod types;

mod abort;
mod auth;
mod processor;
mod turn;

pub use auth::{CredentialService, NoopCredentials};
pub use backend::{AgentBackend, BackendConfig, BackendFactory, TurnStream};
pub use claude::{ClaudeBackend, ClaudeBackendFactory};
pub use events::{AbortReason, BackendError, TurnEvent};
pub use manager::{CreateSessionOptions, CredentialResponse, SendOutcome, SessionManager, SessionManagerBuilder};
pub use notify::{EngineEvent, EventBus, Notification, UserMessageStatus, WorkspaceReceiver};
pub use registry::SessionRegistry;
pub use types::{
    ChildStatus, CompletionRecord, Message, MessageRole, OrchestrationState, PauseReason, PermissionMode,
    SessionInfo, SessionMeta, TokenUsage,
};
