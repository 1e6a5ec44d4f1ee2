pub mod session;
pub mod workspace;

pub use session::SessionRepository;
pub use workspace::{Workspace, WorkspaceRepository};
