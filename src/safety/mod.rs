//! Filesystem boundary for worker capabilities.

pub mod workspace;

pub use workspace::WorkspaceGuard;
