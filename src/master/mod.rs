//! The orchestrating agent: its decision loop, tool dispatch table and prompt.

pub mod master_loop;
pub mod system_prompt;
pub mod tools;

pub use master_loop::{MasterLoop, MasterSettings};
pub use tools::ToolExecutor;
