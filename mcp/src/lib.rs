pub mod cli;
pub mod context;
pub mod dispatcher;

pub use context::McpContext;
pub use dispatcher::{dispatch, ToolError};
