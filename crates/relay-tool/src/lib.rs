pub mod policy;
pub mod tool;

pub use policy::{PolicyScope, PolicyTool, ToolPolicy, ToolSignature, READ_LOCKED};
pub use tool::{Metadata, Tool, ToolContext, ToolDefinition, ToolError, ToolResult};
