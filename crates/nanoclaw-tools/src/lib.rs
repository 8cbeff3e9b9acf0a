//! Nanoclaw Tools - tool registry, argument validation, and builtin tools
//!
//! Each tool is a self-contained file in src/tools/.
//! To add a tool: create the file, implement Tool trait, register below.

pub mod registry;
pub mod tools;
pub mod validation;

pub use registry::{Tool, ToolContext, ToolRegistry, ToolResult};
pub use tools::message::MessageTool;
pub use tools::session_manage::{
    format_session_list, SessionControl, SessionControlHandle, SessionManageTool,
};
pub use validation::{validate_arguments, Violation};

use nanoclaw_core::Result;
use std::path::PathBuf;

/// Create the default tool registry with all builtin tools.
///
/// `control` is the session store's capability handle; `media_dir` is where
/// the message tool writes decoded attachments.
pub fn create_default_registry(
    control: SessionControlHandle,
    media_dir: impl Into<PathBuf>,
) -> Result<ToolRegistry> {
    let mut registry = ToolRegistry::new();
    registry.register(SessionManageTool::new(control))?;
    registry.register(MessageTool::new(media_dir))?;
    Ok(registry)
}
