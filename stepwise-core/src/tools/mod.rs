//! Tool system
//!
//! Tools are named side-effecting operations with declared input and output
//! schemas. A [`ToolRegistry`] maps names to tools and performs validated,
//! traced invocation on behalf of step bodies.
//!
//! # Example
//!
//! ```rust,no_run
//! use stepwise_core::tools::{FnTool, ToolRegistry};
//! use std::sync::Arc;
//!
//! let mut registry = ToolRegistry::new();
//! registry.register(Arc::new(FnTool::new("echo", |_ctx, input| async move { Ok(input) })));
//! assert!(registry.contains("echo"));
//! ```

mod registry;
mod tool;

pub use registry::ToolRegistry;
pub use tool::{FnTool, Tool};
