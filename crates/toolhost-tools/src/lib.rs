//! Tool registry for toolhost.

mod registry;

pub use registry::ToolRegistry;
