//! Catalog of the tools and resources this process serves.
//!
//! Filled once during startup and then frozen behind an `Arc`; lookups take
//! no lock. Iteration follows registration order.
//!
//! ```rust
//! use mcp_relay::{Registry, ToolBuilder, ToolOutput};
//!
//! let mut registry = Registry::new();
//! let echo = ToolBuilder::new("echo")
//!     .raw_handler(|args| async move { Ok(ToolOutput::Json(args)) })
//!     .unwrap();
//! registry.register_tool(echo).unwrap();
//!
//! assert!(registry.tool("ECHO").is_some());
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::protocol::{ResourceDefinition, ToolDefinition};
use crate::resource::Resource;
use crate::tool::Tool;

#[derive(Debug, Default)]
pub struct Registry {
    tools: Vec<Arc<Tool>>,
    tool_index: HashMap<String, usize>,
    resources: Vec<Arc<Resource>>,
    resource_index: HashMap<String, usize>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Names compare case-insensitively; a repeat is an
    /// error and the first registration stays.
    pub fn register_tool(&mut self, tool: Tool) -> Result<()> {
        let key = tool.name.to_lowercase();
        if self.tool_index.contains_key(&key) {
            return Err(Error::DuplicateTool(tool.name));
        }
        tracing::debug!(tool = %tool.name, "Registered tool");
        self.tool_index.insert(key, self.tools.len());
        self.tools.push(Arc::new(tool));
        Ok(())
    }

    /// Register a resource. URIs compare exactly; a repeat is an error and
    /// the first registration stays.
    pub fn register_resource(&mut self, resource: Resource) -> Result<()> {
        if self.resource_index.contains_key(&resource.uri) {
            return Err(Error::DuplicateResource(resource.uri));
        }
        tracing::debug!(uri = %resource.uri, "Registered resource");
        self.resource_index
            .insert(resource.uri.clone(), self.resources.len());
        self.resources.push(Arc::new(resource));
        Ok(())
    }

    /// Builder-style [`register_tool`](Self::register_tool)
    pub fn with_tool(mut self, tool: Tool) -> Result<Self> {
        self.register_tool(tool)?;
        Ok(self)
    }

    /// Builder-style [`register_resource`](Self::register_resource)
    pub fn with_resource(mut self, resource: Resource) -> Result<Self> {
        self.register_resource(resource)?;
        Ok(self)
    }

    pub fn tool(&self, name: &str) -> Option<&Arc<Tool>> {
        self.tool_index
            .get(&name.to_lowercase())
            .map(|&i| &self.tools[i])
    }

    pub fn resource(&self, uri: &str) -> Option<&Arc<Resource>> {
        self.resource_index.get(uri).map(|&i| &self.resources[i])
    }

    pub fn tools(&self) -> impl Iterator<Item = &Arc<Tool>> {
        self.tools.iter()
    }

    pub fn resources(&self) -> impl Iterator<Item = &Arc<Resource>> {
        self.resources.iter()
    }

    pub fn tool_definitions(&self) -> Vec<ToolDefinition> {
        self.tools.iter().map(|t| t.definition()).collect()
    }

    pub fn resource_definitions(&self) -> Vec<ResourceDefinition> {
        self.resources.iter().map(|r| r.definition()).collect()
    }

    pub fn has_tools(&self) -> bool {
        !self.tools.is_empty()
    }

    pub fn has_resources(&self) -> bool {
        !self.resources.is_empty()
    }
}
