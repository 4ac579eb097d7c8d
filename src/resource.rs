//! Resource definition and builder API
//!
//! A resource is an absolute URI plus a read handler. Handlers return a
//! [`ResourceOutput`], which is normalized into a `ReadResourceResult` using
//! the resource's own URI and mime type.
//!
//! ```rust
//! use mcp_relay::resource::ResourceBuilder;
//!
//! let resource = ResourceBuilder::new("config://server")
//!     .name("Server configuration")
//!     .mime_type("application/json")
//!     .text(r#"{"debug": false}"#)
//!     .expect("valid uri");
//!
//! assert_eq!(resource.definition().name, "Server configuration");
//! ```

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::protocol::{ReadResourceResult, ResourceContent, ResourceDefinition, encode_base64};

/// A boxed future for resource handlers
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Context handed to resource handlers
#[derive(Debug, Clone)]
pub struct ResourceContext {
    /// The URI being read
    pub uri: String,
    /// Session the request arrived on
    pub client_id: String,
}

/// What a resource handler produces
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceOutput {
    /// UTF-8 text, served as `text`
    Text(String),
    /// Raw bytes, served base64-encoded as `blob`
    Blob(Vec<u8>),
    /// A fully formed result, passed through untouched
    Contents(ReadResourceResult),
}

impl From<String> for ResourceOutput {
    fn from(text: String) -> Self {
        ResourceOutput::Text(text)
    }
}

impl From<&str> for ResourceOutput {
    fn from(text: &str) -> Self {
        ResourceOutput::Text(text.to_string())
    }
}

impl From<Vec<u8>> for ResourceOutput {
    fn from(bytes: Vec<u8>) -> Self {
        ResourceOutput::Blob(bytes)
    }
}

/// Resource handler trait - the core abstraction for resource reading
pub trait ResourceHandler: Send + Sync {
    /// Read the resource contents
    fn read(&self, ctx: ResourceContext) -> BoxFuture<'_, Result<ResourceOutput>>;
}

/// A registered resource: descriptor plus handler
#[derive(Clone)]
pub struct Resource {
    pub uri: String,
    pub name: String,
    pub description: Option<String>,
    pub mime_type: Option<String>,
    pub size: Option<u64>,
    pub meta: Option<Map<String, Value>>,
    handler: Arc<dyn ResourceHandler>,
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource")
            .field("uri", &self.uri)
            .field("name", &self.name)
            .field("mime_type", &self.mime_type)
            .finish_non_exhaustive()
    }
}

impl Resource {
    /// Create a new resource builder
    pub fn builder(uri: impl Into<String>) -> ResourceBuilder {
        ResourceBuilder::new(uri)
    }

    /// Get the resource definition for resources/list
    pub fn definition(&self) -> ResourceDefinition {
        ResourceDefinition {
            uri: self.uri.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            mime_type: self.mime_type.clone(),
            size: self.size,
            meta: self.meta.clone(),
        }
    }

    /// Read the resource and normalize the handler's output
    pub fn read(&self, client_id: &str) -> BoxFuture<'static, Result<ReadResourceResult>> {
        let handler = self.handler.clone();
        let uri = self.uri.clone();
        let mime_type = self.mime_type.clone();
        let ctx = ResourceContext {
            uri: uri.clone(),
            client_id: client_id.to_string(),
        };
        Box::pin(async move {
            let output = handler.read(ctx).await?;
            Ok(normalize(output, uri, mime_type))
        })
    }
}

fn normalize(output: ResourceOutput, uri: String, mime_type: Option<String>) -> ReadResourceResult {
    let content = match output {
        ResourceOutput::Contents(result) => return result,
        ResourceOutput::Text(text) => ResourceContent {
            uri,
            mime_type,
            text: Some(text),
            blob: None,
        },
        ResourceOutput::Blob(bytes) => ResourceContent {
            uri,
            mime_type,
            text: None,
            blob: Some(encode_base64(&bytes)),
        },
    };
    ReadResourceResult {
        contents: vec![content],
    }
}

/// Check that `uri` parses as an absolute URI (it has a scheme).
pub fn validate_uri(uri: &str) -> Result<()> {
    url::Url::parse(uri).map(|_| ()).map_err(|e| Error::InvalidUri {
        uri: uri.to_string(),
        reason: e.to_string(),
    })
}

/// Builder for creating resources
pub struct ResourceBuilder {
    uri: String,
    name: Option<String>,
    description: Option<String>,
    mime_type: Option<String>,
    size: Option<u64>,
    meta: Option<Map<String, Value>>,
}

impl ResourceBuilder {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            name: None,
            description: None,
            mime_type: None,
            size: None,
            meta: None,
        }
    }

    /// Display name. Defaults to the URI.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    pub fn size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn meta(mut self, key: impl Into<String>, value: Value) -> Self {
        self.meta
            .get_or_insert_with(Map::new)
            .insert(key.into(), value);
        self
    }

    /// Set the read handler and build. Fails if the URI is not absolute.
    pub fn handler<F, Fut>(self, handler: F) -> Result<Resource>
    where
        F: Fn(ResourceContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ResourceOutput>> + Send + 'static,
    {
        self.build_with(FnHandler { handler })
    }

    /// A resource with fixed text content. Size is filled in from the text.
    pub fn text(mut self, content: impl Into<String>) -> Result<Resource> {
        let content = content.into();
        self.size.get_or_insert(content.len() as u64);
        self.handler(move |_| {
            let content = content.clone();
            async move { Ok(ResourceOutput::Text(content)) }
        })
    }

    /// Build around a hand-written [`ResourceHandler`]
    pub fn build_with<H: ResourceHandler + 'static>(self, handler: H) -> Result<Resource> {
        validate_uri(&self.uri)?;
        Ok(Resource {
            name: self.name.unwrap_or_else(|| self.uri.clone()),
            uri: self.uri,
            description: self.description,
            mime_type: self.mime_type,
            size: self.size,
            meta: self.meta,
            handler: Arc::new(handler),
        })
    }
}

struct FnHandler<F> {
    handler: F,
}

impl<F, Fut> ResourceHandler for FnHandler<F>
where
    F: Fn(ResourceContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ResourceOutput>> + Send + 'static,
{
    fn read(&self, ctx: ResourceContext) -> BoxFuture<'_, Result<ResourceOutput>> {
        Box::pin((self.handler)(ctx))
    }
}
