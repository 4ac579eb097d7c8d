//! Tool definition and builder API
//!
//! Tools are registered explicitly at startup. Each one pairs a
//! [`ToolDefinition`] (what `tools/list` advertises) with a [`ToolHandler`]
//! (what `tools/call` invokes).
//!
//! ```rust
//! use mcp_relay::{ToolBuilder, ToolOutput};
//! use schemars::JsonSchema;
//! use serde::Deserialize;
//!
//! #[derive(Debug, Deserialize, JsonSchema)]
//! struct GreetInput {
//!     name: String,
//! }
//!
//! let tool = ToolBuilder::new("greet")
//!     .description("Greet someone by name")
//!     .handler(|input: GreetInput| async move {
//!         Ok(ToolOutput::text(format!("Hello, {}!", input.name)))
//!     })
//!     .build()
//!     .expect("valid tool name");
//!
//! assert_eq!(tool.name, "greet");
//! ```

use std::borrow::Cow;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

use schemars::{JsonSchema, Schema, SchemaGenerator};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, JsonRpcError, Result};
use crate::protocol::{CallToolResult, Content, RequestId, ToolDefinition};

/// A boxed future for tool handlers
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Per-invocation context handed to tool handlers.
#[derive(Debug, Clone)]
pub struct ToolContext {
    /// Id of the `tools/call` request being served
    pub request_id: RequestId,
    /// Session the request arrived on
    pub client_id: String,
    cancel: CancellationToken,
}

impl ToolContext {
    pub fn new(request_id: RequestId, client_id: impl Into<String>, cancel: CancellationToken) -> Self {
        Self {
            request_id,
            client_id: client_id.into(),
            cancel,
        }
    }

    /// Whether the client cancelled this request or went away
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the request is cancelled
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// What a tool handler produces.
///
/// Normalized into a [`CallToolResult`] before it is put on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutput {
    /// A single text block
    Text(String),
    /// Pretty-printed JSON text plus `structuredContent`
    Json(Value),
    /// A single content block of any kind
    Content(Content),
    /// Several content blocks, order preserved
    MultiContent(Vec<Content>),
    /// A fully formed result, passed through untouched
    Result(CallToolResult),
}

impl ToolOutput {
    pub fn text(text: impl Into<String>) -> Self {
        ToolOutput::Text(text.into())
    }

    pub fn into_call_result(self) -> CallToolResult {
        match self {
            ToolOutput::Text(text) => CallToolResult::text(text),
            ToolOutput::Json(value) => CallToolResult::json(value),
            ToolOutput::Content(block) => CallToolResult::content(vec![block]),
            ToolOutput::MultiContent(blocks) => CallToolResult::content(blocks),
            ToolOutput::Result(result) => result,
        }
    }
}

impl From<String> for ToolOutput {
    fn from(text: String) -> Self {
        ToolOutput::Text(text)
    }
}

impl From<&str> for ToolOutput {
    fn from(text: &str) -> Self {
        ToolOutput::Text(text.to_string())
    }
}

impl From<Content> for ToolOutput {
    fn from(content: Content) -> Self {
        ToolOutput::Content(content)
    }
}

impl From<Vec<Content>> for ToolOutput {
    fn from(content: Vec<Content>) -> Self {
        ToolOutput::MultiContent(content)
    }
}

impl From<CallToolResult> for ToolOutput {
    fn from(result: CallToolResult) -> Self {
        ToolOutput::Result(result)
    }
}

/// Marker input for tools that take no arguments.
///
/// Accepts `null`, a missing value or any object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NoParams;

impl<'de> serde::Deserialize<'de> for NoParams {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        match Option::<Value>::deserialize(deserializer)? {
            None | Some(Value::Null) | Some(Value::Object(_)) => Ok(NoParams),
            Some(other) => Err(serde::de::Error::custom(format!(
                "expected null or an object, got {}",
                other
            ))),
        }
    }
}

impl JsonSchema for NoParams {
    fn schema_name() -> Cow<'static, str> {
        Cow::Borrowed("NoParams")
    }

    fn json_schema(_generator: &mut SchemaGenerator) -> Schema {
        schemars::json_schema!({
            "type": "object"
        })
    }
}

/// Validate a tool name.
///
/// Tool names must be 1-128 characters of ASCII alphanumerics, underscore,
/// hyphen or dot.
pub fn validate_tool_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidToolName("name cannot be empty".to_string()));
    }
    if name.len() > 128 {
        return Err(Error::InvalidToolName(format!(
            "'{}' exceeds maximum length of 128 characters (got {})",
            name,
            name.len()
        )));
    }
    if let Some(invalid_char) = name
        .chars()
        .find(|c| !c.is_ascii_alphanumeric() && *c != '_' && *c != '-' && *c != '.')
    {
        return Err(Error::InvalidToolName(format!(
            "'{}' contains invalid character '{}'",
            name, invalid_char
        )));
    }
    Ok(())
}

/// Tool handler trait - the invocable half of a tool
pub trait ToolHandler: Send + Sync {
    /// Execute the tool with the given arguments
    fn call(&self, ctx: ToolContext, args: Value) -> BoxFuture<'_, Result<ToolOutput>>;

    /// Get the tool's input schema
    fn input_schema(&self) -> Value;
}

/// A registered tool: descriptor plus handler.
#[derive(Clone)]
pub struct Tool {
    /// Tool name (1-128 chars, alphanumeric/underscore/hyphen/dot only)
    pub name: String,
    pub description: Option<String>,
    pub output_schema: Option<Value>,
    pub meta: Option<Map<String, Value>>,
    input_schema: Value,
    handler: Arc<dyn ToolHandler>,
}

impl fmt::Debug for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tool")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("output_schema", &self.output_schema)
            .finish_non_exhaustive()
    }
}

impl Tool {
    /// Create a new tool builder
    pub fn builder(name: impl Into<String>) -> ToolBuilder {
        ToolBuilder::new(name)
    }

    /// Build a tool around a hand-written [`ToolHandler`]
    pub fn from_handler<H: ToolHandler + 'static>(name: impl Into<String>, handler: H) -> Result<Self> {
        ToolBuilder::new(name).build_with(handler)
    }

    /// Get the tool definition for tools/list
    pub fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name.clone(),
            description: self.description.clone(),
            input_schema: self.input_schema.clone(),
            output_schema: self.output_schema.clone(),
            meta: self.meta.clone(),
        }
    }

    pub fn input_schema(&self) -> &Value {
        &self.input_schema
    }

    /// Invoke the handler and normalize its output.
    ///
    /// Handler errors are returned as-is; the dispatcher turns them into
    /// JSON-RPC errors.
    pub fn call(&self, ctx: ToolContext, args: Value) -> BoxFuture<'static, Result<CallToolResult>> {
        let handler = self.handler.clone();
        Box::pin(async move {
            let output = handler.call(ctx, args).await?;
            Ok(output.into_call_result())
        })
    }
}

// =============================================================================
// Builder API
// =============================================================================

/// Builder for creating tools with a fluent API
pub struct ToolBuilder {
    name: String,
    description: Option<String>,
    output_schema: Option<Value>,
    meta: Option<Map<String, Value>>,
}

impl ToolBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            output_schema: None,
            meta: None,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// JSON Schema describing `structuredContent`
    pub fn output_schema(mut self, schema: Value) -> Self {
        self.output_schema = Some(schema);
        self
    }

    /// Add one entry to the tool's `_meta` bag
    pub fn meta(mut self, key: impl Into<String>, value: Value) -> Self {
        self.meta
            .get_or_insert_with(Map::new)
            .insert(key.into(), value);
        self
    }

    /// Specify input type and handler.
    ///
    /// The input schema is generated from `I`. Arguments that fail to
    /// deserialize into `I` are reported as invalid params.
    pub fn handler<I, F, Fut>(self, handler: F) -> ToolBuilderWithHandler<I, F>
    where
        I: JsonSchema + DeserializeOwned + Send + Sync + 'static,
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ToolOutput>> + Send + 'static,
    {
        ToolBuilderWithHandler {
            builder: self,
            handler,
            _phantom: PhantomData,
        }
    }

    /// Like [`handler`](Self::handler), but the handler also receives the
    /// [`ToolContext`] for cancellation and session identity.
    pub fn handler_with_context<I, F, Fut>(self, handler: F) -> ToolBuilderWithContextHandler<I, F>
    where
        I: JsonSchema + DeserializeOwned + Send + Sync + 'static,
        F: Fn(ToolContext, I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ToolOutput>> + Send + 'static,
    {
        ToolBuilderWithContextHandler {
            builder: self,
            handler,
            _phantom: PhantomData,
        }
    }

    /// Handler taking raw JSON arguments. Advertises `{"type": "object"}`.
    pub fn raw_handler<F, Fut>(self, handler: F) -> Result<Tool>
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ToolOutput>> + Send + 'static,
    {
        self.build_with(RawHandler { handler })
    }

    fn build_with<H: ToolHandler + 'static>(self, handler: H) -> Result<Tool> {
        validate_tool_name(&self.name)?;
        Ok(Tool {
            name: self.name,
            description: self.description,
            output_schema: self.output_schema,
            meta: self.meta,
            input_schema: handler.input_schema(),
            handler: Arc::new(handler),
        })
    }
}

/// Builder state after a typed handler is specified
pub struct ToolBuilderWithHandler<I, F> {
    builder: ToolBuilder,
    handler: F,
    _phantom: PhantomData<I>,
}

impl<I, F, Fut> ToolBuilderWithHandler<I, F>
where
    I: JsonSchema + DeserializeOwned + Send + Sync + 'static,
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ToolOutput>> + Send + 'static,
{
    /// Build the tool
    ///
    /// Returns an error if the tool name is invalid.
    pub fn build(self) -> Result<Tool> {
        self.builder.build_with(TypedHandler {
            handler: self.handler,
            _phantom: PhantomData,
        })
    }
}

/// Builder state after a context-aware handler is specified
pub struct ToolBuilderWithContextHandler<I, F> {
    builder: ToolBuilder,
    handler: F,
    _phantom: PhantomData<I>,
}

impl<I, F, Fut> ToolBuilderWithContextHandler<I, F>
where
    I: JsonSchema + DeserializeOwned + Send + Sync + 'static,
    F: Fn(ToolContext, I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ToolOutput>> + Send + 'static,
{
    pub fn build(self) -> Result<Tool> {
        self.builder.build_with(ContextAwareHandler {
            handler: self.handler,
            _phantom: PhantomData,
        })
    }
}

// =============================================================================
// Handler implementations
// =============================================================================

fn parse_input<I: DeserializeOwned>(args: Value) -> Result<I> {
    // Clients commonly omit `arguments` for no-arg tools
    let args = if args.is_null() {
        Value::Object(Map::new())
    } else {
        args
    };
    serde_json::from_value(args)
        .map_err(|e| JsonRpcError::invalid_params(format!("Invalid input: {}", e)).into())
}

fn schema_of<I: JsonSchema>() -> Value {
    let schema = schemars::schema_for!(I);
    serde_json::to_value(schema).unwrap_or_else(|_| {
        serde_json::json!({
            "type": "object"
        })
    })
}

/// Handler that deserializes input to a specific type
struct TypedHandler<I, F> {
    handler: F,
    _phantom: PhantomData<I>,
}

impl<I, F, Fut> ToolHandler for TypedHandler<I, F>
where
    I: JsonSchema + DeserializeOwned + Send + Sync + 'static,
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ToolOutput>> + Send + 'static,
{
    fn call(&self, _ctx: ToolContext, args: Value) -> BoxFuture<'_, Result<ToolOutput>> {
        Box::pin(async move {
            let input: I = parse_input(args)?;
            (self.handler)(input).await
        })
    }

    fn input_schema(&self) -> Value {
        schema_of::<I>()
    }
}

/// Handler that receives the tool context as well as typed input
struct ContextAwareHandler<I, F> {
    handler: F,
    _phantom: PhantomData<I>,
}

impl<I, F, Fut> ToolHandler for ContextAwareHandler<I, F>
where
    I: JsonSchema + DeserializeOwned + Send + Sync + 'static,
    F: Fn(ToolContext, I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ToolOutput>> + Send + 'static,
{
    fn call(&self, ctx: ToolContext, args: Value) -> BoxFuture<'_, Result<ToolOutput>> {
        Box::pin(async move {
            let input: I = parse_input(args)?;
            (self.handler)(ctx, input).await
        })
    }

    fn input_schema(&self) -> Value {
        schema_of::<I>()
    }
}

/// Handler that works with raw JSON
struct RawHandler<F> {
    handler: F,
}

impl<F, Fut> ToolHandler for RawHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ToolOutput>> + Send + 'static,
{
    fn call(&self, _ctx: ToolContext, args: Value) -> BoxFuture<'_, Result<ToolOutput>> {
        Box::pin((self.handler)(args))
    }

    fn input_schema(&self) -> Value {
        serde_json::json!({
            "type": "object"
        })
    }
}
