use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use clap::Parser;
use mcp_relay::protocol::Content;
use mcp_relay::{
    Backplane, BoxError, ClientStateCodec, HttpTransport, InMemoryQueueService, InstanceId,
    McpRouter, MessageDispatcher, NoParams, Registry, RelayConfig, ResourceBuilder,
    SessionManager, ToolBuilder, ToolOutput,
};
use schemars::JsonSchema;
use serde::Deserialize;
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(name = "mcp-relay")]
#[command(about = "Serve MCP tools and resources over SSE and streamable HTTP")]
#[command(long_about = "Serves a small demo registry over legacy SSE and streamable HTTP.\n\n\
Environment Variables:\n\
  MCP_RELAY_INSTANCE_ID              Identity of this process (default: <hostname>-<pid>)\n\
  MCP_RELAY_CLIENT_STATE_KEY         Secret for encrypted client state tokens\n\
  MCP_RELAY_ENABLE_SSE               Mount GET /sse and POST /message (default: true)\n\
  MCP_RELAY_ENABLE_STREAMABLE_HTTP   Mount POST /mcp (default: true)\n\
  MCP_RELAY_BASE_PATH                Prefix for every route\n\
  RUST_LOG                           Overrides --log-level")]
struct Args {
    #[arg(short, long, default_value = "mcp-relay.toml", help = "TOML configuration file")]
    config: PathBuf,

    #[arg(short, long, default_value = "127.0.0.1:3000", help = "Address to listen on")]
    bind: String,

    #[arg(long, default_value = "info", help = "Log level for mcp_relay")]
    log_level: String,

    #[arg(long, help = "Override the instance id")]
    instance_id: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct EchoInput {
    /// Text to send back
    message: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct AddInput {
    a: f64,
    b: f64,
}

fn demo_registry(config: &RelayConfig, instance_id: &InstanceId) -> mcp_relay::Result<Registry> {
    let echo = ToolBuilder::new("echo")
        .description("Echo a message back")
        .handler(|input: EchoInput| async move { Ok(ToolOutput::text(input.message)) })
        .build()?;

    let add = ToolBuilder::new("add")
        .description("Add two numbers")
        .handler(|input: AddInput| async move {
            Ok(ToolOutput::Json(serde_json::json!({ "sum": input.a + input.b })))
        })
        .build()?;

    let instance = instance_id.to_string();
    let server_time = ToolBuilder::new("server-time")
        .description("Current server time and the instance that answered")
        .handler(move |_: NoParams| {
            let instance = instance.clone();
            async move {
                let now = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs())
                    .unwrap_or_default();
                Ok(ToolOutput::MultiContent(vec![
                    Content::text(format!("unix time: {}", now)),
                    Content::text(format!("instance: {}", instance)),
                ]))
            }
        })
        .build()?;

    let server_info = serde_json::json!({
        "name": config.server_name,
        "version": config.server_version,
        "instanceId": instance_id,
        "sse": config.enable_sse,
        "streamableHttp": config.enable_streamable_http,
    });
    let server_resource = ResourceBuilder::new("config://server")
        .name("Server configuration")
        .description("Non-secret settings of this instance")
        .mime_type("application/json")
        .text(serde_json::to_string_pretty(&server_info)?)?;

    Registry::new()
        .with_tool(echo)?
        .with_tool(add)?
        .with_tool(server_time)?
        .with_resource(server_resource)
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let args = Args::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("mcp_relay={}", args.log_level))
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let mut config = RelayConfig::load_from_path(&args.config)?.apply_env()?;
    if let Some(id) = args.instance_id {
        config.instance_id = Some(InstanceId::new(id));
    }
    config.validate()?;

    let instance_id = config.resolve_instance_id();
    let codec = Arc::new(ClientStateCodec::new(config.client_state_key.as_ref())?);
    tracing::info!(
        instance_id = %instance_id,
        encrypted_tokens = codec.encrypts(),
        "Starting MCP relay"
    );

    let sessions = Arc::new(
        SessionManager::new(instance_id.clone(), codec)
            .inbound_capacity(config.inbound_queue_capacity),
    );

    let registry = demo_registry(&config, &instance_id)?;
    let mut router = McpRouter::new(Arc::new(registry))
        .server_info(config.server_name.clone(), config.server_version.clone());
    if let Some(instructions) = &config.instructions {
        router = router.instructions(instructions.clone());
    }

    let backplane = Arc::new(Backplane::new(
        instance_id,
        Arc::new(InMemoryQueueService::new()),
        config.backplane.clone(),
    ));
    let dispatcher = Arc::new(MessageDispatcher::new(sessions, router).backplane(backplane.clone()));

    let (relay_tx, relay_rx) = mpsc::channel(config.inbound_queue_capacity);
    tokio::spawn({
        let backplane = backplane.clone();
        async move {
            if let Err(e) = backplane.run(relay_tx).await {
                tracing::error!(error = %e, "Backplane consumer failed");
            }
        }
    });
    tokio::spawn({
        let dispatcher = dispatcher.clone();
        async move { dispatcher.deliver_remote(relay_rx).await }
    });

    HttpTransport::from_config(dispatcher, &config)
        .serve(&args.bind, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            }
        })
        .await?;

    backplane.shutdown().await;
    tracing::info!("MCP relay stopped");
    Ok(())
}
