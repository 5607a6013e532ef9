use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use serde_json::{json, Value as JsonValue};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use graph_memory_mcp::config::{Config, LogFormat, LoggingConfig, Transport};
use graph_memory_mcp::tools::{call_tool, list_tools, AppContext, ToolDescriptor};
use graph_memory_mcp::ServiceError;

#[derive(Parser, Debug)]
#[command(name = "graph-memory-mcp", version, about = "MCP server for graph memory embeddings and extraction")]
struct Cli {
	/// JSON config file; the environment is used when absent
	#[arg(long, env = "GRAPH_MEMORY_CONFIG")]
	config: Option<PathBuf>,

	/// Transport to serve on
	#[arg(long, env = "SERVER_TRANSPORT", value_enum)]
	transport: Option<Transport>,

	/// Bind address for the HTTP transport
	#[arg(long, env = "HTTP_BIND")]
	bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
	let cli = Cli::parse();
	let mut config = Config::load(cli.config.as_deref())?;
	if let Some(transport) = cli.transport {
		config.server.transport = transport;
	}
	if let Some(bind) = cli.bind {
		config.server.bind = bind;
	}
	init_tracing(&config.logging);
	config.validate()?;
	info!(config = %config.summary(), "configuration loaded");

	let ctx = Arc::new(AppContext::new(config.clone())?);

	match config.server.transport {
		Transport::Stdio => {
			info!("Serving MCP over stdio");
			tokio::select! {
				_ = run_stdio(ctx.clone()) => info!("stdin closed"),
				_ = shutdown_signal() => {}
			}
		}
		Transport::Http => {
			let bind_addr: std::net::SocketAddr = config.server.bind.parse().context("invalid bind address")?;
			info!(%bind_addr, "Starting HTTP server");
			let listener = tokio::net::TcpListener::bind(bind_addr).await.context("bind failed")?;
			axum::serve(listener, build_router(ctx.clone()))
				.with_graceful_shutdown(shutdown_signal())
				.await
				.context("server error")?;
		}
	}

	ctx.shutdown();
	Ok(())
}

async fn shutdown_signal() {
	if let Err(err) = signal::ctrl_c().await {
		error!(%err, "failed to listen for shutdown signal");
		return;
	}
	info!("Shutdown signal received");
}

fn init_tracing(logging: &LoggingConfig) {
	let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
	// stdout is reserved for JSON-RPC frames
	let (text_layer, json_layer) = match logging.format {
		LogFormat::Text => (Some(fmt::layer().with_target(false).with_ansi(false).with_writer(std::io::stderr)), None),
		LogFormat::Json => (None, Some(fmt::layer().json().with_writer(std::io::stderr))),
	};
	let file_layer = logging.file_path.as_deref().map(|p| {
		let path = FsPath::new(p);
		let dir = path.parent().filter(|d| !d.as_os_str().is_empty()).unwrap_or_else(|| FsPath::new("."));
		let name = path.file_name().map(|n| n.to_os_string()).unwrap_or_else(|| "graph-memory-mcp.log".into());
		let appender = tracing_appender::rolling::daily(dir, name);
		fmt::layer().with_ansi(false).with_writer(appender)
	});
	tracing_subscriber::registry().with(env_filter).with(text_layer).with(json_layer).with(file_layer).init();
}

fn rpc_frame(id: JsonValue) -> JsonValue {
	json!({ "jsonrpc": "2.0", "id": id })
}

/// Handles one JSON-RPC line. `None` for notifications and unparseable input.
async fn handle_rpc(ctx: &AppContext, line: &str) -> Option<JsonValue> {
	let v: JsonValue = serde_json::from_str(line).ok()?;
	let id = v.get("id").filter(|id| !id.is_null())?.clone();
	let method = v.get("method").and_then(|m| m.as_str()).unwrap_or("");
	let params = v.get("params").cloned().unwrap_or_else(|| json!({}));
	let mut out = rpc_frame(id);
	match method {
		"initialize" => {
			out["result"] = json!({
				"serverInfo": {
					"name": "graph-memory-mcp",
					"version": env!("CARGO_PKG_VERSION"),
					"instructions": "Embedding and entity/relation extraction tools backed by Ollama."
				},
				"protocolVersion": "2024-11-05",
				"capabilities": { "tools": { "listChanged": false }, "logging": {} }
			});
		}
		"tools/list" => {
			out["result"] = json!({ "tools": list_tools() });
		}
		"tools/call" => {
			let name = params.get("name").and_then(|n| n.as_str()).unwrap_or("");
			let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));
			match call_tool(ctx, name, &arguments).await {
				Ok(json_val) => {
					let text_payload = serde_json::to_string_pretty(&json_val).unwrap_or_else(|_| json_val.to_string());
					out["result"] = json!({ "content": [ { "type": "text", "text": text_payload } ] });
				}
				Err(err) => {
					out["error"] = json!({ "code": -32000, "message": err.to_string(), "data": err.to_json()["error"] });
				}
			}
		}
		_ => {
			out["error"] = json!({ "code": -32601, "message": format!("Unknown method: {}", method) });
		}
	}
	Some(out)
}

async fn run_stdio(ctx: Arc<AppContext>) {
	let stdin = tokio::io::stdin();
	let mut reader = BufReader::new(stdin).lines();
	while let Ok(Some(line)) = reader.next_line().await {
		let line = line.trim();
		if line.is_empty() {
			continue;
		}
		if let Some(out) = handle_rpc(&ctx, line).await {
			match serde_json::to_string(&out) {
				Ok(frame) => println!("{frame}"),
				Err(err) => error!(%err, "failed to encode response frame"),
			}
		}
	}
}

fn status_for(err: &ServiceError) -> StatusCode {
	match err {
		ServiceError::UnknownTool(_) => StatusCode::NOT_FOUND,
		ServiceError::InvalidArguments(_) => StatusCode::BAD_REQUEST,
		ServiceError::Config { .. } => StatusCode::INTERNAL_SERVER_ERROR,
		_ => StatusCode::BAD_GATEWAY,
	}
}

fn json_error(err: &ServiceError) -> Response {
	(status_for(err), Json(err.to_json())).into_response()
}

async fn health(State(ctx): State<Arc<AppContext>>) -> Json<JsonValue> {
	Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION"), "uptime_secs": ctx.uptime_secs() }))
}

async fn list_tools_route() -> Json<Vec<ToolDescriptor>> {
	Json(list_tools())
}

async fn call_tool_route(State(ctx): State<Arc<AppContext>>, Path(name): Path<String>, body: Bytes) -> Response {
	let args: JsonValue = if body.is_empty() {
		json!({})
	} else {
		match serde_json::from_slice(&body) {
			Ok(v) => v,
			Err(e) => return json_error(&ServiceError::InvalidArguments(format!("body is not JSON: {e}"))),
		}
	};
	match call_tool(&ctx, &name, &args).await {
		Ok(v) => (StatusCode::OK, Json(v)).into_response(),
		Err(err) => json_error(&err),
	}
}

fn build_router(ctx: Arc<AppContext>) -> Router {
	Router::new()
		.route("/health", get(health))
		.route("/tools", get(list_tools_route))
		.route("/tools/:name", post(call_tool_route))
		.with_state(ctx)
		.layer(TraceLayer::new_for_http())
}
