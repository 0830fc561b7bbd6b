use crate::config::{apply_config_override, Config};
use crate::gate::{parse_flag, Gate, Intent};
use crate::marked_json::extract_marked_json;
use crate::protocol::{Request, Response, MCP_PROTOCOL_VERSION};
use crate::roots::RootsCache;
use crate::runtime::{clamp_timeout, RuntimeCommand, RuntimeContext, RuntimeRunner};
use anyhow::{anyhow, Result};
use opentelemetry::global;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::resource::Resource;
use opentelemetry_sdk::trace as sdktrace;
use opentelemetry_semantic_conventions::resource as semconv;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{info, info_span, Span};
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const SCHEMA_RESOURCE: &str = "kirby://schema/page-update";

/// Commands `kirby_cli` runs without confirmation when no allow list is set.
const READ_ONLY_COMMANDS: &[&str] = &[
	"help",
	"version",
	"roots",
	"mcp:roots",
	"mcp:blueprints",
	"mcp:blueprint",
	"mcp:routes",
	"mcp:page:content",
];

#[derive(Debug)]
struct ProtocolError {
	code: i64,
	message: String,
}

impl ProtocolError {
	fn new(code: i64, message: impl Into<String>) -> Self {
		Self {
			code,
			message: message.into()
		}
	}
}

impl std::fmt::Display for ProtocolError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", self.message)
	}
}

impl std::error::Error for ProtocolError {}

struct State {
	config: Config,
	runner: RuntimeRunner,
}

impl State {
	fn new(config: Config) -> Self {
		let cache = Arc::new(RootsCache::new(Duration::from_secs(config.roots_cache_ttl)));
		let runner = build_runner(&config, cache);
		Self { config, runner }
	}

	// The roots cache survives; its keys already separate projects and hosts.
	fn reconfigure(&mut self, config: Config) {
		let cache = self.runner.cache().clone();
		cache.set_ttl(Duration::from_secs(config.roots_cache_ttl));
		self.runner = build_runner(&config, cache);
		self.config = config;
	}
}

fn build_runner(config: &Config, cache: Arc<RootsCache>) -> RuntimeRunner {
	let cli = crate::process::CliRunner::new(config.project_root.clone());
	RuntimeRunner::new(cli, config.host.clone(), cache)
}

pub fn init_tracing(config: &Config) {
	let _ = global::set_error_handler(|_| {});
	let resource = Resource::new(
		vec![
		opentelemetry::KeyValue::new(semconv::SERVICE_NAME, config.otel_service_name.clone()),
		opentelemetry::KeyValue::new(semconv::SERVICE_VERSION, env!("CARGO_PKG_VERSION")),
		opentelemetry::KeyValue::new("mcp.session_id", config.session_id.clone()),
		opentelemetry::KeyValue::new("kirby.project_root", config.project_root.display().to_string()),
		]
	);
	let tracing_layer = if config.otel_enabled {
		let exporter = opentelemetry_otlp::new_exporter().tonic().with_endpoint(config.otel_endpoint.clone());
		let provider = opentelemetry_otlp::new_pipeline()
			.tracing()
			.with_exporter(exporter)
			.with_trace_config(sdktrace::Config::default().with_resource(resource))
			.install_batch(opentelemetry_sdk::runtime::Tokio)
			.ok();
		if let Some(provider) = provider {
			let tracer = provider.tracer(config.otel_service_name.clone());
			global::set_tracer_provider(provider);
			Some(OpenTelemetryLayer::new(tracer))
		}
		else {
			None
		}
	}
	else {
		None
	};
	// stdout carries the protocol.
	let fmt_layer = tracing_subscriber::fmt::layer()
		.with_target(false)
		.with_writer(std::io::stderr);
	let subscriber = tracing_subscriber::registry().with(fmt_layer);
	if let Some(layer) = tracing_layer {
		subscriber.with(layer).init();
	}
	else {
		subscriber.init();
	}
}

pub async fn run(config: Config) -> Result<()> {
	let stdin = io::stdin();
	let stdout = io::stdout();
	let mut reader = BufReader::new(stdin).lines();
	let mut writer = io::BufWriter::new(stdout);
	let mut state = State::new(config);
	info!(root = %state.config.project_root.display(), host = state.config.host.as_deref().unwrap_or(""), "kirby-mcp ready");
	while let Some(line) = reader.next_line().await? {
		if line.trim().is_empty() {
			continue;
		}
		let req: Request = match serde_json::from_str(&line) {
			Ok(req) => req,
			Err(err) => {
				let resp = Response::err(Value::Null, -32700, err.to_string());
				write_response(&mut writer, resp).await?;
				continue;
			}
		};
		if req.is_notification() {
			continue;
		}
		if req.method == "initialize" {
			if let Err(err) = apply_initialize_config(&mut state, &req) {
				let id = req.id.clone().unwrap_or(Value::Null);
				let resp = if let Some(protocol) = err.downcast_ref::<ProtocolError>() {
					Response::err(id, protocol.code, protocol.message.clone())
				}
				else {
					Response::err(id, -32000, err.to_string())
				};
				write_response(&mut writer, resp).await?;
				continue;
			}
		}
		let resp = handle_request(&state, req).await;
		write_response(&mut writer, resp).await?;
	}
	Ok(())
}

fn apply_initialize_config(state: &mut State, req: &Request) -> Result<()> {
	let Some(value) = req.params
		.get("capabilities")
		.and_then(|caps| caps.get("experimental"))
		.and_then(|exp| exp.get("configuration")) else {
		return Ok(());
	};
	let updated = apply_config_override(state.config.clone(), value)
		.map_err(|err| ProtocolError::new(-32602, err.to_string()))?;
	state.reconfigure(updated);
	Ok(())
}

struct ToolOutcome {
	value: Value,
	meta: Option<Value>,
}

async fn handle_request(state: &State, req: Request) -> Response {
	let id = req.id.clone().unwrap_or(Value::Null);
	let method = req.method.clone();
	let tool_name = extract_tool_name(&method, &req.params);
	let span = info_span!(
		"mcp.request",
		"mcp.session_id" = %state.config.session_id,
		"mcp.method" = %method,
		"mcp.tool_name" = tool_name.as_deref().unwrap_or(""),
		"kirby.project_root" = %state.config.project_root.display(),
		"kirby.host" = state.config.host.as_deref().unwrap_or(""),
		"mcp.is_error" = tracing::field::Empty,
		"mcp.error_code" = tracing::field::Empty,
		"mcp.exit_code" = tracing::field::Empty,
		"mcp.timed_out" = tracing::field::Empty,
		"mcp.response_bytes" = tracing::field::Empty,
	);
	let _guard = span.enter();
	match route(state, &req).await {
		Ok(outcome) => {
			record_result(&span, &outcome.value);
			Response::ok(id, outcome.value, outcome.meta)
		}
		Err(err) => {
			if let Some(protocol) = err.downcast_ref::<ProtocolError>() {
				Response::err(id, protocol.code, protocol.message.clone())
			}
			else {
				Response::err(id, -32000, err.to_string())
			}
		}
	}
}

async fn route(state: &State, req: &Request) -> Result<ToolOutcome> {
	match req.method.as_str() {
		"initialize" => Ok(
			ToolOutcome {
				value: json!({
					"protocolVersion": MCP_PROTOCOL_VERSION,
					"serverInfo": {
						"name": "kirby-mcp",
						"version": env!("CARGO_PKG_VERSION")
					},
					"configSchema": crate::config::config_schema(),
					"capabilities": {
						"resources": {
							"read": true,
							"list": true
						},
						"tools": {
							"list": true,
							"call": true
						}
					}
				}),
				meta: None
			}
		),
		"ping" => Ok(ToolOutcome {
			value: json!({}),
			meta: None
		}),
		"tools/list" => Ok(ToolOutcome {
			value: json!({
				"tools": tool_definitions(),
			}),
			meta: None
		}),
		"tools/call" => {
			let name = req.params
				.get("name")
				.and_then(Value::as_str)
				.ok_or_else(|| ProtocolError::new(-32602, "name is required"))?;
			let arguments = req.params
				.get("arguments")
				.cloned()
				.unwrap_or_else(|| json!({}));
			let meta = req.params
				.get("_meta")
				.cloned()
				.unwrap_or_else(|| json!({}));
			execute_tool(state, name, &arguments, &meta).await
		}
		"resources/list" => Ok(ToolOutcome {
			value: resources_list(),
			meta: None
		}),
		"resources/read" => Ok(ToolOutcome {
			value: resources_read(state, req).await?,
			meta: None
		}),
		_ => Err(ProtocolError::new(-32601, "method not found").into()),
	}
}

async fn run_tool<F, Fut>(name: &str, debug: bool, handler: F) -> ToolOutcome
where
	F: FnOnce() -> Fut,
	Fut: std::future::Future<Output = Result<Value>>, {
	match handler().await {
		Ok(structured) => ToolOutcome {
			value: tool_success(name, structured),
			meta: debug_meta(debug)
		},
		Err(err) => ToolOutcome {
			value: tool_error(&err),
			meta: None
		},
	}
}

fn resources_list() -> Value {
	json!({
		"resources": [
			{
				"uri": "kirby://roots",
				"name": "Kirby roots",
				"mimeType": "application/json"
			},
			{
				"uri": "kirby://commands",
				"name": "Kirby MCP runtime commands",
				"mimeType": "application/json"
			},
			{
				"uri": SCHEMA_RESOURCE,
				"name": "Page content update schema",
				"mimeType": "text/markdown"
			}
		]
	})
}

async fn resources_read(state: &State, req: &Request) -> Result<Value> {
	let uri = req.params
		.get("uri")
		.and_then(Value::as_str)
		.ok_or_else(|| ProtocolError::new(-32602, "uri is required"))?;
	let (mime, text) = match uri {
		"kirby://roots" => {
			let context = state.runner.context().await;
			("application/json", serde_json::to_string_pretty(&roots_output(&context))?)
		}
		"kirby://commands" => {
			let context = state.runner.context().await;
			("application/json", serde_json::to_string_pretty(&commands_output(state, &context))?)
		}
		SCHEMA_RESOURCE => ("text/markdown", page_update_schema().to_string()),
		_ => return Err(ProtocolError::new(-32000, "resource not found").into()),
	};
	Ok(json!({
		"contents": [
			{
				"uri": uri,
				"mimeType": mime,
				"text": text
			}
		]
	}))
}

fn page_update_schema() -> &'static str {
	"# Updating page content\n\n\
	`kirby_update_page_content` takes `id` (page id, e.g. `blog/hello`) and `data`, an object of field name to value.\n\n\
	- Only the fields present in `data` are written; other fields keep their value.\n\
	- Plain fields (text, textarea, date, toggle, select) take strings exactly as stored in the content file.\n\
	- Structure fields take an array of objects, one per row, keyed by the structure's field names.\n\
	- Blocks fields take an array of `{ \"type\": \"...\", \"content\": { ... } }` objects; every block needs a `type` defined in the blueprint.\n\
	- Layout fields take an array of rows, each with `columns` holding `width` and `blocks`.\n\
	- Pages/files/users fields take an array of ids or uuids.\n\n\
	Call with `validated: true` once the payload matches the page's blueprint, first without `confirm` to preview the change, then with `confirm: true` to write it.\n"
}

fn roots_output(context: &RuntimeContext) -> Value {
	let mut output = json!({
		"ok": context.inspection_error.is_none(),
		"projectRoot": context.project_root.to_string_lossy(),
		"host": context.host,
		"commandsRoot": context.commands_root.to_string_lossy(),
		"roots": context.roots.roots,
	});
	if let Some(obj) = output.as_object_mut() {
		if let Some(error) = &context.inspection_error {
			obj.insert("inspectionError".to_string(), Value::String(error.clone()));
			obj.insert("code".to_string(), json!(context.inspection_code.unwrap_or("EXECUTION_ERROR")));
			obj.insert("usingDefaults".to_string(), Value::Bool(true));
		}
		if let Some(cli) = &context.roots.cli {
			obj.insert("cli".to_string(), json!({
				"exitCode": cli.exit_code,
				"timedOut": cli.timed_out
			}));
		}
	}
	output
}

fn commands_output(state: &State, context: &RuntimeContext) -> Value {
	let commands: Vec<Value> = RuntimeCommand::ALL
		.iter()
		.map(|command| {
			let path = context.commands_root.join(command.wrapper_path());
			json!({
				"command": command.cli_name(),
				"wrapper": command.wrapper_path(),
				"path": path.to_string_lossy(),
				"installed": path.is_file(),
				"mutating": command.mutating(),
			})
		})
		.collect();
	let installed = commands.iter()
		.filter(|command| command.get("installed").and_then(Value::as_bool).unwrap_or(false))
		.count();
	let cli_binary = match state.runner.cli().binary() {
		Ok(path) => json!({ "path": path.to_string_lossy() }),
		Err(err) => json!({ "error": err.to_string() }),
	};
	json!({
		"ok": true,
		"commandsRoot": context.commands_root.to_string_lossy(),
		"commands": commands,
		"installedCount": installed,
		"allInstalled": installed == RuntimeCommand::ALL.len(),
		"cliBinary": cli_binary,
	})
}

fn tool_success(name: &str, structured: Value) -> Value {
	let message = tool_message(name, &structured);
	json!({
		"structuredContent": structured,
		"content": [
			{
				"type": "text",
				"text": message
			}
		]
	})
}

fn tool_error(err: &anyhow::Error) -> Value {
	let message = err.to_string();
	let code = error_code(&message);
	json!({
		"isError": true,
		"structuredContent": {
			"ok": false,
			"code": code,
			"error": message
		},
		"content": [
			{
				"type": "text",
				"text": message
			}
		]
	})
}

fn tool_message(name: &str, structured: &Value) -> String {
	if let Some(message) = structured.get("message").and_then(Value::as_str) {
		return message.to_string();
	}
	if structured.get("parseError").is_some() {
		return "The Kirby CLI returned no readable result.".to_string();
	}
	match name {
		"kirby_roots" => {
			let count = structured.get("roots")
				.and_then(Value::as_object)
				.map(|roots| roots.len())
				.unwrap_or(0);
			format!("Resolved {} root(s).", count)
		}
		"kirby_runtime_status" => {
			let installed = structured.get("installedCount").and_then(Value::as_u64).unwrap_or(0);
			format!("{} of {} runtime command(s) installed.", installed, RuntimeCommand::ALL.len())
		}
		"kirby_read_page_content" => {
			let id = structured.get("id").and_then(Value::as_str).unwrap_or("page");
			format!("Read content of {}.", id)
		}
		"kirby_update_page_content" => {
			let id = structured.get("id").and_then(Value::as_str).unwrap_or("page");
			format!("Updated content of {}.", id)
		}
		"kirby_cli" => {
			let exit_code = structured.get("exitCode").and_then(Value::as_i64).unwrap_or(-1);
			format!("Kirby CLI exited with code {}.", exit_code)
		}
		"kirby_cache_clear" => "Cleared the roots cache.".to_string(),
		_ => "Completed tool call.".to_string(),
	}
}

fn error_code(message: &str) -> &'static str {
	let lower = message.to_lowercase();
	if lower.contains("kirby cli not found") {
		"CLI_NOT_FOUND"
	}
	else if lower.contains("id is required") {
		"MISSING_ID"
	}
	else if lower.contains("data is required") {
		"MISSING_DATA"
	}
	else if lower.contains("data must be an object") {
		"INVALID_DATA"
	}
	else if lower.contains("code is required") {
		"MISSING_CODE"
	}
	else if lower.contains("query is required") {
		"MISSING_QUERY"
	}
	else if lower.contains("command is required") {
		"MISSING_COMMAND"
	}
	else if lower.contains("command not allowed") {
		"COMMAND_NOT_ALLOWED"
	}
	else if lower.contains("args must be") {
		"INVALID_ARGS"
	}
	else {
		"EXECUTION_ERROR"
	}
}

fn debug_meta(debug: bool) -> Option<Value> {
	if debug {
		Some(json!({ "debug": true }))
	}
	else {
		None
	}
}

fn required_str<'a>(args: &'a Value, key: &str) -> Result<&'a str> {
	args.get(key)
		.and_then(Value::as_str)
		.map(str::trim)
		.filter(|value| !value.is_empty())
		.ok_or_else(|| anyhow!("{} is required", key))
}

fn parse_timeout(args: &Value) -> Option<u64> {
	args.get("timeout").and_then(Value::as_u64)
}

fn parse_string_args(args: &Value) -> Result<Vec<String>> {
	let Some(value) = args.get("args") else {
		return Ok(Vec::new());
	};
	let items = value.as_array().ok_or_else(|| anyhow!("args must be an array of strings"))?;
	items.iter()
		.map(|item| item.as_str().map(str::to_string).ok_or_else(|| anyhow!("args must be an array of strings")))
		.collect()
}

fn pattern_matches(pattern: &str, command: &str) -> bool {
	match pattern.strip_suffix('*') {
		Some(prefix) => command.starts_with(prefix),
		None => pattern == command,
	}
}

/// Deny wins; with an empty allow list only the read-only built-ins pass.
fn cli_command_allowed(config: &Config, command: &str) -> bool {
	if config.cli_deny.iter().any(|pattern| pattern_matches(pattern, command)) {
		return false;
	}
	if config.cli_allow.is_empty() {
		return READ_ONLY_COMMANDS.contains(&command);
	}
	config.cli_allow.iter().any(|pattern| pattern_matches(pattern, command))
}

fn content_changes(current: &Map<String, Value>, requested: &Map<String, Value>) -> Value {
	let mut changed = Vec::new();
	let mut added = Vec::new();
	let mut unchanged = Vec::new();
	let mut before = Map::new();
	let mut after = Map::new();
	for (key, value) in requested {
		match current.get(key) {
			Some(existing) if existing == value => unchanged.push(key.clone()),
			Some(existing) => {
				changed.push(key.clone());
				before.insert(key.clone(), existing.clone());
				after.insert(key.clone(), value.clone());
			}
			None => {
				added.push(key.clone());
				after.insert(key.clone(), value.clone());
			}
		}
	}
	let before_text = serde_json::to_string_pretty(&Value::Object(before)).unwrap_or_default();
	let after_text = serde_json::to_string_pretty(&Value::Object(after)).unwrap_or_default();
	let diff = similar::TextDiff::from_lines(&before_text, &after_text)
		.unified_diff()
		.context_radius(3)
		.header("current", "requested")
		.to_string();
	json!({
		"changedKeys": changed,
		"addedKeys": added,
		"unchangedKeys": unchanged,
		"diff": diff,
	})
}

async fn update_page_content(
	state: &State,
	args: &Value,
	debug: bool) -> Result<Value> {
	let id = required_str(args, "id")?.to_string();
	let data = args.get("data").ok_or_else(|| anyhow!("data is required"))?;
	let data = data.as_object().ok_or_else(|| anyhow!("data must be an object"))?;
	let timeout = parse_timeout(args);
	let gate = Gate {
		capability: "kirby_update_page_content",
		enabled: true,
		enable_hint: "",
		schema_resource: Some(SCHEMA_RESOURCE)
	};
	gate.guard(
		Intent::from_args(args),
		|| async {
			let read = state.runner.run(RuntimeCommand::PageContent, &[id.clone()], timeout).await?;
			if !read.installed {
				return Ok(json!({
					"id": id,
					"current": Value::Null,
					"read": read.needs_runtime_install_response()
				}));
			}
			let content = read.payload
				.as_ref()
				.and_then(|payload| payload.get("content"))
				.and_then(Value::as_object);
			let Some(content) = content else {
				return Ok(json!({
					"id": id,
					"current": Value::Null,
					"read": read.to_response(debug)
				}));
			};
			let mut preview = content_changes(content, data);
			if let Some(obj) = preview.as_object_mut() {
				obj.insert("id".to_string(), Value::String(id.clone()));
			}
			Ok(preview)
		},
		|| async {
			let payload = serde_json::to_string(&Value::Object(data.clone()))?;
			let args = vec![id.clone(), "--data".to_string(), payload];
			let result = state.runner.run(RuntimeCommand::PageUpdate, &args, timeout).await?;
			Ok(result.to_response(debug))
		}
	).await
}

async fn run_runtime(
	state: &State,
	command: RuntimeCommand,
	args: &[String],
	timeout: Option<u64>,
	debug: bool) -> Result<Value> {
	let result = state.runner.run(command, args, timeout).await?;
	Ok(result.to_response(debug))
}

async fn kirby_cli(state: &State, args: &Value, debug: bool) -> Result<Value> {
	let command = required_str(args, "command")?.to_string();
	let extra = parse_string_args(args)?;
	if !cli_command_allowed(&state.config, &command) {
		return Err(anyhow!("command not allowed: {} (see cli.allow / cli.deny)", command));
	}
	let timeout = clamp_timeout(parse_timeout(args));
	let execute = || async {
		let mut argv = vec![command.clone()];
		argv.extend(extra.iter().cloned());
		let output = state.runner.cli().run(&argv, &state.runner.env(), timeout).await?;
		let mut response = json!({
			"ok": output.exit_code == 0 && !output.timed_out,
			"command": command,
			"exitCode": output.exit_code,
			"timedOut": output.timed_out,
			"stdout": output.stdout,
			"stderr": output.stderr,
		});
		if let Some(obj) = response.as_object_mut() {
			if let Ok(payload) = extract_marked_json(&output.stdout) {
				obj.insert("payload".to_string(), payload);
			}
			if debug {
				obj.insert("durationMs".to_string(), json!(output.duration_ms));
			}
		}
		Ok(response)
	};
	if READ_ONLY_COMMANDS.contains(&command.as_str()) {
		return execute().await;
	}
	Gate::always_enabled("kirby_cli").guard(
		Intent::from_args(args),
		|| async {
			Ok(json!({
				"command": command,
				"args": extra,
				"cwd": state.runner.project_root().to_string_lossy(),
			}))
		},
		execute
	).await
}

async fn execute_tool(
	state: &State,
	name: &str,
	arguments: &Value,
	meta: &Value) -> Result<ToolOutcome> {
	let params = arguments.as_object().ok_or_else(|| ProtocolError::new(-32602, "arguments must be an object"))?;
	let args = Value::Object(params.clone());
	let debug = state.config.debug || parse_flag(meta.get("debug"));
	let timeout = parse_timeout(&args);
	let eval_gate = |capability: &'static str| Gate {
		capability,
		enabled: state.config.eval_enabled,
		enable_hint: "Enable it with eval.enabled in .kirby-mcp/mcp.json, KIRBY_MCP_ENABLE_EVAL=1 or --enable-eval.",
		schema_resource: None
	};
	let result = match name {
		"kirby_roots" => run_tool(name, debug, || async {
			let context = if parse_flag(args.get("refresh")) {
				state.runner.refresh_context().await
			}
			else {
				state.runner.context().await
			};
			let mut output = roots_output(&context);
			if let Some(obj) = output.as_object_mut() {
				obj.insert("cacheTtlSeconds".to_string(), json!(state.runner.cache().ttl().as_secs()));
			}
			Ok(output)
		}).await,
		"kirby_runtime_status" => run_tool(name, debug, || async {
			let context = state.runner.context().await;
			Ok(commands_output(state, &context))
		}).await,
		"kirby_blueprints" => run_tool(name, debug, || async {
			run_runtime(state, RuntimeCommand::Blueprints, &[], timeout, debug).await
		}).await,
		"kirby_blueprint_read" => run_tool(name, debug, || async {
			let id = required_str(&args, "id")?.to_string();
			run_runtime(state, RuntimeCommand::Blueprint, &[id], timeout, debug).await
		}).await,
		"kirby_routes" => run_tool(name, debug, || async {
			run_runtime(state, RuntimeCommand::Routes, &[], timeout, debug).await
		}).await,
		"kirby_read_page_content" => run_tool(name, debug, || async {
			let id = required_str(&args, "id")?.to_string();
			run_runtime(state, RuntimeCommand::PageContent, &[id], timeout, debug).await
		}).await,
		"kirby_update_page_content" => run_tool(name, debug, || async {
			update_page_content(state, &args, debug).await
		}).await,
		"kirby_eval" => run_tool(name, debug, || async {
			let code = required_str(&args, "code")?.to_string();
			eval_gate("kirby_eval").guard(
				Intent::from_args(&args),
				|| async {
					Ok(json!({
						"code": code,
						"bytes": code.len(),
					}))
				},
				|| async { run_runtime(state, RuntimeCommand::Eval, &[code.clone()], timeout, debug).await }
			).await
		}).await,
		"kirby_query" => run_tool(name, debug, || async {
			let query = required_str(&args, "query")?.to_string();
			let model = args.get("model")
				.and_then(Value::as_str)
				.map(str::to_string);
			eval_gate("kirby_query").guard(
				Intent::from_args(&args),
				|| async {
					Ok(json!({
						"query": query,
						"model": model,
					}))
				},
				|| async {
					let mut argv = vec![query.clone()];
					if let Some(model) = &model {
						argv.push(format!("--model={}", model));
					}
					run_runtime(state, RuntimeCommand::Query, &argv, timeout, debug).await
				}
			).await
		}).await,
		"kirby_cli" => run_tool(name, debug, || async { kirby_cli(state, &args, debug).await }).await,
		"kirby_cache_clear" => run_tool(name, debug, || async {
			let cleared = state.runner.cache().len();
			state.runner.cache().clear();
			Ok(json!({
				"ok": true,
				"cleared": cleared
			}))
		}).await,
		_ => return Err(ProtocolError::new(-32601, "unknown tool").into()),
	};
	Ok(result)
}

fn tool_definitions() -> Vec<Value> {
	let timeout = json!({
		"type": "integer",
		"minimum": 1,
		"maximum": crate::runtime::MAX_TIMEOUT_SECS,
		"description": "Seconds before the Kirby CLI is killed. Clamped to the server's bounds."
	});
	let confirm = json!({ "type": "boolean", "description": "Apply the change. Without it the call only returns a preview." });
	vec![
	json!({
		"name": "kirby_roots",
		"description": "resolved Kirby roots (content, site, templates, blueprints, commands, ...)",
		"annotations": { "readOnlyHint": true, "group": "runtime" },
		"inputSchema": {
			"type": "object",
			"properties": {
				"refresh": { "type": "boolean", "description": "Re-inspect instead of using the cached roots." }
			},
			"additionalProperties": false
		}
	}),
	json!({
		"name": "kirby_runtime_status",
		"description": "which Kirby MCP runtime command wrappers are installed in the project",
		"annotations": { "readOnlyHint": true, "group": "runtime" },
		"inputSchema": { "type": "object", "properties": {}, "additionalProperties": false }
	}),
	json!({
		"name": "kirby_blueprints",
		"description": "list blueprints known to the running Kirby instance",
		"annotations": { "readOnlyHint": true, "group": "blueprints" },
		"inputSchema": {
			"type": "object",
			"properties": { "timeout": timeout },
			"additionalProperties": false
		}
	}),
	json!({
		"name": "kirby_blueprint_read",
		"description": "read one resolved blueprint (extends and mixins applied)",
		"annotations": { "readOnlyHint": true, "group": "blueprints" },
		"inputSchema": {
			"type": "object",
			"properties": {
				"id": { "type": "string", "description": "Blueprint id, e.g. pages/article." },
				"timeout": timeout
			},
			"required": ["id"],
			"additionalProperties": false
		}
	}),
	json!({
		"name": "kirby_routes",
		"description": "list registered routes",
		"annotations": { "readOnlyHint": true, "group": "routes" },
		"inputSchema": {
			"type": "object",
			"properties": { "timeout": timeout },
			"additionalProperties": false
		}
	}),
	json!({
		"name": "kirby_read_page_content",
		"description": "read a page's current content fields",
		"annotations": { "readOnlyHint": true, "group": "content" },
		"inputSchema": {
			"type": "object",
			"properties": {
				"id": { "type": "string", "description": "Page id, e.g. blog/hello." },
				"timeout": timeout
			},
			"required": ["id"],
			"additionalProperties": false
		}
	}),
	json!({
		"name": "kirby_update_page_content",
		"description": "update page content fields; previews unless confirm=true and requires validated=true after reading kirby://schema/page-update",
		"annotations": { "destructiveHint": true, "group": "content" },
		"inputSchema": {
			"type": "object",
			"properties": {
				"id": { "type": "string", "description": "Page id." },
				"data": { "type": "object", "description": "Field name to new value." },
				"validated": { "type": "boolean", "description": "Set after checking data against kirby://schema/page-update." },
				"confirm": confirm,
				"timeout": timeout
			},
			"required": ["id", "data"],
			"additionalProperties": false
		}
	}),
	json!({
		"name": "kirby_eval",
		"description": "evaluate PHP inside the Kirby runtime (must be enabled; previews unless confirm=true)",
		"annotations": { "destructiveHint": true, "group": "runtime" },
		"inputSchema": {
			"type": "object",
			"properties": {
				"code": { "type": "string", "description": "PHP code; the value of the last return statement is reported." },
				"confirm": confirm,
				"timeout": timeout
			},
			"required": ["code"],
			"additionalProperties": false
		}
	}),
	json!({
		"name": "kirby_query",
		"description": "evaluate a Kirby query language expression (must be enabled; previews unless confirm=true)",
		"annotations": { "destructiveHint": true, "group": "runtime" },
		"inputSchema": {
			"type": "object",
			"properties": {
				"query": { "type": "string", "description": "Query, e.g. site.children.listed.count." },
				"model": { "type": "string", "description": "Optional page id used as the query's model." },
				"confirm": confirm,
				"timeout": timeout
			},
			"required": ["query"],
			"additionalProperties": false
		}
	}),
	json!({
		"name": "kirby_cli",
		"description": "run a Kirby CLI command allowed by cli.allow/cli.deny; non read-only commands need confirm=true",
		"annotations": { "group": "runtime" },
		"inputSchema": {
			"type": "object",
			"properties": {
				"command": { "type": "string", "description": "Kirby CLI command name." },
				"args": { "type": "array", "items": { "type": "string" } },
				"confirm": confirm,
				"timeout": timeout
			},
			"required": ["command"],
			"additionalProperties": false
		}
	}),
	json!({
		"name": "kirby_cache_clear",
		"description": "drop all cached roots so the next call re-inspects the project",
		"annotations": { "group": "runtime" },
		"inputSchema": { "type": "object", "properties": {}, "additionalProperties": false }
	})
	]
}

fn extract_tool_name(method: &str, params: &Value) -> Option<String> {
	if method != "tools/call" {
		return None;
	}
	params.get("name")
		.and_then(Value::as_str)
		.map(|value| value.to_string())
}

fn record_result(span: &Span, result: &Value) {
	let response_bytes = serde_json::to_string(result).map(|value| value.len() as u64).ok();
	if let Some(bytes) = response_bytes {
		span.record("mcp.response_bytes", bytes);
	}
	let is_error = result.get("isError")
		.and_then(Value::as_bool)
		.unwrap_or(false);
	span.record("mcp.is_error", is_error);
	let Some(structured) = result.get("structuredContent") else {
		return;
	};
	if let Some(code) = structured.get("code").and_then(Value::as_str) {
		span.record("mcp.error_code", code);
	}
	if let Some(cli) = structured.get("cli") {
		if let Some(exit_code) = cli.get("exitCode").and_then(Value::as_i64) {
			span.record("mcp.exit_code", exit_code);
		}
		if let Some(timed_out) = cli.get("timedOut").and_then(Value::as_bool) {
			span.record("mcp.timed_out", timed_out);
		}
	}
}

async fn write_response(writer: &mut io::BufWriter<io::Stdout>, resp: Response) -> Result<()> {
	let line = serde_json::to_string(&resp)?;
	writer.write_all(line.as_bytes()).await?;
	writer.write_all(b"\n").await?;
	writer.flush().await?;
	Ok(())
}
