use crate::marked_json::extract_marked_json;
use crate::process::{CliOutput, CliRunner, ProcessError};
use crate::roots::{
	default_roots,
	inspect_roots,
	CacheKey,
	RootsCache,
	RootsError,
	RootsInspection,
};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub const HOST_ENV: &str = "KIRBY_HOST";
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;
pub const MIN_TIMEOUT_SECS: u64 = 1;
pub const MAX_TIMEOUT_SECS: u64 = 120;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RuntimeCommand {
	Roots,
	Blueprints,
	Blueprint,
	Routes,
	PageContent,
	PageUpdate,
	Eval,
	Query,
}

impl RuntimeCommand {
	pub const ALL: [RuntimeCommand; 8] = [
		RuntimeCommand::Roots,
		RuntimeCommand::Blueprints,
		RuntimeCommand::Blueprint,
		RuntimeCommand::Routes,
		RuntimeCommand::PageContent,
		RuntimeCommand::PageUpdate,
		RuntimeCommand::Eval,
		RuntimeCommand::Query,
	];

	pub fn cli_name(self) -> &'static str {
		match self {
			RuntimeCommand::Roots => "mcp:roots",
			RuntimeCommand::Blueprints => "mcp:blueprints",
			RuntimeCommand::Blueprint => "mcp:blueprint",
			RuntimeCommand::Routes => "mcp:routes",
			RuntimeCommand::PageContent => "mcp:page:content",
			RuntimeCommand::PageUpdate => "mcp:page:update",
			RuntimeCommand::Eval => "mcp:eval",
			RuntimeCommand::Query => "mcp:query",
		}
	}

	pub fn wrapper_path(self) -> &'static str {
		match self {
			RuntimeCommand::Roots => "mcp/roots.php",
			RuntimeCommand::Blueprints => "mcp/blueprints.php",
			RuntimeCommand::Blueprint => "mcp/blueprint.php",
			RuntimeCommand::Routes => "mcp/routes.php",
			RuntimeCommand::PageContent => "mcp/page/content.php",
			RuntimeCommand::PageUpdate => "mcp/page/update.php",
			RuntimeCommand::Eval => "mcp/eval.php",
			RuntimeCommand::Query => "mcp/query.php",
		}
	}

	pub fn mutating(self) -> bool {
		matches!(self, RuntimeCommand::PageUpdate | RuntimeCommand::Eval | RuntimeCommand::Query)
	}
}

pub fn clamp_timeout(requested: Option<u64>) -> Duration {
	let secs = requested.unwrap_or(DEFAULT_TIMEOUT_SECS).clamp(MIN_TIMEOUT_SECS, MAX_TIMEOUT_SECS);
	Duration::from_secs(secs)
}

#[derive(Clone, Debug)]
pub struct RuntimeContext {
	pub project_root: PathBuf,
	pub host: Option<String>,
	pub roots: Arc<RootsInspection>,
	pub commands_root: PathBuf,
	/// Set when the roots could not be inspected and stock defaults are in use.
	pub inspection_error: Option<String>,
	pub inspection_code: Option<&'static str>,
}

#[derive(Clone, Debug)]
pub struct RuntimeResult {
	pub project_root: PathBuf,
	pub host: Option<String>,
	pub commands_root: PathBuf,
	pub expected_wrapper: PathBuf,
	pub installed: bool,
	pub cli: Option<CliOutput>,
	pub payload: Option<Map<String, Value>>,
	pub parse_error: Option<String>,
}

impl RuntimeResult {
	pub fn timed_out(&self) -> bool {
		self.cli.as_ref().map(|cli| cli.timed_out).unwrap_or(false)
	}

	pub fn payload_ok(&self) -> bool {
		self.payload
			.as_ref()
			.and_then(|payload| payload.get("ok"))
			.and_then(Value::as_bool)
			.unwrap_or(false)
	}

	pub fn needs_runtime_install_response(&self) -> Value {
		json!({
			"ok": false,
			"needsRuntimeInstall": true,
			"message": "Kirby MCP runtime commands are not installed in this project. Install the wrapper commands into the commands root and retry.",
			"expectedCommandPath": self.expected_wrapper.to_string_lossy(),
			"commandsRoot": self.commands_root.to_string_lossy(),
		})
	}

	pub fn parse_error_response(&self) -> Value {
		let message = self.parse_error
			.clone()
			.unwrap_or_else(|| "Unable to parse JSON output from the Kirby CLI command.".to_string());
		json!({
			"ok": false,
			"parseError": message,
			"message": "The Kirby CLI command did not produce a readable result; inspect cli.stderr with _meta.debug.",
		})
	}

	pub fn cli_meta(&self, debug: bool) -> Value {
		let Some(cli) = &self.cli else {
			return Value::Null;
		};
		let mut meta = json!({
			"exitCode": cli.exit_code,
			"timedOut": cli.timed_out,
			"durationMs": cli.duration_ms,
		});
		if debug {
			if let Some(obj) = meta.as_object_mut() {
				obj.insert("stdout".to_string(), Value::String(cli.stdout.clone()));
				obj.insert("stderr".to_string(), Value::String(cli.stderr.clone()));
			}
		}
		meta
	}

	pub fn to_response(&self, debug: bool) -> Value {
		if !self.installed {
			return self.needs_runtime_install_response();
		}
		let mut body = match &self.payload {
			Some(payload) => Value::Object(payload.clone()),
			None => self.parse_error_response(),
		};
		if let Some(obj) = body.as_object_mut() {
			obj.entry("ok".to_string()).or_insert(Value::Bool(false));
			obj.insert("cli".to_string(), self.cli_meta(debug));
		}
		body
	}
}

pub struct RuntimeRunner {
	cli: CliRunner,
	host: Option<String>,
	cache: Arc<RootsCache>,
	roots_timeout: Duration,
}

impl RuntimeRunner {
	pub fn new(cli: CliRunner, host: Option<String>, cache: Arc<RootsCache>) -> Self {
		let host = host
			.map(|value| value.trim().to_string())
			.filter(|value| !value.is_empty());
		Self {
			cli,
			host,
			cache,
			roots_timeout: clamp_timeout(None)
		}
	}

	pub fn project_root(&self) -> &Path {
		self.cli.project_root()
	}

	pub fn host(&self) -> Option<&str> {
		self.host.as_deref()
	}

	pub fn cache(&self) -> &Arc<RootsCache> {
		&self.cache
	}

	pub fn cli(&self) -> &CliRunner {
		&self.cli
	}

	pub fn cache_key(&self) -> CacheKey {
		CacheKey::new(self.project_root(), self.host())
	}

	pub fn env(&self) -> BTreeMap<String, String> {
		let mut env = BTreeMap::new();
		if let Some(host) = &self.host {
			env.insert(HOST_ENV.to_string(), host.clone());
		}
		env
	}

	// Falls back to Kirby's default layout, uncached, when inspection fails.
	pub async fn context(&self) -> RuntimeContext {
		let key = self.cache_key();
		let env = self.env();
		let inspected = self.cache
			.get_or_inspect(&key, || inspect_roots(&self.cli, &env, self.roots_timeout))
			.await;
		let (roots, inspection_error, inspection_code) = match inspected {
			Ok(roots) => (roots, None, None),
			Err(err) => {
				warn!(root = %self.project_root().display(), error = %err, "falling back to default roots");
				let fallback = default_roots(self.project_root());
				let code = roots_error_code(&err);
				(Arc::new(RootsInspection::new(fallback, None, self.project_root())), Some(err.to_string()), Some(code))
			}
		};
		let commands_root = roots.commands_root(self.project_root());
		RuntimeContext {
			project_root: self.project_root().to_path_buf(),
			host: self.host.clone(),
			roots,
			commands_root,
			inspection_error,
			inspection_code
		}
	}

	pub async fn refresh_context(&self) -> RuntimeContext {
		self.cache.invalidate(&self.cache_key());
		self.context().await
	}

	pub async fn run(
		&self,
		command: RuntimeCommand,
		args: &[String],
		timeout_secs: Option<u64>) -> Result<RuntimeResult, ProcessError> {
		let context = self.context().await;
		let expected_wrapper = context.commands_root.join(command.wrapper_path());
		let mut result = RuntimeResult {
			project_root: context.project_root,
			host: context.host,
			commands_root: context.commands_root,
			installed: expected_wrapper.is_file(),
			expected_wrapper,
			cli: None,
			payload: None,
			parse_error: None
		};
		if !result.installed {
			debug!(command = command.cli_name(), wrapper = %result.expected_wrapper.display(), "runtime command not installed");
			return Ok(result);
		}
		let mut argv = Vec::with_capacity(args.len() + 1);
		argv.push(command.cli_name().to_string());
		argv.extend(args.iter().cloned());
		let timeout = clamp_timeout(timeout_secs);
		let output = match self.cli.run(&argv, &self.env(), timeout).await {
			Ok(output) => output,
			Err(err @ ProcessError::BinaryNotFound { .. }) => return Err(err),
			Err(err) => {
				warn!(command = command.cli_name(), error = %err, "runtime command failed to run");
				result.parse_error = Some(err.to_string());
				return Ok(result);
			}
		};
		// A complete envelope written before a timeout is still trusted.
		match extract_marked_json(&output.stdout) {
			Ok(Value::Object(payload)) => result.payload = Some(payload),
			Ok(other) => {
				result.parse_error = Some(format!("expected a JSON object from {}, got {}", command.cli_name(), json_kind(&other)));
			}
			Err(err) if output.timed_out => {
				result.parse_error = Some(format!("{} timed out after {}s: {}", command.cli_name(), timeout.as_secs(), err));
			}
			Err(err) => result.parse_error = Some(err.to_string()),
		}
		if let Some(error) = &result.parse_error {
			warn!(command = command.cli_name(), exit_code = output.exit_code, timed_out = output.timed_out, error = %error, "runtime command produced no payload");
		}
		result.cli = Some(output);
		debug!(command = command.cli_name(), ok = result.payload_ok(), timed_out = result.timed_out(), "runtime command finished");
		Ok(result)
	}
}

fn json_kind(value: &Value) -> &'static str {
	match value {
		Value::Null => "null",
		Value::Bool(_) => "a boolean",
		Value::Number(_) => "a number",
		Value::String(_) => "a string",
		Value::Array(_) => "an array",
		Value::Object(_) => "an object",
	}
}

pub fn roots_error_code(err: &RootsError) -> &'static str {
	match err {
		RootsError::Cli(ProcessError::BinaryNotFound { .. }) => "CLI_NOT_FOUND",
		RootsError::Cli(_) => "CLI_FAILED",
		RootsError::Extract { timed_out: true, .. } => "TIMEOUT",
		RootsError::Extract { .. } => "PARSE_ERROR",
		RootsError::Rejected(_) => "ROOTS_REJECTED",
	}
}
