use anyhow::{anyhow, Result};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};

pub const PROJECT_CONFIG_FILE: &str = ".kirby-mcp/mcp.json";
pub const DEFAULT_ROOTS_CACHE_TTL: u64 = 60;
pub const MAX_ROOTS_CACHE_TTL: u64 = 3600;

#[derive(Clone, Debug)]
pub struct Config {
	pub project_root: PathBuf,
	pub host: Option<String>,
	pub roots_cache_ttl: u64,
	pub eval_enabled: bool,
	pub cli_allow: Vec<String>,
	pub cli_deny: Vec<String>,
	pub debug: bool,
	pub otel_enabled: bool,
	pub otel_endpoint: String,
	pub otel_service_name: String,
	pub session_id: String,
}

impl Config {
	pub fn new(project_root: PathBuf) -> Self {
		Self {
			project_root,
			host: None,
			roots_cache_ttl: DEFAULT_ROOTS_CACHE_TTL,
			eval_enabled: false,
			cli_allow: Vec::new(),
			cli_deny: Vec::new(),
			debug: false,
			otel_enabled: false,
			otel_endpoint: String::from("http://127.0.0.1:4317"),
			otel_service_name: String::from("kirby-mcp"),
			session_id: uuid::Uuid::new_v4().to_string()
		}
	}
}

#[derive(Default)]
struct FlagValues {
	root: Option<String>,
	host: Option<String>,
	config_path: Option<String>,
	roots_cache_ttl: Option<u64>,
	eval_enabled: Option<bool>,
	debug: Option<bool>,
	otel_enabled: Option<bool>,
	otel_endpoint: Option<String>,
	otel_service_name: Option<String>,
	print_schema: bool,
}

fn parse_flags(args: impl Iterator<Item = String>) -> Result<FlagValues> {
	let mut flags = FlagValues::default();
	let mut args = args;
	while let Some(arg) = args.next() {
		match arg.as_str() {
			"--root" => {
				let value = args.next().ok_or_else(|| anyhow!("--root requires a value"))?;
				flags.root = Some(value);
			}
			"--host" => {
				let value = args.next().ok_or_else(|| anyhow!("--host requires a value"))?;
				flags.host = Some(value);
			}
			"--config" => {
				let value = args.next().ok_or_else(|| anyhow!("--config requires a value"))?;
				flags.config_path = Some(value);
			}
			"--roots-cache-ttl" => {
				let value = args.next().ok_or_else(|| anyhow!("--roots-cache-ttl requires a value"))?;
				flags.roots_cache_ttl = Some(parse_u64(&value, "--roots-cache-ttl")?);
			}
			"--enable-eval" => {
				flags.eval_enabled = Some(true);
			}
			"--debug" => {
				flags.debug = Some(true);
			}
			"--print-config-schema" => {
				flags.print_schema = true;
			}
			"--otel-enabled" => {
				let value = args.next().ok_or_else(|| anyhow!("--otel-enabled requires a value"))?;
				flags.otel_enabled = Some(parse_bool(&value, "--otel-enabled")?);
			}
			"--otel-endpoint" => {
				let value = args.next().ok_or_else(|| anyhow!("--otel-endpoint requires a value"))?;
				flags.otel_endpoint = Some(value);
			}
			"--otel-service-name" => {
				let value = args.next().ok_or_else(|| anyhow!("--otel-service-name requires a value"))?;
				flags.otel_service_name = Some(value);
			}
			_ => return Err(anyhow!("unknown argument: {}", arg)),
		}
	}
	Ok(flags)
}

fn env_value(name: &str) -> Option<String> {
	std::env::var(name)
		.ok()
		.filter(|value| !value.trim().is_empty())
}

/// Layers defaults, the project's `.kirby-mcp/mcp.json`, `--config`, the
/// `KIRBY_MCP_*` environment and finally command-line flags.
pub fn load_config() -> Result<Config> {
	let flags = parse_flags(std::env::args().skip(1))?;
	if flags.print_schema {
		let payload = serde_json::to_string_pretty(&config_schema())?;
		println!("{}", payload);
		std::process::exit(0);
	}
	let cwd = std::env::current_dir()?;
	let root = flags.root
		.clone()
		.or_else(|| env_value("KIRBY_MCP_PROJECT_ROOT"))
		.map(|value| resolve_against(&cwd, &value))
		.unwrap_or_else(|| cwd.clone());
	if !root.is_dir() {
		return Err(anyhow!("project root {} is not a directory", root.display()));
	}
	let mut config = Config::new(root);
	let project_file = config.project_root.join(PROJECT_CONFIG_FILE);
	if project_file.is_file() {
		let value = load_config_value(&project_file)?;
		config = apply_config_override(config, &value)?;
	}
	let config_path = flags.config_path
		.clone()
		.or_else(|| env_value("KIRBY_MCP_CONFIG"));
	if let Some(path) = config_path {
		let value = load_config_value(&resolve_against(&cwd, &path))?;
		config = apply_config_override(config, &value)?;
	}
	if let Some(host) = env_value("KIRBY_MCP_HOST") {
		config.host = Some(host);
	}
	if let Some(ttl) = env_value("KIRBY_MCP_ROOTS_CACHE_TTL") {
		config.roots_cache_ttl = parse_u64(&ttl, "KIRBY_MCP_ROOTS_CACHE_TTL")?;
	}
	if let Some(enabled) = env_value("KIRBY_MCP_ENABLE_EVAL") {
		config.eval_enabled = parse_bool(&enabled, "KIRBY_MCP_ENABLE_EVAL")?;
	}
	if let Some(debug) = env_value("KIRBY_MCP_DEBUG") {
		config.debug = parse_bool(&debug, "KIRBY_MCP_DEBUG")?;
	}
	if let Some(enabled) = env_value("KIRBY_MCP_OTEL_ENABLED") {
		config.otel_enabled = parse_bool(&enabled, "KIRBY_MCP_OTEL_ENABLED")?;
	}
	if let Some(endpoint) = env_value("KIRBY_MCP_OTEL_ENDPOINT") {
		config.otel_endpoint = endpoint;
	}
	if let Some(service) = env_value("KIRBY_MCP_OTEL_SERVICE_NAME") {
		config.otel_service_name = service;
	}
	if let Some(host) = flags.host {
		config.host = Some(host);
	}
	if let Some(ttl) = flags.roots_cache_ttl {
		config.roots_cache_ttl = ttl;
	}
	if let Some(enabled) = flags.eval_enabled {
		config.eval_enabled = enabled;
	}
	if let Some(debug) = flags.debug {
		config.debug = debug;
	}
	if let Some(enabled) = flags.otel_enabled {
		config.otel_enabled = enabled;
	}
	if let Some(endpoint) = flags.otel_endpoint {
		config.otel_endpoint = endpoint;
	}
	if let Some(service) = flags.otel_service_name {
		config.otel_service_name = service;
	}
	config.host = config.host
		.map(|host| host.trim().to_string())
		.filter(|host| !host.is_empty());
	config.roots_cache_ttl = config.roots_cache_ttl.min(MAX_ROOTS_CACHE_TTL);
	Ok(config)
}

fn resolve_against(cwd: &Path, value: &str) -> PathBuf {
	let path = PathBuf::from(value.trim());
	if path.is_absolute() {
		path
	}
	else {
		cwd.join(path)
	}
}

pub fn config_schema() -> Value {
	json!({
		"$schema": "http://json-schema.org/draft-07/schema#",
		"title": "kirby-mcp configuration",
		"type": "object",
		"additionalProperties": false,
		"properties": {
			"host": {
				"type": ["string", "null"],
				"description": "Host identifier passed to the Kirby CLI as KIRBY_HOST for multi-site setups."
			},
			"cache": {
				"type": "object",
				"additionalProperties": false,
				"properties": {
					"ttl_seconds": {
						"type": "integer",
						"minimum": 0,
						"maximum": MAX_ROOTS_CACHE_TTL,
						"description": "Roots cache time-to-live. 0 disables caching."
					}
				}
			},
			"eval": {
				"type": "object",
				"additionalProperties": false,
				"properties": {
					"enabled": { "type": "boolean", "description": "Allow kirby_eval and kirby_query." }
				}
			},
			"cli": {
				"type": "object",
				"additionalProperties": false,
				"properties": {
					"allow": { "type": "array", "items": { "type": "string" }, "description": "Commands kirby_cli may run. Trailing * matches a prefix." },
					"deny": { "type": "array", "items": { "type": "string" }, "description": "Commands kirby_cli must refuse. Deny wins over allow." }
				}
			},
			"debug": {
				"type": "boolean",
				"description": "Include raw CLI stdout/stderr in responses.",
				"scope": "configuration"
			},
			"otel_enabled": {
				"type": "boolean",
				"description": "Enable tracing export.",
				"scope": "configuration"
			},
			"otel_endpoint": {
				"type": "string",
				"description": "OTLP endpoint.",
				"scope": "configuration"
			},
			"otel_service_name": {
				"type": "string",
				"description": "OTEL service.name.",
				"scope": "configuration"
			}
		}
	})
}

pub fn load_config_value(path: &Path) -> Result<Value> {
	let content = std::fs::read_to_string(path)
		.map_err(|err| anyhow!("failed to read config {}: {}", path.display(), err))?;
	let value: Value = serde_json::from_str(&content)
		.map_err(|err| anyhow!("failed to parse config {}: {}", path.display(), err))?;
	Ok(value)
}

pub fn apply_config_override(base: Config, value: &Value) -> Result<Config> {
	let obj = value.as_object().ok_or_else(|| anyhow!("config must be an object"))?;
	let mut next = base;
	for (key, value) in obj {
		match key.as_str() {
			"host" => {
				next.host = if value.is_null() {
					None
				}
				else {
					Some(value.as_str().ok_or_else(|| anyhow!("host must be a string"))?.to_string())
				};
			}
			"cache" => {
				let cache = value.as_object().ok_or_else(|| anyhow!("cache must be an object"))?;
				for (cache_key, cache_value) in cache {
					match cache_key.as_str() {
						"ttl_seconds" => {
							let ttl = cache_value.as_u64().ok_or_else(|| anyhow!("cache.ttl_seconds must be a non-negative integer"))?;
							next.roots_cache_ttl = ttl.min(MAX_ROOTS_CACHE_TTL);
						}
						_ => return Err(anyhow!("unknown config key: cache.{}", cache_key)),
					}
				}
			}
			"eval" => {
				let eval = value.as_object().ok_or_else(|| anyhow!("eval must be an object"))?;
				for (eval_key, eval_value) in eval {
					match eval_key.as_str() {
						"enabled" => {
							next.eval_enabled = eval_value.as_bool().ok_or_else(|| anyhow!("eval.enabled must be a boolean"))?;
						}
						_ => return Err(anyhow!("unknown config key: eval.{}", eval_key)),
					}
				}
			}
			"cli" => {
				let cli = value.as_object().ok_or_else(|| anyhow!("cli must be an object"))?;
				for (cli_key, cli_value) in cli {
					match cli_key.as_str() {
						"allow" => next.cli_allow = parse_string_list(cli_value, "cli.allow")?,
						"deny" => next.cli_deny = parse_string_list(cli_value, "cli.deny")?,
						_ => return Err(anyhow!("unknown config key: cli.{}", cli_key)),
					}
				}
			}
			"debug" => {
				if !value.is_null() {
					next.debug = value.as_bool().ok_or_else(|| anyhow!("debug must be a boolean"))?;
				}
			}
			"otel_enabled" => {
				if !value.is_null() {
					next.otel_enabled = value.as_bool().ok_or_else(|| anyhow!("otel_enabled must be a boolean"))?;
				}
			}
			"otel_endpoint" => {
				if !value.is_null() {
					next.otel_endpoint = value.as_str().ok_or_else(|| anyhow!("otel_endpoint must be a string"))?.to_string();
				}
			}
			"otel_service_name" => {
				if !value.is_null() {
					next.otel_service_name = value.as_str().ok_or_else(|| anyhow!("otel_service_name must be a string"))?.to_string();
				}
			}
			_ => return Err(anyhow!("unknown config key: {}", key)),
		}
	}
	Ok(next)
}

fn parse_string_list(value: &Value, label: &str) -> Result<Vec<String>> {
	let items = value.as_array().ok_or_else(|| anyhow!("{} must be an array", label))?;
	items.iter()
		.map(|item| {
			item.as_str()
				.map(|text| text.trim().to_string())
				.ok_or_else(|| anyhow!("{} must contain strings", label))
		})
		.collect()
}

fn parse_u64(value: &str, label: &str) -> Result<u64> {
	value.trim().parse::<u64>().map_err(|_| anyhow!("{} must be a non-negative integer", label))
}

pub fn parse_bool(value: &str, label: &str) -> Result<bool> {
	let value = value.trim().to_lowercase();
	match value.as_str() {
		"1" | "true" | "yes" | "on" => Ok(true),
		"0" | "false" | "no" | "off" => Ok(false),
		_ => Err(anyhow!("{} must be a boolean", label)),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn override_applies_nested_keys() {
		let base = Config::new(PathBuf::from("/srv/project"));
		let next = apply_config_override(base, &json!({
			"host": "Example.test",
			"cache": { "ttl_seconds": 9000 },
			"eval": { "enabled": true },
			"cli": { "allow": ["make:*", " version "], "deny": ["make:user"] },
			"debug": true
		})).expect("override");
		assert_eq!(next.host.as_deref(), Some("Example.test"));
		assert_eq!(next.roots_cache_ttl, MAX_ROOTS_CACHE_TTL);
		assert!(next.eval_enabled);
		assert_eq!(next.cli_allow, vec!["make:*", "version"]);
		assert_eq!(next.cli_deny, vec!["make:user"]);
		assert!(next.debug);
	}

	#[test]
	fn override_rejects_unknown_and_mistyped_keys() {
		let base = Config::new(PathBuf::from("/srv/project"));
		assert!(apply_config_override(base.clone(), &json!({ "nope": 1 })).is_err());
		assert!(apply_config_override(base.clone(), &json!({ "cache": { "ttl": 1 } })).is_err());
		assert!(apply_config_override(base.clone(), &json!({ "eval": { "enabled": "yes" } })).is_err());
		assert!(apply_config_override(base, &json!([])).is_err());
	}

	#[test]
	fn flags_are_parsed() {
		let args = ["--root", "/srv", "--host", "a.test", "--roots-cache-ttl", "0", "--enable-eval", "--debug"]
			.iter()
			.map(|arg| arg.to_string());
		let flags = parse_flags(args).expect("flags");
		assert_eq!(flags.root.as_deref(), Some("/srv"));
		assert_eq!(flags.host.as_deref(), Some("a.test"));
		assert_eq!(flags.roots_cache_ttl, Some(0));
		assert_eq!(flags.eval_enabled, Some(true));
		assert_eq!(flags.debug, Some(true));
		assert!(parse_flags(["--bogus".to_string()].into_iter()).is_err());
		assert!(parse_flags(["--roots-cache-ttl".to_string(), "-1".to_string()].into_iter()).is_err());
	}

	#[test]
	fn bools() {
		assert!(parse_bool(" Yes ", "x").expect("bool"));
		assert!(!parse_bool("off", "x").expect("bool"));
		assert!(parse_bool("maybe", "x").is_err());
	}
}
