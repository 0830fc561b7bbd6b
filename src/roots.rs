use crate::marked_json::{extract_marked_json, ExtractError};
use crate::process::{CliOutput, CliRunner, ProcessError};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tracing::{debug, info};

pub type Roots = BTreeMap<String, String>;

pub const ROOTS_COMMAND: &str = "mcp:roots";
pub const MAX_TTL_SECS: u64 = 3600;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
	project_root: PathBuf,
	host: Option<String>,
}

impl CacheKey {
	pub fn new(project_root: &Path, host: Option<&str>) -> Self {
		let project_root = std::fs::canonicalize(project_root).unwrap_or_else(|_| strip_trailing_separators(project_root));
		let host = host
			.map(|value| value.trim().trim_end_matches('.').to_ascii_lowercase())
			.filter(|value| !value.is_empty());
		Self { project_root, host }
	}

	pub fn project_root(&self) -> &Path {
		&self.project_root
	}

	pub fn host(&self) -> Option<&str> {
		self.host.as_deref()
	}
}

fn strip_trailing_separators(path: &Path) -> PathBuf {
	let text = path.to_string_lossy();
	let trimmed = text.trim_end_matches(std::path::MAIN_SEPARATOR);
	if trimmed.is_empty() {
		return path.to_path_buf();
	}
	PathBuf::from(trimmed)
}

#[derive(Clone, Debug)]
pub struct RootsInspection {
	pub roots: Roots,
	pub cli: Option<CliOutput>,
	pub inspected_at: SystemTime,
	pub sentinel: PathBuf,
	pub sentinel_mtime: Option<SystemTime>,
	pub cacheable: bool,
}

impl RootsInspection {
	pub fn new(roots: Roots, cli: Option<CliOutput>, project_root: &Path) -> Self {
		let sentinel = bootstrap_file(&roots, project_root);
		let sentinel_mtime = modified_time(&sentinel);
		Self {
			roots,
			cli,
			inspected_at: SystemTime::now(),
			sentinel,
			sentinel_mtime,
			cacheable: true
		}
	}

	pub fn commands_root(&self, project_root: &Path) -> PathBuf {
		commands_root(&self.roots, project_root)
	}
}

pub fn modified_time(path: &Path) -> Option<SystemTime> {
	std::fs::metadata(path)
		.and_then(|meta| meta.modified())
		.ok()
}

pub fn bootstrap_file(roots: &Roots, project_root: &Path) -> PathBuf {
	roots.get("index")
		.map(PathBuf::from)
		.unwrap_or_else(|| project_root.to_path_buf())
		.join("index.php")
}

pub fn commands_root(roots: &Roots, project_root: &Path) -> PathBuf {
	roots.get("commands")
		.map(PathBuf::from)
		.unwrap_or_else(|| project_root.join("site").join("commands"))
}

pub fn default_roots(project_root: &Path) -> Roots {
	let site = project_root.join("site");
	let mut roots = Roots::new();
	let mut put = |name: &str, path: PathBuf| {
		roots.insert(name.to_string(), path.to_string_lossy().to_string());
	};
	put("index", project_root.to_path_buf());
	put("content", project_root.join("content"));
	put("media", project_root.join("media"));
	put("site", site.clone());
	put("blueprints", site.join("blueprints"));
	put("collections", site.join("collections"));
	put("commands", site.join("commands"));
	put("config", site.join("config"));
	put("controllers", site.join("controllers"));
	put("models", site.join("models"));
	put("plugins", site.join("plugins"));
	put("snippets", site.join("snippets"));
	put("templates", site.join("templates"));
	roots
}

#[derive(Debug)]
pub enum RootsError {
	Cli(ProcessError),
	Extract {
		error: ExtractError,
		timed_out: bool,
	},
	Rejected(String),
}

impl std::fmt::Display for RootsError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::Cli(err) => write!(f, "roots inspection failed: {}", err),
			Self::Extract { error, timed_out: true } => write!(f, "roots inspection timed out: {}", error),
			Self::Extract { error, timed_out: false } => write!(f, "roots inspection returned no result: {}", error),
			Self::Rejected(message) => write!(f, "roots inspection rejected: {}", message),
		}
	}
}

impl std::error::Error for RootsError {
	fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
		match self {
			Self::Cli(err) => Some(err),
			Self::Extract { error, .. } => Some(error),
			Self::Rejected(_) => None,
		}
	}
}

pub fn parse_roots_payload(payload: &Value) -> Result<Roots, RootsError> {
	if payload.get("ok").and_then(Value::as_bool) == Some(false) {
		let message = payload.get("message")
			.or_else(|| payload.get("error"))
			.and_then(Value::as_str)
			.unwrap_or("kirby reported ok=false");
		return Err(RootsError::Rejected(message.to_string()));
	}
	let map = payload.get("roots")
		.and_then(Value::as_object)
		.ok_or_else(|| RootsError::Rejected("payload has no roots object".to_string()))?;
	Ok(map.iter()
		.filter_map(|(name, path)| path.as_str().map(|path| (name.clone(), path.to_string())))
		.collect())
}

// No installed check here: the commands root is what is being discovered.
pub async fn inspect_roots(
	cli: &CliRunner,
	env: &BTreeMap<String, String>,
	timeout: Duration) -> Result<RootsInspection, RootsError> {
	let bootstrap = cli.project_root().join("index.php");
	let mtime_before = modified_time(&bootstrap);
	let output = cli.run(&[ROOTS_COMMAND.to_string()], env, timeout).await.map_err(RootsError::Cli)?;
	let payload = extract_marked_json(&output.stdout).map_err(|error| RootsError::Extract {
		error,
		timed_out: output.timed_out
	})?;
	let roots = parse_roots_payload(&payload)?;
	let mut inspection = RootsInspection::new(roots, Some(output), cli.project_root());
	// Edited while Kirby was booting: the roots may predate the recorded mtime.
	if inspection.sentinel == bootstrap && inspection.sentinel_mtime != mtime_before {
		debug!(sentinel = %bootstrap.display(), "bootstrap file changed during inspection");
		inspection.cacheable = false;
	}
	Ok(inspection)
}

struct CacheState {
	ttl: Duration,
	entries: HashMap<CacheKey, Arc<RootsInspection>>,
}

// Inspection runs unlocked, so two concurrent misses for one key may both
// inspect; the later insert wins.
pub struct RootsCache {
	state: Mutex<CacheState>,
}

impl RootsCache {
	pub fn new(ttl: Duration) -> Self {
		Self {
			state: Mutex::new(CacheState {
				ttl: clamp_ttl(ttl),
				entries: HashMap::new()
			})
		}
	}

	pub fn set_ttl(&self, ttl: Duration) {
		if let Ok(mut state) = self.state.lock() {
			state.ttl = clamp_ttl(ttl);
		}
	}

	pub fn ttl(&self) -> Duration {
		self.state
			.lock()
			.map(|state| state.ttl)
			.unwrap_or_default()
	}

	pub fn clear(&self) {
		if let Ok(mut state) = self.state.lock() {
			let dropped = state.entries.len();
			state.entries.clear();
			info!(dropped, "roots cache cleared");
		}
	}

	pub fn invalidate(&self, key: &CacheKey) {
		if let Ok(mut state) = self.state.lock() {
			if state.entries.remove(key).is_some() {
				debug!(root = %key.project_root().display(), host = key.host().unwrap_or(""), "roots cache entry invalidated");
			}
		}
	}

	pub fn len(&self) -> usize {
		self.state
			.lock()
			.map(|state| state.entries.len())
			.unwrap_or(0)
	}

	fn fresh(&self, key: &CacheKey) -> Option<Arc<RootsInspection>> {
		let mut state = self.state.lock().ok()?;
		let ttl = state.ttl;
		let entry = state.entries.get(key)?.clone();
		if is_fresh(&entry, ttl, SystemTime::now()) {
			return Some(entry);
		}
		debug!(root = %key.project_root.display(), "roots cache entry stale");
		state.entries.remove(key);
		None
	}

	pub async fn get_or_inspect<F, Fut, E>(&self, key: &CacheKey, inspect: F) -> Result<Arc<RootsInspection>, E>
	where
		F: FnOnce() -> Fut,
		Fut: Future<Output = Result<RootsInspection, E>>, {
		if let Some(entry) = self.fresh(key) {
			debug!(root = %key.project_root.display(), "roots cache hit");
			return Ok(entry);
		}
		let entry = Arc::new(inspect().await?);
		if let Ok(mut state) = self.state.lock() {
			if !state.ttl.is_zero() && entry.cacheable {
				state.entries.insert(key.clone(), entry.clone());
			}
		}
		Ok(entry)
	}
}

fn clamp_ttl(ttl: Duration) -> Duration {
	ttl.min(Duration::from_secs(MAX_TTL_SECS))
}

fn is_fresh(entry: &RootsInspection, ttl: Duration, now: SystemTime) -> bool {
	if ttl.is_zero() {
		return false;
	}
	// A clock that moved backwards counts as expired.
	let Ok(age) = now.duration_since(entry.inspected_at) else {
		return false;
	};
	if age >= ttl {
		return false;
	}
	modified_time(&entry.sentinel) == entry.sentinel_mtime
}
