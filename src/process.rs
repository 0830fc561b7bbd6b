use once_cell::sync::OnceCell;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

pub const CLI_BIN_ENV: &str = "KIRBY_MCP_CLI_BIN";

const DRAIN_GRACE: Duration = Duration::from_secs(1);

#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CliOutput {
	pub exit_code: i32,
	pub stdout: String,
	pub stderr: String,
	pub timed_out: bool,
	pub duration_ms: u64,
}

#[derive(Debug)]
pub enum ProcessError {
	BinaryNotFound {
		candidates: Vec<PathBuf>,
	},
	Spawn {
		binary: PathBuf,
		source: std::io::Error,
	},
	Io(std::io::Error),
}

impl std::fmt::Display for ProcessError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::BinaryNotFound { candidates } => {
				let tried = candidates.iter()
					.map(|path| path.display().to_string())
					.collect::<Vec<_>>()
					.join(", ");
				write!(f, "kirby cli not found (tried {}); set {} to the kirby binary", tried, CLI_BIN_ENV)
			}
			Self::Spawn { binary, source } => write!(f, "failed to spawn {}: {}", binary.display(), source),
			Self::Io(err) => write!(f, "cli io error: {}", err),
		}
	}
}

impl std::error::Error for ProcessError {
	fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
		match self {
			Self::BinaryNotFound { .. } => None,
			Self::Spawn { source, .. } => Some(source),
			Self::Io(err) => Some(err),
		}
	}
}

impl From<std::io::Error> for ProcessError {
	fn from(err: std::io::Error) -> Self {
		Self::Io(err)
	}
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
	use std::os::unix::fs::PermissionsExt;
	std::fs::metadata(path)
		.map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
		.unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
	path.is_file()
}

fn search_path(name: &str) -> Option<PathBuf> {
	let paths = std::env::var_os("PATH")?;
	std::env::split_paths(&paths)
		.map(|dir| dir.join(name))
		.find(|candidate| is_executable(candidate))
}

pub fn resolve_cli_binary(project_root: &Path) -> Result<PathBuf, ProcessError> {
	resolve_with_override(project_root, std::env::var(CLI_BIN_ENV).ok().as_deref())
}

/// `KIRBY_MCP_CLI_BIN` (relative values are taken from the project root), then
/// `vendor/bin/kirby`, then `kirby` on PATH.
fn resolve_with_override(project_root: &Path, override_value: Option<&str>) -> Result<PathBuf, ProcessError> {
	let mut candidates = Vec::new();
	if let Some(value) = override_value {
		let trimmed = value.trim();
		if !trimmed.is_empty() {
			let path = PathBuf::from(trimmed);
			let path = if path.is_absolute() {
				path
			}
			else {
				project_root.join(path)
			};
			if is_executable(&path) {
				return Ok(path);
			}
			// An explicit override that does not resolve is not silently replaced.
			return Err(ProcessError::BinaryNotFound {
				candidates: vec![path]
			});
		}
	}
	let vendored = project_root.join("vendor").join("bin").join("kirby");
	if is_executable(&vendored) {
		return Ok(vendored);
	}
	candidates.push(vendored);
	if let Some(found) = search_path("kirby") {
		return Ok(found);
	}
	candidates.push(PathBuf::from("kirby"));
	Err(ProcessError::BinaryNotFound { candidates })
}

pub struct CliRunner {
	project_root: PathBuf,
	binary: OnceCell<PathBuf>,
}

impl CliRunner {
	pub fn new(project_root: PathBuf) -> Self {
		Self {
			project_root,
			binary: OnceCell::new()
		}
	}

	#[cfg(test)]
	pub fn with_binary(project_root: PathBuf, binary: PathBuf) -> Self {
		Self {
			project_root,
			binary: OnceCell::with_value(binary)
		}
	}

	pub fn project_root(&self) -> &Path {
		&self.project_root
	}

	pub fn binary(&self) -> Result<&Path, ProcessError> {
		self.binary
			.get_or_try_init(|| resolve_cli_binary(&self.project_root))
			.map(PathBuf::as_path)
	}

	pub async fn run(
		&self,
		args: &[String],
		env: &BTreeMap<String, String>,
		timeout: Duration) -> Result<CliOutput, ProcessError> {
		let binary = self.binary()?.to_path_buf();
		run_process(&binary, &self.project_root, args, env, timeout).await
	}
}

async fn pump<R>(mut reader: R, sink: Arc<Mutex<Vec<u8>>>) -> std::io::Result<()>
where
	R: AsyncRead + Unpin, {
	let mut chunk = [0u8; 8192];
	loop {
		let read = reader.read(&mut chunk).await?;
		if read == 0 {
			return Ok(());
		}
		if let Ok(mut buffer) = sink.lock() {
			buffer.extend_from_slice(&chunk[..read]);
		}
	}
}

fn take_text(sink: &Arc<Mutex<Vec<u8>>>) -> String {
	sink.lock()
		.map(|buffer| String::from_utf8_lossy(&buffer).into_owned())
		.unwrap_or_default()
}

async fn kill_child(child: &mut Child) {
	#[cfg(unix)]
	if let Some(pid) = child.id() {
		// The child leads its own process group; take down anything it forked
		// so inherited pipes close.
		let _ = Command::new("kill")
			.arg("-KILL")
			.arg(format!("-{}", pid))
			.stdout(Stdio::null())
			.stderr(Stdio::null())
			.status()
			.await;
	}
	let _ = child.start_kill();
	let _ = child.wait().await;
}

/// On timeout the process group is killed and the output captured so far is
/// returned with `timed_out` set.
pub async fn run_process(
	binary: &Path,
	cwd: &Path,
	args: &[String],
	env: &BTreeMap<String, String>,
	timeout: Duration) -> Result<CliOutput, ProcessError> {
	let started = Instant::now();
	let mut cmd = Command::new(binary);
	cmd.args(args)
		.current_dir(cwd)
		.envs(env)
		.stdin(Stdio::null())
		.stdout(Stdio::piped())
		.stderr(Stdio::piped())
		.kill_on_drop(true);
	#[cfg(unix)]
	cmd.process_group(0);
	debug!(binary = %binary.display(), args = ?args, timeout_secs = timeout.as_secs(), "spawning kirby cli");
	let mut child = cmd.spawn().map_err(|source| ProcessError::Spawn {
		binary: binary.to_path_buf(),
		source
	})?;
	let stdout_sink = Arc::new(Mutex::new(Vec::new()));
	let stderr_sink = Arc::new(Mutex::new(Vec::new()));
	let mut readers = Vec::new();
	if let Some(stdout) = child.stdout.take() {
		readers.push(tokio::spawn(pump(stdout, stdout_sink.clone())));
	}
	if let Some(stderr) = child.stderr.take() {
		readers.push(tokio::spawn(pump(stderr, stderr_sink.clone())));
	}
	let (exit_code, timed_out) = match tokio::time::timeout(timeout, child.wait()).await {
		Ok(status) => (status?.code().unwrap_or(-1), false),
		Err(_) => {
			warn!(binary = %binary.display(), timeout_secs = timeout.as_secs(), "kirby cli timed out; killing");
			kill_child(&mut child).await;
			(-1, true)
		}
	};
	for reader in readers {
		let abort = reader.abort_handle();
		match tokio::time::timeout(DRAIN_GRACE, reader).await {
			Ok(Ok(Err(err))) => debug!(error = %err, "cli output reader failed"),
			Ok(_) => {}
			Err(_) => abort.abort(),
		}
	}
	let output = CliOutput {
		exit_code,
		stdout: take_text(&stdout_sink),
		stderr: take_text(&stderr_sink),
		timed_out,
		duration_ms: started.elapsed().as_millis() as u64,
	};
	debug!(
		exit_code = output.exit_code,
		timed_out = output.timed_out,
		stdout_bytes = output.stdout.len(),
		stderr_bytes = output.stderr.len(),
		"kirby cli finished"
	);
	Ok(output)
}
