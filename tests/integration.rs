#![cfg(unix)]

use serde_json::{json, Value};
use std::io::{BufRead, BufReader, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

struct RpcClient {
	child: Child,
	stdin: ChildStdin,
	stdout: BufReader<ChildStdout>,
	next_id: u64,
}

impl RpcClient {
	fn spawn(project: &Project) -> Self {
		let bin = env!("CARGO_BIN_EXE_kirby-mcp");
		let mut child = Command::new(bin)
			.arg("--root")
			.arg(project.root())
			.env("KIRBY_MCP_CLI_BIN", project.cli())
			.env_remove("KIRBY_MCP_ENABLE_EVAL")
			.env_remove("KIRBY_MCP_HOST")
			.env_remove("KIRBY_MCP_CONFIG")
			.stdin(Stdio::piped())
			.stdout(Stdio::piped())
			.stderr(Stdio::null())
			.spawn()
			.expect("spawn kirby-mcp");
		let stdin = child.stdin
			.take()
			.expect("stdin");
		let stdout = child.stdout
			.take()
			.expect("stdout");
		Self {
			child,
			stdin,
			stdout: BufReader::new(stdout),
			next_id: 1
		}
	}

	fn send(&mut self, method: &str, params: Value) -> Value {
		let id = self.next_id;
		self.next_id += 1;
		let req = json!({
			"jsonrpc": "2.0",
			"id": id,
			"method": method,
			"params": params
		});
		let line = serde_json::to_string(&req).expect("serialize request");
		writeln!(self.stdin, "{}", line).expect("write request");
		self.stdin
			.flush()
			.expect("flush request");
		let mut resp_line = String::new();
		loop {
			resp_line.clear();
			let bytes = self.stdout
				.read_line(&mut resp_line)
				.expect("read response");
			if bytes == 0 {
				panic!("kirby-mcp exited unexpectedly");
			}
			let trimmed = resp_line.trim();
			if trimmed.is_empty() {
				continue;
			}
			let parsed: Value = match serde_json::from_str(trimmed) {
				Ok(value) => value,
				Err(_) => continue,
			};
			if parsed.get("id").and_then(Value::as_u64) == Some(id) {
				return parsed;
			}
		}
	}

	fn call(&mut self, name: &str, arguments: Value) -> Value {
		let resp = self.send("tools/call", json!({
			"name": name,
			"arguments": arguments
		}));
		resp.get("result")
			.cloned()
			.unwrap_or_else(|| panic!("tool {} failed: {}", name, resp))
	}
}

impl Drop for RpcClient {
	fn drop(&mut self) {
		let _ = self.child.kill();
	}
}

const FAKE_CLI: &str = r#"#!/bin/sh
echo "$1" >> '@ROOT@/calls.log'
case "$1" in
	mcp:roots)
		echo 'PHP Deprecated: noise before the payload'
		echo __KIRBY_MCP_JSON__
		echo '{"ok":true,"roots":{"index":"@ROOT@","content":"@ROOT@/content","commands":"@ROOT@/site/commands"}}'
		echo __KIRBY_MCP_JSON_END__
		;;
	mcp:page:content)
		echo __KIRBY_MCP_JSON__
		printf '{"ok":true,"id":"%s","content":%s}\n' "$2" "$(cat '@ROOT@/store.json')"
		echo __KIRBY_MCP_JSON_END__
		;;
	mcp:page:update)
		printf '%s' "$4" > '@ROOT@/store.json'
		echo __KIRBY_MCP_JSON__
		printf '{"ok":true,"id":"%s","content":%s}\n' "$2" "$(cat '@ROOT@/store.json')"
		echo __KIRBY_MCP_JSON_END__
		;;
	mcp:routes)
		sleep 30
		;;
	version)
		echo 'Kirby 4.1.0'
		;;
	*)
		echo "unknown command $1" >&2
		exit 1
		;;
esac
"#;

struct Project {
	dir: tempfile::TempDir,
}

impl Project {
	fn new() -> Self {
		let dir = tempfile::tempdir().expect("tempdir");
		let project = Self { dir };
		let root = project.root().to_path_buf();
		write_text(&root.join("index.php"), "<?php\n");
		write_text(&root.join("store.json"), r#"{"title":"Old","text":"Body"}"#);
		let script = FAKE_CLI.replace("@ROOT@", &root.to_string_lossy());
		write_text(&project.cli(), &script);
		std::fs::set_permissions(project.cli(), std::fs::Permissions::from_mode(0o755)).expect("chmod");
		project
	}

	fn root(&self) -> &Path {
		self.dir.path()
	}

	fn cli(&self) -> PathBuf {
		self.root().join("bin-kirby")
	}

	fn install(&self, wrapper: &str) {
		write_text(&self.root().join("site/commands").join(wrapper), "<?php return [];\n");
	}

	fn store(&self) -> Value {
		let text = std::fs::read_to_string(self.root().join("store.json")).expect("read store");
		serde_json::from_str(&text).expect("parse store")
	}

	fn calls(&self) -> Vec<String> {
		std::fs::read_to_string(self.root().join("calls.log"))
			.unwrap_or_default()
			.lines()
			.map(str::to_string)
			.collect()
	}
}

fn write_text(path: &Path, contents: &str) {
	if let Some(parent) = path.parent() {
		std::fs::create_dir_all(parent).expect("create parent");
	}
	std::fs::write(path, contents).expect("write file");
}

#[test]
fn initialize_and_list_tools() {
	let project = Project::new();
	let mut client = RpcClient::spawn(&project);
	let init = client.send("initialize", json!({}));
	assert_eq!(init["result"]["serverInfo"]["name"], json!("kirby-mcp"));
	assert_eq!(init["result"]["protocolVersion"], json!("2024-11-05"));
	let tools = client.send("tools/list", json!({}));
	let names: Vec<&str> = tools["result"]["tools"]
		.as_array()
		.expect("tools")
		.iter()
		.filter_map(|tool| tool["name"].as_str())
		.collect();
	for expected in ["kirby_roots", "kirby_read_page_content", "kirby_update_page_content", "kirby_eval", "kirby_cli", "kirby_cache_clear"] {
		assert!(names.contains(&expected), "missing {}", expected);
	}
	let unknown = client.send("nope", json!({}));
	assert_eq!(unknown["error"]["code"], json!(-32601));
}

#[test]
fn roots_are_inspected_once_and_cache_clear_forces_reinspection() {
	let project = Project::new();
	let mut client = RpcClient::spawn(&project);
	let roots = client.call("kirby_roots", json!({}));
	assert_eq!(roots["structuredContent"]["ok"], json!(true));
	let content_root = project.root().join("content");
	assert_eq!(roots["structuredContent"]["roots"]["content"], json!(content_root.to_string_lossy()));
	client.call("kirby_roots", json!({}));
	assert_eq!(project.calls(), vec!["mcp:roots"]);
	let cleared = client.call("kirby_cache_clear", json!({}));
	assert_eq!(cleared["structuredContent"]["cleared"], json!(1));
	client.call("kirby_roots", json!({}));
	assert_eq!(project.calls(), vec!["mcp:roots", "mcp:roots"]);
}

#[test]
fn missing_wrapper_reports_needs_runtime_install() {
	let project = Project::new();
	let mut client = RpcClient::spawn(&project);
	let result = client.call("kirby_blueprints", json!({}));
	let structured = &result["structuredContent"];
	assert_eq!(structured["ok"], json!(false));
	assert_eq!(structured["needsRuntimeInstall"], json!(true));
	assert!(structured["expectedCommandPath"].as_str().unwrap_or("").ends_with("mcp/blueprints.php"));
	assert!(!project.calls().contains(&"mcp:blueprints".to_string()));
}

#[test]
fn eval_stays_disabled_even_when_confirmed() {
	let project = Project::new();
	project.install("mcp/eval.php");
	let mut client = RpcClient::spawn(&project);
	let result = client.call("kirby_eval", json!({ "code": "return 1;", "confirm": true }));
	assert_eq!(result["structuredContent"]["needsEnable"], json!(true));
	assert!(!project.calls().contains(&"mcp:eval".to_string()));
}

#[test]
fn page_update_requires_validation_then_previews_then_applies() {
	let project = Project::new();
	project.install("mcp/page/content.php");
	project.install("mcp/page/update.php");
	let mut client = RpcClient::spawn(&project);
	let data = json!({ "title": "New", "text": "Body" });

	let unvalidated = client.call("kirby_update_page_content", json!({ "id": "home", "data": data, "confirm": true }));
	assert_eq!(unvalidated["structuredContent"]["needsSchemaValidation"], json!(true));
	assert_eq!(unvalidated["structuredContent"]["schemaResource"], json!("kirby://schema/page-update"));

	let preview = client.call("kirby_update_page_content", json!({ "id": "home", "data": data, "validated": true }));
	let structured = &preview["structuredContent"];
	assert_eq!(structured["needsConfirm"], json!(true));
	assert_eq!(structured["preview"]["changedKeys"], json!(["title"]));
	assert_eq!(structured["preview"]["unchangedKeys"], json!(["text"]));
	assert_eq!(project.store(), json!({ "title": "Old", "text": "Body" }));
	assert!(!project.calls().contains(&"mcp:page:update".to_string()));

	let applied = client.call("kirby_update_page_content", json!({ "id": "home", "data": data, "validated": true, "confirm": true }));
	assert_eq!(applied["structuredContent"]["ok"], json!(true));
	assert_eq!(project.store(), data);

	let read = client.call("kirby_read_page_content", json!({ "id": "home" }));
	assert_eq!(read["structuredContent"]["content"], data);

	let again = client.call("kirby_update_page_content", json!({ "id": "home", "data": data, "validated": true, "confirm": true }));
	assert_eq!(again["structuredContent"]["content"], data);
	assert_eq!(project.store(), data);
}

#[test]
fn slow_command_times_out() {
	let project = Project::new();
	project.install("mcp/routes.php");
	let mut client = RpcClient::spawn(&project);
	let result = client.call("kirby_routes", json!({ "timeout": 1 }));
	let structured = &result["structuredContent"];
	assert_eq!(structured["ok"], json!(false));
	assert!(structured["parseError"].as_str().unwrap_or("").contains("timed out"));
	assert_eq!(structured["cli"]["timedOut"], json!(true));
}

#[test]
fn cli_tool_honours_allow_and_deny_lists() {
	let project = Project::new();
	let mut client = RpcClient::spawn(&project);
	client.send("initialize", json!({
		"capabilities": {
			"experimental": {
				"configuration": {
					"cli": { "allow": ["make:*", "version"], "deny": ["make:user"] }
				}
			}
		}
	}));
	let denied = client.call("kirby_cli", json!({ "command": "make:user", "confirm": true }));
	assert_eq!(denied["isError"], json!(true));
	assert_eq!(denied["structuredContent"]["code"], json!("COMMAND_NOT_ALLOWED"));

	let preview = client.call("kirby_cli", json!({ "command": "make:page", "args": ["blog"] }));
	assert_eq!(preview["structuredContent"]["needsConfirm"], json!(true));
	assert!(!project.calls().contains(&"make:page".to_string()));

	let version = client.call("kirby_cli", json!({ "command": "version" }));
	assert_eq!(version["structuredContent"]["exitCode"], json!(0));
	assert!(version["structuredContent"]["stdout"].as_str().unwrap_or("").contains("Kirby 4.1.0"));
}

#[test]
fn resources_expose_schema_guide() {
	let project = Project::new();
	let mut client = RpcClient::spawn(&project);
	let list = client.send("resources/list", json!({}));
	let uris: Vec<&str> = list["result"]["resources"]
		.as_array()
		.expect("resources")
		.iter()
		.filter_map(|resource| resource["uri"].as_str())
		.collect();
	assert_eq!(uris, vec!["kirby://roots", "kirby://commands", "kirby://schema/page-update"]);
	let schema = client.send("resources/read", json!({ "uri": "kirby://schema/page-update" }));
	assert!(schema["result"]["contents"][0]["text"].as_str().unwrap_or("").contains("confirm"));
	let missing = client.send("resources/read", json!({ "uri": "kirby://nope" }));
	assert!(missing.get("error").is_some());
}
