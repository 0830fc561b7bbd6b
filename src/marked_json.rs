use serde_json::Value;

pub const JSON_START: &str = "__KIRBY_MCP_JSON__";
pub const JSON_END: &str = "__KIRBY_MCP_JSON_END__";

#[derive(Debug)]
pub enum ExtractError {
	NotFound,
	Unterminated,
	Empty,
	InvalidJson(serde_json::Error),
}

impl std::fmt::Display for ExtractError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::NotFound => write!(f, "no {} block found in CLI output", JSON_START),
			Self::Unterminated => write!(f, "{} block is missing its {} line", JSON_START, JSON_END),
			Self::Empty => write!(f, "{} block is empty", JSON_START),
			Self::InvalidJson(err) => write!(f, "invalid JSON between markers: {}", err),
		}
	}
}

impl std::error::Error for ExtractError {
	fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
		match self {
			Self::InvalidJson(err) => Some(err),
			_ => None,
		}
	}
}

// Noise printed without a trailing newline can share a line with the marker,
// so markers are matched at the end of a line. Neither marker is a suffix of
// the other.
fn is_start_line(line: &str) -> bool {
	line.trim_end().ends_with(JSON_START)
}

fn is_end_line(line: &str) -> bool {
	line.trim_end().ends_with(JSON_END)
}

// The last start line that has an end line after it, up to the first such end line.
fn last_block(text: &str) -> Result<String, ExtractError> {
	let lines: Vec<&str> = text.lines().collect();
	let mut saw_start = false;
	let mut end_index: Option<usize> = None;
	for index in (0..lines.len()).rev() {
		let line = lines[index];
		if end_index.is_none() {
			if is_end_line(line) {
				end_index = Some(index);
			}
			else if is_start_line(line) {
				saw_start = true;
			}
			continue;
		}
		if is_end_line(line) {
			end_index = Some(index);
		}
		else if is_start_line(line) {
			let end = end_index.unwrap_or(index);
			return Ok(lines[index + 1..end].join("\n"));
		}
	}
	if saw_start || end_index.is_some() {
		return Err(ExtractError::Unterminated);
	}
	Err(ExtractError::NotFound)
}

pub fn extract_marked_json(text: &str) -> Result<Value, ExtractError> {
	let candidate = last_block(text)?;
	let candidate = candidate.trim();
	if candidate.is_empty() {
		return Err(ExtractError::Empty);
	}
	serde_json::from_str(candidate).map_err(ExtractError::InvalidJson)
}

#[cfg(test)]
pub fn emit_marked_json(value: &Value) -> String {
	format!("\n{}\n{}\n{}\n", JSON_START, value, JSON_END)
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn extracts_block_surrounded_by_noise() {
		let text = "warning: deprecated\n__KIRBY_MCP_JSON__\n{\"ok\":true,\"a\":1}\n__KIRBY_MCP_JSON_END__\ntrailing noise";
		let value = extract_marked_json(text).expect("extract");
		assert_eq!(value, json!({ "ok": true, "a": 1 }));
	}

	#[test]
	fn last_complete_block_wins() {
		let mut text = String::from("bootstrap output\n");
		text.push_str(&emit_marked_json(&json!({ "ok": false, "n": 1 })));
		text.push_str("<p>echoed template</p>\n");
		text.push_str(&emit_marked_json(&json!({ "ok": true, "n": 2 })));
		let value = extract_marked_json(&text).expect("extract");
		assert_eq!(value, json!({ "ok": true, "n": 2 }));
	}

	#[test]
	fn truncated_trailing_block_falls_back_to_last_complete_one() {
		let mut text = emit_marked_json(&json!({ "ok": true, "n": 1 }));
		text.push_str("__KIRBY_MCP_JSON__\n{\"ok\":tr");
		let value = extract_marked_json(&text).expect("extract");
		assert_eq!(value, json!({ "ok": true, "n": 1 }));
	}

	#[test]
	fn stray_end_marker_after_block_is_ignored() {
		let text = "__KIRBY_MCP_JSON__\n{\"ok\":true}\n__KIRBY_MCP_JSON_END__\nplugin footer __KIRBY_MCP_JSON_END__\n";
		let value = extract_marked_json(text).expect("extract");
		assert_eq!(value, json!({ "ok": true }));
		let mut text = emit_marked_json(&json!({ "n": 1 }));
		text.push_str("__KIRBY_MCP_JSON_END__\n__KIRBY_MCP_JSON_END__\n");
		assert_eq!(extract_marked_json(&text).expect("extract"), json!({ "n": 1 }));
	}

	#[test]
	fn malformed_json_is_a_typed_failure() {
		let text = "__KIRBY_MCP_JSON__\n{not json}\n__KIRBY_MCP_JSON_END__";
		let err = extract_marked_json(text).expect_err("should fail");
		assert!(matches!(err, ExtractError::InvalidJson(_)));
		assert!(err.to_string().contains("invalid JSON"));
	}

	#[test]
	fn missing_markers_and_bad_order() {
		assert!(matches!(extract_marked_json(""), Err(ExtractError::NotFound)));
		assert!(matches!(extract_marked_json("{\"ok\":true}"), Err(ExtractError::NotFound)));
		assert!(matches!(
			extract_marked_json("__KIRBY_MCP_JSON__\n{\"ok\":true}\n"),
			Err(ExtractError::Unterminated)
		));
		assert!(matches!(
			extract_marked_json("__KIRBY_MCP_JSON_END__\n{\"ok\":true}\n__KIRBY_MCP_JSON__\n"),
			Err(ExtractError::Unterminated)
		));
		assert!(matches!(
			extract_marked_json("__KIRBY_MCP_JSON__\n\n__KIRBY_MCP_JSON_END__\n"),
			Err(ExtractError::Empty)
		));
	}

	#[test]
	fn marker_sharing_a_line_with_noise_is_recognised() {
		let text = "Notice: undefined index__KIRBY_MCP_JSON__\r\n{\"ok\":true}\r\n__KIRBY_MCP_JSON_END__\r\n";
		let value = extract_marked_json(text).expect("extract");
		assert_eq!(value, json!({ "ok": true }));
	}

	#[test]
	fn non_object_payloads_are_returned_as_is() {
		let value = extract_marked_json(&emit_marked_json(&json!([1, 2]))).expect("extract");
		assert_eq!(value, json!([1, 2]));
	}
}
