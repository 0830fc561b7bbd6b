use anyhow::Result;
use serde_json::{json, Value};
use std::future::Future;
use tracing::debug;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Intent {
	pub confirm: bool,
	pub schema_acknowledged: bool,
}

impl Intent {
	pub fn from_args(args: &Value) -> Self {
		Self {
			confirm: parse_flag(args.get("confirm")),
			schema_acknowledged: parse_flag(args.get("validated"))
		}
	}
}

pub fn parse_flag(value: Option<&Value>) -> bool {
	match value {
		Some(Value::Bool(flag)) => *flag,
		Some(Value::String(text)) => text.eq_ignore_ascii_case("true"),
		_ => false,
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
	Disabled,
	NeedsSchemaValidation,
	NeedsConfirm,
	Confirmed,
}

#[derive(Clone, Debug)]
pub struct Gate {
	pub capability: &'static str,
	pub enabled: bool,
	pub enable_hint: &'static str,
	/// Resource the caller must read before the call is accepted.
	pub schema_resource: Option<&'static str>,
}

impl Gate {
	pub fn always_enabled(capability: &'static str) -> Self {
		Self {
			capability,
			enabled: true,
			enable_hint: "",
			schema_resource: None
		}
	}

	pub fn stage(&self, intent: Intent) -> Stage {
		if !self.enabled {
			return Stage::Disabled;
		}
		if self.schema_resource.is_some() && !intent.schema_acknowledged {
			return Stage::NeedsSchemaValidation;
		}
		if !intent.confirm {
			return Stage::NeedsConfirm;
		}
		Stage::Confirmed
	}

	pub fn disabled_response(&self) -> Value {
		json!({
			"ok": false,
			"needsEnable": true,
			"capability": self.capability,
			"message": format!("{} is disabled. {}", self.capability, self.enable_hint),
		})
	}

	pub fn schema_response(&self) -> Value {
		let resource = self.schema_resource.unwrap_or_default();
		json!({
			"ok": false,
			"needsSchemaValidation": true,
			"capability": self.capability,
			"schemaResource": resource,
			"message": format!(
				"Read {} and check your payload against the field update schema, then retry with validated=true.",
				resource
			),
		})
	}

	pub fn needs_confirm_response(&self, preview: Value) -> Value {
		json!({
			"ok": false,
			"needsConfirm": true,
			"capability": self.capability,
			"message": "Dry run only; nothing was changed. Re-run with confirm=true to apply.",
			"preview": preview,
		})
	}

	pub async fn guard<P, PF, X, XF>(&self, intent: Intent, preview: P, execute: X) -> Result<Value>
	where
		P: FnOnce() -> PF,
		PF: Future<Output = Result<Value>>,
		X: FnOnce() -> XF,
		XF: Future<Output = Result<Value>>, {
		let stage = self.stage(intent);
		debug!(capability = self.capability, stage = ?stage, "gate evaluated");
		match stage {
			Stage::Disabled => Ok(self.disabled_response()),
			Stage::NeedsSchemaValidation => Ok(self.schema_response()),
			Stage::NeedsConfirm => Ok(self.needs_confirm_response(preview().await?)),
			Stage::Confirmed => execute().await,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicUsize, Ordering};

	fn eval_gate(enabled: bool) -> Gate {
		Gate {
			capability: "kirby_eval",
			enabled,
			enable_hint: "Set KIRBY_MCP_ENABLE_EVAL=1.",
			schema_resource: None
		}
	}

	fn update_gate() -> Gate {
		Gate {
			capability: "kirby_update_page_content",
			enabled: true,
			enable_hint: "",
			schema_resource: Some("kirby://schema/page-update")
		}
	}

	async fn run(gate: &Gate, intent: Intent, executed: &AtomicUsize, previewed: &AtomicUsize) -> Value {
		gate.guard(
			intent,
			|| async {
				previewed.fetch_add(1, Ordering::SeqCst);
				Ok(json!({ "changes": ["title"] }))
			},
			|| async {
				executed.fetch_add(1, Ordering::SeqCst);
				Ok(json!({ "ok": true }))
			}
		).await.expect("guard")
	}

	#[tokio::test]
	async fn disabled_beats_confirm() {
		let (executed, previewed) = (AtomicUsize::new(0), AtomicUsize::new(0));
		let intent = Intent { confirm: true, schema_acknowledged: true };
		let response = run(&eval_gate(false), intent, &executed, &previewed).await;
		assert_eq!(response["needsEnable"], json!(true));
		assert_eq!(response["ok"], json!(false));
		assert!(response["message"].as_str().unwrap_or("").contains("KIRBY_MCP_ENABLE_EVAL"));
		assert_eq!(executed.load(Ordering::SeqCst), 0);
		assert_eq!(previewed.load(Ordering::SeqCst), 0);
	}

	#[tokio::test]
	async fn unconfirmed_call_only_previews() {
		let (executed, previewed) = (AtomicUsize::new(0), AtomicUsize::new(0));
		let response = run(&eval_gate(true), Intent::default(), &executed, &previewed).await;
		assert_eq!(response["needsConfirm"], json!(true));
		assert_eq!(response["ok"], json!(false));
		assert_eq!(response["preview"]["changes"], json!(["title"]));
		assert_eq!(executed.load(Ordering::SeqCst), 0);
		assert_eq!(previewed.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn schema_acknowledgement_precedes_preview_and_confirm() {
		let (executed, previewed) = (AtomicUsize::new(0), AtomicUsize::new(0));
		let intent = Intent { confirm: true, schema_acknowledged: false };
		let response = run(&update_gate(), intent, &executed, &previewed).await;
		assert_eq!(response["needsSchemaValidation"], json!(true));
		assert_eq!(response["schemaResource"], json!("kirby://schema/page-update"));
		assert_eq!(executed.load(Ordering::SeqCst) + previewed.load(Ordering::SeqCst), 0);
	}

	#[tokio::test]
	async fn confirmed_call_executes() {
		let (executed, previewed) = (AtomicUsize::new(0), AtomicUsize::new(0));
		let intent = Intent { confirm: true, schema_acknowledged: true };
		let response = run(&update_gate(), intent, &executed, &previewed).await;
		assert_eq!(response, json!({ "ok": true }));
		assert_eq!(executed.load(Ordering::SeqCst), 1);
		assert_eq!(previewed.load(Ordering::SeqCst), 0);
	}

	#[test]
	fn intent_accepts_string_flags() {
		let intent = Intent::from_args(&json!({ "confirm": "TRUE", "validated": true }));
		assert_eq!(intent, Intent { confirm: true, schema_acknowledged: true });
		assert_eq!(Intent::from_args(&json!({ "confirm": 1 })), Intent::default());
		assert_eq!(Gate::always_enabled("kirby_cli").stage(Intent::default()), Stage::NeedsConfirm);
	}
}
