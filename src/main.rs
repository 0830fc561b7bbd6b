mod config;
mod gate;
mod marked_json;
mod process;
mod protocol;
mod roots;
mod runtime;
mod server;

use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
	let config = config::load_config()?;
	server::init_tracing(&config);
	let result = server::run(config).await;
	opentelemetry::global::shutdown_tracer_provider();
	result
}
