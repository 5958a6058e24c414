#![forbid(unsafe_code)]

mod bridge;
mod config;
mod db;
mod transports;
mod util;

use std::path::PathBuf;
use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusHandle;
use tandem_platform::{HttpUpdateChecker, LocalNetwork, RemoteConnector, UpdateChecker};
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::bridge::orchestrator::{Bridge, BridgeDeps};
use crate::transports::{DemoConnector, LoggingLocalNetwork, NullConnector};

/// Dev-only demo transport enable flag.
const TANDEM_ENABLE_DEMO_TRANSPORT_ENV: &str = "TANDEM_ENABLE_DEMO_TRANSPORT";

/// Exit code for fatal startup errors.
const EXIT_STARTUP_FAILED: i32 = 15;

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: tandem_server [--config path]\n\
\n\
Options:\n\
\t--config  Config file (default: ~/.tandem/config.toml)\n\
\t--help    Show this help\n\
"
	);
	std::process::exit(2)
}

fn parse_args() -> Option<PathBuf> {
	let mut config_path = None;

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--config" | "-c" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--config must be non-empty");
					usage_and_exit();
				}
				config_path = Some(PathBuf::from(v));
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	config_path
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,tandem_server=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	if let Some(endpoint) = otlp_endpoint {
		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.with_endpoint(endpoint.clone())
			.build()
		{
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
					.with_batch_exporter(exporter)
					.build();
				let tracer = tracer_provider.tracer("tandem_server");
				global::set_tracer_provider(tracer_provider);

				let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
				base.with(otel_layer).init();
				info!(endpoint = %endpoint, "otlp tracing enabled");
			}
			Err(e) => {
				base.init();
				warn!(error = %e, "failed to initialize otlp tracing");
			}
		}
	} else {
		base.init();
	}
}

fn init_metrics(enabled: bool) -> Option<PrometheusHandle> {
	if !enabled {
		return None;
	}

	match metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder() {
		Ok(handle) => {
			info!("prometheus recorder installed");
			Some(handle)
		}
		Err(e) => {
			warn!(error = %e, "failed to install metrics recorder");
			None
		}
	}
}

fn env_flag(name: &str) -> bool {
	std::env::var(name)
		.map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
		.unwrap_or(false)
}

fn build_deps(cfg: &config::BridgeConfig) -> BridgeDeps {
	let demo_enabled = cfg!(debug_assertions) && env_flag(TANDEM_ENABLE_DEMO_TRANSPORT_ENV);

	let connector: Arc<dyn RemoteConnector> = if demo_enabled {
		info!(
			env = TANDEM_ENABLE_DEMO_TRANSPORT_ENV,
			"using dev-only demo transport (enabled by env)"
		);
		Arc::new(DemoConnector::new())
	} else {
		Arc::new(NullConnector::new())
	};

	let update_checker: Option<Arc<dyn UpdateChecker>> = match HttpUpdateChecker::new(&cfg.remote.update_check_url) {
		Ok(checker) => Some(Arc::new(checker)),
		Err(e) => {
			warn!(error = %e, url = %cfg.remote.update_check_url, "protocol update checks disabled");
			None
		}
	};

	let local: Arc<dyn LocalNetwork> = Arc::new(LoggingLocalNetwork::new());

	BridgeDeps {
		connector,
		local,
		update_checker,
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();

	let config_path = match parse_args() {
		Some(path) => path,
		None => crate::config::default_config_path()?,
	};
	let bridge_cfg = crate::config::load_bridge_config_from_path(&config_path)?;
	info!(
		path = %config_path.display(),
		device = ?bridge_cfg.remote.device_platform(),
		"loaded bridge config (toml + env overrides)"
	);

	let metrics = init_metrics(bridge_cfg.server.metrics_enabled);
	let deps = build_deps(&bridge_cfg);

	let bridge = match Bridge::init(bridge_cfg, deps, metrics).await {
		Ok(bridge) => bridge,
		Err(e) => {
			error!(error = %format!("{e:#}"), "bridge initialization failed");
			std::process::exit(EXIT_STARTUP_FAILED);
		}
	};

	if let Err(e) = bridge.start().await {
		error!(error = %format!("{e:#}"), "bridge failed to start");
		bridge.stop().await;
		std::process::exit(EXIT_STARTUP_FAILED);
	}

	if let Err(e) = tokio::signal::ctrl_c().await {
		warn!(error = %e, "failed to listen for shutdown signal");
	}
	let status = bridge.status();
	info!(users = status.users, connected = status.connected, "shutdown requested");
	bridge.stop().await;

	Ok(())
}
