#![forbid(unsafe_code)]

mod adapters;
mod config;
mod server;
mod util;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use relay_upstream::twitch::{HelixClient, HelixConfig, TwitchIrcConfig, TwitchIrcConnector};
use relay_upstream::{BotCredentials, ChatConnector, SecretString};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::adapters::LoopbackConnector;
use crate::server::bot::BotCommandProcessor;
use crate::server::health::{HealthState, spawn_health_server};
use crate::server::http::{AppState, bind, serve};
use crate::server::multiplexer::{MultiplexerConfig, RelayMultiplexer};
use crate::server::registry::ConnectionRegistry;
use crate::server::upstream::UpstreamOptions;

/// Dev-only loopback upstream enable flag.
const RELAY_ENABLE_LOOPBACK_UPSTREAM_ENV: &str = "RELAY_ENABLE_LOOPBACK_UPSTREAM";

/// Config path override.
const RELAY_CONFIG_ENV: &str = "RELAY_CONFIG";

struct Args {
	bind: Option<SocketAddr>,
	config: Option<PathBuf>,
}

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: relay_server [--bind host:port] [--config path]\n\
\n\
Options:\n\
\t--bind     HTTP bind address (default: 0.0.0.0:3000, or PORT from env)\n\
\t--config   Config file (default: $RELAY_CONFIG or ~/.relay/config.toml)\n\
\t--help     Show this help\n\
"
	);
	std::process::exit(2)
}

fn parse_args() -> Args {
	let mut args = Args { bind: None, config: None };

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--bind" | "--listen" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				let addr = v.trim().parse::<SocketAddr>().unwrap_or_else(|e| {
					eprintln!("--bind: {e} (expected host:port)");
					usage_and_exit();
				});
				args.bind = Some(addr);
			}
			"--config" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--config must be non-empty");
					usage_and_exit();
				}
				args.config = Some(PathBuf::from(v));
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	args
}

fn init_rustls_crypto_provider() {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,relay_server=debug".to_string());

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
				let tracer = tracer_provider.tracer("relay_server");
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

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<std::net::SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

fn loopback_enabled() -> bool {
	cfg!(debug_assertions)
		&& std::env::var(RELAY_ENABLE_LOOPBACK_UPSTREAM_ENV)
			.map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
			.unwrap_or(false)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_rustls_crypto_provider();
	let dotenv = dotenvy::dotenv();
	init_tracing();

	match dotenv {
		Ok(path) => info!(path = %path.display(), "loaded .env"),
		Err(e) if e.not_found() => warn!(".env not found; using process environment only"),
		Err(e) => warn!(error = %e, "failed to load .env"),
	}

	let args = parse_args();

	let config_path = match args.config {
		Some(path) => path,
		None => match std::env::var(RELAY_CONFIG_ENV).ok().filter(|v| !v.trim().is_empty()) {
			Some(path) => PathBuf::from(path),
			None => crate::config::default_config_path()?,
		},
	};
	let mut server_cfg = crate::config::load_server_config_from_path(&config_path)?;
	if let Some(bind) = args.bind {
		server_cfg.server.bind = bind;
	}
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	init_metrics(server_cfg.server.metrics_bind.as_deref());

	let loopback = loopback_enabled();
	let connector: Arc<dyn ChatConnector> = if loopback {
		info!(
			env = RELAY_ENABLE_LOOPBACK_UPSTREAM_ENV,
			"using dev-only loopback upstream (enabled by env)"
		);
		Arc::new(LoopbackConnector::new().with_emit_interval(std::time::Duration::from_secs(1)))
	} else {
		Arc::new(TwitchIrcConnector::new(TwitchIrcConfig {
			irc_ws_url: server_cfg.twitch.irc_ws_url.clone(),
			..TwitchIrcConfig::default()
		}))
	};

	let credentials = if loopback {
		BotCredentials::from_parts(
			Some(server_cfg.twitch.bot_username.as_deref().unwrap_or("loopback_bot")),
			Some(
				&server_cfg
					.twitch
					.user_access_token
					.clone()
					.unwrap_or_else(|| SecretString::new("loopback")),
			),
		)
	} else {
		BotCredentials::from_parts(
			server_cfg.twitch.bot_username.as_deref(),
			server_cfg.twitch.user_access_token.as_ref(),
		)
	};
	if let Err(e) = &credentials {
		warn!(error = %e, "bot credentials incomplete; subscribe and send will fail until configured");
	}

	let registry = Arc::new(ConnectionRegistry::new(
		connector,
		credentials,
		UpstreamOptions {
			connect_retries: server_cfg.relay.connect_retries,
			reconnect_min_delay: server_cfg.relay.reconnect_min_delay,
			reconnect_max_delay: server_cfg.relay.reconnect_max_delay,
		},
	));

	let health_state = HealthState::new(Some(Arc::clone(&registry)));
	if let Some(bind) = server_cfg.server.health_bind.as_deref() {
		match bind.parse::<std::net::SocketAddr>() {
			Ok(addr) => {
				spawn_health_server(addr, health_state.clone());
				info!(%addr, "health server listening");
			}
			Err(e) => warn!(error = %e, %bind, "invalid health bind address (expected host:port)"),
		}
	}

	let mux = RelayMultiplexer::new(
		Arc::clone(&registry),
		MultiplexerConfig {
			subscriber_queue_capacity: server_cfg.relay.subscriber_queue_capacity,
			send_ready_timeout: server_cfg.relay.send_ready_timeout,
			..MultiplexerConfig::default()
		},
	);

	let helix = match HelixClient::new(HelixConfig {
		base_url: server_cfg.twitch.helix_base_url.clone(),
		client_id: server_cfg.twitch.client_id.clone(),
		user_access_token: server_cfg.twitch.user_access_token.clone(),
		app_access_token: server_cfg.twitch.app_access_token.clone(),
	}) {
		Ok(client) => Some(Arc::new(client)),
		Err(e) => {
			warn!(error = %e, "helix client unavailable");
			None
		}
	};

	if server_cfg.bot.enabled {
		info!(
			channel = %server_cfg.bot.channel,
			bot = registry.bot_username().unwrap_or("<unset>"),
			token_len = server_cfg.twitch.user_access_token.as_ref().map_or(0, SecretString::len),
			"[bot] starting command processor"
		);
		BotCommandProcessor::new(
			Arc::clone(&registry),
			server_cfg.bot.channel.clone(),
			server_cfg.relay.send_ready_timeout,
		)
		.spawn();
	}

	let listener = bind(server_cfg.server.bind)
		.await
		.with_context(|| format!("bind http listener on {}", server_cfg.server.bind))?;
	health_state.mark_ready();

	tokio::select! {
		res = serve(listener, AppState { mux, helix }) => {
			if let Err(e) = res {
				warn!(error = %e, "http listener stopped");
			}
		}
		_ = tokio::signal::ctrl_c() => {
			info!("shutdown requested");
		}
	}

	health_state.mark_not_ready();
	registry.shutdown_all().await;
	info!("relay_server stopped");

	Ok(())
}
