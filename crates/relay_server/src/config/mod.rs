#![forbid(unsafe_code)]

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use relay_domain::ChannelName;
use relay_upstream::SecretString;
use serde::Deserialize;
use tracing::{debug, info, warn};

const DEFAULT_BIND: &str = "0.0.0.0:3000";
const DEFAULT_IRC_WS_URL: &str = "wss://irc-ws.chat.twitch.tv:443";
const DEFAULT_HELIX_BASE_URL: &str = "https://api.twitch.tv";
const DEFAULT_BOT_CHANNEL: &str = "fraktalcow";

/// Default config path: `~/.relay/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".relay").join("config.toml"))
}

/// Load the server config from TOML and process env overrides.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg)?;

	apply_env_overrides(&mut cfg, |key| std::env::var(key).ok());
	cfg.relay.normalize();

	Ok(cfg)
}

/// Server config.
#[derive(Debug, Clone)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub twitch: TwitchSettings,
	pub relay: RelaySettings,
	pub bot: BotSettings,
}

/// Listener settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// Public HTTP/WebSocket bind address.
	pub bind: SocketAddr,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Optional health/readiness HTTP bind address (host:port).
	pub health_bind: Option<String>,
}

/// Twitch identity and endpoints.
#[derive(Debug, Clone)]
pub struct TwitchSettings {
	/// Login name of the bot account every upstream session uses.
	pub bot_username: Option<String>,
	/// Chat bearer token for the bot account.
	pub user_access_token: Option<SecretString>,
	pub client_id: Option<String>,
	/// App token for Helix endpoints that don't need a user.
	pub app_access_token: Option<SecretString>,
	pub irc_ws_url: String,
	pub helix_base_url: String,
}

/// Relay core tuning.
#[derive(Debug, Clone)]
pub struct RelaySettings {
	pub subscriber_queue_capacity: usize,
	pub send_ready_timeout: Duration,
	/// Retries after a failed or dropped upstream session (0 = no retry).
	pub connect_retries: u32,
	pub reconnect_min_delay: Duration,
	pub reconnect_max_delay: Duration,
}

impl RelaySettings {
	fn normalize(&mut self) {
		if self.subscriber_queue_capacity == 0 {
			warn!("relay config: subscriber_queue_capacity must be > 0; using 1");
			self.subscriber_queue_capacity = 1;
		}
		if self.reconnect_min_delay > self.reconnect_max_delay {
			warn!(
				min_ms = self.reconnect_min_delay.as_millis(),
				max_ms = self.reconnect_max_delay.as_millis(),
				"relay config: reconnect min delay exceeds max; swapping"
			);
			std::mem::swap(&mut self.reconnect_min_delay, &mut self.reconnect_max_delay);
		}
	}
}

/// Command bot settings.
#[derive(Debug, Clone)]
pub struct BotSettings {
	pub enabled: bool,
	pub channel: ChannelName,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	twitch: FileTwitchSettings,

	#[serde(default)]
	relay: FileRelaySettings,

	#[serde(default)]
	bot: FileBotSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	bind: Option<String>,
	metrics_bind: Option<String>,
	health_bind: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileTwitchSettings {
	bot_username: Option<String>,
	user_access_token: Option<String>,
	client_id: Option<String>,
	app_access_token: Option<String>,
	irc_ws_url: Option<String>,
	helix_base_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileRelaySettings {
	subscriber_queue_capacity: Option<usize>,
	send_ready_timeout_ms: Option<u64>,
	connect_retries: Option<u32>,
	reconnect_min_delay_ms: Option<u64>,
	reconnect_max_delay_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileBotSettings {
	enabled: Option<bool>,
	channel: Option<String>,
}

fn default_bind() -> SocketAddr {
	SocketAddr::from(([0, 0, 0, 0], 3000))
}

fn default_bot_channel() -> anyhow::Result<ChannelName> {
	ChannelName::new(DEFAULT_BOT_CHANNEL).context("default bot channel")
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> anyhow::Result<Self> {
		let bind = match file.server.bind.filter(|s| !s.trim().is_empty()) {
			Some(raw) => raw.trim().parse().unwrap_or_else(|e| {
				warn!(error = %e, bind = %raw, default = DEFAULT_BIND, "server config: invalid bind; using default");
				default_bind()
			}),
			None => default_bind(),
		};

		let bot_channel = match file.bot.channel.filter(|s| !s.trim().is_empty()) {
			Some(raw) => match ChannelName::new(raw.as_str()) {
				Ok(channel) => channel,
				Err(e) => {
					warn!(error = %e, channel = %raw, "bot config: invalid channel; using default");
					default_bot_channel()?
				}
			},
			None => default_bot_channel()?,
		};

		Ok(Self {
			server: ServerSettings {
				bind,
				metrics_bind: file.server.metrics_bind.filter(|s| !s.trim().is_empty()),
				health_bind: file.server.health_bind.filter(|s| !s.trim().is_empty()),
			},
			twitch: TwitchSettings {
				bot_username: file.twitch.bot_username.filter(|s| !s.trim().is_empty()),
				user_access_token: file
					.twitch
					.user_access_token
					.filter(|s| !s.trim().is_empty())
					.map(SecretString::new),
				client_id: file.twitch.client_id.filter(|s| !s.trim().is_empty()),
				app_access_token: file
					.twitch
					.app_access_token
					.filter(|s| !s.trim().is_empty())
					.map(SecretString::new),
				irc_ws_url: file
					.twitch
					.irc_ws_url
					.filter(|s| !s.trim().is_empty())
					.unwrap_or_else(|| DEFAULT_IRC_WS_URL.to_string()),
				helix_base_url: file
					.twitch
					.helix_base_url
					.filter(|s| !s.trim().is_empty())
					.unwrap_or_else(|| DEFAULT_HELIX_BASE_URL.to_string()),
			},
			relay: RelaySettings {
				subscriber_queue_capacity: file.relay.subscriber_queue_capacity.unwrap_or(100),
				send_ready_timeout: Duration::from_millis(file.relay.send_ready_timeout_ms.unwrap_or(10_000)),
				connect_retries: file.relay.connect_retries.unwrap_or(0),
				reconnect_min_delay: Duration::from_millis(file.relay.reconnect_min_delay_ms.unwrap_or(500)),
				reconnect_max_delay: Duration::from_millis(file.relay.reconnect_max_delay_ms.unwrap_or(30_000)),
			},
			bot: BotSettings {
				enabled: file.bot.enabled.unwrap_or(true),
				channel: bot_channel,
			},
		})
	}
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn non_empty(v: Option<String>) -> Option<String> {
	v.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn apply_env_overrides(cfg: &mut ServerConfig, env: impl Fn(&str) -> Option<String>) {
	if let Some(v) = non_empty(env("PORT")) {
		match v.parse::<u16>() {
			Ok(port) => {
				cfg.server.bind.set_port(port);
				info!(port, "server config: port overridden by env");
			}
			Err(e) => warn!(error = %e, port = %v, "server config: invalid PORT ignored"),
		}
	}

	if let Some(v) = non_empty(env("RELAY_METRICS_BIND")) {
		cfg.server.metrics_bind = Some(v);
		info!("server config: metrics_bind overridden by env");
	}

	if let Some(v) = non_empty(env("RELAY_HEALTH_BIND")) {
		cfg.server.health_bind = Some(v);
		info!("server config: health_bind overridden by env");
	}

	if let Some(v) = non_empty(env("TWITCH_BOT_USERNAME")) {
		cfg.twitch.bot_username = Some(v);
		info!("twitch config: bot_username overridden by env");
	}

	if let Some(v) = non_empty(env("TWITCH_USER_ACCESS_TOKEN")) {
		cfg.twitch.user_access_token = Some(SecretString::new(v));
		info!("twitch config: user_access_token overridden by env");
	}

	if let Some(v) = non_empty(env("TWITCH_CLIENT_ID")) {
		cfg.twitch.client_id = Some(v);
		info!("twitch config: client_id overridden by env");
	}

	if let Some(v) = non_empty(env("TWITCH_APP_ACCESS_TOKEN")) {
		cfg.twitch.app_access_token = Some(SecretString::new(v));
		info!("twitch config: app_access_token overridden by env");
	}

	if let Some(v) = non_empty(env("RELAY_TWITCH_IRC_WS_URL")) {
		cfg.twitch.irc_ws_url = v;
		info!("twitch config: irc_ws_url overridden by env");
	}

	if let Some(v) = non_empty(env("RELAY_TWITCH_HELIX_BASE_URL")) {
		cfg.twitch.helix_base_url = v;
		info!("twitch config: helix_base_url overridden by env");
	}

	if let Some(v) = env("RELAY_SUBSCRIBER_QUEUE_CAPACITY")
		&& let Ok(capacity) = v.trim().parse::<usize>()
	{
		cfg.relay.subscriber_queue_capacity = capacity;
		info!(capacity, "relay config: subscriber_queue_capacity overridden by env");
	}

	if let Some(v) = env("RELAY_SEND_READY_TIMEOUT_MS")
		&& let Ok(ms) = v.trim().parse::<u64>()
	{
		cfg.relay.send_ready_timeout = Duration::from_millis(ms);
		info!(ms, "relay config: send_ready_timeout overridden by env");
	}

	if let Some(v) = env("RELAY_CONNECT_RETRIES")
		&& let Ok(retries) = v.trim().parse::<u32>()
	{
		cfg.relay.connect_retries = retries;
		info!(retries, "relay config: connect_retries overridden by env");
	}

	if let Some(v) = env("RELAY_RECONNECT_MIN_DELAY_MS")
		&& let Ok(ms) = v.trim().parse::<u64>()
	{
		cfg.relay.reconnect_min_delay = Duration::from_millis(ms);
		debug!("relay config: reconnect_min_delay overridden by env");
	}

	if let Some(v) = env("RELAY_RECONNECT_MAX_DELAY_MS")
		&& let Ok(ms) = v.trim().parse::<u64>()
	{
		cfg.relay.reconnect_max_delay = Duration::from_millis(ms);
		debug!("relay config: reconnect_max_delay overridden by env");
	}

	if let Some(v) = env("RELAY_BOT_ENABLED")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.bot.enabled = enabled;
		info!(enabled, "bot config: enabled overridden by env");
	}

	if let Some(v) = non_empty(env("RELAY_BOT_CHANNEL")) {
		match ChannelName::new(v.as_str()) {
			Ok(channel) => {
				cfg.bot.channel = channel;
				info!("bot config: channel overridden by env");
			}
			Err(e) => warn!(error = %e, channel = %v, "bot config: invalid RELAY_BOT_CHANNEL ignored"),
		}
	}
}

#[cfg(test)]
mod tests {
	use std::collections::HashMap;

	use super::*;

	fn parse(toml_src: &str) -> ServerConfig {
		let file: FileConfig = toml::from_str(toml_src).expect("valid toml");
		ServerConfig::from_file(file).expect("config")
	}

	fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
		let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
		move |key| map.get(key).cloned()
	}

	#[test]
	fn empty_file_uses_defaults() {
		let cfg = parse("");
		assert_eq!(cfg.server.bind, default_bind());
		assert_eq!(cfg.relay.subscriber_queue_capacity, 100);
		assert_eq!(cfg.relay.send_ready_timeout, Duration::from_secs(10));
		assert_eq!(cfg.relay.connect_retries, 0);
		assert!(cfg.bot.enabled);
		assert_eq!(cfg.bot.channel.as_str(), "fraktalcow");
		assert_eq!(cfg.twitch.irc_ws_url, DEFAULT_IRC_WS_URL);
		assert!(cfg.twitch.bot_username.is_none());
		assert!(cfg.twitch.user_access_token.is_none());
	}

	#[test]
	fn file_values_are_read_and_blanks_ignored() {
		let cfg = parse(
			r##"
			[server]
			bind = "127.0.0.1:8080"
			metrics_bind = "  "

			[twitch]
			bot_username = "relaybot"
			user_access_token = "tok"

			[relay]
			subscriber_queue_capacity = 8
			connect_retries = 3

			[bot]
			enabled = false
			channel = "#SomeChan"
			"##,
		);
		assert_eq!(cfg.server.bind, "127.0.0.1:8080".parse::<SocketAddr>().unwrap());
		assert!(cfg.server.metrics_bind.is_none());
		assert_eq!(cfg.twitch.bot_username.as_deref(), Some("relaybot"));
		assert_eq!(cfg.twitch.user_access_token.as_ref().map(|t| t.expose()), Some("tok"));
		assert_eq!(cfg.relay.subscriber_queue_capacity, 8);
		assert_eq!(cfg.relay.connect_retries, 3);
		assert!(!cfg.bot.enabled);
		assert_eq!(cfg.bot.channel.as_str(), "SomeChan");
	}

	#[test]
	fn env_overrides_file_values() {
		let mut cfg = parse("[twitch]\nbot_username = \"from_file\"\n");
		apply_env_overrides(
			&mut cfg,
			env_of(&[
				("PORT", "4000"),
				("TWITCH_BOT_USERNAME", "from_env"),
				("TWITCH_USER_ACCESS_TOKEN", " secret "),
				("RELAY_BOT_ENABLED", "off"),
				("RELAY_BOT_CHANNEL", "otherchan"),
				("RELAY_CONNECT_RETRIES", "2"),
			]),
		);
		assert_eq!(cfg.server.bind.port(), 4000);
		assert_eq!(cfg.twitch.bot_username.as_deref(), Some("from_env"));
		assert_eq!(cfg.twitch.user_access_token.as_ref().map(|t| t.expose()), Some("secret"));
		assert!(!cfg.bot.enabled);
		assert_eq!(cfg.bot.channel.as_str(), "otherchan");
		assert_eq!(cfg.relay.connect_retries, 2);
	}

	#[test]
	fn invalid_env_values_are_ignored() {
		let mut cfg = parse("");
		apply_env_overrides(
			&mut cfg,
			env_of(&[("PORT", "not-a-port"), ("RELAY_BOT_ENABLED", "maybe"), ("RELAY_BOT_CHANNEL", "a b")]),
		);
		assert_eq!(cfg.server.bind, default_bind());
		assert!(cfg.bot.enabled);
		assert_eq!(cfg.bot.channel.as_str(), "fraktalcow");
	}

	#[test]
	fn inverted_reconnect_bounds_are_swapped() {
		let mut cfg = parse("[relay]\nreconnect_min_delay_ms = 9000\nreconnect_max_delay_ms = 100\n");
		cfg.relay.normalize();
		assert_eq!(cfg.relay.reconnect_min_delay, Duration::from_millis(100));
		assert_eq!(cfg.relay.reconnect_max_delay, Duration::from_millis(9000));
	}
}
