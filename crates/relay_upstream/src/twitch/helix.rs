#![forbid(unsafe_code)]

use std::time::Duration;

use anyhow::{Context, anyhow};
use reqwest::StatusCode;
use url::Url;

use crate::SecretString;

const USERS_PATH: &str = "/helix/users";
const STREAMS_PATH: &str = "/helix/streams";
const TOP_GAMES_PATH: &str = "/helix/games/top";

/// Helix passthrough configuration.
#[derive(Debug, Clone)]
pub struct HelixConfig {
	pub base_url: String,
	pub client_id: Option<String>,
	pub user_access_token: Option<SecretString>,
	pub app_access_token: Option<SecretString>,
}

impl Default for HelixConfig {
	fn default() -> Self {
		Self {
			base_url: "https://api.twitch.tv".to_string(),
			client_id: None,
			user_access_token: None,
			app_access_token: None,
		}
	}
}

/// Thin Helix client; responses are passed through as JSON.
#[derive(Clone, Debug)]
pub struct HelixClient {
	http: reqwest::Client,
	base_url: Url,
	cfg: HelixConfig,
}

impl HelixClient {
	pub fn new(cfg: HelixConfig) -> anyhow::Result<Self> {
		let base_url = Url::parse(&cfg.base_url).with_context(|| format!("parse helix base url {}", cfg.base_url))?;
		let http = reqwest::Client::builder()
			.user_agent("relay/0.x (helix)")
			.timeout(Duration::from_secs(10))
			.build()
			.context("build reqwest client")?;
		Ok(Self { http, base_url, cfg })
	}

	/// `GET /helix/users?login=<login>` with the user token.
	pub async fn user(&self, login: &str) -> anyhow::Result<serde_json::Value> {
		let token = self
			.cfg
			.user_access_token
			.as_ref()
			.ok_or_else(|| anyhow!("TWITCH_USER_ACCESS_TOKEN environment variable not set"))?;
		self.get_json(USERS_PATH, &[("login", login)], token, "user info").await
	}

	/// `GET /helix/streams?user_login=<login>` with the user token, else the app token.
	pub async fn stream(&self, login: &str) -> anyhow::Result<serde_json::Value> {
		let token = self
			.cfg
			.user_access_token
			.as_ref()
			.or(self.cfg.app_access_token.as_ref())
			.ok_or_else(|| anyhow!("no Twitch access token configured"))?;
		self.get_json(STREAMS_PATH, &[("user_login", login)], token, "stream info")
			.await
	}

	/// `GET /helix/games/top` with the app token.
	pub async fn top_games(&self) -> anyhow::Result<serde_json::Value> {
		let token = self
			.cfg
			.app_access_token
			.as_ref()
			.ok_or_else(|| anyhow!("TWITCH_APP_ACCESS_TOKEN environment variable not set"))?;
		self.get_json(TOP_GAMES_PATH, &[], token, "top games").await
	}

	async fn get_json(
		&self,
		path: &str,
		query: &[(&str, &str)],
		token: &SecretString,
		label: &'static str,
	) -> anyhow::Result<serde_json::Value> {
		let client_id = self
			.cfg
			.client_id
			.as_deref()
			.filter(|c| !c.trim().is_empty())
			.ok_or_else(|| anyhow!("TWITCH_CLIENT_ID environment variable not set"))?;

		let mut url = self.base_url.join(path).with_context(|| format!("build helix url {path}"))?;
		if !query.is_empty() {
			url.query_pairs_mut().extend_pairs(query.iter().copied());
		}

		let resp = self
			.http
			.get(url)
			.bearer_auth(token.expose())
			.header("Client-Id", client_id)
			.send()
			.await
			.with_context(|| format!("failed to get {label}"))?;

		let status = resp.status();
		if status != StatusCode::OK {
			let body = resp.text().await.unwrap_or_default();
			return Err(anyhow!("failed to get {label}: status {}, body {body}", status.as_u16()));
		}

		resp.json::<serde_json::Value>()
			.await
			.with_context(|| format!("failed to decode {label}"))
	}
}
