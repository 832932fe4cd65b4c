#![forbid(unsafe_code)]

use std::time::Duration;

use relay_domain::RelayEvent;
use relay_upstream::UpstreamError;
use tokio::time::timeout;

use crate::adapters::LoopbackConnector;
use crate::server::bot::{BotCommandProcessor, DEFAULT_COMMANDS, reply_for};
use crate::server::test_support::{QUIET, WAIT, chan, eventually, ready, registry, registry_with};
use crate::server::upstream::UpstreamOptions;

#[test]
fn replies_match_by_prefix() {
	assert_eq!(reply_for(DEFAULT_COMMANDS, "!ping"), Some("pong"));
	assert_eq!(reply_for(DEFAULT_COMMANDS, "!ping please"), Some("pong"));
	assert_eq!(reply_for(DEFAULT_COMMANDS, "foobar"), Some("bar"));
	assert_eq!(reply_for(DEFAULT_COMMANDS, "say !ping"), None);
	assert_eq!(reply_for(DEFAULT_COMMANDS, ""), None);
}

#[tokio::test]
async fn ping_gets_exactly_one_pong() {
	let loopback = LoopbackConnector::new();
	let registry = registry(&loopback);
	let ch = chan("botchan");

	let _bot = BotCommandProcessor::new(registry.clone(), ch.clone(), WAIT).spawn();
	assert!(eventually(|| registry.observer_count(&ch) == 1).await);
	ready(&registry, &ch).await;

	loopback.inject(RelayEvent::chat(ch.clone(), "viewer", "!ping"));
	assert!(eventually(|| !loopback.said().is_empty()).await);
	tokio::time::sleep(QUIET).await;

	assert_eq!(loopback.said(), vec![(ch.clone(), "pong".to_string())]);
	assert!(registry.get(&ch).is_some_and(|c| !c.is_pinned()));
	assert_eq!(registry.observer_count(&ch), 1);
}

#[tokio::test]
async fn ordinary_chat_and_notices_get_no_reply() {
	let loopback = LoopbackConnector::new();
	let registry = registry(&loopback);
	let ch = chan("calmchan");

	let _bot = BotCommandProcessor::new(registry.clone(), ch.clone(), WAIT).spawn();
	assert!(eventually(|| registry.observer_count(&ch) == 1).await);
	ready(&registry, &ch).await;

	loopback.inject(RelayEvent::chat(ch.clone(), "viewer", "hello everyone"));
	loopback.inject(RelayEvent::Notice {
		channel: ch.clone(),
		system: "!ping".to_string(),
	});
	tokio::time::sleep(QUIET).await;

	assert!(loopback.said().is_empty());
}

#[tokio::test]
async fn custom_commands_replace_the_defaults() {
	const COMMANDS: &[(&str, &str)] = &[("!hello", "hi there")];

	let loopback = LoopbackConnector::new();
	let registry = registry(&loopback);
	let ch = chan("customchan");

	let _bot = BotCommandProcessor::new(registry.clone(), ch.clone(), WAIT)
		.with_commands(COMMANDS)
		.spawn();
	assert!(eventually(|| registry.observer_count(&ch) == 1).await);
	ready(&registry, &ch).await;

	loopback.inject(RelayEvent::chat(ch.clone(), "viewer", "!ping"));
	loopback.inject(RelayEvent::chat(ch.clone(), "viewer", "!hello bot"));
	assert!(eventually(|| !loopback.said().is_empty()).await);
	tokio::time::sleep(QUIET).await;

	assert_eq!(loopback.said(), vec![(ch, "hi there".to_string())]);
}

#[tokio::test]
async fn bot_exits_without_credentials() {
	let loopback = LoopbackConnector::new();
	let registry = registry_with(
		&loopback,
		Err(UpstreamError::MissingCredentials("bot username (TWITCH_BOT_USERNAME)")),
		UpstreamOptions::default(),
	);

	let bot = BotCommandProcessor::new(registry.clone(), chan("nobot"), WAIT).spawn();
	timeout(WAIT, bot).await.expect("bot stops").expect("bot task");
	assert!(registry.is_empty());
	assert_eq!(loopback.connect_count(), 0);
}

#[tokio::test]
async fn bot_exits_when_the_connection_never_becomes_ready() {
	let loopback = LoopbackConnector::new();
	loopback.fail_next_connects(1);
	let registry = registry(&loopback);
	let ch = chan("deadchan");

	let bot = BotCommandProcessor::new(registry.clone(), ch.clone(), Duration::from_millis(500)).spawn();
	timeout(WAIT, bot).await.expect("bot stops").expect("bot task");
	assert_eq!(registry.observer_count(&ch), 0);
}
