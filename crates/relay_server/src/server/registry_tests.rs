#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use relay_domain::{Preferences, RelayEvent, SubscriberId};
use relay_upstream::UpstreamError;
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::adapters::LoopbackConnector;
use crate::server::error::RelayError;
use crate::server::registry::{Detached, Released};
use crate::server::test_support::{WAIT, chan, creds, eventually, ready, registry, registry_with};
use crate::server::upstream::{ConnectionState, Observer, ObserverQueue, UpstreamOptions};

fn events_observer(id: u64, channel: &str) -> (Observer, mpsc::Receiver<RelayEvent>) {
	let (tx, rx) = mpsc::channel(16);
	let observer = Observer {
		id: SubscriberId(id),
		channel: chan(channel),
		prefs: Arc::new(RwLock::new(Preferences::default())),
		queue: ObserverQueue::Events(tx),
	};
	(observer, rx)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_ensure_connected_shares_one_connection() {
	let loopback = LoopbackConnector::new();
	let registry = registry(&loopback);
	let ch = chan("racechan");

	let mut handles = Vec::new();
	for _ in 0..16 {
		let registry = Arc::clone(&registry);
		let ch = ch.clone();
		handles.push(tokio::spawn(async move { registry.ensure_connected(&ch).expect("connect").0 }));
	}

	let mut conns = Vec::new();
	for h in handles {
		conns.push(h.await.expect("task"));
	}
	assert!(conns.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));

	ready(&registry, &ch).await;
	assert_eq!(registry.len(), 1);
	assert_eq!(loopback.connect_count(), 1);
	assert_eq!(loopback.joined_sessions(&ch), 1);
}

#[tokio::test]
async fn missing_credentials_fail_without_side_effects() {
	let loopback = LoopbackConnector::new();
	let registry = registry_with(
		&loopback,
		Err(UpstreamError::MissingCredentials("bot username (TWITCH_BOT_USERNAME)")),
		UpstreamOptions::default(),
	);

	let err = registry.ensure_connected(&chan("nochan")).expect_err("must fail");
	assert!(matches!(err, RelayError::Configuration(_)), "got {err:?}");
	assert!(registry.is_empty());
	assert_eq!(loopback.connect_count(), 0);
	assert!(registry.bot_username().is_none());
}

#[tokio::test]
async fn last_observer_out_disconnects() {
	let loopback = LoopbackConnector::new();
	let registry = registry(&loopback);
	let ch = chan("sharedchan");

	let (a, _rx_a) = events_observer(1, "sharedchan");
	let (b, _rx_b) = events_observer(2, "sharedchan");
	let first = registry.attach(a).expect("attach a");
	let second = registry.attach(b).expect("attach b");
	assert!(first.created);
	assert!(!second.created);
	assert!(Arc::ptr_eq(&first.conn, &second.conn));
	assert_eq!(registry.observer_count(&ch), 2);

	assert_eq!(registry.detach(&ch, SubscriberId(1)), Detached::Remaining(1));
	assert!(registry.is_connected(&ch));

	assert_eq!(registry.detach(&ch, SubscriberId(2)), Detached::Disconnected);
	assert!(!registry.is_connected(&ch));
	assert!(registry.is_empty());

	timeout(WAIT, first.conn.terminated()).await.expect("task stopped");
	assert_eq!(first.conn.state(), ConnectionState::Closed);
	assert!(eventually(|| loopback.joined_sessions(&ch) == 0).await);

	assert_eq!(registry.detach(&ch, SubscriberId(2)), Detached::NotAttached);
}

#[tokio::test]
async fn pinned_connection_outlives_its_observers() {
	let loopback = LoopbackConnector::new();
	let registry = registry(&loopback);
	let ch = chan("pinnedchan");

	let (conn, newly_pinned) = registry.pin(&ch).expect("pin");
	assert!(newly_pinned);
	assert!(conn.is_pinned());

	let (obs, _rx) = events_observer(7, "pinnedchan");
	registry.attach(obs).expect("attach");
	assert_eq!(registry.detach(&ch, SubscriberId(7)), Detached::Remaining(0));
	assert!(registry.is_connected(&ch));

	assert_eq!(registry.release(&ch), Released::Disconnected);
	assert_eq!(registry.release(&ch), Released::NotPinned);
	assert!(registry.is_empty());
	timeout(WAIT, conn.terminated()).await.expect("task stopped");
}

#[tokio::test]
async fn release_keeps_connection_while_observers_remain() {
	let loopback = LoopbackConnector::new();
	let registry = registry(&loopback);
	let ch = chan("heldchan");

	let (obs, mut rx) = events_observer(8, "heldchan");
	let conn = registry.attach(obs).expect("attach").conn;
	registry.pin(&ch).expect("pin");
	conn.wait_ready(WAIT).await.expect("ready");

	assert_eq!(registry.release(&ch), Released::Unpinned { observers: 1 });
	assert!(!conn.is_pinned());
	assert!(registry.is_connected(&ch));
	assert_eq!(conn.state(), ConnectionState::Ready);

	loopback.inject(RelayEvent::chat(ch.clone(), "carol", "still here"));
	let ev = timeout(WAIT, rx.recv()).await.expect("event").expect("open");
	assert!(matches!(ev, RelayEvent::ChatMessage { ref message, .. } if message == "still here"));

	assert_eq!(registry.detach(&ch, SubscriberId(8)), Detached::Disconnected);
	assert!(registry.is_empty());
}

#[tokio::test]
async fn pin_marks_an_existing_connection() {
	let loopback = LoopbackConnector::new();
	let registry = registry(&loopback);
	let ch = chan("observedchan");

	let (obs, _rx) = events_observer(9, "observedchan");
	let attached = registry.attach(obs).expect("attach");
	assert!(!attached.conn.is_pinned());

	let (conn, newly_pinned) = registry.pin(&ch).expect("pin");
	assert!(Arc::ptr_eq(&conn, &attached.conn));
	assert!(newly_pinned);
	assert!(conn.is_pinned());
	let (_, again) = registry.pin(&ch).expect("pin again");
	assert!(!again);

	assert_eq!(registry.detach(&ch, SubscriberId(9)), Detached::Remaining(0));
	assert!(registry.is_connected(&ch));
	assert_eq!(loopback.connect_count(), 1);
}

#[tokio::test]
async fn failed_connection_is_replaced_on_next_ensure() {
	let loopback = LoopbackConnector::new();
	loopback.fail_next_connects(1);
	let registry = registry(&loopback);
	let ch = chan("flakychan");

	let (obs, mut rx) = events_observer(3, "flakychan");
	let first = registry.attach(obs).expect("attach").conn;
	let err = first.wait_ready(WAIT).await.expect_err("first connect fails");
	assert!(matches!(err, RelayError::UpstreamUnavailable { .. }), "got {err:?}");
	assert!(!registry.is_connected(&ch));

	let (second, created) = registry.ensure_connected(&ch).expect("reconnect");
	assert!(created);
	assert!(!Arc::ptr_eq(&first, &second));
	second.wait_ready(WAIT).await.expect("second connect ready");
	assert_eq!(loopback.connect_count(), 2);
	assert_eq!(second.observer_count(), 1, "observer carried over");

	loopback.inject(RelayEvent::chat(ch.clone(), "alice", "back"));
	let ev = timeout(WAIT, rx.recv()).await.expect("event").expect("open");
	assert!(matches!(ev, RelayEvent::ChatMessage { ref message, .. } if message == "back"));
}

#[tokio::test]
async fn retry_recovers_from_transient_connect_failure() {
	let loopback = LoopbackConnector::new();
	loopback.fail_next_connects(2);
	let registry = registry_with(
		&loopback,
		creds(),
		UpstreamOptions {
			connect_retries: 3,
			reconnect_min_delay: Duration::from_millis(5),
			reconnect_max_delay: Duration::from_millis(20),
		},
	);
	let ch = chan("retrychan");

	let (conn, _) = registry.ensure_connected(&ch).expect("ensure");
	conn.wait_ready(WAIT).await.expect("ready after retries");
	assert_eq!(loopback.connect_count(), 3);
}

#[tokio::test]
async fn dropped_session_is_reestablished_when_retry_enabled() {
	let loopback = LoopbackConnector::new();
	let registry = registry_with(
		&loopback,
		creds(),
		UpstreamOptions {
			connect_retries: 1,
			reconnect_min_delay: Duration::from_millis(5),
			reconnect_max_delay: Duration::from_millis(5),
		},
	);
	let ch = chan("dropchan");

	let (obs, mut rx) = events_observer(4, "dropchan");
	let conn = registry.attach(obs).expect("attach").conn;
	conn.wait_ready(WAIT).await.expect("ready");

	loopback.hang_up(&ch);
	assert!(eventually(|| loopback.connect_count() == 2 && loopback.joined_sessions(&ch) == 1).await);
	conn.wait_ready(WAIT).await.expect("ready again");

	loopback.inject(RelayEvent::chat(ch.clone(), "bob", "again"));
	let ev = timeout(WAIT, rx.recv()).await.expect("event").expect("open");
	assert_eq!(ev.channel(), &ch);
}

#[tokio::test]
async fn dropped_session_without_retry_fails_the_connection() {
	let loopback = LoopbackConnector::new();
	let registry = registry(&loopback);
	let ch = chan("oncechan");

	let (conn, _) = registry.ensure_connected(&ch).expect("ensure");
	conn.wait_ready(WAIT).await.expect("ready");

	loopback.hang_up(&ch);
	timeout(WAIT, conn.terminated()).await.expect("terminated");
	assert!(matches!(conn.state(), ConnectionState::Failed(_)));
	assert!(!registry.is_connected(&ch));
	assert_eq!(loopback.connect_count(), 1);
}

#[tokio::test]
async fn shutdown_all_stops_every_connection() {
	let loopback = LoopbackConnector::new();
	let registry = registry(&loopback);
	let (a, _) = registry.ensure_connected(&chan("one")).expect("one");
	let (b, _) = registry.ensure_connected(&chan("two")).expect("two");
	a.wait_ready(WAIT).await.expect("a ready");
	b.wait_ready(WAIT).await.expect("b ready");
	assert_eq!(registry.channels(), vec![chan("one"), chan("two")]);

	registry.shutdown_all().await;
	assert!(registry.is_empty());
	assert_eq!(a.state(), ConnectionState::Closed);
	assert_eq!(b.state(), ConnectionState::Closed);
	assert!(eventually(|| loopback.joined_sessions(&chan("one")) == 0).await);
}
