#![forbid(unsafe_code)]

use std::time::Duration;

use parley_domain::{MessageId, RoomId, UserId};
use parley_protocol::ServerMsg;
use tokio::time::timeout;

use crate::server::hub::{Hub, HubConfig};

fn room(id: &str) -> RoomId {
	RoomId::new(id).expect("valid RoomId")
}

fn user(id: &str) -> UserId {
	UserId::new(id).expect("valid UserId")
}

fn deleted(room_id: &RoomId) -> ServerMsg {
	ServerMsg::MessageDeleted {
		room_id: room_id.clone(),
		message_id: MessageId::new_v4(),
	}
}

fn typing(room_id: &RoomId, who: &UserId, is_typing: bool) -> ServerMsg {
	ServerMsg::UserTyping {
		room_id: room_id.clone(),
		user_id: who.clone(),
		display_name: who.as_str().to_string(),
		is_typing,
	}
}

#[tokio::test]
async fn publish_room_reaches_joined_connections_only() {
	let hub = Hub::new(HubConfig::default());
	let r = room("s-1");

	let mut rx_a = hub.register_conn(1, user("alice")).await;
	let mut rx_b = hub.register_conn(2, user("bob")).await;
	assert!(hub.join_room(&r, 1).await);

	hub.publish_room(&r, deleted(&r), None).await;

	let got = timeout(Duration::from_millis(250), rx_a.recv())
		.await
		.expect("expected event within timeout")
		.expect("channel open");
	assert!(matches!(got, ServerMsg::MessageDeleted { .. }));

	let unexpected = timeout(Duration::from_millis(50), rx_b.recv()).await;
	assert!(unexpected.is_err(), "non-joined connection unexpectedly received a room event");
}

#[tokio::test]
async fn publish_room_can_exclude_the_sender() {
	let hub = Hub::new(HubConfig::default());
	let r = room("s-1");
	let alice = user("alice");

	let mut rx_a = hub.register_conn(1, alice.clone()).await;
	let mut rx_b = hub.register_conn(2, user("bob")).await;
	hub.join_room(&r, 1).await;
	hub.join_room(&r, 2).await;

	hub.publish_room(&r, typing(&r, &alice, true), Some(1)).await;

	let got = timeout(Duration::from_millis(250), rx_b.recv())
		.await
		.expect("expected event within timeout")
		.expect("channel open");
	assert!(matches!(got, ServerMsg::UserTyping { is_typing: true, .. }));

	let unexpected = timeout(Duration::from_millis(50), rx_a.recv()).await;
	assert!(unexpected.is_err(), "excluded sender received its own typing event");
}

#[tokio::test]
async fn publish_user_reaches_every_device_of_that_user() {
	let hub = Hub::new(HubConfig::default());
	let r = room("s-1");
	let alice = user("alice");

	let mut rx_phone = hub.register_conn(1, alice.clone()).await;
	let mut rx_laptop = hub.register_conn(2, alice.clone()).await;
	let mut rx_bob = hub.register_conn(3, user("bob")).await;

	hub.publish_user(&alice, deleted(&r)).await;

	for rx in [&mut rx_phone, &mut rx_laptop] {
		let got = timeout(Duration::from_millis(250), rx.recv())
			.await
			.expect("expected event within timeout")
			.expect("channel open");
		assert!(matches!(got, ServerMsg::MessageDeleted { .. }));
	}

	let unexpected = timeout(Duration::from_millis(50), rx_bob.recv()).await;
	assert!(unexpected.is_err(), "another user's connection received a personal event");
}

#[tokio::test]
async fn remove_conn_clears_room_membership() {
	let hub = Hub::new(HubConfig::default());
	let r = room("s-1");

	let _rx = hub.register_conn(1, user("alice")).await;
	hub.join_room(&r, 1).await;
	assert!(hub.is_joined(&r, 1).await);

	hub.remove_conn(1).await;
	assert!(!hub.is_joined(&r, 1).await);

	let counts = hub.room_subscriber_counts().await;
	assert_eq!(counts.get(&r).copied().unwrap_or(0), 0);
}

#[tokio::test]
async fn join_room_fails_for_unknown_connection() {
	let hub = Hub::new(HubConfig::default());
	assert!(!hub.join_room(&room("s-1"), 99).await);
}

#[tokio::test]
async fn bounded_queue_drops_for_slow_consumers_only() {
	let hub = Hub::new(HubConfig {
		queue_capacity: 1,
		debug_logs: false,
	});
	let r = room("s-1");

	let mut rx = hub.register_conn(1, user("alice")).await;
	hub.join_room(&r, 1).await;

	hub.publish_room(&r, deleted(&r), None).await;
	hub.publish_room(&r, deleted(&r), None).await;

	let first = timeout(Duration::from_millis(250), rx.recv())
		.await
		.expect("expected first event")
		.expect("channel open");
	assert!(matches!(first, ServerMsg::MessageDeleted { .. }));

	let second = timeout(Duration::from_millis(50), rx.recv()).await;
	assert!(second.is_err(), "second event should have been dropped by the full queue");
}

#[tokio::test]
async fn publish_all_reaches_every_connection() {
	let hub = Hub::new(HubConfig::default());

	let mut rx_a = hub.register_conn(1, user("alice")).await;
	let mut rx_b = hub.register_conn(2, user("bob")).await;

	hub.publish_all(ServerMsg::OnlineUsers { users: Vec::new() }).await;

	for rx in [&mut rx_a, &mut rx_b] {
		let got = timeout(Duration::from_millis(250), rx.recv())
			.await
			.expect("expected event within timeout")
			.expect("channel open");
		assert!(matches!(got, ServerMsg::OnlineUsers { .. }));
	}
}
