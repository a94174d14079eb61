use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio::io::{BufReader, DuplexStream, ReadHalf, WriteHalf};

use super::*;

struct Peer {
	reader: BufReader<ReadHalf<DuplexStream>>,
	writer: WriteHalf<DuplexStream>,
}

impl Peer {
	async fn recv(&mut self) -> Option<Message> {
		Message::read(&mut self.reader).await.unwrap()
	}

	async fn recv_request(&mut self) -> AnyRequest {
		match self.recv().await {
			Some(Message::Request(req)) => req,
			other => panic!("expected request, got {other:?}"),
		}
	}

	async fn reply(&mut self, id: RequestId, result: JsonValue) {
		Message::Response(AnyResponse {
			id,
			result: Some(result),
			error: None,
		})
		.write(&mut self.writer)
		.await
		.unwrap();
	}

	async fn send(&mut self, msg: Message) {
		msg.write(&mut self.writer).await.unwrap();
	}

	async fn send_raw(&mut self, value: JsonValue) {
		let body = value.to_string();
		let frame = format!("Content-Length: {}\r\n\r\n{body}", body.len());
		self.writer.write_all(frame.as_bytes()).await.unwrap();
	}
}

fn pair() -> (Connection, NotificationReceiver, Peer) {
	let (client_io, peer_io) = tokio::io::duplex(64 * 1024);
	let (client_read, client_write) = tokio::io::split(client_io);
	let (peer_read, peer_write) = tokio::io::split(peer_io);
	let (conn, notifications) = Connection::spawn("test", client_read, client_write);
	let peer = Peer {
		reader: BufReader::new(peer_read),
		writer: peer_write,
	};
	(conn, notifications, peer)
}

#[tokio::test]
async fn responses_are_matched_to_requests_out_of_order() {
	let (conn, _notifications, mut peer) = pair();

	let first = tokio::spawn({
		let conn = conn.clone();
		async move { conn.request("first", serde_json::json!({})).await }
	});
	let req_a = peer.recv_request().await;
	let second = tokio::spawn({
		let conn = conn.clone();
		async move { conn.request("second", serde_json::json!({})).await }
	});
	let req_b = peer.recv_request().await;
	assert_ne!(req_a.id, req_b.id);

	peer.reply(req_b.id, serde_json::json!(req_b.method)).await;
	peer.reply(req_a.id, serde_json::json!(req_a.method)).await;

	assert_eq!(first.await.unwrap().unwrap(), serde_json::json!("first"));
	assert_eq!(second.await.unwrap().unwrap(), serde_json::json!("second"));
}

#[tokio::test]
async fn error_responses_surface_as_response_errors() {
	let (conn, _notifications, mut peer) = pair();

	let call = tokio::spawn({
		let conn = conn.clone();
		async move { conn.request("boom", JsonValue::Null).await }
	});
	let req = peer.recv_request().await;
	peer.send(Message::Response(AnyResponse {
		id: req.id,
		result: None,
		error: Some(ResponseError::new(ErrorCode::INTERNAL_ERROR, "exploded")),
	}))
	.await;

	match call.await.unwrap() {
		Err(Error::Response(err)) => assert_eq!(err.message, "exploded"),
		other => panic!("unexpected {other:?}"),
	}
}

#[tokio::test]
async fn null_id_error_reply_is_skipped() {
	let (conn, _notifications, mut peer) = pair();

	let call = tokio::spawn({
		let conn = conn.clone();
		async move { conn.request("after-parse-error", JsonValue::Null).await }
	});
	let req = peer.recv_request().await;
	peer.send_raw(serde_json::json!({
		"jsonrpc": "2.0",
		"id": null,
		"error": { "code": -32700, "message": "Parse error" },
	}))
	.await;
	peer.reply(req.id, serde_json::json!("still here")).await;

	assert_eq!(call.await.unwrap().unwrap(), serde_json::json!("still here"));
	assert!(!conn.is_disposed());
}

#[tokio::test]
async fn notifications_are_delivered_in_order() {
	let (conn, mut notifications, mut peer) = pair();

	for step in 0..3 {
		peer.send(Message::Notification(AnyNotification {
			method: "my_progress".into(),
			params: serde_json::json!({ "step": step }),
		}))
		.await;
	}

	for step in 0..3 {
		let notif = notifications.recv().await.unwrap();
		assert_eq!(notif.params, serde_json::json!({ "step": step }));
	}
	assert!(!conn.is_disposed());
}

#[tokio::test]
async fn outbound_notifications_keep_call_order() {
	let (conn, _notifications, mut peer) = pair();

	conn.notify("start", serde_json::json!({})).unwrap();
	conn.notify_flushed("second", serde_json::json!({})).await.unwrap();

	let methods: Vec<String> = [peer.recv().await, peer.recv().await]
		.into_iter()
		.map(|msg| match msg {
			Some(Message::Notification(n)) => n.method,
			other => panic!("expected notification, got {other:?}"),
		})
		.collect();
	assert_eq!(methods, vec!["start".to_string(), "second".to_string()]);
}

#[tokio::test]
async fn peer_requests_are_rejected_with_method_not_found() {
	let (_conn, _notifications, mut peer) = pair();

	peer.send(Message::Request(AnyRequest {
		id: RequestId::String("srv-1".into()),
		method: "workspace/configuration".into(),
		params: JsonValue::Null,
	}))
	.await;

	match peer.recv().await {
		Some(Message::Response(resp)) => {
			assert_eq!(resp.id, RequestId::String("srv-1".into()));
			assert_eq!(resp.error.map(|e| e.code), Some(ErrorCode::METHOD_NOT_FOUND));
		}
		other => panic!("expected response, got {other:?}"),
	}
}

#[tokio::test]
async fn peer_hangup_fails_pending_requests() {
	let (conn, _notifications, mut peer) = pair();

	let call = tokio::spawn({
		let conn = conn.clone();
		async move { conn.request("never-answered", JsonValue::Null).await }
	});
	let _ = peer.recv_request().await;
	drop(peer);

	assert!(matches!(call.await.unwrap(), Err(Error::ServiceStopped)));
	conn.closed().await;
	assert!(conn.is_disposed());
	assert!(matches!(conn.notify("late", JsonValue::Null), Err(Error::ServiceStopped)));
}

#[tokio::test]
async fn dispose_closes_the_stream() {
	let (conn, _notifications, mut peer) = pair();

	conn.dispose();
	conn.dispose();
	assert!(conn.is_disposed());
	conn.closed().await;

	assert_eq!(peer.recv().await, None);
	assert!(matches!(conn.request("after", JsonValue::Null).await, Err(Error::ServiceStopped)));
}

#[tokio::test]
async fn timed_out_request_leaves_connection_usable() {
	let (conn, _notifications, mut peer) = pair();

	let slow = conn.request_with_timeout("slow", JsonValue::Null, Duration::from_millis(20)).await;
	assert!(matches!(slow, Err(Error::RequestTimeout(ref m)) if m == "slow"));

	let late = peer.recv_request().await;
	peer.reply(late.id, serde_json::json!("too late")).await;

	let call = tokio::spawn({
		let conn = conn.clone();
		async move { conn.request("fast", JsonValue::Null).await }
	});
	let req = peer.recv_request().await;
	peer.reply(req.id, serde_json::json!(42)).await;
	assert_eq!(call.await.unwrap().unwrap(), serde_json::json!(42));
}
