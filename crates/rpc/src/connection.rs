//! Connection handle and the pump task behind it.
//!
//! All writes go through one outbound queue drained by the pump, so message order on the
//! wire matches call order. Reads happen on a separate task and are fed back to the pump
//! over a channel; this keeps a half-read frame from being dropped when the pump wakes up
//! for an outbound message.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde_json::Value as JsonValue;
use tokio::io::{AsyncBufRead, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use vigil_worker::TaskClass;

use crate::message::Message;
use crate::protocol::CounterIdGen;
use crate::types::{AnyNotification, AnyRequest, AnyResponse, ErrorCode, RequestId, ResponseError};
use crate::{Error, Result};

/// Receiver of notifications sent by the peer, in arrival order.
pub type NotificationReceiver = mpsc::UnboundedReceiver<AnyNotification>;

/// Outbound message envelope for total ordering and write barriers.
enum Outbound {
	Request {
		method: String,
		params: JsonValue,
		response_tx: oneshot::Sender<Result<AnyResponse>>,
	},
	Notify {
		notif: AnyNotification,
		written: Option<oneshot::Sender<Result<()>>>,
	},
}

/// Cloneable handle to a JSON-RPC connection.
///
/// Dropping every handle stops the pump; [`Connection::dispose`] stops it explicitly.
#[derive(Clone)]
pub struct Connection {
	name: Arc<str>,
	outbound_tx: mpsc::UnboundedSender<Outbound>,
	shutdown: CancellationToken,
	closed: CancellationToken,
	disposed: Arc<AtomicBool>,
}

impl fmt::Debug for Connection {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Connection")
			.field("name", &self.name)
			.field("disposed", &self.is_disposed())
			.finish_non_exhaustive()
	}
}

impl Connection {
	/// Starts a pump over the given stream halves.
	///
	/// Returns the handle and the receiver for peer notifications. Notifications are
	/// silently dropped once the receiver is gone.
	pub fn spawn<R, W>(name: impl Into<Arc<str>>, reader: R, writer: W) -> (Self, NotificationReceiver)
	where
		R: AsyncRead + Unpin + Send + 'static,
		W: AsyncWrite + Unpin + Send + 'static,
	{
		let name = name.into();
		let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
		let (notif_tx, notif_rx) = mpsc::unbounded_channel();
		let shutdown = CancellationToken::new();
		let closed = CancellationToken::new();
		let disposed = Arc::new(AtomicBool::new(false));

		let pump = Pump {
			name: Arc::clone(&name),
			writer,
			outbound_rx,
			notif_tx,
			pending: HashMap::new(),
			id_gen: CounterIdGen::new(),
		};
		vigil_worker::spawn(
			TaskClass::Transport,
			pump.run(BufReader::new(reader), shutdown.clone(), closed.clone(), Arc::clone(&disposed)),
		);

		let conn = Self {
			name,
			outbound_tx,
			shutdown,
			closed,
			disposed,
		};
		(conn, notif_rx)
	}

	/// Name used in log records.
	pub fn name(&self) -> &str {
		&self.name
	}

	/// Sends a request and waits for its result.
	///
	/// Dropping the returned future abandons the request; a late response is discarded.
	pub async fn request(&self, method: &str, params: JsonValue) -> Result<JsonValue> {
		let resp = self.request_raw(method, params).await?;
		resp.into_result().map_err(Error::Response)
	}

	/// Like [`Self::request`], failing with [`Error::RequestTimeout`] after `timeout`.
	pub async fn request_with_timeout(&self, method: &str, params: JsonValue, timeout: Duration) -> Result<JsonValue> {
		match tokio::time::timeout(timeout, self.request(method, params)).await {
			Ok(result) => result,
			Err(_) => Err(Error::RequestTimeout(method.into())),
		}
	}

	/// Sends a request and returns the raw response envelope.
	pub async fn request_raw(&self, method: &str, params: JsonValue) -> Result<AnyResponse> {
		let (response_tx, response_rx) = oneshot::channel();
		self.send(Outbound::Request {
			method: method.into(),
			params,
			response_tx,
		})?;
		response_rx.await.map_err(|_| Error::ServiceStopped)?
	}

	/// Queues a notification without waiting for it to be written.
	pub fn notify(&self, method: &str, params: JsonValue) -> Result<()> {
		self.send(Outbound::Notify {
			notif: AnyNotification {
				method: method.into(),
				params,
			},
			written: None,
		})
	}

	/// Queues a notification and waits until it has been written to the stream.
	pub async fn notify_flushed(&self, method: &str, params: JsonValue) -> Result<()> {
		let (tx, rx) = oneshot::channel();
		self.send(Outbound::Notify {
			notif: AnyNotification {
				method: method.into(),
				params,
			},
			written: Some(tx),
		})?;
		rx.await.map_err(|_| Error::ServiceStopped)?
	}

	/// Stops the pump and closes the write half. Idempotent.
	pub fn dispose(&self) {
		if !self.disposed.swap(true, Ordering::AcqRel) {
			tracing::debug!(connection = %self.name, "rpc.dispose");
		}
		self.shutdown.cancel();
	}

	/// Returns true once the connection can no longer carry messages.
	pub fn is_disposed(&self) -> bool {
		self.disposed.load(Ordering::Acquire)
	}

	/// Resolves when the pump task has exited and all pending requests were failed.
	pub async fn closed(&self) {
		self.closed.cancelled().await;
	}

	fn send(&self, out: Outbound) -> Result<()> {
		if self.is_disposed() {
			return Err(Error::ServiceStopped);
		}
		self.outbound_tx.send(out).map_err(|_| Error::ServiceStopped)
	}
}

struct Pump<W> {
	name: Arc<str>,
	writer: W,
	outbound_rx: mpsc::UnboundedReceiver<Outbound>,
	notif_tx: mpsc::UnboundedSender<AnyNotification>,
	pending: HashMap<RequestId, oneshot::Sender<Result<AnyResponse>>>,
	id_gen: CounterIdGen,
}

impl<W> Pump<W>
where
	W: AsyncWrite + Unpin + Send + 'static,
{
	async fn run<R>(mut self, reader: R, shutdown: CancellationToken, closed: CancellationToken, disposed: Arc<AtomicBool>)
	where
		R: AsyncBufRead + Unpin + Send + 'static,
	{
		let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel();
		let reader_task = vigil_worker::spawn(TaskClass::Transport, read_loop(Arc::clone(&self.name), reader, inbound_tx));

		loop {
			tokio::select! {
				biased;
				_ = shutdown.cancelled() => {
					tracing::debug!(connection = %self.name, "rpc pump shutting down");
					break;
				}
				out = self.outbound_rx.recv() => {
					let Some(out) = out else {
						tracing::debug!(connection = %self.name, "all connection handles dropped");
						break;
					};
					if let Err(e) = self.write_outbound(out).await {
						tracing::error!(connection = %self.name, error = %e, "outbound write failed; closing connection");
						break;
					}
				}
				inbound = inbound_rx.recv() => match inbound {
					Some(Ok(msg)) => {
						if let Err(e) = self.handle_inbound(msg).await {
							tracing::error!(connection = %self.name, error = %e, "reply write failed; closing connection");
							break;
						}
					}
					Some(Err(e)) => {
						tracing::warn!(connection = %self.name, error = %e, "read failed; closing connection");
						break;
					}
					None => {
						tracing::info!(connection = %self.name, "peer closed connection");
						break;
					}
				},
			}
		}

		disposed.store(true, Ordering::Release);
		reader_task.abort();
		let _ = self.writer.shutdown().await;

		for (_, tx) in self.pending.drain() {
			let _ = tx.send(Err(Error::ServiceStopped));
		}
		self.outbound_rx.close();
		while let Ok(out) = self.outbound_rx.try_recv() {
			match out {
				Outbound::Request { response_tx, .. } => {
					let _ = response_tx.send(Err(Error::ServiceStopped));
				}
				Outbound::Notify { written: Some(tx), .. } => {
					let _ = tx.send(Err(Error::ServiceStopped));
				}
				Outbound::Notify { written: None, .. } => {}
			}
		}
		closed.cancel();
	}

	async fn write_outbound(&mut self, out: Outbound) -> Result<()> {
		match out {
			Outbound::Request {
				method,
				params,
				response_tx,
			} => {
				let id = self.id_gen.next();
				tracing::trace!(connection = %self.name, %id, method = %method, "rpc.request");
				let msg = Message::Request(AnyRequest { id: id.clone(), method, params });
				match msg.write(&mut self.writer).await {
					Ok(()) => {
						self.pending.insert(id, response_tx);
						Ok(())
					}
					Err(e) => {
						let _ = response_tx.send(Err(Error::ServiceStopped));
						Err(e)
					}
				}
			}
			Outbound::Notify { notif, written } => {
				tracing::trace!(connection = %self.name, method = %notif.method, "rpc.notify");
				let result = Message::Notification(notif).write(&mut self.writer).await;
				if let Some(tx) = written {
					let _ = tx.send(match &result {
						Ok(()) => Ok(()),
						Err(_) => Err(Error::ServiceStopped),
					});
				}
				result
			}
		}
	}

	async fn handle_inbound(&mut self, msg: Message) -> Result<()> {
		match msg {
			Message::Response(resp) => {
				let Some(tx) = self.pending.remove(&resp.id) else {
					tracing::debug!(connection = %self.name, id = %resp.id, "discarding response for unknown request");
					return Ok(());
				};
				if tx.send(Ok(resp)).is_err() {
					tracing::debug!(connection = %self.name, "discarding response for abandoned request");
				}
				Ok(())
			}
			Message::Notification(notif) => {
				if self.notif_tx.send(notif).is_err() {
					tracing::trace!(connection = %self.name, "notification receiver dropped");
				}
				Ok(())
			}
			Message::Request(req) => {
				tracing::debug!(connection = %self.name, method = %req.method, "rejecting peer-initiated request");
				let reply = Message::Response(AnyResponse {
					id: req.id,
					result: None,
					error: Some(ResponseError::new(
						ErrorCode::METHOD_NOT_FOUND,
						format_args!("method not supported by client: {}", req.method),
					)),
				});
				reply.write(&mut self.writer).await
			}
		}
	}
}

async fn read_loop<R>(name: Arc<str>, mut reader: R, inbound_tx: mpsc::UnboundedSender<Result<Message>>)
where
	R: AsyncBufRead + Unpin,
{
	loop {
		match Message::read(&mut reader).await {
			Ok(Some(msg)) => {
				if inbound_tx.send(Ok(msg)).is_err() {
					break;
				}
			}
			Ok(None) => break,
			// The frame was consumed in full, so the stream is still aligned.
			Err(Error::Deserialize(e)) => {
				tracing::warn!(connection = %name, error = %e, "skipping undecodable message");
			}
			Err(Error::Unroutable(reason)) => {
				tracing::warn!(connection = %name, %reason, "skipping unroutable message");
			}
			Err(e) => {
				let _ = inbound_tx.send(Err(e));
				break;
			}
		}
	}
}

#[cfg(test)]
mod tests;
