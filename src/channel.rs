//! Duplex channel over one transport stream.
//!
//! A spawned driver task owns the stream. It writes frames queued by the
//! [`ChannelSender`], feeds decoded frames to the [`ChannelReceiver`] and
//! applies `REQUEST_N` credit grants. The driver exits once both
//! directions have seen a terminal frame, or the receiving half is dropped
//! after the sending half finished.

use bytes::{Bytes, BytesMut};
use futures::Stream;
use std::{
    pin::Pin,
    sync::Arc,
    task::{ready, Context, Poll},
};
use tokio::sync::{mpsc, Semaphore};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::codec::Decoder;
use tracing::{debug, trace};

use crate::codec::{self, ChunkEnvelope};
use crate::error::{ErrorKind, TransferError};
use crate::frame::{Frame, FrameCodec};
use crate::messages::ErrorPayload;
use crate::StreamAdapter;

/// Credits each side grants its peer when a channel opens.
pub const INITIAL_REQUEST_N: u32 = 100_000;

/// What a channel delivers once frames are normalised: a terminal flag
/// riding on the last item and a separate completion both end in one `End`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Data(Bytes),
    End,
}

/// Starts the driver for `stream`. `buffered` holds bytes that were read
/// past the opening frame and belong to this channel.
pub(crate) fn open(
    stream: Box<dyn StreamAdapter + Send>,
    buffered: BytesMut,
    initial_request_n: u32,
) -> (ChannelSender, ChannelReceiver) {
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (grants_tx, grants_rx) = mpsc::unbounded_channel();
    let credits = Arc::new(Semaphore::new(0));

    // Queued ahead of anything the sender pushes.
    let _ = outbound_tx.send(Frame::RequestN(initial_request_n));

    let driver = Driver {
        stream,
        buffer: buffered,
        outbound: outbound_rx,
        grants: grants_rx,
        inbound: inbound_tx,
        credits: credits.clone(),
    };
    tokio::spawn(driver.run());

    let sender = ChannelSender {
        frames: outbound_tx,
        credits,
        terminated: false,
    };
    let receiver = ChannelReceiver {
        frames: UnboundedReceiverStream::new(inbound_rx),
        grants: grants_tx,
        grant_size: initial_request_n,
        consumed: 0,
        pending_end: false,
        finished: false,
    };
    (sender, receiver)
}

struct Driver {
    stream: Box<dyn StreamAdapter + Send>,
    buffer: BytesMut,
    outbound: mpsc::UnboundedReceiver<Frame>,
    grants: mpsc::UnboundedReceiver<u32>,
    inbound: mpsc::UnboundedSender<Frame>,
    credits: Arc<Semaphore>,
}

impl Driver {
    async fn run(mut self) {
        let mut codec = FrameCodec;
        let mut sent_terminal = false;
        let mut received_terminal = false;
        let mut grants_open = true;

        'drive: loop {
            // Frames may already be sitting in the buffer, including ones that
            // arrived together with the opening frame.
            while !received_terminal {
                match codec.decode(&mut self.buffer) {
                    Ok(Some(Frame::RequestN(n))) => {
                        trace!(n, "peer granted credits");
                        self.credits.add_permits(n as usize);
                    }
                    Ok(Some(frame)) => {
                        let terminal = frame.is_terminal();
                        let is_error = matches!(frame, Frame::Error(_));
                        if self.inbound.send(frame).is_err() || terminal {
                            received_terminal = true;
                        }
                        if is_error {
                            sent_terminal = true;
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        debug!("closing channel on undecodable frame: {err}");
                        let payload = ErrorPayload::new(ErrorKind::Protocol, err.to_string());
                        if let Ok(payload) = codec::encode_control(&payload) {
                            let _ = self.inbound.send(Frame::Error(payload.clone()));
                            if !sent_terminal {
                                let _ = self.write(Frame::Error(payload)).await;
                            }
                        }
                        received_terminal = true;
                        sent_terminal = true;
                    }
                }
            }

            if sent_terminal && received_terminal {
                break;
            }

            tokio::select! {
                frame = self.outbound.recv(), if !sent_terminal => {
                    let frame = match frame {
                        Some(frame) => frame,
                        None => {
                            // Sender dropped without finishing its direction.
                            let payload = ErrorPayload::new(
                                ErrorKind::Cancelled,
                                "channel dropped before completion".to_string(),
                            );
                            match codec::encode_control(&payload) {
                                Ok(payload) => Frame::Error(payload),
                                Err(_) => break 'drive,
                            }
                        }
                    };
                    let terminal = frame.is_terminal();
                    let is_error = matches!(frame, Frame::Error(_));
                    if let Err(err) = self.write(frame).await {
                        debug!("channel write failed: {err}");
                        break 'drive;
                    }
                    if terminal {
                        sent_terminal = true;
                    }
                    if is_error {
                        received_terminal = true;
                    }
                }
                grant = self.grants.recv(), if grants_open && !received_terminal => {
                    match grant {
                        Some(n) => {
                            if let Err(err) = self.write(Frame::RequestN(n)).await {
                                debug!("channel write failed: {err}");
                                break 'drive;
                            }
                        }
                        None => grants_open = false,
                    }
                }
                chunk = self.stream.receive_bytes(), if !received_terminal => {
                    let reason = match chunk {
                        Ok(Some(bytes)) => {
                            self.buffer.extend_from_slice(&bytes);
                            continue 'drive;
                        }
                        Ok(None) => "peer closed the stream".to_string(),
                        Err(err) => format!("channel read failed: {err}"),
                    };
                    debug!("{reason}");
                    self.lose_peer(reason);
                    received_terminal = true;
                }
                _ = self.inbound.closed(), if !received_terminal => {
                    received_terminal = true;
                }
            }
        }

        // Wakes senders blocked on credit; they observe ChannelClosed.
        self.credits.close();
        let _ = self.stream.close_send().await;
    }

    /// The stream ended without a terminal frame: fail the local receiver
    /// and stop waiting for credit that can no longer arrive.
    fn lose_peer(&mut self, reason: String) {
        let payload = ErrorPayload::new(ErrorKind::Cancelled, reason);
        if let Ok(payload) = codec::encode_control(&payload) {
            let _ = self.inbound.send(Frame::Error(payload));
        }
        self.credits.close();
    }

    async fn write(&mut self, frame: Frame) -> Result<(), crate::RpcError> {
        let bytes = frame.to_bytes()?;
        self.stream.send_bytes(bytes).await
    }
}

/// Sending half of a channel. `NEXT` items wait for credit from the peer.
pub struct ChannelSender {
    frames: mpsc::UnboundedSender<Frame>,
    credits: Arc<Semaphore>,
    terminated: bool,
}

impl ChannelSender {
    pub async fn send_next(&mut self, payload: Bytes, complete: bool) -> Result<(), TransferError> {
        self.ensure_open()?;
        let permit = self
            .credits
            .acquire()
            .await
            .map_err(|_| TransferError::ChannelClosed)?;
        permit.forget();
        self.push(Frame::Next { payload, complete })
    }

    pub async fn send_complete(&mut self) -> Result<(), TransferError> {
        self.ensure_open()?;
        self.push(Frame::Complete)
    }

    pub async fn send_error(&mut self, kind: ErrorKind, message: String) -> Result<(), TransferError> {
        self.ensure_open()?;
        let payload = codec::encode_control(&ErrorPayload::new(kind, message))?;
        self.push(Frame::Error(payload))
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    fn ensure_open(&self) -> Result<(), TransferError> {
        if self.terminated {
            return Err(TransferError::ChannelClosed);
        }
        Ok(())
    }

    fn push(&mut self, frame: Frame) -> Result<(), TransferError> {
        if frame.is_terminal() {
            self.terminated = true;
        }
        self.frames
            .send(frame)
            .map_err(|_| TransferError::ChannelClosed)
    }
}

/// Receiving half of a channel, yielding normalised [`Event`]s.
///
/// The stream ends after the first `End` or error.
pub struct ChannelReceiver {
    frames: UnboundedReceiverStream<Frame>,
    grants: mpsc::UnboundedSender<u32>,
    grant_size: u32,
    consumed: u32,
    pending_end: bool,
    finished: bool,
}

impl ChannelReceiver {
    fn accept(&mut self, frame: Frame) -> Result<Event, TransferError> {
        match frame {
            Frame::Next { payload, complete } => {
                self.replenish();
                match ChunkEnvelope::classify(payload, complete) {
                    ChunkEnvelope::Sentinel => {
                        self.finished = true;
                        Ok(Event::End)
                    }
                    ChunkEnvelope::Ready => Ok(Event::Data(Bytes::new())),
                    ChunkEnvelope::Data(bytes) => {
                        self.pending_end = complete;
                        Ok(Event::Data(bytes))
                    }
                }
            }
            Frame::Complete => {
                self.finished = true;
                Ok(Event::End)
            }
            Frame::Error(payload) => {
                self.finished = true;
                Err(remote_error(&payload))
            }
            other => {
                self.finished = true;
                Err(TransferError::Protocol(format!(
                    "unexpected {} frame on an open channel",
                    other.name()
                )))
            }
        }
    }

    fn replenish(&mut self) {
        self.consumed += 1;
        if self.consumed >= (self.grant_size / 2).max(1) {
            let _ = self.grants.send(self.consumed);
            self.consumed = 0;
        }
    }
}

fn remote_error(payload: &[u8]) -> TransferError {
    match codec::decode_control::<ErrorPayload>(payload) {
        Ok(error) => TransferError::Remote {
            kind: error.kind,
            message: error.message,
        },
        Err(err) => TransferError::Protocol(format!("undecodable error frame: {err}")),
    }
}

impl Stream for ChannelReceiver {
    type Item = Result<Event, TransferError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }
        if this.pending_end {
            this.pending_end = false;
            this.finished = true;
            return Poll::Ready(Some(Ok(Event::End)));
        }
        match ready!(Pin::new(&mut this.frames).poll_next(cx)) {
            Some(frame) => Poll::Ready(Some(this.accept(frame))),
            None => {
                this.finished = true;
                Poll::Ready(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Peer;
    use crate::test_support::duplex_pair;
    use futures::StreamExt;
    use std::time::Duration;

    fn pair(n: u32) -> ((ChannelSender, ChannelReceiver), (ChannelSender, ChannelReceiver)) {
        let (left, right) = duplex_pair();
        (
            open(Box::new(left), BytesMut::new(), n),
            open(Box::new(right), BytesMut::new(), n),
        )
    }

    #[tokio::test]
    async fn flag_on_last_item_yields_data_then_end() {
        let ((mut tx, _rx), (_peer_tx, mut peer_rx)) = pair(16);
        tx.send_next(Bytes::from_static(b"tail"), true).await.unwrap();

        assert_eq!(
            peer_rx.next().await.unwrap().unwrap(),
            Event::Data(Bytes::from_static(b"tail"))
        );
        assert_eq!(peer_rx.next().await.unwrap().unwrap(), Event::End);
        assert!(peer_rx.next().await.is_none());
    }

    #[tokio::test]
    async fn sentinel_and_separate_completion_both_end_the_stream() {
        let ((mut tx, _rx), (mut peer_tx, mut peer_rx)) = pair(16);
        tx.send_next(codec::sentinel(), true).await.unwrap();
        assert_eq!(peer_rx.next().await.unwrap().unwrap(), Event::End);

        let ((mut tx, _rx2), (_peer_tx2, mut peer_rx)) = pair(16);
        tx.send_next(Bytes::from_static(b"a"), false).await.unwrap();
        tx.send_complete().await.unwrap();
        assert_eq!(
            peer_rx.next().await.unwrap().unwrap(),
            Event::Data(Bytes::from_static(b"a"))
        );
        assert_eq!(peer_rx.next().await.unwrap().unwrap(), Event::End);

        peer_tx.send_complete().await.unwrap();
    }

    #[tokio::test]
    async fn empty_item_is_delivered_as_ready_signal() {
        let ((mut tx, _rx), (_peer_tx, mut peer_rx)) = pair(16);
        tx.send_next(codec::ready(), false).await.unwrap();
        assert_eq!(peer_rx.next().await.unwrap().unwrap(), Event::Data(Bytes::new()));
    }

    #[tokio::test]
    async fn remote_error_is_surfaced_with_kind() {
        let ((mut tx, _rx), (_peer_tx, mut peer_rx)) = pair(16);
        tx.error(ErrorKind::AccessDenied, "Access Denied.".into())
            .await
            .unwrap();

        let err = peer_rx.next().await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AccessDenied);
        assert_eq!(err.to_string(), "Access Denied.");
    }

    #[tokio::test]
    async fn sends_after_terminal_frame_fail() {
        let ((mut tx, _rx), _peer) = pair(16);
        tx.send_complete().await.unwrap();
        assert!(tx.is_terminated());
        assert!(matches!(
            tx.send_next(Bytes::from_static(b"late"), false).await,
            Err(TransferError::ChannelClosed)
        ));
    }

    #[tokio::test]
    async fn sender_waits_for_credit_until_receiver_consumes() {
        let ((mut tx, _rx), (_peer_tx, mut peer_rx)) = pair(2);

        tx.send_next(Bytes::from_static(b"1"), false).await.unwrap();
        tx.send_next(Bytes::from_static(b"2"), false).await.unwrap();

        // Both credits are spent; the third item must wait for a re-grant.
        let blocked = tokio::time::timeout(
            Duration::from_millis(50),
            tx.send_next(Bytes::from_static(b"3"), false),
        )
        .await;
        assert!(blocked.is_err());

        assert_eq!(
            peer_rx.next().await.unwrap().unwrap(),
            Event::Data(Bytes::from_static(b"1"))
        );
        tokio::time::timeout(
            Duration::from_secs(1),
            tx.send_next(Bytes::from_static(b"3"), false),
        )
        .await
        .expect("credit re-granted")
        .unwrap();
    }
}
