use bytes::Bytes;
use futures::{FutureExt, Stream, StreamExt};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tracing::{debug, info, warn};

use super::{read_chunk, Fault, Peer};
use crate::channel::Event;
use crate::codec;
use crate::error::{ErrorKind, TransferError, TransferOutcome};
use crate::messages::{self, Control, CHUNK_CAP};
use crate::store::FileWriter;

/// Client side of an upload: waits for the store's ready signal, streams a
/// local source and waits for the store to acknowledge completion.
pub struct ClientUploadSender {
    owner: String,
    filename: String,
    chunk_size: usize,
    timeout: Option<Duration>,
    chunk_count: u64,
}

impl ClientUploadSender {
    pub fn new(owner: impl Into<String>, filename: impl Into<String>, chunk_size: u32) -> Self {
        Self {
            owner: owner.into(),
            filename: filename.into(),
            chunk_size: chunk_size.max(1) as usize,
            timeout: None,
            chunk_count: 0,
        }
    }

    /// Bounds the wait for the ready signal and for the final ack.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub async fn run<R, P, S>(mut self, source: &mut R, peer: &mut P, inbound: &mut S) -> TransferOutcome
    where
        R: AsyncRead + Unpin + ?Sized,
        P: Peer + ?Sized,
        S: Stream<Item = Result<Event, TransferError>> + Unpin + ?Sized,
    {
        match self.wait(inbound).await {
            Ok(Event::Data(_)) => debug!(filename = %self.filename, "store is ready"),
            Ok(Event::End) => {
                return self.failed(TransferError::Protocol(
                    "store completed before the upload began".to_string(),
                ))
            }
            Err(err) => return self.failed(err),
        }

        let mut acknowledged = false;
        loop {
            // The store may give up while we are still sending.
            let pending = if acknowledged {
                None
            } else {
                inbound.next().now_or_never()
            };
            if let Some(item) = pending {
                match item {
                    Some(Err(err)) => return self.failed(err),
                    None => return self.failed(TransferError::ChannelClosed),
                    Some(Ok(Event::End)) => acknowledged = true,
                    Some(Ok(Event::Data(_))) => debug!("ignoring item during upload"),
                }
            }

            let chunk = match read_chunk(source, self.chunk_size).await {
                Ok(chunk) => chunk,
                Err(err) => {
                    let message = messages::upload_failed(&self.filename, &self.owner);
                    let _ = peer.error(ErrorKind::Io, message).await;
                    return self.failed(err.into());
                }
            };
            let exhausted = chunk.len() < self.chunk_size;
            if !chunk.is_empty() {
                if let Err(err) = peer.next(chunk, false).await {
                    return self.failed(err);
                }
                self.chunk_count += 1;
            }
            if exhausted {
                break;
            }
        }

        if let Err(err) = peer.complete().await {
            return self.failed(err);
        }
        while !acknowledged {
            match self.wait(inbound).await {
                Ok(Event::End) => acknowledged = true,
                Ok(Event::Data(_)) => continue,
                Err(err) => return self.failed(err),
            }
        }

        info!(
            owner = %self.owner,
            filename = %self.filename,
            chunks = self.chunk_count,
            "upload acknowledged"
        );
        TransferOutcome::completed(self.chunk_count)
    }

    async fn wait<S>(&self, inbound: &mut S) -> Result<Event, TransferError>
    where
        S: Stream<Item = Result<Event, TransferError>> + Unpin + ?Sized,
    {
        let next = match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, inbound.next())
                .await
                .map_err(|_| TransferError::Timeout)?,
            None => inbound.next().await,
        };
        next.unwrap_or(Err(TransferError::ChannelClosed))
    }

    fn failed(&self, err: TransferError) -> TransferOutcome {
        warn!(
            owner = %self.owner,
            filename = %self.filename,
            "upload failed: {err}"
        );
        TransferOutcome::failed(self.chunk_count, err.kind())
    }
}

/// Client side of a download: acknowledges the handshake with `BEGIN`,
/// persists chunks and stops at the sentinel or at the chunk cap.
pub struct ClientDownloadReceiver {
    owner: String,
    filename: String,
    writer: Option<FileWriter>,
    fault: Option<Fault>,
    chunk_cap: u64,
    chunk_count: u64,
}

impl ClientDownloadReceiver {
    /// `writer` of `None` runs without local I/O, for benchmarking.
    pub fn new(owner: impl Into<String>, filename: impl Into<String>, writer: Option<FileWriter>) -> Self {
        Self {
            owner: owner.into(),
            filename: filename.into(),
            writer,
            fault: None,
            chunk_cap: CHUNK_CAP,
            chunk_count: 0,
        }
    }

    /// A receiver whose local file could not be opened. It fails on the
    /// first item and tells the server.
    pub fn unwritable(owner: impl Into<String>, filename: impl Into<String>, err: std::io::Error) -> Self {
        let mut receiver = Self::new(owner, filename, None);
        receiver.fault = Some(Fault::new(ErrorKind::Io, err.to_string()));
        receiver
    }

    pub fn with_chunk_cap(mut self, chunk_cap: u64) -> Self {
        self.chunk_cap = chunk_cap.max(1);
        self
    }

    pub async fn run<P, S>(mut self, peer: &mut P, inbound: &mut S) -> TransferOutcome
    where
        P: Peer + ?Sized,
        S: Stream<Item = Result<Event, TransferError>> + Unpin + ?Sized,
    {
        while let Some(item) = inbound.next().await {
            let payload = match item {
                Ok(Event::Data(payload)) => payload,
                Ok(Event::End) => return self.finish(peer).await,
                Err(err) => return self.fail(Fault::from(&err), peer, false).await,
            };
            if let Some(fault) = self.fault.clone() {
                return self.fail(fault, peer, true).await;
            }
            if payload.is_empty() {
                if let Err(err) = self.begin(peer).await {
                    return self.fail(Fault::from(&err), peer, true).await;
                }
                continue;
            }
            if let Err(err) = self.persist(&payload).await {
                return self.fail(Fault::new(ErrorKind::Io, err.to_string()), peer, true).await;
            }
            self.chunk_count += 1;
            debug!(filename = %self.filename, chunk = self.chunk_count, "received chunk");
            if self.chunk_count >= self.chunk_cap {
                warn!(
                    filename = %self.filename,
                    cap = self.chunk_cap,
                    "chunk cap reached, completing early"
                );
                return self.finish(peer).await;
            }
        }
        self.fail(Fault::from(&TransferError::ChannelClosed), peer, false)
            .await
    }

    async fn begin<P>(&self, peer: &mut P) -> Result<(), TransferError>
    where
        P: Peer + ?Sized,
    {
        let payload = codec::encode_control(&Control::Begin)?;
        peer.next(payload, false).await
    }

    async fn persist(&mut self, payload: &Bytes) -> std::io::Result<()> {
        match self.writer.as_mut() {
            Some(writer) => writer.write_all(payload).await,
            None => Ok(()),
        }
    }

    async fn finish<P>(mut self, peer: &mut P) -> TransferOutcome
    where
        P: Peer + ?Sized,
    {
        if let Some(fault) = self.fault.clone() {
            return self.fail(fault, peer, true).await;
        }
        if let Some(mut writer) = self.writer.take() {
            if let Err(err) = writer.shutdown().await {
                return self.fail(Fault::new(ErrorKind::Io, err.to_string()), peer, true).await;
            }
        }
        if let Err(err) = peer.complete().await {
            debug!("server left before our completion: {err}");
        }
        info!(
            owner = %self.owner,
            filename = %self.filename,
            chunks = self.chunk_count,
            "{}",
            messages::file_downloaded(&self.filename)
        );
        TransferOutcome::completed(self.chunk_count)
    }

    /// `notify` is false when the failure came from the server.
    async fn fail<P>(mut self, fault: Fault, peer: &mut P, notify: bool) -> TransferOutcome
    where
        P: Peer + ?Sized,
    {
        if let Some(mut writer) = self.writer.take() {
            let _ = writer.shutdown().await;
        }
        warn!(
            owner = %self.owner,
            filename = %self.filename,
            kind = ?fault.kind,
            "download failed: {}",
            fault.detail
        );
        if notify {
            let message = messages::download_failed(&self.filename, &self.owner);
            let _ = peer.error(fault.kind, message).await;
        }
        TransferOutcome::failed(self.chunk_count, fault.kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::testing::{RecordingPeer, Sent};
    use futures::stream;

    fn data(bytes: &'static [u8]) -> Result<Event, TransferError> {
        Ok(Event::Data(Bytes::from_static(bytes)))
    }

    fn ready() -> Result<Event, TransferError> {
        Ok(Event::Data(Bytes::new()))
    }

    #[tokio::test]
    async fn upload_waits_for_ready_then_streams_and_awaits_ack() {
        let source = vec![3u8; 5000];
        let mut reader = &source[..];
        let mut peer = RecordingPeer::default();
        let mut inbound = stream::iter(vec![ready(), Ok(Event::End)]);

        let outcome = ClientUploadSender::new("alice", "notes", 2048)
            .run(&mut reader, &mut peer, &mut inbound)
            .await;

        assert_eq!(outcome, TransferOutcome::completed(3));
        let sizes: Vec<usize> = peer.data().iter().map(Bytes::len).collect();
        assert_eq!(sizes, vec![2048, 2048, 904]);
        assert_eq!(peer.sent.last(), Some(&Sent::Complete));
    }

    #[tokio::test]
    async fn upload_without_ack_fails() {
        let source = vec![3u8; 10];
        let mut reader = &source[..];
        let mut peer = RecordingPeer::default();
        let mut inbound = stream::iter(vec![ready()]);

        let outcome = ClientUploadSender::new("alice", "notes", 2048)
            .run(&mut reader, &mut peer, &mut inbound)
            .await;

        assert!(!outcome.success);
        assert_eq!(outcome.error_kind, Some(ErrorKind::Cancelled));
    }

    #[tokio::test]
    async fn upload_stops_when_store_reports_error() {
        let source = vec![3u8; 10];
        let mut reader = &source[..];
        let mut peer = RecordingPeer::default();
        let mut inbound = stream::iter(vec![Err(TransferError::Remote {
            kind: ErrorKind::Storage,
            message: "Upload failed for file notes and user alice.".into(),
        })]);

        let outcome = ClientUploadSender::new("alice", "notes", 2048)
            .run(&mut reader, &mut peer, &mut inbound)
            .await;

        assert_eq!(outcome, TransferOutcome::failed(0, ErrorKind::Storage));
        assert!(peer.sent.is_empty());
    }

    #[tokio::test]
    async fn download_acknowledges_handshake_with_begin() {
        let mut peer = RecordingPeer::default();
        let mut inbound = stream::iter(vec![ready(), data(b"abc"), Ok(Event::End)]);

        let outcome = ClientDownloadReceiver::new("alice", "notes", None)
            .run(&mut peer, &mut inbound)
            .await;

        assert_eq!(outcome, TransferOutcome::completed(1));
        let Sent::Next { payload, complete } = &peer.sent[0] else {
            panic!("expected begin acknowledgement");
        };
        assert!(!complete);
        assert_eq!(codec::decode_control::<Control>(payload).unwrap(), Control::Begin);
        assert_eq!(peer.sent.last(), Some(&Sent::Complete));
    }

    #[tokio::test]
    async fn download_writes_chunks_to_the_local_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alice_notes");
        let file = tokio::fs::File::create(&path).await.unwrap();
        let mut peer = RecordingPeer::default();
        let mut inbound = stream::iter(vec![ready(), data(b"abc"), data(b"def"), Ok(Event::End)]);

        let outcome = ClientDownloadReceiver::new("alice", "notes", Some(Box::new(file) as FileWriter))
            .run(&mut peer, &mut inbound)
            .await;

        assert!(outcome.success);
        assert_eq!(std::fs::read(&path).unwrap(), b"abcdef");
    }

    #[tokio::test]
    async fn chunk_cap_is_inclusive() {
        let items = |n: usize| {
            let mut items = vec![ready()];
            items.extend((0..n).map(|_| data(b"x")));
            items.push(Ok(Event::End));
            items
        };

        let mut peer = RecordingPeer::default();
        let outcome = ClientDownloadReceiver::new("alice", "notes", None)
            .with_chunk_cap(3)
            .run(&mut peer, &mut stream::iter(items(3)))
            .await;
        assert_eq!(outcome, TransferOutcome::completed(3));

        let mut peer = RecordingPeer::default();
        let outcome = ClientDownloadReceiver::new("alice", "notes", None)
            .with_chunk_cap(3)
            .run(&mut peer, &mut stream::iter(items(4)))
            .await;
        assert_eq!(outcome, TransferOutcome::completed(3));
        assert_eq!(peer.sent.last(), Some(&Sent::Complete));
    }

    #[tokio::test]
    async fn remote_denial_is_reported_without_echo() {
        let mut peer = RecordingPeer::default();
        let mut inbound = stream::iter(vec![Err(TransferError::Remote {
            kind: ErrorKind::AccessDenied,
            message: messages::ACCESS_DENIED.into(),
        })]);

        let outcome = ClientDownloadReceiver::new("alice", "notes", None)
            .run(&mut peer, &mut inbound)
            .await;

        assert_eq!(outcome, TransferOutcome::failed(0, ErrorKind::AccessDenied));
        assert!(peer.sent.is_empty());
    }

    #[tokio::test]
    async fn unwritable_destination_fails_and_notifies_server() {
        let mut peer = RecordingPeer::default();
        let mut inbound = stream::iter(vec![ready(), data(b"abc")]);
        let err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only");

        let outcome = ClientDownloadReceiver::unwritable("alice", "notes", err)
            .run(&mut peer, &mut inbound)
            .await;

        assert_eq!(outcome, TransferOutcome::failed(0, ErrorKind::Io));
        assert_eq!(peer.errors()[0].0, ErrorKind::Io);
    }
}
