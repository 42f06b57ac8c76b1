use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::channel::{ChannelReceiver, ChannelSender, Event, INITIAL_REQUEST_N};
use crate::error::{ErrorKind, TransferError, TransferOutcome};
use crate::messages::{Command, Control, TransferRequest, LARGE_CHUNK};
use crate::session::{DownloadSession, Peer, UploadSession};
use crate::store::{AccessGate, FileStore};
use crate::{codec, RpcServer, TRANSFER_METHOD};

/// Observable results of finished transfers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    FileCreated {
        owner: String,
        filename: String,
        chunks: u64,
    },
    FileSent {
        owner: String,
        filename: String,
        subject: String,
        chunks: u64,
    },
    TransferFailed {
        command: Command,
        owner: String,
        filename: String,
        kind: ErrorKind,
    },
}

/// Turns an incoming transfer request into a session and feeds it the
/// channel's events until the session reaches a terminal state.
#[derive(Clone)]
pub struct TransferController {
    store: Arc<dyn FileStore>,
    gate: Arc<dyn AccessGate>,
    events: broadcast::Sender<TransferEvent>,
}

impl TransferController {
    pub fn new(store: Arc<dyn FileStore>, gate: Arc<dyn AccessGate>) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            store,
            gate,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.events.subscribe()
    }

    /// Binds this controller to the transfer method of `server`.
    pub async fn register_on(&self, server: &RpcServer) {
        let controller = self.clone();
        server
            .register_channel(TRANSFER_METHOD, INITIAL_REQUEST_N, move |metadata, sender, receiver| {
                let controller = controller.clone();
                async move {
                    controller.accept(metadata, sender, receiver).await;
                }
            })
            .await;
    }

    /// Entry point for a freshly opened channel.
    pub async fn accept(
        &self,
        metadata: Bytes,
        mut sender: ChannelSender,
        mut receiver: ChannelReceiver,
    ) -> TransferOutcome {
        match TransferRequest::decode(&metadata) {
            Ok(request) => self.dispatch(request, &mut sender, &mut receiver).await,
            Err(err) => {
                warn!("rejecting transfer request: {err}");
                if let Err(send_err) = sender.error(err.kind(), err.to_string()).await {
                    debug!("could not report rejection: {send_err}");
                }
                TransferOutcome::failed(0, err.kind())
            }
        }
    }

    pub async fn dispatch<P, S>(
        &self,
        request: TransferRequest,
        peer: &mut P,
        inbound: &mut S,
    ) -> TransferOutcome
    where
        P: Peer + ?Sized,
        S: Stream<Item = Result<Event, TransferError>> + Unpin + ?Sized,
    {
        debug!(
            command = ?request.command,
            owner = %request.owner,
            filename = %request.filename,
            subject = %request.subject,
            "dispatching transfer"
        );
        let outcome = match request.command {
            Command::Upload => self.run_upload(&request, peer, inbound).await,
            Command::Download => self.run_download(&request, peer, inbound).await,
        };
        self.publish(&request, outcome);
        outcome
    }

    async fn run_upload<P, S>(
        &self,
        request: &TransferRequest,
        peer: &mut P,
        inbound: &mut S,
    ) -> TransferOutcome
    where
        P: Peer + ?Sized,
        S: Stream<Item = Result<Event, TransferError>> + Unpin + ?Sized,
    {
        let mut session =
            UploadSession::open(&request.owner, &request.filename, self.store.clone()).await;
        session.on_subscribe(peer).await;

        while !session.state().is_terminal() {
            match inbound.next().await {
                Some(Ok(Event::Data(payload))) => session.on_data(payload, peer).await,
                Some(Ok(Event::End)) => session.on_stream_end(peer).await,
                Some(Err(err)) => session.on_error(err, peer).await,
                None => session.on_error(TransferError::ChannelClosed, peer).await,
            }
        }
        session.outcome()
    }

    async fn run_download<P, S>(
        &self,
        request: &TransferRequest,
        peer: &mut P,
        inbound: &mut S,
    ) -> TransferOutcome
    where
        P: Peer + ?Sized,
        S: Stream<Item = Result<Event, TransferError>> + Unpin + ?Sized,
    {
        let mut session = DownloadSession::open(
            &request.subject,
            &request.owner,
            &request.filename,
            request.chunk_size.unwrap_or(LARGE_CHUNK),
            self.store.as_ref(),
            self.gate.as_ref(),
        )
        .await;
        session.on_subscribe(peer).await;

        while !session.state().is_terminal() {
            match inbound.next().await {
                Some(Ok(Event::Data(payload))) => {
                    if !payload.is_empty() {
                        match codec::decode_control::<Control>(&payload) {
                            Ok(Control::Begin) => debug!("receiver asked to begin"),
                            Err(err) => debug!("treating unknown item as ready: {err}"),
                        }
                    }
                    session.on_ready_request(peer).await;
                }
                Some(Ok(Event::End)) => {
                    session
                        .on_error(
                            TransferError::Protocol("receiver finished before the file was sent".into()),
                            peer,
                        )
                        .await
                }
                Some(Err(err)) => session.on_error(err, peer).await,
                None => session.on_error(TransferError::ChannelClosed, peer).await,
            }
        }
        session.outcome()
    }

    fn publish(&self, request: &TransferRequest, outcome: TransferOutcome) {
        let event = match (request.command, outcome.error_kind) {
            (Command::Upload, None) => TransferEvent::FileCreated {
                owner: request.owner.clone(),
                filename: request.filename.clone(),
                chunks: outcome.chunk_count,
            },
            (Command::Download, None) => TransferEvent::FileSent {
                owner: request.owner.clone(),
                filename: request.filename.clone(),
                subject: request.subject.clone(),
                chunks: outcome.chunk_count,
            },
            (command, Some(kind)) => TransferEvent::TransferFailed {
                command,
                owner: request.owner.clone(),
                filename: request.filename.clone(),
                kind,
            },
        };
        if outcome.success {
            info!(?event, "transfer finished");
        }
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}
