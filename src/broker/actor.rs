//! The per-broker engine task.
//!
//! All connection state that is not the lifecycle gate lives here: the
//! in-flight queue, the correlation counter, the socket halves and the
//! framed reader. The task drains one mailbox, so none of it needs a lock
//! and no two handlers ever run concurrently for the same broker.

use std::collections::VecDeque;
use std::io::ErrorKind;
use std::sync::Arc;

use bytes::{Buf, Bytes};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio_stream::StreamExt;
use tokio_util::codec::FramedRead;
use tracing::instrument;

use crate::error::{Error, Result};
use crate::frame::{encode_request_frame, ResponseFrame, ResponseFrameDecoder};
use crate::protocol::{HeaderRequest, ResponseDecoder};

use super::{BrokerIdentity, ConnectionGate};

/// Work posted onto the engine's mailbox.
///
/// Callers on arbitrary threads only ever touch the broker through these;
/// the mailbox is what makes their submissions serial.
#[derive(Debug)]
pub(super) enum Command {
    /// Kick off the single resolve/connect attempt.
    Connect,
    /// Submit an encoded request body.
    Call {
        api_key: i16,
        body: Bytes,
        slot: oneshot::Sender<Result<ResponseDecoder>>,
    },
}

/// A submitted request between enqueue and resolution.
struct InFlightRequest {
    api_key: i16,
    /// Assigned at enqueue time, inside the engine task.
    correlation_id: i32,
    body: Bytes,
    /// True once the socket write for this entry has completed. Only the
    /// queue head can ever be in that state.
    sent: bool,
    slot: oneshot::Sender<Result<ResponseDecoder>>,
}

struct Socket {
    reader: FramedRead<OwnedReadHalf, ResponseFrameDecoder>,
    writer: OwnedWriteHalf,
}

pub(super) struct BrokerActor {
    identity: BrokerIdentity,
    client_id: String,
    gate: Arc<ConnectionGate>,
    shutdown: Arc<Notify>,
    mailbox: mpsc::UnboundedReceiver<Command>,
    next_correlation_id: i32,
    in_flight: VecDeque<InFlightRequest>,
    socket: Option<Socket>,
}

impl BrokerActor {
    pub(super) fn new(
        identity: BrokerIdentity,
        client_id: String,
        gate: Arc<ConnectionGate>,
        shutdown: Arc<Notify>,
        mailbox: mpsc::UnboundedReceiver<Command>,
    ) -> BrokerActor {
        BrokerActor {
            identity,
            client_id,
            gate,
            shutdown,
            mailbox,
            next_correlation_id: 1,
            in_flight: VecDeque::new(),
            socket: None,
        }
    }

    pub(super) async fn run(mut self) {
        loop {
            if self.gate.is_closed() {
                self.teardown().await;
                return;
            }

            // The writer goes first: whenever the head of the queue has
            // not hit the wire yet and the socket is up, write it. The
            // next request is only started after the current head's
            // response has been read and popped, so requests are never
            // interleaved on the wire.
            if self.socket.is_some() && self.head_unsent() {
                self.write_next_request().await;
                continue;
            }

            let awaiting_response = self.socket.is_some() && self.head_sent();

            tokio::select! {
                _ = self.shutdown.notified() => {}
                command = self.mailbox.recv() => match command {
                    Some(Command::Connect) => self.connect().await,
                    Some(Command::Call { api_key, body, slot }) => {
                        self.push_request(api_key, body, slot)
                    }
                    None => {
                        // Every handle to this broker has been dropped.
                        self.gate.close();
                    }
                },
                frame = Self::next_frame(&mut self.socket), if awaiting_response => {
                    self.handle_frame(frame);
                }
            }
        }
    }

    fn head_unsent(&self) -> bool {
        self.in_flight.front().map_or(false, |req| !req.sent)
    }

    fn head_sent(&self) -> bool {
        self.in_flight.front().map_or(false, |req| req.sent)
    }

    /// Resolve the single in-flight read on the framed stream.
    async fn next_frame(
        socket: &mut Option<Socket>,
    ) -> Option<std::result::Result<ResponseFrame, Error>> {
        match socket.as_mut() {
            Some(socket) => socket.reader.next().await,
            // Guarded out by `awaiting_response`; never polled.
            None => std::future::pending().await,
        }
    }

    /// Enqueue a submission, assigning its correlation id.
    fn push_request(
        &mut self,
        api_key: i16,
        body: Bytes,
        slot: oneshot::Sender<Result<ResponseDecoder>>,
    ) {
        if self.gate.is_closed() {
            let _ = slot.send(Err(Error::NetworkFail));
            return;
        }

        let correlation_id = self.next_correlation_id;
        self.next_correlation_id = self.next_correlation_id.wrapping_add(1);

        tracing::trace!(api_key, correlation_id, bytes = body.len(), "Queueing request");
        self.in_flight.push_back(InFlightRequest {
            api_key,
            correlation_id,
            body,
            sent: false,
            slot,
        });
    }

    /// Single resolve/connect attempt against the configured endpoint.
    #[instrument(level = "debug", skip(self), fields(host = %self.identity.host, port = self.identity.port))]
    async fn connect(&mut self) {
        if !self.gate.is_connecting() {
            // A close raced the kick-off.
            return;
        }

        let connected = tokio::select! {
            _ = self.shutdown.notified() => return,
            connected = Self::connect_endpoints(&self.identity) => connected,
        };

        match connected {
            Ok(stream) => {
                let (read_half, write_half) = stream.into_split();
                let socket = Socket {
                    reader: FramedRead::new(read_half, ResponseFrameDecoder::new()),
                    writer: write_half,
                };
                if self.gate.mark_connected() {
                    tracing::debug!("Connected");
                    self.socket = Some(socket);
                }
                // Otherwise the broker closed while we were connecting;
                // the fresh socket is simply dropped.
            }
            Err(err) => {
                tracing::warn!("Connect failed: {:?}", err);
                self.gate.close();
            }
        }
    }

    /// Resolve the endpoint and try each address in order, keeping the
    /// most recent error for the caller.
    async fn connect_endpoints(identity: &BrokerIdentity) -> Result<TcpStream> {
        let endpoints = tokio::net::lookup_host((identity.host.as_str(), identity.port))
            .await
            .map_err(|e| Error::IoError(e.kind()))?;

        let mut propagated_err: Option<Error> = None;
        for endpoint in endpoints {
            tracing::debug!("Connecting to {}", endpoint);
            match TcpStream::connect(endpoint).await {
                Ok(stream) => return Ok(stream),
                Err(e) => propagated_err = Some(Error::IoError(e.kind())),
            }
        }

        Err(propagated_err.unwrap_or(Error::IoError(ErrorKind::NotFound)))
    }

    /// Put the head of the queue on the wire.
    async fn write_next_request(&mut self) {
        let (api_key, correlation_id, body) = match self.in_flight.front() {
            Some(req) if !req.sent => (req.api_key, req.correlation_id, req.body.clone()),
            _ => return,
        };

        let header = HeaderRequest::new(api_key, correlation_id, &self.client_id);
        let frame = match encode_request_frame(&header, body.len()) {
            Ok(frame) => frame,
            Err(err) => {
                self.fail_head(err);
                return;
            }
        };

        let Some(socket) = self.socket.as_mut() else {
            return;
        };

        // Two slices, the body by reference; the header frame is the only
        // buffer assembled per write.
        let mut wire = frame.chain(body);
        let written = tokio::select! {
            _ = self.shutdown.notified() => return,
            written = socket.writer.write_all_buf(&mut wire) => written,
        };

        match written {
            Ok(()) => {
                tracing::trace!(correlation_id, "Request on the wire");
                if let Some(req) = self.in_flight.front_mut() {
                    req.sent = true;
                }
            }
            Err(e) => {
                tracing::error!("ERROR: Writing to Socket {:?}", e);
                // Only this request is failed; the connection stays open
                // for the next one.
                self.fail_head(Error::IoError(e.kind()));
            }
        }
    }

    /// Match one framed response (or the lack of one) against the head of
    /// the queue.
    fn handle_frame(&mut self, frame: Option<std::result::Result<ResponseFrame, Error>>) {
        match frame {
            Some(Ok(frame)) => {
                let Some(req) = self.in_flight.pop_front() else {
                    return;
                };

                if frame.correlation_id != req.correlation_id {
                    tracing::error!(
                        expected = req.correlation_id,
                        actual = frame.correlation_id,
                        "Correlation id mismatch, stream is desynchronized"
                    );
                    // Nothing read after this point can be attributed to a
                    // request; the connection is done.
                    self.gate.close();
                    let _ = req.slot.send(Err(Error::CorrelationMismatch {
                        expected: req.correlation_id,
                        actual: frame.correlation_id,
                    }));
                    return;
                }

                tracing::trace!(
                    correlation_id = frame.correlation_id,
                    bytes = frame.body.len(),
                    "Response matched"
                );
                let _ = req.slot.send(Ok(ResponseDecoder::new(frame.body)));
                // The run loop writes the next queued request, if any.
            }
            Some(Err(err)) => {
                self.gate.close();
                self.fail_head(err);
            }
            None => {
                // Clean EOF while a response was due.
                self.gate.close();
                self.fail_head(Error::IoError(ErrorKind::UnexpectedEof));
            }
        }
    }

    /// Fail and pop the request at the head of the queue.
    fn fail_head(&mut self, err: Error) {
        if let Some(req) = self.in_flight.pop_front() {
            tracing::debug!(correlation_id = req.correlation_id, "Failing request: {}", err);
            let _ = req.slot.send(Err(err));
        }
    }

    /// Shut both socket halves down and drop whatever is still queued;
    /// the dropped result slots surface as broken promises.
    async fn teardown(&mut self) {
        if let Some(mut socket) = self.socket.take() {
            let _ = socket.writer.shutdown().await;
        }
        if !self.in_flight.is_empty() {
            tracing::debug!(
                abandoned = self.in_flight.len(),
                "Broker closed with requests in flight"
            );
        }
        self.in_flight.clear();
        tracing::debug!(host = %self.identity.host, port = self.identity.port, "Engine stopped");
    }
}
