//! Connection & communication with a broker.
//!
//! Kafka uses a binary protocol over TCP. The protocol defines all APIs as
//! request response message pairs. The server guarantees that on a single
//! TCP connection, requests will be processed in the order they are sent
//! and responses will return in that order as well; everything this module
//! does leans on that guarantee.
//!
//! One [`Broker`] owns one socket to one endpoint. Requests submitted
//! through [`Broker::call`] from any thread are handed to a per-broker
//! engine task which serializes them onto the socket one at a time, reads
//! the framed responses back in the same order, checks each response's
//! correlation id against the request at the head of the in-flight queue,
//! and resolves the submitter's [`WaitHandle`].
//!
//! The engine never reorders, never interleaves two requests on the wire,
//! and never reconnects on its own; when the stream desynchronizes or the
//! socket fails mid-read it closes, and the layer above decides whether to
//! build a fresh `Broker`.

mod actor;

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Condvar, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, Notify};

use crate::error::{Error, Result};
use crate::protocol::ResponseDecoder;

use self::actor::{BrokerActor, Command};

/// Identity of the endpoint a [`Broker`] talks to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerIdentity {
    /// Node id assigned by the cluster metadata layer; opaque down here.
    pub node_id: i32,
    pub host: String,
    pub port: u16,
}

/// Connection lifecycle.
///
/// Transitions only move forward: `Init → Connecting → Connected → Closed`,
/// with a jump to `Closed` allowed from anywhere. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionState {
    Init,
    Connecting,
    Connected,
    Closed,
}

/// The one piece of broker state touched from outside the engine task.
///
/// Guarded by a mutex; every transition out of `Connecting` is broadcast
/// on the condvar so that all blocked connect waiters re-evaluate.
#[derive(Debug)]
struct ConnectionGate {
    state: Mutex<ConnectionState>,
    connect_done: Condvar,
}

impl ConnectionGate {
    fn new() -> ConnectionGate {
        ConnectionGate {
            state: Mutex::new(ConnectionState::Init),
            connect_done: Condvar::new(),
        }
    }

    fn current(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    fn is_connected(&self) -> bool {
        self.current() == ConnectionState::Connected
    }

    fn is_connecting(&self) -> bool {
        self.current() == ConnectionState::Connecting
    }

    fn is_closed(&self) -> bool {
        self.current() == ConnectionState::Closed
    }

    /// `Init → Connecting`. Only the single caller that observes `Init`
    /// gets `true` and with it the job of kicking off the connect.
    fn begin_connecting(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if *state == ConnectionState::Init {
            *state = ConnectionState::Connecting;
            true
        } else {
            false
        }
    }

    /// `Connecting → Connected`. Returns `false` when a close won the race.
    fn mark_connected(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if *state == ConnectionState::Connecting {
            *state = ConnectionState::Connected;
            self.connect_done.notify_all();
            true
        } else {
            false
        }
    }

    /// Any state → `Closed`. Returns whether this call did the closing.
    fn close(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if *state == ConnectionState::Closed {
            return false;
        }
        *state = ConnectionState::Closed;
        self.connect_done.notify_all();
        true
    }

    /// Block until the state leaves `Connecting`, up to `timeout`.
    fn wait_while_connecting(&self, timeout: Duration) -> ConnectionState {
        let state = self.state.lock().unwrap();
        let (state, _) = self
            .connect_done
            .wait_timeout_while(state, timeout, |s| *s == ConnectionState::Connecting)
            .unwrap();
        *state
    }
}

/// Client-side connection engine for a single Kafka broker endpoint.
///
/// Cheap to clone; all clones share one socket, one in-flight queue and
/// one lifecycle. The engine task holding those lives on the tokio runtime
/// that was current when [`Broker::new`] ran, and shuts down when the
/// broker is closed or the last clone is dropped.
///
/// ### Example
/// ```no_run
/// use gregor::prelude::*;
///
/// # async fn example() -> Result<()> {
/// let broker = Broker::new(0, "localhost", 9092, "my-client");
/// tokio::task::spawn_blocking({
///     let broker = broker.clone();
///     move || broker.wait_for_connect(std::time::Duration::from_secs(1))
/// })
/// .await
/// .unwrap()?;
///
/// let response = broker.call(api_key::API_VERSIONS, bytes::Bytes::new()).await?;
/// println!("{} response bytes", response.len());
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct Broker {
    identity: BrokerIdentity,
    gate: Arc<ConnectionGate>,
    mailbox: mpsc::UnboundedSender<Command>,
    shutdown: Arc<Notify>,
}

impl Broker {
    /// Set up the engine for one `(host, port)` endpoint.
    ///
    /// No I/O happens yet; the connection is established by the first
    /// [`wait_for_connect`](Broker::wait_for_connect). Must be called from
    /// within a tokio runtime, which the engine task is spawned onto.
    pub fn new(
        node_id: i32,
        host: impl Into<String>,
        port: u16,
        client_id: impl Into<String>,
    ) -> Broker {
        let identity = BrokerIdentity {
            node_id,
            host: host.into(),
            port,
        };
        let gate = Arc::new(ConnectionGate::new());
        let shutdown = Arc::new(Notify::new());
        let (mailbox, commands) = mpsc::unbounded_channel();

        let actor = BrokerActor::new(
            identity.clone(),
            client_id.into(),
            Arc::clone(&gate),
            Arc::clone(&shutdown),
            commands,
        );
        tokio::spawn(actor.run());

        Broker {
            identity,
            gate,
            mailbox,
            shutdown,
        }
    }

    /// Submit an already-encoded request body for `api_key`.
    ///
    /// `body` must be the Kafka request body for that API at
    /// [`API_VERSION`](crate::protocol::API_VERSION), without the request
    /// header or length prefix; the engine wraps both around it.
    ///
    /// Returns immediately and performs no network I/O on the caller's
    /// thread. Submissions from one thread keep their order; the returned
    /// handle resolves exactly once, with the matched response or with the
    /// failure that ended this request.
    pub fn call(&self, api_key: i16, body: Bytes) -> WaitHandle {
        let (slot, handle) = oneshot::channel();

        if let Err(rejected) = self.mailbox.send(Command::Call {
            api_key,
            body,
            slot,
        }) {
            // The engine is gone; resolve on the spot.
            if let Command::Call { slot, .. } = rejected.0 {
                let _ = slot.send(Err(Error::NetworkFail));
            }
        }

        WaitHandle { inner: handle }
    }

    /// Block until the connection is up, closed, or `timeout` has passed.
    ///
    /// The first caller to observe the pristine broker triggers the
    /// resolve/connect attempt; everyone else just waits on the gate.
    /// A [`Error::NetworkTimeout`] return leaves the attempt running, so
    /// waiting again later is allowed and may succeed.
    ///
    /// This call parks the current thread. Do not run it on a thread that
    /// is driving the runtime; from async code wrap it in
    /// [`tokio::task::spawn_blocking`].
    pub fn wait_for_connect(&self, timeout: Duration) -> Result<()> {
        match self.gate.current() {
            ConnectionState::Connected => return Ok(()),
            ConnectionState::Closed => return Err(Error::NetworkFail),
            ConnectionState::Init => {
                if self.gate.begin_connecting() && self.mailbox.send(Command::Connect).is_err() {
                    self.gate.close();
                    return Err(Error::NetworkFail);
                }
            }
            ConnectionState::Connecting => {}
        }

        match self.gate.wait_while_connecting(timeout) {
            ConnectionState::Connected => Ok(()),
            ConnectionState::Closed => Err(Error::NetworkFail),
            _ => Err(Error::NetworkTimeout),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.gate.is_connected()
    }

    pub fn is_closed(&self) -> bool {
        self.gate.is_closed()
    }

    pub fn identity(&self) -> &BrokerIdentity {
        &self.identity
    }

    /// Tear the connection down. Idempotent.
    ///
    /// Both halves of the socket are shut down and every blocked
    /// [`wait_for_connect`](Broker::wait_for_connect) wakes with
    /// [`Error::NetworkFail`]. In-flight requests are not given a failure
    /// code; their handles resolve [`Error::Closed`] once the engine drops
    /// their result slots.
    pub fn close(&self) {
        if self.gate.close() {
            tracing::debug!(host = %self.identity.host, port = self.identity.port, "Closing broker");
            self.shutdown.notify_one();
        }
    }
}

/// One-shot handle for a submitted request.
///
/// Resolves exactly once: with the response decoder for the frame that
/// answered this request, or with the error that ended it. If the broker
/// closes while the request is still in flight the handle resolves
/// [`Error::Closed`].
#[derive(Debug)]
pub struct WaitHandle {
    inner: oneshot::Receiver<Result<ResponseDecoder>>,
}

impl Future for WaitHandle {
    type Output = Result<ResponseDecoder>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.inner).poll(cx).map(|slot| match slot {
            Ok(resolution) => resolution,
            Err(_) => Err(Error::Closed),
        })
    }
}
