//! An accept loop routing incoming streams to protocol handlers.

use std::{collections::BTreeMap, sync::Arc};

use n0_future::{
    boxed::BoxFuture,
    join_all,
    task::{self, AbortOnDropHandle, JoinSet},
};
use nested_enum_utils::common_fields;
use snafu::{Backtrace, IntoError, Snafu};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info_span, trace, warn};

use super::{Incoming, Stream, StreamError};
use crate::blocklist::Blocklist;

/// Errors from handling an incoming stream.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum AcceptError {
    #[snafu(display("peer not allowed"))]
    NotAllowed {},
    #[snafu(transparent)]
    Stream { source: StreamError },
    #[snafu(display("{source}"))]
    User {
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },
}

impl AcceptError {
    /// Wraps a protocol specific error.
    pub fn from_err<T: std::error::Error + Send + Sync + 'static>(value: T) -> Self {
        UserSnafu.into_error(Box::new(value))
    }
}

/// Handler for incoming streams of one protocol.
///
/// Register it on a [`Router`] with [`RouterBuilder::accept`].
pub trait ProtocolHandler: Send + Sync + std::fmt::Debug + 'static {
    /// Handles an incoming stream.
    ///
    /// This runs on a freshly spawned task so this can be long-running.
    fn accept(&self, stream: Stream) -> BoxFuture<Result<(), AcceptError>>;

    /// Called when the node shuts down.
    fn shutdown(&self) -> BoxFuture<()> {
        Box::pin(async move {})
    }
}

impl<T: ProtocolHandler> ProtocolHandler for Arc<T> {
    fn accept(&self, stream: Stream) -> BoxFuture<Result<(), AcceptError>> {
        self.as_ref().accept(stream)
    }

    fn shutdown(&self) -> BoxFuture<()> {
        self.as_ref().shutdown()
    }
}

impl<T: ProtocolHandler> ProtocolHandler for Box<T> {
    fn accept(&self, stream: Stream) -> BoxFuture<Result<(), AcceptError>> {
        self.as_ref().accept(stream)
    }

    fn shutdown(&self) -> BoxFuture<()> {
        self.as_ref().shutdown()
    }
}

#[derive(Debug, Default)]
struct ProtocolMap(BTreeMap<String, Box<dyn ProtocolHandler>>);

impl ProtocolMap {
    fn get(&self, protocol: &str) -> Option<&dyn ProtocolHandler> {
        self.0.get(protocol).map(|p| &**p)
    }

    fn insert(&mut self, protocol: String, handler: Box<dyn ProtocolHandler>) {
        self.0.insert(protocol, handler);
    }

    /// Calls and awaits [`ProtocolHandler::shutdown`] for all handlers concurrently.
    async fn shutdown(&self) {
        let handlers = self.0.values().map(|p| p.shutdown());
        join_all(handlers).await;
    }
}

/// The running accept loop.
///
/// When dropped, this aborts the accept loop, so make sure to keep it and
/// call [`Router::shutdown`] before ending the process.
#[derive(Clone, Debug)]
pub struct Router {
    task: Arc<Mutex<Option<AbortOnDropHandle<()>>>>,
    cancel_token: CancellationToken,
}

/// Builder for a [`Router`].
#[derive(Debug)]
pub struct RouterBuilder {
    incoming: mpsc::Receiver<Incoming>,
    protocols: ProtocolMap,
}

impl Router {
    /// Creates a router accepting streams from `incoming`.
    pub fn builder(incoming: mpsc::Receiver<Incoming>) -> RouterBuilder {
        RouterBuilder {
            incoming,
            protocols: ProtocolMap::default(),
        }
    }

    /// Checks if the router is already shutdown.
    pub fn is_shutdown(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Shuts down the accept loop and all handlers.
    ///
    /// If already shutdown, it returns immediately.
    pub async fn shutdown(&self) {
        if self.is_shutdown() {
            return;
        }
        self.cancel_token.cancel();
        if let Some(task) = self.task.lock().await.take() {
            if let Err(err) = task.await {
                warn!("router task failed: {err:?}");
            }
        }
    }
}

impl RouterBuilder {
    /// Routes streams for `protocol` to `handler`.
    pub fn accept<T: ProtocolHandler>(mut self, protocol: impl Into<String>, handler: T) -> Self {
        self.protocols.insert(protocol.into(), Box::new(handler));
        self
    }

    /// Spawns the accept loop.
    pub fn spawn(self) -> Router {
        let mut incoming = self.incoming;
        let protocols = Arc::new(self.protocols);
        let mut join_set = JoinSet::new();
        let cancel = CancellationToken::new();
        let cancel_token = cancel.clone();

        let run_loop_fut = async move {
            let _cancel_guard = cancel_token.clone().drop_guard();
            loop {
                tokio::select! {
                    biased;
                    _ = cancel_token.cancelled() => break,
                    Some(res) = join_set.join_next() => {
                        match res {
                            Err(outer) => {
                                if outer.is_panic() {
                                    error!("Task panicked: {outer:?}");
                                    break;
                                } else if outer.is_cancelled() {
                                    trace!("Task cancelled: {outer:?}");
                                } else {
                                    error!("Task failed: {outer:?}");
                                    break;
                                }
                            }
                            Ok(_) => trace!("Task finished"),
                        }
                    },
                    incoming = incoming.recv() => {
                        let Some(incoming) = incoming else {
                            break;
                        };
                        let protocols = protocols.clone();
                        let token = cancel_token.child_token();
                        join_set.spawn(async move {
                            token.run_until_cancelled(handle_stream(incoming, protocols)).await
                        }.instrument(info_span!("router.accept")));
                    },
                }
            }
            protocols.shutdown().await;
            debug!("shutting down remaining tasks");
            join_set.shutdown().await;
        };
        let task = AbortOnDropHandle::new(task::spawn(run_loop_fut));
        Router {
            task: Arc::new(Mutex::new(Some(task))),
            cancel_token: cancel,
        }
    }
}

async fn handle_stream(incoming: Incoming, protocols: Arc<ProtocolMap>) {
    let Incoming { protocol, stream } = incoming;
    let Some(handler) = protocols.get(&protocol) else {
        warn!(%protocol, "ignoring stream: unsupported protocol");
        return;
    };
    let peer = stream.peer().fmt_short();
    trace!(%protocol, %peer, "handling stream");
    if let Err(err) = handler.accept(stream).await {
        debug!(%protocol, %peer, "handling stream ended with error: {err}");
    }
}

/// Wraps a protocol, refusing streams from blocklisted peers.
#[derive(Debug, Clone)]
pub struct BlocklistLimit<P: ProtocolHandler + Clone> {
    proto: P,
    blocklist: Blocklist,
}

impl<P: ProtocolHandler + Clone> BlocklistLimit<P> {
    /// Creates a new `BlocklistLimit`.
    pub fn new(proto: P, blocklist: Blocklist) -> Self {
        Self { proto, blocklist }
    }
}

impl<P: ProtocolHandler + Clone> ProtocolHandler for BlocklistLimit<P> {
    fn accept(&self, stream: Stream) -> BoxFuture<Result<(), AcceptError>> {
        let this = self.clone();
        Box::pin(async move {
            let peer = *stream.peer();
            let blocked = match this.blocklist.exists(&peer) {
                Ok(blocked) => blocked,
                Err(err) => {
                    warn!(peer = %peer.fmt_short(), "blocklist lookup failed: {err}");
                    false
                }
            };
            if blocked {
                return NotAllowedSnafu.fail();
            }
            this.proto.accept(stream).await
        })
    }

    fn shutdown(&self) -> BoxFuture<()> {
        self.proto.shutdown()
    }
}
