//! Postal service over swarm: anonymous messages carried in chunks.
//!
//! A message is sealed for the recipient's public key and wrapped into a
//! trojan chunk that looks like any other content chunk:
//!
//! ```text
//! nonce[32] || ephemeral public key[33] || ciphertext
//! ciphertext = encrypt(topic[32] || len[2, BE] || message || padding)
//! ```
//!
//! The key is derived from an ECDH exchange between a fresh ephemeral key
//! and the recipient. The nonce is mined until the chunk address starts
//! with one of the target prefixes, so push sync carries the chunk into
//! the recipient's neighbourhood. Every node there tries to open the chunks
//! it stores; only the recipient recovers a topic it subscribed to.

use std::{
    collections::HashMap,
    fmt::{self, Debug},
    sync::{Arc, Mutex, Weak},
};

use bytes::Bytes;
use hive_base::{
    Chunk, Signer, cac,
    cac::CacError,
    chunk::CHUNK_SIZE,
    hash::keccak256,
};
use hive_postage::{PostageError, Stamper};
use k256::{PublicKey, elliptic_curve::sec1::ToEncodedPoint};
use nested_enum_utils::common_fields;
use rand::RngCore;
use snafu::{Backtrace, ResultExt, Snafu, ensure};
use tokio::sync::mpsc;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{Instrument, debug, debug_span, trace};

use crate::{
    file::encryption::{Encryption, EncryptionError},
    pushsync::{PushSync, PushSyncError},
};

const NONCE_SIZE: usize = 32;
const PUBLIC_KEY_SIZE: usize = 33;
const TOPIC_SIZE: usize = 32;
const LENGTH_SIZE: usize = 2;
const HEADER_SIZE: usize = NONCE_SIZE + PUBLIC_KEY_SIZE;
const PLAINTEXT_SIZE: usize = CHUNK_SIZE - HEADER_SIZE;

/// Longest message that fits into a trojan chunk.
pub const MAX_MESSAGE_SIZE: usize = PLAINTEXT_SIZE - TOPIC_SIZE - LENGTH_SIZE;

/// Nonces tried before mining gives up.
pub const MAX_MINING_ATTEMPTS: u32 = 1 << 20;

const SUBSCRIPTION_BUFFER: usize = 16;

/// Errors from sending messages.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum PssError {
    #[snafu(display("message of {len} bytes is longer than {MAX_MESSAGE_SIZE}"))]
    MessageTooLong { len: usize },
    #[snafu(display("no target prefix given"))]
    NoTargets {},
    #[snafu(display("no nonce found in {attempts} attempts"))]
    MiningFailed { attempts: u32 },
    #[snafu(display("mining task failed"))]
    Mining { source: tokio::task::JoinError },
    #[snafu(display("stamping trojan chunk"))]
    Stamp { source: PostageError },
    #[snafu(transparent)]
    Encryption { source: EncryptionError },
    #[snafu(transparent)]
    Cac { source: CacError },
    #[snafu(transparent)]
    Push { source: PushSyncError },
}

/// A message topic, the keccak hash of its name.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Topic([u8; TOPIC_SIZE]);

impl Topic {
    /// The topic called `name`.
    pub fn new(name: &str) -> Self {
        Self(keccak256([name.as_bytes()]))
    }

    /// The raw bytes.
    pub fn as_bytes(&self) -> &[u8; TOPIC_SIZE] {
        &self.0
    }
}

impl Debug for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Topic({})", data_encoding::HEXLOWER.encode(&self.0[..4]))
    }
}

fn message_key(shared_secret: &[u8; 32]) -> [u8; 32] {
    keccak256([shared_secret])
}

/// Seals `message` on `topic` for `recipient` into a trojan chunk whose
/// address starts with one of `targets`.
///
/// This mines a nonce and is CPU bound.
pub fn wrap(topic: &Topic, message: &[u8], recipient: &PublicKey, targets: &[Vec<u8>]) -> Result<Chunk, PssError> {
    ensure!(
        message.len() <= MAX_MESSAGE_SIZE,
        MessageTooLongSnafu { len: message.len() }
    );
    ensure!(!targets.is_empty(), NoTargetsSnafu);

    let ephemeral = Signer::generate(&mut rand::rngs::OsRng);
    let key = message_key(&ephemeral.shared_secret(recipient));
    let mut plaintext = Vec::with_capacity(TOPIC_SIZE + LENGTH_SIZE + message.len());
    plaintext.extend_from_slice(topic.as_bytes());
    plaintext.extend_from_slice(&(message.len() as u16).to_be_bytes());
    plaintext.extend_from_slice(message);
    let ciphertext = Encryption::new(key, PLAINTEXT_SIZE, 0).encrypt(&plaintext)?;

    let mut payload = vec![0u8; CHUNK_SIZE];
    payload[NONCE_SIZE..HEADER_SIZE].copy_from_slice(
        PublicKey::from(ephemeral.public_key())
            .to_encoded_point(true)
            .as_bytes(),
    );
    payload[HEADER_SIZE..].copy_from_slice(&ciphertext);

    let mut nonce = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce);
    for _ in 0..MAX_MINING_ATTEMPTS {
        payload[..NONCE_SIZE].copy_from_slice(&nonce);
        let chunk = cac::new(&payload)?;
        let address = chunk.address().as_bytes();
        if targets.iter().any(|target| address.starts_with(target)) {
            return Ok(chunk);
        }
        increment(&mut nonce);
    }
    MiningFailedSnafu {
        attempts: MAX_MINING_ATTEMPTS,
    }
    .fail()
}

fn increment(nonce: &mut [u8; NONCE_SIZE]) {
    for byte in nonce.iter_mut().rev() {
        let (next, overflow) = byte.overflowing_add(1);
        *byte = next;
        if !overflow {
            break;
        }
    }
}

/// Opens a trojan chunk with `signer`'s key.
///
/// Returns `None` for chunks that are not trojan chunks. A chunk sealed for
/// someone else opens to a random topic.
pub fn unwrap(signer: &Signer, chunk: &Chunk) -> Option<(Topic, Bytes)> {
    let payload = chunk.payload();
    if payload.len() != CHUNK_SIZE {
        return None;
    }
    let ephemeral = PublicKey::from_sec1_bytes(&payload[NONCE_SIZE..HEADER_SIZE]).ok()?;
    let key = message_key(&signer.shared_secret(&ephemeral));
    let plaintext = Encryption::new(key, PLAINTEXT_SIZE, 0)
        .decrypt(&payload[HEADER_SIZE..])
        .ok()?;
    let topic = Topic(plaintext[..TOPIC_SIZE].try_into().ok()?);
    let len = u16::from_be_bytes(
        plaintext[TOPIC_SIZE..TOPIC_SIZE + LENGTH_SIZE]
            .try_into()
            .ok()?,
    ) as usize;
    let start = TOPIC_SIZE + LENGTH_SIZE;
    let message = plaintext.get(start..start + len)?;
    Some((topic, Bytes::copy_from_slice(message)))
}

/// Sends and receives trojan messages.
///
/// Cheap to clone.
#[derive(Debug, Clone)]
pub struct Pss {
    inner: Arc<Inner>,
}

type Subscribers = Arc<Mutex<HashMap<Topic, Vec<mpsc::Sender<Bytes>>>>>;

#[derive(Debug)]
struct Inner {
    signer: Arc<Signer>,
    pushsync: PushSync,
    topics: Subscribers,
    deliveries: mpsc::UnboundedSender<(Topic, Bytes)>,
    tasks: TaskTracker,
    cancel: CancellationToken,
}

impl Pss {
    /// Creates the service and hooks it into `pushsync`, so chunks stored
    /// at the end of a push are opened with `signer`'s key.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(signer: Arc<Signer>, pushsync: PushSync) -> Self {
        let topics = Subscribers::default();
        let (deliveries, queue) = mpsc::unbounded_channel();
        let tasks = TaskTracker::new();
        let cancel = CancellationToken::new();
        tasks.spawn(
            deliver_loop(topics.clone(), queue, cancel.clone()).instrument(debug_span!("pss.deliver")),
        );
        let inner = Arc::new(Inner {
            signer,
            pushsync: pushsync.clone(),
            topics,
            deliveries,
            tasks,
            cancel,
        });
        let weak = Arc::downgrade(&inner);
        let hooked = pushsync.set_stored_hook(Arc::new(move |chunk: &Chunk| {
            if let Some(inner) = Weak::upgrade(&weak) {
                Pss { inner }.deliver(chunk);
            }
        }));
        if !hooked {
            debug!("push sync already has a stored hook, pss receives nothing");
        }
        Self { inner }
    }

    /// Receives the messages on `topic` sealed for this node.
    ///
    /// Delivery waits while the receiver is full, holding back the
    /// messages behind it.
    pub fn subscribe(&self, topic: Topic) -> mpsc::Receiver<Bytes> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        self.inner
            .topics
            .lock()
            .expect("poisoned")
            .entry(topic)
            .or_default()
            .push(tx);
        rx
    }

    /// Seals `message` for `recipient` and pushes it towards `targets`.
    pub async fn send(
        &self,
        topic: Topic,
        message: Bytes,
        recipient: PublicKey,
        targets: Vec<Vec<u8>>,
        stamper: &Stamper,
    ) -> Result<(), PssError> {
        let chunk = tokio::task::spawn_blocking(move || wrap(&topic, &message, &recipient, &targets))
            .await
            .context(MiningSnafu)??;
        let stamp = stamper.stamp(chunk.address()).context(StampSnafu)?;
        let chunk = chunk.with_stamp(stamp);
        trace!(chunk = %chunk.address().fmt_short(), ?topic, "sending trojan chunk");
        match self.inner.pushsync.push_chunk_to_closest(chunk.clone()).await {
            Ok(_) => Ok(()),
            Err(err) if err.is_want_self() => {
                self.deliver(&chunk);
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Opens `chunk` and queues its message for the subscribers of its
    /// topic.
    pub fn deliver(&self, chunk: &Chunk) {
        let Some((topic, message)) = unwrap(&self.inner.signer, chunk) else {
            return;
        };
        if !self
            .inner
            .topics
            .lock()
            .expect("poisoned")
            .contains_key(&topic)
        {
            return;
        }
        if self.inner.deliveries.send((topic, message)).is_err() {
            debug!(?topic, "pss shut down, message not delivered");
        }
    }

    /// Stops delivering messages and waits for the delivery task.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
    }
}

/// Hands queued messages to subscribers in order, waiting on full ones.
async fn deliver_loop(
    topics: Subscribers,
    mut queue: mpsc::UnboundedReceiver<(Topic, Bytes)>,
    cancel: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = queue.recv() => next,
        };
        let Some((topic, message)) = next else {
            break;
        };
        let subscribers = {
            let mut topics = topics.lock().expect("poisoned");
            let Some(subscribers) = topics.get_mut(&topic) else {
                continue;
            };
            subscribers.retain(|tx| !tx.is_closed());
            subscribers.clone()
        };
        for tx in subscribers {
            match cancel.run_until_cancelled(tx.send(message.clone())).await {
                Some(Ok(())) => {}
                Some(Err(_)) => trace!(?topic, "subscriber gone"),
                None => return,
            }
        }
        trace!(?topic, "delivered message");
    }
    debug!("pss delivery stopped");
}
