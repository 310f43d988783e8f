//! The splitter pipeline.
//!
//! Bytes written into a [`Pipeline`] are cut into chunks by the feeder and
//! passed down a chain of [`ChainWriter`]s: optional encryption, the BMT
//! hasher and the store writer. The hash trie writer at the end of the
//! chain collects the references of consecutive chunks and wraps every
//! full level into an intermediate chunk, which goes through a short chain
//! of its own. [`Pipeline::sum`] wraps the partial levels left over and
//! returns the root reference.

use std::{fmt::Debug, sync::Arc};

use bytes::{BufMut, Bytes, BytesMut};
use futures_util::future::BoxFuture;
use hive_base::{
    Address, Chunk,
    bmt,
    chunk::{BRANCHES, CHUNK_SIZE, ENCRYPTED_BRANCHES, SPAN_SIZE},
    storage::{ModePut, Putter},
};
use hive_postage::Stamper;
use hive_store::{Tag, tags::State};
use snafu::ensure;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::trace;

use super::{
    InconsistentRefsSnafu, PipelineError, Reference, ShortWriteSnafu, UnterminatedSnafu,
    encryption::{self, Key},
};

/// What travels down a chain: one chunk and what is known about it.
#[derive(Debug, Clone, Default)]
pub struct PipeWriteArgs {
    /// The span in clear.
    pub span: u64,
    /// `span || data`, encrypted once past the encryption writer.
    pub data: Bytes,
    /// Set by the BMT writer.
    pub address: Address,
    /// Set by the encryption writer.
    pub key: Option<Key>,
}

impl PipeWriteArgs {
    fn new(span: u64, data: &[u8]) -> Self {
        let mut payload = BytesMut::with_capacity(SPAN_SIZE + data.len());
        payload.put_u64_le(span);
        payload.put_slice(data);
        Self {
            span,
            data: payload.freeze(),
            ..Default::default()
        }
    }

    fn reference(&self) -> Reference {
        match self.key {
            Some(key) => Reference::encrypted(self.address, key),
            None => Reference::new(self.address),
        }
    }
}

/// A stage of the pipeline.
pub trait ChainWriter: Send + Debug {
    /// Processes one chunk and passes it on.
    fn chain_write<'a>(
        &'a mut self,
        args: &'a mut PipeWriteArgs,
    ) -> BoxFuture<'a, Result<(), PipelineError>>;

    /// Finalizes the chain, returning the root reference.
    fn sum(&mut self) -> BoxFuture<'_, Result<Reference, PipelineError>>;
}

#[derive(Debug)]
struct EncryptionWriter {
    next: Box<dyn ChainWriter>,
}

impl ChainWriter for EncryptionWriter {
    fn chain_write<'a>(
        &'a mut self,
        args: &'a mut PipeWriteArgs,
    ) -> BoxFuture<'a, Result<(), PipelineError>> {
        Box::pin(async move {
            let (key, data) = encryption::encrypt_chunk(&args.data)?;
            args.data = data;
            args.key = Some(key);
            self.next.chain_write(args).await
        })
    }

    fn sum(&mut self) -> BoxFuture<'_, Result<Reference, PipelineError>> {
        self.next.sum()
    }
}

#[derive(Debug)]
struct BmtWriter {
    next: Box<dyn ChainWriter>,
}

impl ChainWriter for BmtWriter {
    fn chain_write<'a>(
        &'a mut self,
        args: &'a mut PipeWriteArgs,
    ) -> BoxFuture<'a, Result<(), PipelineError>> {
        Box::pin(async move {
            let (span, data) = args.data.split_at(SPAN_SIZE);
            let mut header = [0u8; SPAN_SIZE];
            header.copy_from_slice(span);
            let mut hasher = bmt::pooled();
            hasher.set_header(header);
            hasher.write(data)?;
            args.address = Address::new(hasher.hash());
            drop(hasher);
            self.next.chain_write(args).await
        })
    }

    fn sum(&mut self) -> BoxFuture<'_, Result<Reference, PipelineError>> {
        self.next.sum()
    }
}

#[derive(derive_more::Debug)]
struct StoreWriter {
    #[debug("Putter")]
    putter: Arc<dyn Putter>,
    mode: ModePut,
    tag: Option<Arc<Tag>>,
    stamper: Option<Stamper>,
    next: Option<Box<dyn ChainWriter>>,
}

impl ChainWriter for StoreWriter {
    fn chain_write<'a>(
        &'a mut self,
        args: &'a mut PipeWriteArgs,
    ) -> BoxFuture<'a, Result<(), PipelineError>> {
        Box::pin(async move {
            let mut chunk = Chunk::new(args.address, args.data.clone());
            if let Some(stamper) = &self.stamper {
                chunk = chunk.with_stamp(stamper.stamp(&args.address)?);
            }
            if let Some(tag) = &self.tag {
                chunk = chunk.with_tag_id(tag.uid());
                tag.inc(State::Split);
            }
            let exists = self.putter.put(self.mode, vec![chunk]).await?;
            if let Some(tag) = &self.tag {
                if exists.first().copied().unwrap_or(false) {
                    tag.inc(State::Seen);
                }
                tag.inc(State::Stored);
            }
            trace!(address = %args.address.fmt_short(), span = args.span, "stored chunk");
            match &mut self.next {
                Some(next) => next.chain_write(args).await,
                None => Ok(()),
            }
        })
    }

    fn sum(&mut self) -> BoxFuture<'_, Result<Reference, PipelineError>> {
        match &mut self.next {
            Some(next) => next.sum(),
            None => Box::pin(async { UnterminatedSnafu.fail() }),
        }
    }
}

/// Collects references level by level and wraps them into intermediate
/// chunks.
#[derive(Debug)]
struct HashTrieWriter {
    branches: usize,
    /// `levels[0]` holds the references of leaves.
    levels: Vec<Vec<(u64, Reference)>>,
    parents: Box<dyn ChainWriter>,
}

impl HashTrieWriter {
    async fn write_to_level(
        &mut self,
        level: usize,
        span: u64,
        reference: Reference,
    ) -> Result<(), PipelineError> {
        let mut level = level;
        let mut entry = (span, reference);
        loop {
            if self.levels.len() <= level {
                self.levels.push(Vec::with_capacity(self.branches));
            }
            self.levels[level].push(entry);
            if self.levels[level].len() < self.branches {
                return Ok(());
            }
            entry = self.wrap_level(level).await?;
            level += 1;
        }
    }

    /// Turns the references on `level` into one intermediate chunk and
    /// returns its span and reference.
    async fn wrap_level(&mut self, level: usize) -> Result<(u64, Reference), PipelineError> {
        let entries = std::mem::take(&mut self.levels[level]);
        let span: u64 = entries.iter().map(|(span, _)| span).sum();
        let mut data = Vec::with_capacity(entries.len() * entries[0].1.len());
        for (_, reference) in &entries {
            data.extend_from_slice(&reference.to_bytes());
        }
        let mut args = PipeWriteArgs::new(span, &data);
        self.parents.chain_write(&mut args).await?;
        trace!(level, refs = entries.len(), span, "wrapped level");
        Ok((span, args.reference()))
    }
}

impl ChainWriter for HashTrieWriter {
    fn chain_write<'a>(
        &'a mut self,
        args: &'a mut PipeWriteArgs,
    ) -> BoxFuture<'a, Result<(), PipelineError>> {
        Box::pin(async move {
            let reference = args.reference();
            self.write_to_level(0, args.span, reference).await
        })
    }

    fn sum(&mut self) -> BoxFuture<'_, Result<Reference, PipelineError>> {
        Box::pin(async move {
            let mut level = 0;
            while level < self.levels.len() {
                let higher_empty = self.levels[level + 1..].iter().all(Vec::is_empty);
                match self.levels[level].len() {
                    0 => {}
                    // the top reference is the root
                    1 if higher_empty => return Ok(self.levels[level][0].1),
                    // a lone reference is carried to the next level as is
                    1 => {
                        let entry = self.levels[level].remove(0);
                        self.levels[level + 1].push(entry);
                    }
                    _ => {
                        let (span, reference) = self.wrap_level(level).await?;
                        if self.levels.len() == level + 1 {
                            self.levels.push(Vec::new());
                        }
                        self.levels[level + 1].push((span, reference));
                    }
                }
                level += 1;
            }
            InconsistentRefsSnafu { refs: 0usize }.fail()
        })
    }
}

/// Builds a [`Pipeline`].
#[derive(derive_more::Debug)]
pub struct PipelineBuilder {
    #[debug("Putter")]
    putter: Arc<dyn Putter>,
    mode: ModePut,
    encrypt: bool,
    tag: Option<Arc<Tag>>,
    stamper: Option<Stamper>,
}

impl PipelineBuilder {
    /// Mode chunks are stored with, [`ModePut::Upload`] by default.
    pub fn mode(mut self, mode: ModePut) -> Self {
        self.mode = mode;
        self
    }

    /// Whether to encrypt the content.
    pub fn encrypt(mut self, encrypt: bool) -> Self {
        self.encrypt = encrypt;
        self
    }

    /// Upload tag counting the chunks.
    pub fn tag(mut self, tag: Arc<Tag>) -> Self {
        self.tag = Some(tag);
        self
    }

    /// Stamps every chunk before storing it.
    pub fn stamper(mut self, stamper: Stamper) -> Self {
        self.stamper = Some(stamper);
        self
    }

    fn short_chain(&self, next: Option<Box<dyn ChainWriter>>) -> Box<dyn ChainWriter> {
        let store = Box::new(StoreWriter {
            putter: self.putter.clone(),
            mode: self.mode,
            tag: self.tag.clone(),
            stamper: self.stamper.clone(),
            next,
        });
        let bmt = Box::new(BmtWriter { next: store });
        if self.encrypt {
            Box::new(EncryptionWriter { next: bmt })
        } else {
            bmt
        }
    }

    /// Builds the pipeline.
    pub fn build(self) -> Pipeline {
        let branches = if self.encrypt {
            ENCRYPTED_BRANCHES
        } else {
            BRANCHES
        };
        let trie = Box::new(HashTrieWriter {
            branches,
            levels: Vec::new(),
            parents: self.short_chain(None),
        });
        Pipeline {
            next: self.short_chain(Some(trie)),
            buffer: BytesMut::with_capacity(CHUNK_SIZE),
            written: 0,
        }
    }
}

/// Splits content into chunks, stores them and computes the root
/// reference.
#[derive(Debug)]
pub struct Pipeline {
    next: Box<dyn ChainWriter>,
    buffer: BytesMut,
    written: u64,
}

impl Pipeline {
    /// Starts building a pipeline storing into `putter`.
    pub fn builder(putter: Arc<dyn Putter>) -> PipelineBuilder {
        PipelineBuilder {
            putter,
            mode: ModePut::Upload,
            encrypt: false,
            tag: None,
            stamper: None,
        }
    }

    /// Writes `data`, emitting a chunk for every full [`CHUNK_SIZE`] block.
    ///
    /// Returns the number of bytes consumed.
    pub async fn write(&mut self, data: &[u8]) -> Result<usize, PipelineError> {
        let mut rest = data;
        while !rest.is_empty() {
            let n = (CHUNK_SIZE - self.buffer.len()).min(rest.len());
            self.buffer.put_slice(&rest[..n]);
            rest = &rest[n..];
            if self.buffer.len() == CHUNK_SIZE {
                self.emit().await?;
            }
        }
        self.written += data.len() as u64;
        Ok(data.len())
    }

    /// Number of bytes written so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Emits the partial last block and returns the root reference.
    ///
    /// Empty content still produces a single chunk with span zero.
    pub async fn sum(mut self) -> Result<Reference, PipelineError> {
        if !self.buffer.is_empty() || self.written == 0 {
            self.emit().await?;
        }
        self.next.sum().await
    }

    async fn emit(&mut self) -> Result<(), PipelineError> {
        let block = self.buffer.split().freeze();
        let mut args = PipeWriteArgs::new(block.len() as u64, &block);
        self.next.chain_write(&mut args).await
    }
}

/// Feeds everything from `reader` into `pipeline` and returns the root.
pub async fn feed_pipeline<R>(mut pipeline: Pipeline, mut reader: R) -> Result<Reference, PipelineError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        let written = pipeline.write(&buf[..n]).await?;
        ensure!(
            written == n,
            ShortWriteSnafu {
                written,
                expected: n
            }
        );
    }
    pipeline.sum().await
}
