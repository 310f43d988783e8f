//! Reading content back from its root reference.

use std::{io::SeekFrom, sync::Arc};

use bytes::Bytes;
use futures_util::future::BoxFuture;
use hive_base::{
    Address,
    chunk::{BRANCHES, CHUNK_SIZE, ENCRYPTED_BRANCHES, SPAN_SIZE, span_of},
    storage::{Getter, ModeGet},
};
use snafu::{OptionExt, ensure};
use tracing::trace;

use super::{InvalidOffsetSnafu, JoinError, MalformedSnafu, Reference, encryption};

/// Reads the content under a root reference.
///
/// Chunks are fetched lazily, only the root is read up front. Reads at an
/// offset descend the trie along the subtree spans.
#[derive(derive_more::Debug)]
pub struct Joiner {
    #[debug("Getter")]
    getter: Arc<dyn Getter>,
    reference: Reference,
    #[debug(skip)]
    root: Bytes,
    size: u64,
    offset: u64,
    mode: ModeGet,
}

impl Joiner {
    /// Fetches the root chunk of `reference`.
    pub async fn new(getter: Arc<dyn Getter>, reference: Reference) -> Result<Self, JoinError> {
        Self::with_mode(getter, reference, ModeGet::Request).await
    }

    /// Like [`Joiner::new`], fetching every chunk with `mode`.
    pub async fn with_mode(
        getter: Arc<dyn Getter>,
        reference: Reference,
        mode: ModeGet,
    ) -> Result<Self, JoinError> {
        let root = fetch(getter.as_ref(), mode, &reference).await?;
        let size = span_of(&root).context(MalformedSnafu {
            address: *reference.address(),
        })?;
        Ok(Self {
            getter,
            reference,
            root,
            size,
            offset: 0,
            mode,
        })
    }

    /// Length of the content.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// The root reference.
    pub fn reference(&self) -> &Reference {
        &self.reference
    }

    /// Reads from the current position, advancing it.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, JoinError> {
        let n = self.read_at(buf, self.offset).await?;
        self.offset += n as u64;
        Ok(n)
    }

    /// Moves the current position.
    pub fn seek(&mut self, pos: SeekFrom) -> Result<u64, JoinError> {
        let offset = match pos {
            SeekFrom::Start(n) => Some(n),
            SeekFrom::End(n) => self.size.checked_add_signed(n),
            SeekFrom::Current(n) => self.offset.checked_add_signed(n),
        };
        let offset = offset
            .filter(|offset| *offset <= self.size)
            .context(InvalidOffsetSnafu {
                offset: self.offset,
                size: self.size,
            })?;
        self.offset = offset;
        Ok(offset)
    }

    /// Reads at `offset` into `buf`, returning the number of bytes read.
    /// Zero means the end of the content.
    pub async fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, JoinError> {
        ensure!(
            offset <= self.size,
            InvalidOffsetSnafu {
                offset,
                size: self.size
            }
        );
        let len = buf.len().min((self.size - offset) as usize);
        if len == 0 {
            return Ok(0);
        }
        self.read_node(self.root.clone(), *self.reference.address(), offset, &mut buf[..len])
            .await
    }

    /// Reads the whole content.
    pub async fn read_all(&self) -> Result<Bytes, JoinError> {
        let mut buf = vec![0u8; self.size as usize];
        let mut read = 0;
        while read < buf.len() {
            let n = self.read_at(&mut buf[read..], read as u64).await?;
            if n == 0 {
                break;
            }
            read += n;
        }
        buf.truncate(read);
        Ok(buf.into())
    }

    /// Calls `f` on the address of every chunk of the content, root first,
    /// in pre-order. Leaves are not fetched.
    pub async fn iterate_chunk_addresses<F>(&self, mut f: F) -> Result<(), JoinError>
    where
        F: FnMut(&Address) + Send,
    {
        f(self.reference.address());
        self.iterate_node(self.root.clone(), *self.reference.address(), &mut f)
            .await
    }

    fn branches(&self) -> usize {
        if self.reference.is_encrypted() {
            ENCRYPTED_BRANCHES
        } else {
            BRANCHES
        }
    }

    /// Size covered by each child of a node spanning `span` bytes.
    fn subtrie_size(&self, span: u64) -> u64 {
        let branches = self.branches() as u64;
        let mut size = CHUNK_SIZE as u64;
        while size * branches < span {
            size *= branches;
        }
        size
    }

    fn child_reference(
        &self,
        payload: &[u8],
        index: usize,
        address: Address,
    ) -> Result<Option<Reference>, JoinError> {
        let ref_size = self.reference.len();
        let Some(bytes) = payload.get(index * ref_size..(index + 1) * ref_size) else {
            return Ok(None);
        };
        let reference =
            Reference::from_slice(bytes).map_err(|_| MalformedSnafu { address }.build())?;
        Ok(Some(reference))
    }

    fn read_node<'a>(
        &'a self,
        data: Bytes,
        address: Address,
        offset: u64,
        buf: &'a mut [u8],
    ) -> BoxFuture<'a, Result<usize, JoinError>> {
        Box::pin(async move {
            let span = span_of(&data).context(MalformedSnafu { address })?;
            let payload = &data[SPAN_SIZE..];
            if span <= CHUNK_SIZE as u64 {
                if offset >= span {
                    return Ok(0);
                }
                let start = offset as usize;
                let n = buf.len().min(span as usize - start);
                let src = payload
                    .get(start..start + n)
                    .context(MalformedSnafu { address })?;
                buf[..n].copy_from_slice(src);
                return Ok(n);
            }
            let sub = self.subtrie_size(span);
            let mut index = (offset / sub) as usize;
            let mut child_offset = offset % sub;
            let mut written = 0;
            while written < buf.len() {
                let Some(child) = self.child_reference(payload, index, address)? else {
                    break;
                };
                let child_data = fetch(self.getter.as_ref(), self.mode, &child).await?;
                let n = self
                    .read_node(child_data, *child.address(), child_offset, &mut buf[written..])
                    .await?;
                if n == 0 {
                    break;
                }
                written += n;
                index += 1;
                child_offset = 0;
            }
            Ok(written)
        })
    }

    fn iterate_node<'a, F>(
        &'a self,
        data: Bytes,
        address: Address,
        f: &'a mut F,
    ) -> BoxFuture<'a, Result<(), JoinError>>
    where
        F: FnMut(&Address) + Send,
    {
        Box::pin(async move {
            let span = span_of(&data).context(MalformedSnafu { address })?;
            if span <= CHUNK_SIZE as u64 {
                return Ok(());
            }
            let payload = &data[SPAN_SIZE..];
            let sub = self.subtrie_size(span);
            let mut index = 0;
            while let Some(child) = self.child_reference(payload, index, address)? {
                f(child.address());
                let child_span = sub.min(span.saturating_sub(index as u64 * sub));
                if child_span > CHUNK_SIZE as u64 {
                    let child_data = fetch(self.getter.as_ref(), self.mode, &child).await?;
                    self.iterate_node(child_data, *child.address(), f).await?;
                }
                index += 1;
            }
            Ok(())
        })
    }
}

/// Fetches the chunk of `reference`, decrypting it if needed. Returns
/// `span || data`.
async fn fetch(
    getter: &dyn Getter,
    mode: ModeGet,
    reference: &Reference,
) -> Result<Bytes, JoinError> {
    let chunk = getter.get(mode, *reference.address()).await?;
    trace!(address = %reference.address().fmt_short(), "fetched");
    let data = match reference.key() {
        Some(key) => encryption::decrypt_chunk(key, chunk.data())?,
        None => chunk.data().clone(),
    };
    ensure!(
        data.len() >= SPAN_SIZE,
        MalformedSnafu {
            address: *reference.address()
        }
    );
    Ok(data)
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use hive_base::storage::{MemStore, Putter};
    use proptest::prelude::*;
    use rand::{Rng, SeedableRng};

    use super::*;
    use crate::file::{Pipeline, feed_pipeline};

    async fn upload(store: &MemStore, data: &[u8], encrypt: bool) -> Reference {
        let putter: Arc<dyn Putter> = Arc::new(store.clone());
        feed_pipeline(Pipeline::builder(putter).encrypt(encrypt).build(), data)
            .await
            .unwrap()
    }

    fn random(len: usize, seed: u64) -> Vec<u8> {
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(seed);
        (0..len).map(|_| rng.r#gen()).collect()
    }

    #[tokio::test]
    async fn roundtrip_boundaries() {
        let c = CHUNK_SIZE;
        let lens = [
            0,
            1,
            c - 1,
            c,
            c + 1,
            2 * c,
            BRANCHES * c - 1,
            BRANCHES * c,
            BRANCHES * c + 1,
            (BRANCHES + 2) * c,
        ];
        for (i, len) in lens.into_iter().enumerate() {
            for encrypt in [false, true] {
                let store = MemStore::new();
                let data = random(len, i as u64);
                let root = upload(&store, &data, encrypt).await;
                let joiner = Joiner::new(Arc::new(store), root).await.unwrap();
                assert_eq!(joiner.size(), len as u64);
                let out = joiner.read_all().await.unwrap();
                assert!(out == data, "len {len} encrypt {encrypt}");
            }
        }
    }

    #[tokio::test]
    async fn tiny_and_zeros() {
        let store = MemStore::new();
        let root = upload(&store, &[1, 2, 3, 4], false).await;
        let joiner = Joiner::new(Arc::new(store), root).await.unwrap();
        assert_eq!(&joiner.read_all().await.unwrap()[..], &[1, 2, 3, 4]);

        let store = MemStore::new();
        let data = vec![0u8; 130 * CHUNK_SIZE];
        let root = upload(&store, &data, false).await;
        let joiner = Joiner::new(Arc::new(store), root).await.unwrap();
        assert_eq!(joiner.size(), 532_480);
        let out = joiner.read_all().await.unwrap();
        assert_eq!(out.len(), 532_480);
        assert!(out.iter().all(|b| *b == 0));
    }

    #[tokio::test]
    async fn read_seek_and_read_at() {
        let store = MemStore::new();
        let data = random(3 * CHUNK_SIZE + 100, 9);
        let root = upload(&store, &data, false).await;
        let mut joiner = Joiner::new(Arc::new(store), root).await.unwrap();

        let mut buf = vec![0u8; 5000];
        let n = joiner.read_at(&mut buf, CHUNK_SIZE as u64 - 10).await.unwrap();
        assert_eq!(n, 5000);
        assert_eq!(&buf[..], &data[CHUNK_SIZE - 10..CHUNK_SIZE + 4990]);

        assert_eq!(joiner.seek(SeekFrom::End(-50)).unwrap(), data.len() as u64 - 50);
        let n = joiner.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &data[data.len() - 50..]);
        assert_eq!(joiner.read(&mut buf).await.unwrap(), 0);

        assert!(joiner.seek(SeekFrom::Start(data.len() as u64 + 1)).is_err());
        assert!(joiner.seek(SeekFrom::Current(-(data.len() as i64) - 1)).is_err());
    }

    #[tokio::test]
    async fn iterate_visits_every_chunk_once() {
        let store = MemStore::new();
        let data = random((BRANCHES + 3) * CHUNK_SIZE, 4);
        let root = upload(&store, &data, false).await;
        let joiner = Joiner::new(Arc::new(store.clone()), root).await.unwrap();
        let mut seen = Vec::new();
        joiner
            .iterate_chunk_addresses(|a| seen.push(*a))
            .await
            .unwrap();
        assert_eq!(seen[0], *root.address());
        let unique: HashSet<_> = seen.iter().copied().collect();
        assert_eq!(unique.len(), seen.len());
        let stored: HashSet<_> = store.chunks().iter().map(|c| *c.address()).collect();
        assert_eq!(unique, stored);
    }

    #[tokio::test]
    async fn missing_chunk_is_not_found() {
        let store = MemStore::new();
        let err = Joiner::new(Arc::new(store), Reference::new(Address::new([1; 32])))
            .await
            .unwrap_err();
        assert!(matches!(err, JoinError::Storage { source, .. } if source.is_not_found()));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(12))]

        #[test]
        fn roundtrip(len in 0usize..300_000, seed in any::<u64>(), encrypt in any::<bool>()) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let data = random(len, seed);
            let out = rt.block_on(async {
                let store = MemStore::new();
                let root = upload(&store, &data, encrypt).await;
                Joiner::new(Arc::new(store), root).await.unwrap().read_all().await.unwrap()
            });
            prop_assert!(out == data);
        }
    }
}
