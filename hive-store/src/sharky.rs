//! Sharky: a slab allocator for chunk payloads.
//!
//! Payloads are written into fixed size slots spread over a number of
//! shards. Every write returns a [`Location`], which is all the indexes
//! keep. Each shard keeps a free list of released slots that is persisted
//! next to the shard file on a clean close.
//!
//! A `.DIRTY` marker is created on open and removed on close. Finding it
//! at open means the free lists on disk can not be trusted; they are then
//! rebuilt from the locations the indexes still reference, see
//! [`Sharky::recover`].

use std::{
    collections::BTreeSet,
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use bytes::Bytes;
use hive_base::chunk::SOC_MAX_CHUNK_SIZE;
use nested_enum_utils::common_fields;
use serde::{Deserialize, Serialize};
use snafu::{Backtrace, Snafu, ensure};
use tracing::{debug, info, warn};

/// Size of a slot, large enough for any chunk payload.
pub const SLOT_SIZE: usize = SOC_MAX_CHUNK_SIZE;

const DIRTY_MARKER: &str = ".DIRTY";

/// Where a payload is stored: 10 bytes, shard, slot and length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Location {
    /// Shard index.
    pub shard: u16,
    /// Slot within the shard.
    pub slot: u32,
    /// Payload length.
    pub length: u32,
}

impl Location {
    /// Serialized size.
    pub const SIZE: usize = 10;

    /// Serializes to big endian `shard || slot || length`.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[..2].copy_from_slice(&self.shard.to_be_bytes());
        out[2..6].copy_from_slice(&self.slot.to_be_bytes());
        out[6..].copy_from_slice(&self.length.to_be_bytes());
        out
    }

    /// Parses the 10 byte form.
    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        Self {
            shard: u16::from_be_bytes([bytes[0], bytes[1]]),
            slot: u32::from_be_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]),
            length: u32::from_be_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]),
        }
    }
}

/// Errors from the blob store.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum SharkyError {
    #[snafu(transparent)]
    Io { source: std::io::Error },
    #[snafu(transparent)]
    Encoding { source: postcard::Error },
    #[snafu(display("payload of {len} bytes exceeds slot size"))]
    TooLarge { len: usize },
    #[snafu(display("invalid location {location:?}"))]
    InvalidLocation { location: Location },
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct FreeSlots {
    /// One past the highest slot ever handed out.
    next: u32,
    free: BTreeSet<u32>,
}

impl FreeSlots {
    fn take(&mut self) -> u32 {
        match self.free.pop_first() {
            Some(slot) => slot,
            None => {
                self.next += 1;
                self.next - 1
            }
        }
    }
}

#[derive(Debug)]
enum Backend {
    File(File),
    Memory(Vec<u8>),
}

impl Backend {
    fn write_at(&mut self, offset: u64, data: &[u8]) -> std::io::Result<()> {
        match self {
            Backend::File(file) => {
                file.seek(SeekFrom::Start(offset))?;
                file.write_all(data)
            }
            Backend::Memory(buf) => {
                let start = offset as usize;
                let end = start + data.len();
                if buf.len() < end {
                    buf.resize(end, 0);
                }
                buf[start..end].copy_from_slice(data);
                Ok(())
            }
        }
    }

    fn read_at(&mut self, offset: u64, out: &mut [u8]) -> std::io::Result<()> {
        match self {
            Backend::File(file) => {
                file.seek(SeekFrom::Start(offset))?;
                file.read_exact(out)
            }
            Backend::Memory(buf) => {
                let start = offset as usize;
                let src = buf
                    .get(start..start + out.len())
                    .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::UnexpectedEof))?;
                out.copy_from_slice(src);
                Ok(())
            }
        }
    }
}

#[derive(Debug)]
struct Shard {
    backend: Mutex<Backend>,
    slots: Mutex<FreeSlots>,
}

/// The blob store.
#[derive(Debug)]
pub struct Sharky {
    dir: Option<PathBuf>,
    shards: Vec<Shard>,
    next_shard: AtomicUsize,
    recovering: bool,
}

fn shard_path(dir: &Path, i: usize) -> PathBuf {
    dir.join(format!("shard_{i:03}"))
}

fn free_path(dir: &Path, i: usize) -> PathBuf {
    dir.join(format!("free_{i:03}"))
}

impl Sharky {
    /// Opens or creates a store with `shards` shard files in `dir`.
    pub fn open(dir: impl AsRef<Path>, shards: u16) -> Result<Self, SharkyError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        let marker = dir.join(DIRTY_MARKER);
        let recovering = marker.exists();
        if recovering {
            warn!("sharky was not closed cleanly, free lists will be rebuilt");
        }
        let mut list = Vec::with_capacity(shards as usize);
        for i in 0..shards as usize {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(shard_path(&dir, i))?;
            let slots = match std::fs::read(free_path(&dir, i)) {
                Ok(bytes) if !recovering => postcard::from_bytes(&bytes)?,
                Ok(_) => FreeSlots::default(),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => FreeSlots::default(),
                Err(err) => return Err(err.into()),
            };
            list.push(Shard {
                backend: Mutex::new(Backend::File(file)),
                slots: Mutex::new(slots),
            });
        }
        File::create(&marker)?;
        info!(path = %dir.display(), shards, "opened sharky");
        Ok(Self {
            dir: Some(dir),
            shards: list,
            next_shard: AtomicUsize::new(0),
            recovering,
        })
    }

    /// Creates a store that lives in memory.
    pub fn memory(shards: u16) -> Self {
        let shards = (0..shards.max(1))
            .map(|_| Shard {
                backend: Mutex::new(Backend::Memory(Vec::new())),
                slots: Mutex::new(FreeSlots::default()),
            })
            .collect();
        Self {
            dir: None,
            shards,
            next_shard: AtomicUsize::new(0),
            recovering: false,
        }
    }

    /// Whether the store was not closed cleanly and needs [`Sharky::recover`].
    pub fn needs_recovery(&self) -> bool {
        self.recovering
    }

    /// Rebuilds the free lists so that exactly the slots in `used` are
    /// taken.
    pub fn recover(&mut self, used: impl IntoIterator<Item = Location>) {
        let mut taken: Vec<BTreeSet<u32>> = vec![BTreeSet::new(); self.shards.len()];
        for loc in used {
            if let Some(set) = taken.get_mut(loc.shard as usize) {
                set.insert(loc.slot);
            }
        }
        for (shard, taken) in self.shards.iter().zip(taken) {
            let next = taken.last().map(|s| s + 1).unwrap_or(0);
            let free = (0..next).filter(|s| !taken.contains(s)).collect();
            *shard.slots.lock().expect("poisoned") = FreeSlots { next, free };
        }
        self.recovering = false;
        info!("sharky free lists rebuilt");
    }

    /// Writes `data` into a free slot.
    pub fn write(&self, data: &[u8]) -> Result<Location, SharkyError> {
        ensure!(data.len() <= SLOT_SIZE, TooLargeSnafu { len: data.len() });
        let shard = self.next_shard.fetch_add(1, Ordering::Relaxed) % self.shards.len();
        let slot = self.shards[shard].slots.lock().expect("poisoned").take();
        let res = self.shards[shard]
            .backend
            .lock()
            .expect("poisoned")
            .write_at(slot as u64 * SLOT_SIZE as u64, data);
        if let Err(err) = res {
            self.shards[shard]
                .slots
                .lock()
                .expect("poisoned")
                .free
                .insert(slot);
            return Err(err.into());
        }
        Ok(Location {
            shard: shard as u16,
            slot,
            length: data.len() as u32,
        })
    }

    /// Reads the payload at `location`.
    pub fn read(&self, location: Location) -> Result<Bytes, SharkyError> {
        let shard = self
            .shards
            .get(location.shard as usize)
            .ok_or_else(|| InvalidLocationSnafu { location }.build())?;
        ensure!(
            location.length as usize <= SLOT_SIZE,
            InvalidLocationSnafu { location }
        );
        let mut buf = vec![0u8; location.length as usize];
        shard
            .backend
            .lock()
            .expect("poisoned")
            .read_at(location.slot as u64 * SLOT_SIZE as u64, &mut buf)?;
        Ok(Bytes::from(buf))
    }

    /// Returns the slot of `location` to the free list.
    pub fn release(&self, location: Location) {
        if let Some(shard) = self.shards.get(location.shard as usize) {
            shard
                .slots
                .lock()
                .expect("poisoned")
                .free
                .insert(location.slot);
        }
    }

    /// Number of slots in use across all shards.
    pub fn used_slots(&self) -> u64 {
        self.shards
            .iter()
            .map(|s| {
                let slots = s.slots.lock().expect("poisoned");
                u64::from(slots.next) - slots.free.len() as u64
            })
            .sum()
    }

    /// Persists the free lists and removes the dirty marker.
    pub fn close(&self) -> Result<(), SharkyError> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        for (i, shard) in self.shards.iter().enumerate() {
            let bytes = postcard::to_stdvec(&*shard.slots.lock().expect("poisoned"))?;
            std::fs::write(free_path(dir, i), bytes)?;
            if let Backend::File(file) = &*shard.backend.lock().expect("poisoned") {
                file.sync_all()?;
            }
        }
        std::fs::remove_file(dir.join(DIRTY_MARKER))?;
        debug!("sharky closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn location_bytes() {
        let loc = Location {
            shard: 3,
            slot: 0x0102_0304,
            length: 4104,
        };
        let bytes = loc.to_bytes();
        assert_eq!(bytes.len(), Location::SIZE);
        assert_eq!(Location::from_bytes(&bytes), loc);
    }

    #[test]
    fn memory_reuses_slots() {
        let sharky = Sharky::memory(2);
        let a = sharky.write(b"aaaa").unwrap();
        let b = sharky.write(b"bb").unwrap();
        assert_ne!(a.shard, b.shard);
        assert_eq!(&sharky.read(a).unwrap()[..], b"aaaa");
        assert_eq!(&sharky.read(b).unwrap()[..], b"bb");
        assert_eq!(sharky.used_slots(), 2);

        sharky.release(a);
        assert_eq!(sharky.used_slots(), 1);
        // the next write lands in shard 0 again and takes the released slot
        let c = sharky.write(b"cc").unwrap();
        assert_eq!((c.shard, c.slot), (a.shard, a.slot));
        assert_eq!(&sharky.read(c).unwrap()[..], b"cc");

        assert!(sharky.write(&vec![0u8; SLOT_SIZE + 1]).is_err());
    }

    #[test]
    fn persisted_free_lists() {
        let dir = tempfile::tempdir().unwrap();
        let (a, b) = {
            let sharky = Sharky::open(dir.path(), 1).unwrap();
            assert!(!sharky.needs_recovery());
            let a = sharky.write(b"first").unwrap();
            let b = sharky.write(b"second").unwrap();
            sharky.release(a);
            sharky.close().unwrap();
            (a, b)
        };
        let sharky = Sharky::open(dir.path(), 1).unwrap();
        assert!(!sharky.needs_recovery());
        assert_eq!(&sharky.read(b).unwrap()[..], b"second");
        let c = sharky.write(b"third").unwrap();
        assert_eq!(c.slot, a.slot);
    }

    #[test]
    fn dirty_recovery() {
        let dir = tempfile::tempdir().unwrap();
        let kept = {
            let sharky = Sharky::open(dir.path(), 1).unwrap();
            let _lost = sharky.write(b"lost").unwrap();
            let kept = sharky.write(b"kept").unwrap();
            let _tail = sharky.write(b"tail").unwrap();
            // dropped without close
            kept
        };
        let mut sharky = Sharky::open(dir.path(), 1).unwrap();
        assert!(sharky.needs_recovery());
        sharky.recover([kept]);
        assert!(!sharky.needs_recovery());
        assert_eq!(sharky.used_slots(), 1);
        assert_eq!(&sharky.read(kept).unwrap()[..], b"kept");
        assert_eq!(sharky.write(b"new").unwrap().slot, 0);
        assert_eq!(sharky.write(b"new").unwrap().slot, 2);
    }

    proptest! {
        #[test]
        fn live_payloads_survive_slot_reuse(ops in proptest::collection::vec((any::<bool>(), 1usize..64), 1..64)) {
            let sharky = Sharky::memory(3);
            let mut live: Vec<(Location, Vec<u8>)> = Vec::new();
            for (i, (release, len)) in ops.into_iter().enumerate() {
                if release && !live.is_empty() {
                    let (location, _) = live.swap_remove(len % live.len());
                    sharky.release(location);
                } else {
                    let data = vec![i as u8; len];
                    let location = sharky.write(&data).unwrap();
                    prop_assert!(live.iter().all(|(l, _)| (l.shard, l.slot) != (location.shard, location.slot)));
                    live.push((location, data));
                }
            }
            prop_assert_eq!(sharky.used_slots(), live.len() as u64);
            for (location, data) in live {
                prop_assert_eq!(&sharky.read(location).unwrap()[..], &data[..]);
            }
        }
    }
}
