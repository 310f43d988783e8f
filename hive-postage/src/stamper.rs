//! Stamps chunks from an issuer.

use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use hive_base::{Address, Signer, Stamp, stamp::digest};
use snafu::ResultExt;
use tracing::trace;

use crate::{
    error::{PostageError, SignSnafu},
    issuer::StampIssuer,
};

/// Signs stamps for chunks, drawing indexes from a [`StampIssuer`].
#[derive(Debug, Clone)]
pub struct Stamper {
    issuer: Arc<StampIssuer>,
    signer: Arc<Signer>,
}

impl Stamper {
    /// Creates a stamper signing with the batch owner's key.
    pub fn new(issuer: Arc<StampIssuer>, signer: Arc<Signer>) -> Self {
        Self { issuer, signer }
    }

    /// The issuer indexes are drawn from.
    pub fn issuer(&self) -> &Arc<StampIssuer> {
        &self.issuer
    }

    /// Issues a stamp for `address`, timestamped with the current time.
    pub fn stamp(&self, address: &Address) -> Result<Stamp, PostageError> {
        let index = self.issuer.inc(address)?;
        let timestamp = now_nanos().to_be_bytes();
        let batch_id = self.issuer.batch_id();
        let digest = digest(address, &batch_id, &index, &timestamp);
        let signature = self.signer.sign(&digest).context(SignSnafu)?;
        trace!(chunk = %address.fmt_short(), batch = %batch_id, "stamped");
        Ok(Stamp::new(batch_id, index, timestamp, signature))
    }
}

fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use hive_base::{BatchId, stamp::BatchInfo};
    use rand::SeedableRng;

    use super::*;

    #[test]
    fn stamps_validate() {
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(1);
        let signer = Arc::new(Signer::generate(&mut rng));
        let issuer = Arc::new(StampIssuer::new(
            "test",
            "key",
            BatchId::new([9; 32]),
            100,
            12,
            8,
            0,
            true,
        ));
        let stamper = Stamper::new(issuer.clone(), signer.clone());
        let info = BatchInfo {
            owner: signer.eth_address(),
            depth: 12,
            bucket_depth: 8,
            immutable: true,
        };
        let mut bytes = [0x5a; 32];
        let mut previous = 0;
        for n in 0..16u8 {
            bytes[31] = n;
            let address = Address::new(bytes);
            let stamp = stamper.stamp(&address).unwrap();
            stamp.valid(&address, &info).unwrap();
            assert!(stamp.timestamp() >= previous);
            previous = stamp.timestamp();

            let mut flipped = bytes;
            flipped[0] ^= 0xff;
            assert!(stamp.valid(&Address::new(flipped), &info).is_err());
        }
        bytes[31] = 16;
        assert!(matches!(
            stamper.stamp(&Address::new(bytes)),
            Err(PostageError::BucketFull { .. })
        ));
    }
}
