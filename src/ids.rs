//! Sources of random 128-bit identifiers, used both for the `UUID` exposed to call templates and
//! for the correlation tokens that key in-flight call records.

use crate::errors::IdSourceError;
use parking_lot::Mutex;
use rand::{RngCore, SeedableRng, TryRngCore, rngs::OsRng, rngs::StdRng};
use uuid::Uuid;

/// Produces random 128-bit identifiers. Implementations must be safe to share between all
/// workers and transport callbacks.
pub trait IdSource: Send + Sync {
    /// Fill `buf` with fresh random bytes
    fn fill(&self, buf: &mut [u8; 16]) -> Result<(), IdSourceError>;

    /// Generate a fresh identifier
    fn next_id(&self) -> Result<Uuid, IdSourceError> {
        let mut buf = [0; 16];
        self.fill(&mut buf)?;
        Ok(Uuid::from_bytes(buf))
    }
}

/// Reads identifiers from the operating system's CSPRNG
#[derive(Debug, Default, Clone, Copy)]
pub struct OsIdSource;

impl IdSource for OsIdSource {
    fn fill(&self, buf: &mut [u8; 16]) -> Result<(), IdSourceError> {
        OsRng
            .try_fill_bytes(buf)
            .map_err(|e| IdSourceError(e.to_string()))
    }
}

/// Deterministic identifiers from a seeded generator. Useful in tests and for reproducible runs.
#[derive(Debug)]
pub struct SeededIdSource {
    rng: Mutex<StdRng>,
}

impl SeededIdSource {
    /// Create a source whose output sequence is fully determined by `seed`
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl IdSource for SeededIdSource {
    fn fill(&self, buf: &mut [u8; 16]) -> Result<(), IdSourceError> {
        self.rng.lock().fill_bytes(buf);
        Ok(())
    }
}
