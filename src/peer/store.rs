use parking_lot::Mutex;

use crate::error::Result;

/// Opaque blob storage for the peer registry.
pub trait InstanceStore: Send + Sync {
    /// The last saved blob, if any.
    fn load(&self) -> Result<Option<Vec<u8>>>;
    fn save(&self, blob: &[u8]) -> Result<()>;
}

/// In-memory [`InstanceStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    blob: Mutex<Option<Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl InstanceStore for MemoryStore {
    fn load(&self) -> Result<Option<Vec<u8>>> {
        Ok(self.blob.lock().clone())
    }

    fn save(&self, blob: &[u8]) -> Result<()> {
        *self.blob.lock() = Some(blob.to_vec());
        Ok(())
    }
}
