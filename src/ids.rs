use uuid::Uuid;

use crate::Result;

/// Source of request and client identifiers. Ids must be globally unique and
/// sort roughly by creation time.
pub trait IdGenerator: Send + Sync {
    fn new_id(&self) -> Result<Uuid>;
}

/// Time-ordered UUIDv7 identifiers.
#[derive(Clone, Copy, Debug, Default)]
pub struct UuidV7;

impl IdGenerator for UuidV7 {
    fn new_id(&self) -> Result<Uuid> {
        Ok(Uuid::now_v7())
    }
}
