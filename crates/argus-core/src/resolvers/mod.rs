//! Caches mapping kernel identifiers to resolved metadata needed to
//! interpret later events.

pub mod mount;

use self::mount::{MountResolver, MountinfoError};

/// All the resolution caches owned by the probe. Shared behind an `Arc`
/// between the dispatcher and non-callback contexts (snapshots, consumers).
#[derive(Default)]
pub struct Resolvers {
    mounts: MountResolver,
}

impl Resolvers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mounts(&self) -> &MountResolver {
        &self.mounts
    }

    /// Sync the caches with the current state of the system.
    pub fn snapshot(&self) -> Result<(), MountinfoError> {
        let seeded = self.mounts.sync_with_proc()?;
        log::debug!("mount cache seeded with {seeded} entries");
        Ok(())
    }
}
