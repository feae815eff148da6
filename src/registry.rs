use std::collections::HashMap;

use nix::unistd::Pid;

use crate::sys::NsId;

/// The spawners currently under trace, each with the mount-namespace
/// fingerprint read when it was last seen. Written only by the monitor
/// thread; inspector workers take read locks for the fingerprint checks,
/// and a stale read there only produces a harmless "not separated yet".
#[derive(Default)]
pub(crate) struct SpawnerRegistry {
    spawners: HashMap<Pid, NsId>,
}

impl SpawnerRegistry {
    /// Insert or refresh a spawner's fingerprint. Returns true when the pid
    /// was new; refreshing never implies re-attaching.
    pub fn upsert(&mut self, pid: Pid, ns: NsId) -> bool {
        self.spawners.insert(pid, ns).is_none()
    }

    pub fn forget(&mut self, pid: Pid) -> bool {
        self.spawners.remove(&pid).is_some()
    }

    pub fn contains(&self, pid: Pid) -> bool {
        self.spawners.contains_key(&pid)
    }

    pub fn count(&self) -> usize {
        self.spawners.len()
    }

    /// Does any live spawner still share this mount namespace?
    pub fn any_shares_ns(&self, ns: NsId) -> bool {
        self.spawners.values().any(|known| *known == ns)
    }

    pub fn pids(&self) -> Vec<Pid> {
        self.spawners.keys().copied().collect()
    }

    pub fn clear(&mut self) {
        self.spawners.clear();
    }
}
