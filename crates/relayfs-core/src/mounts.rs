// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Mount table: which filesystems this session serves and which of them
//! are waiting for a remount after a daemon restart.

use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Clone, Debug)]
struct MountState {
    config: String,
    pending_remount: bool,
}

/// Per-session registry of mounted filesystems.
#[derive(Debug, Default)]
pub struct MountTable {
    inner: Mutex<HashMap<i32, MountState>>,
}

impl MountTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a mounted filesystem. `config` is replayed on remount.
    pub fn register(&self, fs_id: i32, config: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.insert(fs_id, MountState { config: config.to_string(), pending_remount: false });
    }

    pub fn unregister(&self, fs_id: i32) -> bool {
        self.inner.lock().unwrap().remove(&fs_id).is_some()
    }

    pub fn is_mounted(&self, fs_id: i32) -> bool {
        self.inner.lock().unwrap().contains_key(&fs_id)
    }

    /// True while `fs_id` is queued behind a remount. Unknown filesystems
    /// (including the -1 pseudo id of an initial mount) are never pending.
    pub fn is_pending(&self, fs_id: i32) -> bool {
        self.inner.lock().unwrap().get(&fs_id).is_some_and(|m| m.pending_remount)
    }

    /// Session-loss step 1: every mount queues behind a remount from now on.
    pub fn mark_all_pending(&self) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let mut marked = 0;
        for state in inner.values_mut() {
            if !state.pending_remount {
                state.pending_remount = true;
                marked += 1;
            }
        }
        marked
    }

    /// Remount serviced; the filesystem dispatches normally again.
    pub fn complete_remount(&self, fs_id: i32) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.get_mut(&fs_id) {
            Some(state) if state.pending_remount => {
                state.pending_remount = false;
                true
            }
            _ => false,
        }
    }

    /// Pending filesystems with their stored mount configs.
    pub fn pending_remounts(&self) -> Vec<(i32, String)> {
        let inner = self.inner.lock().unwrap();
        inner
            .iter()
            .filter(|(_, m)| m.pending_remount)
            .map(|(id, m)| (*id, m.config.clone()))
            .collect()
    }

    pub fn mounted_count(&self) -> usize {
        self.inner.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_pending_lifecycle() {
        let mounts = MountTable::new();
        mounts.register(1, "server=alpha");
        mounts.register(2, "server=beta");
        assert!(!mounts.is_pending(1));

        assert_eq!(mounts.mark_all_pending(), 2);
        assert!(mounts.is_pending(1));
        assert!(mounts.is_pending(2));

        assert!(mounts.complete_remount(1));
        assert!(!mounts.is_pending(1));
        assert!(mounts.is_pending(2));
        // Completing twice is a no-op.
        assert!(!mounts.complete_remount(1));
    }

    #[test]
    fn test_unknown_fs_never_pending() {
        let mounts = MountTable::new();
        assert!(!mounts.is_pending(-1));
        assert!(!mounts.is_pending(99));
    }

    #[test]
    fn test_pending_remounts_carry_config() {
        let mounts = MountTable::new();
        mounts.register(7, "server=gamma");
        mounts.mark_all_pending();
        let pending = mounts.pending_remounts();
        assert_eq!(pending, vec![(7, "server=gamma".to_string())]);
    }
}
