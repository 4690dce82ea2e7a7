use std::collections::{BTreeMap, HashMap};

/// One key's version history. Versions are appended, never removed, and
/// are assigned exclusively by the chain head. `dirty` is set while the
/// newest local version awaits the tail's commit acknowledgement.
#[derive(Debug, Default)]
pub struct Entry {
    versions: BTreeMap<u64, String>,
    max_v: u64,
    dirty: bool,
}

impl Entry {
    pub fn max_v(&self) -> u64 {
        self.max_v
    }

    pub fn dirty(&self) -> bool {
        self.dirty
    }

    pub fn value_at(&self, ver: u64) -> Option<&str> {
        self.versions.get(&ver).map(String::as_str)
    }

    /// The value at the newest locally-known version.
    pub fn latest(&self) -> Option<&str> {
        self.value_at(self.max_v)
    }

    fn install(&mut self, ver: u64, val: String, dirty: bool) {
        self.versions.insert(ver, val);
        self.max_v = ver;
        self.dirty = dirty;
    }
}

/// The versioned key→value map of a single replica.
#[derive(Debug, Default)]
pub struct Store {
    entries: HashMap<String, Entry>,
}

impl Store {
    pub fn get(&self, key: &str) -> Option<&Entry> {
        self.entries.get(key)
    }

    /// Head-side install: assigns the next version for `key` and returns
    /// it. The first version of a key is immediately clean; an update is
    /// dirty until the tail's ack flows back up the chain.
    pub fn apply_head_set(&mut self, key: &str, val: &str) -> u64 {
        match self.entries.get_mut(key) {
            None => {
                let mut entry = Entry::default();
                entry.install(1, val.to_string(), false);
                self.entries.insert(key.to_string(), entry);
                1
            }
            Some(entry) => {
                let ver = entry.max_v + 1;
                entry.install(ver, val.to_string(), true);
                ver
            }
        }
    }

    /// Mid-chain install of a head-assigned version: first sight of a key
    /// is clean, an update is dirty until acknowledged.
    pub fn apply_chain_set(&mut self, key: &str, val: &str, ver: u64) {
        match self.entries.get_mut(key) {
            None => {
                let mut entry = Entry::default();
                entry.install(ver, val.to_string(), false);
                self.entries.insert(key.to_string(), entry);
            }
            Some(entry) => entry.install(ver, val.to_string(), true),
        }
    }

    /// Tail install. The tail's newest version is committed by definition.
    pub fn apply_tail_set(&mut self, key: &str, val: &str, ver: u64) {
        self.entries
            .entry(key.to_string())
            .or_default()
            .install(ver, val.to_string(), false);
    }

    /// Clear the dirty bit iff the tail has confirmed the newest local
    /// version: an ack for an older version leaves the entry dirty.
    pub fn mark_clean_if(&mut self, key: &str, acked: u64) {
        if let Some(entry) = self.entries.get_mut(key) {
            if entry.max_v == acked {
                entry.dirty = false;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_head_assigns_increasing_versions() {
        let mut store = Store::default();
        assert_eq!(store.apply_head_set("k", "v1"), 1);
        assert_eq!(store.apply_head_set("k", "v2"), 2);
        assert_eq!(store.apply_head_set("other", "x"), 1);

        let entry = store.get("k").unwrap();
        assert_eq!(entry.max_v(), 2);
        assert_eq!(entry.value_at(1), Some("v1"));
        assert_eq!(entry.value_at(2), Some("v2"));
    }

    #[test]
    fn test_first_install_is_clean_update_is_dirty() {
        let mut store = Store::default();
        store.apply_head_set("k", "v1");
        assert!(!store.get("k").unwrap().dirty());

        store.apply_head_set("k", "v2");
        assert!(store.get("k").unwrap().dirty());

        let mut mid = Store::default();
        mid.apply_chain_set("k", "v1", 1);
        assert!(!mid.get("k").unwrap().dirty());
        mid.apply_chain_set("k", "v2", 2);
        assert!(mid.get("k").unwrap().dirty());
    }

    #[test]
    fn test_tail_installs_are_always_clean() {
        let mut store = Store::default();
        store.apply_tail_set("k", "v1", 1);
        store.apply_tail_set("k", "v2", 2);

        let entry = store.get("k").unwrap();
        assert!(!entry.dirty());
        assert_eq!(entry.max_v(), 2);
        // Older versions stay readable.
        assert_eq!(entry.value_at(1), Some("v1"));
    }

    #[test]
    fn test_mark_clean_only_at_newest_version() {
        let mut store = Store::default();
        store.apply_head_set("k", "v1");
        store.apply_head_set("k", "v2");
        store.apply_head_set("k", "v3");

        // Ack for a superseded version: still dirty.
        store.mark_clean_if("k", 2);
        assert!(store.get("k").unwrap().dirty());

        store.mark_clean_if("k", 3);
        assert!(!store.get("k").unwrap().dirty());
    }
}
