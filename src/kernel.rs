use crate::value::LocalValue;
use indexmap::IndexMap;
use std::collections::{HashMap, VecDeque};

/// Authoritative in-memory state of a single flat key-space, together with the pending-operation
/// bookkeeping that reconciles optimistic local mutations against the sequenced delta stream.
///
/// The kernel is a pure state machine: it decides and mutates, while the owning facade submits
/// operations and emits events. The same kernel backs a flat map and each node of a directory
/// tree.
///
/// Convergence is last-writer-wins, where "last" is the position on the ordering service, except
/// that local unacknowledged writes shadow remote writes until their echoes arrive.
#[derive(Default)]
pub(crate) struct MapKernel {
    /// Key storage. Iteration follows insertion order; that order is a single-replica
    /// convenience, not a replicated property.
    storage: IndexMap<String, LocalValue>,

    /// Keys with locally-issued `set`/`delete` operations whose echoes have not arrived yet,
    /// mapped to the latest assigned client sequence number.
    pending_keys: HashMap<String, i64>,

    /// Client sequence numbers of locally-issued `clear`s whose echoes have not arrived yet,
    /// oldest first. While any is outstanding, every inbound key operation is masked.
    pending_clears: VecDeque<i64>,
}

/// What ingesting one sequenced operation did to kernel state.
#[derive(Debug, PartialEq)]
pub(crate) enum Applied {
    /// Absorbed without a state change: shadowed by a pending local op, our own echo, or
    /// otherwise not applicable.
    Skipped,

    /// A key changed; carries the displaced value for the `valueChanged` event.
    Key {
        key: String,
        previous: Option<LocalValue>,
    },

    /// Storage was wiped.
    Cleared,
}

impl MapKernel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&LocalValue> {
        self.storage.get(key)
    }

    pub fn has(&self, key: &str) -> bool {
        self.storage.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.storage.len()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.storage.keys()
    }

    pub fn entries(&self) -> impl Iterator<Item = (&String, &LocalValue)> {
        self.storage.iter()
    }

    /// Applies a local `set`, returning the displaced value.
    pub fn set_local(&mut self, key: String, value: LocalValue) -> Option<LocalValue> {
        self.storage.insert(key, value)
    }

    /// Applies a local `delete`, returning the displaced value. A later re-insert of the same
    /// key lands at the end of the iteration order.
    pub fn delete_local(&mut self, key: &str) -> Option<LocalValue> {
        self.storage.shift_remove(key)
    }

    /// Applies a local `clear`.
    pub fn clear_local(&mut self) {
        self.storage.clear();
    }

    /// Records the client sequence number assigned to a local `set`/`delete` for `key`.
    pub fn mark_pending_key(&mut self, key: &str, client_seq: i64) {
        self.pending_keys.insert(key.to_string(), client_seq);
    }

    /// Records the client sequence number assigned to a local `clear`.
    ///
    /// Every pending key predates the clear, and its echo will be masked for as long as the
    /// clear is outstanding, so the key markers are retired here.
    pub fn mark_pending_clear(&mut self, client_seq: i64) {
        self.pending_keys.clear();
        self.pending_clears.push_back(client_seq);
    }

    /// Drops all pending markers. Used when re-driving outstanding operations on reconnect;
    /// the resubmission path re-creates the markers with fresh client sequence numbers.
    pub fn reset_pending(&mut self) {
        self.pending_keys.clear();
        self.pending_clears.clear();
    }

    pub fn has_pending_clear(&self) -> bool {
        !self.pending_clears.is_empty()
    }

    #[cfg(test)]
    pub fn pending_key(&self, key: &str) -> Option<i64> {
        self.pending_keys.get(key).copied()
    }

    #[cfg(test)]
    pub fn pending_len(&self) -> usize {
        self.pending_keys.len() + self.pending_clears.len()
    }

    /// Decides whether a sequenced `set`/`delete` for `key` should mutate local state, retiring
    /// pending markers as our own echoes arrive.
    ///
    /// A remote operation is shadowed both while a local `clear` is in flight and while the key
    /// has a local operation in flight: the optimistic local value is newer, in total-order
    /// terms, than any remote operation that did not observe it.
    pub fn needs_process_key(&mut self, key: &str, local: bool, client_seq: i64) -> bool {
        if !self.pending_clears.is_empty() {
            // local key echoes land here too; their markers were retired when the clear was
            // issued, so there is nothing to erase
            return false;
        }
        if let Some(&pending) = self.pending_keys.get(key) {
            if local && pending == client_seq {
                self.pending_keys.remove(key);
            }
            return false;
        }
        !local
    }

    /// Ingests a sequenced `set` that passed [MapKernel::needs_process_key].
    pub fn process_set(&mut self, key: String, value: LocalValue) -> Applied {
        let previous = self.storage.insert(key.clone(), value);
        Applied::Key { key, previous }
    }

    /// Ingests a sequenced `delete` that passed [MapKernel::needs_process_key].
    pub fn process_delete(&mut self, key: &str) -> Applied {
        let previous = self.storage.shift_remove(key);
        Applied::Key {
            key: key.to_string(),
            previous,
        }
    }

    /// Ingests a sequenced `clear`.
    ///
    /// A local echo retires the oldest outstanding clear marker and is otherwise a no-op. A
    /// remote clear is masked while a local clear is outstanding; otherwise it wipes everything
    /// except keys with local operations in flight, which keep their optimistic values.
    pub fn process_clear(&mut self, local: bool, client_seq: i64) -> Applied {
        if local {
            if self.pending_clears.front() == Some(&client_seq) {
                self.pending_clears.pop_front();
            }
            return Applied::Skipped;
        }
        if !self.pending_clears.is_empty() {
            return Applied::Skipped;
        }
        if self.pending_keys.is_empty() {
            self.storage.clear();
        } else {
            let pending = &self.pending_keys;
            self.storage.retain(|key, _| pending.contains_key(key));
        }
        Applied::Cleared
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn plain(v: i64) -> LocalValue {
        LocalValue::Plain(json!(v))
    }

    #[test]
    fn iteration_follows_insertion_order() {
        let mut kernel = MapKernel::new();
        kernel.set_local("b".to_string(), plain(1));
        kernel.set_local("a".to_string(), plain(2));
        kernel.set_local("c".to_string(), plain(3));
        kernel.set_local("a".to_string(), plain(4));

        let keys: Vec<_> = kernel.keys().cloned().collect();
        assert_eq!(keys, ["b", "a", "c"]);

        kernel.delete_local("a");
        kernel.set_local("a".to_string(), plain(5));
        let keys: Vec<_> = kernel.keys().cloned().collect();
        assert_eq!(keys, ["b", "c", "a"]);
    }

    #[test]
    fn pending_key_shadows_remote_ops() {
        let mut kernel = MapKernel::new();
        kernel.set_local("k".to_string(), plain(1));
        kernel.mark_pending_key("k", 7);

        // remote op on the same key is masked and the marker survives
        assert!(!kernel.needs_process_key("k", false, 3));
        assert_eq!(kernel.pending_key("k"), Some(7));

        // our own echo retires the marker without applying
        assert!(!kernel.needs_process_key("k", true, 7));
        assert_eq!(kernel.pending_key("k"), None);

        // with the marker gone, remote ops resume applying
        assert!(kernel.needs_process_key("k", false, 4));
    }

    #[test]
    fn older_echo_does_not_retire_newer_marker() {
        let mut kernel = MapKernel::new();
        kernel.mark_pending_key("k", 1);
        kernel.mark_pending_key("k", 2);

        assert!(!kernel.needs_process_key("k", true, 1));
        assert_eq!(kernel.pending_key("k"), Some(2));
        assert!(!kernel.needs_process_key("k", true, 2));
        assert_eq!(kernel.pending_key("k"), None);
    }

    #[test]
    fn local_clear_retires_pending_keys_and_masks_everything() {
        let mut kernel = MapKernel::new();
        kernel.set_local("a".to_string(), plain(1));
        kernel.mark_pending_key("a", 1);
        kernel.clear_local();
        kernel.mark_pending_clear(2);

        assert_eq!(kernel.pending_key("a"), None);
        assert!(!kernel.needs_process_key("a", false, 5));
        assert!(!kernel.needs_process_key("a", true, 1));
        assert_eq!(kernel.process_clear(false, 9), Applied::Skipped);

        // the clear echo lifts the mask
        assert_eq!(kernel.process_clear(true, 2), Applied::Skipped);
        assert!(!kernel.has_pending_clear());
        assert!(kernel.needs_process_key("a", false, 6));
    }

    #[test]
    fn concurrent_local_clears_retire_in_order() {
        let mut kernel = MapKernel::new();
        kernel.clear_local();
        kernel.mark_pending_clear(4);
        kernel.clear_local();
        kernel.mark_pending_clear(6);

        assert_eq!(kernel.process_clear(true, 4), Applied::Skipped);
        assert!(kernel.has_pending_clear());
        assert_eq!(kernel.process_clear(true, 6), Applied::Skipped);
        assert!(!kernel.has_pending_clear());
    }

    #[test]
    fn remote_clear_preserves_locally_pending_keys() {
        let mut kernel = MapKernel::new();
        kernel.set_local("settled".to_string(), plain(1));
        kernel.set_local("mine".to_string(), plain(2));
        kernel.mark_pending_key("mine", 3);

        assert_eq!(kernel.process_clear(false, 1), Applied::Cleared);
        assert!(!kernel.has("settled"));
        assert_eq!(kernel.get("mine"), Some(&plain(2)));
    }
}
