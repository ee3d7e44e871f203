// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::channel::ChannelRef;

/// Affinity key to channel bindings.
///
/// One channel can serve many keys, but a key maps to exactly one channel.
/// Every operation runs under the registry's own lock (the bind lock); the
/// pool lock is never taken while it is held.
pub(crate) struct AffinityRegistry<C> {
    by_key: Mutex<HashMap<String, Arc<ChannelRef<C>>>>,
}

impl<C> Default for AffinityRegistry<C> {
    fn default() -> Self {
        AffinityRegistry {
            by_key: Mutex::new(HashMap::new()),
        }
    }
}

impl<C> AffinityRegistry<C> {
    /// The channel `key` is bound to, if any.
    pub(crate) fn lookup(&self, key: &str) -> Option<Arc<ChannelRef<C>>> {
        self.by_key.lock().get(key).cloned()
    }

    /// Binds `key` to `channel_ref`.
    ///
    /// The first binding wins: re-binding an existing key keeps the original
    /// channel and only increments its affinity count.
    pub(crate) fn bind(&self, channel_ref: &Arc<ChannelRef<C>>, key: &str) {
        if key.is_empty() {
            return;
        }
        let mut by_key = self.by_key.lock();
        let bound = by_key
            .entry(key.to_owned())
            .or_insert_with(|| Arc::clone(channel_ref));
        bound.incr_affinity();
        trace!(key, channel_id = bound.id(), "affinity key bound");
    }

    /// Releases one holder of `key`.
    ///
    /// When the bound channel's affinity count reaches zero, no logical
    /// holder remains and every key pointing at that channel is reclaimed.
    pub(crate) fn unbind(&self, key: &str) {
        if key.is_empty() {
            return;
        }
        let mut by_key = self.by_key.lock();
        let Some(bound) = by_key.get(key) else {
            return;
        };
        bound.decr_affinity();
        if bound.affinity_count() == 0 {
            let orphaned = Arc::clone(bound);
            by_key.retain(|_, channel_ref| !Arc::ptr_eq(channel_ref, &orphaned));
            trace!(
                channel_id = orphaned.id(),
                "removed all keys bound to channel"
            );
        }
    }

    /// Number of bound keys.
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.by_key.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rand::{Rng, SeedableRng};
    use tracing_test::traced_test;

    fn preset_refs(n: usize) -> Vec<Arc<ChannelRef<()>>> {
        (0..n).map(|id| Arc::new(ChannelRef::new((), id))).collect()
    }

    #[test]
    #[traced_test]
    fn test_first_binding_wins() {
        let registry = AffinityRegistry::default();
        let refs = preset_refs(2);

        registry.bind(&refs[0], "k");
        registry.bind(&refs[1], "k");

        // the second bind lands on the channel the key already maps to
        let bound = registry.lookup("k").unwrap();
        assert_eq!(bound.id(), 0);
        assert_eq!(refs[0].affinity_count(), 2);
        assert_eq!(refs[1].affinity_count(), 0);
    }

    #[test]
    #[traced_test]
    fn test_unbind_purges_channel_keys() {
        let registry = AffinityRegistry::default();
        let refs = preset_refs(2);

        registry.bind(&refs[0], "k1");
        registry.bind(&refs[0], "k2");
        registry.bind(&refs[1], "k3");
        assert_eq!(registry.len(), 3);

        // k1 had a single holder, so its channel drops to zero and both of
        // its keys disappear
        registry.unbind("k1");
        assert_eq!(registry.len(), 1);
        assert!(registry.lookup("k1").is_none());
        assert!(registry.lookup("k2").is_none());
        assert_eq!(refs[0].affinity_count(), 0);

        // repeated unbind of a purged key is idempotent
        registry.unbind("k1");
        registry.unbind("k2");
        assert_eq!(registry.len(), 1);
        assert_eq!(refs[0].affinity_count(), 0);

        registry.unbind("k3");
        assert_eq!(registry.len(), 0);
        assert_eq!(refs[1].affinity_count(), 0);
    }

    #[test]
    fn test_empty_key_ignored() {
        let registry = AffinityRegistry::default();
        let refs = preset_refs(1);

        registry.bind(&refs[0], "");
        assert_eq!(registry.len(), 0);
        assert_eq!(refs[0].affinity_count(), 0);

        registry.unbind("");
        assert_eq!(refs[0].affinity_count(), 0);
    }

    #[test]
    fn test_random_sequence_matches_model() {
        let registry = AffinityRegistry::default();
        let refs = preset_refs(4);
        let keys: Vec<String> = (0..16).map(|i| format!("key-{i}")).collect();

        // reference model: key -> channel index, plus per-channel counts
        let mut model_keys: HashMap<String, usize> = HashMap::new();
        let mut model_counts = [0usize; 4];

        // randomized bind/unbind sequence, seeded for reproducibility
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        for _ in 0..2000 {
            let key = &keys[rng.random_range(0..keys.len())];
            if rng.random_bool(0.5) {
                let idx = rng.random_range(0..refs.len());
                registry.bind(&refs[idx], key);
                let bound = *model_keys.entry(key.clone()).or_insert(idx);
                model_counts[bound] += 1;
            } else {
                registry.unbind(key);
                if let Some(&bound) = model_keys.get(key) {
                    model_counts[bound] = model_counts[bound].saturating_sub(1);
                    if model_counts[bound] == 0 {
                        model_keys.retain(|_, &mut c| c != bound);
                    }
                }
            }
        }

        assert_eq!(registry.len(), model_keys.len());
        for (key, &idx) in &model_keys {
            let bound = registry.lookup(key).unwrap();
            assert_eq!(bound.id(), idx);
        }
        for (idx, channel_ref) in refs.iter().enumerate() {
            assert_eq!(channel_ref.affinity_count(), model_counts[idx]);
        }
    }
}
