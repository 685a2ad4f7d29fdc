//! Bounded lookup cache for store read-backs.

use std::collections::{HashMap, VecDeque};

/// Maps names to previously read store values, evicting the least recently
/// used entry once full. Purely a read shortcut: a miss always falls back to
/// the store, and callers must only insert values the store has committed.
pub struct LookupCache<V> {
    map: HashMap<String, V>,
    order: VecDeque<String>,
    capacity: usize,
}

impl<V: Clone> LookupCache<V> {
    pub fn new(capacity: usize) -> Self {
        Self { map: HashMap::new(), order: VecDeque::new(), capacity: capacity.max(1) }
    }

    pub fn get(&mut self, name: &str) -> Option<V> {
        let value = self.map.get(name).cloned();
        if value.is_some() {
            if let Some(pos) = self.order.iter().position(|n| n == name) {
                let name = self.order.remove(pos).unwrap_or_default();
                self.order.push_back(name);
            }
        }
        value
    }

    pub fn insert(&mut self, name: String, value: V) {
        if self.map.insert(name.clone(), value).is_none() {
            self.order.push_back(name);
            if self.order.len() > self.capacity {
                if let Some(evicted) = self.order.pop_front() {
                    self.map.remove(&evicted);
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_least_recently_used_at_capacity() {
        let mut cache = LookupCache::new(2);
        cache.insert("alice".into(), 1);
        cache.insert("bob".into(), 2);
        // Touch alice so bob becomes the eviction candidate.
        assert_eq!(cache.get("alice"), Some(1));
        cache.insert("carol".into(), 3);

        assert_eq!(cache.get("bob"), None);
        assert_eq!(cache.get("alice"), Some(1));
        assert_eq!(cache.get("carol"), Some(3));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn reinsert_does_not_grow_the_window() {
        let mut cache = LookupCache::new(2);
        cache.insert("alice".into(), 1);
        cache.insert("alice".into(), 10);
        cache.insert("bob".into(), 2);

        assert_eq!(cache.get("alice"), Some(10));
        assert_eq!(cache.len(), 2);
    }
}
