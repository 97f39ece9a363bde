// Copyright (C) 2023 gigablaster

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

use std::{
    collections::HashMap,
    fmt::Debug,
    hash::{BuildHasher, Hash},
};

use crate::BuildContentHasher;

const NIL: usize = usize::MAX;

#[derive(Debug)]
struct Node<K, V> {
    key: K,
    value: V,
    prev: usize,
    next: usize,
}

/// Fixed-capacity map that evicts least recently used entry on overflow.
///
/// Nodes live in a slab with a free list, recency is kept as an index linked list
/// (head is most recent). Slots freed by eviction or removal are reused.
pub struct LruCache<K, V, S = BuildContentHasher> {
    map: HashMap<K, usize, S>,
    nodes: Vec<Option<Node<K, V>>>,
    free: Vec<usize>,
    head: usize,
    tail: usize,
    capacity: usize,
}

impl<K: Hash + Eq + Clone, V> LruCache<K, V, BuildContentHasher> {
    pub fn new(capacity: usize) -> Self {
        Self::with_hasher(capacity, BuildContentHasher)
    }
}

impl<K: Hash + Eq + Clone, V, S: BuildHasher> LruCache<K, V, S> {
    pub fn with_hasher(capacity: usize, hasher: S) -> Self {
        assert!(capacity > 0, "LRU cache capacity must be positive");
        Self {
            map: HashMap::with_capacity_and_hasher(capacity, hasher),
            nodes: Vec::with_capacity(capacity),
            free: Vec::new(),
            head: NIL,
            tail: NIL,
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.map.contains_key(key)
    }

    /// Returns value and marks it as most recently used.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        let index = *self.map.get(key)?;
        self.touch(index);
        self.nodes[index].as_ref().map(|node| &node.value)
    }

    /// Returns value without touching recency order.
    pub fn peek(&self, key: &K) -> Option<&V> {
        let index = *self.map.get(key)?;
        self.nodes[index].as_ref().map(|node| &node.value)
    }

    /// Inserts value as most recently used.
    ///
    /// Returns entry pushed out of the cache: previous value under the same key, or
    /// least recently used entry if cache was full.
    pub fn insert(&mut self, key: K, value: V) -> Option<(K, V)> {
        if let Some(&index) = self.map.get(&key) {
            self.touch(index);
            let node = self.nodes[index].as_mut()?;
            let old = std::mem::replace(&mut node.value, value);
            return Some((key, old));
        }

        let evicted = if self.map.len() >= self.capacity {
            self.pop_lru()
        } else {
            None
        };

        let node = Node {
            key: key.clone(),
            value,
            prev: NIL,
            next: NIL,
        };
        let index = if let Some(index) = self.free.pop() {
            self.nodes[index] = Some(node);
            index
        } else {
            self.nodes.push(Some(node));
            self.nodes.len() - 1
        };
        self.push_front(index);
        self.map.insert(key, index);

        evicted
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let index = self.map.remove(key)?;
        self.take(index).map(|(_, value)| value)
    }

    /// Removes least recently used entry.
    pub fn pop_lru(&mut self) -> Option<(K, V)> {
        if self.tail == NIL {
            return None;
        }
        let index = self.tail;
        let (key, value) = self.take(index)?;
        self.map.remove(&key);

        Some((key, value))
    }

    /// Removes every entry, returning them from least to most recently used.
    pub fn drain(&mut self) -> Vec<(K, V)> {
        let mut result = Vec::with_capacity(self.len());
        while let Some(entry) = self.pop_lru() {
            result.push(entry);
        }
        self.nodes.clear();
        self.free.clear();

        result
    }

    pub fn clear(&mut self) {
        self.map.clear();
        self.nodes.clear();
        self.free.clear();
        self.head = NIL;
        self.tail = NIL;
    }

    /// Iterates from most to least recently used.
    pub fn iter(&self) -> Iter<'_, K, V> {
        Iter {
            nodes: &self.nodes,
            cursor: self.head,
        }
    }

    fn take(&mut self, index: usize) -> Option<(K, V)> {
        self.unlink(index);
        let node = self.nodes[index].take()?;
        self.free.push(index);

        Some((node.key, node.value))
    }

    fn touch(&mut self, index: usize) {
        if self.head != index {
            self.unlink(index);
            self.push_front(index);
        }
    }

    fn unlink(&mut self, index: usize) {
        let (prev, next) = match self.nodes[index].as_ref() {
            Some(node) => (node.prev, node.next),
            None => return,
        };
        if prev != NIL {
            if let Some(node) = self.nodes[prev].as_mut() {
                node.next = next;
            }
        } else {
            self.head = next;
        }
        if next != NIL {
            if let Some(node) = self.nodes[next].as_mut() {
                node.prev = prev;
            }
        } else {
            self.tail = prev;
        }
        if let Some(node) = self.nodes[index].as_mut() {
            node.prev = NIL;
            node.next = NIL;
        }
    }

    fn push_front(&mut self, index: usize) {
        let old_head = self.head;
        if let Some(node) = self.nodes[index].as_mut() {
            node.prev = NIL;
            node.next = old_head;
        }
        if old_head != NIL {
            if let Some(node) = self.nodes[old_head].as_mut() {
                node.prev = index;
            }
        } else {
            self.tail = index;
        }
        self.head = index;
    }
}

impl<K: Debug, V: Debug, S> Debug for LruCache<K, V, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LruCache")
            .field("capacity", &self.capacity)
            .field("len", &self.map.len())
            .finish()
    }
}

pub struct Iter<'a, K, V> {
    nodes: &'a [Option<Node<K, V>>],
    cursor: usize,
}

impl<'a, K, V> Iterator for Iter<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor == NIL {
            return None;
        }
        let node = self.nodes[self.cursor].as_ref()?;
        self.cursor = node.next;

        Some((&node.key, &node.value))
    }
}
