// Cost-bounded LRU cache backed by a slab of doubly-linked nodes.

use std::collections::HashMap;
use std::hash::Hash;

/// Byte size of a value, used as the unit of capacity accounting.
pub trait MemoryCost {
    fn memory_cost(&self) -> usize;
}

struct Node<K, V> {
    key: K,
    value: V,
    prev: Option<usize>,
    next: Option<usize>,
}

/// LRU cache bounded by the summed `memory_cost` of its values.
///
/// `head` is the most recently used node, `tail` the next eviction candidate.
/// Not synchronized; wrap it in a lock when shared.
pub struct LruCache<K, V> {
    capacity: usize,
    total_cost: usize,
    slots: Vec<Option<Node<K, V>>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    index: HashMap<K, usize>,
}

impl<K, V> LruCache<K, V>
where
    K: Eq + Hash + Clone,
    V: MemoryCost,
{
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            total_cost: 0,
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            index: HashMap::new(),
        }
    }

    /// Look up `key` and mark it most recently used.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        let idx = *self.index.get(key)?;
        self.move_to_front(idx);
        Some(&self.node(idx).value)
    }

    /// Look up `key` without touching recency.
    pub fn peek(&self, key: &K) -> Option<&V> {
        let idx = *self.index.get(key)?;
        Some(&self.node(idx).value)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.index.contains_key(key)
    }

    /// Insert, replace, or (with `None`) remove the entry for `key`.
    ///
    /// Inserting evicts from the least recently used end until the total cost
    /// fits the capacity again. A value larger than the whole capacity is
    /// evicted immediately.
    pub fn put(&mut self, key: K, value: Option<V>) {
        let Some(value) = value else {
            self.remove(&key);
            return;
        };

        let cost = value.memory_cost();
        if let Some(&idx) = self.index.get(&key) {
            let node = self.node_mut(idx);
            let old_cost = node.value.memory_cost();
            node.value = value;
            self.total_cost = self.total_cost - old_cost + cost;
            self.move_to_front(idx);
        } else {
            let idx = self.alloc(Node {
                key: key.clone(),
                value,
                prev: None,
                next: None,
            });
            self.push_front(idx);
            self.index.insert(key, idx);
            self.total_cost += cost;
        }

        while self.total_cost > self.capacity {
            if self.pop_back().is_none() {
                break;
            }
        }
    }

    /// Remove and return the entry for `key`.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let idx = self.index.remove(key)?;
        self.unlink(idx);
        let node = self.release(idx);
        self.total_cost -= node.value.memory_cost();
        Some(node.value)
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.free.clear();
        self.index.clear();
        self.head = None;
        self.tail = None;
        self.total_cost = 0;
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn total_cost(&self) -> usize {
        self.total_cost
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Keys ordered from most to least recently used.
    pub fn keys(&self) -> Keys<'_, K, V> {
        Keys {
            cache: self,
            current: self.head,
        }
    }

    fn pop_back(&mut self) -> Option<(K, V)> {
        let idx = self.tail?;
        self.unlink(idx);
        let node = self.release(idx);
        self.index.remove(&node.key);
        self.total_cost -= node.value.memory_cost();
        Some((node.key, node.value))
    }

    fn move_to_front(&mut self, idx: usize) {
        if self.head == Some(idx) {
            return;
        }
        self.unlink(idx);
        self.push_front(idx);
    }

    fn push_front(&mut self, idx: usize) {
        let old_head = self.head;
        {
            let node = self.node_mut(idx);
            node.prev = None;
            node.next = old_head;
        }
        match old_head {
            Some(h) => self.node_mut(h).prev = Some(idx),
            None => self.tail = Some(idx),
        }
        self.head = Some(idx);
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = {
            let node = self.node(idx);
            (node.prev, node.next)
        };
        match prev {
            Some(p) => self.node_mut(p).next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.node_mut(n).prev = prev,
            None => self.tail = prev,
        }
        let node = self.node_mut(idx);
        node.prev = None;
        node.next = None;
    }

    fn alloc(&mut self, node: Node<K, V>) -> usize {
        if let Some(idx) = self.free.pop() {
            self.slots[idx] = Some(node);
            idx
        } else {
            self.slots.push(Some(node));
            self.slots.len() - 1
        }
    }

    fn release(&mut self, idx: usize) -> Node<K, V> {
        let node = self.slots[idx].take().expect("lru slot released twice");
        self.free.push(idx);
        node
    }

    #[inline]
    fn node(&self, idx: usize) -> &Node<K, V> {
        self.slots[idx].as_ref().expect("dangling lru index")
    }

    #[inline]
    fn node_mut(&mut self, idx: usize) -> &mut Node<K, V> {
        self.slots[idx].as_mut().expect("dangling lru index")
    }
}

pub struct Keys<'a, K, V> {
    cache: &'a LruCache<K, V>,
    current: Option<usize>,
}

impl<'a, K, V> Iterator for Keys<'a, K, V> {
    type Item = &'a K;

    fn next(&mut self) -> Option<Self::Item> {
        let idx = self.current?;
        let node = self.cache.slots[idx].as_ref()?;
        self.current = node.next;
        Some(&node.key)
    }
}
