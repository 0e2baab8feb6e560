//! Per-key version chains.
//!
//! Every key maps to an immutable singly linked list of `(generation, value)`
//! links, newest first. A commit prepends one link per changed key, so every
//! older generation stays readable without copying the map. `None` values are
//! tombstones: the key reads as absent from that generation on.

use std::hash::Hash;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use super::generation::GenId;

pub(crate) struct Link<V: ?Sized> {
    generation: GenId,
    value: Option<Arc<V>>,
    next: Option<Arc<Link<V>>>,
}

impl<V: ?Sized> Link<V> {
    fn value_at(self: &Arc<Self>, generation: GenId) -> Option<Arc<V>> {
        let mut cursor = Some(self);
        while let Some(link) = cursor {
            if link.generation <= generation {
                return link.value.clone();
            }
            cursor = link.next.as_ref();
        }
        None
    }
}

pub(crate) struct VersionedMap<K, V: ?Sized> {
    chains: DashMap<K, Arc<Link<V>>>,
}

impl<K, V> VersionedMap<K, V>
where
    K: Eq + Hash + Clone,
    V: ?Sized,
{
    pub(crate) fn new() -> Self {
        Self {
            chains: DashMap::new(),
        }
    }

    /// Value of `key` as of `generation`.
    pub(crate) fn get(&self, generation: GenId, key: &K) -> Option<Arc<V>> {
        let head = self.chains.get(key).map(|entry| Arc::clone(entry.value()))?;
        head.value_at(generation)
    }

    /// Prepends a link for `key` at `generation`.
    ///
    /// Writing the same key twice at one generation replaces the first link.
    /// A tombstone for a key that has never held a value is dropped.
    pub(crate) fn set(&self, generation: GenId, key: K, value: Option<Arc<V>>) {
        match self.chains.entry(key) {
            Entry::Occupied(mut occupied) => {
                let current = Arc::clone(occupied.get());
                let next = if current.generation == generation {
                    current.next.clone()
                } else {
                    Some(current)
                };
                occupied.insert(Arc::new(Link {
                    generation,
                    value,
                    next,
                }));
            }
            Entry::Vacant(vacant) => {
                if value.is_some() {
                    vacant.insert(Arc::new(Link {
                        generation,
                        value,
                        next: None,
                    }));
                }
            }
        }
    }

    /// Drops every link no live generation can observe.
    ///
    /// Links newer than `floor` are kept along with the newest link at or
    /// below it. That last link is dropped too when it is a tombstone, and a
    /// key whose chain ends up empty is removed. Returns the number of links
    /// released.
    pub(crate) fn trim(&self, key: &K, floor: GenId) -> usize {
        let Some(head) = self.chains.get(key).map(|entry| Arc::clone(entry.value())) else {
            return 0;
        };

        let mut newer = Vec::new();
        let mut cursor = Some(&head);
        let mut floor_link = None;
        while let Some(link) = cursor {
            if link.generation > floor {
                newer.push(link);
                cursor = link.next.as_ref();
            } else {
                floor_link = Some(link);
                break;
            }
        }

        let Some(floor_link) = floor_link else {
            return 0;
        };
        let released_below = chain_len(floor_link.next.as_ref());
        let keep_floor = floor_link.value.is_some();
        if released_below == 0 && keep_floor {
            return 0;
        }

        let mut rebuilt = keep_floor.then(|| {
            Arc::new(Link {
                generation: floor_link.generation,
                value: floor_link.value.clone(),
                next: None,
            })
        });
        for link in newer.iter().rev() {
            rebuilt = Some(Arc::new(Link {
                generation: link.generation,
                value: link.value.clone(),
                next: rebuilt,
            }));
        }

        let released = released_below + usize::from(!keep_floor);
        match rebuilt {
            Some(chain) => {
                self.chains.insert(key.clone(), chain);
            }
            None => {
                self.chains.remove(key);
            }
        }
        released
    }

    pub(crate) fn count_at(&self, generation: GenId) -> usize {
        self.chains
            .iter()
            .filter(|entry| entry.value().value_at(generation).is_some())
            .count()
    }

    /// Number of keys currently holding a chain, tombstones included.
    pub(crate) fn chain_count(&self) -> usize {
        self.chains.len()
    }

    #[cfg(test)]
    pub(crate) fn link_count(&self, key: &K) -> usize {
        let head = self.chains.get(key).map(|entry| Arc::clone(entry.value()));
        chain_len(head.as_ref())
    }
}

fn chain_len<V: ?Sized>(mut cursor: Option<&Arc<Link<V>>>) -> usize {
    let mut len = 0;
    while let Some(link) = cursor {
        len += 1;
        cursor = link.next.as_ref();
    }
    len
}
