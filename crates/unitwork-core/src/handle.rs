//! Generational arena and typed handles.
//!
//! Managed instances, collection wrappers and proxies live in arenas owned
//! by the persistence context. Callers hold small `Copy` handles instead of
//! references; identity of an object is equality of its handle. A handle
//! whose slot has been freed (or reused) no longer resolves.
//!
//! # Example
//!
//! ```ignore
//! let mut arena: Arena<InstanceId, String> = Arena::new();
//! let a = arena.insert("a".to_string());
//! assert_eq!(arena.get(a).map(String::as_str), Some("a"));
//! arena.remove(a);
//! assert!(arena.get(a).is_none());
//! ```

use std::fmt;
use std::marker::PhantomData;

use serde::{Deserialize, Serialize};

/// Raw (index, generation) pair behind every typed handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RawHandle {
    pub index: u32,
    pub generation: u32,
}

/// Conversion between a typed handle and its raw parts.
pub trait Handle: Copy + Eq + std::hash::Hash + fmt::Debug {
    fn from_raw(raw: RawHandle) -> Self;
    fn raw(self) -> RawHandle;
}

macro_rules! define_handle {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(RawHandle);

        impl Handle for $name {
            fn from_raw(raw: RawHandle) -> Self {
                Self(raw)
            }

            fn raw(self) -> RawHandle {
                self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}#{}v{}", $prefix, self.0.index, self.0.generation)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Debug::fmt(self, f)
            }
        }
    };
}

define_handle!(
    /// Handle to an entity instance.
    InstanceId,
    "instance"
);
define_handle!(
    /// Handle to a persistent collection wrapper.
    CollectionId,
    "collection"
);
define_handle!(
    /// Handle to a lazy entity proxy.
    ProxyId,
    "proxy"
);

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Slot storage addressed by generational handles.
pub struct Arena<K: Handle, T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
    _key: PhantomData<K>,
}

impl<K: Handle, T> Default for Arena<K, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Handle, T> Arena<K, T> {
    /// Create an empty arena.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
            _key: PhantomData,
        }
    }

    /// Store a value and return its handle.
    pub fn insert(&mut self, value: T) -> K {
        self.len += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.generation = slot.generation.wrapping_add(1);
            slot.value = Some(value);
            return K::from_raw(RawHandle {
                index,
                generation: slot.generation,
            });
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            value: Some(value),
        });
        K::from_raw(RawHandle {
            index,
            generation: 0,
        })
    }

    /// Store a value under a specific handle.
    ///
    /// Used when restoring persisted state. Returns the value back if the
    /// slot is already occupied. Call [`Arena::rebuild_free_list`] once all
    /// restored values are in place.
    pub fn insert_at(&mut self, key: K, value: T) -> Result<(), T> {
        let raw = key.raw();
        let index = raw.index as usize;
        while self.slots.len() <= index {
            self.slots.push(Slot {
                generation: 0,
                value: None,
            });
        }
        let slot = &mut self.slots[index];
        if slot.value.is_some() {
            return Err(value);
        }
        slot.generation = raw.generation;
        slot.value = Some(value);
        self.len += 1;
        Ok(())
    }

    /// Recompute the free list after [`Arena::insert_at`] calls.
    pub fn rebuild_free_list(&mut self) {
        self.free = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.value.is_none())
            .map(|(i, _)| i as u32)
            .rev()
            .collect();
    }

    fn slot(&self, key: K) -> Option<&Slot<T>> {
        let raw = key.raw();
        self.slots
            .get(raw.index as usize)
            .filter(|slot| slot.generation == raw.generation)
    }

    pub fn get(&self, key: K) -> Option<&T> {
        self.slot(key).and_then(|slot| slot.value.as_ref())
    }

    pub fn get_mut(&mut self, key: K) -> Option<&mut T> {
        let raw = key.raw();
        self.slots
            .get_mut(raw.index as usize)
            .filter(|slot| slot.generation == raw.generation)
            .and_then(|slot| slot.value.as_mut())
    }

    pub fn contains(&self, key: K) -> bool {
        self.get(key).is_some()
    }

    /// Free the slot behind `key`, returning its value.
    pub fn remove(&mut self, key: K) -> Option<T> {
        let raw = key.raw();
        let slot = self
            .slots
            .get_mut(raw.index as usize)
            .filter(|slot| slot.generation == raw.generation)?;
        let value = slot.value.take()?;
        self.free.push(raw.index);
        self.len -= 1;
        Some(value)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Iterate over live values in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (K, &T)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.value.as_ref().map(|value| {
                (
                    K::from_raw(RawHandle {
                        index: index as u32,
                        generation: slot.generation,
                    }),
                    value,
                )
            })
        })
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (K, &mut T)> {
        self.slots.iter_mut().enumerate().filter_map(|(index, slot)| {
            let generation = slot.generation;
            slot.value.as_mut().map(|value| {
                (
                    K::from_raw(RawHandle {
                        index: index as u32,
                        generation,
                    }),
                    value,
                )
            })
        })
    }
}

impl<K: Handle, T: fmt::Debug> fmt::Debug for Arena<K, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}
