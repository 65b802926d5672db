//! Fixed-capacity node arena with generation-checked handles
//!
//! Slots are allocated up front. A handle names a slot plus the generation it
//! was issued for, so a handle kept past `free` is detected instead of
//! silently aliasing whatever reuses the slot.

use serde::{Deserialize, Serialize};

use crate::error::{IspError, Result};
use crate::node::ResourceNode;

/// Default capacity of a per-context node pool
pub const RES_POOL_MAX: usize = 64;
/// Default capacity of a stream-group node pool
pub const STREAM_GRP_RES_POOL_MAX: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeHandle {
    pub index: u32,
    pub generation: u32,
}

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Bounded arena with an index free-list
#[derive(Debug)]
pub struct Pool<T> {
    name: &'static str,
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
}

pub type NodePool = Pool<ResourceNode>;

impl<T> Pool<T> {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        let slots = (0..capacity)
            .map(|_| Slot {
                generation: 0,
                value: None,
            })
            .collect();
        // Pop order hands out low indices first
        let free = (0..capacity as u32).rev().collect();
        Self { name, slots, free }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn in_use(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.free.len() == self.slots.len()
    }

    pub fn alloc(&mut self, value: T) -> Result<NodeHandle> {
        let index = self.free.pop().ok_or(IspError::PoolExhausted {
            pool: self.name,
            capacity: self.slots.len(),
        })?;
        let slot = &mut self.slots[index as usize];
        slot.value = Some(value);
        Ok(NodeHandle {
            index,
            generation: slot.generation,
        })
    }

    /// Return a slot to the free-list and hand back its value
    pub fn free(&mut self, handle: NodeHandle) -> Result<T> {
        let slot = self.slot_mut(handle)?;
        let value = slot.value.take().ok_or(IspError::StaleHandle {
            index: handle.index as usize,
            generation: handle.generation,
        })?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        Ok(value)
    }

    pub fn get(&self, handle: NodeHandle) -> Result<&T> {
        self.slots
            .get(handle.index as usize)
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.value.as_ref())
            .ok_or(IspError::StaleHandle {
                index: handle.index as usize,
                generation: handle.generation,
            })
    }

    pub fn get_mut(&mut self, handle: NodeHandle) -> Result<&mut T> {
        self.slot_mut(handle)?
            .value
            .as_mut()
            .ok_or(IspError::StaleHandle {
                index: handle.index as usize,
                generation: handle.generation,
            })
    }

    /// Live entries with their handles
    pub fn iter(&self) -> impl Iterator<Item = (NodeHandle, &T)> + '_ {
        self.slots.iter().enumerate().filter_map(|(i, s)| {
            s.value.as_ref().map(|v| {
                (
                    NodeHandle {
                        index: i as u32,
                        generation: s.generation,
                    },
                    v,
                )
            })
        })
    }

    fn slot_mut(&mut self, handle: NodeHandle) -> Result<&mut Slot<T>> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|s| s.generation == handle.generation)
            .ok_or(IspError::StaleHandle {
                index: handle.index as usize,
                generation: handle.generation,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_until_exhausted() {
        let mut pool: Pool<u32> = Pool::new("test", 2);
        let a = pool.alloc(1).unwrap();
        let b = pool.alloc(2).unwrap();
        assert_eq!(a.index, 0);
        assert_eq!(b.index, 1);
        assert!(matches!(
            pool.alloc(3),
            Err(IspError::PoolExhausted { capacity: 2, .. })
        ));
        assert_eq!(pool.in_use(), 2);
    }

    #[test]
    fn test_stale_handle_after_free() {
        let mut pool: Pool<&str> = Pool::new("test", 1);
        let h = pool.alloc("first").unwrap();
        assert_eq!(pool.free(h).unwrap(), "first");

        let h2 = pool.alloc("second").unwrap();
        assert_eq!(h2.index, h.index);
        assert_ne!(h2.generation, h.generation);

        assert!(matches!(pool.get(h), Err(IspError::StaleHandle { .. })));
        assert!(pool.free(h).is_err());
        assert_eq!(*pool.get(h2).unwrap(), "second");
    }

    #[test]
    fn test_iter_skips_free_slots() {
        let mut pool: Pool<u8> = Pool::new("test", 4);
        let a = pool.alloc(10).unwrap();
        pool.alloc(20).unwrap();
        pool.free(a).unwrap();
        let live: Vec<u8> = pool.iter().map(|(_, v)| *v).collect();
        assert_eq!(live, vec![20]);
        assert!(!pool.is_empty());
    }
}
