//! The receive arena: a bump allocator that never gives memory back.
//!
//! Every buffer handed out is carved from one region allocated when the session context is
//! created. Repeated commands within one session keep consuming it.

use bytes::BytesMut;

use crate::error::{Error, Result};

#[derive(Debug)]
pub struct Arena {
    region: BytesMut,
    capacity: usize,
    used: usize,
}

impl Arena {
    pub fn new(capacity: usize) -> Self {
        Self {
            region: BytesMut::with_capacity(capacity),
            capacity,
            used: 0,
        }
    }

    /// Carve a zero-filled buffer of exactly `len` bytes out of the arena
    pub fn alloc(&mut self, len: usize) -> Result<BytesMut> {
        let available = self.available();
        if len > available {
            return Err(Error::ArenaExhausted {
                requested: len,
                available,
            });
        }

        self.region.resize(len, 0);
        self.used += len;
        Ok(self.region.split_to(len))
    }

    /// Like `alloc`, but the buffer is pre-filled with the erased pattern
    pub fn alloc_erased(&mut self, len: usize) -> Result<BytesMut> {
        let mut buf = self.alloc(len)?;
        buf.fill(0xFF);
        Ok(buf)
    }

    /// Bytes still available
    pub fn available(&self) -> usize {
        self.capacity - self.used
    }

    /// Bytes handed out so far
    pub fn used(&self) -> usize {
        self.used
    }
}

#[test]
fn test_arena_accumulates() -> anyhow::Result<()> {
    let mut arena = Arena::new(100);
    let a = arena.alloc(40)?;
    assert_eq!(a.len(), 40);
    drop(a);

    // Dropping a buffer does not return it
    let b = arena.alloc_erased(40)?;
    assert!(b.iter().all(|&x| x == 0xFF));
    assert_eq!(arena.used(), 80);

    assert!(matches!(
        arena.alloc(21),
        Err(Error::ArenaExhausted {
            requested: 21,
            available: 20
        })
    ));
    assert_eq!(arena.alloc(20)?.len(), 20);
    assert_eq!(arena.available(), 0);
    Ok(())
}
