use std::collections::{BTreeSet, HashSet};

/// Per-session allocator for the 16-bit packet ids of broker-originated
/// QoS 1 and 2 PUBLISHes.
///
/// Ids start at 1 (0 is reserved on the wire), wrap from 65535 back to 1, and
/// are never handed out twice before being released by the terminal
/// acknowledgement. Released ids are preferred over advancing the cursor, so
/// a session cycling through a handful of inflight messages keeps reusing the
/// same small ids.
#[derive(Debug, Clone)]
pub struct PacketIdAllocator {
    cursor: u16,
    in_use: HashSet<u16>,
    released: BTreeSet<u16>,
}

impl Default for PacketIdAllocator {
    fn default() -> Self {
        PacketIdAllocator {
            cursor: 1,
            in_use: HashSet::new(),
            released: BTreeSet::new(),
        }
    }
}

impl PacketIdAllocator {
    pub fn new() -> PacketIdAllocator {
        PacketIdAllocator::default()
    }

    /// Take the lowest released id, or advance the cursor to the next id not
    /// currently in flight. Returns `None` only when all 65535 ids are taken.
    pub fn next_id(&mut self) -> Option<u16> {
        if let Some(&id) = self.released.iter().next() {
            self.released.remove(&id);
            self.in_use.insert(id);
            return Some(id);
        }

        if self.in_use.len() == u16::MAX as usize {
            return None;
        }

        loop {
            let candidate = self.cursor;
            self.cursor = if self.cursor == u16::MAX {
                1
            } else {
                self.cursor + 1
            };

            if self.in_use.insert(candidate) {
                return Some(candidate);
            }
        }
    }

    /// Return an id to the pool once its exchange completed.
    /// Releasing an id that was never allocated is ignored.
    pub fn release(&mut self, id: u16) {
        if self.in_use.remove(&id) {
            self.released.insert(id);
        }
    }

    pub fn outstanding(&self) -> usize {
        self.in_use.len()
    }
}
