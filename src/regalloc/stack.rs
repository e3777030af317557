//! Stack-slot allocator with slot reuse. Slots are 8 bytes; a request is
//! rounded up to whole slots and satisfied from the first free run, so a
//! freed slot is reused by the next request that fits.

use crate::common::fx_hash::FxHashMap;

#[derive(Debug, Default)]
pub struct StackAllocator {
    slots: Vec<bool>,
    occupancy: FxHashMap<i32, (i32, i32)>,
}

impl StackAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn num_slots(&self) -> i32 {
        self.slots.len() as i32
    }

    /// Allocate `size` bytes for `name`, returning the first slot index.
    pub fn allocate_slot(&mut self, name: i32, size: i32) -> i32 {
        if let Some(&(slot, _)) = self.occupancy.get(&name) {
            return slot;
        }
        let count = ((size.max(1) + 7) / 8) as usize;

        let mut start = None;
        let mut run = 0usize;
        for (i, &occupied) in self.slots.iter().enumerate() {
            if occupied {
                run = 0;
            } else {
                run += 1;
                if run == count {
                    start = Some(i + 1 - count);
                    break;
                }
            }
        }
        let slot = match start {
            Some(slot) => slot,
            None => {
                let slot = self.slots.len();
                self.slots.resize(slot + count, false);
                slot
            }
        };
        for i in slot..slot + count {
            self.slots[i] = true;
        }
        self.occupancy.insert(name, (slot as i32, count as i32));
        slot as i32
    }

    pub fn free_slot(&mut self, name: i32) {
        if let Some((slot, count)) = self.occupancy.remove(&name) {
            for i in slot..slot + count {
                self.slots[i as usize] = false;
            }
        }
    }

    /// The slot assigned to `name`, or -1.
    pub fn find_slot(&self, name: i32) -> i32 {
        self.occupancy.get(&name).map(|&(slot, _)| slot).unwrap_or(-1)
    }
}
