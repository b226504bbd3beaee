//! Register Cache
//!
//! Tracks which guest registers currently live in host registers during
//! block emission. The cache only does bookkeeping; the loads and stores it
//! decides on are emitted through a `RegSpiller`, so the same cache serves
//! integer and floating-point registers of any host.
//!
//! Invariant: at every point where guest state becomes observable (calls
//! into the runtime, exits, in-block join points) the cache has been
//! flushed. `is_clean` lets emitters assert it.

use super::JitError;

/// Host register number as understood by the spiller
pub type HostReg = u8;

/// Emits the moves between guest state and host registers
pub trait RegSpiller {
    fn load(&mut self, host: HostReg, guest: usize);
    fn store(&mut self, host: HostReg, guest: usize);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BindMode {
    /// The current guest value is needed
    Read,
    /// The guest value will be overwritten without being read
    Write,
    /// Read and then overwritten
    ReadWrite,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlushMode {
    /// Write back dirty values and drop every binding
    Full,
    /// Write back dirty values, keep bindings and dirty flags untouched.
    /// Used on a conditional path that leaves the block while the other
    /// path keeps using the cached values.
    MaintainState,
}

#[derive(Clone, Copy, Debug, Default)]
struct Slot {
    guest: Option<usize>,
    dirty: bool,
    locked: bool,
    last_use: u64,
}

#[derive(Clone, Debug)]
pub struct RegCache {
    pool: Vec<HostReg>,
    slots: Vec<Slot>,
    /// guest register -> index into `pool`
    bound: Vec<Option<usize>>,
    tick: u64,
}

impl RegCache {
    /// `pool`: host registers available for allocation, in preference order
    pub fn new(pool: &[HostReg], guest_regs: usize) -> Self {
        RegCache { pool: pool.to_vec(), slots: vec![Slot::default(); pool.len()], bound: vec![None; guest_regs], tick: 0 }
    }

    /// Host register holding `guest`, if cached
    pub fn host_of(&self, guest: usize) -> Option<HostReg> {
        self.bound[guest].map(|slot| self.pool[slot])
    }

    pub fn is_dirty(&self, guest: usize) -> bool {
        self.bound[guest].map(|slot| self.slots[slot].dirty).unwrap_or(false)
    }

    /// No guest register is cached
    pub fn is_clean(&self) -> bool {
        self.slots.iter().all(|s| s.guest.is_none())
    }

    /// Materialize `guest` in a host register and return it. `Write` and
    /// `ReadWrite` mark the binding dirty.
    pub fn bind(&mut self, guest: usize, mode: BindMode, sp: &mut dyn RegSpiller) -> Result<HostReg, JitError> {
        self.tick += 1;
        let slot = match self.bound[guest] {
            Some(slot) => slot,
            None => {
                let slot = self.allocate(sp)?;
                if mode != BindMode::Write {
                    sp.load(self.pool[slot], guest);
                }
                self.slots[slot].guest = Some(guest);
                self.slots[slot].dirty = false;
                self.bound[guest] = Some(slot);
                slot
            }
        };
        self.slots[slot].last_use = self.tick;
        if mode != BindMode::Read {
            self.slots[slot].dirty = true;
        }
        Ok(self.pool[slot])
    }

    /// Keep `guest` from being evicted until `unlock_all`
    pub fn lock(&mut self, guest: usize) {
        if let Some(slot) = self.bound[guest] {
            self.slots[slot].locked = true;
        }
    }

    pub fn unlock_all(&mut self) {
        for slot in self.slots.iter_mut() {
            slot.locked = false;
        }
    }

    pub fn mark_dirty(&mut self, guest: usize) {
        if let Some(slot) = self.bound[guest] {
            self.slots[slot].dirty = true;
        }
    }

    /// Write back `guest` if dirty and drop its binding
    pub fn flush_reg(&mut self, guest: usize, sp: &mut dyn RegSpiller) {
        if let Some(slot) = self.bound[guest] {
            self.release(slot, sp);
        }
    }

    /// Drop the binding of `guest` without writing it back
    pub fn discard(&mut self, guest: usize) {
        if let Some(slot) = self.bound[guest].take() {
            self.slots[slot] = Slot::default();
        }
    }

    pub fn flush(&mut self, mode: FlushMode, sp: &mut dyn RegSpiller) {
        for slot in 0..self.slots.len() {
            let Some(guest) = self.slots[slot].guest else {
                continue;
            };
            match mode {
                FlushMode::Full => self.release(slot, sp),
                FlushMode::MaintainState => {
                    if self.slots[slot].dirty {
                        sp.store(self.pool[slot], guest);
                    }
                }
            }
        }
    }

    fn release(&mut self, slot: usize, sp: &mut dyn RegSpiller) {
        let s = self.slots[slot];
        if let Some(guest) = s.guest {
            if s.dirty {
                sp.store(self.pool[slot], guest);
            }
            self.bound[guest] = None;
        }
        self.slots[slot] = Slot::default();
    }

    /// Free slot, or the least recently used unlocked one after spilling it
    fn allocate(&mut self, sp: &mut dyn RegSpiller) -> Result<usize, JitError> {
        if let Some(free) = self.slots.iter().position(|s| s.guest.is_none()) {
            return Ok(free);
        }
        let victim = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.locked)
            .min_by_key(|(_, s)| s.last_use)
            .map(|(i, _)| i);
        match victim {
            Some(slot) => {
                self.release(slot, sp);
                Ok(slot)
            }
            None => Err(JitError::RegistersExhausted(self.pool.len())),
        }
    }
}
