//! Block Cache
//!
//! Compiled blocks live in a dense arena indexed three ways:
//! - by (effective start address, MSR translation bits) for dispatch
//! - by 32-byte physical line, for self-modifying-code invalidation
//! - by exit target address, so links into a block can be undone
//!
//! The cache never touches code memory itself; patching is delegated to
//! the backend through `BlockLinker`.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use super::analyzer::CACHE_LINE;
use super::JitError;

/// A block exit whose target address is known at compile time
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LinkExit {
    pub target: u32,
    /// Backend-specific location of the exit stub
    pub location: usize,
    pub linked: bool,
}

/// A compiled block and its dependency information
pub struct JitBlock<H> {
    pub start: u32,
    /// MSR[IR|DR] at compile time
    pub msr_key: u32,
    pub num_instructions: u32,
    pub physical_lines: BTreeSet<u32>,
    pub exits: Vec<LinkExit>,
    pub code: H,
}

/// Code patching operations the cache needs from a backend
pub trait BlockLinker<H> {
    /// Point `exit` at `dest`'s entry, or back at the dispatcher for `None`
    fn write_link(&mut self, exit: &LinkExit, dest: Option<&H>) -> Result<(), JitError>;

    /// Make every entry of a removed block return to the dispatcher
    fn write_destroy(&mut self, block: &JitBlock<H>) -> Result<(), JitError>;
}

pub struct BlockCache<H> {
    blocks: Vec<Option<JitBlock<H>>>,
    free: Vec<usize>,
    start_index: HashMap<(u32, u32), usize>,
    /// Ordered so a range invalidation only visits lines that hold code
    line_index: BTreeMap<u32, BTreeSet<usize>>,
    links_to: HashMap<u32, BTreeSet<usize>>,
    pub hits: u64,
    pub misses: u64,
}

impl<H> Default for BlockCache<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H> BlockCache<H> {
    pub fn new() -> Self {
        BlockCache {
            blocks: Vec::with_capacity(4096),
            free: Vec::new(),
            start_index: HashMap::with_capacity(4096),
            line_index: BTreeMap::new(),
            links_to: HashMap::new(),
            hits: 0,
            misses: 0,
        }
    }

    /// Number of live blocks
    pub fn len(&self) -> usize {
        self.start_index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.start_index.is_empty()
    }

    /// Find the block for `address` compiled under the same translation
    /// context as `msr`. Updates hit/miss statistics.
    #[inline(always)]
    pub fn lookup(&mut self, address: u32, msr: u32) -> Option<usize> {
        match self.start_index.get(&(address, msr & crate::cpu::MSR_TRANSLATION_MASK)) {
            Some(&index) => {
                self.hits += 1;
                Some(index)
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    /// Look up without touching statistics
    pub fn find(&self, address: u32, msr: u32) -> Option<&JitBlock<H>> {
        let index = *self.start_index.get(&(address, msr & crate::cpu::MSR_TRANSLATION_MASK))?;
        self.get(index)
    }

    pub fn get(&self, index: usize) -> Option<&JitBlock<H>> {
        self.blocks.get(index).and_then(|b| b.as_ref())
    }

    pub fn iter(&self) -> impl Iterator<Item = &JitBlock<H>> {
        self.blocks.iter().flatten()
    }

    /// Register a freshly compiled block. With `link`, its exits are pointed
    /// at existing blocks and existing exits targeting it are pointed at it.
    pub fn insert(&mut self, mut block: JitBlock<H>, link: bool, linker: &mut dyn BlockLinker<H>) -> Result<usize, JitError> {
        let key = (block.start, block.msr_key);
        if let Some(old) = self.start_index.get(&key).copied() {
            self.destroy(old, linker)?;
        }

        if link {
            for exit in block.exits.iter_mut() {
                if let Some(dest) = self.find(exit.target, block.msr_key) {
                    linker.write_link(exit, Some(&dest.code))?;
                    exit.linked = true;
                }
            }
        }

        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.blocks.push(None);
                self.blocks.len() - 1
            }
        };
        self.start_index.insert(key, index);
        for &line in &block.physical_lines {
            self.line_index.entry(line).or_default().insert(index);
        }
        for exit in &block.exits {
            self.links_to.entry(exit.target).or_default().insert(index);
        }
        let (start, msr_key) = (block.start, block.msr_key);
        self.blocks[index] = Some(block);

        if link {
            self.link_incoming(index, start, msr_key, linker)?;
        }
        Ok(index)
    }

    /// Point every unlinked exit targeting `start` at block `index`
    fn link_incoming(&mut self, index: usize, start: u32, msr_key: u32, linker: &mut dyn BlockLinker<H>) -> Result<(), JitError> {
        let sources: Vec<usize> = match self.links_to.get(&start) {
            Some(set) => set.iter().copied().collect(),
            None => return Ok(()),
        };
        for source in sources {
            let pending: Vec<(usize, LinkExit)> = match self.blocks[source].as_ref() {
                Some(src) if src.msr_key == msr_key => src
                    .exits
                    .iter()
                    .enumerate()
                    .filter(|(_, e)| e.target == start && !e.linked)
                    .map(|(i, e)| (i, *e))
                    .collect(),
                _ => continue,
            };
            if pending.is_empty() {
                continue;
            }
            let Some(dest) = self.blocks[index].as_ref() else {
                return Ok(());
            };
            for (_, exit) in &pending {
                linker.write_link(exit, Some(&dest.code))?;
            }
            if let Some(src) = self.blocks[source].as_mut() {
                for (i, _) in pending {
                    src.exits[i].linked = true;
                }
            }
        }
        Ok(())
    }

    /// Remove block `index`, unlinking everything that jumps into it
    fn destroy(&mut self, index: usize, linker: &mut dyn BlockLinker<H>) -> Result<(), JitError> {
        let Some(block) = self.blocks.get_mut(index).and_then(|b| b.take()) else {
            return Ok(());
        };
        self.start_index.remove(&(block.start, block.msr_key));
        for line in &block.physical_lines {
            if let Some(set) = self.line_index.get_mut(line) {
                set.remove(&index);
                if set.is_empty() {
                    self.line_index.remove(line);
                }
            }
        }
        for exit in &block.exits {
            if let Some(set) = self.links_to.get_mut(&exit.target) {
                set.remove(&index);
                if set.is_empty() {
                    self.links_to.remove(&exit.target);
                }
            }
        }

        if let Some(sources) = self.links_to.get(&block.start) {
            for &source in sources {
                let Some(src) = self.blocks[source].as_mut() else {
                    continue;
                };
                if src.msr_key != block.msr_key {
                    continue;
                }
                for exit in src.exits.iter_mut().filter(|e| e.target == block.start && e.linked) {
                    linker.write_link(exit, None)?;
                    exit.linked = false;
                }
            }
        }

        linker.write_destroy(&block)?;
        self.free.push(index);
        Ok(())
    }

    /// Remove every block decoded from physical `[address, address + length)`.
    /// Returns how many blocks were removed.
    pub fn invalidate(&mut self, address: u32, length: u32, linker: &mut dyn BlockLinker<H>) -> Result<usize, JitError> {
        if length == 0 {
            return Ok(0);
        }
        let first = address & !(CACHE_LINE - 1);
        let last = address.saturating_add(length - 1) & !(CACHE_LINE - 1);
        let victims: BTreeSet<usize> = self.line_index.range(first..=last).flat_map(|(_, set)| set.iter().copied()).collect();
        for &index in &victims {
            self.destroy(index, linker)?;
        }
        if !victims.is_empty() {
            log::debug!("[BlockCache] invalidated {} blocks in {:#010x}+{:#x}", victims.len(), address, length);
        }
        Ok(victims.len())
    }

    /// Forget every block. The backend resets its code storage separately,
    /// so nothing is unlinked.
    pub fn clear(&mut self) {
        self.blocks.clear();
        self.free.clear();
        self.start_index.clear();
        self.line_index.clear();
        self.links_to.clear();
    }
}
