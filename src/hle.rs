//! High-level emulation hooks
//!
//! A hook replaces (or runs in front of) the guest function at a given
//! effective address with a host function.

use std::collections::HashMap;

use crate::cpu::GuestState;
use crate::memory::Bus;

/// Host implementation of a guest function
pub type HleFunction = fn(&mut GuestState, &mut dyn Bus);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HookKind {
    /// Runs before the original instruction; execution continues
    Start,
    /// Replaces the whole function; execution resumes at LR
    Replace,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HookHandle {
    pub index: u32,
    pub kind: HookKind,
}

struct Hook {
    name: &'static str,
    kind: HookKind,
    function: HleFunction,
}

#[derive(Default)]
pub struct HookRegistry {
    hooks: Vec<Hook>,
    by_address: HashMap<u32, u32>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, address: u32, name: &'static str, kind: HookKind, function: HleFunction) -> HookHandle {
        let index = self.hooks.len() as u32;
        self.hooks.push(Hook { name, kind, function });
        self.by_address.insert(address, index);
        log::debug!("[HLE] {} hooked at {:#010x} ({:?})", name, address, kind);
        HookHandle { index, kind }
    }

    pub fn unregister(&mut self, address: u32) -> bool {
        self.by_address.remove(&address).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.by_address.is_empty()
    }

    #[inline(always)]
    pub fn try_replace(&self, address: u32) -> Option<HookHandle> {
        if self.by_address.is_empty() {
            return None;
        }
        let index = *self.by_address.get(&address)?;
        Some(HookHandle { index, kind: self.hooks[index as usize].kind })
    }

    /// Run hook `index`. `pc`/`npc` must already point at the hooked
    /// address; a replace hook redirects `npc` to LR.
    pub fn execute(&self, index: u32, state: &mut GuestState, bus: &mut dyn Bus) {
        let Some(hook) = self.hooks.get(index as usize) else {
            log::error!("[HLE] unknown hook index {}", index);
            return;
        };
        log::trace!("[HLE] {} at {:#010x}", hook.name, state.pc);
        (hook.function)(state, bus);
        if hook.kind == HookKind::Replace {
            state.npc = state.lr;
        }
    }

    pub fn name(&self, index: u32) -> Option<&'static str> {
        self.hooks.get(index as usize).map(|h| h.name)
    }
}
