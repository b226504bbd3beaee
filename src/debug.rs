//! Instruction breakpoints

use std::collections::BTreeMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BreakPoint {
    pub address: u32,
    /// Removed after the first hit ("run to here")
    pub is_temporary: bool,
    pub break_on_hit: bool,
    pub log_on_hit: bool,
}

/// Breakpoint registry keyed by effective address
#[derive(Default)]
pub struct BreakPoints {
    points: BTreeMap<u32, BreakPoint>,
}

impl BreakPoints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, address: u32) {
        self.insert(BreakPoint { address, is_temporary: false, break_on_hit: true, log_on_hit: false });
    }

    pub fn add_temporary(&mut self, address: u32) {
        self.insert(BreakPoint { address, is_temporary: true, break_on_hit: true, log_on_hit: false });
    }

    pub fn insert(&mut self, bp: BreakPoint) {
        self.points.insert(bp.address, bp);
    }

    pub fn remove(&mut self, address: u32) -> bool {
        self.points.remove(&address).is_some()
    }

    pub fn clear(&mut self) {
        self.points.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    #[inline(always)]
    pub fn is_address_breakpoint(&self, address: u32) -> bool {
        self.points.contains_key(&address)
    }

    /// Record a hit at `address`; temporary breakpoints are consumed
    pub fn hit(&mut self, address: u32) -> Option<BreakPoint> {
        let bp = *self.points.get(&address)?;
        if bp.is_temporary {
            self.points.remove(&address);
        }
        Some(bp)
    }

    pub fn iter(&self) -> impl Iterator<Item = &BreakPoint> {
        self.points.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temporary_breakpoint_is_consumed() {
        let mut bps = BreakPoints::new();
        bps.add(0x100);
        bps.add_temporary(0x200);
        assert!(bps.hit(0x200).is_some());
        assert!(!bps.is_address_breakpoint(0x200));
        assert!(bps.hit(0x100).is_some());
        assert!(bps.is_address_breakpoint(0x100));
        assert!(bps.hit(0x300).is_none());
    }
}
