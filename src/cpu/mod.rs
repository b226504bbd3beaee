//! Gekko (PowerPC 750CL) CPU state
//!
//! The guest register file lives in a single `#[repr(C)]` struct so that the
//! native backend can address every field with a fixed displacement from one
//! base register, and the interpreter, exception logic and dispatcher all
//! mutate the same location.

pub mod asm;
pub mod decode;
pub mod exception;
pub mod interpreter;

use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

use crate::debug::BreakPoints;
use crate::hle::HookRegistry;
use crate::jit::{JitConfig, JitError, JitStats};
use crate::memory::Bus;
use crate::timing::Scheduler;

// ============================================================================
// Architectural constants
// ============================================================================

/// MSR bits (IBM numbering converted to masks)
pub const MSR_EE: u32 = 0x0000_8000;
pub const MSR_PR: u32 = 0x0000_4000;
pub const MSR_FP: u32 = 0x0000_2000;
pub const MSR_ME: u32 = 0x0000_1000;
pub const MSR_FE0: u32 = 0x0000_0800;
pub const MSR_SE: u32 = 0x0000_0400;
pub const MSR_BE: u32 = 0x0000_0200;
pub const MSR_FE1: u32 = 0x0000_0100;
pub const MSR_IP: u32 = 0x0000_0040;
pub const MSR_IR: u32 = 0x0000_0020;
pub const MSR_DR: u32 = 0x0000_0010;
pub const MSR_RI: u32 = 0x0000_0002;
pub const MSR_LE: u32 = 0x0000_0001;

/// MSR bits that select the address-translation context of a block
pub const MSR_TRANSLATION_MASK: u32 = MSR_IR | MSR_DR;

/// Pending exception bits
pub const EXCEPTION_DECREMENTER: u32 = 0x0001;
pub const EXCEPTION_SYSCALL: u32 = 0x0002;
pub const EXCEPTION_EXTERNAL_INT: u32 = 0x0004;
pub const EXCEPTION_DSI: u32 = 0x0008;
pub const EXCEPTION_ISI: u32 = 0x0010;
pub const EXCEPTION_ALIGNMENT: u32 = 0x0020;
pub const EXCEPTION_FPU_UNAVAILABLE: u32 = 0x0040;
pub const EXCEPTION_PROGRAM: u32 = 0x0080;
pub const EXCEPTION_PERFORMANCE_MONITOR: u32 = 0x0100;

/// XER bits
pub const XER_SO: u32 = 0x8000_0000;
pub const XER_OV: u32 = 0x4000_0000;
pub const XER_CA: u32 = 0x2000_0000;

/// CR field bits (within one 4-bit field)
pub const CR_LT: u32 = 0x8;
pub const CR_GT: u32 = 0x4;
pub const CR_EQ: u32 = 0x2;
pub const CR_SO: u32 = 0x1;

/// Special purpose register numbers
pub const SPR_XER: u32 = 1;
pub const SPR_LR: u32 = 8;
pub const SPR_CTR: u32 = 9;
pub const SPR_DSISR: u32 = 18;
pub const SPR_DAR: u32 = 19;
pub const SPR_DEC: u32 = 22;
pub const SPR_SRR0: u32 = 26;
pub const SPR_SRR1: u32 = 27;
pub const SPR_SPRG0: u32 = 272;
pub const SPR_PVR: u32 = 287;

/// Processor version reported by mfspr PVR (Gekko)
pub const GEKKO_PVR: u32 = 0x0008_3214;

/// Reset vector used when MSR[IP] is set at power-on
pub const RESET_VECTOR: u32 = 0xFFF0_0100;

// ============================================================================
// Guest state
// ============================================================================

/// Performance-monitor counters, committed at every block exit
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerfCounters {
    pub cycles: u32,
    pub load_store: u32,
    pub fp: u32,
}

/// Emulated CPU register file
#[repr(C)]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GuestState {
    /// Address of the instruction being executed
    pub pc: u32,
    /// Address of the next instruction; branches write this
    pub npc: u32,
    pub gpr: [u32; 32],
    pub cr: u32,
    pub xer: u32,
    pub lr: u32,
    pub ctr: u32,
    pub msr: u32,
    pub fpscr: u32,
    /// Pending exception bitmask (`EXCEPTION_*`)
    pub exceptions: u32,
    /// Cycles left in the current scheduler slice
    pub downcount: i32,
    pub srr0: u32,
    pub srr1: u32,
    pub dar: u32,
    pub dsisr: u32,
    pub dec: u32,
    pub sprg: [u32; 4],
    pub perf: PerfCounters,
    pub fpr: [f64; 32],
}

impl Default for GuestState {
    fn default() -> Self {
        Self::new()
    }
}

impl GuestState {
    pub fn new() -> Self {
        GuestState {
            pc: 0,
            npc: 0,
            gpr: [0; 32],
            cr: 0,
            xer: 0,
            lr: 0,
            ctr: 0,
            msr: 0,
            fpscr: 0,
            exceptions: 0,
            downcount: 0,
            srr0: 0,
            srr1: 0,
            dar: 0,
            dsisr: 0,
            dec: 0,
            sprg: [0; 4],
            perf: PerfCounters::default(),
            fpr: [0.0; 32],
        }
    }

    /// Power-on state: everything cleared, execution starts at `entry`
    pub fn reset(&mut self, entry: u32) {
        *self = GuestState::new();
        self.pc = entry;
        self.npc = entry;
    }

    /// Read a 4-bit CR field (0 = cr0, most significant)
    #[inline(always)]
    pub fn cr_field(&self, field: u32) -> u32 {
        (self.cr >> (28 - 4 * field)) & 0xF
    }

    #[inline(always)]
    pub fn set_cr_field(&mut self, field: u32, value: u32) {
        let shift = 28 - 4 * field;
        self.cr = (self.cr & !(0xF << shift)) | ((value & 0xF) << shift);
    }

    /// Read a single CR bit (IBM numbering, bit 0 is the MSB)
    #[inline(always)]
    pub fn cr_bit(&self, bit: u32) -> bool {
        (self.cr >> (31 - bit)) & 1 != 0
    }

    #[inline(always)]
    pub fn set_cr_bit(&mut self, bit: u32, value: bool) {
        let mask = 1 << (31 - bit);
        if value {
            self.cr |= mask;
        } else {
            self.cr &= !mask;
        }
    }

    /// cr0 from a signed compare of `value` against zero plus XER[SO]
    #[inline(always)]
    pub fn update_cr0(&mut self, value: u32) {
        let field = compare_signed(value as i32, 0) | self.xer_so();
        self.set_cr_field(0, field);
    }

    #[inline(always)]
    pub fn xer_so(&self) -> u32 {
        self.xer >> 31
    }

    #[inline(always)]
    pub fn carry(&self) -> bool {
        self.xer & XER_CA != 0
    }

    #[inline(always)]
    pub fn set_carry(&mut self, carry: bool) {
        if carry {
            self.xer |= XER_CA;
        } else {
            self.xer &= !XER_CA;
        }
    }

    /// Set XER[OV], and XER[SO] when overflow occurred
    #[inline(always)]
    pub fn set_overflow(&mut self, overflow: bool) {
        if overflow {
            self.xer |= XER_OV | XER_SO;
        } else {
            self.xer &= !XER_OV;
        }
    }

    /// Consume cycles and bump the performance counters
    #[inline(always)]
    pub fn charge(&mut self, cycles: u32, load_store: u32, fp: u32) {
        self.downcount = self.downcount.wrapping_sub(cycles as i32);
        self.perf.cycles = self.perf.cycles.wrapping_add(cycles);
        self.perf.load_store = self.perf.load_store.wrapping_add(load_store);
        self.perf.fp = self.perf.fp.wrapping_add(fp);
    }
}

/// CR field for a signed comparison (without SO)
#[inline(always)]
pub fn compare_signed(a: i32, b: i32) -> u32 {
    if a < b {
        CR_LT
    } else if a > b {
        CR_GT
    } else {
        CR_EQ
    }
}

/// CR field for an unsigned comparison (without SO)
#[inline(always)]
pub fn compare_unsigned(a: u32, b: u32) -> u32 {
    if a < b {
        CR_LT
    } else if a > b {
        CR_GT
    } else {
        CR_EQ
    }
}

// ============================================================================
// Execution control
// ============================================================================

/// Run state of the execution thread
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum CpuState {
    Running = 0,
    Stepping = 1,
    PoweredDown = 2,
}

/// Run-state flag shared with other threads.
///
/// Requests are only observed by the execution thread at block and
/// instruction boundaries. `PoweredDown` is terminal until `reset`.
#[derive(Debug)]
pub struct CpuControl {
    state: AtomicU8,
}

impl Default for CpuControl {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuControl {
    pub fn new() -> Self {
        CpuControl { state: AtomicU8::new(CpuState::Stepping as u8) }
    }

    pub fn state(&self) -> CpuState {
        match self.state.load(Ordering::Acquire) {
            0 => CpuState::Running,
            1 => CpuState::Stepping,
            _ => CpuState::PoweredDown,
        }
    }

    #[inline(always)]
    pub fn is_running(&self) -> bool {
        self.state.load(Ordering::Acquire) == CpuState::Running as u8
    }

    /// Move to `Running` unless powered down. Returns whether it took effect.
    pub fn resume(&self) -> bool {
        self.transition(CpuState::Running)
    }

    /// Ask the execution thread to stop at the next safe point
    pub fn request_step(&self) -> bool {
        self.transition(CpuState::Stepping)
    }

    pub fn power_down(&self) {
        self.state.store(CpuState::PoweredDown as u8, Ordering::Release);
    }

    /// Leave `PoweredDown` (guest reboot)
    pub fn reset(&self) {
        self.state.store(CpuState::Stepping as u8, Ordering::Release);
    }

    fn transition(&self, to: CpuState) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current == CpuState::PoweredDown as u8 {
                return false;
            }
            match self.state.compare_exchange_weak(current, to as u8, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return true,
                Err(seen) => current = seen,
            }
        }
    }
}

// ============================================================================
// Execution environment
// ============================================================================

/// Everything a CPU core touches while running guest code.
///
/// Built by the owner of the collaborators for the duration of one
/// `run`/`single_step` call.
pub struct Machine<'a> {
    pub state: &'a mut GuestState,
    pub bus: &'a mut dyn Bus,
    pub timing: &'a mut dyn Scheduler,
    pub breakpoints: &'a mut BreakPoints,
    pub hooks: &'a HookRegistry,
    pub control: &'a CpuControl,
    /// Physical ranges invalidated by the guest (icbi), applied at the next
    /// dispatcher safe point
    pub invalidations: Vec<(u32, u32)>,
}

impl<'a> Machine<'a> {
    pub fn new(
        state: &'a mut GuestState,
        bus: &'a mut dyn Bus,
        timing: &'a mut dyn Scheduler,
        breakpoints: &'a mut BreakPoints,
        hooks: &'a HookRegistry,
        control: &'a CpuControl,
    ) -> Self {
        Machine { state, bus, timing, breakpoints, hooks, control, invalidations: Vec::new() }
    }

    /// Check the breakpoint registry at the current PC. A hit that requests
    /// a break moves the CPU to `Stepping`; returns whether it did.
    pub fn check_breakpoint(&mut self) -> bool {
        let pc = self.state.pc;
        match self.breakpoints.hit(pc) {
            Some(hit) if hit.break_on_hit => {
                log::info!("[CPU] breakpoint hit at {:#010x}", pc);
                self.control.request_step();
                true
            }
            Some(_) => {
                log::info!("[CPU] breakpoint (log only) at {:#010x} r3={:#x} lr={:#x}", pc, self.state.gpr[3], self.state.lr);
                false
            }
            None => false,
        }
    }

    /// Run the scheduler's end-of-slice work and deliver external interrupts
    pub fn advance(&mut self) {
        self.timing.advance(self.state);
        exception::check_external_exceptions(self.state);
    }
}

/// Execution engine interface shared by the interpreter and the JIT backends
pub trait CpuCore {
    fn name(&self) -> &'static str;

    /// Execute until the CPU leaves `Running` or the scheduler deadline passes
    fn run(&mut self, m: &mut Machine<'_>);

    /// Execute one block-worth of guest code
    fn single_step(&mut self, m: &mut Machine<'_>);

    /// Drop all translated code
    fn clear_cache(&mut self);

    /// Drop translated code depending on physical `[address, address + length)`
    fn invalidate(&mut self, address: u32, length: u32);

    fn stats(&self) -> JitStats {
        JitStats::default()
    }

    /// Apply new JIT options; cores without translated code ignore them
    fn configure(&mut self, _config: &JitConfig) -> Result<(), JitError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cr_fields() {
        let mut s = GuestState::new();
        s.set_cr_field(0, CR_LT);
        s.set_cr_field(7, CR_EQ | CR_SO);
        assert_eq!(s.cr, 0x8000_0003);
        assert_eq!(s.cr_field(0), CR_LT);
        assert!(s.cr_bit(0));
        assert!(s.cr_bit(30));
        s.set_cr_bit(0, false);
        assert_eq!(s.cr_field(0), 0);
    }

    #[test]
    fn test_update_cr0_includes_so() {
        let mut s = GuestState::new();
        s.xer = XER_SO;
        s.update_cr0(0xFFFF_FFFF);
        assert_eq!(s.cr_field(0), CR_LT | CR_SO);
        s.xer = 0;
        s.update_cr0(0);
        assert_eq!(s.cr_field(0), CR_EQ);
    }

    #[test]
    fn test_control_power_down_is_terminal() {
        let c = CpuControl::new();
        assert!(c.resume());
        assert!(c.is_running());
        c.power_down();
        assert!(!c.resume());
        assert_eq!(c.state(), CpuState::PoweredDown);
        c.reset();
        assert_eq!(c.state(), CpuState::Stepping);
    }

    #[test]
    fn test_charge() {
        let mut s = GuestState::new();
        s.downcount = 10;
        s.charge(4, 1, 2);
        assert_eq!(s.downcount, 6);
        assert_eq!(s.perf, PerfCounters { cycles: 4, load_store: 1, fp: 2 });
    }
}
