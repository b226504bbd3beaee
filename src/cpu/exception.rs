//! Exception delivery
//!
//! Pending exceptions accumulate in `GuestState::exceptions`; the functions
//! here pick the highest-priority one, save the interrupted context into
//! SRR0/SRR1 and vector the CPU.

use super::*;

/// SRR1 bits saved from MSR on exception entry
const SRR1_MSR_MASK: u32 = 0x87C0_FFFF;
/// MSR bits cleared on exception entry
const MSR_CLEAR_ON_EXCEPTION: u32 = 0x0004_EF36;

/// Program exception causes written to SRR1 by the raising instruction
pub const PROGRAM_FLOATING_POINT: u32 = 0x0010_0000;
pub const PROGRAM_ILLEGAL: u32 = 0x0008_0000;
pub const PROGRAM_PRIVILEGED: u32 = 0x0004_0000;
pub const PROGRAM_TRAP: u32 = 0x0002_0000;
const PROGRAM_CAUSE_MASK: u32 = 0x001F_0000;

/// DSISR bits
pub const DSISR_PAGE: u32 = 0x4000_0000;
pub const DSISR_STORE: u32 = 0x0200_0000;

/// Exception vector offsets
pub const VECTOR_DSI: u32 = 0x300;
pub const VECTOR_ISI: u32 = 0x400;
pub const VECTOR_EXTERNAL: u32 = 0x500;
pub const VECTOR_ALIGNMENT: u32 = 0x600;
pub const VECTOR_PROGRAM: u32 = 0x700;
pub const VECTOR_FPU_UNAVAILABLE: u32 = 0x800;
pub const VECTOR_DECREMENTER: u32 = 0x900;
pub const VECTOR_SYSCALL: u32 = 0xC00;

/// Exceptions raised synchronously by an instruction
pub const SYNCHRONOUS_EXCEPTIONS: u32 = EXCEPTION_ISI
    | EXCEPTION_PROGRAM
    | EXCEPTION_SYSCALL
    | EXCEPTION_FPU_UNAVAILABLE
    | EXCEPTION_DSI
    | EXCEPTION_ALIGNMENT;

/// Raise a program exception with the given cause
pub fn raise_program(state: &mut GuestState, cause: u32) {
    state.srr1 = cause & PROGRAM_CAUSE_MASK;
    state.exceptions |= EXCEPTION_PROGRAM;
}

/// Raise a DSI for a failed data access at `ea`
pub fn raise_dsi(state: &mut GuestState, ea: u32, store: bool) {
    state.dar = ea;
    state.dsisr = DSISR_PAGE | if store { DSISR_STORE } else { 0 };
    state.exceptions |= EXCEPTION_DSI;
}

#[inline(always)]
fn vector(state: &GuestState, offset: u32) -> u32 {
    if state.msr & MSR_IP != 0 {
        0xFFF0_0000 | offset
    } else {
        offset
    }
}

fn enter(state: &mut GuestState, srr0: u32, srr1_extra: u32, offset: u32, bit: u32) {
    state.srr0 = srr0;
    state.srr1 = (state.msr & SRR1_MSR_MASK) | srr1_extra;
    state.msr &= !MSR_CLEAR_ON_EXCEPTION;
    let target = vector(state, offset);
    state.pc = target;
    state.npc = target;
    state.exceptions &= !bit;
}

/// Deliver the highest-priority pending synchronous exception, or an
/// external one when MSR[EE] allows it.
pub fn check_exceptions(state: &mut GuestState) {
    let exceptions = state.exceptions;
    if exceptions & EXCEPTION_ISI != 0 {
        log::debug!("[CPU] ISI at {:#010x}", state.npc);
        enter(state, state.npc, 0x4000_0000, VECTOR_ISI, EXCEPTION_ISI);
    } else if exceptions & EXCEPTION_PROGRAM != 0 {
        let cause = state.srr1 & PROGRAM_CAUSE_MASK;
        log::debug!("[CPU] program exception at {:#010x} cause={:#x}", state.pc, cause);
        enter(state, state.pc, cause, VECTOR_PROGRAM, EXCEPTION_PROGRAM);
    } else if exceptions & EXCEPTION_SYSCALL != 0 {
        enter(state, state.npc, 0, VECTOR_SYSCALL, EXCEPTION_SYSCALL);
    } else if exceptions & EXCEPTION_FPU_UNAVAILABLE != 0 {
        enter(state, state.pc, 0, VECTOR_FPU_UNAVAILABLE, EXCEPTION_FPU_UNAVAILABLE);
    } else if exceptions & EXCEPTION_DSI != 0 {
        log::debug!("[CPU] DSI at {:#010x} dar={:#010x}", state.pc, state.dar);
        enter(state, state.pc, 0, VECTOR_DSI, EXCEPTION_DSI);
    } else if exceptions & EXCEPTION_ALIGNMENT != 0 {
        enter(state, state.pc, 0, VECTOR_ALIGNMENT, EXCEPTION_ALIGNMENT);
    } else {
        check_external_exceptions(state);
    }
}

/// Deliver external interrupt or decrementer, only at instruction
/// boundaries where `pc == npc`.
pub fn check_external_exceptions(state: &mut GuestState) {
    if state.msr & MSR_EE == 0 {
        return;
    }
    let exceptions = state.exceptions;
    if exceptions & EXCEPTION_EXTERNAL_INT != 0 {
        enter(state, state.pc, 0, VECTOR_EXTERNAL, EXCEPTION_EXTERNAL_INT);
    } else if exceptions & EXCEPTION_DECREMENTER != 0 {
        enter(state, state.pc, 0, VECTOR_DECREMENTER, EXCEPTION_DECREMENTER);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_syscall_saves_npc() {
        let mut s = GuestState::new();
        s.pc = 0x100;
        s.npc = 0x104;
        s.msr = MSR_EE | MSR_FP | MSR_IR | MSR_DR;
        s.exceptions = EXCEPTION_SYSCALL;
        check_exceptions(&mut s);
        assert_eq!(s.pc, 0xC00);
        assert_eq!(s.npc, 0xC00);
        assert_eq!(s.srr0, 0x104);
        assert_eq!(s.srr1, MSR_EE | MSR_FP | MSR_IR | MSR_DR);
        assert_eq!(s.msr & (MSR_EE | MSR_FP | MSR_IR | MSR_DR), 0);
        assert_eq!(s.exceptions, 0);
    }

    #[test]
    fn test_program_cause_and_priority() {
        let mut s = GuestState::new();
        s.pc = 0x200;
        s.npc = 0x204;
        raise_program(&mut s, PROGRAM_TRAP);
        s.exceptions |= EXCEPTION_DSI;
        check_exceptions(&mut s);
        assert_eq!(s.pc, VECTOR_PROGRAM);
        assert_eq!(s.srr0, 0x200);
        assert_eq!(s.srr1 & PROGRAM_TRAP, PROGRAM_TRAP);
        assert_eq!(s.exceptions, EXCEPTION_DSI);
    }

    #[test]
    fn test_external_requires_ee() {
        let mut s = GuestState::new();
        s.pc = 0x300;
        s.npc = 0x300;
        s.exceptions = EXCEPTION_EXTERNAL_INT;
        check_external_exceptions(&mut s);
        assert_eq!(s.pc, 0x300);
        s.msr = MSR_EE;
        check_external_exceptions(&mut s);
        assert_eq!(s.pc, VECTOR_EXTERNAL);
        assert_eq!(s.srr0, 0x300);
    }

    #[test]
    fn test_ip_relocates_vectors() {
        let mut s = GuestState::new();
        s.msr = MSR_IP;
        s.exceptions = EXCEPTION_FPU_UNAVAILABLE;
        check_exceptions(&mut s);
        assert_eq!(s.pc, 0xFFF0_0800);
    }
}
