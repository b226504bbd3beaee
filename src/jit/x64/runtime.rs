//! Glue between generated code and the rest of the emulator
//!
//! Register convention inside generated code:
//! - rbp: `&mut GuestState`
//! - r15: `*mut Machine` (opaque, handed back to callbacks)
//! - rax, rcx, rdx: scratch
//!
//! Callbacks use the SysV ABI: `fn(ctx, arg) -> u32`. Every caller-saved
//! register is clobbered, so the register cache is flushed before a call.

use std::ffi::c_void;
use std::mem::offset_of;

use dynasm::dynasm;
use dynasmrt::DynasmApi;

use crate::cpu::decode::{self, Inst, OpKind};
use crate::cpu::{exception, interpreter, GuestState, Machine, PerfCounters};
use crate::jit::JitError;

use super::code_buffer::{align_up, CodeBuffer, BLOCK_ALIGN};
use super::emitter::XEmitter;

/// `enter(state, ctx, code)`: run generated code until it jumps to `exit`
pub type EnterFn = unsafe extern "sysv64" fn(*mut GuestState, *mut c_void, usize);

/// Runtime entry point called from generated code
pub type Callback = unsafe extern "sysv64" fn(*mut c_void, u32) -> u32;

/// Routines shared by all blocks, placed at the start of the buffer
#[derive(Clone, Copy, Debug)]
pub struct AsmRoutines {
    pub enter: usize,
    /// Jump target that returns to the dispatcher
    pub exit: usize,
    /// First byte available to blocks
    pub end: usize,
}

impl AsmRoutines {
    pub fn generate(buffer: &mut CodeBuffer) -> Result<Self, JitError> {
        let origin = buffer.next_block_address();
        let mut e = XEmitter::new(origin);

        let enter = e.current_address();
        // six pushes plus the return address: realign to 16
        dynasm!(e.ops
            ; push rbx
            ; push rbp
            ; push r12
            ; push r13
            ; push r14
            ; push r15
            ; sub rsp, 8
            ; mov rbp, rdi
            ; mov r15, rsi
            ; jmp rdx
        );

        let exit = e.current_address();
        dynasm!(e.ops
            ; add rsp, 8
            ; pop r15
            ; pop r14
            ; pop r13
            ; pop r12
            ; pop rbp
            ; pop rbx
            ; ret
        );

        let code = e.finish()?;
        buffer.append(origin, &code)?;
        let end = buffer.base() + align_up(buffer.pos(), BLOCK_ALIGN);
        Ok(AsmRoutines { enter, exit, end })
    }
}

/// Guest state field offsets, as used in `[rbp+disp32]` operands
pub mod offsets {
    use super::*;

    pub const PC: i32 = offset_of!(GuestState, pc) as i32;
    pub const NPC: i32 = offset_of!(GuestState, npc) as i32;
    pub const CR: i32 = offset_of!(GuestState, cr) as i32;
    pub const XER: i32 = offset_of!(GuestState, xer) as i32;
    pub const LR: i32 = offset_of!(GuestState, lr) as i32;
    pub const CTR: i32 = offset_of!(GuestState, ctr) as i32;
    pub const MSR: i32 = offset_of!(GuestState, msr) as i32;
    pub const EXCEPTIONS: i32 = offset_of!(GuestState, exceptions) as i32;
    pub const DOWNCOUNT: i32 = offset_of!(GuestState, downcount) as i32;
    const PERF: usize = offset_of!(GuestState, perf);
    pub const PERF_CYCLES: i32 = (PERF + offset_of!(PerfCounters, cycles)) as i32;
    pub const PERF_LOAD_STORE: i32 = (PERF + offset_of!(PerfCounters, load_store)) as i32;
    pub const PERF_FP: i32 = (PERF + offset_of!(PerfCounters, fp)) as i32;

    pub fn gpr(index: usize) -> i32 {
        (offset_of!(GuestState, gpr) + 4 * index) as i32
    }

    pub fn fpr(index: usize) -> i32 {
        (offset_of!(GuestState, fpr) + 8 * index) as i32
    }
}

/// # Safety
/// `ctx` is the `Machine` passed to `enter`, still alive and not otherwise
/// borrowed while generated code runs.
unsafe fn machine<'a>(ctx: *mut c_void) -> &'a mut Machine<'a> {
    &mut *(ctx as *mut Machine<'a>)
}

/// Run one instruction through the interpreter
pub unsafe extern "sysv64" fn rt_interpret(ctx: *mut c_void, raw: u32) -> u32 {
    let m = machine(ctx);
    let kind = decode::decode(raw).unwrap_or(OpKind::Invalid);
    interpreter::execute(m, Inst(raw), kind);
    0
}

/// Nonzero when a breakpoint at the synced pc stops execution
pub unsafe extern "sysv64" fn rt_check_breakpoint(ctx: *mut c_void, _: u32) -> u32 {
    machine(ctx).check_breakpoint() as u32
}

pub unsafe extern "sysv64" fn rt_check_exceptions(ctx: *mut c_void, _: u32) -> u32 {
    let m = machine(ctx);
    exception::check_exceptions(m.state);
    0
}

pub unsafe extern "sysv64" fn rt_idle(ctx: *mut c_void, _: u32) -> u32 {
    let m = machine(ctx);
    m.timing.idle(m.state);
    0
}

pub unsafe extern "sysv64" fn rt_hle(ctx: *mut c_void, index: u32) -> u32 {
    let m = machine(ctx);
    m.hooks.execute(index, m.state, m.bus);
    0
}

pub fn callback_address(f: Callback) -> usize {
    f as usize
}
