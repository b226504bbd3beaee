//! Instruction interpreter
//!
//! `execute` implements one decoded instruction against the guest state.
//! It is the fallback for every op the native backend does not translate,
//! the body of every cached-interpreter block, and (through `Interpreter`)
//! the reference CPU core.
//!
//! Contract shared with the block compilers: `pc` and `npc` are only
//! guaranteed valid for ops that read them (branches, exceptions,
//! trap/system ops); branches write `npc` only when taken.

use super::decode::{self, rotation_mask, Inst, OpKind, FL_LOADSTORE, FL_USE_FPU};
use super::exception::{self, *};
use super::*;
use crate::memory::AccessKind;

// ============================================================================
// Memory helpers
// ============================================================================

#[inline(always)]
fn ra_or_zero(state: &GuestState, ra: usize) -> u32 {
    if ra == 0 {
        0
    } else {
        state.gpr[ra]
    }
}

/// Translate a data address, raising DSI on failure
#[inline(always)]
fn data_address(m: &mut Machine<'_>, ea: u32, store: bool) -> Option<u32> {
    let kind = if store { AccessKind::Write } else { AccessKind::Read };
    match m.bus.translate(ea, kind, m.state.msr) {
        Ok(paddr) => Some(paddr),
        Err(_) => {
            exception::raise_dsi(m.state, ea, store);
            None
        }
    }
}

fn read_u8(m: &mut Machine<'_>, ea: u32) -> Option<u32> {
    let p = data_address(m, ea, false)?;
    Some(m.bus.read8(p) as u32)
}

fn read_u16(m: &mut Machine<'_>, ea: u32) -> Option<u32> {
    let p = data_address(m, ea, false)?;
    Some(m.bus.read16(p) as u32)
}

fn read_u32(m: &mut Machine<'_>, ea: u32) -> Option<u32> {
    let p = data_address(m, ea, false)?;
    Some(m.bus.read32(p))
}

fn read_u64(m: &mut Machine<'_>, ea: u32) -> Option<u64> {
    let p = data_address(m, ea, false)?;
    Some(m.bus.read64(p))
}

fn write_u8(m: &mut Machine<'_>, ea: u32, value: u32) -> Option<()> {
    let p = data_address(m, ea, true)?;
    m.bus.write8(p, value as u8);
    Some(())
}

fn write_u16(m: &mut Machine<'_>, ea: u32, value: u32) -> Option<()> {
    let p = data_address(m, ea, true)?;
    m.bus.write16(p, value as u16);
    Some(())
}

fn write_u32(m: &mut Machine<'_>, ea: u32, value: u32) -> Option<()> {
    let p = data_address(m, ea, true)?;
    m.bus.write32(p, value);
    Some(())
}

fn write_u64(m: &mut Machine<'_>, ea: u32, value: u64) -> Option<()> {
    let p = data_address(m, ea, true)?;
    m.bus.write64(p, value);
    Some(())
}

// ============================================================================
// Arithmetic helpers
// ============================================================================

/// a + b + carry_in -> (result, carry out, signed overflow)
#[inline(always)]
fn add_with_carry(a: u32, b: u32, carry_in: bool) -> (u32, bool, bool) {
    let wide = a as u64 + b as u64 + carry_in as u64;
    let result = wide as u32;
    let overflow = ((a ^ result) & (b ^ result)) >> 31 != 0;
    (result, wide > 0xFFFF_FFFF, overflow)
}

#[inline(always)]
fn finish_arith(state: &mut GuestState, inst: Inst, result: u32, overflow: bool) {
    state.gpr[inst.rd()] = result;
    if inst.oe() {
        state.set_overflow(overflow);
    }
    if inst.rc() {
        state.update_cr0(result);
    }
}

#[inline(always)]
fn finish_logical(state: &mut GuestState, inst: Inst, result: u32) {
    state.gpr[inst.ra()] = result;
    if inst.rc() {
        state.update_cr0(result);
    }
}

#[inline(always)]
fn fp_record(state: &mut GuestState, inst: Inst) {
    if inst.rc() {
        let field = state.fpscr >> 28;
        state.set_cr_field(1, field);
    }
}

#[inline(always)]
fn round_single(value: f64) -> f64 {
    value as f32 as f64
}

const SIGN_BIT: u64 = 0x8000_0000_0000_0000;

fn trap_condition(to: u32, a: u32, b: u32) -> bool {
    let (sa, sb) = (a as i32, b as i32);
    (to & 0x10 != 0 && sa < sb)
        || (to & 0x08 != 0 && sa > sb)
        || (to & 0x04 != 0 && a == b)
        || (to & 0x02 != 0 && a < b)
        || (to & 0x01 != 0 && a > b)
}

/// Branch condition evaluation shared by bc/bclr/bcctr; decrements CTR
/// when BO asks for it.
#[inline(always)]
fn branch_condition(state: &mut GuestState, inst: Inst, allow_ctr: bool) -> bool {
    let bo = inst.bo();
    let mut ctr_ok = true;
    if allow_ctr && bo & 0x04 == 0 {
        state.ctr = state.ctr.wrapping_sub(1);
        ctr_ok = (state.ctr != 0) ^ (bo & 0x02 != 0);
    }
    let cond_ok = bo & 0x10 != 0 || state.cr_bit(inst.bi()) == (bo & 0x08 != 0);
    ctr_ok && cond_ok
}

#[inline(always)]
fn privileged(state: &mut GuestState) -> bool {
    if state.msr & MSR_PR != 0 {
        exception::raise_program(state, PROGRAM_PRIVILEGED);
        return false;
    }
    true
}

fn read_spr(state: &GuestState, spr: u32) -> u32 {
    match spr {
        SPR_XER => state.xer,
        SPR_LR => state.lr,
        SPR_CTR => state.ctr,
        SPR_DSISR => state.dsisr,
        SPR_DAR => state.dar,
        SPR_DEC => state.dec,
        SPR_SRR0 => state.srr0,
        SPR_SRR1 => state.srr1,
        SPR_PVR => GEKKO_PVR,
        s if (SPR_SPRG0..SPR_SPRG0 + 4).contains(&s) => state.sprg[(s - SPR_SPRG0) as usize],
        _ => {
            log::debug!("[Interpreter] mfspr from unhandled SPR {}", spr);
            0
        }
    }
}

fn write_spr(state: &mut GuestState, spr: u32, value: u32) {
    match spr {
        SPR_XER => state.xer = value,
        SPR_LR => state.lr = value,
        SPR_CTR => state.ctr = value,
        SPR_DSISR => state.dsisr = value,
        SPR_DAR => state.dar = value,
        SPR_DEC => state.dec = value,
        SPR_SRR0 => state.srr0 = value,
        SPR_SRR1 => state.srr1 = value,
        s if (SPR_SPRG0..SPR_SPRG0 + 4).contains(&s) => state.sprg[(s - SPR_SPRG0) as usize] = value,
        _ => log::debug!("[Interpreter] mtspr to unhandled SPR {} = {:#x}", spr, value),
    }
}

// ============================================================================
// Execution
// ============================================================================

/// Execute one decoded instruction. Faults are raised into
/// `state.exceptions`; delivering them is up to the caller, except for
/// `sc` which vectors immediately.
pub fn execute(m: &mut Machine<'_>, inst: Inst, kind: OpKind) {
    use OpKind::*;
    let (rd, ra, rb) = (inst.rd(), inst.ra(), inst.rb());
    match kind {
        // Integer arithmetic
        Addi => {
            let s = &mut *m.state;
            s.gpr[rd] = ra_or_zero(s, ra).wrapping_add(inst.simm() as u32);
        }
        Addis => {
            let s = &mut *m.state;
            s.gpr[rd] = ra_or_zero(s, ra).wrapping_add((inst.simm() as u32) << 16);
        }
        Addic | AddicRc => {
            let s = &mut *m.state;
            let (result, carry, _) = add_with_carry(s.gpr[ra], inst.simm() as u32, false);
            s.gpr[rd] = result;
            s.set_carry(carry);
            if kind == AddicRc {
                s.update_cr0(result);
            }
        }
        Subfic => {
            let s = &mut *m.state;
            let (result, carry, _) = add_with_carry(!s.gpr[ra], inst.simm() as u32, true);
            s.gpr[rd] = result;
            s.set_carry(carry);
        }
        Mulli => {
            let s = &mut *m.state;
            s.gpr[rd] = (s.gpr[ra] as i32).wrapping_mul(inst.simm()) as u32;
        }
        Add => {
            let s = &mut *m.state;
            let (result, _, ov) = add_with_carry(s.gpr[ra], s.gpr[rb], false);
            finish_arith(s, inst, result, ov);
        }
        Addc => {
            let s = &mut *m.state;
            let (result, carry, ov) = add_with_carry(s.gpr[ra], s.gpr[rb], false);
            s.set_carry(carry);
            finish_arith(s, inst, result, ov);
        }
        Adde => {
            let s = &mut *m.state;
            let (result, carry, ov) = add_with_carry(s.gpr[ra], s.gpr[rb], s.carry());
            s.set_carry(carry);
            finish_arith(s, inst, result, ov);
        }
        Addze => {
            let s = &mut *m.state;
            let (result, carry, ov) = add_with_carry(s.gpr[ra], 0, s.carry());
            s.set_carry(carry);
            finish_arith(s, inst, result, ov);
        }
        Addme => {
            let s = &mut *m.state;
            let (result, carry, ov) = add_with_carry(s.gpr[ra], 0xFFFF_FFFF, s.carry());
            s.set_carry(carry);
            finish_arith(s, inst, result, ov);
        }
        Subf => {
            let s = &mut *m.state;
            let (result, _, ov) = add_with_carry(!s.gpr[ra], s.gpr[rb], true);
            finish_arith(s, inst, result, ov);
        }
        Subfc => {
            let s = &mut *m.state;
            let (result, carry, ov) = add_with_carry(!s.gpr[ra], s.gpr[rb], true);
            s.set_carry(carry);
            finish_arith(s, inst, result, ov);
        }
        Subfe => {
            let s = &mut *m.state;
            let (result, carry, ov) = add_with_carry(!s.gpr[ra], s.gpr[rb], s.carry());
            s.set_carry(carry);
            finish_arith(s, inst, result, ov);
        }
        Subfze => {
            let s = &mut *m.state;
            let (result, carry, ov) = add_with_carry(!s.gpr[ra], 0, s.carry());
            s.set_carry(carry);
            finish_arith(s, inst, result, ov);
        }
        Neg => {
            let s = &mut *m.state;
            let a = s.gpr[ra];
            finish_arith(s, inst, a.wrapping_neg(), a == 0x8000_0000);
        }
        Mullw => {
            let s = &mut *m.state;
            let wide = s.gpr[ra] as i32 as i64 * s.gpr[rb] as i32 as i64;
            finish_arith(s, inst, wide as u32, wide != wide as i32 as i64);
        }
        Mulhw => {
            let s = &mut *m.state;
            let wide = s.gpr[ra] as i32 as i64 * s.gpr[rb] as i32 as i64;
            finish_arith(s, inst, (wide >> 32) as u32, false);
        }
        Mulhwu => {
            let s = &mut *m.state;
            let wide = s.gpr[ra] as u64 * s.gpr[rb] as u64;
            finish_arith(s, inst, (wide >> 32) as u32, false);
        }
        Divw => {
            let s = &mut *m.state;
            let (a, b) = (s.gpr[ra] as i32, s.gpr[rb] as i32);
            if b == 0 || (a == i32::MIN && b == -1) {
                let result = if a < 0 { 0xFFFF_FFFF } else { 0 };
                finish_arith(s, inst, result, true);
            } else {
                finish_arith(s, inst, (a / b) as u32, false);
            }
        }
        Divwu => {
            let s = &mut *m.state;
            let (a, b) = (s.gpr[ra], s.gpr[rb]);
            if b == 0 {
                finish_arith(s, inst, 0, true);
            } else {
                finish_arith(s, inst, a / b, false);
            }
        }

        // Logical
        And => logical(m.state, inst, |s, b| s & b),
        Andc => logical(m.state, inst, |s, b| s & !b),
        Or => logical(m.state, inst, |s, b| s | b),
        Orc => logical(m.state, inst, |s, b| s | !b),
        Nor => logical(m.state, inst, |s, b| !(s | b)),
        Nand => logical(m.state, inst, |s, b| !(s & b)),
        Xor => logical(m.state, inst, |s, b| s ^ b),
        Eqv => logical(m.state, inst, |s, b| !(s ^ b)),
        Andi => {
            let s = &mut *m.state;
            let result = s.gpr[rd] & inst.uimm();
            s.gpr[ra] = result;
            s.update_cr0(result);
        }
        Andis => {
            let s = &mut *m.state;
            let result = s.gpr[rd] & (inst.uimm() << 16);
            s.gpr[ra] = result;
            s.update_cr0(result);
        }
        Ori => m.state.gpr[ra] = m.state.gpr[rd] | inst.uimm(),
        Oris => m.state.gpr[ra] = m.state.gpr[rd] | (inst.uimm() << 16),
        Xori => m.state.gpr[ra] = m.state.gpr[rd] ^ inst.uimm(),
        Xoris => m.state.gpr[ra] = m.state.gpr[rd] ^ (inst.uimm() << 16),
        Extsb => {
            let s = &mut *m.state;
            let result = s.gpr[rd] as u8 as i8 as i32 as u32;
            finish_logical(s, inst, result);
        }
        Extsh => {
            let s = &mut *m.state;
            let result = s.gpr[rd] as u16 as i16 as i32 as u32;
            finish_logical(s, inst, result);
        }
        Cntlzw => {
            let s = &mut *m.state;
            let result = s.gpr[rd].leading_zeros();
            finish_logical(s, inst, result);
        }

        // Rotate and shift
        Rlwinm => {
            let s = &mut *m.state;
            let result = s.gpr[rd].rotate_left(inst.sh()) & rotation_mask(inst.mb(), inst.me());
            finish_logical(s, inst, result);
        }
        Rlwimi => {
            let s = &mut *m.state;
            let mask = rotation_mask(inst.mb(), inst.me());
            let result = (s.gpr[rd].rotate_left(inst.sh()) & mask) | (s.gpr[ra] & !mask);
            finish_logical(s, inst, result);
        }
        Rlwnm => {
            let s = &mut *m.state;
            let result = s.gpr[rd].rotate_left(s.gpr[rb] & 31) & rotation_mask(inst.mb(), inst.me());
            finish_logical(s, inst, result);
        }
        Slw => {
            let s = &mut *m.state;
            let n = s.gpr[rb] & 0x3F;
            let result = if n & 0x20 != 0 { 0 } else { s.gpr[rd] << n };
            finish_logical(s, inst, result);
        }
        Srw => {
            let s = &mut *m.state;
            let n = s.gpr[rb] & 0x3F;
            let result = if n & 0x20 != 0 { 0 } else { s.gpr[rd] >> n };
            finish_logical(s, inst, result);
        }
        Sraw => {
            let s = &mut *m.state;
            let n = s.gpr[rb] & 0x3F;
            let value = s.gpr[rd] as i32;
            let (result, carry) = if n & 0x20 != 0 {
                ((value >> 31) as u32, value < 0)
            } else {
                let lost = n != 0 && (value as u32) << (32 - n) != 0;
                ((value >> n) as u32, value < 0 && lost)
            };
            s.set_carry(carry);
            finish_logical(s, inst, result);
        }
        Srawi => {
            let s = &mut *m.state;
            let n = inst.sh();
            let value = s.gpr[rd] as i32;
            let lost = n != 0 && (value as u32) << (32 - n) != 0;
            s.set_carry(value < 0 && lost);
            finish_logical(s, inst, (value >> n) as u32);
        }

        // Compare
        Cmp => {
            let s = &mut *m.state;
            let field = compare_signed(s.gpr[ra] as i32, s.gpr[rb] as i32) | s.xer_so();
            s.set_cr_field(inst.crfd(), field);
        }
        Cmpl => {
            let s = &mut *m.state;
            let field = compare_unsigned(s.gpr[ra], s.gpr[rb]) | s.xer_so();
            s.set_cr_field(inst.crfd(), field);
        }
        Cmpi => {
            let s = &mut *m.state;
            let field = compare_signed(s.gpr[ra] as i32, inst.simm()) | s.xer_so();
            s.set_cr_field(inst.crfd(), field);
        }
        Cmpli => {
            let s = &mut *m.state;
            let field = compare_unsigned(s.gpr[ra], inst.uimm()) | s.xer_so();
            s.set_cr_field(inst.crfd(), field);
        }

        // Integer loads
        Lwz | Lbz | Lhz | Lha | Lwzu | Lbzu | Lhzu | Lhau | Lwzx | Lbzx | Lhzx | Lhax | Lwzux => {
            let update = matches!(kind, Lwzu | Lbzu | Lhzu | Lhau | Lwzux);
            let indexed = matches!(kind, Lwzx | Lbzx | Lhzx | Lhax | Lwzux);
            let base = if update { m.state.gpr[ra] } else { ra_or_zero(m.state, ra) };
            let offset = if indexed { m.state.gpr[rb] } else { inst.simm() as u32 };
            let ea = base.wrapping_add(offset);
            let value = match kind {
                Lwz | Lwzu | Lwzx | Lwzux => read_u32(m, ea),
                Lbz | Lbzu | Lbzx => read_u8(m, ea),
                Lhz | Lhzu | Lhzx => read_u16(m, ea),
                _ => read_u16(m, ea).map(|v| v as u16 as i16 as i32 as u32),
            };
            if let Some(value) = value {
                m.state.gpr[rd] = value;
                if update {
                    m.state.gpr[ra] = ea;
                }
            }
        }

        // Integer stores
        Stw | Stb | Sth | Stwu | Stbu | Sthu | Stwx | Stbx | Sthx | Stwux => {
            let update = matches!(kind, Stwu | Stbu | Sthu | Stwux);
            let indexed = matches!(kind, Stwx | Stbx | Sthx | Stwux);
            let base = if update { m.state.gpr[ra] } else { ra_or_zero(m.state, ra) };
            let offset = if indexed { m.state.gpr[rb] } else { inst.simm() as u32 };
            let ea = base.wrapping_add(offset);
            let value = m.state.gpr[rd];
            let done = match kind {
                Stw | Stwu | Stwx | Stwux => write_u32(m, ea, value),
                Stb | Stbu | Stbx => write_u8(m, ea, value),
                _ => write_u16(m, ea, value),
            };
            if done.is_some() && update {
                m.state.gpr[ra] = ea;
            }
        }
        Lmw => {
            let mut ea = ra_or_zero(m.state, ra).wrapping_add(inst.simm() as u32);
            for reg in rd..32 {
                match read_u32(m, ea) {
                    Some(value) => m.state.gpr[reg] = value,
                    None => break,
                }
                ea = ea.wrapping_add(4);
            }
        }
        Stmw => {
            let mut ea = ra_or_zero(m.state, ra).wrapping_add(inst.simm() as u32);
            for reg in rd..32 {
                let value = m.state.gpr[reg];
                if write_u32(m, ea, value).is_none() {
                    break;
                }
                ea = ea.wrapping_add(4);
            }
        }

        // Floating-point loads/stores
        Lfs => {
            let ea = ra_or_zero(m.state, ra).wrapping_add(inst.simm() as u32);
            if let Some(bits) = read_u32(m, ea) {
                m.state.fpr[rd] = f32::from_bits(bits) as f64;
            }
        }
        Lfd | Lfdx => {
            let offset = if kind == Lfdx { m.state.gpr[rb] } else { inst.simm() as u32 };
            let ea = ra_or_zero(m.state, ra).wrapping_add(offset);
            if let Some(bits) = read_u64(m, ea) {
                m.state.fpr[rd] = f64::from_bits(bits);
            }
        }
        Stfs => {
            let ea = ra_or_zero(m.state, ra).wrapping_add(inst.simm() as u32);
            let bits = (m.state.fpr[rd] as f32).to_bits();
            let _ = write_u32(m, ea, bits);
        }
        Stfd | Stfdx => {
            let offset = if kind == Stfdx { m.state.gpr[rb] } else { inst.simm() as u32 };
            let ea = ra_or_zero(m.state, ra).wrapping_add(offset);
            let bits = m.state.fpr[rd].to_bits();
            let _ = write_u64(m, ea, bits);
        }

        // Floating-point arithmetic
        Fadd | Fsub | Fmul | Fdiv | Fadds | Fsubs | Fmuls | Fdivs => {
            let s = &mut *m.state;
            let a = s.fpr[ra];
            let result = match kind {
                Fadd => a + s.fpr[rb],
                Fsub => a - s.fpr[rb],
                Fmul => a * s.fpr[inst.rc_reg()],
                Fdiv => a / s.fpr[rb],
                Fadds => round_single(a + s.fpr[rb]),
                Fsubs => round_single(a - s.fpr[rb]),
                Fmuls => round_single(a * s.fpr[inst.rc_reg()]),
                _ => round_single(a / s.fpr[rb]),
            };
            s.fpr[rd] = result;
            fp_record(s, inst);
        }
        Fmr => {
            let s = &mut *m.state;
            s.fpr[rd] = s.fpr[rb];
            fp_record(s, inst);
        }
        Fneg => {
            let s = &mut *m.state;
            s.fpr[rd] = f64::from_bits(s.fpr[rb].to_bits() ^ SIGN_BIT);
            fp_record(s, inst);
        }
        Fabs => {
            let s = &mut *m.state;
            s.fpr[rd] = f64::from_bits(s.fpr[rb].to_bits() & !SIGN_BIT);
            fp_record(s, inst);
        }
        Frsp => {
            let s = &mut *m.state;
            s.fpr[rd] = round_single(s.fpr[rb]);
            fp_record(s, inst);
        }
        Fcmpu => {
            let s = &mut *m.state;
            let (a, b) = (s.fpr[ra], s.fpr[rb]);
            let field = if a.is_nan() || b.is_nan() {
                CR_SO
            } else if a < b {
                CR_LT
            } else if a > b {
                CR_GT
            } else {
                CR_EQ
            };
            s.fpscr = (s.fpscr & !0xF000) | (field << 12);
            s.set_cr_field(inst.crfd(), field);
        }

        // Branches
        B => {
            let s = &mut *m.state;
            let target = if inst.aa() { inst.li() as u32 } else { s.pc.wrapping_add(inst.li() as u32) };
            if inst.lk() {
                s.lr = s.pc.wrapping_add(4);
            }
            s.npc = target;
        }
        Bc => {
            let s = &mut *m.state;
            let taken = branch_condition(s, inst, true);
            if inst.lk() {
                s.lr = s.pc.wrapping_add(4);
            }
            if taken {
                s.npc = if inst.aa() { inst.bd() as u32 } else { s.pc.wrapping_add(inst.bd() as u32) };
            }
        }
        Bclr => {
            let s = &mut *m.state;
            let target = s.lr & !3;
            let taken = branch_condition(s, inst, true);
            if inst.lk() {
                s.lr = s.pc.wrapping_add(4);
            }
            if taken {
                s.npc = target;
            }
        }
        Bcctr => {
            let s = &mut *m.state;
            let taken = branch_condition(s, inst, false);
            if inst.lk() {
                s.lr = s.pc.wrapping_add(4);
            }
            if taken {
                s.npc = s.ctr & !3;
            }
        }

        // Condition register
        Mcrf => {
            let s = &mut *m.state;
            let field = s.cr_field(inst.crfs());
            s.set_cr_field(inst.crfd(), field);
        }
        Crand | Crandc | Creqv | Crnand | Crnor | Cror | Crorc | Crxor => {
            let s = &mut *m.state;
            let (a, b) = (s.cr_bit(inst.crba()), s.cr_bit(inst.crbb()));
            let result = match kind {
                Crand => a & b,
                Crandc => a & !b,
                Creqv => !(a ^ b),
                Crnand => !(a & b),
                Crnor => !(a | b),
                Cror => a | b,
                Crorc => a | !b,
                _ => a ^ b,
            };
            s.set_cr_bit(inst.crbd(), result);
        }

        // System
        Mfspr => {
            let s = &mut *m.state;
            s.gpr[rd] = read_spr(s, inst.spr());
        }
        Mtspr => {
            let s = &mut *m.state;
            let value = s.gpr[rd];
            write_spr(s, inst.spr(), value);
        }
        Mfcr => m.state.gpr[rd] = m.state.cr,
        Mtcrf => {
            let s = &mut *m.state;
            let crm = inst.crm();
            let mut mask = 0u32;
            for field in 0..8 {
                if crm & (0x80 >> field) != 0 {
                    mask |= 0xF000_0000 >> (4 * field);
                }
            }
            s.cr = (s.cr & !mask) | (s.gpr[rd] & mask);
        }
        Mfmsr => {
            let s = &mut *m.state;
            if privileged(s) {
                s.gpr[rd] = s.msr;
            }
        }
        Mtmsr => {
            let s = &mut *m.state;
            if privileged(s) {
                s.msr = s.gpr[rd];
            }
        }
        Sc => {
            let s = &mut *m.state;
            s.exceptions |= EXCEPTION_SYSCALL;
            exception::check_exceptions(s);
        }
        Rfi => {
            let s = &mut *m.state;
            if privileged(s) {
                const MASK: u32 = 0x87C0_FFFF;
                s.msr = ((s.msr & !MASK) | (s.srr1 & MASK)) & 0xFFFB_FFFF;
                s.npc = s.srr0 & !3;
            }
        }
        Tw | Twi => {
            let s = &mut *m.state;
            let b = if kind == Tw { s.gpr[rb] } else { inst.simm() as u32 };
            if trap_condition(inst.to(), s.gpr[ra], b) {
                exception::raise_program(s, PROGRAM_TRAP);
            }
        }
        Isync | Sync | Eieio | Dcbf | Dcbst => {}
        Icbi => {
            let ea = ra_or_zero(m.state, ra).wrapping_add(m.state.gpr[rb]);
            if let Ok(paddr) = m.bus.translate(ea, AccessKind::Read, m.state.msr) {
                m.invalidations.push((paddr & !31, 32));
            }
        }
        Dcbz => {
            let ea = ra_or_zero(m.state, ra).wrapping_add(m.state.gpr[rb]) & !31;
            if let Some(paddr) = data_address(m, ea, true) {
                for offset in (0..32).step_by(8) {
                    m.bus.write64(paddr + offset, 0);
                }
            }
        }

        Invalid => {
            log::debug!("[Interpreter] illegal instruction at {:#010x}", m.state.pc);
            exception::raise_program(m.state, PROGRAM_ILLEGAL);
        }
    }
}

#[inline(always)]
fn logical(state: &mut GuestState, inst: Inst, op: impl Fn(u32, u32) -> u32) {
    let result = op(state.gpr[inst.rs()], state.gpr[inst.rb()]);
    finish_logical(state, inst, result);
}

/// Fetch, decode and execute the instruction at `pc`, delivering any
/// exception it raises. Charges the instruction's cycles.
pub fn step(m: &mut Machine<'_>) {
    let pc = m.state.pc;
    let paddr = match m.bus.translate(pc, AccessKind::Fetch, m.state.msr) {
        Ok(paddr) => paddr,
        Err(_) => {
            m.state.npc = pc;
            m.state.exceptions |= EXCEPTION_ISI;
            exception::check_exceptions(m.state);
            return;
        }
    };
    let inst = Inst(m.bus.read32(paddr));
    let kind = decode::decode(inst.0).unwrap_or(OpKind::Invalid);
    let info = kind.info();
    m.state.charge(info.cycles, info.has(FL_LOADSTORE) as u32, info.has(FL_USE_FPU) as u32);

    m.state.npc = pc.wrapping_add(4);
    if let Some(hook) = m.hooks.try_replace(pc) {
        m.hooks.execute(hook.index, m.state, m.bus);
        if hook.kind == crate::hle::HookKind::Replace {
            m.state.pc = m.state.npc;
            return;
        }
    }

    if info.has(FL_USE_FPU) && m.state.msr & MSR_FP == 0 {
        m.state.exceptions |= EXCEPTION_FPU_UNAVAILABLE;
        exception::check_exceptions(m.state);
        return;
    }

    execute(m, inst, kind);

    if m.state.exceptions & SYNCHRONOUS_EXCEPTIONS != 0 {
        exception::check_exceptions(m.state);
    } else {
        m.state.pc = m.state.npc;
    }
}

/// Pure interpreter CPU core
#[derive(Default)]
pub struct Interpreter {
    instructions: u64,
}

impl Interpreter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn instructions(&self) -> u64 {
        self.instructions
    }
}

impl CpuCore for Interpreter {
    fn name(&self) -> &'static str {
        "interpreter"
    }

    fn run(&mut self, m: &mut Machine<'_>) {
        // Resuming on a breakpoint steps over it
        let mut skip_breakpoint = m.breakpoints.is_address_breakpoint(m.state.pc);
        while m.control.is_running() {
            m.advance();
            if m.timing.deadline_reached(m.state) {
                break;
            }
            while m.state.downcount > 0 && m.control.is_running() {
                if !skip_breakpoint && m.breakpoints.is_address_breakpoint(m.state.pc) && m.check_breakpoint() {
                    return;
                }
                skip_breakpoint = false;
                step(m);
                self.instructions += 1;
                m.invalidations.clear();
            }
        }
    }

    fn single_step(&mut self, m: &mut Machine<'_>) {
        m.advance();
        step(m);
        self.instructions += 1;
        m.invalidations.clear();
    }

    fn clear_cache(&mut self) {}

    fn invalidate(&mut self, _address: u32, _length: u32) {}
}
