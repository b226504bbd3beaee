//! Minimal PowerPC assembler
//!
//! Encoders for the instruction forms used by the built-in demo program
//! and the test-suites. Register arguments are plain numbers; branch
//! displacements are byte offsets relative to the branch.

#[inline]
fn d_form(opcd: u32, rt: u32, ra: u32, imm: u32) -> u32 {
    (opcd << 26) | ((rt & 31) << 21) | ((ra & 31) << 16) | (imm & 0xFFFF)
}

#[inline]
fn x_form(opcd: u32, rt: u32, ra: u32, rb: u32, xo: u32, rc: bool) -> u32 {
    (opcd << 26) | ((rt & 31) << 21) | ((ra & 31) << 16) | ((rb & 31) << 11) | ((xo & 0x3FF) << 1) | rc as u32
}

#[inline]
fn a_form(opcd: u32, frt: u32, fra: u32, frb: u32, frc: u32, xo: u32) -> u32 {
    (opcd << 26) | ((frt & 31) << 21) | ((fra & 31) << 16) | ((frb & 31) << 11) | ((frc & 31) << 6) | ((xo & 31) << 1)
}

// Integer arithmetic
pub fn addi(rd: u32, ra: u32, simm: i16) -> u32 {
    d_form(14, rd, ra, simm as u16 as u32)
}
pub fn addis(rd: u32, ra: u32, simm: i16) -> u32 {
    d_form(15, rd, ra, simm as u16 as u32)
}
pub fn li(rd: u32, simm: i16) -> u32 {
    addi(rd, 0, simm)
}
pub fn lis(rd: u32, simm: i16) -> u32 {
    addis(rd, 0, simm)
}
pub fn subi(rd: u32, ra: u32, imm: i16) -> u32 {
    addi(rd, ra, imm.wrapping_neg())
}
pub fn addic(rd: u32, ra: u32, simm: i16) -> u32 {
    d_form(12, rd, ra, simm as u16 as u32)
}
pub fn addic_rc(rd: u32, ra: u32, simm: i16) -> u32 {
    d_form(13, rd, ra, simm as u16 as u32)
}
pub fn mulli(rd: u32, ra: u32, simm: i16) -> u32 {
    d_form(7, rd, ra, simm as u16 as u32)
}
pub fn add(rd: u32, ra: u32, rb: u32) -> u32 {
    x_form(31, rd, ra, rb, 266, false)
}
pub fn add_rc(rd: u32, ra: u32, rb: u32) -> u32 {
    x_form(31, rd, ra, rb, 266, true)
}
pub fn addo(rd: u32, ra: u32, rb: u32) -> u32 {
    x_form(31, rd, ra, rb, 266 | 512, false)
}
/// rD = rB - rA
pub fn subf(rd: u32, ra: u32, rb: u32) -> u32 {
    x_form(31, rd, ra, rb, 40, false)
}
pub fn subf_rc(rd: u32, ra: u32, rb: u32) -> u32 {
    x_form(31, rd, ra, rb, 40, true)
}
pub fn neg(rd: u32, ra: u32) -> u32 {
    x_form(31, rd, ra, 0, 104, false)
}
pub fn mullw(rd: u32, ra: u32, rb: u32) -> u32 {
    x_form(31, rd, ra, rb, 235, false)
}
pub fn divw(rd: u32, ra: u32, rb: u32) -> u32 {
    x_form(31, rd, ra, rb, 491, false)
}
pub fn adde(rd: u32, ra: u32, rb: u32) -> u32 {
    x_form(31, rd, ra, rb, 138, false)
}

// Logical (rA = rS op rB)
pub fn and(ra: u32, rs: u32, rb: u32) -> u32 {
    x_form(31, rs, ra, rb, 28, false)
}
pub fn andc(ra: u32, rs: u32, rb: u32) -> u32 {
    x_form(31, rs, ra, rb, 60, false)
}
pub fn or(ra: u32, rs: u32, rb: u32) -> u32 {
    x_form(31, rs, ra, rb, 444, false)
}
pub fn or_rc(ra: u32, rs: u32, rb: u32) -> u32 {
    x_form(31, rs, ra, rb, 444, true)
}
pub fn mr(ra: u32, rs: u32) -> u32 {
    or(ra, rs, rs)
}
pub fn nor(ra: u32, rs: u32, rb: u32) -> u32 {
    x_form(31, rs, ra, rb, 124, false)
}
pub fn xor(ra: u32, rs: u32, rb: u32) -> u32 {
    x_form(31, rs, ra, rb, 316, false)
}
pub fn ori(ra: u32, rs: u32, uimm: u16) -> u32 {
    d_form(24, rs, ra, uimm as u32)
}
pub fn oris(ra: u32, rs: u32, uimm: u16) -> u32 {
    d_form(25, rs, ra, uimm as u32)
}
pub fn xori(ra: u32, rs: u32, uimm: u16) -> u32 {
    d_form(26, rs, ra, uimm as u32)
}
pub fn andi_rc(ra: u32, rs: u32, uimm: u16) -> u32 {
    d_form(28, rs, ra, uimm as u32)
}
pub fn nop() -> u32 {
    ori(0, 0, 0)
}
pub fn extsb(ra: u32, rs: u32) -> u32 {
    x_form(31, rs, ra, 0, 954, false)
}
pub fn extsh(ra: u32, rs: u32) -> u32 {
    x_form(31, rs, ra, 0, 922, false)
}
pub fn cntlzw(ra: u32, rs: u32) -> u32 {
    x_form(31, rs, ra, 0, 26, false)
}

// Rotate and shift
pub fn rlwinm(ra: u32, rs: u32, sh: u32, mb: u32, me: u32) -> u32 {
    (21 << 26) | ((rs & 31) << 21) | ((ra & 31) << 16) | ((sh & 31) << 11) | ((mb & 31) << 6) | ((me & 31) << 1)
}
pub fn rlwinm_rc(ra: u32, rs: u32, sh: u32, mb: u32, me: u32) -> u32 {
    rlwinm(ra, rs, sh, mb, me) | 1
}
pub fn slwi(ra: u32, rs: u32, n: u32) -> u32 {
    rlwinm(ra, rs, n, 0, 31 - n)
}
pub fn srwi(ra: u32, rs: u32, n: u32) -> u32 {
    rlwinm(ra, rs, 32 - n, n, 31)
}
pub fn slw(ra: u32, rs: u32, rb: u32) -> u32 {
    x_form(31, rs, ra, rb, 24, false)
}
pub fn srw(ra: u32, rs: u32, rb: u32) -> u32 {
    x_form(31, rs, ra, rb, 536, false)
}
pub fn srawi(ra: u32, rs: u32, sh: u32) -> u32 {
    x_form(31, rs, ra, sh, 824, false)
}

// Compare
pub fn cmpw(crf: u32, ra: u32, rb: u32) -> u32 {
    x_form(31, (crf & 7) << 2, ra, rb, 0, false)
}
pub fn cmplw(crf: u32, ra: u32, rb: u32) -> u32 {
    x_form(31, (crf & 7) << 2, ra, rb, 32, false)
}
pub fn cmpwi(crf: u32, ra: u32, simm: i16) -> u32 {
    d_form(11, (crf & 7) << 2, ra, simm as u16 as u32)
}
pub fn cmplwi(crf: u32, ra: u32, uimm: u16) -> u32 {
    d_form(10, (crf & 7) << 2, ra, uimm as u32)
}

// Load/store
pub fn lwz(rd: u32, ra: u32, d: i16) -> u32 {
    d_form(32, rd, ra, d as u16 as u32)
}
pub fn lwzu(rd: u32, ra: u32, d: i16) -> u32 {
    d_form(33, rd, ra, d as u16 as u32)
}
pub fn lbz(rd: u32, ra: u32, d: i16) -> u32 {
    d_form(34, rd, ra, d as u16 as u32)
}
pub fn lhz(rd: u32, ra: u32, d: i16) -> u32 {
    d_form(40, rd, ra, d as u16 as u32)
}
pub fn lha(rd: u32, ra: u32, d: i16) -> u32 {
    d_form(42, rd, ra, d as u16 as u32)
}
pub fn stw(rs: u32, ra: u32, d: i16) -> u32 {
    d_form(36, rs, ra, d as u16 as u32)
}
pub fn stwu(rs: u32, ra: u32, d: i16) -> u32 {
    d_form(37, rs, ra, d as u16 as u32)
}
pub fn stb(rs: u32, ra: u32, d: i16) -> u32 {
    d_form(38, rs, ra, d as u16 as u32)
}
pub fn sth(rs: u32, ra: u32, d: i16) -> u32 {
    d_form(44, rs, ra, d as u16 as u32)
}
pub fn lwzx(rd: u32, ra: u32, rb: u32) -> u32 {
    x_form(31, rd, ra, rb, 23, false)
}
pub fn stwx(rs: u32, ra: u32, rb: u32) -> u32 {
    x_form(31, rs, ra, rb, 151, false)
}
pub fn lmw(rd: u32, ra: u32, d: i16) -> u32 {
    d_form(46, rd, ra, d as u16 as u32)
}
pub fn stmw(rs: u32, ra: u32, d: i16) -> u32 {
    d_form(47, rs, ra, d as u16 as u32)
}
pub fn lfs(frd: u32, ra: u32, d: i16) -> u32 {
    d_form(48, frd, ra, d as u16 as u32)
}
pub fn lfd(frd: u32, ra: u32, d: i16) -> u32 {
    d_form(50, frd, ra, d as u16 as u32)
}
pub fn stfs(frs: u32, ra: u32, d: i16) -> u32 {
    d_form(52, frs, ra, d as u16 as u32)
}
pub fn stfd(frs: u32, ra: u32, d: i16) -> u32 {
    d_form(54, frs, ra, d as u16 as u32)
}

// Floating point
pub fn fadd(frd: u32, fra: u32, frb: u32) -> u32 {
    a_form(63, frd, fra, frb, 0, 21)
}
pub fn fsub(frd: u32, fra: u32, frb: u32) -> u32 {
    a_form(63, frd, fra, frb, 0, 20)
}
pub fn fmul(frd: u32, fra: u32, frc: u32) -> u32 {
    a_form(63, frd, fra, 0, frc, 25)
}
pub fn fdiv(frd: u32, fra: u32, frb: u32) -> u32 {
    a_form(63, frd, fra, frb, 0, 18)
}
pub fn fadds(frd: u32, fra: u32, frb: u32) -> u32 {
    a_form(59, frd, fra, frb, 0, 21)
}
pub fn fmuls(frd: u32, fra: u32, frc: u32) -> u32 {
    a_form(59, frd, fra, 0, frc, 25)
}
pub fn fmr(frd: u32, frb: u32) -> u32 {
    x_form(63, frd, 0, frb, 72, false)
}
pub fn fneg(frd: u32, frb: u32) -> u32 {
    x_form(63, frd, 0, frb, 40, false)
}
pub fn fcmpu(crf: u32, fra: u32, frb: u32) -> u32 {
    x_form(63, (crf & 7) << 2, fra, frb, 0, false)
}

// Branches
pub const BO_ALWAYS: u32 = 20;
pub const BO_TRUE: u32 = 12;
pub const BO_FALSE: u32 = 4;
pub const BO_DNZ: u32 = 16;
pub const BO_DZ: u32 = 18;

/// CR bit numbers within cr0
pub const CR0_LT: u32 = 0;
pub const CR0_GT: u32 = 1;
pub const CR0_EQ: u32 = 2;

pub fn b(offset: i32) -> u32 {
    (18 << 26) | (offset as u32 & 0x03FF_FFFC)
}
pub fn bl(offset: i32) -> u32 {
    b(offset) | 1
}
pub fn ba(target: u32) -> u32 {
    (18 << 26) | (target & 0x03FF_FFFC) | 2
}
pub fn bc(bo: u32, bi: u32, offset: i16) -> u32 {
    (16 << 26) | ((bo & 31) << 21) | ((bi & 31) << 16) | (offset as u16 as u32 & 0xFFFC)
}
pub fn bcl(bo: u32, bi: u32, offset: i16) -> u32 {
    bc(bo, bi, offset) | 1
}
pub fn bne(offset: i16) -> u32 {
    bc(BO_FALSE, CR0_EQ, offset)
}
pub fn beq(offset: i16) -> u32 {
    bc(BO_TRUE, CR0_EQ, offset)
}
pub fn blt(offset: i16) -> u32 {
    bc(BO_TRUE, CR0_LT, offset)
}
pub fn bdnz(offset: i16) -> u32 {
    bc(BO_DNZ, 0, offset)
}
pub fn bclr(bo: u32, bi: u32) -> u32 {
    x_form(19, bo, bi, 0, 16, false)
}
pub fn blr() -> u32 {
    bclr(BO_ALWAYS, 0)
}
pub fn blrl() -> u32 {
    blr() | 1
}
pub fn bctr() -> u32 {
    x_form(19, BO_ALWAYS, 0, 0, 528, false)
}
pub fn bctrl() -> u32 {
    bctr() | 1
}

// Condition register / SPR / system
pub fn crxor(bd: u32, ba: u32, bb: u32) -> u32 {
    x_form(19, bd, ba, bb, 193, false)
}
fn spr_field(spr: u32) -> u32 {
    ((spr & 0x1F) << 5) | ((spr >> 5) & 0x1F)
}
pub fn mfspr(rd: u32, spr: u32) -> u32 {
    x_form(31, rd, 0, 0, 339, false) | (spr_field(spr) << 11)
}
pub fn mtspr(spr: u32, rs: u32) -> u32 {
    x_form(31, rs, 0, 0, 467, false) | (spr_field(spr) << 11)
}
pub fn mflr(rd: u32) -> u32 {
    mfspr(rd, 8)
}
pub fn mtlr(rs: u32) -> u32 {
    mtspr(8, rs)
}
pub fn mfctr(rd: u32) -> u32 {
    mfspr(rd, 9)
}
pub fn mtctr(rs: u32) -> u32 {
    mtspr(9, rs)
}
pub fn mfcr(rd: u32) -> u32 {
    x_form(31, rd, 0, 0, 19, false)
}
pub fn mfmsr(rd: u32) -> u32 {
    x_form(31, rd, 0, 0, 83, false)
}
pub fn mtmsr(rs: u32) -> u32 {
    x_form(31, rs, 0, 0, 146, false)
}
pub fn sc() -> u32 {
    0x4400_0002
}
pub fn rfi() -> u32 {
    x_form(19, 0, 0, 0, 50, false)
}
pub fn twi(to: u32, ra: u32, simm: i16) -> u32 {
    d_form(3, to, ra, simm as u16 as u32)
}
pub fn icbi(ra: u32, rb: u32) -> u32 {
    x_form(31, 0, ra, rb, 982, false)
}
pub fn isync() -> u32 {
    x_form(19, 0, 0, 0, 150, false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::decode::{decode, Inst, OpKind};

    #[test]
    fn test_known_encodings() {
        assert_eq!(li(3, 1), 0x3860_0001);
        assert_eq!(add(3, 3, 4), 0x7C63_2214);
        assert_eq!(blr(), 0x4E80_0020);
        assert_eq!(bctr(), 0x4E80_0420);
        assert_eq!(mflr(0), 0x7C08_02A6);
        assert_eq!(mtlr(0), 0x7C08_03A6);
        assert_eq!(mtctr(3), 0x7C69_03A6);
        assert_eq!(nop(), 0x6000_0000);
        assert_eq!(bne(-8), 0x4082_FFF8);
        assert_eq!(bdnz(-4), 0x4200_FFFC);
        assert_eq!(b(-4), 0x4BFF_FFFC);
        assert_eq!(cmpwi(0, 3, 0), 0x2C03_0000);
        assert_eq!(fadd(1, 1, 2), 0xFC21_102A);
        assert_eq!(rfi(), 0x4C00_0064);
    }

    #[test]
    fn test_roundtrip_through_decoder() {
        assert_eq!(decode(fmul(1, 2, 3)), Some(OpKind::Fmul));
        assert_eq!(Inst(fmul(1, 2, 3)).rc_reg(), 3);
        assert_eq!(decode(srawi(3, 4, 5)), Some(OpKind::Srawi));
        assert_eq!(decode(icbi(0, 3)), Some(OpKind::Icbi));
        assert_eq!(Inst(mfspr(3, 272)).spr(), 272);
    }
}
