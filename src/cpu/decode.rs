//! Instruction decoder
//!
//! Decodes the Gekko subset supported by the interpreter and both JIT
//! backends into an `OpKind` tag plus a static semantic descriptor
//! (cycle cost and flags).

/// Raw instruction word with field accessors (IBM bit numbering translated
/// to shifts)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Inst(pub u32);

impl Inst {
    #[inline(always)]
    pub fn opcd(self) -> u32 {
        self.0 >> 26
    }
    /// rD / rS / frD / frS / TO / BO
    #[inline(always)]
    pub fn rd(self) -> usize {
        ((self.0 >> 21) & 0x1F) as usize
    }
    #[inline(always)]
    pub fn rs(self) -> usize {
        self.rd()
    }
    /// rA / frA / BI
    #[inline(always)]
    pub fn ra(self) -> usize {
        ((self.0 >> 16) & 0x1F) as usize
    }
    /// rB / frB / SH
    #[inline(always)]
    pub fn rb(self) -> usize {
        ((self.0 >> 11) & 0x1F) as usize
    }
    /// frC (A-form)
    #[inline(always)]
    pub fn rc_reg(self) -> usize {
        ((self.0 >> 6) & 0x1F) as usize
    }
    /// Record bit
    #[inline(always)]
    pub fn rc(self) -> bool {
        self.0 & 1 != 0
    }
    #[inline(always)]
    pub fn oe(self) -> bool {
        (self.0 >> 10) & 1 != 0
    }
    #[inline(always)]
    pub fn lk(self) -> bool {
        self.0 & 1 != 0
    }
    #[inline(always)]
    pub fn aa(self) -> bool {
        (self.0 >> 1) & 1 != 0
    }
    #[inline(always)]
    pub fn simm(self) -> i32 {
        self.0 as u16 as i16 as i32
    }
    #[inline(always)]
    pub fn uimm(self) -> u32 {
        self.0 & 0xFFFF
    }
    /// Branch displacement of `b` (sign-extended, word aligned)
    #[inline(always)]
    pub fn li(self) -> i32 {
        ((self.0 & 0x03FF_FFFC) << 6) as i32 >> 6
    }
    /// Branch displacement of `bc`
    #[inline(always)]
    pub fn bd(self) -> i32 {
        (self.0 & 0xFFFC) as u16 as i16 as i32
    }
    #[inline(always)]
    pub fn bo(self) -> u32 {
        (self.0 >> 21) & 0x1F
    }
    #[inline(always)]
    pub fn bi(self) -> u32 {
        (self.0 >> 16) & 0x1F
    }
    /// crfD
    #[inline(always)]
    pub fn crfd(self) -> u32 {
        (self.0 >> 23) & 7
    }
    /// crfS (mcrf)
    #[inline(always)]
    pub fn crfs(self) -> u32 {
        (self.0 >> 18) & 7
    }
    /// crbD / crbA / crbB
    #[inline(always)]
    pub fn crbd(self) -> u32 {
        (self.0 >> 21) & 0x1F
    }
    #[inline(always)]
    pub fn crba(self) -> u32 {
        (self.0 >> 16) & 0x1F
    }
    #[inline(always)]
    pub fn crbb(self) -> u32 {
        (self.0 >> 11) & 0x1F
    }
    #[inline(always)]
    pub fn sh(self) -> u32 {
        (self.0 >> 11) & 0x1F
    }
    #[inline(always)]
    pub fn mb(self) -> u32 {
        (self.0 >> 6) & 0x1F
    }
    #[inline(always)]
    pub fn me(self) -> u32 {
        (self.0 >> 1) & 0x1F
    }
    /// SPR number with the two halves swapped back
    #[inline(always)]
    pub fn spr(self) -> u32 {
        ((self.0 >> 16) & 0x1F) | (((self.0 >> 11) & 0x1F) << 5)
    }
    #[inline(always)]
    pub fn crm(self) -> u32 {
        (self.0 >> 12) & 0xFF
    }
    #[inline(always)]
    pub fn to(self) -> u32 {
        (self.0 >> 21) & 0x1F
    }
    #[inline(always)]
    pub fn xo10(self) -> u32 {
        (self.0 >> 1) & 0x3FF
    }
    #[inline(always)]
    pub fn xo9(self) -> u32 {
        (self.0 >> 1) & 0x1FF
    }
    #[inline(always)]
    pub fn xo5(self) -> u32 {
        (self.0 >> 1) & 0x1F
    }
}

/// Mask covering IBM bits `mb..=me`, wrapping when `me < mb`
#[inline(always)]
pub fn rotation_mask(mb: u32, me: u32) -> u32 {
    let begin = 0xFFFF_FFFFu32 >> mb;
    let end = if me >= 31 { 0 } else { 0xFFFF_FFFFu32 >> (me + 1) };
    let mask = begin ^ end;
    if me < mb {
        !mask
    } else {
        mask
    }
}

// ============================================================================
// Semantic table
// ============================================================================

/// Instruction ends the block
pub const FL_ENDBLOCK: u32 = 1 << 0;
/// Control-flow instruction
pub const FL_BRANCH: u32 = 1 << 1;
/// Requires MSR[FP]
pub const FL_USE_FPU: u32 = 1 << 2;
/// Accesses guest memory and can raise DSI
pub const FL_LOADSTORE: u32 = 1 << 3;
/// Writes cr0 (unconditionally, or through the record bit)
pub const FL_SET_CR0: u32 = 1 << 4;
/// Writes the CR field named by crfD
pub const FL_SET_CRN: u32 = 1 << 5;
/// Can raise a program exception
pub const FL_PROGRAM_EXCEPTION: u32 = 1 << 6;
/// Supervisor-only
pub const FL_PRIVILEGED: u32 = 1 << 7;
/// Honours the record (Rc) bit
pub const FL_RC_BIT: u32 = 1 << 8;
/// Honours the OE bit
pub const FL_OE_BIT: u32 = 1 << 9;

/// Static descriptor of one instruction form
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OpInfo {
    pub name: &'static str,
    pub cycles: u32,
    pub flags: u32,
}

impl OpInfo {
    #[inline(always)]
    pub fn has(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }
}

/// Decoded instruction form
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OpKind {
    // Integer arithmetic
    Addi, Addis, Addic, AddicRc, Subfic, Mulli,
    Add, Addc, Adde, Addze, Addme, Subf, Subfc, Subfe, Subfze, Neg,
    Mullw, Mulhw, Mulhwu, Divw, Divwu,
    // Logical
    And, Andc, Or, Orc, Nor, Nand, Xor, Eqv,
    Andi, Andis, Ori, Oris, Xori, Xoris,
    Extsb, Extsh, Cntlzw,
    // Rotate and shift
    Rlwinm, Rlwimi, Rlwnm, Slw, Srw, Sraw, Srawi,
    // Compare
    Cmp, Cmpl, Cmpi, Cmpli,
    // Integer load/store
    Lwz, Lwzu, Lwzx, Lwzux, Lbz, Lbzu, Lbzx, Lhz, Lhzu, Lhzx, Lha, Lhau, Lhax,
    Stw, Stwu, Stwx, Stwux, Stb, Stbu, Stbx, Sth, Sthu, Sthx,
    Lmw, Stmw,
    // Floating-point load/store
    Lfs, Lfd, Lfdx, Stfs, Stfd, Stfdx,
    // Floating-point arithmetic
    Fadd, Fsub, Fmul, Fdiv, Fadds, Fsubs, Fmuls, Fdivs,
    Fmr, Fneg, Fabs, Frsp, Fcmpu,
    // Branch
    B, Bc, Bclr, Bcctr,
    // Condition register
    Mcrf, Crand, Crandc, Creqv, Crnand, Crnor, Cror, Crorc, Crxor,
    // System
    Mfspr, Mtspr, Mfcr, Mtcrf, Mfmsr, Mtmsr,
    Sc, Rfi, Tw, Twi,
    Isync, Sync, Eieio, Icbi, Dcbf, Dcbst, Dcbz,
    /// Undefined encoding; executing it raises an illegal-instruction
    /// program exception
    Invalid,
}

const fn info(name: &'static str, cycles: u32, flags: u32) -> OpInfo {
    OpInfo { name, cycles, flags }
}

const INT_RC: u32 = FL_RC_BIT | FL_SET_CR0;
const INT_RC_OE: u32 = FL_RC_BIT | FL_SET_CR0 | FL_OE_BIT;
const BRANCH: u32 = FL_BRANCH | FL_ENDBLOCK;
const FP_RC: u32 = FL_USE_FPU | FL_RC_BIT;

impl OpKind {
    pub fn info(self) -> OpInfo {
        use OpKind::*;
        match self {
            Addi => info("addi", 1, 0),
            Addis => info("addis", 1, 0),
            Addic => info("addic", 1, 0),
            AddicRc => info("addic.", 1, FL_SET_CR0),
            Subfic => info("subfic", 1, 0),
            Mulli => info("mulli", 3, 0),
            Add => info("add", 1, INT_RC_OE),
            Addc => info("addc", 1, INT_RC_OE),
            Adde => info("adde", 1, INT_RC_OE),
            Addze => info("addze", 1, INT_RC_OE),
            Addme => info("addme", 1, INT_RC_OE),
            Subf => info("subf", 1, INT_RC_OE),
            Subfc => info("subfc", 1, INT_RC_OE),
            Subfe => info("subfe", 1, INT_RC_OE),
            Subfze => info("subfze", 1, INT_RC_OE),
            Neg => info("neg", 1, INT_RC_OE),
            Mullw => info("mullw", 5, INT_RC_OE),
            Mulhw => info("mulhw", 5, INT_RC),
            Mulhwu => info("mulhwu", 5, INT_RC),
            Divw => info("divw", 40, INT_RC_OE),
            Divwu => info("divwu", 40, INT_RC_OE),

            And => info("and", 1, INT_RC),
            Andc => info("andc", 1, INT_RC),
            Or => info("or", 1, INT_RC),
            Orc => info("orc", 1, INT_RC),
            Nor => info("nor", 1, INT_RC),
            Nand => info("nand", 1, INT_RC),
            Xor => info("xor", 1, INT_RC),
            Eqv => info("eqv", 1, INT_RC),
            Andi => info("andi.", 1, FL_SET_CR0),
            Andis => info("andis.", 1, FL_SET_CR0),
            Ori => info("ori", 1, 0),
            Oris => info("oris", 1, 0),
            Xori => info("xori", 1, 0),
            Xoris => info("xoris", 1, 0),
            Extsb => info("extsb", 1, INT_RC),
            Extsh => info("extsh", 1, INT_RC),
            Cntlzw => info("cntlzw", 1, INT_RC),

            Rlwinm => info("rlwinm", 1, INT_RC),
            Rlwimi => info("rlwimi", 1, INT_RC),
            Rlwnm => info("rlwnm", 1, INT_RC),
            Slw => info("slw", 1, INT_RC),
            Srw => info("srw", 1, INT_RC),
            Sraw => info("sraw", 1, INT_RC),
            Srawi => info("srawi", 1, INT_RC),

            Cmp => info("cmp", 1, FL_SET_CRN),
            Cmpl => info("cmpl", 1, FL_SET_CRN),
            Cmpi => info("cmpi", 1, FL_SET_CRN),
            Cmpli => info("cmpli", 1, FL_SET_CRN),

            Lwz => info("lwz", 1, FL_LOADSTORE),
            Lwzu => info("lwzu", 1, FL_LOADSTORE),
            Lwzx => info("lwzx", 1, FL_LOADSTORE),
            Lwzux => info("lwzux", 1, FL_LOADSTORE),
            Lbz => info("lbz", 1, FL_LOADSTORE),
            Lbzu => info("lbzu", 1, FL_LOADSTORE),
            Lbzx => info("lbzx", 1, FL_LOADSTORE),
            Lhz => info("lhz", 1, FL_LOADSTORE),
            Lhzu => info("lhzu", 1, FL_LOADSTORE),
            Lhzx => info("lhzx", 1, FL_LOADSTORE),
            Lha => info("lha", 1, FL_LOADSTORE),
            Lhau => info("lhau", 1, FL_LOADSTORE),
            Lhax => info("lhax", 1, FL_LOADSTORE),
            Stw => info("stw", 1, FL_LOADSTORE),
            Stwu => info("stwu", 1, FL_LOADSTORE),
            Stwx => info("stwx", 1, FL_LOADSTORE),
            Stwux => info("stwux", 1, FL_LOADSTORE),
            Stb => info("stb", 1, FL_LOADSTORE),
            Stbu => info("stbu", 1, FL_LOADSTORE),
            Stbx => info("stbx", 1, FL_LOADSTORE),
            Sth => info("sth", 1, FL_LOADSTORE),
            Sthu => info("sthu", 1, FL_LOADSTORE),
            Sthx => info("sthx", 1, FL_LOADSTORE),
            Lmw => info("lmw", 11, FL_LOADSTORE),
            Stmw => info("stmw", 11, FL_LOADSTORE),

            Lfs => info("lfs", 1, FL_LOADSTORE | FL_USE_FPU),
            Lfd => info("lfd", 1, FL_LOADSTORE | FL_USE_FPU),
            Lfdx => info("lfdx", 1, FL_LOADSTORE | FL_USE_FPU),
            Stfs => info("stfs", 1, FL_LOADSTORE | FL_USE_FPU),
            Stfd => info("stfd", 1, FL_LOADSTORE | FL_USE_FPU),
            Stfdx => info("stfdx", 1, FL_LOADSTORE | FL_USE_FPU),

            Fadd => info("fadd", 1, FP_RC),
            Fsub => info("fsub", 1, FP_RC),
            Fmul => info("fmul", 2, FP_RC),
            Fdiv => info("fdiv", 31, FP_RC),
            Fadds => info("fadds", 1, FP_RC),
            Fsubs => info("fsubs", 1, FP_RC),
            Fmuls => info("fmuls", 1, FP_RC),
            Fdivs => info("fdivs", 17, FP_RC),
            Fmr => info("fmr", 1, FP_RC),
            Fneg => info("fneg", 1, FP_RC),
            Fabs => info("fabs", 1, FP_RC),
            Frsp => info("frsp", 1, FP_RC),
            Fcmpu => info("fcmpu", 1, FL_USE_FPU | FL_SET_CRN),

            B => info("bx", 1, BRANCH),
            Bc => info("bcx", 1, BRANCH),
            Bclr => info("bclrx", 1, BRANCH),
            Bcctr => info("bcctrx", 1, BRANCH),

            Mcrf => info("mcrf", 1, FL_SET_CRN),
            Crand => info("crand", 1, 0),
            Crandc => info("crandc", 1, 0),
            Creqv => info("creqv", 1, 0),
            Crnand => info("crnand", 1, 0),
            Crnor => info("crnor", 1, 0),
            Cror => info("cror", 1, 0),
            Crorc => info("crorc", 1, 0),
            Crxor => info("crxor", 1, 0),

            Mfspr => info("mfspr", 1, 0),
            Mtspr => info("mtspr", 2, 0),
            Mfcr => info("mfcr", 1, 0),
            Mtcrf => info("mtcrf", 1, 0),
            Mfmsr => info("mfmsr", 1, FL_PRIVILEGED | FL_PROGRAM_EXCEPTION),
            Mtmsr => info("mtmsr", 1, FL_PRIVILEGED | FL_PROGRAM_EXCEPTION | FL_ENDBLOCK),
            Sc => info("sc", 2, FL_ENDBLOCK),
            Rfi => info("rfi", 2, FL_PRIVILEGED | FL_PROGRAM_EXCEPTION | FL_ENDBLOCK),
            Tw => info("tw", 2, FL_PROGRAM_EXCEPTION),
            Twi => info("twi", 2, FL_PROGRAM_EXCEPTION),
            Isync => info("isync", 1, 0),
            Sync => info("sync", 3, 0),
            Eieio => info("eieio", 1, 0),
            Icbi => info("icbi", 3, FL_ENDBLOCK),
            Dcbf => info("dcbf", 3, 0),
            Dcbst => info("dcbst", 3, 0),
            Dcbz => info("dcbz", 3, FL_LOADSTORE),

            Invalid => info("unknown", 1, FL_ENDBLOCK | FL_PROGRAM_EXCEPTION),
        }
    }

    /// Whether the record bit is meaningful and set for this encoding
    #[inline(always)]
    pub fn records(self, inst: Inst) -> bool {
        self.info().has(FL_RC_BIT) && inst.rc()
    }
}

/// Decode one instruction word. `None` for encodings outside the
/// supported set.
pub fn decode(raw: u32) -> Option<OpKind> {
    use OpKind::*;
    let inst = Inst(raw);
    let kind = match inst.opcd() {
        3 => Twi,
        7 => Mulli,
        8 => Subfic,
        10 => Cmpli,
        11 => Cmpi,
        12 => Addic,
        13 => AddicRc,
        14 => Addi,
        15 => Addis,
        16 => Bc,
        17 if raw & 2 != 0 => Sc,
        18 => B,
        19 => match inst.xo10() {
            0 => Mcrf,
            16 => Bclr,
            33 => Crnor,
            50 => Rfi,
            129 => Crandc,
            150 => Isync,
            193 => Crxor,
            225 => Crnand,
            257 => Crand,
            289 => Creqv,
            417 => Crorc,
            449 => Cror,
            528 => Bcctr,
            _ => return None,
        },
        20 => Rlwimi,
        21 => Rlwinm,
        23 => Rlwnm,
        24 => Ori,
        25 => Oris,
        26 => Xori,
        27 => Xoris,
        28 => Andi,
        29 => Andis,
        31 => return decode_31(inst),
        32 => Lwz,
        33 => Lwzu,
        34 => Lbz,
        35 => Lbzu,
        36 => Stw,
        37 => Stwu,
        38 => Stb,
        39 => Stbu,
        40 => Lhz,
        41 => Lhzu,
        42 => Lha,
        43 => Lhau,
        44 => Sth,
        45 => Sthu,
        46 => Lmw,
        47 => Stmw,
        48 => Lfs,
        50 => Lfd,
        52 => Stfs,
        54 => Stfd,
        59 => match inst.xo5() {
            18 => Fdivs,
            20 => Fsubs,
            21 => Fadds,
            25 => Fmuls,
            _ => return None,
        },
        63 => match inst.xo5() {
            18 => Fdiv,
            20 => Fsub,
            21 => Fadd,
            25 => Fmul,
            _ => match inst.xo10() {
                0 => Fcmpu,
                12 => Frsp,
                40 => Fneg,
                72 => Fmr,
                264 => Fabs,
                _ => return None,
            },
        },
        _ => return None,
    };
    Some(kind)
}

fn decode_31(inst: Inst) -> Option<OpKind> {
    use OpKind::*;
    // XO-form arithmetic: 9-bit extended opcode, OE in bit 21
    let arith = match inst.xo9() {
        8 => Some(Subfc),
        10 => Some(Addc),
        11 => Some(Mulhwu),
        40 => Some(Subf),
        75 => Some(Mulhw),
        104 => Some(Neg),
        136 => Some(Subfe),
        138 => Some(Adde),
        200 => Some(Subfze),
        202 => Some(Addze),
        234 => Some(Addme),
        235 => Some(Mullw),
        266 => Some(Add),
        459 => Some(Divwu),
        491 => Some(Divw),
        _ => None,
    };
    if arith.is_some() {
        return arith;
    }
    let kind = match inst.xo10() {
        0 => Cmp,
        4 => Tw,
        19 => Mfcr,
        23 => Lwzx,
        24 => Slw,
        26 => Cntlzw,
        28 => And,
        32 => Cmpl,
        54 => Dcbst,
        55 => Lwzux,
        60 => Andc,
        83 => Mfmsr,
        86 => Dcbf,
        87 => Lbzx,
        124 => Nor,
        144 => Mtcrf,
        146 => Mtmsr,
        151 => Stwx,
        183 => Stwux,
        215 => Stbx,
        279 => Lhzx,
        284 => Eqv,
        316 => Xor,
        339 => Mfspr,
        343 => Lhax,
        407 => Sthx,
        412 => Orc,
        444 => Or,
        467 => Mtspr,
        476 => Nand,
        536 => Srw,
        598 => Sync,
        599 => Lfdx,
        727 => Stfdx,
        792 => Sraw,
        824 => Srawi,
        854 => Eieio,
        922 => Extsh,
        954 => Extsb,
        982 => Icbi,
        1014 => Dcbz,
        _ => return None,
    };
    Some(kind)
}
