//! Instruction word views and the decode tables.
//!
//! MIPS instruction formats (all 32-bit):
//!
//! R-type: [opcode:6][rs:5][rt:5][rd:5][sa:5][funct:6]
//! I-type: [opcode:6][rs:5][rt:5][imm:16]
//! J-type: [opcode:6][target:26]
//!
//! Decoding is a two-level table lookup on the primary opcode (bits 31..26)
//! with secondary dispatch on `funct` (SPECIAL), the `rt` field (REGIMM) or
//! the `rs` field (COPz). The result is a dense [`Op`] tag; execution is a
//! central match on that tag, and the block cache stores the tag as the
//! per-entry dispatch handle.

/// A raw 32-bit instruction word with named field accessors, so that
/// execution code reads cleanly. Covers the R/I/J views in one wrapper.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Instruction(pub u32);

impl Instruction {
    pub fn primary(self) -> u32 {
        (self.0 >> 26) & 0x3F
    }
    pub fn rs(self) -> usize {
        ((self.0 >> 21) & 0x1F) as usize
    }
    pub fn rt(self) -> usize {
        ((self.0 >> 16) & 0x1F) as usize
    }
    pub fn rd(self) -> usize {
        ((self.0 >> 11) & 0x1F) as usize
    }
    pub fn sa(self) -> u32 {
        (self.0 >> 6) & 0x1F
    }
    pub fn funct(self) -> u32 {
        self.0 & 0x3F
    }
    pub fn imm(self) -> u16 {
        self.0 as u16
    }
    /// Sign-extended 16-bit immediate.
    pub fn imm_sext(self) -> i64 {
        i64::from(self.imm() as i16)
    }
    /// Sign-extended branch displacement: immediate times four.
    pub fn branch_offset(self) -> i64 {
        i64::from(self.imm() as i16) << 2
    }
    /// J-type 26-bit target field.
    pub fn target(self) -> u32 {
        self.0 & 0x03FF_FFFF
    }
    /// Coprocessor number encoded in the primary opcode (COPz, LWCz, SWCz).
    pub fn cop(self) -> usize {
        ((self.0 >> 26) & 3) as usize
    }
    pub fn raw(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#010X}", self.0)
    }
}

/// Decoded instruction identifier.
///
/// The coprocessor move/branch families (Mfc, Mtc, Bcf, Lwc, ...) are one
/// tag each; the coprocessor number comes out of the instruction word at
/// execution time. The MIPS III half of the table only decodes when the
/// core is configured 64-bit — see [`Op::decode`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Op {
    // MIPS I
    Add,
    Addu,
    Addi,
    Addiu,
    And,
    Andi,
    Div,
    Divu,
    Mult,
    Multu,
    Nor,
    Or,
    Ori,
    Sll,
    Sllv,
    Sra,
    Srav,
    Srl,
    Srlv,
    Sub,
    Subu,
    Xor,
    Xori,
    Lui,
    Slt,
    Sltu,
    Slti,
    Sltiu,
    Beq,
    Bne,
    Bgtz,
    Blez,
    Bgez,
    Bgezal,
    Bltz,
    Bltzal,
    J,
    Jal,
    Jr,
    Jalr,
    Syscall,
    Break,
    Lb,
    Lbu,
    Lh,
    Lhu,
    Lw,
    Lwl,
    Lwr,
    Lwc,
    Sb,
    Sh,
    Sw,
    Swl,
    Swr,
    Swc,
    Mfhi,
    Mflo,
    Mthi,
    Mtlo,
    Cop,
    Mfc,
    Cfc,
    Mtc,
    Ctc,
    Bcf,
    Bct,
    Nop,

    // MIPS III
    Bcfl,
    Bctl,
    Beql,
    Bnel,
    Bgezl,
    Bgezall,
    Bgtzl,
    Blezl,
    Bltzl,
    Bltzall,
    Cache,
    Dadd,
    Daddu,
    Daddi,
    Daddiu,
    Dsub,
    Dsubu,
    Dmult,
    Dmultu,
    Ddiv,
    Ddivu,
    Dsll,
    Dsll32,
    Dsllv,
    Dsra,
    Dsra32,
    Dsrav,
    Dsrl,
    Dsrl32,
    Dsrlv,
    Dmfc,
    Dmtc,
    Ld,
    Ldc,
    Ldl,
    Ldr,
    Lwu,
    Ll,
    Lld,
    Sd,
    Sdc,
    Sdl,
    Sdr,
    Sc,
    Scd,
    Sync,

    Unknown,
}

fn decode_special(inst: Instruction, mips3: bool) -> Op {
    // Canonical NOP: SLL r0, r0, 0.
    if inst.funct() == 0 && inst.rd() == 0 && inst.sa() == 0 {
        return Op::Nop;
    }

    let gated = |op| if mips3 { op } else { Op::Unknown };
    match inst.funct() {
        0x00 => Op::Sll,
        0x02 => Op::Srl,
        0x03 => Op::Sra,
        0x04 => Op::Sllv,
        0x06 => Op::Srlv,
        0x07 => Op::Srav,
        0x08 => Op::Jr,
        0x09 => Op::Jalr,
        0x0C => Op::Syscall,
        0x0D => Op::Break,
        0x0F => gated(Op::Sync),
        0x10 => Op::Mfhi,
        0x11 => Op::Mthi,
        0x12 => Op::Mflo,
        0x13 => Op::Mtlo,
        0x14 => gated(Op::Dsllv),
        0x16 => gated(Op::Dsrlv),
        0x17 => gated(Op::Dsrav),
        0x18 => Op::Mult,
        0x19 => Op::Multu,
        0x1A => Op::Div,
        0x1B => Op::Divu,
        0x1C => gated(Op::Dmult),
        0x1D => gated(Op::Dmultu),
        0x1E => gated(Op::Ddiv),
        0x1F => gated(Op::Ddivu),
        0x20 => Op::Add,
        0x21 => Op::Addu,
        0x22 => Op::Sub,
        0x23 => Op::Subu,
        0x24 => Op::And,
        0x25 => Op::Or,
        0x26 => Op::Xor,
        0x27 => Op::Nor,
        0x2A => Op::Slt,
        0x2B => Op::Sltu,
        0x2C => gated(Op::Dadd),
        0x2D => gated(Op::Daddu),
        0x2E => gated(Op::Dsub),
        0x2F => gated(Op::Dsubu),
        0x38 => gated(Op::Dsll),
        0x3A => gated(Op::Dsrl),
        0x3B => gated(Op::Dsra),
        0x3C => gated(Op::Dsll32),
        0x3E => gated(Op::Dsrl32),
        0x3F => gated(Op::Dsra32),
        _ => Op::Unknown,
    }
}

/// REGIMM: bit 16 selects the BGEZ family over BLTZ, bit 20 selects the
/// linking variant, bit 17 selects "likely".
fn decode_regimm(inst: Instruction, mips3: bool) -> Op {
    let rt = inst.rt();
    let bgez = rt & 0x01 != 0;
    let likely = rt & 0x02 != 0;
    let link = rt & 0x10 != 0;
    if rt & !0x13 != 0 {
        // Trap encodings (TGEI etc.) and reserved rows.
        return Op::Unknown;
    }
    if likely && !mips3 {
        return Op::Unknown;
    }
    match (link, likely, bgez) {
        (false, false, false) => Op::Bltz,
        (false, false, true) => Op::Bgez,
        (false, true, false) => Op::Bltzl,
        (false, true, true) => Op::Bgezl,
        (true, false, false) => Op::Bltzal,
        (true, false, true) => Op::Bgezal,
        (true, true, false) => Op::Bltzall,
        (true, true, true) => Op::Bgezall,
    }
}

/// COPz: bit 25 marks a coprocessor command; otherwise the `rs` field
/// selects the move flavor, and for BCz the low two bits of `rt` pick
/// false/true and plain/likely.
fn decode_cop(inst: Instruction, mips3: bool) -> Op {
    if inst.0 & (1 << 25) != 0 {
        return Op::Cop;
    }
    let gated = |op| if mips3 { op } else { Op::Unknown };
    match inst.rs() {
        0x00 => Op::Mfc,
        0x01 => gated(Op::Dmfc),
        0x02 => Op::Cfc,
        0x04 => Op::Mtc,
        0x05 => gated(Op::Dmtc),
        0x06 => Op::Ctc,
        0x08 => match inst.rt() & 3 {
            0 => Op::Bcf,
            1 => Op::Bct,
            2 => gated(Op::Bcfl),
            _ => gated(Op::Bctl),
        },
        _ => Op::Unknown,
    }
}

impl Op {
    /// Classify an instruction word. `mips3` gates the MIPS III half of the
    /// table: with it clear, branch-likely, doubleword, CACHE, LL/SC and
    /// the LD/SD family all decode to [`Op::Unknown`], and the 0x30..0x33 /
    /// 0x38..0x3B primary rows read as LWCz/SWCz instead of LL/SC.
    pub fn decode(word: u32, mips3: bool) -> Op {
        let inst = Instruction(word);
        let gated = |op| if mips3 { op } else { Op::Unknown };
        match inst.primary() {
            0x00 => decode_special(inst, mips3),
            0x01 => decode_regimm(inst, mips3),
            0x02 => Op::J,
            0x03 => Op::Jal,
            0x04 => Op::Beq,
            0x05 => Op::Bne,
            0x06 => Op::Blez,
            0x07 => Op::Bgtz,
            0x08 => Op::Addi,
            0x09 => Op::Addiu,
            0x0A => Op::Slti,
            0x0B => Op::Sltiu,
            0x0C => Op::Andi,
            0x0D => Op::Ori,
            0x0E => Op::Xori,
            0x0F => Op::Lui,
            0x10..=0x13 => decode_cop(inst, mips3),
            0x14 => gated(Op::Beql),
            0x15 => gated(Op::Bnel),
            0x16 => gated(Op::Blezl),
            0x17 => gated(Op::Bgtzl),
            0x18 => gated(Op::Daddi),
            0x19 => gated(Op::Daddiu),
            0x1A => gated(Op::Ldl),
            0x1B => gated(Op::Ldr),
            0x20 => Op::Lb,
            0x21 => Op::Lh,
            0x22 => Op::Lwl,
            0x23 => Op::Lw,
            0x24 => Op::Lbu,
            0x25 => Op::Lhu,
            0x26 => Op::Lwr,
            0x27 => gated(Op::Lwu),
            0x28 => Op::Sb,
            0x29 => Op::Sh,
            0x2A => Op::Swl,
            0x2B => Op::Sw,
            0x2C => gated(Op::Sdl),
            0x2D => gated(Op::Sdr),
            0x2E => Op::Swr,
            0x2F => gated(Op::Cache),
            0x30 => {
                if mips3 {
                    Op::Ll
                } else {
                    Op::Lwc
                }
            }
            0x31 | 0x32 => Op::Lwc,
            // LWC3 exists on MIPS I only; MIPS III reuses the row for PREF,
            // which this engine does not implement.
            0x33 => {
                if mips3 {
                    Op::Unknown
                } else {
                    Op::Lwc
                }
            }
            0x34 => gated(Op::Lld),
            0x35 | 0x36 => gated(Op::Ldc),
            0x37 => gated(Op::Ld),
            0x38 => {
                if mips3 {
                    Op::Sc
                } else {
                    Op::Swc
                }
            }
            0x39 | 0x3A => Op::Swc,
            0x3B => {
                if mips3 {
                    Op::Unknown
                } else {
                    Op::Swc
                }
            }
            0x3C => gated(Op::Scd),
            0x3D | 0x3E => gated(Op::Sdc),
            0x3F => gated(Op::Sd),
            _ => Op::Unknown,
        }
    }

    /// True for every instruction that transfers control: conditional,
    /// unconditional and likely branches, jumps, and SYSCALL/BREAK (which
    /// always vector). Block construction stops at the first of these.
    pub fn is_branch(self) -> bool {
        self.has_delay_slot() || matches!(self, Op::Syscall | Op::Break)
    }

    /// Same set as [`Op::is_branch`] minus SYSCALL/BREAK: the instructions
    /// whose following slot executes before control transfers.
    pub fn has_delay_slot(self) -> bool {
        matches!(
            self,
            Op::Beq
                | Op::Bne
                | Op::Bgtz
                | Op::Blez
                | Op::Bgez
                | Op::Bgezal
                | Op::Bltz
                | Op::Bltzal
                | Op::J
                | Op::Jal
                | Op::Jr
                | Op::Jalr
                | Op::Bcf
                | Op::Bct
                | Op::Bcfl
                | Op::Bctl
                | Op::Beql
                | Op::Bnel
                | Op::Bgezl
                | Op::Bgezall
                | Op::Bgtzl
                | Op::Blezl
                | Op::Bltzl
                | Op::Bltzall
        )
    }

    /// True for the branch-likely variants, which nullify their delay slot
    /// when the condition is false.
    pub fn is_likely(self) -> bool {
        matches!(
            self,
            Op::Bcfl
                | Op::Bctl
                | Op::Beql
                | Op::Bnel
                | Op::Bgezl
                | Op::Bgezall
                | Op::Bgtzl
                | Op::Blezl
                | Op::Bltzl
                | Op::Bltzall
        )
    }
}
