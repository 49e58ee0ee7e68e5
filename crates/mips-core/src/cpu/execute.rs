//! Per-instruction semantics.
//!
//! `execute_op` is the central dispatch: a dense match on the decoded
//! [`Op`] tag. Handlers read their fields out of the raw word through
//! [`Instruction`] and go through the engine's register/memory helpers, so
//! the 32- vs 64-bit, load-delay and exception differences all live in one
//! place.

use crate::bus::Bus;
use crate::cpu::core::Core;
use crate::cpu::exceptions::ExceptionCode;
use crate::cpu::instruction::{Instruction, Op};

/// `beq r0, r0, -1`: the canonical busy-wait.
const IDLE_BEQ: u32 = 0x1000_FFFF;

impl Core {
    pub(crate) fn execute_op(&mut self, op: Op, word: u32, bus: &mut impl Bus) {
        let inst = Instruction(word);
        match op {
            Op::Add => self.op_add(inst, bus),
            Op::Addu => self.op_addu(inst),
            Op::Addi => self.op_addi(inst, bus),
            Op::Addiu => self.op_addiu(inst),
            Op::And => self.op_and(inst),
            Op::Andi => self.op_andi(inst),
            Op::Div => self.op_div(inst),
            Op::Divu => self.op_divu(inst),
            Op::Mult => self.op_mult(inst),
            Op::Multu => self.op_multu(inst),
            Op::Nor => self.op_nor(inst),
            Op::Or => self.op_or(inst),
            Op::Ori => self.op_ori(inst),
            Op::Sll => self.op_sll(inst),
            Op::Sllv => self.op_sllv(inst),
            Op::Sra => self.op_sra(inst),
            Op::Srav => self.op_srav(inst),
            Op::Srl => self.op_srl(inst),
            Op::Srlv => self.op_srlv(inst),
            Op::Sub => self.op_sub(inst, bus),
            Op::Subu => self.op_subu(inst),
            Op::Xor => self.op_xor(inst),
            Op::Xori => self.op_xori(inst),
            Op::Lui => self.op_lui(inst),
            Op::Slt => self.op_slt(inst),
            Op::Sltu => self.op_sltu(inst),
            Op::Slti => self.op_slti(inst),
            Op::Sltiu => self.op_sltiu(inst),
            Op::Beq => self.op_beq(inst, bus),
            Op::Bne => self.op_bne(inst, bus),
            Op::Bgtz => self.op_bgtz(inst, bus),
            Op::Blez => self.op_blez(inst, bus),
            Op::Bgez => self.op_bgez(inst, bus),
            Op::Bgezal => self.op_bgezal(inst, bus),
            Op::Bltz => self.op_bltz(inst, bus),
            Op::Bltzal => self.op_bltzal(inst, bus),
            Op::J => self.op_j(inst, bus),
            Op::Jal => self.op_jal(inst),
            Op::Jr => self.op_jr(inst, bus),
            Op::Jalr => self.op_jalr(inst, bus),
            Op::Syscall => self.trigger_exception(ExceptionCode::Syscall, bus),
            Op::Break => self.op_break(bus),
            Op::Lb => self.op_lb(inst, bus),
            Op::Lbu => self.op_lbu(inst, bus),
            Op::Lh => self.op_lh(inst, bus),
            Op::Lhu => self.op_lhu(inst, bus),
            Op::Lw => self.op_lw(inst, bus),
            Op::Lwl => self.op_lwl(inst, bus),
            Op::Lwr => self.op_lwr(inst, bus),
            Op::Lwc => self.op_lwc(inst, bus),
            Op::Sb => self.op_sb(inst, bus),
            Op::Sh => self.op_sh(inst, bus),
            Op::Sw => self.op_sw(inst, bus),
            Op::Swl => self.op_swl(inst, bus),
            Op::Swr => self.op_swr(inst, bus),
            Op::Swc => self.op_swc(inst, bus),
            Op::Mfhi => self.write_gpr64(inst.rd(), self.hi()),
            Op::Mflo => self.write_gpr64(inst.rd(), self.lo()),
            Op::Mthi => {
                let value = self.read_gpr64(inst.rs());
                self.set_hi(value);
            }
            Op::Mtlo => {
                let value = self.read_gpr64(inst.rs());
                self.set_lo(value);
            }
            Op::Cop => self.op_cop(inst, bus),
            Op::Mfc => self.op_mfc(inst, bus),
            Op::Cfc => self.op_cfc(inst, bus),
            Op::Mtc => self.op_mtc(inst, bus),
            Op::Ctc => self.op_ctc(inst, bus),
            Op::Bcf => self.op_bc(inst, bus, false, false),
            Op::Bct => self.op_bc(inst, bus, true, false),
            Op::Bcfl => self.op_bc(inst, bus, false, true),
            Op::Bctl => self.op_bc(inst, bus, true, true),
            Op::Nop => {}

            Op::Beql => self.op_beql(inst),
            Op::Bnel => self.op_bnel(inst),
            Op::Bgezl => self.op_bgezl(inst),
            Op::Bgezall => self.op_bgezall(inst),
            Op::Bgtzl => self.op_bgtzl(inst),
            Op::Blezl => self.op_blezl(inst),
            Op::Bltzl => self.op_bltzl(inst),
            Op::Bltzall => self.op_bltzall(inst),
            Op::Cache => self.op_cache(inst),
            Op::Dadd => self.op_dadd(inst, bus),
            Op::Daddu => self.op_daddu(inst),
            Op::Daddi => self.op_daddi(inst, bus),
            Op::Daddiu => self.op_daddiu(inst),
            Op::Dsub => self.op_dsub(inst, bus),
            Op::Dsubu => self.op_dsubu(inst),
            Op::Dmult => self.op_dmult(inst),
            Op::Dmultu => self.op_dmultu(inst),
            Op::Ddiv => self.op_ddiv(inst),
            Op::Ddivu => self.op_ddivu(inst),
            Op::Dsll => self.op_dsll(inst),
            Op::Dsll32 => self.op_dsll32(inst),
            Op::Dsllv => self.op_dsllv(inst),
            Op::Dsra => self.op_dsra(inst),
            Op::Dsra32 => self.op_dsra32(inst),
            Op::Dsrav => self.op_dsrav(inst),
            Op::Dsrl => self.op_dsrl(inst),
            Op::Dsrl32 => self.op_dsrl32(inst),
            Op::Dsrlv => self.op_dsrlv(inst),
            Op::Dmfc => self.op_dmfc(inst, bus),
            Op::Dmtc => self.op_dmtc(inst, bus),
            Op::Ld => self.op_ld(inst, bus),
            Op::Ldc => self.op_ldc(inst, bus),
            Op::Ldl => self.op_ldl(inst, bus),
            Op::Ldr => self.op_ldr(inst, bus),
            Op::Lwu => self.op_lwu(inst, bus),
            Op::Ll => self.op_ll(inst, bus),
            Op::Lld => self.op_lld(inst, bus),
            Op::Sd => self.op_sd(inst, bus),
            Op::Sdc => self.op_sdc(inst, bus),
            Op::Sdl => self.op_sdl(inst, bus),
            Op::Sdr => self.op_sdr(inst, bus),
            Op::Sc => self.op_sc(inst, bus),
            Op::Scd => self.op_scd(inst, bus),
            Op::Sync => {}

            Op::Unknown => self.op_unknown(word),
        }
    }

    fn op_unknown(&mut self, word: u32) {
        log::error!(
            "unknown instruction {:#010X} at PC {:#010X}",
            word,
            self.current_pc()
        );
        self.dump_trace();
        panic!("unknown instruction {word:#010X}");
    }

    // ─── 32-bit arithmetic and logic ───

    fn op_add(&mut self, inst: Instruction, bus: &mut impl Bus) {
        let rs = self.read_gpr32(inst.rs());
        let rt = self.read_gpr32(inst.rt());
        match (rs as i32).checked_add(rt as i32) {
            Some(value) => self.write_gpr32_sext(inst.rd(), value),
            None if self.config().has_exception => {
                self.trigger_exception(ExceptionCode::Overflow, bus)
            }
            None => self.write_gpr32_sext(inst.rd(), rs.wrapping_add(rt) as i32),
        }
    }

    fn op_addu(&mut self, inst: Instruction) {
        let value = self
            .read_gpr32(inst.rs())
            .wrapping_add(self.read_gpr32(inst.rt()));
        self.write_gpr32_sext(inst.rd(), value as i32);
    }

    fn op_addi(&mut self, inst: Instruction, bus: &mut impl Bus) {
        let rs = self.read_gpr32(inst.rs());
        let imm = inst.imm_sext() as i32;
        match (rs as i32).checked_add(imm) {
            Some(value) => self.write_gpr32_sext(inst.rt(), value),
            None if self.config().has_exception => {
                self.trigger_exception(ExceptionCode::Overflow, bus)
            }
            None => self.write_gpr32_sext(inst.rt(), rs.wrapping_add(imm as u32) as i32),
        }
    }

    fn op_addiu(&mut self, inst: Instruction) {
        let value = self
            .read_gpr32(inst.rs())
            .wrapping_add(inst.imm_sext() as u32);
        self.write_gpr32_sext(inst.rt(), value as i32);
    }

    fn op_sub(&mut self, inst: Instruction, bus: &mut impl Bus) {
        let rs = self.read_gpr32(inst.rs());
        let rt = self.read_gpr32(inst.rt());
        match (rs as i32).checked_sub(rt as i32) {
            Some(value) => self.write_gpr32_sext(inst.rd(), value),
            None if self.config().has_exception => {
                self.trigger_exception(ExceptionCode::Overflow, bus)
            }
            None => self.write_gpr32_sext(inst.rd(), rs.wrapping_sub(rt) as i32),
        }
    }

    fn op_subu(&mut self, inst: Instruction) {
        let value = self
            .read_gpr32(inst.rs())
            .wrapping_sub(self.read_gpr32(inst.rt()));
        self.write_gpr32_sext(inst.rd(), value as i32);
    }

    fn op_and(&mut self, inst: Instruction) {
        let value = self.read_gpr64(inst.rs()) & self.read_gpr64(inst.rt());
        self.write_gpr64(inst.rd(), value);
    }

    fn op_andi(&mut self, inst: Instruction) {
        let value = self.read_gpr64(inst.rs()) & u64::from(inst.imm());
        self.write_gpr64(inst.rt(), value);
    }

    fn op_or(&mut self, inst: Instruction) {
        let value = self.read_gpr64(inst.rs()) | self.read_gpr64(inst.rt());
        self.write_gpr64(inst.rd(), value);
    }

    fn op_ori(&mut self, inst: Instruction) {
        let value = self.read_gpr64(inst.rs()) | u64::from(inst.imm());
        self.write_gpr64(inst.rt(), value);
    }

    fn op_xor(&mut self, inst: Instruction) {
        let value = self.read_gpr64(inst.rs()) ^ self.read_gpr64(inst.rt());
        self.write_gpr64(inst.rd(), value);
    }

    fn op_xori(&mut self, inst: Instruction) {
        let value = self.read_gpr64(inst.rs()) ^ u64::from(inst.imm());
        self.write_gpr64(inst.rt(), value);
    }

    fn op_nor(&mut self, inst: Instruction) {
        let value = !(self.read_gpr64(inst.rs()) | self.read_gpr64(inst.rt()));
        self.write_gpr64(inst.rd(), value);
    }

    fn op_lui(&mut self, inst: Instruction) {
        self.write_gpr32_sext(inst.rt(), ((u32::from(inst.imm())) << 16) as i32);
    }

    fn op_slt(&mut self, inst: Instruction) {
        let value = (self.read_gpr64(inst.rs()) as i64) < (self.read_gpr64(inst.rt()) as i64);
        self.write_gpr32(inst.rd(), u32::from(value));
    }

    fn op_sltu(&mut self, inst: Instruction) {
        let value = self.read_gpr64(inst.rs()) < self.read_gpr64(inst.rt());
        self.write_gpr32(inst.rd(), u32::from(value));
    }

    fn op_slti(&mut self, inst: Instruction) {
        let value = (self.read_gpr64(inst.rs()) as i64) < inst.imm_sext();
        self.write_gpr32(inst.rt(), u32::from(value));
    }

    fn op_sltiu(&mut self, inst: Instruction) {
        let value = self.read_gpr64(inst.rs()) < inst.imm_sext() as u64;
        self.write_gpr32(inst.rt(), u32::from(value));
    }

    // ─── Shifts ───

    fn op_sll(&mut self, inst: Instruction) {
        let value = self.read_gpr32(inst.rt()) << inst.sa();
        self.write_gpr32_sext(inst.rd(), value as i32);
    }

    fn op_srl(&mut self, inst: Instruction) {
        let value = self.read_gpr32(inst.rt()) >> inst.sa();
        self.write_gpr32_sext(inst.rd(), value as i32);
    }

    fn op_sra(&mut self, inst: Instruction) {
        let value = (self.read_gpr32(inst.rt()) as i32) >> inst.sa();
        self.write_gpr32_sext(inst.rd(), value);
    }

    fn op_sllv(&mut self, inst: Instruction) {
        let value = self.read_gpr32(inst.rt()) << (self.read_gpr32(inst.rs()) & 31);
        self.write_gpr32_sext(inst.rd(), value as i32);
    }

    fn op_srlv(&mut self, inst: Instruction) {
        let value = self.read_gpr32(inst.rt()) >> (self.read_gpr32(inst.rs()) & 31);
        self.write_gpr32_sext(inst.rd(), value as i32);
    }

    fn op_srav(&mut self, inst: Instruction) {
        let value = (self.read_gpr32(inst.rt()) as i32) >> (self.read_gpr32(inst.rs()) & 31);
        self.write_gpr32_sext(inst.rd(), value);
    }

    // ─── Multiply / divide ───

    fn op_mult(&mut self, inst: Instruction) {
        let rs = i64::from(self.read_gpr32(inst.rs()) as i32);
        let rt = i64::from(self.read_gpr32(inst.rt()) as i32);
        let result = rs.wrapping_mul(rt) as u64;
        self.set_hi(((result >> 32) as u32) as i32 as i64 as u64);
        self.set_lo((result as u32) as i32 as i64 as u64);
    }

    fn op_multu(&mut self, inst: Instruction) {
        let rs = u64::from(self.read_gpr32(inst.rs()));
        let rt = u64::from(self.read_gpr32(inst.rt()));
        let result = rs.wrapping_mul(rt);
        self.set_hi(((result >> 32) as u32) as i32 as i64 as u64);
        self.set_lo((result as u32) as i32 as i64 as u64);
    }

    /// Division by zero and the INT_MIN / -1 case produce the architectural
    /// garbage values instead of trapping.
    fn op_div(&mut self, inst: Instruction) {
        let rs = self.read_gpr32(inst.rs()) as i32;
        let rt = self.read_gpr32(inst.rt()) as i32;
        let (lo, hi) = if rt == 0 {
            (if rs < 0 { 1 } else { -1 }, rs)
        } else if rs == i32::MIN && rt == -1 {
            (i32::MIN, 0)
        } else {
            (rs / rt, rs % rt)
        };
        self.set_lo(lo as i64 as u64);
        self.set_hi(hi as i64 as u64);
    }

    fn op_divu(&mut self, inst: Instruction) {
        let rs = self.read_gpr32(inst.rs());
        let rt = self.read_gpr32(inst.rt());
        let (lo, hi) = if rt == 0 {
            (u32::MAX, rs)
        } else {
            (rs / rt, rs % rt)
        };
        self.set_lo(lo as i32 as i64 as u64);
        self.set_hi(hi as i32 as i64 as u64);
    }

    // ─── Branches and jumps ───

    // Loads pending in the delay queue land before a branch is evaluated;
    // the branch itself never reads a stale destination.

    fn op_beq(&mut self, inst: Instruction, bus: &mut impl Bus) {
        self.retire_delayed_load(bus);
        if self.config().detect_idle_loops && inst.raw() == IDLE_BEQ {
            if self.fetch_silent(bus, self.current_pc().wrapping_add(4)) == Some(0) {
                self.idle_charge();
            }
        }
        if self.read_gpr64(inst.rs()) == self.read_gpr64(inst.rt()) {
            self.jump_rel(inst.branch_offset());
        }
    }

    fn op_bne(&mut self, inst: Instruction, bus: &mut impl Bus) {
        self.retire_delayed_load(bus);
        if self.read_gpr64(inst.rs()) != self.read_gpr64(inst.rt()) {
            self.jump_rel(inst.branch_offset());
        }
    }

    fn op_bgtz(&mut self, inst: Instruction, bus: &mut impl Bus) {
        self.retire_delayed_load(bus);
        if (self.read_gpr64(inst.rs()) as i64) > 0 {
            self.jump_rel(inst.branch_offset());
        }
    }

    fn op_blez(&mut self, inst: Instruction, bus: &mut impl Bus) {
        self.retire_delayed_load(bus);
        if (self.read_gpr64(inst.rs()) as i64) <= 0 {
            self.jump_rel(inst.branch_offset());
        }
    }

    fn op_bgez(&mut self, inst: Instruction, bus: &mut impl Bus) {
        self.retire_delayed_load(bus);
        if (self.read_gpr64(inst.rs()) as i64) >= 0 {
            self.jump_rel(inst.branch_offset());
        }
    }

    fn op_bltz(&mut self, inst: Instruction, bus: &mut impl Bus) {
        self.retire_delayed_load(bus);
        if (self.read_gpr64(inst.rs()) as i64) < 0 {
            self.jump_rel(inst.branch_offset());
        }
    }

    // The linking variants write `ra` whether or not the branch is taken.

    fn op_bgezal(&mut self, inst: Instruction, bus: &mut impl Bus) {
        self.retire_delayed_load(bus);
        let rs = self.read_gpr64(inst.rs()) as i64;
        self.link(31);
        if rs >= 0 {
            self.jump_rel(inst.branch_offset());
        }
    }

    fn op_bltzal(&mut self, inst: Instruction, bus: &mut impl Bus) {
        self.retire_delayed_load(bus);
        let rs = self.read_gpr64(inst.rs()) as i64;
        self.link(31);
        if rs < 0 {
            self.jump_rel(inst.branch_offset());
        }
    }

    fn op_j(&mut self, inst: Instruction, bus: &mut impl Bus) {
        let dst = ((self.current_pc().wrapping_add(4) as u32) & 0xF000_0000) | (inst.target() << 2);
        self.jump(u64::from(dst));

        if self.config().detect_idle_loops && u64::from(dst) == self.current_pc() {
            if self.fetch_silent(bus, self.current_pc().wrapping_add(4)) == Some(0) {
                self.idle_charge();
            }
        }
    }

    fn op_jal(&mut self, inst: Instruction) {
        let dst = ((self.current_pc().wrapping_add(4) as u32) & 0xF000_0000) | (inst.target() << 2);
        self.link(31);
        self.jump(u64::from(dst));
    }

    fn op_jr(&mut self, inst: Instruction, bus: &mut impl Bus) {
        let rs = self.read_gpr64(inst.rs());
        if rs & 3 != 0 && !self.config().allow_misaligned_access {
            self.raise_address_error(rs, ExceptionCode::AddressErrorLoad, bus);
            return;
        }
        self.jump(rs & !3);
    }

    fn op_jalr(&mut self, inst: Instruction, bus: &mut impl Bus) {
        let rs = self.read_gpr64(inst.rs());
        if rs & 3 != 0 && !self.config().allow_misaligned_access {
            self.raise_address_error(rs, ExceptionCode::AddressErrorLoad, bus);
            return;
        }
        self.link(inst.rd());
        self.jump(rs & !3);
    }

    fn op_break(&mut self, bus: &mut impl Bus) {
        self.trigger_exception(ExceptionCode::Breakpoint, bus);
        if !self.config().has_cop0 {
            // RSP-style BREAK: stop the core and let a host-connected slot-0
            // coprocessor latch its status bits.
            self.set_halt(true);
            self.cop_command(0, 0);
        }
    }

    // ─── Coprocessor branches ───

    fn op_bc(&mut self, inst: Instruction, bus: &mut impl Bus, on_true: bool, likely: bool) {
        let cop = inst.cop();
        if !self.is_cop_enabled(cop) {
            self.raise_cop_unusable(cop, bus);
            return;
        }
        if self.cop_flag(cop) == on_true {
            self.jump_rel(inst.branch_offset());
        } else if likely {
            self.nullify_delay_slot();
        }
    }

    // ─── Branch-likely family (64-bit cores) ───

    /// When a likely branch is not taken, the delay slot is skipped.
    fn nullify_delay_slot(&mut self) {
        self.set_next_pc(self.current_pc().wrapping_add(8));
    }

    fn op_beql(&mut self, inst: Instruction) {
        if self.read_gpr64(inst.rs()) == self.read_gpr64(inst.rt()) {
            self.jump_rel(inst.branch_offset());
        } else {
            self.nullify_delay_slot();
        }
    }

    fn op_bnel(&mut self, inst: Instruction) {
        if self.read_gpr64(inst.rs()) != self.read_gpr64(inst.rt()) {
            self.jump_rel(inst.branch_offset());
        } else {
            self.nullify_delay_slot();
        }
    }

    fn op_bgezl(&mut self, inst: Instruction) {
        if (self.read_gpr64(inst.rs()) as i64) >= 0 {
            self.jump_rel(inst.branch_offset());
        } else {
            self.nullify_delay_slot();
        }
    }

    fn op_bgezall(&mut self, inst: Instruction) {
        let rs = self.read_gpr64(inst.rs()) as i64;
        self.link(31);
        if rs >= 0 {
            self.jump_rel(inst.branch_offset());
        } else {
            self.nullify_delay_slot();
        }
    }

    fn op_bgtzl(&mut self, inst: Instruction) {
        if (self.read_gpr64(inst.rs()) as i64) > 0 {
            self.jump_rel(inst.branch_offset());
        } else {
            self.nullify_delay_slot();
        }
    }

    fn op_blezl(&mut self, inst: Instruction) {
        if (self.read_gpr64(inst.rs()) as i64) <= 0 {
            self.jump_rel(inst.branch_offset());
        } else {
            self.nullify_delay_slot();
        }
    }

    fn op_bltzl(&mut self, inst: Instruction) {
        if (self.read_gpr64(inst.rs()) as i64) < 0 {
            self.jump_rel(inst.branch_offset());
        } else {
            self.nullify_delay_slot();
        }
    }

    fn op_bltzall(&mut self, inst: Instruction) {
        let rs = self.read_gpr64(inst.rs()) as i64;
        self.link(31);
        if rs < 0 {
            self.jump_rel(inst.branch_offset());
        } else {
            self.nullify_delay_slot();
        }
    }

    // ─── Loads ───

    fn load_address(&self, inst: Instruction) -> u64 {
        self.read_gpr64(inst.rs()).wrapping_add(inst.imm_sext() as u64)
    }

    fn op_lb(&mut self, inst: Instruction, bus: &mut impl Bus) {
        let address = self.load_address(inst);
        if let Some(value) = self.load8(bus, address) {
            self.queue_delayed_load(inst.rt(), value as i8 as i64 as u64, bus);
        }
    }

    fn op_lbu(&mut self, inst: Instruction, bus: &mut impl Bus) {
        let address = self.load_address(inst);
        if let Some(value) = self.load8(bus, address) {
            self.queue_delayed_load(inst.rt(), u64::from(value), bus);
        }
    }

    fn op_lh(&mut self, inst: Instruction, bus: &mut impl Bus) {
        let address = self.load_address(inst);
        if address & 1 != 0 && !self.config().allow_misaligned_access {
            self.raise_address_error(address, ExceptionCode::AddressErrorLoad, bus);
            return;
        }
        if let Some(value) = self.load16(bus, address) {
            self.queue_delayed_load(inst.rt(), value as i16 as i64 as u64, bus);
        }
    }

    fn op_lhu(&mut self, inst: Instruction, bus: &mut impl Bus) {
        let address = self.load_address(inst);
        if address & 1 != 0 && !self.config().allow_misaligned_access {
            self.raise_address_error(address, ExceptionCode::AddressErrorLoad, bus);
            return;
        }
        if let Some(value) = self.load16(bus, address) {
            self.queue_delayed_load(inst.rt(), u64::from(value), bus);
        }
    }

    fn op_lw(&mut self, inst: Instruction, bus: &mut impl Bus) {
        let address = self.load_address(inst);
        if address & 3 != 0 && !self.config().allow_misaligned_access {
            self.raise_address_error(address, ExceptionCode::AddressErrorLoad, bus);
            return;
        }
        if let Some(value) = self.load32(bus, address) {
            self.queue_delayed_load(inst.rt(), value as i32 as i64 as u64, bus);
        }
    }

    fn op_lwu(&mut self, inst: Instruction, bus: &mut impl Bus) {
        let address = self.load_address(inst);
        if address & 3 != 0 && !self.config().allow_misaligned_access {
            self.raise_address_error(address, ExceptionCode::AddressErrorLoad, bus);
            return;
        }
        if let Some(value) = self.load32(bus, address) {
            self.write_gpr64(inst.rt(), u64::from(value));
        }
    }

    fn op_ld(&mut self, inst: Instruction, bus: &mut impl Bus) {
        let address = self.load_address(inst);
        if address & 7 != 0 && !self.config().allow_misaligned_access {
            self.raise_address_error(address, ExceptionCode::AddressErrorLoad, bus);
            return;
        }
        if let Some(value) = self.load64(bus, address) {
            self.write_gpr64(inst.rt(), value);
        }
    }

    fn op_ll(&mut self, inst: Instruction, bus: &mut impl Bus) {
        let address = self.load_address(inst);
        if address & 3 != 0 && !self.config().allow_misaligned_access {
            self.raise_address_error(address, ExceptionCode::AddressErrorLoad, bus);
            return;
        }
        if let Some(value) = self.load32(bus, address) {
            self.write_gpr64(inst.rt(), value as i32 as i64 as u64);
            self.set_ll_bit(true);
        }
    }

    fn op_lld(&mut self, inst: Instruction, bus: &mut impl Bus) {
        let address = self.load_address(inst);
        if address & 7 != 0 && !self.config().allow_misaligned_access {
            self.raise_address_error(address, ExceptionCode::AddressErrorLoad, bus);
            return;
        }
        if let Some(value) = self.load64(bus, address) {
            self.write_gpr64(inst.rt(), value);
            self.set_ll_bit(true);
        }
    }

    /// LWL merges the high bytes of a word that straddles an alignment
    /// boundary into `rt`, one byte at a time; LWR mirrors into the low
    /// bytes. Big-endian cores flip the unalignment index.
    fn op_lwl(&mut self, inst: Instruction, bus: &mut impl Bus) {
        self.retire_delayed_load(bus);

        let address = self.load_address(inst);
        let mut unalignment = (address & 3) as u32;
        if self.config().big_endian {
            unalignment = 3 - unalignment;
        }

        let mut rt = self.read_gpr32(inst.rt());
        for i in 0..=unalignment {
            if let Some(byte) = self.load8(bus, address.wrapping_add(u64::from(i))) {
                let shamt = (3 - i) * 8;
                rt = (rt & !(0xFF << shamt)) | (u32::from(byte) << shamt);
            }
        }
        self.write_gpr32_sext(inst.rt(), rt as i32);
    }

    fn op_lwr(&mut self, inst: Instruction, bus: &mut impl Bus) {
        self.retire_delayed_load(bus);

        let address = self.load_address(inst);
        let mut unalignment = 3 - (address & 3) as u32;
        if self.config().big_endian {
            unalignment = 3 - unalignment;
        }

        let mut rt = self.read_gpr32(inst.rt());
        for i in 0..=unalignment {
            if let Some(byte) = self.load8(bus, address.wrapping_sub(u64::from(i))) {
                let shamt = i * 8;
                rt = (rt & !(0xFF << shamt)) | (u32::from(byte) << shamt);
            }
        }
        self.write_gpr32_sext(inst.rt(), rt as i32);
    }

    fn op_ldl(&mut self, inst: Instruction, bus: &mut impl Bus) {
        let address = self.load_address(inst);
        let mut unalignment = (address & 7) as u32;
        if self.config().big_endian {
            unalignment = 7 - unalignment;
        }

        let mut rt = self.read_gpr64(inst.rt());
        for i in 0..=unalignment {
            if let Some(byte) = self.load8(bus, address.wrapping_add(u64::from(i))) {
                let shamt = (7 - i) * 8;
                rt = (rt & !(0xFF << shamt)) | (u64::from(byte) << shamt);
            }
        }
        self.write_gpr64(inst.rt(), rt);
    }

    fn op_ldr(&mut self, inst: Instruction, bus: &mut impl Bus) {
        let address = self.load_address(inst);
        let mut unalignment = 7 - (address & 7) as u32;
        if self.config().big_endian {
            unalignment = 7 - unalignment;
        }

        let mut rt = self.read_gpr64(inst.rt());
        for i in 0..=unalignment {
            if let Some(byte) = self.load8(bus, address.wrapping_sub(u64::from(i))) {
                let shamt = i * 8;
                rt = (rt & !(0xFF << shamt)) | (u64::from(byte) << shamt);
            }
        }
        self.write_gpr64(inst.rt(), rt);
    }

    // ─── Stores ───

    fn op_sb(&mut self, inst: Instruction, bus: &mut impl Bus) {
        let address = self.load_address(inst);
        let value = self.read_gpr32(inst.rt()) as u8;
        self.store8(bus, address, value);
    }

    fn op_sh(&mut self, inst: Instruction, bus: &mut impl Bus) {
        let address = self.load_address(inst);
        if address & 1 != 0 && !self.config().allow_misaligned_access {
            self.raise_address_error(address, ExceptionCode::AddressErrorStore, bus);
            return;
        }
        let value = self.read_gpr32(inst.rt()) as u16;
        self.store16(bus, address, value);
    }

    fn op_sw(&mut self, inst: Instruction, bus: &mut impl Bus) {
        let address = self.load_address(inst);
        if address & 3 != 0 && !self.config().allow_misaligned_access {
            self.raise_address_error(address, ExceptionCode::AddressErrorStore, bus);
            return;
        }
        let value = self.read_gpr32(inst.rt());
        self.store32(bus, address, value);
    }

    fn op_sd(&mut self, inst: Instruction, bus: &mut impl Bus) {
        let address = self.load_address(inst);
        if address & 7 != 0 && !self.config().allow_misaligned_access {
            self.raise_address_error(address, ExceptionCode::AddressErrorStore, bus);
            return;
        }
        let value = self.read_gpr64(inst.rt());
        self.store64(bus, address, value);
    }

    fn op_sc(&mut self, inst: Instruction, bus: &mut impl Bus) {
        let address = self.load_address(inst);
        if address & 3 != 0 && !self.config().allow_misaligned_access {
            self.raise_address_error(address, ExceptionCode::AddressErrorStore, bus);
            return;
        }
        let value = self.read_gpr32(inst.rt());
        let success = self.ll_bit();
        if success {
            self.store32(bus, address, value);
        }
        self.write_gpr64(inst.rt(), u64::from(success));
    }

    fn op_scd(&mut self, inst: Instruction, bus: &mut impl Bus) {
        let address = self.load_address(inst);
        if address & 7 != 0 && !self.config().allow_misaligned_access {
            self.raise_address_error(address, ExceptionCode::AddressErrorStore, bus);
            return;
        }
        let value = self.read_gpr64(inst.rt());
        let success = self.ll_bit();
        if success {
            self.store64(bus, address, value);
        }
        self.write_gpr64(inst.rt(), u64::from(success));
    }

    fn op_swl(&mut self, inst: Instruction, bus: &mut impl Bus) {
        let address = self.load_address(inst);
        let mut unalignment = (address & 3) as u32;
        if self.config().big_endian {
            unalignment = 3 - unalignment;
        }

        let rt = self.read_gpr32(inst.rt());
        for i in 0..=unalignment {
            let shamt = (3 - i) * 8;
            self.store8(bus, address.wrapping_add(u64::from(i)), (rt >> shamt) as u8);
        }
    }

    fn op_swr(&mut self, inst: Instruction, bus: &mut impl Bus) {
        let address = self.load_address(inst);
        let mut unalignment = 3 - (address & 3) as u32;
        if self.config().big_endian {
            unalignment = 3 - unalignment;
        }

        let rt = self.read_gpr32(inst.rt());
        for i in 0..=unalignment {
            let shamt = i * 8;
            self.store8(bus, address.wrapping_sub(u64::from(i)), (rt >> shamt) as u8);
        }
    }

    fn op_sdl(&mut self, inst: Instruction, bus: &mut impl Bus) {
        let address = self.load_address(inst);
        let mut unalignment = (address & 7) as u32;
        if self.config().big_endian {
            unalignment = 7 - unalignment;
        }

        let rt = self.read_gpr64(inst.rt());
        for i in 0..=unalignment {
            let shamt = (7 - i) * 8;
            self.store8(bus, address.wrapping_add(u64::from(i)), (rt >> shamt) as u8);
        }
    }

    fn op_sdr(&mut self, inst: Instruction, bus: &mut impl Bus) {
        let address = self.load_address(inst);
        let mut unalignment = 7 - (address & 7) as u32;
        if self.config().big_endian {
            unalignment = 7 - unalignment;
        }

        let rt = self.read_gpr64(inst.rt());
        for i in 0..=unalignment {
            let shamt = i * 8;
            self.store8(bus, address.wrapping_sub(u64::from(i)), (rt >> shamt) as u8);
        }
    }

    // ─── Coprocessor moves and commands ───

    fn cop_override(&self, cop: usize) -> bool {
        self.config().cop_decoding_override & (1 << cop) != 0
    }

    fn op_cop(&mut self, inst: Instruction, bus: &mut impl Bus) {
        let cop = inst.cop();
        if !self.is_cop_enabled(cop) {
            self.raise_cop_unusable(cop, bus);
            return;
        }
        self.cop_command(cop, inst.raw());

        if self.config().lazy_interrupt_polling {
            let command = inst.raw() & 0x3F;
            if command == 0x10 || command == 0x18 {
                // RFE or ERET may have re-enabled interrupts.
                self.check_interrupt(bus);
            }
        }
    }

    fn op_mfc(&mut self, inst: Instruction, bus: &mut impl Bus) {
        let cop = inst.cop();
        if self.cop_override(cop) {
            self.op_cop(inst, bus);
            return;
        }
        if !self.is_cop_enabled(cop) {
            self.raise_cop_unusable(cop, bus);
            return;
        }
        let value = self.cop_read32(cop, inst.rd());
        self.write_gpr32_sext(inst.rt(), value as i32);
    }

    fn op_cfc(&mut self, inst: Instruction, bus: &mut impl Bus) {
        let cop = inst.cop();
        if self.cop_override(cop) {
            self.op_cop(inst, bus);
            return;
        }
        if !self.is_cop_enabled(cop) {
            self.raise_cop_unusable(cop, bus);
            return;
        }
        let value = self.cop_read32(cop, inst.rd() + 32);
        self.write_gpr32_sext(inst.rt(), value as i32);
    }

    fn op_mtc(&mut self, inst: Instruction, bus: &mut impl Bus) {
        let cop = inst.cop();
        if self.cop_override(cop) {
            self.op_cop(inst, bus);
            return;
        }
        if !self.is_cop_enabled(cop) {
            self.raise_cop_unusable(cop, bus);
            return;
        }
        let value = self.read_gpr32(inst.rt());
        self.cop_write32(cop, inst.rd(), value);
        if self.config().lazy_interrupt_polling && cop == 0 {
            self.check_interrupt(bus);
        }
    }

    fn op_ctc(&mut self, inst: Instruction, bus: &mut impl Bus) {
        let cop = inst.cop();
        if self.cop_override(cop) {
            self.op_cop(inst, bus);
            return;
        }
        if !self.is_cop_enabled(cop) {
            self.raise_cop_unusable(cop, bus);
            return;
        }
        let value = self.read_gpr32(inst.rt());
        self.cop_write32(cop, inst.rd() + 32, value);
    }

    fn op_dmfc(&mut self, inst: Instruction, bus: &mut impl Bus) {
        let cop = inst.cop();
        if !self.is_cop_enabled(cop) {
            self.raise_cop_unusable(cop, bus);
            return;
        }
        let value = self.cop_read64(cop, inst.rd());
        self.write_gpr64(inst.rt(), value);
    }

    fn op_dmtc(&mut self, inst: Instruction, bus: &mut impl Bus) {
        let cop = inst.cop();
        if !self.is_cop_enabled(cop) {
            self.raise_cop_unusable(cop, bus);
            return;
        }
        let value = self.read_gpr64(inst.rt());
        self.cop_write64(cop, inst.rd(), value);
        if self.config().lazy_interrupt_polling && cop == 0 {
            self.check_interrupt(bus);
        }
    }

    fn op_lwc(&mut self, inst: Instruction, bus: &mut impl Bus) {
        let cop = inst.cop();
        if self.cop_override(cop) {
            self.op_cop(inst, bus);
            return;
        }
        if !self.is_cop_enabled(cop) {
            self.raise_cop_unusable(cop, bus);
            return;
        }
        let address = self.load_address(inst);
        if let Some(value) = self.load32(bus, address) {
            self.queue_delayed_cop_load(cop, inst.rt(), value, bus);
        }
    }

    fn op_swc(&mut self, inst: Instruction, bus: &mut impl Bus) {
        let cop = inst.cop();
        if self.cop_override(cop) {
            self.op_cop(inst, bus);
            return;
        }
        if !self.is_cop_enabled(cop) {
            self.raise_cop_unusable(cop, bus);
            return;
        }
        let address = self.load_address(inst);
        let value = self.cop_read32(cop, inst.rt());
        self.store32(bus, address, value);
    }

    fn op_ldc(&mut self, inst: Instruction, bus: &mut impl Bus) {
        let cop = inst.cop();
        if !self.is_cop_enabled(cop) {
            self.raise_cop_unusable(cop, bus);
            return;
        }
        let address = self.load_address(inst);
        if let Some(value) = self.load64(bus, address) {
            self.cop_write64(cop, inst.rt(), value);
        }
    }

    fn op_sdc(&mut self, inst: Instruction, bus: &mut impl Bus) {
        let cop = inst.cop();
        if !self.is_cop_enabled(cop) {
            self.raise_cop_unusable(cop, bus);
            return;
        }
        let address = self.load_address(inst);
        let value = self.cop_read64(cop, inst.rt());
        self.store64(bus, address, value);
    }

    // ─── CACHE ───

    fn op_cache(&mut self, inst: Instruction) {
        let op = (inst.raw() >> 16) & 0x1F;
        let base = inst.rs();
        let address = self
            .read_gpr64(base)
            .wrapping_add(inst.imm_sext() as u64);
        self.cache_op(op, address);
    }

    // ─── 64-bit arithmetic ───

    fn op_dadd(&mut self, inst: Instruction, bus: &mut impl Bus) {
        let rs = self.read_gpr64(inst.rs());
        let rt = self.read_gpr64(inst.rt());
        match (rs as i64).checked_add(rt as i64) {
            Some(value) => self.write_gpr64(inst.rd(), value as u64),
            None => self.trigger_exception(ExceptionCode::Overflow, bus),
        }
    }

    fn op_daddu(&mut self, inst: Instruction) {
        let value = self
            .read_gpr64(inst.rs())
            .wrapping_add(self.read_gpr64(inst.rt()));
        self.write_gpr64(inst.rd(), value);
    }

    fn op_daddi(&mut self, inst: Instruction, bus: &mut impl Bus) {
        let rs = self.read_gpr64(inst.rs());
        match (rs as i64).checked_add(inst.imm_sext()) {
            Some(value) => self.write_gpr64(inst.rt(), value as u64),
            None => self.trigger_exception(ExceptionCode::Overflow, bus),
        }
    }

    fn op_daddiu(&mut self, inst: Instruction) {
        let value = self
            .read_gpr64(inst.rs())
            .wrapping_add(inst.imm_sext() as u64);
        self.write_gpr64(inst.rt(), value);
    }

    fn op_dsub(&mut self, inst: Instruction, bus: &mut impl Bus) {
        let rs = self.read_gpr64(inst.rs());
        let rt = self.read_gpr64(inst.rt());
        match (rs as i64).checked_sub(rt as i64) {
            Some(value) => self.write_gpr64(inst.rd(), value as u64),
            None => self.trigger_exception(ExceptionCode::Overflow, bus),
        }
    }

    fn op_dsubu(&mut self, inst: Instruction) {
        let value = self
            .read_gpr64(inst.rs())
            .wrapping_sub(self.read_gpr64(inst.rt()));
        self.write_gpr64(inst.rd(), value);
    }

    fn op_dmult(&mut self, inst: Instruction) {
        let rs = i128::from(self.read_gpr64(inst.rs()) as i64);
        let rt = i128::from(self.read_gpr64(inst.rt()) as i64);
        let result = rs.wrapping_mul(rt) as u128;
        self.set_hi((result >> 64) as u64);
        self.set_lo(result as u64);
    }

    fn op_dmultu(&mut self, inst: Instruction) {
        let rs = u128::from(self.read_gpr64(inst.rs()));
        let rt = u128::from(self.read_gpr64(inst.rt()));
        let result = rs.wrapping_mul(rt);
        self.set_hi((result >> 64) as u64);
        self.set_lo(result as u64);
    }

    fn op_ddiv(&mut self, inst: Instruction) {
        let rs = self.read_gpr64(inst.rs()) as i64;
        let rt = self.read_gpr64(inst.rt()) as i64;
        let (lo, hi) = if rt == 0 {
            (if rs < 0 { 1 } else { -1 }, rs)
        } else if rs == i64::MIN && rt == -1 {
            (i64::MIN, 0)
        } else {
            (rs / rt, rs % rt)
        };
        self.set_lo(lo as u64);
        self.set_hi(hi as u64);
    }

    fn op_ddivu(&mut self, inst: Instruction) {
        let rs = self.read_gpr64(inst.rs());
        let rt = self.read_gpr64(inst.rt());
        let (lo, hi) = if rt == 0 {
            (u64::MAX, rs)
        } else {
            (rs / rt, rs % rt)
        };
        self.set_lo(lo);
        self.set_hi(hi);
    }

    // ─── 64-bit shifts ───

    fn op_dsll(&mut self, inst: Instruction) {
        let value = self.read_gpr64(inst.rt()) << inst.sa();
        self.write_gpr64(inst.rd(), value);
    }

    fn op_dsll32(&mut self, inst: Instruction) {
        let value = self.read_gpr64(inst.rt()) << (inst.sa() + 32);
        self.write_gpr64(inst.rd(), value);
    }

    fn op_dsllv(&mut self, inst: Instruction) {
        let value = self.read_gpr64(inst.rt()) << (self.read_gpr64(inst.rs()) & 63);
        self.write_gpr64(inst.rd(), value);
    }

    fn op_dsrl(&mut self, inst: Instruction) {
        let value = self.read_gpr64(inst.rt()) >> inst.sa();
        self.write_gpr64(inst.rd(), value);
    }

    fn op_dsrl32(&mut self, inst: Instruction) {
        let value = self.read_gpr64(inst.rt()) >> (inst.sa() + 32);
        self.write_gpr64(inst.rd(), value);
    }

    fn op_dsrlv(&mut self, inst: Instruction) {
        let value = self.read_gpr64(inst.rt()) >> (self.read_gpr64(inst.rs()) & 63);
        self.write_gpr64(inst.rd(), value);
    }

    fn op_dsra(&mut self, inst: Instruction) {
        let value = (self.read_gpr64(inst.rt()) as i64) >> inst.sa();
        self.write_gpr64(inst.rd(), value as u64);
    }

    fn op_dsra32(&mut self, inst: Instruction) {
        let value = (self.read_gpr64(inst.rt()) as i64) >> (inst.sa() + 32);
        self.write_gpr64(inst.rd(), value as u64);
    }

    fn op_dsrav(&mut self, inst: Instruction) {
        let value = (self.read_gpr64(inst.rt()) as i64) >> (self.read_gpr64(inst.rs()) & 63);
        self.write_gpr64(inst.rd(), value as u64);
    }
}
