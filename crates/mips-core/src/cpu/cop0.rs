//! COP0 — the system control coprocessor.
//!
//! Owns Status/Cause/EPC/BadVAddr/Count/Compare and executes the TLB
//! maintenance commands plus ERET/RFE. The TLB staging registers (EntryHi,
//! EntryLo0/1, PageMask, Index) live in [`Tlb`]; the register ports here
//! delegate to it. Methods that depend on engine state take it as
//! parameters (the cycle timestamp for Count, `&mut Tlb` for commands) and
//! report side effects the engine must apply as returned effect values —
//! there are no stored back-references.

use rand::distributions::{Distribution, Uniform};

use crate::cpu::tlb::{Tlb, TlbEntry};

bitflags::bitflags! {
    /// COP0 Status register layout.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Status: u32 {
        const IE = 1 << 0;
        const EXL = 1 << 1;
        const ERL = 1 << 2;
        /// Interrupt mask, IM[15:8].
        const IM = 0xFF << 8;
        /// PlayStation-style isolate-cache: stores are dropped while set.
        const ISOLATE_CACHE = 1 << 16;
        /// Boot exception vectors.
        const BEV = 1 << 22;
        /// FPU register file view: set = 32 independent 64-bit registers.
        const FR = 1 << 26;
        const CU0 = 1 << 28;
        const CU1 = 1 << 29;
        const CU2 = 1 << 30;
        const CU3 = 1 << 31;
    }
}

bitflags::bitflags! {
    /// COP0 Cause register layout.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Cause: u32 {
        /// Exception fired in a branch delay slot.
        const BD = 1 << 31;
        /// Coprocessor number of a CopUnusable exception.
        const CE = 3 << 28;
        /// Interrupt pending, IP[15:8].
        const IP = 0xFF << 8;
        /// External bus interrupt line.
        const IP2 = 1 << 10;
        /// Count/Compare timer interrupt.
        const IP7 = 1 << 15;
        const EXC_CODE = 0x1F << 2;
        /// Software interrupt bits — the only ones writable by MTC0.
        const SW_IP = 3 << 8;
    }
}

/// Register indices, as seen by MFC0/MTC0.
impl Cop0 {
    pub const INDEX: usize = 0;
    pub const RANDOM: usize = 1;
    pub const ENTRY_LO0: usize = 2;
    pub const ENTRY_LO1: usize = 3;
    pub const CONTEXT: usize = 4;
    pub const PAGE_MASK: usize = 5;
    pub const WIRED: usize = 6;
    pub const BAD_VADDR: usize = 8;
    pub const COUNT: usize = 9;
    pub const ENTRY_HI: usize = 10;
    pub const COMPARE: usize = 11;
    pub const STATUS: usize = 12;
    pub const CAUSE: usize = 13;
    pub const EPC: usize = 14;
    pub const PRID: usize = 15;
    pub const ERROR_EPC: usize = 30;
}

/// Engine-visible side effect of a COP0 command.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cop0Effect {
    None,
    /// ERET: redirect execution (no delay slot) and clear LLbit.
    Eret { target: u64 },
}

/// Engine-visible side effect of a COP0 register write.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cop0WriteEffect {
    None,
    /// Compare was written: the engine clears its pending timer interrupt.
    CompareWritten,
}

pub struct Cop0 {
    context: u64,
    wired: u32,
    bad_vaddr: u64,
    compare: u32,
    status: u32,
    cause: u32,
    epc: u64,
    error_epc: u64,

    /// Count is virtual: `count = (timestamp >> 1) - count_origin`.
    count_origin: u64,
    /// Timestamp (post shift) of the last compare poll.
    last_compare_poll: u64,
    /// Writing Compare or rebasing Count suppresses the next poll tick.
    suppress_compare: bool,
}

impl Cop0 {
    pub fn new() -> Self {
        Self {
            context: 0,
            wired: 0,
            bad_vaddr: 0,
            compare: 0,
            status: 0x3400_0000,
            cause: 0xB000_007C,
            epc: u64::MAX,
            error_epc: u64::MAX,
            count_origin: 0,
            last_compare_poll: 0,
            suppress_compare: false,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Programmer-visible register read (MFC0/DMFC0). 32-bit cores truncate
    /// the result.
    pub fn read(&mut self, idx: usize, tlb: &Tlb, timestamp: u64) -> u64 {
        match idx {
            Self::INDEX => u64::from(tlb.index()),
            Self::RANDOM => u64::from(self.random()),
            Self::ENTRY_LO0 => tlb.entry_lo0(),
            Self::ENTRY_LO1 => tlb.entry_lo1(),
            Self::CONTEXT => self.context,
            Self::PAGE_MASK => tlb.page_mask(),
            Self::WIRED => u64::from(self.wired),
            Self::BAD_VADDR => self.bad_vaddr,
            Self::COUNT => u64::from(self.count(timestamp)),
            Self::ENTRY_HI => tlb.entry_hi(),
            Self::COMPARE => u64::from(self.compare),
            Self::STATUS => u64::from(self.status),
            Self::CAUSE => u64::from(self.cause),
            Self::EPC => self.epc,
            Self::PRID => 2,
            Self::ERROR_EPC => self.error_epc,
            _ => {
                log::warn!("COP0 read from unimplemented register {idx}");
                0
            }
        }
    }

    /// Programmer-visible register write (MTC0/DMTC0), with side effects.
    pub fn write(
        &mut self,
        idx: usize,
        value: u64,
        tlb: &mut Tlb,
        timestamp: u64,
    ) -> Cop0WriteEffect {
        log::trace!("COP0 write r{idx} = {value:#010X}");
        match idx {
            Self::INDEX => tlb.set_index(value as u32),
            Self::ENTRY_LO0 => tlb.set_entry_lo0(value),
            Self::ENTRY_LO1 => tlb.set_entry_lo1(value),
            Self::CONTEXT => self.context = value,
            Self::PAGE_MASK => tlb.set_page_mask(value),
            Self::WIRED => self.wired = value as u32 & 0x1F,
            // Writable in practice, kernels use it as scratch during refill.
            Self::BAD_VADDR => self.bad_vaddr = value,
            Self::COUNT => self.write_count(value as u32, timestamp),
            Self::ENTRY_HI => tlb.set_entry_hi(value),
            Self::COMPARE => {
                log::debug!(
                    "Compare = {:#010X} (count {:#010X})",
                    value as u32,
                    self.count(timestamp)
                );
                self.compare = value as u32;
                self.suppress_compare = true;
                return Cop0WriteEffect::CompareWritten;
            }
            Self::STATUS => self.status = value as u32,
            Self::CAUSE => {
                let writable = value as u32 & Cause::SW_IP.bits();
                self.cause = (self.cause & !Cause::SW_IP.bits()) | writable;
            }
            Self::EPC => self.epc = value,
            Self::ERROR_EPC => self.error_epc = value,
            _ => log::warn!("COP0 write to unimplemented register {idx} = {value:#010X}"),
        }
        Cop0WriteEffect::None
    }

    /// Execute a COP0 command word (low six bits select the operation).
    pub fn command(&mut self, word: u32, tlb: &mut Tlb) -> Cop0Effect {
        match word & 0x3F {
            0x01 => {
                // TLBR: indexed entry -> staging registers.
                let entry = tlb.entry(tlb.index() as usize);
                tlb.set_entry_lo0(entry.entry_lo0);
                tlb.set_entry_lo1(entry.entry_lo1);
                tlb.set_entry_hi(entry.entry_hi);
                tlb.set_page_mask(entry.page_mask);
            }
            0x02 => {
                // TLBWI: staging registers -> indexed entry.
                let idx = tlb.index() as usize;
                tlb.set_entry(idx, self.staged_entry(tlb));
            }
            0x06 => {
                // TLBWR: staging registers -> random entry in [Wired, 31].
                let idx = self.random() as usize;
                tlb.set_entry(idx, self.staged_entry(tlb));
            }
            0x08 => {
                // TLBP.
                tlb.set_index(tlb.probe());
            }
            0x10 => {
                // RFE: pop the MIPS I KU/IE stack (rotate Status[5:0] right
                // by two, keeping the old-mode pair in place).
                let mode = self.status & 0x3F;
                self.status = (self.status & !0x0F) | ((mode >> 2) & 0x0F);
            }
            0x18 => {
                // ERET.
                let target = if self.status & Status::ERL.bits() != 0 {
                    self.status &= !Status::ERL.bits();
                    self.error_epc
                } else {
                    self.status &= !Status::EXL.bits();
                    self.epc
                };
                log::trace!("ERET -> {target:#010X}");
                return Cop0Effect::Eret { target };
            }
            other => log::warn!("COP0 command {other:#04X} ({word:#010X})"),
        }
        Cop0Effect::None
    }

    fn staged_entry(&self, tlb: &Tlb) -> TlbEntry {
        TlbEntry {
            entry_lo0: tlb.entry_lo0(),
            entry_lo1: tlb.entry_lo1(),
            entry_hi: tlb.entry_hi(),
            page_mask: tlb.page_mask(),
        }
    }

    /// Random register: uniformly drawn from [Wired, 31] on each read; also
    /// picks the TLBWR victim.
    fn random(&self) -> u32 {
        let wired = self.wired.min(31);
        Uniform::from(wired..=31).sample(&mut rand::thread_rng())
    }

    // ─── Internal ports (engine use — no coprocessor side effects) ───

    pub fn status(&self) -> u32 {
        self.status
    }
    pub fn set_status(&mut self, value: u32) {
        self.status = value;
    }

    pub fn cause(&self) -> u32 {
        self.cause
    }
    pub fn set_cause(&mut self, value: u32) {
        self.cause = value;
    }

    pub fn epc(&self) -> u64 {
        self.epc
    }
    pub fn set_epc(&mut self, value: u64) {
        self.epc = value;
    }

    pub fn set_bad_vaddr(&mut self, value: u64) {
        self.bad_vaddr = value;
    }
    pub fn bad_vaddr(&self) -> u64 {
        self.bad_vaddr
    }

    /// Derived Count value: `(timestamp >> 1) - origin`, rebasing the
    /// origin if the timestamp ever runs behind it.
    pub fn count(&mut self, timestamp: u64) -> u32 {
        let now = timestamp >> 1;
        if now < self.count_origin {
            self.count_origin = now;
            return 0;
        }
        (now - self.count_origin) as u32
    }

    fn write_count(&mut self, value: u32, timestamp: u64) {
        let now = timestamp >> 1;
        if now < u64::from(value) {
            self.count_origin = now;
            return;
        }
        self.count_origin = now - u64::from(value);
        self.suppress_compare = true;
    }

    /// Poll the compare interrupt: true when the wrapped 32-bit Count
    /// crossed Compare since the previous poll.
    ///
    /// Detection uses the wraparound-range form: Compare fired iff it lies
    /// in `(count_at_last_poll, count_now]` modulo 2^32, with any jump of
    /// 2^32 cycles or more counting as a hit.
    pub fn poll_compare(&mut self, timestamp: u64) -> bool {
        let now = timestamp >> 1;
        if self.suppress_compare {
            self.suppress_compare = false;
            self.last_compare_poll = now;
            return false;
        }
        if self.last_compare_poll > now {
            log::warn!("compare poll: timestamp went backwards");
            self.last_compare_poll = now;
            return false;
        }

        let delta = now - self.last_compare_poll;
        if delta == 0 {
            return false;
        }
        let crossed = if delta >= 1 << 32 {
            true
        } else {
            let start = self.last_compare_poll.wrapping_sub(self.count_origin) as u32;
            let end = now.wrapping_sub(self.count_origin) as u32;
            // compare in (start, end], all mod 2^32
            self.compare.wrapping_sub(start).wrapping_sub(1) <= end.wrapping_sub(start).wrapping_sub(1)
        };
        self.last_compare_poll = now;
        crossed
    }
}

impl Default for Cop0 {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_derives_from_timestamp() {
        let mut cop0 = Cop0::new();
        assert_eq!(cop0.count(0), 0);
        assert_eq!(cop0.count(200), 100);

        // Writing Count rebases the origin.
        let mut tlb = Tlb::new();
        let _ = cop0.write(Cop0::COUNT, 10, &mut tlb, 200);
        assert_eq!(cop0.count(200), 10);
        assert_eq!(cop0.count(220), 20);
    }

    #[test]
    fn compare_poll_detects_crossing() {
        let mut cop0 = Cop0::new();
        let mut tlb = Tlb::new();

        let effect = cop0.write(Cop0::COMPARE, 50, &mut tlb, 0);
        assert_eq!(effect, Cop0WriteEffect::CompareWritten);

        // Writing Compare suppresses the next tick.
        assert!(!cop0.poll_compare(20));
        // Count goes 10 -> 40: no crossing.
        assert!(!cop0.poll_compare(80));
        // Count goes 40 -> 60: crosses 50.
        assert!(cop0.poll_compare(120));
        // No re-fire without another crossing.
        assert!(!cop0.poll_compare(140));
    }

    #[test]
    fn compare_poll_handles_wraparound() {
        let mut cop0 = Cop0::new();
        let mut tlb = Tlb::new();

        // Park Count just below the wrap point, then step across it: the
        // low Compare value is only reachable through the wraparound.
        let near_wrap = (u64::from(u32::MAX) - 2) << 1;
        let _ = cop0.write(Cop0::COMPARE, 2, &mut tlb, near_wrap);
        assert!(!cop0.poll_compare(near_wrap));
        assert!(cop0.poll_compare(near_wrap + 40));
    }

    #[test]
    fn rfe_pops_the_mode_stack() {
        let mut cop0 = Cop0::new();
        let mut tlb = Tlb::new();
        cop0.set_status(0b10_1101);
        let effect = cop0.command(0x10, &mut tlb);
        assert_eq!(effect, Cop0Effect::None);
        // [5:0] = 101101 -> 101011 (bits 5:4 kept, stack shifted down).
        assert_eq!(cop0.status() & 0x3F, 0b10_1011);
    }

    #[test]
    fn eret_prefers_error_epc_under_erl() {
        let mut cop0 = Cop0::new();
        let mut tlb = Tlb::new();
        cop0.set_status(Status::EXL.bits() | Status::ERL.bits());
        cop0.set_epc(0x1000);
        let _ = cop0.write(Cop0::ERROR_EPC, 0x2000, &mut tlb, 0);

        assert_eq!(cop0.command(0x18, &mut tlb), Cop0Effect::Eret { target: 0x2000 });
        assert_eq!(cop0.status() & Status::ERL.bits(), 0);
        // ERL was set, so EXL survives for the next ERET.
        assert_eq!(cop0.command(0x18, &mut tlb), Cop0Effect::Eret { target: 0x1000 });
        assert_eq!(cop0.status() & Status::EXL.bits(), 0);
    }

    #[test]
    fn tlb_commands_move_entries_through_staging() {
        let mut cop0 = Cop0::new();
        let mut tlb = Tlb::new();

        tlb.set_entry_hi(0x0004_2000);
        tlb.set_entry_lo0((0x80 << 6) | 0b110);
        tlb.set_entry_lo1((0x81 << 6) | 0b110);
        tlb.set_page_mask(0);
        tlb.set_index(5);
        let _ = cop0.command(0x02, &mut tlb); // TLBWI

        let entry = tlb.entry(5);
        assert_eq!(entry.entry_hi, 0x0004_2000);

        // Clobber staging, then TLBR it back.
        tlb.set_entry_hi(0);
        tlb.set_entry_lo0(0);
        let _ = cop0.command(0x01, &mut tlb); // TLBR
        assert_eq!(tlb.entry_hi(), 0x0004_2000);
        assert_eq!(tlb.entry_lo0(), (0x80 << 6) | 0b110);

        // TLBP finds it.
        let _ = cop0.command(0x08, &mut tlb);
        assert_eq!(tlb.index(), 5);
    }

    #[test]
    fn random_stays_in_wired_range() {
        let mut cop0 = Cop0::new();
        let mut tlb = Tlb::new();
        let _ = cop0.write(Cop0::WIRED, 24, &mut tlb, 0);
        for _ in 0..64 {
            let value = cop0.read(Cop0::RANDOM, &tlb, 0);
            assert!((24..=31).contains(&value));
        }
    }

    #[test]
    fn cause_write_touches_only_software_bits() {
        let mut cop0 = Cop0::new();
        let mut tlb = Tlb::new();
        cop0.set_cause(0x8000_7C00);
        let _ = cop0.write(Cop0::CAUSE, 0xFFFF_FFFF, &mut tlb, 0);
        assert_eq!(cop0.cause(), 0x8000_7F00);
    }
}
