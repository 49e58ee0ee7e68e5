//! The execution engine: register file, run loops, memory paths, delay
//! slots and exception delivery.

use crate::bus::Bus;
use crate::cache::{Block, BlockCache, BlockEntry, BLOCK_MAX_LEN};
use crate::config::CoreConfig;
use crate::cpu::cop::Coprocessor;
use crate::cpu::cop0::{Cause, Cop0, Cop0Effect, Cop0WriteEffect, Status};
use crate::cpu::cop1::Fpu;
use crate::cpu::exceptions::ExceptionCode;
use crate::cpu::instruction::Op;
use crate::cpu::tlb::{Tlb, Translation};
use crate::hook::Hook;

/// Instruction trace ring size (entries), dumped on host faults.
const TRACE_RING_LEN: usize = 2048;

/// Idle-loop fast-forward: cycles charged when the detector fires.
const IDLE_LOOP_CYCLES: u32 = 100;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("coprocessor slot {0} does not exist (valid slots are 0..=3)")]
    InvalidCopSlot(usize),
    #[error("coprocessor slot {0} is owned by the built-in {1}")]
    OccupiedCopSlot(usize, &'static str),
    #[error("hook slot {0} does not exist (valid slots are 0 and 1)")]
    InvalidHookSlot(usize),
}

/// Destination of a pending delayed load.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LoadTarget {
    Gpr(usize),
    Cop { cop: usize, reg: usize },
}

/// The load-delay slot: at most one pending load. The counter advances at
/// each instruction retirement and the value lands when it reaches two, so
/// the loaded value is invisible to the instruction in the delay slot.
#[derive(Clone, Copy, Debug)]
struct DelayedLoad {
    counter: u8,
    target: LoadTarget,
    value: u64,
}

#[derive(Clone, Copy)]
struct TraceEntry {
    pc: u64,
    opcode: u32,
    gpr: [u64; 32],
}

/// Fixed-size ring of recently executed instructions.
struct TraceRing {
    entries: Vec<TraceEntry>,
    index: usize,
}

impl TraceRing {
    fn new() -> Self {
        Self {
            entries: Vec::with_capacity(TRACE_RING_LEN),
            index: 0,
        }
    }

    fn push(&mut self, entry: TraceEntry) {
        if self.entries.len() < TRACE_RING_LEN {
            self.entries.push(entry);
        } else {
            self.entries[self.index] = entry;
        }
        self.index = (self.index + 1) % TRACE_RING_LEN;
    }

    /// Entries from oldest to newest.
    fn iter(&self) -> impl Iterator<Item = &TraceEntry> {
        let (tail, head) = if self.entries.len() < TRACE_RING_LEN {
            (&self.entries[..], &self.entries[..0])
        } else {
            let (head, tail) = self.entries.split_at(self.index);
            (tail, head)
        };
        tail.iter().chain(head.iter())
    }
}

/// A configurable MIPS CPU core.
///
/// The engine exclusively owns its register file, COP0/FPU state, TLB and
/// block cache; the bus is a shared collaborator supplied at each call. A
/// core instance is not thread-safe and must not be touched concurrently.
pub struct Core {
    config: CoreConfig,

    gpr: [u64; 32],
    hi: u64,
    lo: u64,
    pc: u64,
    next_pc: u64,
    ll_bit: bool,

    /// Branch delay slot: when armed, the next instruction's NextPC becomes
    /// the recorded destination instead of PC + 4.
    has_branch_delay: bool,
    branch_delay_dst: u64,
    delayed_load: Option<DelayedLoad>,

    /// Budget spent inside the current `run` call.
    cycle_spent: u32,
    /// U8.8 fractional cycle accumulator.
    cpi_counter: u32,
    /// Total cycles since reset; COP0 Count derives from this.
    timestamp: u64,

    compare_interrupt: bool,
    /// Coprocessor number of the most recent CopUnusable fault.
    cop_cause: u32,
    halt: bool,

    cop0: Option<Cop0>,
    fpu: Option<Fpu>,
    /// Host-connected coprocessors; slots 0/1 only answer when the
    /// built-in COP0/FPU are disabled.
    cops: [Option<Box<dyn Coprocessor>>; 4],
    hooks: [Option<Box<dyn Hook>>; 2],
    tlb: Tlb,
    cache: BlockCache,

    trace: Option<TraceRing>,
}

impl Core {
    /// Build a core from a configuration record.
    ///
    /// Panics if the configuration fails [`CoreConfig::validate`].
    pub fn new(config: CoreConfig) -> Self {
        if let Err(err) = config.validate() {
            panic!("invalid core configuration: {err}");
        }
        let cop0 = config.has_cop0.then(Cop0::new);
        let fpu = config.has_fpu.then(Fpu::new);
        let trace = config.trace_execution.then(TraceRing::new);
        Self {
            config,
            gpr: [0; 32],
            hi: 0,
            lo: 0,
            pc: 0,
            next_pc: 0,
            ll_bit: false,
            has_branch_delay: false,
            branch_delay_dst: 0,
            delayed_load: None,
            cycle_spent: 0,
            cpi_counter: 0,
            timestamp: 0,
            compare_interrupt: false,
            cop_cause: 0,
            halt: false,
            cop0,
            fpu,
            cops: [None, None, None, None],
            hooks: [None, None],
            tlb: Tlb::new(),
            cache: BlockCache::new(),
            trace,
        }
    }

    pub fn reset(&mut self) {
        self.gpr = [0; 32];
        self.hi = 0;
        self.lo = 0;
        self.pc = 0;
        self.next_pc = 0;
        self.ll_bit = false;
        self.has_branch_delay = false;
        self.branch_delay_dst = 0;
        self.delayed_load = None;
        self.cycle_spent = 0;
        self.cpi_counter = 0;
        self.timestamp = 0;
        self.compare_interrupt = false;
        self.cop_cause = 0;
        self.halt = false;

        if let Some(cop0) = &mut self.cop0 {
            cop0.reset();
        }
        if let Some(fpu) = &mut self.fpu {
            fpu.reset();
        }
        for cop in self.cops.iter_mut().flatten() {
            cop.reset();
        }
        if self.config.use_hook {
            for hook in self.hooks.iter_mut().flatten() {
                hook.reset();
            }
        }
        self.tlb.reset();
        self.cache.reset();
        if let Some(trace) = &mut self.trace {
            *trace = TraceRing::new();
        }
    }

    // ─── Host-facing wiring ───

    /// Connect a host coprocessor. Slots 0 and 1 are only available when
    /// the built-in COP0/FPU are disabled by the configuration.
    pub fn connect_cop(
        &mut self,
        slot: usize,
        cop: Box<dyn Coprocessor>,
    ) -> Result<(), CoreError> {
        if slot >= 4 {
            return Err(CoreError::InvalidCopSlot(slot));
        }
        if slot == 0 && self.config.has_cop0 {
            return Err(CoreError::OccupiedCopSlot(slot, "COP0"));
        }
        if slot == 1 && self.config.has_fpu {
            return Err(CoreError::OccupiedCopSlot(slot, "FPU"));
        }
        self.cops[slot] = Some(cop);
        Ok(())
    }

    pub fn connect_hook(&mut self, slot: usize, hook: Box<dyn Hook>) -> Result<(), CoreError> {
        if slot >= 2 {
            return Err(CoreError::InvalidHookSlot(slot));
        }
        self.hooks[slot] = Some(hook);
        Ok(())
    }

    // ─── Host-facing state access ───

    pub fn set_pc(&mut self, pc: u64) {
        self.pc = pc;
        self.next_pc = pc.wrapping_add(4);
    }

    pub fn pc(&self) -> u64 {
        self.pc
    }

    pub fn gpr(&self, idx: usize) -> u64 {
        if idx == 0 {
            return 0;
        }
        self.gpr[idx]
    }

    pub fn set_gpr(&mut self, idx: usize, value: u64) {
        if idx == 0 {
            return;
        }
        self.gpr[idx] = value;
    }

    pub fn set_llbit(&mut self, value: bool) {
        self.ll_bit = value;
    }

    pub fn halted(&self) -> bool {
        self.halt
    }

    pub fn set_halt(&mut self, halt: bool) {
        self.halt = halt;
    }

    /// Total cycles retired since reset.
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// Queue a block-cache invalidation for the block containing this
    /// physical address. Takes effect at the next block boundary.
    pub fn invalidate(&mut self, address: u32) {
        if self.config.use_cached_interpreter {
            self.cache.invalidate(address);
        }
    }

    /// Queue block-cache invalidations for every block overlapping the
    /// physical range `[start, end)`. Call after DMA into executable
    /// memory.
    pub fn invalidate_range(&mut self, start: u32, end: u32) {
        if self.config.use_cached_interpreter {
            self.cache.invalidate_range(start, end);
        }
    }

    pub fn block_cache(&self) -> &BlockCache {
        &self.cache
    }

    // ─── Run loops ───

    /// Execute for at most `cycles` cycles; returns the cycles actually
    /// spent. If the halt flag is raised the remaining budget is charged as
    /// idle time and the full budget is returned, so the enclosing
    /// scheduler keeps a consistent notion of elapsed time.
    pub fn run(&mut self, cycles: u32, bus: &mut impl Bus) -> u32 {
        if self.config.use_cached_interpreter {
            return self.run_cached(cycles, bus);
        }

        self.cycle_spent = 0;
        if !self.config.lazy_interrupt_polling {
            self.check_interrupt(bus);
        }
        self.check_compare(bus);
        while self.cycle_spent < cycles {
            if self.halt {
                let idle = cycles - self.cycle_spent;
                self.timestamp += u64::from(idle);
                return cycles;
            }
            self.step(bus);
        }
        self.cycle_spent
    }

    /// One uncached fetch/decode/execute cycle.
    fn step(&mut self, bus: &mut impl Bus) {
        let Some(opcode) = self.fetch(bus, self.pc) else {
            // Fetch faulted. PC already points at the vector; restart there.
            self.charge(1);
            return;
        };

        self.next_pc = if self.has_branch_delay {
            self.has_branch_delay = false;
            self.branch_delay_dst
        } else {
            self.pc.wrapping_add(4)
        };

        self.record_trace(opcode);
        if self.config.use_hook {
            let pc = self.pc;
            for hook in self.hooks.iter_mut().flatten() {
                hook.on_pre_execute(pc, opcode);
            }
        }

        let op = Op::decode(opcode, self.config.is_64bit);
        self.execute_op(op, opcode, bus);
        self.retire_delayed_load(bus);

        self.pc = self.next_pc;
        self.charge(1);
    }

    /// The cached interpreter: dispatch whole decoded blocks keyed by the
    /// physical PC.
    fn run_cached(&mut self, cycles: u32, bus: &mut impl Bus) -> u32 {
        self.cycle_spent = 0;
        while self.cycle_spent < cycles {
            self.check_interrupt(bus);
            self.check_compare(bus);
            if self.halt {
                let idle = cycles - self.cycle_spent;
                self.timestamp += u64::from(idle);
                return cycles;
            }

            // A block boundary: safe to apply queued invalidations before
            // the lookup sees them.
            self.cache.drain();

            let Some(translation) = self.translate(self.pc) else {
                self.raise_tlb_exception(self.pc, ExceptionCode::TlbLoad, bus);
                self.charge(1);
                continue;
            };
            let start = translation.address;

            let block = match self.cache.get(start) {
                Some(block) => block,
                None => {
                    let block = self.build_block(bus, self.pc, start);
                    self.cache.insert(block);
                    self.cache.get(start).expect("block just inserted")
                }
            };

            for (i, entry) in block.entries.iter().enumerate() {
                // An exception or a branch-likely nullification moved PC off
                // the block's straight line: stop executing it.
                if i > 0 && self.pc != entry.address {
                    break;
                }

                self.record_trace(entry.word);
                if self.config.use_hook {
                    let pc = self.pc;
                    for hook in self.hooks.iter_mut().flatten() {
                        hook.on_pre_execute(pc, entry.word);
                    }
                }

                self.next_pc = if self.has_branch_delay {
                    self.has_branch_delay = false;
                    self.branch_delay_dst
                } else {
                    self.pc.wrapping_add(4)
                };

                self.execute_op(entry.op, entry.word, bus);
                self.retire_delayed_load(bus);

                self.pc = self.next_pc & 0xFFFF_FFFF;
            }

            self.charge_raw(block.cycle);
        }
        self.cycle_spent
    }

    /// Decode a basic block starting at virtual `pc` (physical `start`).
    /// Stops at the first branch plus its delay slot, or at the length cap,
    /// or when a page stops translating.
    fn build_block(&mut self, bus: &mut impl Bus, pc: u64, start: u32) -> Block {
        let mut entries = Vec::with_capacity(BLOCK_MAX_LEN);
        let mut address = pc;
        let mut has_delay_slot = false;

        for _ in 0..BLOCK_MAX_LEN - 1 {
            let Some(word) = self.fetch_silent(bus, address) else {
                break;
            };
            let op = Op::decode(word, self.config.is_64bit);
            entries.push(BlockEntry { address, word, op });
            address = address.wrapping_add(4);
            if op.is_branch() {
                has_delay_slot = op.has_delay_slot();
                break;
            }
        }
        if has_delay_slot {
            if let Some(word) = self.fetch_silent(bus, address) {
                let op = Op::decode(word, self.config.is_64bit);
                entries.push(BlockEntry { address, word, op });
            }
        }
        debug_assert!(!entries.is_empty(), "caller translated the block start");

        let len = entries.len() as u32;
        log::trace!(
            "new block {:#010X}..{:#010X} ({} inst)",
            start,
            start + len * 4,
            len
        );
        Block {
            start,
            end: start + len * 4,
            entries,
            cycle: len * u32::from(self.config.cpi),
        }
    }

    // ─── Cycle accounting ───

    fn charge(&mut self, instructions: u32) {
        self.charge_raw(instructions * u32::from(self.config.cpi));
    }

    /// Charge a U8.8 cycle cost, retiring whole cycles into the budget and
    /// keeping the fraction for next time.
    fn charge_raw(&mut self, cost: u32) {
        self.cpi_counter += cost;
        let whole = self.cpi_counter >> 8;
        self.cpi_counter &= 0xFF;
        self.cycle_spent += whole;
        self.timestamp += u64::from(whole);
    }

    /// Fast-forward for a detected idle loop.
    pub(crate) fn idle_charge(&mut self) {
        self.cycle_spent += IDLE_LOOP_CYCLES;
        self.timestamp += u64::from(IDLE_LOOP_CYCLES);
    }

    // ─── Interrupts ───

    /// Reflect the interrupt sources into Cause.IP and poll the Count/
    /// Compare timer. Called once per timeslice (uncached) or per block
    /// iteration (cached).
    pub fn check_compare(&mut self, bus: &mut impl Bus) {
        if !self.config.has_cop0 || self.config.has_isolate_cache_bit {
            return;
        }
        let interrupt_line = bus.interrupt();
        let timestamp = self.timestamp;
        let Some(cop0) = self.cop0.as_mut() else {
            return;
        };

        let cause = cop0.cause();
        let mut ip = (cause >> 8) & 3;
        if interrupt_line {
            ip |= 1 << 2;
        }
        if self.compare_interrupt {
            ip |= 1 << 7;
        }
        cop0.set_cause((cause & !Cause::IP.bits()) | (ip << 8));

        if cop0.poll_compare(timestamp) {
            self.compare_interrupt = true;
            self.check_interrupt(bus);
        }
    }

    pub fn clear_compare_interrupt(&mut self) {
        self.compare_interrupt = false;
    }

    /// Take a pending interrupt if `IE && !EXL && !ERL && (IM & IP) != 0`.
    pub fn check_interrupt(&mut self, bus: &mut impl Bus) {
        if !self.config.has_exception || !self.config.has_cop0 {
            return;
        }
        let Some(cop0) = self.cop0.as_ref() else {
            return;
        };

        let sr = cop0.status();
        let status = Status::from_bits_retain(sr);
        let enabled = status.contains(Status::IE)
            && !status.contains(Status::EXL)
            && !status.contains(Status::ERL);

        let mut ip = (cop0.cause() >> 8) & 3;
        if bus.interrupt() {
            ip |= 1 << 2;
        }
        if self.compare_interrupt {
            ip |= 1 << 7;
        }
        let im = (sr >> 8) & 0xFF;

        if !enabled || im & ip == 0 {
            return;
        }

        if self.config.lazy_interrupt_polling {
            // The lazy poll fires mid-instruction (from a COP0 write or
            // ERET/RFE handler), so finish the instruction by hand.
            self.pc = self.next_pc;
            self.charge(1);
        }
        self.trigger_exception(ExceptionCode::Interrupt, bus);
    }

    // ─── Exceptions ───

    /// Deliver an architectural exception: fill Cause/EPC, push the Status
    /// mode bits, and redirect to the vector.
    pub(crate) fn trigger_exception(&mut self, code: ExceptionCode, bus: &mut impl Bus) {
        if !self.config.has_exception {
            if code != ExceptionCode::Overflow && code != ExceptionCode::Breakpoint {
                log::warn!("exception {code:?} dropped (exceptions disabled)");
            }
            return;
        }
        if code.is_tlb() && !self.config.has_tlb {
            self.dump_trace();
            panic!("TLB exception {code:?} on a core without a TLB");
        }

        let mut epc = self.pc;
        let mut bd = false;
        if self.has_branch_delay {
            // The faulting instruction sits in a branch delay slot: EPC
            // points at the branch and Cause.BD is set.
            self.has_branch_delay = false;
            bd = true;
            epc = epc.wrapping_sub(4);
        }

        let interrupt_line = bus.interrupt();
        let sr_before = self.cop0_status();
        let exl_was_set = sr_before & Status::EXL.bits() != 0;

        if let Some(cop0) = self.cop0.as_mut() {
            let old_cause = cop0.cause();
            let mut cause = u32::from(code as u8) << 2;
            if interrupt_line {
                cause |= Cause::IP2.bits();
            }
            if self.compare_interrupt {
                cause |= Cause::IP7.bits();
            }
            cause |= old_cause & Cause::SW_IP.bits();
            if code == ExceptionCode::CoprocessorUnusable {
                cause |= self.cop_cause << 28;
            }
            if bd {
                cause |= Cause::BD.bits();
            }
            cop0.set_cause(cause);

            let mut sr = sr_before;
            if self.config.is_64bit {
                if !exl_was_set {
                    cop0.set_epc(epc);
                    sr |= Status::EXL.bits();
                }
            } else {
                // MIPS I pushes the KU/IE stack instead of setting EXL.
                cop0.set_epc(epc);
                let mode = sr & 0x3F;
                sr = (sr & !0x3F) | ((mode << 2) & 0x3F);
            }
            cop0.set_status(sr);

            if code.is_tlb() {
                log::debug!(
                    "TLB exception {:?} | BadVAddr = {:#010X}",
                    code,
                    cop0.bad_vaddr()
                );
            }
        }

        let vector = if self.config.is_64bit {
            if code.is_tlb() && !exl_was_set {
                0x8000_0000
            } else {
                0x8000_0180
            }
        } else if sr_before & Status::BEV.bits() != 0 {
            0xBFC0_0180
        } else {
            0x8000_0080
        };
        self.set_pc_during_inst(vector);
    }

    /// Record the faulting address and raise a TLB-class exception.
    pub(crate) fn raise_tlb_exception(
        &mut self,
        address: u64,
        code: ExceptionCode,
        bus: &mut impl Bus,
    ) {
        if let Some(cop0) = self.cop0.as_mut() {
            cop0.set_bad_vaddr(address);
        }
        self.tlb.inform_exception(address);
        self.trigger_exception(code, bus);
    }

    /// Record the faulting address and raise an address-error exception.
    pub(crate) fn raise_address_error(
        &mut self,
        address: u64,
        code: ExceptionCode,
        bus: &mut impl Bus,
    ) {
        if let Some(cop0) = self.cop0.as_mut() {
            cop0.set_bad_vaddr(address);
        }
        self.trigger_exception(code, bus);
    }

    /// Redirect execution inside an instruction (exception vector, ERET):
    /// both PC and NextPC move so the target executes next.
    pub(crate) fn set_pc_during_inst(&mut self, target: u64) {
        self.pc = target;
        self.next_pc = target;
    }

    // ─── Register access helpers ───

    pub(crate) fn read_gpr32(&self, idx: usize) -> u32 {
        self.gpr[idx] as u32
    }

    pub(crate) fn read_gpr64(&self, idx: usize) -> u64 {
        if self.config.is_64bit {
            self.gpr[idx]
        } else {
            self.gpr[idx] as u32 as i32 as i64 as u64
        }
    }

    pub(crate) fn write_gpr32(&mut self, idx: usize, value: u32) {
        if idx == 0 {
            return;
        }
        self.cancel_delayed_load(idx);
        self.gpr[idx] = u64::from(value);
    }

    pub(crate) fn write_gpr32_sext(&mut self, idx: usize, value: i32) {
        if idx == 0 {
            return;
        }
        self.cancel_delayed_load(idx);
        self.gpr[idx] = value as i64 as u64;
    }

    pub(crate) fn write_gpr64(&mut self, idx: usize, value: u64) {
        if idx == 0 {
            return;
        }
        self.cancel_delayed_load(idx);
        self.gpr[idx] = value;
    }

    pub(crate) fn hi(&self) -> u64 {
        self.hi
    }
    pub(crate) fn set_hi(&mut self, value: u64) {
        self.hi = value;
    }
    pub(crate) fn lo(&self) -> u64 {
        self.lo
    }
    pub(crate) fn set_lo(&mut self, value: u64) {
        self.lo = value;
    }
    pub(crate) fn ll_bit(&self) -> bool {
        self.ll_bit
    }
    pub(crate) fn set_ll_bit(&mut self, value: bool) {
        self.ll_bit = value;
    }
    pub(crate) fn current_pc(&self) -> u64 {
        self.pc
    }
    pub(crate) fn set_next_pc(&mut self, value: u64) {
        self.next_pc = value;
    }

    /// A write through any other path cancels a pending load to the same
    /// register (the MIPS I load-delay interlock).
    fn cancel_delayed_load(&mut self, idx: usize) {
        if !self.config.has_load_delay {
            return;
        }
        if let Some(load) = &self.delayed_load {
            if load.target == LoadTarget::Gpr(idx) {
                self.delayed_load = None;
            }
        }
    }

    // ─── Delayed loads ───

    pub(crate) fn queue_delayed_load(&mut self, dst: usize, value: u64, bus: &mut impl Bus) {
        if !self.config.has_load_delay {
            self.write_gpr64(dst, value);
            return;
        }
        self.flush_delayed_load(bus);
        // Load delay exists only on MIPS I, so only the low 32 bits of the
        // value can ever matter.
        self.delayed_load = Some(DelayedLoad {
            counter: 0,
            target: LoadTarget::Gpr(dst),
            value,
        });
    }

    pub(crate) fn queue_delayed_cop_load(
        &mut self,
        cop: usize,
        dst: usize,
        value: u32,
        bus: &mut impl Bus,
    ) {
        if !self.config.has_load_delay {
            self.cop_write32(cop, dst, value);
            return;
        }
        self.flush_delayed_load(bus);
        self.delayed_load = Some(DelayedLoad {
            counter: 0,
            target: LoadTarget::Cop { cop, reg: dst },
            value: u64::from(value),
        });
    }

    /// Force an already-pending load to land before queuing another.
    fn flush_delayed_load(&mut self, bus: &mut impl Bus) {
        if self.delayed_load.is_none() {
            return;
        }
        self.retire_delayed_load(bus);
        if self.delayed_load.is_some() {
            self.dump_trace();
            panic!("consecutive delayed loads scheduled without retirement");
        }
    }

    /// Advance the load-delay counter at instruction retirement; the value
    /// lands when the counter reaches two.
    pub(crate) fn retire_delayed_load(&mut self, bus: &mut impl Bus) {
        let Some(mut load) = self.delayed_load.take() else {
            return;
        };
        load.counter += 1;
        if load.counter != 2 {
            self.delayed_load = Some(load);
            return;
        }
        match load.target {
            LoadTarget::Gpr(idx) => self.write_gpr32(idx, load.value as u32),
            LoadTarget::Cop { cop, reg } => {
                self.cop_write32(cop, reg, load.value as u32);
                if self.config.lazy_interrupt_polling && cop == 0 {
                    self.check_interrupt(bus);
                }
            }
        }
    }

    // ─── Jumps ───

    pub(crate) fn jump_rel(&mut self, offset: i64) {
        self.has_branch_delay = true;
        self.branch_delay_dst = self.pc.wrapping_add(4).wrapping_add(offset as u64);
    }

    pub(crate) fn jump(&mut self, dst: u64) {
        self.has_branch_delay = true;
        self.branch_delay_dst = dst;
    }

    /// Write the return address for a linking jump. Sign-extended to 64
    /// bits: 64-bit kernels compare `ra` against sign-extended addresses.
    pub(crate) fn link(&mut self, dst_reg: usize) {
        let ra = self.pc.wrapping_add(8) as u32;
        self.write_gpr64(dst_reg, ra as i32 as i64 as u64);
    }

    // ─── Coprocessor dispatch ───

    pub(crate) fn cop0_status(&self) -> u32 {
        self.cop0.as_ref().map_or(0, |cop0| cop0.status())
    }

    pub(crate) fn status_fr(&self) -> bool {
        self.cop0_status() & Status::FR.bits() != 0
    }

    /// Coprocessor usability per Status.CU; COP0 is always usable (kernel
    /// mode is not modeled).
    pub(crate) fn is_cop_enabled(&self, cop: usize) -> bool {
        if !self.config.has_cop0 {
            return true;
        }
        if cop == 0 {
            return true;
        }
        let enabled = self.cop0_status() & (1 << (28 + cop)) != 0;
        if !enabled {
            log::debug!("COP{cop} unusable at PC {:#010X}", self.pc);
        }
        enabled
    }

    /// Stash the offending coprocessor id and raise CopUnusable.
    pub(crate) fn raise_cop_unusable(&mut self, cop: usize, bus: &mut impl Bus) {
        self.cop_cause = cop as u32;
        self.trigger_exception(ExceptionCode::CoprocessorUnusable, bus);
    }

    pub(crate) fn cop_read32(&mut self, cop: usize, idx: usize) -> u32 {
        match cop {
            0 if self.config.has_cop0 => {
                let timestamp = self.timestamp;
                self.cop0
                    .as_mut()
                    .expect("COP0 enabled")
                    .read(idx, &self.tlb, timestamp) as u32
            }
            1 if self.config.has_fpu => {
                let fr = self.status_fr();
                self.fpu.as_mut().expect("FPU enabled").read32(idx, fr)
            }
            _ => self.cops[cop].as_mut().map_or(0, |c| c.read32(idx)),
        }
    }

    pub(crate) fn cop_write32(&mut self, cop: usize, idx: usize, value: u32) {
        match cop {
            0 if self.config.has_cop0 => {
                let timestamp = self.timestamp;
                let effect = self.cop0.as_mut().expect("COP0 enabled").write(
                    idx,
                    u64::from(value),
                    &mut self.tlb,
                    timestamp,
                );
                self.apply_cop0_write_effect(effect);
            }
            1 if self.config.has_fpu => {
                let fr = self.status_fr();
                self.fpu.as_mut().expect("FPU enabled").write32(idx, value, fr);
            }
            _ => {
                if let Some(c) = self.cops[cop].as_mut() {
                    c.write32(idx, value);
                }
            }
        }
    }

    pub(crate) fn cop_read64(&mut self, cop: usize, idx: usize) -> u64 {
        match cop {
            0 if self.config.has_cop0 => {
                let timestamp = self.timestamp;
                self.cop0
                    .as_mut()
                    .expect("COP0 enabled")
                    .read(idx, &self.tlb, timestamp)
            }
            1 if self.config.has_fpu => {
                let fr = self.status_fr();
                self.fpu.as_mut().expect("FPU enabled").read64(idx, fr)
            }
            _ => self.cops[cop].as_mut().map_or(0, |c| c.read64(idx)),
        }
    }

    pub(crate) fn cop_write64(&mut self, cop: usize, idx: usize, value: u64) {
        match cop {
            0 if self.config.has_cop0 => {
                let timestamp = self.timestamp;
                let effect = self.cop0.as_mut().expect("COP0 enabled").write(
                    idx,
                    value,
                    &mut self.tlb,
                    timestamp,
                );
                self.apply_cop0_write_effect(effect);
            }
            1 if self.config.has_fpu => {
                let fr = self.status_fr();
                self.fpu.as_mut().expect("FPU enabled").write64(idx, value, fr);
            }
            _ => {
                if let Some(c) = self.cops[cop].as_mut() {
                    c.write64(idx, value);
                }
            }
        }
    }

    pub(crate) fn cop_command(&mut self, cop: usize, word: u32) {
        match cop {
            0 if self.config.has_cop0 => {
                let effect = self
                    .cop0
                    .as_mut()
                    .expect("COP0 enabled")
                    .command(word, &mut self.tlb);
                match effect {
                    Cop0Effect::Eret { target } => {
                        self.set_pc_during_inst(target);
                        self.ll_bit = false;
                    }
                    Cop0Effect::None => {}
                }
            }
            1 if self.config.has_fpu => {
                let fr = self.status_fr();
                self.fpu.as_mut().expect("FPU enabled").command(word, fr);
            }
            _ => {
                if let Some(c) = self.cops[cop].as_mut() {
                    c.command(word);
                }
            }
        }
    }

    pub(crate) fn cop_flag(&self, cop: usize) -> bool {
        match cop {
            0 if self.config.has_cop0 => false,
            1 if self.config.has_fpu => self.fpu.as_ref().expect("FPU enabled").flag(),
            _ => self.cops[cop].as_ref().is_some_and(|c| c.flag()),
        }
    }

    fn apply_cop0_write_effect(&mut self, effect: Cop0WriteEffect) {
        match effect {
            Cop0WriteEffect::CompareWritten => self.compare_interrupt = false,
            Cop0WriteEffect::None => {}
        }
    }

    // ─── Memory paths ───

    /// Virtual-to-physical translation; identity when the TLB is disabled.
    fn translate(&self, address: u64) -> Option<Translation> {
        if !self.config.has_tlb {
            return Some(Translation {
                address: address as u32,
                read_only: false,
            });
        }
        self.tlb.translate(address)
    }

    /// Instruction fetch. `None` means a TLB miss was raised and PC now
    /// points at the vector.
    pub(crate) fn fetch(&mut self, bus: &mut impl Bus, address: u64) -> Option<u32> {
        match self.translate(address) {
            Some(t) => Some(bus.fetch(t.address)),
            None => {
                self.raise_tlb_exception(address, ExceptionCode::TlbLoad, bus);
                None
            }
        }
    }

    /// Non-faulting fetch, for block construction and idle-loop peeks.
    pub(crate) fn fetch_silent(&self, bus: &mut impl Bus, address: u64) -> Option<u32> {
        self.translate(address).map(|t| bus.fetch(t.address))
    }

    #[cold]
    fn unmapped_access(&self, address: u64, what: &str) -> ! {
        self.dump_trace();
        panic!(
            "{} from unmapped address {:#010X} (PC {:#010X})",
            what,
            address & 0xFFFF_FFFF,
            self.pc
        );
    }

    pub(crate) fn load8(&mut self, bus: &mut impl Bus, address: u64) -> Option<u8> {
        let t = match self.translate(address) {
            Some(t) => t,
            None => {
                self.raise_tlb_exception(address, ExceptionCode::TlbLoad, bus);
                return None;
            }
        };
        if self.config.use_hook {
            for hook in self.hooks.iter_mut().flatten() {
                hook.on_load8(address);
            }
        }
        match bus.load8(t.address) {
            Some(value) => Some(value),
            None => self.unmapped_access(address, "load8"),
        }
    }

    pub(crate) fn load16(&mut self, bus: &mut impl Bus, address: u64) -> Option<u16> {
        let t = match self.translate(address) {
            Some(t) => t,
            None => {
                self.raise_tlb_exception(address, ExceptionCode::TlbLoad, bus);
                return None;
            }
        };
        if self.config.use_hook {
            for hook in self.hooks.iter_mut().flatten() {
                hook.on_load16(address);
            }
        }
        match bus.load16(t.address) {
            Some(value) => Some(value),
            None => self.unmapped_access(address, "load16"),
        }
    }

    pub(crate) fn load32(&mut self, bus: &mut impl Bus, address: u64) -> Option<u32> {
        let t = match self.translate(address) {
            Some(t) => t,
            None => {
                self.raise_tlb_exception(address, ExceptionCode::TlbLoad, bus);
                return None;
            }
        };
        if self.config.use_hook {
            for hook in self.hooks.iter_mut().flatten() {
                hook.on_load32(address);
            }
        }
        match bus.load32(t.address) {
            Some(value) => Some(value),
            None => self.unmapped_access(address, "load32"),
        }
    }

    pub(crate) fn load64(&mut self, bus: &mut impl Bus, address: u64) -> Option<u64> {
        let t = match self.translate(address) {
            Some(t) => t,
            None => {
                self.raise_tlb_exception(address, ExceptionCode::TlbLoad, bus);
                return None;
            }
        };
        if self.config.use_hook {
            for hook in self.hooks.iter_mut().flatten() {
                hook.on_load64(address);
            }
        }
        match bus.load64(t.address) {
            Some(value) => Some(value),
            None => self.unmapped_access(address, "load64"),
        }
    }

    /// Stores are dropped while Status.IsolateCache is set (PlayStation
    /// cache-flush idiom).
    fn isolate_cache_active(&self) -> bool {
        self.config.has_isolate_cache_bit
            && self.cop0_status() & Status::ISOLATE_CACHE.bits() != 0
    }

    /// Translate for a store: a TLB miss raises TlbStore, a clear dirty bit
    /// raises TlbModification.
    fn store_translate(&mut self, address: u64, bus: &mut impl Bus) -> Option<u32> {
        let t = match self.translate(address) {
            Some(t) => t,
            None => {
                self.raise_tlb_exception(address, ExceptionCode::TlbStore, bus);
                return None;
            }
        };
        if t.read_only {
            self.raise_tlb_exception(address, ExceptionCode::TlbModification, bus);
            return None;
        }
        Some(t.address)
    }

    pub(crate) fn store8(&mut self, bus: &mut impl Bus, address: u64, value: u8) {
        if self.isolate_cache_active() {
            return;
        }
        let Some(phys) = self.store_translate(address, bus) else {
            return;
        };
        if self.config.use_hook {
            for hook in self.hooks.iter_mut().flatten() {
                hook.on_store8(address, value);
            }
        }
        bus.store8(phys, value);
    }

    pub(crate) fn store16(&mut self, bus: &mut impl Bus, address: u64, value: u16) {
        if self.isolate_cache_active() {
            return;
        }
        let Some(phys) = self.store_translate(address, bus) else {
            return;
        };
        if self.config.use_hook {
            for hook in self.hooks.iter_mut().flatten() {
                hook.on_store16(address, value);
            }
        }
        bus.store16(phys, value);
    }

    pub(crate) fn store32(&mut self, bus: &mut impl Bus, address: u64, value: u32) {
        if self.isolate_cache_active() {
            return;
        }
        let Some(phys) = self.store_translate(address, bus) else {
            return;
        };
        if self.config.use_hook {
            for hook in self.hooks.iter_mut().flatten() {
                hook.on_store32(address, value);
            }
        }
        bus.store32(phys, value);
    }

    pub(crate) fn store64(&mut self, bus: &mut impl Bus, address: u64, value: u64) {
        if self.isolate_cache_active() {
            return;
        }
        let Some(phys) = self.store_translate(address, bus) else {
            return;
        };
        if self.config.use_hook {
            for hook in self.hooks.iter_mut().flatten() {
                hook.on_store64(address, value);
            }
        }
        bus.store64(phys, value);
    }

    /// The CACHE instruction honors I-cache invalidations by dropping the
    /// decoded blocks covering the 32-byte line; D-cache ops are no-ops
    /// (correct for pure interpretation — a future recompiler would need
    /// more).
    pub(crate) fn cache_op(&mut self, op: u32, address: u64) {
        let dcache = op & 1 != 0;
        if dcache || !self.config.use_cached_interpreter {
            return;
        }
        let line = address & !0x1F;
        let Some(t) = self.translate(line) else {
            return;
        };
        self.cache.invalidate_range(t.address, t.address + 32);
    }

    // ─── Trace ring ───

    fn record_trace(&mut self, opcode: u32) {
        if self.trace.is_none() {
            return;
        }
        let mut gpr = [0u64; 32];
        for (i, slot) in gpr.iter_mut().enumerate() {
            *slot = self.read_gpr64(i);
        }
        let entry = TraceEntry {
            pc: self.pc,
            opcode,
            gpr,
        };
        self.trace.as_mut().expect("checked above").push(entry);
    }

    /// Flush the instruction trace through the logger. Called before every
    /// host-fault panic; a no-op when tracing is disabled.
    pub(crate) fn dump_trace(&self) {
        let Some(trace) = &self.trace else {
            return;
        };
        log::error!("===== processor trace dump =====");
        for entry in trace.iter() {
            let mut line = format!(
                "PC: {:08X} | OPCODE: {:08X} |",
                entry.pc & 0xFFFF_FFFF,
                entry.opcode
            );
            for (i, value) in entry.gpr.iter().enumerate().skip(1) {
                if self.config.is_64bit {
                    line.push_str(&format!(" r{i}: {value:016X}"));
                } else {
                    line.push_str(&format!(" r{i}: {:08X}", *value as u32));
                }
            }
            log::error!("{line}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::cop0::Cop0;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct TestBus {
        mem: Vec<u8>,
        interrupt: bool,
    }

    impl TestBus {
        fn new(size: usize) -> Self {
            Self {
                mem: vec![0; size],
                interrupt: false,
            }
        }

        /// Place instruction words at a physical address, little-endian on
        /// the wire.
        fn load_program(&mut self, start: u32, words: &[u32]) {
            for (i, word) in words.iter().enumerate() {
                let idx = start as usize + i * 4;
                self.mem[idx..idx + 4].copy_from_slice(&word.to_le_bytes());
            }
        }

        fn read_u32(&self, addr: u32) -> u32 {
            let i = addr as usize;
            u32::from_le_bytes(self.mem[i..i + 4].try_into().unwrap())
        }
    }

    /// Strip the kseg bits, mirroring how a real bus decodes the low
    /// physical range. Cores without a TLB send identity-translated
    /// addresses here.
    fn phys(addr: u32) -> usize {
        (addr & 0x1FFF_FFFF) as usize
    }

    impl Bus for TestBus {
        fn reset(&mut self) {}

        fn fetch(&mut self, addr: u32) -> u32 {
            let i = phys(addr);
            match self.mem.get(i..i + 4) {
                Some(bytes) => u32::from_le_bytes(bytes.try_into().unwrap()),
                None => 0, // outside the test image: reads as NOP
            }
        }

        fn load8(&mut self, addr: u32) -> Option<u8> {
            self.mem.get(phys(addr)).copied()
        }

        fn load16(&mut self, addr: u32) -> Option<u16> {
            let i = phys(addr);
            let bytes = self.mem.get(i..i + 2)?;
            Some(u16::from_le_bytes(bytes.try_into().unwrap()))
        }

        fn load32(&mut self, addr: u32) -> Option<u32> {
            let i = phys(addr);
            let bytes = self.mem.get(i..i + 4)?;
            Some(u32::from_le_bytes(bytes.try_into().unwrap()))
        }

        fn load64(&mut self, addr: u32) -> Option<u64> {
            let i = phys(addr);
            let bytes = self.mem.get(i..i + 8)?;
            Some(u64::from_le_bytes(bytes.try_into().unwrap()))
        }

        fn store8(&mut self, addr: u32, value: u8) {
            let i = phys(addr);
            self.mem[i] = value;
        }

        fn store16(&mut self, addr: u32, value: u16) {
            let i = phys(addr);
            self.mem[i..i + 2].copy_from_slice(&value.to_le_bytes());
        }

        fn store32(&mut self, addr: u32, value: u32) {
            let i = phys(addr);
            self.mem[i..i + 4].copy_from_slice(&value.to_le_bytes());
        }

        fn store64(&mut self, addr: u32, value: u64) {
            let i = phys(addr);
            self.mem[i..i + 8].copy_from_slice(&value.to_le_bytes());
        }

        fn interrupt(&mut self) -> bool {
            self.interrupt
        }
    }

    /// MIPS I-style core, uncached, no idle-loop detection.
    fn cfg32() -> CoreConfig {
        let mut config = CoreConfig::mips_i();
        config.detect_idle_loops = false;
        config.cpi = 0x100;
        config
    }

    /// MIPS III-style core, uncached unless a test opts in.
    fn cfg64() -> CoreConfig {
        let mut config = CoreConfig::mips_iii();
        config.use_cached_interpreter = false;
        config.detect_idle_loops = false;
        config.big_endian = false;
        config.cpi = 0x100;
        config
    }

    fn cause_code(core: &Core) -> u32 {
        (core.cop0.as_ref().unwrap().cause() >> 2) & 0x1F
    }

    fn run_until_pc(core: &mut Core, bus: &mut TestBus, end_pc: u64, max_calls: u32) {
        let mut calls = 0;
        while core.pc() != end_pc && calls < max_calls {
            let spent = core.run(1, bus);
            assert!(spent > 0, "engine spent zero cycles");
            calls += 1;
        }
        assert_eq!(core.pc(), end_pc, "engine did not reach target pc");
    }

    // ── Register file (properties 1 and 6) ──

    #[test]
    fn gpr0_is_hardwired_to_zero() {
        let mut core = Core::new(cfg32());
        core.set_gpr(0, 0xDEAD_BEEF);
        assert_eq!(core.gpr(0), 0);

        let mut bus = TestBus::new(0x2000);
        bus.load_program(0x1000, &[0x3400_0055]); // ori r0, r0, 0x55
        core.set_pc(0x1000);
        core.run(1, &mut bus);
        assert_eq!(core.gpr(0), 0);
    }

    #[test]
    fn gpr64_roundtrip_masks_on_32bit_cores() {
        let mut core = Core::new(cfg64());
        core.write_gpr64(1, 0x1234_5678_9ABC_DEF0);
        assert_eq!(core.read_gpr64(1), 0x1234_5678_9ABC_DEF0);

        let mut core = Core::new(cfg32());
        core.write_gpr64(1, 0x1234_5678_9ABC_DEF0);
        assert_eq!(core.read_gpr64(1), 0xFFFF_FFFF_9ABC_DEF0);
        core.write_gpr64(2, 0x0000_0000_1BCD_EF00);
        assert_eq!(core.read_gpr64(2), 0x1BCD_EF00);
    }

    // ── S1: ADD overflow ──

    #[test]
    fn add_overflow_vectors_on_64bit_core() {
        let mut core = Core::new(cfg64());
        let mut bus = TestBus::new(0x2000);
        bus.load_program(0x1000, &[0x0022_1820]); // add r3, r1, r2
        core.set_pc(0x8000_1000);
        core.set_gpr(1, 0x7FFF_FFFF);
        core.set_gpr(2, 1);
        core.run(1, &mut bus);

        assert_eq!(core.pc(), 0x8000_0180);
        assert_eq!(cause_code(&core), 12);
        assert_eq!(core.cop0.as_ref().unwrap().epc(), 0x8000_1000);
        assert_eq!(core.gpr(3), 0);
    }

    #[test]
    fn add_overflow_vectors_on_32bit_core() {
        let mut core = Core::new(cfg32());
        let mut bus = TestBus::new(0x2000);
        bus.load_program(0x1000, &[0x0022_1820]); // add r3, r1, r2
        core.set_pc(0x1000);
        core.set_gpr(1, 0x7FFF_FFFF);
        core.set_gpr(2, 1);
        core.run(1, &mut bus);

        assert_eq!(core.pc(), 0x8000_0080); // BEV clear
        assert_eq!(cause_code(&core), 12);
        assert_eq!(core.cop0.as_ref().unwrap().epc(), 0x1000);
        assert_eq!(core.gpr(3), 0);
    }

    #[test]
    fn add_without_overflow_writes_result() {
        let mut core = Core::new(cfg32());
        let mut bus = TestBus::new(0x2000);
        bus.load_program(0x1000, &[0x0022_1820]); // add r3, r1, r2
        core.set_pc(0x1000);
        core.set_gpr(1, 40);
        core.set_gpr(2, 2);
        core.run(1, &mut bus);
        assert_eq!(core.gpr(3), 42);
        assert_eq!(core.pc(), 0x1004);
    }

    // ── S2: branch + delay slot ──

    #[test]
    fn branch_executes_delay_slot_then_jumps() {
        let mut core = Core::new(cfg32());
        let mut bus = TestBus::new(0x2000);
        bus.load_program(
            0x1000,
            &[
                0x1000_0002, // beq r0, r0, +2 (target 0x100C)
                0x3401_0055, // ori r1, r0, 0x55 (delay slot)
                0x0000_0000, // nop (skipped)
                0x3401_00AA, // ori r1, r0, 0xAA
            ],
        );
        core.set_pc(0x1000);
        core.run(2, &mut bus);

        assert_eq!(core.gpr(1), 0x55);
        assert_eq!(core.pc(), 0x100C);
    }

    #[test]
    fn interrupt_during_pending_branch_delay_sets_bd() {
        let mut core = Core::new(cfg32());
        // IE + IM2.
        let status = core.cop0.as_ref().unwrap().status();
        core.cop0.as_mut().unwrap().set_status(status | 0x0401);

        let mut bus = TestBus::new(0x2000);
        bus.load_program(
            0x1000,
            &[
                0x1000_0002, // beq r0, r0, +2 (taken)
                0x3401_0055, // ori r1, r0, 0x55 (delay slot)
            ],
        );
        core.set_pc(0x1000);
        core.run(1, &mut bus); // only the branch retires; the slot is pending

        bus.interrupt = true;
        core.run(1, &mut bus); // the poll fires before the delay slot runs

        let cop0 = core.cop0.as_ref().unwrap();
        assert_eq!(cause_code(&core), 0);
        assert_eq!(cop0.epc(), 0x1000, "EPC points at the branch");
        assert_ne!(cop0.cause() & (1 << 31), 0, "Cause.BD set");
        assert_eq!(core.gpr(1), 0, "delay slot did not execute");
    }

    // ── S3: branch-likely nullification ──

    #[test]
    fn branch_likely_nullifies_delay_slot_when_not_taken() {
        let mut core = Core::new(cfg64());
        let mut bus = TestBus::new(0x2000);
        bus.load_program(
            0x1000,
            &[
                0x5001_0001, // beql r0, r1, +1 (not taken: r1 = 1)
                0x3402_0077, // ori r2, r0, 0x77 (nullified)
                0x0000_0000, // nop
            ],
        );
        core.set_pc(0x8000_1000);
        core.set_gpr(1, 1);
        core.run(2, &mut bus);

        assert_eq!(core.gpr(2), 0, "delay slot was nullified");
        assert_eq!(core.pc(), 0x8000_100C);
    }

    #[test]
    fn branch_likely_taken_executes_delay_slot() {
        let mut core = Core::new(cfg64());
        let mut bus = TestBus::new(0x2000);
        bus.load_program(
            0x1000,
            &[
                0x5001_0002, // beql r0, r1, +2 (taken: r1 = 0)
                0x3402_0077, // ori r2, r0, 0x77 (delay slot)
            ],
        );
        core.set_pc(0x8000_1000);
        core.run(2, &mut bus);

        assert_eq!(core.gpr(2), 0x77);
        assert_eq!(core.pc(), 0x8000_100C);
    }

    // ── S4: load-delay slot ──

    #[test]
    fn load_delay_interlock_cancels_pending_load() {
        let mut core = Core::new(cfg32());
        let mut bus = TestBus::new(0x2000);
        bus.store32(0, 0xCAFE_BABE);
        bus.load_program(
            0x1000,
            &[
                0x8C01_0000, // lw r1, 0(r0)
                0x3401_1234, // ori r1, r0, 0x1234 (cancels the pending load)
                0x0000_0000, // nop
            ],
        );
        core.set_pc(0x1000);
        core.run(3, &mut bus);

        assert_eq!(core.gpr(1), 0x1234);
    }

    #[test]
    fn load_delay_slot_sees_stale_value() {
        let mut core = Core::new(cfg32());
        let mut bus = TestBus::new(0x2000);
        bus.store32(0, 0xCAFE_BABE);
        bus.load_program(
            0x1000,
            &[
                0x8C01_0000, // lw r1, 0(r0)
                0x0022_1025, // or r2, r1, r2 (delay slot: reads old r1)
                0x0000_0000, // nop
            ],
        );
        core.set_pc(0x1000);
        core.run(3, &mut bus);

        assert_eq!(core.gpr(2), 0, "delay slot read the stale register");
        assert_eq!(core.gpr(1) as u32, 0xCAFE_BABE, "load landed afterwards");
    }

    #[test]
    fn loads_land_immediately_without_load_delay() {
        let mut config = cfg32();
        config.has_load_delay = false;
        let mut core = Core::new(config);
        let mut bus = TestBus::new(0x2000);
        bus.store32(0, 0xCAFE_BABE);
        bus.load_program(
            0x1000,
            &[
                0x8C01_0000, // lw r1, 0(r0)
                0x0022_1025, // or r2, r1, r2
            ],
        );
        core.set_pc(0x1000);
        core.run(2, &mut bus);

        assert_eq!(core.gpr(2) as u32, 0xCAFE_BABE);
    }

    // ── S5: TLB miss on load ──

    #[test]
    fn tlb_miss_on_load_fills_cop0_and_vectors_to_refill_handler() {
        let mut core = Core::new(cfg64());
        let mut bus = TestBus::new(0x2000);
        bus.load_program(0x1000, &[0x8C41_0000]); // lw r1, 0(r2)
        core.tlb.set_entry_hi(0xAB); // current ASID
        core.set_pc(0x8000_1000);
        core.set_gpr(2, 0x0000_1234);
        core.run(1, &mut bus);

        let cop0 = core.cop0.as_ref().unwrap();
        assert_eq!(cop0.bad_vaddr(), 0x0000_1234);
        assert_eq!(core.tlb.entry_hi(), 0xAB, "VPN2 zero, ASID preserved");
        assert_eq!(cause_code(&core), 2);
        assert_eq!(core.pc(), 0x8000_0000, "refill vector while EXL clear");
    }

    #[test]
    fn tlb_mapped_fetch_and_readonly_store() {
        let mut core = Core::new(cfg64());
        let mut bus = TestBus::new(0x4000);
        // Map virtual 0x0000_0000/0x0000_1000 to physical 0x2000/0x3000;
        // valid but clean (D clear).
        core.tlb.set_entry(
            0,
            crate::cpu::tlb::TlbEntry {
                entry_hi: 0,
                entry_lo0: (2 << 6) | 0b010,
                entry_lo1: (3 << 6) | 0b010,
                page_mask: 0,
            },
        );
        bus.load_program(0x2000, &[0x3401_0042]); // ori r1, r0, 0x42 at virtual 0
        core.set_pc(0);
        core.run(1, &mut bus);
        assert_eq!(core.gpr(1), 0x42, "fetch went through the mapped page");

        // A store into the clean page raises TLB-Mod.
        bus.load_program(0x2004, &[0xAC41_0000]); // sw r1, 0(r2)
        core.set_gpr(2, 0x10);
        core.run(1, &mut bus);
        assert_eq!(cause_code(&core), 1);
        assert_eq!(core.cop0.as_ref().unwrap().bad_vaddr(), 0x10);
    }

    // ── S6 and property 8: block-cache invalidation ──

    #[test]
    fn invalidation_rebuilds_patched_block() {
        let mut config = cfg64();
        config.use_cached_interpreter = true;
        let mut core = Core::new(config);
        let mut bus = TestBus::new(0x2000);
        bus.load_program(
            0x400,
            &[
                0x3401_0011, // ori r1, r0, 0x11
                0x1000_FFFE, // beq r0, r0, -2 (loop to 0x400)
                0x0000_0000, // nop
            ],
        );
        core.set_pc(0x8000_0400);
        core.run(16, &mut bus);
        assert_eq!(core.gpr(1), 0x11);

        // Patch the instruction and invalidate: the engine must observe the
        // new opcode on the next entry, with no stale lookup-cache slots.
        core.invalidate(0x400);
        bus.load_program(0x400, &[0x3401_0022]); // ori r1, r0, 0x22
        core.run(16, &mut bus);
        assert_eq!(core.gpr(1), 0x22);
    }

    #[test]
    fn unpatched_block_without_invalidation_stays_cached() {
        let mut config = cfg64();
        config.use_cached_interpreter = true;
        let mut core = Core::new(config);
        let mut bus = TestBus::new(0x2000);
        bus.load_program(
            0x400,
            &[
                0x3401_0011, // ori r1, r0, 0x11
                0x1000_FFFE, // beq r0, r0, -2
                0x0000_0000, // nop
            ],
        );
        core.set_pc(0x8000_0400);
        core.run(16, &mut bus);

        // Patch without invalidating: the stale decoded block keeps
        // executing (the documented coherence contract).
        bus.load_program(0x400, &[0x3401_0022]);
        core.run(16, &mut bus);
        assert_eq!(core.gpr(1), 0x11);
    }

    // ── Property 7: cached and uncached agree ──

    #[test]
    fn cached_and_uncached_produce_identical_state() {
        let program = [
            0x3C0C_8000, // lui r12, 0x8000
            0x2408_0005, // addiu r8, r0, 5
            0x2409_0007, // addiu r9, r0, 7
            0x0109_5021, // addu r10, r8, r9
            0xAD8A_0100, // sw r10, 0x100(r12)
            0x8D8B_0100, // lw r11, 0x100(r12)
            0x3562_1234, // ori r2, r11, 0x1234
            0x1000_FFFF, // beq r0, r0, -1 (spin)
            0x0000_0000, // nop
        ];
        let end_pc = 0x8000_1000 + 7 * 4;

        let mut uncached = Core::new(cfg64());
        let mut bus_a = TestBus::new(0x2000);
        bus_a.load_program(0x1000, &program);
        uncached.set_pc(0x8000_1000);
        run_until_pc(&mut uncached, &mut bus_a, end_pc, 64);

        let mut config = cfg64();
        config.use_cached_interpreter = true;
        let mut cached = Core::new(config);
        let mut bus_b = TestBus::new(0x2000);
        bus_b.load_program(0x1000, &program);
        cached.set_pc(0x8000_1000);
        run_until_pc(&mut cached, &mut bus_b, end_pc, 64);

        assert_eq!(uncached.gpr, cached.gpr);
        assert_eq!(uncached.hi, cached.hi);
        assert_eq!(uncached.lo, cached.lo);
        assert_eq!(uncached.gpr(2), 0x123C);
        assert_eq!(bus_a.read_u32(0x100), 12);
        assert_eq!(bus_b.read_u32(0x100), 12);
    }

    // ── Alignment and address errors ──

    #[test]
    fn misaligned_lw_raises_address_error() {
        let mut core = Core::new(cfg32());
        let mut bus = TestBus::new(0x2000);
        bus.load_program(0x1000, &[0x8C41_0000]); // lw r1, 0(r2)
        core.set_pc(0x1000);
        core.set_gpr(2, 0x102);
        core.run(1, &mut bus);

        assert_eq!(cause_code(&core), 4); // AddressErrorLoad
        assert_eq!(core.cop0.as_ref().unwrap().bad_vaddr(), 0x102);
        assert_eq!(core.pc(), 0x8000_0080);
    }

    #[test]
    fn misaligned_access_allowed_when_configured() {
        let mut config = cfg32();
        config.allow_misaligned_access = true;
        let mut core = Core::new(config);
        let mut bus = TestBus::new(0x2000);
        bus.store32(0x100, 0xAABB_CCDD);
        bus.load_program(
            0x1000,
            &[
                0x8C41_0000, // lw r1, 0(r2)
                0x0000_0000, // nop
                0x0000_0000, // nop
            ],
        );
        core.set_pc(0x1000);
        core.set_gpr(2, 0x102);
        core.run(3, &mut bus);
        assert_eq!(core.gpr(1) as u32, bus.read_u32(0x102));
    }

    // ── Unaligned lane merges (big-endian lane mapping) ──

    #[test]
    fn lwl_from_aligned_address_reads_whole_big_endian_word() {
        let mut config = cfg64();
        config.big_endian = true;
        let mut core = Core::new(config);
        let mut bus = TestBus::new(0x2000);
        bus.mem[0x100..0x104].copy_from_slice(&[0xAA, 0xBB, 0xCC, 0xDD]);
        bus.load_program(0x1000, &[0x8841_0000]); // lwl r1, 0(r2)
        // LWL at the aligned address pulls the whole word, MSB first.
        core.set_pc(0x8000_1000);
        core.set_gpr(2, 0x8000_0100);
        core.run(1, &mut bus);
        assert_eq!(core.gpr(1) as u32, 0xAABB_CCDD);
    }

    #[test]
    fn lwr_at_last_byte_assembles_big_endian_word() {
        let mut config = cfg64();
        config.big_endian = true;
        let mut core = Core::new(config);
        let mut bus = TestBus::new(0x2000);
        bus.mem[0x100..0x104].copy_from_slice(&[0xAA, 0xBB, 0xCC, 0xDD]);
        bus.load_program(0x1000, &[0x9841_0103]); // lwr r1, 0x103(r2)
        core.set_pc(0x8000_1000);
        core.set_gpr(2, 0x8000_0000);
        core.run(1, &mut bus);
        assert_eq!(core.gpr(1) as u32, 0xAABB_CCDD);
    }

    // ── Coprocessor plumbing ──

    #[test]
    fn cop_unusable_records_coprocessor_number() {
        let mut core = Core::new(cfg32());
        let mut bus = TestBus::new(0x2000);
        bus.load_program(0x1000, &[0xC841_0000]); // lwc2 r1, 0(r2)
        core.set_pc(0x1000);
        core.run(1, &mut bus);

        let cop0 = core.cop0.as_ref().unwrap();
        assert_eq!(cause_code(&core), 11);
        assert_eq!((cop0.cause() >> 28) & 3, 2, "Cause.CE names COP2");
        assert_eq!(core.pc(), 0x8000_0080);
    }

    struct RecordingCop {
        commands: Rc<RefCell<Vec<u32>>>,
        regs: Rc<RefCell<Vec<u32>>>,
    }

    impl Default for RecordingCop {
        fn default() -> Self {
            Self {
                commands: Rc::default(),
                regs: Rc::new(RefCell::new(vec![0; 64])),
            }
        }
    }

    impl Coprocessor for RecordingCop {
        fn reset(&mut self) {}
        fn command(&mut self, word: u32) {
            self.commands.borrow_mut().push(word);
        }
        fn read32(&mut self, idx: usize) -> u32 {
            self.regs.borrow()[idx]
        }
        fn write32(&mut self, idx: usize, value: u32) {
            self.regs.borrow_mut()[idx] = value;
        }
    }

    #[test]
    fn cop_decoding_override_redirects_moves_to_commands() {
        let mut config = cfg32();
        config.cop_decoding_override = 1 << 2;
        let mut core = Core::new(config);
        // Enable COP2 in Status.
        let status = core.cop0.as_ref().unwrap().status();
        core.cop0.as_mut().unwrap().set_status(status | (1 << 30));

        let cop = RecordingCop::default();
        let commands = Rc::clone(&cop.commands);
        core.connect_cop(2, Box::new(cop)).unwrap();

        let mut bus = TestBus::new(0x2000);
        bus.load_program(0x1000, &[0x4886_0000]); // mtc2 r6, r0
        core.set_pc(0x1000);
        core.run(1, &mut bus);

        assert_eq!(commands.borrow().as_slice(), &[0x4886_0000]);
    }

    #[test]
    fn external_cop_moves_without_override() {
        let mut core = Core::new(cfg32());
        let status = core.cop0.as_ref().unwrap().status();
        core.cop0.as_mut().unwrap().set_status(status | (1 << 30));

        let cop = RecordingCop::default();
        let regs = Rc::clone(&cop.regs);
        core.connect_cop(2, Box::new(cop)).unwrap();

        let mut bus = TestBus::new(0x2000);
        bus.load_program(
            0x1000,
            &[
                0x4886_1000, // mtc2 r6, cop2r2
                0x4802_1000, // mfc2 r2, cop2r2
            ],
        );
        core.set_pc(0x1000);
        core.set_gpr(6, 0x5555);
        core.run(2, &mut bus);

        assert_eq!(regs.borrow()[2], 0x5555);
        assert_eq!(core.gpr(2), 0x5555);
    }

    #[test]
    fn connect_cop_rejects_owned_slots() {
        let mut core = Core::new(cfg32());
        let err = core.connect_cop(0, Box::new(RecordingCop::default()));
        assert!(matches!(err, Err(CoreError::OccupiedCopSlot(0, _))));
        let err = core.connect_cop(7, Box::new(RecordingCop::default()));
        assert!(matches!(err, Err(CoreError::InvalidCopSlot(7))));
    }

    // ── Isolate cache ──

    #[test]
    fn stores_dropped_while_isolate_cache_set() {
        let mut core = Core::new(cfg32());
        let status = core.cop0.as_ref().unwrap().status();
        core.cop0.as_mut().unwrap().set_status(status | (1 << 16));

        let mut bus = TestBus::new(0x2000);
        bus.load_program(0x1000, &[0xAC41_0000]); // sw r1, 0(r2)
        core.set_pc(0x1000);
        core.set_gpr(1, 0x1234_5678);
        core.set_gpr(2, 0x100);
        core.run(1, &mut bus);
        assert_eq!(bus.read_u32(0x100), 0, "store swallowed");

        // Clear the bit: the store goes through.
        let status = core.cop0.as_ref().unwrap().status();
        core.cop0.as_mut().unwrap().set_status(status & !(1 << 16));
        core.set_pc(0x1000);
        core.run(1, &mut bus);
        assert_eq!(bus.read_u32(0x100), 0x1234_5678);
    }

    // ── ERET / exceptions ──

    #[test]
    fn syscall_and_eret_roundtrip() {
        let mut core = Core::new(cfg64());
        let mut bus = TestBus::new(0x2000);
        bus.load_program(0x1000, &[0x0000_000C]); // syscall
        bus.load_program(0x180, &[0x4200_0018]); // eret at the vector
        core.set_pc(0x8000_1000);
        core.set_llbit(true);
        core.run(1, &mut bus);

        assert_eq!(core.pc(), 0x8000_0180);
        assert_eq!(cause_code(&core), 8);
        let status = core.cop0.as_ref().unwrap().status();
        assert_ne!(status & 0x2, 0, "EXL set");

        core.run(1, &mut bus);
        assert_eq!(core.pc(), 0x8000_1000, "ERET returned to EPC");
        let status = core.cop0.as_ref().unwrap().status();
        assert_eq!(status & 0x2, 0, "EXL cleared");
        assert!(!core.ll_bit, "ERET cleared LLbit");
    }

    #[test]
    fn mips1_exception_pushes_mode_stack_and_rfe_pops_it() {
        let mut core = Core::new(cfg32());
        let mut bus = TestBus::new(0x2000);
        // IE set before the exception.
        let status = core.cop0.as_ref().unwrap().status();
        core.cop0.as_mut().unwrap().set_status(status | 0x1);
        bus.load_program(0x1000, &[0x0000_000C]); // syscall
        bus.load_program(0x80, &[0x4200_0010]); // rfe at the vector
        core.set_pc(0x1000);
        core.run(1, &mut bus);

        let sr = core.cop0.as_ref().unwrap().status();
        assert_eq!(sr & 0x3F, 0b000100, "stack pushed: IE moved to previous");

        core.run(1, &mut bus);
        let sr = core.cop0.as_ref().unwrap().status();
        assert_eq!(sr & 0x3F, 0b000001, "RFE restored IE");
    }

    // ── Interrupts ──

    #[test]
    fn compare_interrupt_fires_and_clears_on_compare_write() {
        let mut core = Core::new(cfg64());
        // IE + IM7.
        let status = core.cop0.as_ref().unwrap().status();
        core.cop0.as_mut().unwrap().set_status(status | 0x8001);
        core.cop_write32(0, Cop0::COMPARE, 4);

        let mut bus = TestBus::new(0x2000); // all NOPs
        core.set_pc(0x8000_1000);
        core.run(16, &mut bus); // Count crosses Compare during this slice
        let pc_before_poll = core.pc();
        core.run(1, &mut bus); // next slice polls and vectors

        assert!(core.compare_interrupt);
        assert_eq!(cause_code(&core), 0, "interrupt exception");
        let cop0 = core.cop0.as_ref().unwrap();
        assert_eq!(cop0.epc(), pc_before_poll);
        assert_ne!(cop0.cause() & (1 << 15), 0, "Cause.IP7 set");
        assert_eq!(core.pc(), 0x8000_0184, "one handler instruction retired");

        // Writing Compare acknowledges the pending interrupt.
        core.cop_write32(0, Cop0::COMPARE, 0x1_0000);
        assert!(!core.compare_interrupt);
    }

    #[test]
    fn external_interrupt_line_taken_between_instructions() {
        let mut core = Core::new(cfg64());
        // IE + IM2.
        let status = core.cop0.as_ref().unwrap().status();
        core.cop0.as_mut().unwrap().set_status(status | 0x0401);

        let mut bus = TestBus::new(0x2000);
        core.set_pc(0x8000_1000);
        core.run(4, &mut bus);
        assert_eq!(core.pc(), 0x8000_1000 + 4 * 4, "no interrupt yet");

        bus.interrupt = true;
        core.run(4, &mut bus);
        assert_eq!(cause_code(&core), 0);
        let cause = core.cop0.as_ref().unwrap().cause();
        assert_ne!(cause & (1 << 10), 0, "Cause.IP2 reflects the line");
    }

    #[test]
    fn masked_interrupt_is_not_taken() {
        let mut core = Core::new(cfg64());
        // IE set but IM2 clear.
        let status = core.cop0.as_ref().unwrap().status();
        core.cop0.as_mut().unwrap().set_status(status | 0x1);

        let mut bus = TestBus::new(0x2000);
        bus.interrupt = true;
        core.set_pc(0x8000_1000);
        core.run(4, &mut bus);
        assert_eq!(core.pc(), 0x8000_1000 + 4 * 4);
    }

    // ── Halt and cycle accounting ──

    #[test]
    fn halt_charges_remaining_budget_as_idle() {
        let mut core = Core::new(cfg32());
        let mut bus = TestBus::new(0x2000);
        core.set_pc(0x1000);
        core.set_halt(true);
        let spent = core.run(100, &mut bus);
        assert_eq!(spent, 100);
        assert_eq!(core.timestamp(), 100);
        assert_eq!(core.pc(), 0x1000, "nothing executed");
    }

    #[test]
    fn cpi_fixed_point_accumulates_fractions() {
        let mut config = cfg32();
        config.cpi = 0x180; // 1.5 cycles per instruction
        let mut core = Core::new(config);
        let mut bus = TestBus::new(0x2000);
        core.set_pc(0x1000);
        let spent = core.run(3, &mut bus); // two instructions = 3 cycles
        assert_eq!(spent, 3);
        assert_eq!(core.pc(), 0x1008);
    }

    #[test]
    fn idle_loop_detection_fast_forwards() {
        let mut config = cfg32();
        config.detect_idle_loops = true;
        config.use_hook = true;
        let mut core = Core::new(config);

        #[derive(Default)]
        struct Counter(Rc<RefCell<u32>>);
        impl Hook for Counter {
            fn on_pre_execute(&mut self, _pc: u64, _opcode: u32) {
                *self.0.borrow_mut() += 1;
            }
        }
        let counter = Counter::default();
        let executed = Rc::clone(&counter.0);
        core.connect_hook(0, Box::new(counter)).unwrap();

        let mut bus = TestBus::new(0x2000);
        bus.load_program(
            0x1000,
            &[
                0x1000_FFFF, // beq r0, r0, -1
                0x0000_0000, // nop
            ],
        );
        core.set_pc(0x1000);
        core.run(400, &mut bus);
        assert!(
            *executed.borrow() < 40,
            "idle loop fast-forwarded instead of spinning ({} instructions)",
            executed.borrow()
        );
    }

    // ── Hooks ──

    #[test]
    fn hooks_observe_memory_traffic() {
        #[derive(Default)]
        struct Spy {
            loads: Rc<RefCell<Vec<u64>>>,
            stores: Rc<RefCell<Vec<(u64, u32)>>>,
        }
        impl Hook for Spy {
            fn on_load32(&mut self, address: u64) {
                self.loads.borrow_mut().push(address);
            }
            fn on_store32(&mut self, address: u64, value: u32) {
                self.stores.borrow_mut().push((address, value));
            }
        }

        let mut config = cfg32();
        config.use_hook = true;
        let mut core = Core::new(config);
        let spy = Spy::default();
        let loads = Rc::clone(&spy.loads);
        let stores = Rc::clone(&spy.stores);
        core.connect_hook(0, Box::new(spy)).unwrap();

        let mut bus = TestBus::new(0x2000);
        bus.store32(0x100, 77);
        bus.load_program(
            0x1000,
            &[
                0x8C41_0000, // lw r1, 0(r2)
                0x0000_0000, // nop
                0xAC41_0004, // sw r1, 4(r2)
            ],
        );
        core.set_pc(0x1000);
        core.set_gpr(2, 0x100);
        core.run(3, &mut bus);

        assert_eq!(loads.borrow().as_slice(), &[0x100]);
        assert_eq!(stores.borrow().as_slice(), &[(0x104, 77)]);
        assert_eq!(bus.read_u32(0x104), 77);
    }

    // ── 64-bit operations ──

    #[test]
    fn doubleword_arithmetic_and_shifts() {
        let mut core = Core::new(cfg64());
        let mut bus = TestBus::new(0x2000);
        bus.load_program(
            0x1000,
            &[
                0x0022_182D, // daddu r3, r1, r2
                0x0003_20F8, // dsll r4, r3, 3
                0x0003_2C3A, // dsrl r5, r3, 16
            ],
        );
        core.set_pc(0x8000_1000);
        core.set_gpr(1, 0x1_0000_0000);
        core.set_gpr(2, 0x2_0000_0001);
        core.run(3, &mut bus);

        assert_eq!(core.gpr(3), 0x3_0000_0001);
        assert_eq!(core.gpr(4), 0x3_0000_0001 << 3);
        assert_eq!(core.gpr(5), 0x3_0000_0001 >> 16);
    }

    #[test]
    fn ld_sd_roundtrip_and_ll_sc() {
        let mut core = Core::new(cfg64());
        let mut bus = TestBus::new(0x2000);
        bus.load_program(
            0x1000,
            &[
                0xFC41_0000, // sd r1, 0(r2)
                0xDC43_0000, // ld r3, 0(r2)
                0xC044_0000, // ll r4, 0(r2)
                0xE045_0000, // sc r5, 0(r2)
            ],
        );
        core.set_pc(0x8000_1000);
        core.set_gpr(1, 0x0123_4567_89AB_CDEF);
        core.set_gpr(2, 0x8000_0100); // kseg0 -> physical 0x100
        core.set_gpr(5, 0x42);
        core.run(4, &mut bus);

        assert_eq!(core.gpr(3), 0x0123_4567_89AB_CDEF);
        assert_eq!(core.gpr(4), 0xFFFF_FFFF_89AB_CDEF, "ll sign-extends");
        assert_eq!(core.gpr(5), 1, "sc succeeded under LLbit");
        assert_eq!(bus.read_u32(0x100), 0x42);
    }

    #[test]
    fn sc_fails_without_llbit() {
        let mut core = Core::new(cfg64());
        let mut bus = TestBus::new(0x2000);
        bus.store32(0x100, 0x1111_1111);
        bus.load_program(0x1000, &[0xE045_0000]); // sc r5, 0(r2)
        core.set_pc(0x8000_1000);
        core.set_gpr(2, 0x8000_0100);
        core.set_gpr(5, 0x42);
        core.run(1, &mut bus);

        assert_eq!(core.gpr(5), 0, "sc failed");
        assert_eq!(bus.read_u32(0x100), 0x1111_1111, "memory untouched");
    }

    // ── MFC0 / MTC0 through the decoded path ──

    #[test]
    fn mtc0_mfc0_roundtrip() {
        let mut core = Core::new(cfg64());
        let mut bus = TestBus::new(0x2000);
        bus.load_program(
            0x1000,
            &[
                0x4081_7000, // mtc0 r1, $14 (EPC)
                0x4002_7000, // mfc0 r2, $14
            ],
        );
        core.set_pc(0x8000_1000);
        core.set_gpr(1, 0x0000_BEEF);
        core.run(2, &mut bus);
        assert_eq!(core.gpr(2), 0x0000_BEEF);
    }

    // ── Reset ──

    #[test]
    fn reset_restores_cold_state() {
        let mut core = Core::new(cfg64());
        let mut bus = TestBus::new(0x2000);
        bus.load_program(0x1000, &[0x2401_0007]); // addiu r1, r0, 7
        core.set_pc(0x8000_1000);
        core.run(1, &mut bus);
        assert_eq!(core.gpr(1), 7);
        assert!(core.timestamp() > 0);

        core.reset();
        assert_eq!(core.gpr(1), 0);
        assert_eq!(core.pc(), 0);
        assert_eq!(core.timestamp(), 0);
        assert_eq!(core.cop0.as_ref().unwrap().status(), 0x3400_0000);
    }
}
