/// Per-instance configuration. Immutable once the core is constructed.
///
/// The same engine emulates a MIPS I-class core (PlayStation-style) or a
/// MIPS III-class core (N64-style) depending on these switches; use the
/// [`CoreConfig::mips_i`] / [`CoreConfig::mips_iii`] presets as starting
/// points and tweak fields as needed.
#[derive(Clone, Debug)]
pub struct CoreConfig {
    /// Full 64-bit register file and the MIPS III instruction set. When
    /// clear, register reads mask to 32 bits and sign-extend, and the
    /// doubleword/branch-likely/LL-SC/CACHE encodings decode as reserved.
    pub is_64bit: bool,
    /// Swaps the byte-lane mapping of the unaligned load/store instructions
    /// (LWL/LWR/SWL/SWR and the doubleword variants).
    pub big_endian: bool,
    /// MIPS I load-delay slot: a loaded value becomes visible one
    /// instruction after the load retires, and an intervening write to the
    /// same destination cancels the pending load.
    pub has_load_delay: bool,
    /// Route arithmetic overflow, address errors, syscall, breakpoint etc.
    /// through the exception pipeline. When clear they are ignored (overflow
    /// and breakpoint stay observable through host hooks).
    pub has_exception: bool,
    /// Suppress AddrL/AddrS alignment exceptions.
    pub allow_misaligned_access: bool,
    /// Enable the system-control coprocessor. When clear a null coprocessor
    /// answers COP0 traffic and interrupt/compare polling is disabled.
    pub has_cop0: bool,
    /// Enable the mapping TLB; otherwise translation is the identity.
    pub has_tlb: bool,
    /// Enable the COP1 FPU; otherwise a null coprocessor.
    pub has_fpu: bool,
    /// Drop stores while Status bit 16 (isolate cache) is set.
    pub has_isolate_cache_bit: bool,
    /// Bit N redirects coprocessor N's LWC/SWC/MFC/MTC/CFC/CTC encodings to
    /// the command port, for coprocessors whose "move" opcodes are really
    /// command dispatches (PlayStation GTE).
    pub cop_decoding_override: u8,
    /// Fire the pre-execute and memory-access hooks.
    pub use_hook: bool,
    /// Dispatch through the decoded basic-block cache instead of
    /// fetch/decode/execute per instruction.
    pub use_cached_interpreter: bool,
    /// Poll interrupts only at COP0 writes and ERET/RFE instead of every
    /// timeslice. Uncached mode only; the lazy poll fires mid-instruction
    /// and completes the instruction manually before vectoring.
    pub lazy_interrupt_polling: bool,
    /// Recognize `beq r0, r0, -1` / `j <self>` with a NOP delay slot and
    /// charge 100 idle cycles so tight idle loops drain the budget quickly.
    pub detect_idle_loops: bool,
    /// Record every instruction into the 2048-entry trace ring buffer that
    /// is dumped on host faults. Costly; leave off outside debugging.
    pub trace_execution: bool,
    /// Cycles per instruction in U8.8 fixed point (0x100 = 1.0).
    pub cpi: u16,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cycles-per-instruction must be nonzero")]
    ZeroCpi,
    #[error("cop_decoding_override uses only the low 4 bits (got {0:#04X})")]
    BadCopOverride(u8),
}

impl CoreConfig {
    /// MIPS I-class preset: PlayStation-style R3000A. 32-bit, little-endian,
    /// load-delay slots, isolate-cache stores, no TLB, no FPU.
    pub fn mips_i() -> Self {
        Self {
            is_64bit: false,
            big_endian: false,
            has_load_delay: true,
            has_exception: true,
            allow_misaligned_access: false,
            has_cop0: true,
            has_tlb: false,
            has_fpu: false,
            has_isolate_cache_bit: true,
            cop_decoding_override: 0,
            use_hook: false,
            use_cached_interpreter: false,
            lazy_interrupt_polling: false,
            detect_idle_loops: true,
            trace_execution: false,
            cpi: 0x100,
        }
    }

    /// MIPS III-class preset: N64-style VR4300. 64-bit, big-endian, TLB,
    /// FPU, branch-likely, no load-delay slot.
    pub fn mips_iii() -> Self {
        Self {
            is_64bit: true,
            big_endian: true,
            has_load_delay: false,
            has_exception: true,
            allow_misaligned_access: false,
            has_cop0: true,
            has_tlb: true,
            has_fpu: true,
            has_isolate_cache_bit: false,
            cop_decoding_override: 0,
            use_hook: false,
            use_cached_interpreter: true,
            lazy_interrupt_polling: false,
            detect_idle_loops: true,
            trace_execution: false,
            cpi: 0x180,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cpi == 0 {
            return Err(ConfigError::ZeroCpi);
        }
        if self.cop_decoding_override & !0x0F != 0 {
            return Err(ConfigError::BadCopOverride(self.cop_decoding_override));
        }
        Ok(())
    }
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self::mips_i()
    }
}
