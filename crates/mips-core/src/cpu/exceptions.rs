/// Architectural exception causes (COP0 Cause register bits [6:2]).
///
/// These are expected guest-visible control flow, routed through
/// `Core::trigger_exception` — as opposed to host faults, which panic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExceptionCode {
    Interrupt = 0,
    TlbModification = 1,
    TlbLoad = 2,
    TlbStore = 3,
    AddressErrorLoad = 4,
    AddressErrorStore = 5,
    BusErrorInstruction = 6,
    BusErrorData = 7,
    Syscall = 8,
    Breakpoint = 9,
    ReservedInstruction = 10,
    CoprocessorUnusable = 11,
    Overflow = 12,
}

impl ExceptionCode {
    /// True for the three TLB-related causes, which vector to the dedicated
    /// refill handler on 64-bit cores when EXL is clear.
    pub fn is_tlb(self) -> bool {
        matches!(
            self,
            Self::TlbModification | Self::TlbLoad | Self::TlbStore
        )
    }
}
