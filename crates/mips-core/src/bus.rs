/// Memory bus trait. All memory access goes through this.
///
/// The core calls fetch/load/store with *physical* addresses; virtual
/// addresses are resolved by the TLB before they reach the bus. We use u32
/// for physical addresses because every core this engine models has a
/// 32-bit physical address space.
///
/// Loads return `None` for unmapped regions. The engine treats an unmapped
/// access during execution as a fatal configuration error (it panics after
/// dumping the instruction trace) rather than raising a guest-visible bus
/// exception — unmapped accesses in practice mean the host forgot to wire a
/// device, and surfacing that early beats chasing corrupted guest state.
///
/// The bus may be shared with DMA engines. The engine makes no coherence
/// guarantee: after modifying executable memory the caller must invalidate
/// the affected range in the block cache before the engine re-enters it.
pub trait Bus {
    fn reset(&mut self);

    /// Instruction fetch. Infallible: a fetch from an unmapped region is a
    /// host wiring bug and the implementation may panic.
    fn fetch(&mut self, addr: u32) -> u32;

    fn load8(&mut self, addr: u32) -> Option<u8>;
    fn load16(&mut self, addr: u32) -> Option<u16>;
    fn load32(&mut self, addr: u32) -> Option<u32>;
    fn load64(&mut self, addr: u32) -> Option<u64>;

    fn store8(&mut self, addr: u32, value: u8);
    fn store16(&mut self, addr: u32, value: u16);
    fn store32(&mut self, addr: u32, value: u32);
    fn store64(&mut self, addr: u32, value: u64);

    /// Level-triggered external interrupt line, reflected into Cause.IP2.
    fn interrupt(&mut self) -> bool;
}
