/// Contract for host-connected coprocessors.
///
/// The engine routes LWCz/SWCz/MFCz/MTCz/CFCz/CTCz and the COPz command
/// encodings here for any slot the host has connected (a PlayStation GTE at
/// slot 2, an RSP status port at slot 0 on coprocessor-less cores, ...).
/// The built-in system coprocessor and FPU answer slots 0 and 1 when the
/// configuration enables them; connecting over an enabled slot is rejected.
///
/// Register index mapping: 0..=31 are data registers (MFC/MTC), 32..=63 are
/// control registers (CFC/CTC at `index + 32`).
pub trait Coprocessor {
    fn reset(&mut self);

    /// A COPz command word (bit 25 set), or a redirected move encoding when
    /// the core's `cop_decoding_override` claims this slot.
    fn command(&mut self, word: u32);

    fn read32(&mut self, idx: usize) -> u32;
    fn write32(&mut self, idx: usize, value: u32);

    fn read64(&mut self, idx: usize) -> u64 {
        u64::from(self.read32(idx))
    }
    fn write64(&mut self, idx: usize, value: u64) {
        self.write32(idx, value as u32);
    }

    /// Single-bit condition consumed by the BCz branch family.
    fn flag(&self) -> bool {
        false
    }
}
