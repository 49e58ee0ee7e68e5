/// Observation hooks fired by the engine when `CoreConfig::use_hook` is set.
///
/// `on_pre_execute` fires before every instruction; the load/store hooks
/// fire just before every successful memory access, with the *virtual*
/// address the guest used. Hooks are observation-only: they may mutate
/// their own state (tracers, profilers, coverage maps) but must not reach
/// back into the engine.
///
/// Every method has an empty default body, so an implementation only spells
/// out the events it cares about.
pub trait Hook {
    fn reset(&mut self) {}

    fn on_pre_execute(&mut self, pc: u64, opcode: u32) {
        let _ = (pc, opcode);
    }

    fn on_load8(&mut self, address: u64) {
        let _ = address;
    }
    fn on_load16(&mut self, address: u64) {
        let _ = address;
    }
    fn on_load32(&mut self, address: u64) {
        let _ = address;
    }
    fn on_load64(&mut self, address: u64) {
        let _ = address;
    }

    fn on_store8(&mut self, address: u64, value: u8) {
        let _ = (address, value);
    }
    fn on_store16(&mut self, address: u64, value: u16) {
        let _ = (address, value);
    }
    fn on_store32(&mut self, address: u64, value: u32) {
        let _ = (address, value);
    }
    fn on_store64(&mut self, address: u64, value: u64) {
        let _ = (address, value);
    }
}
