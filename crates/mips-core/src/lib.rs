//! A configurable MIPS CPU interpreter core.
//!
//! One engine emulates both MIPS I-class cores (PlayStation-style: 32-bit,
//! load-delay slots, isolate-cache mode) and MIPS III-class cores
//! (N64-style: 64-bit, TLB, FPU, branch-likely). The variant is selected by
//! a [`CoreConfig`] record at construction time; there is no code
//! duplication between the two.
//!
//! The crate is a pure library. The host supplies the memory bus (an
//! implementation of [`Bus`]) at each `run` call, optionally connects
//! coprocessors ([`Coprocessor`]) and observation hooks ([`Hook`]), and
//! drives the core with a bounded cycle budget:
//!
//! ```no_run
//! use mips_core::{Core, CoreConfig};
//! # struct MyBus;
//! # impl mips_core::Bus for MyBus {
//! #     fn reset(&mut self) {}
//! #     fn fetch(&mut self, _: u32) -> u32 { 0 }
//! #     fn load8(&mut self, _: u32) -> Option<u8> { None }
//! #     fn load16(&mut self, _: u32) -> Option<u16> { None }
//! #     fn load32(&mut self, _: u32) -> Option<u32> { None }
//! #     fn load64(&mut self, _: u32) -> Option<u64> { None }
//! #     fn store8(&mut self, _: u32, _: u8) {}
//! #     fn store16(&mut self, _: u32, _: u16) {}
//! #     fn store32(&mut self, _: u32, _: u32) {}
//! #     fn store64(&mut self, _: u32, _: u64) {}
//! #     fn interrupt(&mut self) -> bool { false }
//! # }
//! let mut cpu = Core::new(CoreConfig::mips_i());
//! let mut bus = MyBus;
//! cpu.set_pc(0xBFC0_0000);
//! let spent = cpu.run(1000, &mut bus);
//! # let _ = spent;
//! ```
//!
//! Deliberately out of scope: JIT recompilation (the block cache holds
//! decoded metadata only), cycle-exact pipeline timing (throughput is
//! approximated by a configurable CPI), and any form of thread safety — a
//! core instance must be driven from a single thread.

pub mod bus;
pub mod cache;
pub mod config;
pub mod cpu;
pub mod hook;

pub use bus::Bus;
pub use cache::BlockCache;
pub use config::{ConfigError, CoreConfig};
pub use cpu::cop::Coprocessor;
pub use cpu::exceptions::ExceptionCode;
pub use cpu::instruction::{Instruction, Op};
pub use cpu::{Core, CoreError};
pub use hook::Hook;
