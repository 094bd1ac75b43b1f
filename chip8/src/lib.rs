//! Chip-8 virtual machine.
//!
//! The machine is driven one cycle at a time with [`prelude::Chip8Vm::step`].
//! Rendering, input translation and pacing belong to the caller.
mod bytecode;
pub mod constants;
mod cpu;
mod devices;
mod error;
mod vm;

pub use self::{
    devices::{EntropyRng, InvalidKeyCode, KeyCode, RandomSource, SeededRng},
    error::{Chip8Error, Chip8Result},
    vm::{check_program_size, Hz},
};

/// Version of this implementation.
pub const IMPL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Borrowed view of the 64x32 pixel grid, row major.
pub type Chip8DisplayBuffer<'a> = &'a [bool; constants::DISPLAY_BUFFER_SIZE];

pub mod prelude {
    pub use super::{
        bytecode::{Instr, Op},
        cpu::Chip8Cpu,
        devices::{KeyCode, RandomSource},
        error::{Chip8Error, Chip8Result},
        vm::{Chip8Conf, Chip8Vm, Flow, Hz},
    };
}
