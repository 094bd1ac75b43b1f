//! Result and errors.
use std::fmt::{self, Display, Formatter};

use crate::constants::{Address, MAX_PROGRAM_SIZE};

pub type Chip8Result<T> = std::result::Result<T, Chip8Error>;

#[derive(Debug)]
pub enum Chip8Error {
    /// Program counter ran off the end of memory.
    FetchOutOfBounds { pc: Address },
    /// Subroutine call with all stack levels in use.
    StackOverflow { pc: Address },
    /// Subroutine return with an empty call stack.
    StackUnderflow { pc: Address },
    /// Attempt to load a bytecode program that can't fit in memory.
    LargeProgram { len: usize },
    /// Font data of the wrong shape.
    Font(String),
    Io(std::io::Error),
    Fmt(fmt::Error),
}

impl Display for Chip8Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::FetchOutOfBounds { pc } => {
                write!(f, "instruction fetch out of bounds at 0x{pc:04X}")
            }
            Self::StackOverflow { pc } => write!(f, "call stack overflow at 0x{pc:03X}"),
            Self::StackUnderflow { pc } => write!(f, "call stack underflow at 0x{pc:03X}"),
            Self::LargeProgram { len } => write!(
                f,
                "program too large for VM memory: {len} bytes, limit is {MAX_PROGRAM_SIZE}"
            ),
            Self::Font(msg) => write!(f, "font error: {msg}"),
            Self::Io(err) => write!(f, "{err}"),
            Self::Fmt(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for Chip8Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::Fmt(err) => Some(err),
            _ => None,
        }
    }
}

impl From<fmt::Error> for Chip8Error {
    fn from(err: fmt::Error) -> Self {
        Chip8Error::Fmt(err)
    }
}

impl From<std::io::Error> for Chip8Error {
    fn from(err: std::io::Error) -> Self {
        Chip8Error::Io(err)
    }
}

impl Chip8Error {
    /// Whether the error stops the machine.
    ///
    /// Every engine error is fatal. Unrecognized opcodes are not errors.
    pub fn is_halt(&self) -> bool {
        matches!(
            self,
            Self::FetchOutOfBounds { .. } | Self::StackOverflow { .. } | Self::StackUnderflow { .. }
        )
    }
}
