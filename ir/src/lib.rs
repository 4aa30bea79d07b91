//! Binary-format independent shader IR: typed instructions, basic blocks,
//! functions and programs, plus the analyses and the CPU execution device
//! the instrumentation passes are built on.
//!
//! The IR round-trips foreign op-codes through `Op::Unexposed`, so a module
//! that is parsed and stitched without modification is byte-identical to its
//! source.

#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate log;

pub mod analysis;
pub mod block;
pub mod codec;
pub mod constant;
pub mod emitter;
pub mod exec;
pub mod function;
pub mod inst;
pub mod program;
pub mod types;

use std::fmt;

/// Identifier of any IR entity: SSA values, blocks, functions, constants,
/// types and variables. Unique within one program. 0 is reserved invalid.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
pub struct Id(pub u32);

impl Id {
    pub const INVALID: Id = Id(0);

    #[inline]
    pub fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// Source attribution of an instruction, emitted from debug info by the IR
/// provider. Instrumentation-originated instructions carry the `modified`
/// flag; exported violations are attributed to original spans only.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub struct SourceSpan {
    pub file_uid: u32,
    pub line: u32,
    pub column: u32,
    pub modified: bool,
}

impl SourceSpan {
    pub const INVALID: SourceSpan = SourceSpan {
        file_uid: 0,
        line: 0,
        column: 0,
        modified: false,
    };

    /// Span for an instruction authored by an instrumentation pass, keeping
    /// the original attribution.
    pub fn modify(self) -> SourceSpan {
        SourceSpan {
            modified: true,
            ..self
        }
    }
}

/// Error that can happen when parsing or manipulating a module.
#[derive(Debug, Clone)]
pub enum Error {
    MissingHeader,
    WrongHeader,
    IncompleteInstruction,
    UnknownOpCode(u32),
    Malformed(&'static str),
    /// The module decodes, but only into `Unexposed` instructions; the
    /// original binary should be passed through unmodified.
    UnexposedOnly,
    Unsupported(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::MissingHeader => write!(f, "module header missing"),
            Error::WrongHeader => write!(f, "module header magic mismatch"),
            Error::IncompleteInstruction => write!(f, "truncated instruction stream"),
            Error::UnknownOpCode(op) => write!(f, "unknown op-code {}", op),
            Error::Malformed(what) => write!(f, "malformed module: {}", what),
            Error::UnexposedOnly => write!(f, "module decodes to unexposed instructions only"),
            Error::Unsupported(what) => write!(f, "unsupported: {}", what),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;
