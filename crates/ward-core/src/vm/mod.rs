//! Method body bytecode and its text assembler.

pub mod asm;
pub mod opcode;

pub use asm::{assemble, AsmError};
pub use opcode::{decode, encode, DecodeError, Instruction};
