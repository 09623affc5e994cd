//! Method body instruction set.
//!
//! A small stack machine over wrapping `i64`. Jump operands are
//! instruction indices (not byte offsets), so transforms that insert
//! instructions only need to remap indices.

use std::fmt;

// ─── Encodings ───────────────────────────────────────────────

pub const OP_NOP: u8 = 0x00;
pub const OP_PUSH: u8 = 0x01;
pub const OP_LDARG: u8 = 0x02;
pub const OP_DUP: u8 = 0x03;
pub const OP_POP: u8 = 0x04;
pub const OP_ADD: u8 = 0x10;
pub const OP_SUB: u8 = 0x11;
pub const OP_MUL: u8 = 0x12;
pub const OP_XOR: u8 = 0x13;
pub const OP_AND: u8 = 0x14;
pub const OP_OR: u8 = 0x15;
pub const OP_LT: u8 = 0x16;
pub const OP_EQ: u8 = 0x17;
pub const OP_JMP: u8 = 0x20;
pub const OP_JZ: u8 = 0x21;
pub const OP_CALL: u8 = 0x30;
pub const OP_RET: u8 = 0x3F;

/// One decoded instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    Nop,
    /// Push an immediate.
    Push(i64),
    /// Push argument `n`.
    LdArg(u8),
    Dup,
    Pop,
    Add,
    Sub,
    Mul,
    Xor,
    And,
    Or,
    /// `a < b` (signed) → 1 / 0
    Lt,
    /// `a == b` → 1 / 0
    Eq,
    /// Jump to instruction index.
    Jmp(u32),
    /// Pop; jump to instruction index when the value is zero.
    Jz(u32),
    /// Call the method with this token; arguments are popped right to left.
    Call(u32),
    Ret,
}

impl Instruction {
    /// Jump target, if this instruction branches.
    pub fn branch_target(&self) -> Option<u32> {
        match self {
            Instruction::Jmp(t) | Instruction::Jz(t) => Some(*t),
            _ => None,
        }
    }

    /// Same instruction with its branch target replaced.
    pub fn with_branch_target(self, target: u32) -> Self {
        match self {
            Instruction::Jmp(_) => Instruction::Jmp(target),
            Instruction::Jz(_) => Instruction::Jz(target),
            other => other,
        }
    }

    /// Assembler mnemonic.
    pub fn mnemonic(&self) -> &'static str {
        match self {
            Instruction::Nop => "nop",
            Instruction::Push(_) => "push",
            Instruction::LdArg(_) => "ldarg",
            Instruction::Dup => "dup",
            Instruction::Pop => "pop",
            Instruction::Add => "add",
            Instruction::Sub => "sub",
            Instruction::Mul => "mul",
            Instruction::Xor => "xor",
            Instruction::And => "and",
            Instruction::Or => "or",
            Instruction::Lt => "lt",
            Instruction::Eq => "eq",
            Instruction::Jmp(_) => "jmp",
            Instruction::Jz(_) => "jz",
            Instruction::Call(_) => "call",
            Instruction::Ret => "ret",
        }
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        match *self {
            Instruction::Nop => out.push(OP_NOP),
            Instruction::Push(v) => {
                out.push(OP_PUSH);
                out.extend_from_slice(&v.to_le_bytes());
            }
            Instruction::LdArg(n) => out.extend_from_slice(&[OP_LDARG, n]),
            Instruction::Dup => out.push(OP_DUP),
            Instruction::Pop => out.push(OP_POP),
            Instruction::Add => out.push(OP_ADD),
            Instruction::Sub => out.push(OP_SUB),
            Instruction::Mul => out.push(OP_MUL),
            Instruction::Xor => out.push(OP_XOR),
            Instruction::And => out.push(OP_AND),
            Instruction::Or => out.push(OP_OR),
            Instruction::Lt => out.push(OP_LT),
            Instruction::Eq => out.push(OP_EQ),
            Instruction::Jmp(t) => {
                out.push(OP_JMP);
                out.extend_from_slice(&t.to_le_bytes());
            }
            Instruction::Jz(t) => {
                out.push(OP_JZ);
                out.extend_from_slice(&t.to_le_bytes());
            }
            Instruction::Call(token) => {
                out.push(OP_CALL);
                out.extend_from_slice(&token.to_le_bytes());
            }
            Instruction::Ret => out.push(OP_RET),
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instruction::Push(v) => write!(f, "push {v}"),
            Instruction::LdArg(n) => write!(f, "ldarg {n}"),
            Instruction::Jmp(t) | Instruction::Jz(t) => write!(f, "{} @{t}", self.mnemonic()),
            Instruction::Call(token) => write!(f, "call 0x{token:08X}"),
            other => f.write_str(other.mnemonic()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("unknown opcode 0x{opcode:02X} at byte {offset}")]
    UnknownOpcode { offset: usize, opcode: u8 },
    #[error("instruction at byte {0} is truncated")]
    Truncated(usize),
    #[error("branch at instruction {index} targets {target}, past the end of the body")]
    BranchOutOfRange { index: usize, target: u32 },
}

/// Encode an instruction stream.
pub fn encode(instructions: &[Instruction]) -> Vec<u8> {
    let mut out = Vec::with_capacity(instructions.len() * 2);
    for inst in instructions {
        inst.encode_into(&mut out);
    }
    out
}

fn operand(code: &[u8], pos: usize, len: usize) -> Result<&[u8], DecodeError> {
    code.get(pos + 1..pos + 1 + len)
        .ok_or(DecodeError::Truncated(pos))
}

/// Decode a body and validate its branch targets.
pub fn decode(code: &[u8]) -> Result<Vec<Instruction>, DecodeError> {
    let mut out = Vec::new();
    let mut pos = 0usize;

    while pos < code.len() {
        let opcode = code[pos];
        let (inst, size) = match opcode {
            OP_NOP => (Instruction::Nop, 1),
            OP_PUSH => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(operand(code, pos, 8)?);
                (Instruction::Push(i64::from_le_bytes(buf)), 9)
            }
            OP_LDARG => (Instruction::LdArg(operand(code, pos, 1)?[0]), 2),
            OP_DUP => (Instruction::Dup, 1),
            OP_POP => (Instruction::Pop, 1),
            OP_ADD => (Instruction::Add, 1),
            OP_SUB => (Instruction::Sub, 1),
            OP_MUL => (Instruction::Mul, 1),
            OP_XOR => (Instruction::Xor, 1),
            OP_AND => (Instruction::And, 1),
            OP_OR => (Instruction::Or, 1),
            OP_LT => (Instruction::Lt, 1),
            OP_EQ => (Instruction::Eq, 1),
            OP_JMP | OP_JZ | OP_CALL => {
                let b = operand(code, pos, 4)?;
                let value = u32::from_le_bytes([b[0], b[1], b[2], b[3]]);
                let inst = match opcode {
                    OP_JMP => Instruction::Jmp(value),
                    OP_JZ => Instruction::Jz(value),
                    _ => Instruction::Call(value),
                };
                (inst, 5)
            }
            OP_RET => (Instruction::Ret, 1),
            _ => return Err(DecodeError::UnknownOpcode { offset: pos, opcode }),
        };
        out.push(inst);
        pos += size;
    }

    for (index, inst) in out.iter().enumerate() {
        if let Some(target) = inst.branch_target() {
            if target as usize >= out.len() {
                return Err(DecodeError::BranchOutOfRange { index, target });
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_sizes() {
        assert_eq!(encode(&[Instruction::Nop]).len(), 1);
        assert_eq!(encode(&[Instruction::Push(-1)]).len(), 9);
        assert_eq!(encode(&[Instruction::LdArg(3)]).len(), 2);
        assert_eq!(encode(&[Instruction::Call(0x0600_0001)]).len(), 5);
    }

    #[test]
    fn test_decode_program() {
        let program = vec![
            Instruction::LdArg(0),
            Instruction::Jz(4),
            Instruction::Push(7),
            Instruction::Ret,
            Instruction::Push(-3),
            Instruction::Ret,
        ];
        assert_eq!(decode(&encode(&program)).unwrap(), program);
    }

    #[test]
    fn test_unknown_opcode() {
        assert_eq!(
            decode(&[OP_NOP, 0xEE]),
            Err(DecodeError::UnknownOpcode { offset: 1, opcode: 0xEE })
        );
    }

    #[test]
    fn test_truncated_operand() {
        assert_eq!(decode(&[OP_PUSH, 1, 2]), Err(DecodeError::Truncated(0)));
    }

    #[test]
    fn test_branch_past_end() {
        let code = encode(&[Instruction::Jmp(5), Instruction::Ret]);
        assert_eq!(
            decode(&code),
            Err(DecodeError::BranchOutOfRange { index: 0, target: 5 })
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(Instruction::Push(5).to_string(), "push 5");
        assert_eq!(Instruction::Jz(2).to_string(), "jz @2");
        assert_eq!(Instruction::Call(0x0600_0002).to_string(), "call 0x06000002");
        assert_eq!(Instruction::Ret.to_string(), "ret");
    }
}
