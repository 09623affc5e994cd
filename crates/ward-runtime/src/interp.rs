//! Stack interpreter.

use ward_core::module::MethodToken;
use ward_core::vm::Instruction;

use crate::error::ExecError;

/// Instruction budget of one top-level invocation.
pub const DEFAULT_FUEL: u64 = 1_000_000;
/// Deepest nesting of `call`.
pub const MAX_CALL_DEPTH: usize = 64;
/// Operand stack limit per frame.
const MAX_STACK: usize = 1024;

/// A method ready to run.
pub(crate) struct Program<'a> {
    pub params: u8,
    pub code: &'a [Instruction],
}

/// Where the interpreter gets method bodies from.
pub(crate) trait Programs {
    fn program(&self, token: MethodToken) -> Result<Program<'_>, ExecError>;
}

pub(crate) struct Machine<'p, P: Programs> {
    programs: &'p P,
    fuel: u64,
}

impl<'p, P: Programs> Machine<'p, P> {
    pub(crate) fn new(programs: &'p P, fuel: u64) -> Self {
        Machine { programs, fuel }
    }

    pub(crate) fn call(
        &mut self,
        token: MethodToken,
        args: &[i64],
        depth: usize,
    ) -> Result<i64, ExecError> {
        if depth >= MAX_CALL_DEPTH {
            return Err(ExecError::CallDepth(MAX_CALL_DEPTH));
        }
        let programs = self.programs;
        let program = programs.program(token)?;
        if args.len() != program.params as usize {
            return Err(ExecError::Arity {
                method: token,
                expected: program.params,
                got: args.len(),
            });
        }
        let code = program.code;

        let mut stack: Vec<i64> = Vec::with_capacity(16);
        let mut pc = 0usize;
        while pc < code.len() {
            if self.fuel == 0 {
                return Err(ExecError::FuelExhausted);
            }
            self.fuel -= 1;

            let at = pc;
            pc += 1;
            let underflow = || ExecError::StackUnderflow { method: token, pc: at };

            match code[at] {
                Instruction::Nop => {}
                Instruction::Push(v) => stack.push(v),
                Instruction::LdArg(n) => {
                    let v = args.get(n as usize).copied().ok_or(ExecError::BadArgument {
                        method: token,
                        index: n,
                    })?;
                    stack.push(v);
                }
                Instruction::Dup => {
                    let v = *stack.last().ok_or_else(underflow)?;
                    stack.push(v);
                }
                Instruction::Pop => {
                    stack.pop().ok_or_else(underflow)?;
                }
                Instruction::Add
                | Instruction::Sub
                | Instruction::Mul
                | Instruction::Xor
                | Instruction::And
                | Instruction::Or
                | Instruction::Lt
                | Instruction::Eq => {
                    let b = stack.pop().ok_or_else(underflow)?;
                    let a = stack.pop().ok_or_else(underflow)?;
                    stack.push(binary(code[at], a, b));
                }
                Instruction::Jmp(t) => pc = t as usize,
                Instruction::Jz(t) => {
                    if stack.pop().ok_or_else(underflow)? == 0 {
                        pc = t as usize;
                    }
                }
                Instruction::Call(callee) => {
                    let callee = MethodToken(callee);
                    let params = programs.program(callee)?.params as usize;
                    let split = stack.len().checked_sub(params).ok_or_else(underflow)?;
                    let call_args = stack.split_off(split);
                    let result = self.call(callee, &call_args, depth + 1)?;
                    stack.push(result);
                }
                Instruction::Ret => return stack.pop().ok_or_else(underflow),
            }

            if stack.len() > MAX_STACK {
                return Err(ExecError::StackOverflow { method: token, pc: at });
            }
        }
        Err(ExecError::MissingReturn(token))
    }
}

fn binary(op: Instruction, a: i64, b: i64) -> i64 {
    match op {
        Instruction::Add => a.wrapping_add(b),
        Instruction::Sub => a.wrapping_sub(b),
        Instruction::Mul => a.wrapping_mul(b),
        Instruction::Xor => a ^ b,
        Instruction::And => a & b,
        Instruction::Or => a | b,
        Instruction::Lt => (a < b) as i64,
        Instruction::Eq => (a == b) as i64,
        _ => 0,
    }
}
