//! Text assembler for Ward modules.
//!
//! ```text
//! .module demo
//! .method add 2
//!     ldarg 0
//!     ldarg 1
//!     add
//!     ret
//! .end
//! ```
//!
//! Labels are `name:` on their own line. `call` names a method that may be
//! declared later in the file. Comments start with `;`.

use std::collections::HashMap;

use super::opcode::{encode, Instruction};
use crate::module::{MethodBody, MethodDef, MethodFlags, MethodToken, Module, FIRST_METHOD_TOKEN};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AsmError {
    #[error("missing .module directive")]
    MissingModule,
    #[error("line {0}: .module declared twice")]
    DuplicateModule(usize),
    #[error("line {line}: unknown directive or mnemonic '{word}'")]
    Unknown { line: usize, word: String },
    #[error("line {line}: bad operand '{text}'")]
    BadOperand { line: usize, text: String },
    #[error("line {line}: unknown label '{label}'")]
    UnknownLabel { line: usize, label: String },
    #[error("line {line}: label '{label}' defined twice")]
    DuplicateLabel { line: usize, label: String },
    #[error("line {line}: unknown method '{name}'")]
    UnknownMethod { line: usize, name: String },
    #[error("line {line}: method '{name}' defined twice")]
    DuplicateMethod { line: usize, name: String },
    #[error("line {0}: instruction outside of a method")]
    OutsideMethod(usize),
    #[error("method '{0}' is missing .end")]
    Unterminated(String),
}

/// Operand that can only be resolved once every label/method is known.
#[derive(Debug, Clone)]
enum Pending {
    Ready(Instruction),
    Jmp { line: usize, label: String },
    Jz { line: usize, label: String },
    Call { line: usize, method: String },
}

#[derive(Debug)]
struct PendingMethod {
    name: String,
    params: u8,
    flags: MethodFlags,
    body: Vec<Pending>,
    labels: HashMap<String, u32>,
}

/// Assemble source text into a module.
pub fn assemble(source: &str) -> Result<Module, AsmError> {
    let mut module_name: Option<String> = None;
    let mut finished: Vec<PendingMethod> = Vec::new();
    let mut current: Option<PendingMethod> = None;

    for (idx, raw) in source.lines().enumerate() {
        let line = idx + 1;
        let text = raw.split(';').next().unwrap_or("").trim();
        if text.is_empty() {
            continue;
        }
        let mut words = text.split_whitespace();
        let head = words.next().unwrap_or("");
        let rest: Vec<&str> = words.collect();

        match head {
            ".module" => {
                if module_name.is_some() {
                    return Err(AsmError::DuplicateModule(line));
                }
                let name = single_operand(line, &rest)?;
                module_name = Some(name.to_string());
            }
            ".method" => {
                if let Some(open) = current.take() {
                    return Err(AsmError::Unterminated(open.name));
                }
                let (name, params, flags) = parse_method_header(line, &rest)?;
                if finished.iter().any(|m| m.name == name) {
                    return Err(AsmError::DuplicateMethod { line, name });
                }
                current = Some(PendingMethod {
                    name,
                    params,
                    flags,
                    body: Vec::new(),
                    labels: HashMap::new(),
                });
            }
            ".end" => match current.take() {
                Some(method) => finished.push(method),
                None => return Err(AsmError::OutsideMethod(line)),
            },
            _ => {
                let method = current.as_mut().ok_or(AsmError::OutsideMethod(line))?;
                if let Some(label) = head.strip_suffix(':') {
                    if !rest.is_empty() {
                        return Err(AsmError::BadOperand { line, text: rest.join(" ") });
                    }
                    let index = method.body.len() as u32;
                    if method.labels.insert(label.to_string(), index).is_some() {
                        return Err(AsmError::DuplicateLabel {
                            line,
                            label: label.to_string(),
                        });
                    }
                    continue;
                }
                method.body.push(parse_instruction(line, head, &rest)?);
            }
        }
    }

    if let Some(open) = current {
        return Err(AsmError::Unterminated(open.name));
    }
    let name = module_name.ok_or(AsmError::MissingModule)?;

    let tokens: HashMap<String, u32> = finished
        .iter()
        .enumerate()
        .map(|(i, m)| (m.name.clone(), FIRST_METHOD_TOKEN + i as u32))
        .collect();

    let mut module = Module::new(name);
    for method in finished {
        let mut instructions = Vec::with_capacity(method.body.len());
        for pending in &method.body {
            instructions.push(resolve(pending, &method.labels, &tokens)?);
        }
        let token = tokens.get(&method.name).copied().unwrap_or(FIRST_METHOD_TOKEN);
        module.methods.push(MethodDef {
            token: MethodToken(token),
            name: method.name,
            params: method.params,
            flags: method.flags,
            body: MethodBody::Code(encode(&instructions)),
        });
    }
    Ok(module)
}

fn resolve(
    pending: &Pending,
    labels: &HashMap<String, u32>,
    tokens: &HashMap<String, u32>,
) -> Result<Instruction, AsmError> {
    let label_index = |line: usize, label: &str| {
        labels.get(label).copied().ok_or_else(|| AsmError::UnknownLabel {
            line,
            label: label.to_string(),
        })
    };
    match pending {
        Pending::Ready(inst) => Ok(*inst),
        Pending::Jmp { line, label } => Ok(Instruction::Jmp(label_index(*line, label)?)),
        Pending::Jz { line, label } => Ok(Instruction::Jz(label_index(*line, label)?)),
        Pending::Call { line, method } => tokens
            .get(method)
            .map(|t| Instruction::Call(*t))
            .ok_or_else(|| AsmError::UnknownMethod {
                line: *line,
                name: method.clone(),
            }),
    }
}

fn single_operand<'a>(line: usize, rest: &[&'a str]) -> Result<&'a str, AsmError> {
    match rest {
        [one] => Ok(*one),
        _ => Err(AsmError::BadOperand { line, text: rest.join(" ") }),
    }
}

fn parse_method_header(line: usize, rest: &[&str]) -> Result<(String, u8, MethodFlags), AsmError> {
    let bad = || AsmError::BadOperand { line, text: rest.join(" ") };
    let (name, params, modifiers) = match rest {
        [name, params, modifiers @ ..] => (name, params, modifiers),
        _ => return Err(bad()),
    };
    let params: u8 = params.parse().map_err(|_| bad())?;
    let mut flags = MethodFlags::NONE;
    for modifier in modifiers {
        match *modifier {
            "introspectable" => flags.insert(MethodFlags::INTROSPECTABLE),
            other => {
                return Err(AsmError::Unknown {
                    line,
                    word: other.to_string(),
                })
            }
        }
    }
    Ok((name.to_string(), params, flags))
}

fn parse_int(line: usize, text: &str) -> Result<i64, AsmError> {
    let (negative, digits) = match text.strip_prefix('-') {
        Some(d) => (true, d),
        None => (false, text),
    };
    let magnitude = match digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).map(|v| v as i64),
        None => digits.parse::<i64>(),
    }
    .map_err(|_| AsmError::BadOperand {
        line,
        text: text.to_string(),
    })?;
    Ok(if negative { magnitude.wrapping_neg() } else { magnitude })
}

fn parse_instruction(line: usize, head: &str, rest: &[&str]) -> Result<Pending, AsmError> {
    let no_operand = |inst: Instruction| {
        if rest.is_empty() {
            Ok(Pending::Ready(inst))
        } else {
            Err(AsmError::BadOperand { line, text: rest.join(" ") })
        }
    };
    match head {
        "nop" => no_operand(Instruction::Nop),
        "dup" => no_operand(Instruction::Dup),
        "pop" => no_operand(Instruction::Pop),
        "add" => no_operand(Instruction::Add),
        "sub" => no_operand(Instruction::Sub),
        "mul" => no_operand(Instruction::Mul),
        "xor" => no_operand(Instruction::Xor),
        "and" => no_operand(Instruction::And),
        "or" => no_operand(Instruction::Or),
        "lt" => no_operand(Instruction::Lt),
        "eq" => no_operand(Instruction::Eq),
        "ret" => no_operand(Instruction::Ret),
        "push" => {
            let value = parse_int(line, single_operand(line, rest)?)?;
            Ok(Pending::Ready(Instruction::Push(value)))
        }
        "ldarg" => {
            let text = single_operand(line, rest)?;
            let index: u8 = text.parse().map_err(|_| AsmError::BadOperand {
                line,
                text: text.to_string(),
            })?;
            Ok(Pending::Ready(Instruction::LdArg(index)))
        }
        "jmp" => Ok(Pending::Jmp {
            line,
            label: single_operand(line, rest)?.to_string(),
        }),
        "jz" => Ok(Pending::Jz {
            line,
            label: single_operand(line, rest)?.to_string(),
        }),
        "call" => Ok(Pending::Call {
            line,
            method: single_operand(line, rest)?.to_string(),
        }),
        other => Err(AsmError::Unknown {
            line,
            word: other.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::opcode::decode;

    const SOURCE: &str = "
        .module demo
        .method sum_to 1        ; returns n, the long way round
            push 0
        loop:
            ldarg 0
            jz done
            ldarg 0
            add
            ret
        done:
            ret
        .end
        .method main 0 introspectable
            push 4
            call sum_to
            ret
        .end
    ";

    #[test]
    fn test_assemble_module() {
        let module = assemble(SOURCE).unwrap();
        assert_eq!(module.name, "demo");
        assert_eq!(module.methods.len(), 2);
        let main = module.method_by_name("main").unwrap();
        assert_eq!(main.token, MethodToken(FIRST_METHOD_TOKEN + 1));
        assert!(main.flags.contains(MethodFlags::INTROSPECTABLE));
        let code = decode(main.body.code().unwrap()).unwrap();
        assert_eq!(code[1], Instruction::Call(FIRST_METHOD_TOKEN));
    }

    #[test]
    fn test_labels_resolve_to_indices() {
        let module = assemble(SOURCE).unwrap();
        let sum_to = module.method_by_name("sum_to").unwrap();
        let code = decode(sum_to.body.code().unwrap()).unwrap();
        assert_eq!(code[2], Instruction::Jz(6));
    }

    #[test]
    fn test_negative_and_hex_immediates() {
        let module = assemble(".module m\n.method f 0\npush -0x10\npush 0xFF\nret\n.end").unwrap();
        let code = decode(module.methods[0].body.code().unwrap()).unwrap();
        assert_eq!(code[0], Instruction::Push(-16));
        assert_eq!(code[1], Instruction::Push(255));
    }

    #[test]
    fn test_errors() {
        assert_eq!(assemble(".method f 0\n.end"), Err(AsmError::MissingModule));
        assert_eq!(
            assemble(".module m\n.method f 0\nfrob\n.end"),
            Err(AsmError::Unknown { line: 3, word: "frob".to_string() })
        );
        assert_eq!(
            assemble(".module m\n.method f 0\njmp nowhere\n.end"),
            Err(AsmError::UnknownLabel { line: 3, label: "nowhere".to_string() })
        );
        assert_eq!(
            assemble(".module m\n.method f 0\ncall g\n.end"),
            Err(AsmError::UnknownMethod { line: 3, name: "g".to_string() })
        );
        assert_eq!(
            assemble(".module m\n.method f 0\nret"),
            Err(AsmError::Unterminated("f".to_string()))
        );
        assert_eq!(assemble(".module m\npush 1"), Err(AsmError::OutsideMethod(2)));
    }
}
