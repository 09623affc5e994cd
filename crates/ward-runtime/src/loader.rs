use std::collections::HashMap;
use std::sync::OnceLock;

use tracing::info;
use ward_core::module::{MethodBody, MethodToken, Module, RuntimeHelper};
use ward_core::vm::{decode, DecodeError, Instruction};

use crate::error::{ExecError, LoadError};
use crate::interp::{Machine, Program, Programs, DEFAULT_FUEL};
use crate::jit::JitHook;
use crate::normal;
use crate::policy::TamperState;

type ProgramCell = OnceLock<Result<Vec<Instruction>, DecodeError>>;

/// A module whose initializers have run and which accepts invocations.
///
/// `LoadedModule` is `Sync`; methods may be invoked from several threads.
pub struct LoadedModule {
    module: Module,
    restored: HashMap<MethodToken, Vec<u8>>,
    jit: Option<JitHook>,
    state: TamperState,
    programs: HashMap<MethodToken, ProgramCell>,
    fuel: u64,
}

impl LoadedModule {
    /// Run the module's initializers in order and install its invoke hooks.
    pub fn from_module(module: Module) -> Result<Self, LoadError> {
        let state = TamperState::default();

        let mut restored = HashMap::new();
        for helper in &module.initializers {
            match helper {
                RuntimeHelper::NormalInitializer => {
                    restored.extend(normal::initialize(&module, &state)?);
                }
                RuntimeHelper::JitHook => {
                    return Err(LoadError::MisplacedHelper {
                        helper: "JitHook",
                        role: "an initializer",
                    })
                }
            }
        }

        let mut jit = None;
        for helper in &module.invoke_hooks {
            match helper {
                RuntimeHelper::JitHook => {
                    if jit.is_none() {
                        jit = Some(JitHook::install(&module)?);
                    }
                }
                RuntimeHelper::NormalInitializer => {
                    return Err(LoadError::MisplacedHelper {
                        helper: "NormalInitializer",
                        role: "an invoke hook",
                    })
                }
            }
        }

        let programs = module
            .methods
            .iter()
            .map(|m| (m.token, OnceLock::new()))
            .collect();
        let sealed = module
            .methods
            .iter()
            .filter(|m| m.body == MethodBody::Sealed)
            .count();
        info!(
            module = %module.name,
            methods = module.methods.len(),
            sealed,
            restored = restored.len(),
            jit = jit.is_some(),
            "module loaded"
        );

        Ok(LoadedModule {
            module,
            restored,
            jit,
            state,
            programs,
            fuel: DEFAULT_FUEL,
        })
    }

    /// Instruction budget per invocation.
    pub fn with_fuel(mut self, fuel: u64) -> Self {
        self.fuel = fuel;
        self
    }

    pub fn module(&self) -> &Module {
        &self.module
    }

    pub fn invoke(&self, name: &str, args: &[i64]) -> Result<i64, ExecError> {
        let token = self
            .module
            .method_by_name(name)
            .map(|m| m.token)
            .ok_or_else(|| ExecError::UnknownMethod(name.to_string()))?;
        self.invoke_token(token, args)
    }

    pub fn invoke_token(&self, token: MethodToken, args: &[i64]) -> Result<i64, ExecError> {
        if self.state.rejected() {
            return Err(ExecError::Poisoned);
        }
        let result = Machine::new(self, self.fuel).call(token, args, 0)?;
        Ok(result ^ self.state.poison() as i64)
    }

    /// How many times the body of `name` has been decrypted.
    pub fn decode_count(&self, name: &str) -> usize {
        let Some(method) = self.module.method_by_name(name) else {
            return 0;
        };
        match &self.jit {
            Some(hook) if hook.covers(method.token) => hook.decode_count(method.token),
            _ => usize::from(self.restored.contains_key(&method.token)),
        }
    }

    /// Whether an integrity failure has been detected.
    pub fn is_poisoned(&self) -> bool {
        self.state.rejected() || self.state.poison() != 0
    }

    fn body<'a>(
        &'a self,
        token: MethodToken,
        body: &'a MethodBody,
    ) -> Result<&'a [u8], ExecError> {
        if let MethodBody::Code(code) = body {
            return Ok(code.as_slice());
        }
        if let Some(code) = self.restored.get(&token) {
            return Ok(code.as_slice());
        }
        match self.jit.as_ref().and_then(|hook| hook.supply(token, &self.state)) {
            Some(supplied) => supplied,
            None => Err(ExecError::SealedBody(token)),
        }
    }
}

impl Programs for LoadedModule {
    fn program(&self, token: MethodToken) -> Result<Program<'_>, ExecError> {
        let method = self
            .module
            .method(token)
            .ok_or(ExecError::UnknownToken(token))?;
        let body = self.body(token, &method.body)?;
        let cell = self
            .programs
            .get(&token)
            .ok_or(ExecError::UnknownToken(token))?;
        let code = cell
            .get_or_init(|| decode(body))
            .as_ref()
            .map_err(|source| ExecError::Decode {
                token,
                source: source.clone(),
            })?;
        Ok(Program {
            params: method.params,
            code,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ward_core::vm::assemble;

    const SRC: &str = "\
.module plain
.method double 1
    ldarg 0
    push 2
    mul
    ret
.end
.method quad 1
    ldarg 0
    call double
    call double
    ret
.end
";

    #[test]
    fn plain_module_runs() {
        let loaded = LoadedModule::from_module(assemble(SRC).unwrap()).unwrap();
        assert_eq!(loaded.invoke("quad", &[3]), Ok(12));
        assert_eq!(loaded.decode_count("quad"), 0);
        assert!(!loaded.is_poisoned());
    }

    #[test]
    fn plain_body_program_is_decoded_once() {
        let loaded = LoadedModule::from_module(assemble(SRC).unwrap()).unwrap();
        let token = loaded.module().methods[0].token;
        let first = loaded.program(token).unwrap();
        let second = loaded.program(token).unwrap();
        assert_eq!(first.params, 1);
        assert!(std::ptr::eq(first.code, second.code));
    }

    #[test]
    fn unknown_method() {
        let loaded = LoadedModule::from_module(assemble(SRC).unwrap()).unwrap();
        assert_eq!(
            loaded.invoke("nope", &[]),
            Err(ExecError::UnknownMethod("nope".to_string()))
        );
    }

    #[test]
    fn sealed_without_helper_fails_on_invoke() {
        let mut module = assemble(SRC).unwrap();
        module.methods[0].body = MethodBody::Sealed;
        let loaded = LoadedModule::from_module(module).unwrap();
        let token = loaded.module().methods[0].token;
        assert_eq!(loaded.invoke("double", &[1]), Err(ExecError::SealedBody(token)));
        assert_eq!(loaded.invoke("quad", &[1]), Err(ExecError::SealedBody(token)));
    }

    #[test]
    fn helpers_need_their_sections() {
        let mut module = assemble(SRC).unwrap();
        module.initializers.push(RuntimeHelper::NormalInitializer);
        assert!(matches!(
            LoadedModule::from_module(module),
            Err(LoadError::MissingSection { .. })
        ));

        let mut module = assemble(SRC).unwrap();
        module.initializers.push(RuntimeHelper::JitHook);
        assert!(matches!(
            LoadedModule::from_module(module),
            Err(LoadError::MisplacedHelper { .. })
        ));
    }

    #[test]
    fn fuel_limit_applies() {
        let module = assemble(".module spin\n.method spin 0\ntop:\n    jmp top\n.end\n").unwrap();
        let loaded = LoadedModule::from_module(module).unwrap().with_fuel(50);
        assert_eq!(loaded.invoke("spin", &[]), Err(ExecError::FuelExhausted));
    }
}
