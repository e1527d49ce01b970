pub mod interner;
pub mod utils;

pub mod compiler;
pub mod runtime;

pub mod repl;

use std::io::Write;

use interner::ToSymbol;
use runtime::vm::{self, Machine};
use runtime::InterpretError;
use utils::error;

/// Front door for running sources. Diagnostics are rendered with ariadne under
/// the name given for each run. Globals persist between runs, which is what
/// the REPL relies on.
pub struct ExecContext {
    pub machine: Machine,
}

impl ExecContext {
    pub fn new(config: vm::Config) -> Self {
        Self {
            machine: Machine::new(config),
        }
    }

    /// Compiles and runs `src`, writing program output to `out`. Diagnostics
    /// are rendered to stderr under `name` before the error is returned.
    pub fn run_source(
        &mut self,
        src: &str,
        name: Option<&str>,
        out: &mut impl Write,
    ) -> Result<(), InterpretError> {
        let res = self.machine.interpret(src, out);
        if let Err(e) = &res {
            let path = name.unwrap_or(utils::metadata::GLOBAL_LABEL).to_symbol();
            log::debug!("{path}: {e}");
            match e {
                InterpretError::Compile(errs) => error::report(src, path, errs),
                InterpretError::Runtime(e) => {
                    let errs: [Box<dyn error::ReportableError>; 1] = [Box::new(e.clone())];
                    error::report(src, path, &errs)
                }
            }
        }
        res
    }

    /// Disassembly of `src` without running it.
    pub fn emit_bytecode(
        &mut self,
        src: &str,
        name: Option<&str>,
    ) -> Result<String, InterpretError> {
        self.machine.emit_bytecode(src).map_err(|errs| {
            let path = name.unwrap_or(utils::metadata::GLOBAL_LABEL).to_symbol();
            error::report(src, path, &errs);
            InterpretError::Compile(errs)
        })
    }
}

impl Default for ExecContext {
    fn default() -> Self {
        Self::new(vm::Config::default())
    }
}
