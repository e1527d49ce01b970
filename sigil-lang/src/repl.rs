use crate::runtime::InterpretError;
use crate::ExecContext;
use std::io::{stdin, stdout, BufRead, Write};

pub enum ReplMode {
    Eval,
    ShowBytecode,
}

pub struct ReplAppData {
    line_count: u64,
    ctx: ExecContext,
    mode: ReplMode,
}

impl ReplAppData {
    pub fn new(ctx: ExecContext) -> Self {
        Self {
            line_count: 0,
            ctx,
            mode: ReplMode::Eval,
        }
    }
}

impl Default for ReplAppData {
    fn default() -> Self {
        Self::new(ExecContext::default())
    }
}

fn process_command(line: &str) -> Option<ReplMode> {
    match line.trim_end() {
        ":e" => {
            println!("Mode:Eval");
            Some(ReplMode::Eval)
        }
        ":b" => {
            println!("Mode:Bytecode");
            Some(ReplMode::ShowBytecode)
        }
        _ => None,
    }
}

// the diagnostic itself was already rendered
fn failure_note(line: u64, e: &InterpretError) -> String {
    let stage = match e {
        InterpretError::Compile(_) => "compile",
        InterpretError::Runtime(_) => "runtime",
    };
    format!("line {line}: {stage} error")
}

/// Evaluates one line at a time until end of input. A line ending with `\` is
/// continued on the next one. Errors have already been rendered by the
/// context and do not end the session.
pub fn repl(data: &mut ReplAppData, input: &mut impl BufRead) -> std::io::Result<()> {
    let mut src = String::new();
    loop {
        print!("> ");
        stdout().flush()?;
        let mut line = String::new();
        if input.read_line(&mut line)? == 0 {
            println!();
            return Ok(());
        }
        data.line_count += 1;
        if src.is_empty() {
            if let Some(mode) = process_command(&line) {
                data.mode = mode;
                continue;
            }
        }
        let line = line.trim_end_matches(['\n', '\r']);
        if let Some(continued) = line.strip_suffix('\\') {
            src.push_str(continued);
            src.push('\n');
            continue;
        }
        src.push_str(line);
        let res = match data.mode {
            ReplMode::Eval => data.ctx.run_source(&src, None, &mut stdout()),
            ReplMode::ShowBytecode => data
                .ctx
                .emit_bytecode(&src, None)
                .map(|dis| print!("{dis}")),
        };
        if let Err(e) = res {
            log::warn!("{}", failure_note(data.line_count, &e));
        }
        src.clear();
    }
}

pub fn run_repl(ctx: ExecContext) -> std::io::Result<()> {
    repl(&mut ReplAppData::new(ctx), &mut stdin().lock())
}
