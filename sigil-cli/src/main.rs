use std::io::{stdout, Write};
use std::process::ExitCode;

use clap::Parser;
use sigil_lang::runtime::vm::{Config, GcConfig};
use sigil_lang::runtime::InterpretError;
use sigil_lang::utils::fileloader;
use sigil_lang::{repl, ExecContext};

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

// sysexits.h
const EX_DATAERR: u8 = 65;
const EX_SOFTWARE: u8 = 70;
const EX_IOERR: u8 = 74;

#[derive(clap::Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// File name. Starts a REPL when omitted.
    #[clap(value_parser)]
    pub file: Option<String>,

    /// Print bytecode and exit
    #[arg(long, default_value_t = false)]
    pub emit_bytecode: bool,

    /// Run the garbage collector before every allocation.
    #[arg(long, default_value_t = false)]
    pub gc_stress: bool,

    /// Maximum depth of the call stack.
    #[arg(long, default_value_t = Config::default().max_frames)]
    pub max_frames: usize,

    /// More logging. Repeat for instruction traces.
    #[arg(long, short, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl Args {
    fn get_config(&self) -> Config {
        Config {
            max_frames: self.max_frames,
            gc: GcConfig {
                stress: self.gc_stress,
                ..Default::default()
            },
        }
    }
}

fn init_logger(verbose: u8) {
    let level = match verbose {
        0 if cfg!(debug_assertions) => log::LevelFilter::Debug,
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    colog::default_builder().filter_level(level).init();
}

fn run_file(ctx: &mut ExecContext, emit_bytecode: bool, file: &str) -> ExitCode {
    let loaded = fileloader::get_canonical_path(".", file).and_then(|fullpath| {
        let path = fullpath.to_string_lossy().to_string();
        fileloader::load(&path).map(|content| (path, content))
    });
    let (path, content) = match loaded {
        Ok(loaded) => loaded,
        Err(e) => {
            log::error!("{e}");
            return ExitCode::from(EX_IOERR);
        }
    };
    log::debug!("Filename: {path}");

    let mut out = stdout();
    let res = if emit_bytecode {
        ctx.emit_bytecode(&content, Some(&path))
            .and_then(|dis| write!(out, "{dis}").map_err(|e| output_error(e.to_string())))
    } else {
        ctx.run_source(&content, Some(&path), &mut out)
    };
    // diagnostics were already rendered by the context
    match res {
        Ok(()) => ExitCode::SUCCESS,
        Err(InterpretError::Compile(_)) => ExitCode::from(EX_DATAERR),
        Err(InterpretError::Runtime(_)) => ExitCode::from(EX_SOFTWARE),
    }
}

fn output_error(msg: String) -> InterpretError {
    InterpretError::Runtime(sigil_lang::runtime::Error {
        kind: sigil_lang::runtime::ErrorKind::Output(msg),
        trace: vec![],
    })
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logger(args.verbose);

    let mut ctx = ExecContext::new(args.get_config());
    match &args.file {
        Some(file) => run_file(&mut ctx, args.emit_bytecode, file),
        None => match repl::run_repl(ctx) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                log::error!("{e}");
                ExitCode::from(EX_IOERR)
            }
        },
    }
}
