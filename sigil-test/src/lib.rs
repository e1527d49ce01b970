extern crate sigil_lang;
use std::path::PathBuf;

use sigil_lang::{
    runtime::{vm, InterpretError},
    utils::fileloader,
    ExecContext,
};

/// Runs `src` in `ctx` and returns everything it printed. A successful run
/// must leave nothing behind on the value stack.
pub fn run_in_context(
    ctx: &mut ExecContext,
    src: &str,
    name: Option<&str>,
) -> Result<String, InterpretError> {
    let mut out = Vec::new();
    ctx.run_source(src, name, &mut out)?;
    assert_eq!(
        ctx.machine.stack_len(),
        0,
        "value stack not empty after running {}",
        name.unwrap_or("(from template)")
    );
    Ok(String::from_utf8(out).expect("program output is not UTF-8"))
}

pub fn run_source_with_config(src: &str, config: vm::Config) -> Result<String, InterpretError> {
    let mut ctx = ExecContext::new(config);
    run_in_context(&mut ctx, src, None)
}

pub fn run_source_test(src: &str) -> Result<String, InterpretError> {
    run_source_with_config(src, vm::Config::default())
}

/// Same as [`run_source_test`] with a collection before every allocation.
pub fn run_source_stress_test(src: &str) -> Result<String, InterpretError> {
    let mut config = vm::Config::default();
    config.gc.stress = true;
    run_source_with_config(src, config)
}

pub fn run_file_with_config(path: &str, config: vm::Config) -> Result<String, InterpretError> {
    let (file, src) = load_src(path);
    let mut ctx = ExecContext::new(config);
    run_in_context(&mut ctx, &src, Some(&file.to_string_lossy()))
}

pub fn run_file_test(path: &str) -> Result<String, InterpretError> {
    run_file_with_config(path, vm::Config::default())
}

pub fn load_src(path: &str) -> (PathBuf, String) {
    let file: PathBuf = [env!("CARGO_MANIFEST_DIR"), "tests/sgl", path]
        .iter()
        .collect();
    log::debug!("{}", file.display());
    let src = fileloader::load(&file.to_string_lossy()).unwrap();
    (file, src)
}

/// Splits program output into lines, for comparing against expected prints.
pub fn lines(output: &str) -> Vec<&str> {
    output.lines().collect()
}
