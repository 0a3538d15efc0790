use std::sync::Arc;

use anyhow::{ensure, Context};
use tape_jit::{
    clear_driver, compile_and_enter, install_driver, parse, JitDriver, Runtime, MAX_FUNCTIONS,
};

/// Lazy x86_64 JIT for an extended tape language: functions are separated by `/`, `@` calls the
/// function whose id is in the current cell, and each function is compiled to native code the
/// first time it is called.
#[derive(argh::FromArgs)]
struct Args {
    /// path to the source program
    #[argh(positional)]
    source: String,

    /// print each parsed function to stderr before running
    #[argh(switch)]
    dump_ops: bool,
}

fn main() -> anyhow::Result<()> {
    let args: Args = argh::from_env();

    let source = std::fs::read(&args.source)
        .with_context(|| format!("failed to read `{}`", args.source))?;

    let functions = parse(&source);
    ensure!(
        functions.len() <= MAX_FUNCTIONS,
        "program defines {} functions, more than the supported {MAX_FUNCTIONS}",
        functions.len(),
    );

    if args.dump_ops {
        for (id, function) in functions.iter().enumerate() {
            let ops: Vec<String> = function.iter().map(|op| op.to_string()).collect();
            eprintln!("fn {id}: {}", ops.join(" "));
        }
    }

    let runtime = Arc::new(Runtime::new(compile_and_enter));
    let driver = JitDriver::new(functions, runtime.clone());
    let main_id = driver.main_id();
    install_driver(driver);

    runtime.start(main_id);
    println!();

    clear_driver();
    Ok(())
}
