//! Decompiles every method of a DEX file to stdout: the raw instruction
//! listing with block annotations, then the reconstructed control-flow
//! tree. Methods that defeat reconstruction are logged and skipped; a
//! malformed container aborts the run.

use std::env;
use std::fs;
use std::process::ExitCode;

use log::error;

use dexrev::{methods, DexScanner, MethodDasm};

fn main() -> ExitCode
{
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    if args.len() != 2 {
        eprintln!("usage: dexrev <classes.dex>");
        return ExitCode::from(2);
    }

    match run(&args[1]) {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("aborted: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(path: &str) -> Result<(), Box<dyn std::error::Error>>
{
    let bytes = fs::read(path)?;
    let mut dex = DexScanner::new(bytes);
    dex.parse()?;

    let mut current_class = u32::MAX;
    for m in methods(&dex)
    {
        if m.class_type_idx != current_class {
            current_class = m.class_type_idx;
            println!("== {}", dex.type_descriptor(current_class)?);
        }
        let name = dex.method_name(m.method_idx)?;
        println!("  {}", name);

        let mut dasm = match MethodDasm::run(&dex, m.code_offs) {
            Ok(d) => d,
            Err(e) => {
                error!("{}: flow analysis failed: {}", name, e);
                continue;
            }
        };
        print!("{}", dasm.raw_listing()?);
        match dasm.reconstruct_ast() {
            Ok(_) => print!("{}", dasm.render_ast()),
            Err(e) => error!("{}: reconstruction failed: {}", name, e),
        }
        println!();
    }

    Ok(())
}
