//! CLI entry point: `xsplice-diff original.o patched.o kernel-object output.o
//! [--debug] [--resolve]`, mirroring the original tool's argp-parsed usage
//! line. No arg-parsing crate is pulled in for four positionals and two
//! flags; a manual loop over `env::args()` is plenty.

use std::env;
use std::fs;
use std::path::Path;
use std::process;

use xsplice_diff::error::{exit_code, Error};
use xsplice_diff::logger::{self, Logger};
use xsplice_diff::lookup::{NullLookup, SymbolLookup};
use xsplice_diff::pipeline::{self, Outcome};

struct Arguments {
    original: String,
    patched: String,
    kernel_object: String,
    output: String,
    debug: bool,
    resolve: bool,
}

fn print_usage() {
    eprintln!("Usage: xsplice-diff [options] original.o patched.o kernel-object output.o");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -d, --debug      Show debug output");
    eprintln!("  -r, --resolve    Resolve to-be-patched function addresses");
}

fn parse_args() -> Arguments {
    let args: Vec<String> = env::args().collect();

    let mut positional = Vec::with_capacity(4);
    let mut debug = false;
    let mut resolve = false;

    for arg in &args[1..] {
        match arg.as_str() {
            "-d" | "--debug" => debug = true,
            "-r" | "--resolve" => resolve = true,
            "-h" | "--help" => {
                print_usage();
                process::exit(exit_code::SUCCESS);
            }
            other => positional.push(other.to_string()),
        }
    }

    if positional.len() != 4 {
        print_usage();
        process::exit(exit_code::INTERNAL_ERROR);
    }

    Arguments {
        original: positional[0].clone(),
        patched: positional[1].clone(),
        kernel_object: positional[2].clone(),
        output: positional[3].clone(),
        debug,
        resolve,
    }
}

fn main() {
    let args = parse_args();

    logger::init_backend(args.debug);
    let logger = Logger::new(args.debug);

    let code = run(&args, &logger);
    process::exit(code);
}

fn run(args: &Arguments, logger: &Logger) -> i32 {
    let base_bytes = match fs::read(&args.original) {
        Ok(b) => b,
        Err(err) => return fail(&format!("reading {}: {}", args.original, err)),
    };
    let patched_bytes = match fs::read(&args.patched) {
        Ok(b) => b,
        Err(err) => return fail(&format!("reading {}: {}", args.patched, err)),
    };

    let lookup: Box<dyn SymbolLookup> = if args.resolve {
        match xsplice_diff::lookup::KernelObjectLookup::open(Path::new(&args.kernel_object)) {
            Ok(l) => Box::new(l),
            Err(err) => return fail(&err.to_string()),
        }
    } else {
        Box::new(NullLookup)
    };

    match pipeline::run(&base_bytes, &patched_bytes, lookup.as_ref(), args.resolve, logger) {
        Ok(Outcome::NoChanges) => {
            logger.normal(format_args!("no functional change"));
            exit_code::NO_CHANGES
        }
        Ok(Outcome::Patch(bytes)) => match fs::write(&args.output, bytes) {
            Ok(()) => exit_code::SUCCESS,
            Err(err) => fail(&format!("writing {}: {}", args.output, err)),
        },
        Err(Error::DiffFatal(msg)) => {
            eprintln!("{}", msg);
            exit_code::DIFF_FATAL
        }
        Err(err) => fail(&err.to_string()),
    }
}

fn fail(msg: &str) -> i32 {
    eprintln!("{}", msg);
    exit_code::INTERNAL_ERROR
}
