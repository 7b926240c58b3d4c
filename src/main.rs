use std::env;
use std::process;

use sctrace::{trace_to_exit, Command};

fn main() {
    let argv: Vec<String> = env::args().skip(1).collect();

    if argv.is_empty() {
        eprintln!("Usage: sctrace PROGRAM [ARGS...]");
        process::exit(1);
    }

    let cmd = match Command::new(argv) {
        Ok(cmd) => cmd,
        Err(err) => {
            eprintln!("sctrace: bad argv: {}", err);
            process::exit(1);
        }
    };

    match trace_to_exit(cmd) {
        Ok(status) => process::exit(status.code()),
        Err(err) => {
            eprintln!("sctrace: {}", err);
            process::exit(1);
        }
    }
}
