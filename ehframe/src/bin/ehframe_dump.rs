// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

use std::env;
use std::io::Write;
use std::path::Path;

use ehframe::{dump, UnwindTable};

const USAGE: &str = "Usage: ehframe_dump <binary>";

fn print_unwind_table(path: &Path) {
    match UnwindTable::from_path(path) {
        Ok(table) => {
            let stdout = &mut std::io::stdout();
            writeln!(
                stdout,
                "{} ({}): {} unwind rows\n",
                path.display(),
                table.arch(),
                table.len()
            )
            .unwrap();
            dump::print_table(&table, stdout).unwrap();
        }
        Err(err) => {
            let mut stderr = std::io::stderr();
            writeln!(&mut stderr, "Error reading {}: {}", path.display(), err).unwrap();
        }
    }
}

fn main() {
    env_logger::init();
    if let Some(arg) = env::args().nth(1) {
        let path = Path::new(&arg);
        print_unwind_table(path);
    } else {
        let mut stderr = std::io::stderr();
        writeln!(&mut stderr, "{}", USAGE).unwrap();
    }
}
