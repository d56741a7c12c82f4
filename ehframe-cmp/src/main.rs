// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! Diffs the unwind tables of two binaries row by row.
//!
//! The typical use is comparing two builds of the same program (different
//! compilers, different optimization levels) to find places where one
//! toolchain emitted call frame information the other did not, or where the
//! two disagree outright.

use std::path::{Path, PathBuf};

use clap::{Arg, ArgAction, Command};
use log::error;

use ehframe::UnwindTable;
use ehframe_check::{compare_tables, CompareOptions};

fn make_app() -> Command {
    Command::new("ehframe-cmp")
        .version(clap::crate_version!())
        .about("Compares the compiled unwind tables of two binaries.")
        .next_line_help(true)
        .override_usage("ehframe-cmp [OPTIONS] <first> <second>")
        .arg(Arg::new("strict").long("strict").action(ArgAction::SetTrue).long_help(
            "Enable strict mode.

By default a register rule that is Undefined on either side agrees with \
anything, because toolchains routinely omit rules for registers they never \
restore. Strict mode requires both tables to spell out identical rules.",
        ))
        .arg(Arg::new("cfa").long("cfa").action(ArgAction::SetTrue).long_help(
            "Compare CFA when not used by register rules.

A difference in the CFA rule is only observable through register rules that \
are offsets from the CFA, so rows without such rules normally tolerate one. \
This flag reports every CFA difference regardless.",
        ))
        .arg(
            Arg::new("verbose")
                .long("verbose")
                .value_parser(["off", "error", "warn", "info", "debug", "trace"])
                .default_value("error")
                .long_help(
                    "Set the logging level.

--verbose=debug prints every program counter the comparison visits, which \
helps narrow down where two tables start to drift apart.",
                ),
        )
        .arg(
            Arg::new("first")
                .required(true)
                .value_parser(clap::value_parser!(PathBuf))
                .help("Path to the binary whose table is reported first in mismatches."),
        )
        .arg(
            Arg::new("second")
                .required(true)
                .value_parser(clap::value_parser!(PathBuf))
                .help("Path to the binary to compare it against."),
        )
        .after_help(
            "
EXIT STATUS:

  0 when the two tables agree everywhere, 1 when at least one mismatch was \
reported, 2 when a binary could not be read or the tables are not comparable \
(for example, different machine architectures).
",
        )
}

fn load_table(path: &Path) -> UnwindTable {
    match UnwindTable::from_path(path) {
        Ok(table) => table,
        Err(err) => {
            error!("Error reading {}: {}", path.display(), err);
            std::process::exit(2);
        }
    }
}

fn main() {
    let matches = make_app().get_matches();

    let verbosity = matches.get_one::<String>("verbose").unwrap();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(verbosity)).init();

    let options = CompareOptions {
        strict: matches.get_flag("strict"),
        check_cfa: matches.get_flag("cfa"),
    };

    let first = matches.get_one::<PathBuf>("first").unwrap();
    let second = matches.get_one::<PathBuf>("second").unwrap();

    let left = load_table(first);
    let right = load_table(second);

    let names = (
        first.to_string_lossy().into_owned(),
        second.to_string_lossy().into_owned(),
    );
    match compare_tables(&left, &right, (&names.0, &names.1), options) {
        Ok(mismatches) if mismatches.is_empty() => {
            println!("All green.");
        }
        Ok(mismatches) => {
            for mismatch in &mismatches {
                println!("{mismatch}");
            }
            std::process::exit(1);
        }
        Err(err) => {
            error!("{}", err);
            std::process::exit(2);
        }
    }
}
