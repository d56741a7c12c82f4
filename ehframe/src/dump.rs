// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! Rendering compiled tables the way `readelf --debug-frame` renders CFI.

use std::io::{self, Write};

use crate::table::{UnwindRow, UnwindTable};
use ehframe_common::Arch;

/// Write the whole table, one block per FDE: a `fde start..end` line, a
/// header naming the CFA and each tracked register column, then one line
/// per row. The return-address column prints under the header `ra`.
pub fn print_table<T: Write>(table: &UnwindTable, out: &mut T) -> io::Result<()> {
    let arch = table.arch();
    let rows: Vec<&UnwindRow> = table.rows().collect();
    let mut start = 0;
    while start < rows.len() {
        let fde_start = rows[start].fde_start;
        let mut end = start;
        while end < rows.len() && rows[end].fde_start == fde_start {
            end += 1;
        }
        if start > 0 {
            writeln!(out)?;
        }
        print_fde_rows(&rows[start..end], arch, out)?;
        start = end;
    }
    Ok(())
}

fn print_fde_rows<T: Write>(
    rows: &[&UnwindRow],
    arch: Arch,
    out: &mut T,
) -> io::Result<()> {
    let first = rows[0];
    let last = rows[rows.len() - 1];
    writeln!(out, "fde {:#x}..{:#x}", first.fde_start, last.top)?;

    let mut header = format!("{:>18} {:<9}", "LOC", "CFA");
    for &reg in &first.register_order {
        let name = if reg == first.ra_register {
            "ra".to_string()
        } else {
            arch.describe_register(reg)
        };
        header.push_str(&format!(" {name:<6}"));
    }
    writeln!(out, "{}", header.trim_end())?;

    for row in rows {
        let mut line = format!("{:#018x} {:<9}", row.base, row.cfa.describe(arch));
        for &reg in &row.register_order {
            line.push_str(&format!(" {:<6}", row.rule_for(reg).describe(arch)));
        }
        writeln!(out, "{}", line.trim_end())?;
    }
    Ok(())
}
