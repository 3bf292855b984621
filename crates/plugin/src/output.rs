//! CNI documents on stdout
//!
//! stdout belongs to the runtime; nothing else may be written there.

use serde::Serialize;
use std::io::{self, Write};

/// Write one JSON document followed by a newline
pub fn write_json<T: Serialize>(mut out: impl Write, value: &T) -> io::Result<()> {
    serde_json::to_writer(&mut out, value)?;
    writeln!(out)?;
    out.flush()
}

pub fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
    write_json(io::stdout().lock(), value)
}
