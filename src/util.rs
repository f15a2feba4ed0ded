use crate::error::{Error, Result};
use std::cmp;
use std::fs;
use std::io;
use std::path::Path;

/// Write `length` copies of `fill` to `output`.
pub fn do_pad<W: io::Write>(output: &mut W, length: usize, fill: u8) -> io::Result<()> {
    let mut pad = length;
    let fill_buf = [fill; 512];
    while pad > 0 {
        let amount_to_write = cmp::min(fill_buf.len(), pad);
        pad -= output.write(&fill_buf[..amount_to_write])?;
    }
    Ok(())
}

pub fn read_file(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).map_err(|e| Error::io(path, e))
}

pub fn read_text(path: &Path) -> Result<String> {
    fs::read_to_string(path).map_err(|e| Error::io(path, e))
}

pub fn write_file(path: &Path, contents: &[u8]) -> Result<()> {
    fs::write(path, contents).map_err(|e| Error::io(path, e))
}

/// Read a nonce or IV file. A file that does not exist yet yields `None`; the
/// caller then draws a fresh value and persists it.
pub fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(contents) if contents.is_empty() => Ok(None),
        Ok(contents) => Ok(Some(contents)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Error::io(path, e)),
    }
}

/// Read an input named on the command line that the build cannot go without.
/// A missing or empty file is a configuration error naming `what`.
pub fn read_required(path: &Path, what: &str) -> Result<Vec<u8>> {
    match fs::read(path) {
        Ok(contents) if contents.is_empty() => Err(Error::Configuration(format!(
            "{} file {} is empty",
            what,
            path.display()
        ))),
        Ok(contents) => Ok(contents),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Err(Error::Configuration(format!(
            "{} file {} not found",
            what,
            path.display()
        ))),
        Err(e) => Err(Error::io(path, e)),
    }
}

/// Read a decimal offset record, as written by the `diff` subcommand.
pub fn read_offset(path: &Path) -> Result<u32> {
    let text = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
    text.trim().parse().map_err(|_| {
        Error::Configuration(format!(
            "{} does not contain a decimal offset: {:?}",
            path.display(),
            text.trim()
        ))
    })
}

/// Parse a number given either in decimal or with a `0x` prefix.
pub fn parse_auto_int(s: &str) -> std::result::Result<u64, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("{:?} is not a number: {}", s, e))
}
