use std::borrow::Cow;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// `*.json` files directly inside `dir`, sorted by path.
pub fn discover_items(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = fs::read_dir(dir).with_context(|| format!("reading input directory {}", dir.display()))?;
    let mut items = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "json") {
            items.push(path);
        }
    }
    items.sort();
    Ok(items)
}

/// One identifier per line; surrounding whitespace trimmed, blank lines skipped.
/// Lines are raw bytes, so names that are not UTF-8 survive the round trip.
pub fn read_retry_list(path: &Path) -> Result<Vec<PathBuf>> {
    let raw = fs::read(path).with_context(|| format!("reading retry file {}", path.display()))?;
    Ok(raw
        .split(|b| *b == b'\n')
        .map(<[u8]>::trim_ascii)
        .filter(|line| !line.is_empty())
        .map(path_from_bytes)
        .collect())
}

/// Writes in the retry-file format so the output can be fed back with `--retry`.
pub fn write_failure_list(path: &Path, items: &[PathBuf]) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating failures file {}", path.display()))?;
    let mut w = BufWriter::new(file);
    for item in items {
        w.write_all(&path_bytes(item))?;
        w.write_all(b"\n")?;
    }
    w.flush()?;
    Ok(())
}

#[cfg(unix)]
fn path_from_bytes(raw: &[u8]) -> PathBuf {
    use std::os::unix::ffi::OsStrExt;
    PathBuf::from(std::ffi::OsStr::from_bytes(raw))
}

#[cfg(not(unix))]
fn path_from_bytes(raw: &[u8]) -> PathBuf {
    PathBuf::from(String::from_utf8_lossy(raw).into_owned())
}

#[cfg(unix)]
fn path_bytes(path: &Path) -> Cow<'_, [u8]> {
    use std::os::unix::ffi::OsStrExt;
    Cow::Borrowed(path.as_os_str().as_bytes())
}

#[cfg(not(unix))]
fn path_bytes(path: &Path) -> Cow<'_, [u8]> {
    Cow::Owned(path.to_string_lossy().into_owned().into_bytes())
}
