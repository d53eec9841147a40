//! Byte-offset reads over a job's append-only log file.
//!
//! Writers (coordinator + workers) only append; readers only read
//! prefix-stable bytes, so no locking is needed. A reader identifies itself
//! by the byte offset of its last read.

use anyhow::{Context, Result};
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

/// Read the slice `[offset, file_size)` of `path` and return it as lossy
/// UTF-8 together with the new offset (the file length at read time).
///
/// Returns `("", offset)` when the file is missing or `offset >= file_size`.
pub fn read_new_bytes(path: &Path, offset: u64) -> Result<(String, u64)> {
    let mut file = match std::fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok((String::new(), offset));
        }
        Err(e) => return Err(e).with_context(|| format!("open log {}", path.display())),
    };

    let len = file
        .metadata()
        .with_context(|| format!("stat log {}", path.display()))?
        .len();
    if offset >= len {
        return Ok((String::new(), offset));
    }

    file.seek(SeekFrom::Start(offset))
        .with_context(|| format!("seek log {}", path.display()))?;
    let mut buf = Vec::with_capacity((len - offset) as usize);
    file.read_to_end(&mut buf)
        .with_context(|| format!("read log {}", path.display()))?;

    let new_offset = offset + buf.len() as u64;
    Ok((String::from_utf8_lossy(&buf).into_owned(), new_offset))
}

/// Return the last `n` lines of `path` as a string, lossy UTF-8.
/// An absent file reads as empty.
pub fn tail_lines(path: &Path, n: u64) -> String {
    let Ok(data) = std::fs::read(path) else {
        return String::new();
    };
    let text = String::from_utf8_lossy(&data);
    if n == 0 {
        return text.into_owned();
    }
    let lines: Vec<&str> = text.lines().collect();
    let skip = lines.len().saturating_sub(n as usize);
    lines[skip..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn read_past_end_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("j.log");
        std::fs::write(&path, b"hello\n").unwrap();

        let (text, off) = read_new_bytes(&path, 6).unwrap();
        assert_eq!(text, "");
        assert_eq!(off, 6);

        let (text, off) = read_new_bytes(&path, 999).unwrap();
        assert_eq!(text, "");
        assert_eq!(off, 999);
    }

    #[test]
    fn missing_file_reads_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let (text, off) = read_new_bytes(&tmp.path().join("nope.log"), 0).unwrap();
        assert_eq!(text, "");
        assert_eq!(off, 0);
    }

    #[test]
    fn successive_reads_concatenate_to_full_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("j.log");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(b"one\n").unwrap();

        let (a, off) = read_new_bytes(&path, 0).unwrap();
        assert_eq!(a, "one\n");

        f.write_all(b"two\nthree\n").unwrap();
        let (b, off) = read_new_bytes(&path, off).unwrap();
        assert_eq!(b, "two\nthree\n");

        let (c, _) = read_new_bytes(&path, off).unwrap();
        assert_eq!(c, "");

        assert_eq!(format!("{a}{b}{c}"), "one\ntwo\nthree\n");
    }

    #[test]
    fn tail_keeps_last_n_lines() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("j.log");
        std::fs::write(&path, b"a\nb\nc\nd\n").unwrap();

        assert_eq!(tail_lines(&path, 2), "c\nd");
        assert_eq!(tail_lines(&path, 10), "a\nb\nc\nd");
        assert_eq!(tail_lines(&tmp.path().join("nope"), 5), "");
    }
}
