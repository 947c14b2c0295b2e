//! Useful traits and other utilities that don't really belong anywhere else.

use std::io::{self, Read};

pub trait ReadExt {
    /// Reads up to `read_len` bytes onto the end of `vec`, stopping early only at EOF.
    ///
    /// Unlike `read_exact`, a short read at EOF is not an error: the caller sees fewer than
    /// `read_len` new bytes, and zero new bytes means the stream is exhausted.
    fn read_to_vec(&mut self, vec: &mut Vec<u8>, read_len: usize) -> io::Result<()>;
}

impl<T: Read> ReadExt for T {
    fn read_to_vec(&mut self, vec: &mut Vec<u8>, read_len: usize) -> io::Result<()> {
        let target = vec.len() + read_len;
        let mut cursor = vec.len();
        vec.resize(target, 0u8);

        while cursor < target {
            match self.read(&mut vec[cursor..]) {
                Ok(0) => break,
                Ok(n) => cursor += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    vec.truncate(cursor);
                    return Err(e);
                }
            }
        }

        vec.truncate(cursor);
        Ok(())
    }
}

/// Quote a string for safe interpolation into an `sh -c` command line.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// The last component of a slash-separated path (`/dev/block/mmcblk0p2` -> `mmcblk0p2`).
pub fn basename(path: &str) -> &str {
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(path)
}

#[test]
fn test_read_to_vec() -> io::Result<()> {
    let mut vec = Vec::new();
    io::repeat(0xAA).read_to_vec(&mut vec, 4)?;
    assert_eq!(vec, [0xAA; 4]);
    io::repeat(0xBB).read_to_vec(&mut vec, 2)?;
    assert_eq!(vec, [0xAA, 0xAA, 0xAA, 0xAA, 0xBB, 0xBB]);
    (&[1, 2, 3][..]).read_to_vec(&mut vec, 8)?;
    assert_eq!(vec, [0xAA, 0xAA, 0xAA, 0xAA, 0xBB, 0xBB, 1, 2, 3]);
    Ok(())
}

#[test]
fn test_shell_quote() {
    assert_eq!(shell_quote("/sdcard/nandroid"), "'/sdcard/nandroid'");
    assert_eq!(shell_quote("it's"), r"'it'\''s'");
}

#[test]
fn test_basename() {
    assert_eq!(basename("/dev/block/mmcblk0p2"), "mmcblk0p2");
    assert_eq!(basename("boot"), "boot");
    assert_eq!(basename("/sdcard/nandroid/mine/"), "mine");
}
