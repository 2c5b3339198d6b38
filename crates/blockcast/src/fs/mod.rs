//! File-backed producer and consumer workers.
//!
//! Both workers address the file by block sequence number - byte offset is
//! always `sequence * block_size` - so drains and fills may run out of order
//! and in parallel. IO runs through positioned reads/writes on a shared
//! handle inside `spawn_blocking`.
//!
//! With `direct_io` enabled (Linux) the file is opened with `O_DIRECT`: the
//! sector-aligned block region is used as the IO buffer directly, the last
//! block is written out to the full block boundary, and the writer truncates
//! the file to the true byte length at finalize.

mod reader;
mod writer;

pub use reader::FileBlockReader;
pub use writer::FileBlockWriter;

use std::fs::File;
use std::io;

/// Read into `buf` starting at `offset` until the buffer is full or EOF.
/// Returns the number of bytes read.
pub(crate) fn read_full_at(file: &File, buf: &mut [u8], mut offset: u64) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = read_at(file, &mut buf[filled..], offset)?;
        if n == 0 {
            break;
        }
        filled += n;
        offset += n as u64;
    }
    Ok(filled)
}

/// Write all of `buf` starting at `offset`.
pub(crate) fn write_full_at(file: &File, buf: &[u8], mut offset: u64) -> io::Result<()> {
    let mut written = 0;
    while written < buf.len() {
        let n = write_at(file, &buf[written..], offset)?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "positioned write made no progress",
            ));
        }
        written += n;
        offset += n as u64;
    }
    Ok(())
}

#[cfg(unix)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.read_at(buf, offset)
}

#[cfg(unix)]
fn write_at(file: &File, buf: &[u8], offset: u64) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.write_at(buf, offset)
}

#[cfg(windows)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_read(buf, offset)
}

#[cfg(windows)]
fn write_at(file: &File, buf: &[u8], offset: u64) -> io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_write(buf, offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_read_full_at_stops_at_eof() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"0123456789").unwrap();
        tmp.flush().unwrap();

        let file = File::open(tmp.path()).unwrap();
        let mut buf = [0u8; 16];
        let n = read_full_at(&file, &mut buf, 4).unwrap();
        assert_eq!(n, 6);
        assert_eq!(&buf[..n], b"456789");
    }

    #[test]
    fn test_write_full_at_positions_correctly() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let file = File::options()
            .read(true)
            .write(true)
            .open(tmp.path())
            .unwrap();

        write_full_at(&file, b"world", 6).unwrap();
        write_full_at(&file, b"hello ", 0).unwrap();

        let content = std::fs::read(tmp.path()).unwrap();
        assert_eq!(&content, b"hello world");
    }
}
