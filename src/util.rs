//! I/O helper traits shared by the scan and read paths.

use std::io::{self, Read, Seek, SeekFrom};

pub trait ReadExt {
    /// Read up to `read_len` bytes, appending them to `vec`.
    ///
    /// Unlike `read_exact`, hitting EOF is not an error: the vector simply
    /// grows by fewer than `read_len` bytes (possibly zero). The geometry scan
    /// relies on this, since a flash dump may end anywhere.
    fn read_to_vec(&mut self, vec: &mut Vec<u8>, read_len: usize) -> io::Result<()>;
}

impl<T: Read> ReadExt for T {
    fn read_to_vec(&mut self, vec: &mut Vec<u8>, read_len: usize) -> io::Result<()> {
        const CHUNK_SIZE: usize = 65536;

        let read_len = read_len + vec.len();
        let mut cursor = vec.len();
        while cursor < read_len {
            // Grow the vector enough to take the next chunk
            vec.resize(std::cmp::min(read_len, cursor + CHUNK_SIZE), 0u8);

            cursor += match self.read(&mut vec[cursor..]) {
                Ok(0) => {
                    // EOF; `cursor` is the final length
                    vec.truncate(cursor);
                    return Ok(());
                }
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => 0,
                Err(e) => return Err(e),
            };
        }

        Ok(())
    }
}

/// Positioned reads over a seekable source.
///
/// Every stage of the pipeline addresses the source by absolute byte offset
/// (PEB offsets are computed, never tracked), so reads always seek first.
pub trait ReadAt {
    /// Fill `buf` from the source starting at `offset`.
    fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()>;

    /// Read `len` bytes starting at `offset` into a fresh vector.
    fn read_vec_at(&mut self, offset: u64, len: usize) -> io::Result<Vec<u8>>;
}

impl<T: Read + Seek> ReadAt for T {
    fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.seek(SeekFrom::Start(offset))?;
        self.read_exact(buf)
    }

    fn read_vec_at(&mut self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read_exact_at(offset, &mut buf)?;
        Ok(buf)
    }
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
fn test_read_at() -> io::Result<()> {
    let mut cursor = io::Cursor::new(vec![0u8, 1, 2, 3, 4, 5, 6, 7]);
    let mut buf = [0u8; 3];
    cursor.read_exact_at(2, &mut buf)?;
    assert_eq!(buf, [2, 3, 4]);
    assert_eq!(cursor.read_vec_at(5, 3)?, [5, 6, 7]);
    assert!(cursor.read_vec_at(6, 3).is_err());
    Ok(())
}
