use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

const READ_CHUNK: usize = 64 * 1024;

/// CRC-32C (Castagnoli) over the entire contents of the file at `path`,
/// streamed through a fixed-size buffer.
pub fn crc32c_file(path: &Path) -> std::io::Result<u32> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut buf = [0u8; READ_CHUNK];
    let mut crc = 0u32;
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        crc = crc32c::crc32c_append(crc, &buf[..n]);
    }
    Ok(crc)
}
