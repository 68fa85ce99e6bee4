//! Reader of the process mapping table.

use std::{
    fs::File,
    hash::{DefaultHasher, Hash as _, Hasher as _},
    io::Read as _,
};

use mwritten_core::{Mapping, MemoryAccess, Va};

use crate::Error;

/// Returns the mappings of the current process intersecting `[va, end)`.
///
/// The kernel writes the table into a buffer on the stack. A heap buffer
/// may be write-protected by the tracker, and the kernel does not raise a
/// fault for it; the read would fail with `EFAULT` instead.
pub fn read(va: Va, end: Va) -> Result<Vec<Mapping>, Error> {
    let mut file = File::open("/proc/self/maps")?;
    let mut chunk = [0u8; 4096];
    let mut line = Vec::with_capacity(256);
    let mut result = Vec::new();

    'outer: loop {
        let n = match file.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        };

        for &byte in &chunk[..n] {
            if byte != b'\n' {
                line.push(byte);
                continue;
            }

            let mapping = parse(&line)?;
            line.clear();

            if mapping.base >= end {
                break 'outer;
            }

            if mapping.end > va {
                result.push(mapping);
            }
        }
    }

    Ok(result)
}

/// Parses one line of `/proc/self/maps`.
///
/// ```text
/// 7f2c4a000000-7f2c4a021000 rw-p 00000000 00:00 0
/// ```
pub fn parse(line: &[u8]) -> Result<Mapping, Error> {
    let line = std::str::from_utf8(line).map_err(|_| Error::MalformedMapping)?;
    let mut fields = line.split_ascii_whitespace();

    let range = fields.next().ok_or(Error::MalformedMapping)?;
    let perms = fields.next().ok_or(Error::MalformedMapping)?.as_bytes();

    let (base, end) = range.split_once('-').ok_or(Error::MalformedMapping)?;
    let base = u64::from_str_radix(base, 16).map_err(|_| Error::MalformedMapping)?;
    let end = u64::from_str_radix(end, 16).map_err(|_| Error::MalformedMapping)?;

    if perms.len() < 3 || end <= base {
        return Err(Error::MalformedMapping);
    }

    let mut access = MemoryAccess::empty();
    if perms[0] == b'r' {
        access |= MemoryAccess::R;
    }
    if perms[1] == b'w' {
        access |= MemoryAccess::W;
    }
    if perms[2] == b'x' {
        access |= MemoryAccess::X;
    }

    let offset = fields.next().ok_or(Error::MalformedMapping)?;
    let offset = u64::from_str_radix(offset, 16).map_err(|_| Error::MalformedMapping)?;
    let device = fields.next().ok_or(Error::MalformedMapping)?;
    let inode = fields.next().ok_or(Error::MalformedMapping)?;
    let path = fields.next().unwrap_or("");

    Ok(Mapping {
        base: Va(base),
        end: Va(end),
        access,
        identity: identity(base, offset, device, inode, path),
    })
}

//
// The kernel keeps `offset - base` constant when a file mapping is split,
// so it names the mapping together with the file. Anonymous memory shows
// offset 0 in every piece and can only be told apart by its name.
//
fn identity(base: u64, offset: u64, device: &str, inode: &str, path: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    device.hash(&mut hasher);
    inode.hash(&mut hasher);
    path.hash(&mut hasher);

    if inode != "0" {
        offset.wrapping_sub(base).hash(&mut hasher);
    }

    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_line() -> Result<(), Error> {
        let mapping = parse(b"7f2c4a000000-7f2c4a021000 rw-p 00000000 00:00 0")?;
        assert_eq!(mapping.base, Va(0x7f2c4a000000));
        assert_eq!(mapping.end, Va(0x7f2c4a021000));
        assert_eq!(mapping.access, MemoryAccess::RW);

        let mapping =
            parse(b"55d0c6a00000-55d0c6a02000 r-xp 00002000 08:01 1234   /usr/bin/cat")?;
        assert_eq!(mapping.access, MemoryAccess::RX);

        assert!(matches!(parse(b"garbage"), Err(Error::MalformedMapping)));
        Ok(())
    }

    #[test]
    fn split_pieces_share_identity() -> Result<(), Error> {
        let text = parse(b"55d0c6a00000-55d0c6a02000 r-xp 00002000 08:01 1234   /usr/bin/cat")?;
        let data = parse(b"55d0c6a02000-55d0c6a03000 rw-p 00004000 08:01 1234   /usr/bin/cat")?;
        let other = parse(b"55d0c6a03000-55d0c6a04000 rw-p 00000000 08:01 1234   /usr/bin/cat")?;
        assert_eq!(text.identity, data.identity);
        assert_ne!(data.identity, other.identity);

        let anon = parse(b"7f2c4a000000-7f2c4a021000 rw-p 00000000 00:00 0")?;
        let heap = parse(b"7f2c4a021000-7f2c4a042000 rw-p 00000000 00:00 0   [heap]")?;
        assert_ne!(anon.identity, heap.identity);
        Ok(())
    }

    #[test]
    fn finds_anonymous_mapping() -> Result<(), Error> {
        let map = memmap2::MmapMut::map_anon(3 * 4096)?;
        let base = Va::from(map.as_ptr());

        let mappings = read(base, base + 3 * 4096)?;
        assert!(!mappings.is_empty());
        assert!(mappings[0].base <= base);
        assert!(mappings.iter().all(|mapping| mapping.access.contains(MemoryAccess::RW)));
        Ok(())
    }
}
