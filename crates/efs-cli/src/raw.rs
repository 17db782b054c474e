//! Raw-buffer collaborators: the canonical hex dump and the byte-wise
//! substring search.

use std::io::{self, Write};

const BYTES_PER_LINE: usize = 16;

/// Write the canonical dump: `{8-hex offset}  {hex bytes}  {ASCII}` with
/// sixteen bytes per line and non-printable bytes rendered as `.`.
pub fn write_hex_dump(out: &mut impl Write, data: &[u8]) -> io::Result<()> {
    for (line, chunk) in data.chunks(BYTES_PER_LINE).enumerate() {
        let offset = line * BYTES_PER_LINE;
        let hex = chunk
            .iter()
            .map(|byte| format!("{byte:02x}"))
            .collect::<Vec<_>>()
            .join(" ");
        let ascii: String = chunk
            .iter()
            .map(|byte| {
                if (0x20..=0x7E).contains(byte) {
                    *byte as char
                } else {
                    '.'
                }
            })
            .collect();
        writeln!(out, "{offset:08x}  {hex:<48}  {ascii}")?;
    }
    Ok(())
}

/// Byte offsets of every (possibly overlapping) occurrence of `needle`.
///
/// Operates on raw bytes so matches straddling non-UTF8 regions are never
/// lost to a lossy decode.
#[must_use]
pub fn search_offsets(data: &[u8], needle: &[u8]) -> Vec<usize> {
    if needle.is_empty() || needle.len() > data.len() {
        return Vec::new();
    }
    data.windows(needle.len())
        .enumerate()
        .filter(|(_, window)| *window == needle)
        .map(|(offset, _)| offset)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dump_string(data: &[u8]) -> String {
        let mut out = Vec::new();
        write_hex_dump(&mut out, data).expect("dump");
        String::from_utf8(out).expect("utf8 dump")
    }

    #[test]
    fn dump_line_format() {
        let text = dump_string(b"ABC");
        assert_eq!(text, format!("00000000  {:<48}  ABC\n", "41 42 43"));
    }

    #[test]
    fn dump_wraps_at_sixteen_bytes_and_masks_nonprintable() {
        let mut data = (0x41_u8..0x51).collect::<Vec<_>>(); // 16 printable bytes
        data.push(0x00);
        data.push(0x7F);
        let text = dump_string(&data);

        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("00000000  41 42 43"));
        assert!(lines[0].ends_with("ABCDEFGHIJKLMNOP"));
        assert!(lines[1].starts_with("00000010  00 7f"));
        assert!(lines[1].ends_with(".."));
    }

    #[test]
    fn search_finds_every_offset() {
        assert_eq!(search_offsets(b"abab", b"ab"), vec![0, 2]);
        assert_eq!(search_offsets(b"aaa", b"aa"), vec![0, 1]);
        assert_eq!(search_offsets(b"abc", b"xyz"), Vec::<usize>::new());
        assert_eq!(search_offsets(b"abc", b""), Vec::<usize>::new());
    }

    #[test]
    fn search_crosses_non_utf8_regions() {
        let mut data = vec![0xFF, 0xFE];
        data.extend_from_slice(b"secret");
        data.push(0xFF);
        assert_eq!(search_offsets(&data, b"secret"), vec![2]);
    }
}
