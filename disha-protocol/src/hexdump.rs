//! Hex dumps for protocol-violation log lines.

use std::fmt::Write;

/// Render up to `max_lines` sixteen-byte lines of `data` with a printable
/// ASCII column, for warn-level logging of rejected frames.
///
/// ```text
///        0  1  2  3  4  5  6  7  8  9  A  B  C  D  E  F [20]
/// 0000: 00 14 00 06 00 11 22 33 44 55 66 77 88 99 AA BB | ......"3DUfw....
/// 0010: CC DD EE FF                                     | ....
/// ```
pub fn hex_dump(data: &[u8], max_lines: usize) -> String {
    if data.is_empty() {
        return "<empty>".to_string();
    }

    let mut out = String::new();
    let _ = writeln!(
        out,
        "       0  1  2  3  4  5  6  7  8  9  A  B  C  D  E  F [{}]",
        data.len()
    );

    for (line, chunk) in data.chunks(16).enumerate().take(max_lines) {
        let _ = write!(out, "{:04X}: ", line * 16);
        for b in chunk {
            let _ = write!(out, "{:02X} ", b);
        }
        for _ in chunk.len()..16 {
            out.push_str("   ");
        }
        out.push_str("| ");
        for &b in chunk {
            out.push(if (32..127).contains(&b) { b as char } else { '.' });
        }
        out.push('\n');
    }
    out
}

/// Single-line rendering used where a dump would drown the log line,
/// e.g. an undecodable network name inside a message description.
pub fn hex_dump_line(data: &[u8]) -> String {
    let mut out = String::with_capacity(8 + data.len() * 4);
    out.push_str("bytes(");
    for (idx, b) in data.iter().enumerate() {
        if idx > 0 {
            out.push_str(", ");
        }
        let _ = write!(out, "{:02X}", b);
    }
    out.push(')');
    out
}
