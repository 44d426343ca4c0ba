//! Human-readable status report

use super::buffer::BufferUsage;
use super::space_index::SpaceStats;
use std::fmt::Write;

/// Render a byte count as binary units, e.g. `30MB,661KB,201bytes`
pub fn human_size(bytes: usize) -> String {
    if bytes == 0 {
        return "0bytes".to_string();
    }

    let mut parts = Vec::new();
    let mut rest = bytes;
    for (shift, unit) in [(30, "GB"), (20, "MB"), (10, "KB"), (0, "bytes")] {
        let n = rest >> shift;
        rest &= (1usize << shift) - 1;
        if n > 0 {
            parts.push(format!("{}{}", n, unit));
        }
    }
    parts.join(",")
}

/// Status text: live usage per buffer, then free space per size class
pub fn render(name: &str, usage: &[BufferUsage], space: &[SpaceStats], fragment_limit: usize) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "{} MEMORY", name);
    for (id, u) in usage.iter().enumerate() {
        let percent = if u.capacity == 0 {
            0.0
        } else {
            u.bytes as f64 * 100.0 / u.capacity as f64
        };
        let _ = writeln!(
            out,
            "  memory#{} - {} entries use {} bytes (total {}), {:.2}%",
            id,
            u.entries,
            u.bytes,
            human_size(u.capacity),
            percent
        );
    }

    let large: Vec<_> = space.iter().map(|s| s.large).collect();
    let fragment: Vec<_> = space.iter().map(|s| s.fragment).collect();
    for (title, chains) in [
        (format!("Large(>={})", human_size(fragment_limit)), large),
        ("Fragment".to_string(), fragment),
    ] {
        let ranges: usize = chains.iter().map(|c| c.ranges).sum();
        let bytes: usize = chains.iter().map(|c| c.bytes).sum();
        let _ = writeln!(out, "{} {} spaces {} bytes", title, ranges, bytes);
        for (id, c) in chains.iter().enumerate() {
            let _ = writeln!(out, "  memory#{} - {} spaces {} bytes", id, c.ranges, c.bytes);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::space_index::ChainStats;

    #[test]
    fn test_human_size() {
        assert_eq!(human_size(0), "0bytes");
        assert_eq!(human_size(13212), "12KB,924bytes");
        assert_eq!(human_size(32134345), "30MB,661KB,201bytes");
        assert_eq!(human_size(1 << 20), "1MB");
        assert_eq!(human_size(2342342306246), "2181GB,487MB,714KB,454bytes");
    }

    #[test]
    fn test_render_sections() {
        let usage = [BufferUsage { entries: 2, bytes: 460, capacity: 1 << 20 }];
        let space = [SpaceStats {
            fragment: ChainStats { ranges: 1, bytes: 100 },
            large: ChainStats { ranges: 1, bytes: (1 << 20) - 560 },
        }];

        let text = render("DM-x", &usage, &space, 1024);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "DM-x MEMORY");
        assert_eq!(lines[1], "  memory#0 - 2 entries use 460 bytes (total 1MB), 0.04%");
        assert_eq!(lines[2], format!("Large(>=1KB) 1 spaces {} bytes", (1 << 20) - 560));
        assert_eq!(lines[4], "Fragment 1 spaces 100 bytes");
        assert_eq!(lines.len(), 6);
    }
}
