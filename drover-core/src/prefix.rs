//! Terminal colors and per-host output labels.
//!
//! Every output line of a run is tagged with `<user>@<host> | ` so that
//! interleaved streams from many hosts stay readable. The label is colored
//! per host and left-padded by the run loop so the `|` separators line up.

/// Escape sequence that resets all terminal attributes.
pub const RESET: &str = "\x1b[0m";

/// Palette rotated over by host index. Adjacent hosts always get
/// distinct colors because the palette has more than one entry.
const PALETTE: [&str; 6] = [
    "\x1b[36m", // cyan
    "\x1b[32m", // green
    "\x1b[33m", // yellow
    "\x1b[35m", // magenta
    "\x1b[34m", // blue
    "\x1b[31m", // red
];

/// Color for the host at position `index` in the network.
pub fn host_color(index: usize) -> &'static str {
    PALETTE[index % PALETTE.len()]
}

/// Left-pad `prefix` with spaces so its printable part aligns at `width`.
///
/// `printable_len` is the label length excluding escape sequences; the
/// caller tracks it separately because `prefix.len()` counts the escapes.
pub fn pad(prefix: &str, printable_len: usize, width: usize) -> String {
    if printable_len >= width {
        return prefix.to_string();
    }
    format!("{}{}", " ".repeat(width - printable_len), prefix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adjacent_hosts_get_distinct_colors() {
        for i in 0..32 {
            assert_ne!(host_color(i), host_color(i + 1));
        }
    }

    #[test]
    fn test_rotation_wraps() {
        assert_eq!(host_color(0), host_color(PALETTE.len()));
    }

    #[test]
    fn test_pad_aligns_to_width() {
        assert_eq!(pad("a | ", 4, 8), "    a | ");
    }

    #[test]
    fn test_pad_noop_at_width() {
        assert_eq!(pad("abcd | ", 7, 7), "abcd | ");
        assert_eq!(pad("abcd | ", 7, 3), "abcd | ");
    }

    #[test]
    fn test_pad_counts_printable_length_not_bytes() {
        let prefix = format!("{}x | ", RESET);
        let padded = pad(&prefix, 4, 6);
        assert!(padded.starts_with("  "));
        assert!(padded.ends_with("x | "));
    }
}
