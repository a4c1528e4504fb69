/// Iterator over the lines of an owned string.
///
/// Collector transforms hand out `'static` iterators, so they cannot borrow
/// the raw text they were built from. Trailing `\r` is stripped like
/// [`str::lines`] does.
#[derive(Debug, Clone)]
pub struct OwnedLines {
    text: String,
    pos: usize,
}

impl OwnedLines {
    pub fn new(text: String) -> Self {
        OwnedLines { text, pos: 0 }
    }
}

impl Iterator for OwnedLines {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        if self.pos >= self.text.len() {
            return None;
        }
        let rest = &self.text[self.pos..];
        let (line, consumed) = match rest.find('\n') {
            Some(idx) => (&rest[..idx], idx + 1),
            None => (rest, rest.len()),
        };
        let line = line.strip_suffix('\r').unwrap_or(line).to_string();
        self.pos += consumed;
        Some(line)
    }
}

/// Convert a `seconds.fraction` timestamp, as printed by perf, to nanoseconds.
///
/// The fraction is interpreted by its digits, so `"1.5"` is 1.5 s and
/// `"1.000001"` is 1 s + 1 µs. Digits beyond nanosecond precision are dropped.
pub fn timestamp_to_ns(secs: &str, frac: &str) -> Option<u64> {
    let secs: u64 = secs.parse().ok()?;
    if !frac.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let mut digits: String = frac.chars().take(9).collect();
    while digits.len() < 9 {
        digits.push('0');
    }
    let nanos: u64 = digits.parse().ok()?;
    secs.checked_mul(1_000_000_000)?.checked_add(nanos)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owned_lines_matches_str_lines() {
        let text = "first\r\nsecond\n\nlast";
        let owned: Vec<String> = OwnedLines::new(text.to_string()).collect();
        let borrowed: Vec<&str> = text.lines().collect();
        assert_eq!(owned, borrowed);
    }

    #[test]
    fn test_owned_lines_trailing_newline() {
        let owned: Vec<String> = OwnedLines::new("a\nb\n".to_string()).collect();
        assert_eq!(owned, vec!["a", "b"]);
    }

    #[test]
    fn test_timestamp_to_ns() {
        assert_eq!(timestamp_to_ns("24779", "937931"), Some(24_779_937_931_000));
        assert_eq!(timestamp_to_ns("1", "5"), Some(1_500_000_000));
        assert_eq!(timestamp_to_ns("0", "1234567891"), Some(123_456_789));
        assert_eq!(timestamp_to_ns("x", "1"), None);
        assert_eq!(timestamp_to_ns("1", "-1"), None);
    }
}
