//! Detach-key parsing and escape-sequence detection.
//!
//! A detach sequence is written as comma-separated key names, e.g. the
//! default `ctrl-o,ctrl-c`, and resolves to its control bytes at startup.
//! The detector sits between stdin and the upstream socket: bytes matching a
//! prefix of the sequence are held back until the match either completes
//! (detach) or breaks (the held bytes are released in order).

/// Resolve a `ctrl-o,ctrl-c`-style specification to raw bytes.
pub fn parse_detach_keys(spec: &str) -> Result<Vec<u8>, String> {
    let mut seq = Vec::new();
    for part in spec.split(',') {
        let part = part.trim();
        if let Some(key) = part.strip_prefix("ctrl-") {
            let mut chars = key.chars();
            let (Some(c), None) = (chars.next(), chars.next()) else {
                return Err(format!("cannot parse key {part:?}"));
            };
            let byte = match c.to_ascii_lowercase() {
                c @ 'a'..='z' => c as u8 - b'a' + 1,
                '@' => 0x00,
                '[' => 0x1b,
                '\\' => 0x1c,
                ']' => 0x1d,
                '^' => 0x1e,
                '_' => 0x1f,
                other => return Err(format!("cannot map ctrl-{other}")),
            };
            seq.push(byte);
        } else {
            let mut chars = part.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) if c.is_ascii() && !c.is_ascii_control() => seq.push(c as u8),
                _ => return Err(format!("unknown key {part:?}")),
            }
        }
    }
    if seq.is_empty() {
        return Err("empty detach sequence".to_string());
    }
    Ok(seq)
}

/// Incremental matcher for the detach sequence over chunked reads.
pub struct EscapeDetector {
    seq: Vec<u8>,
    matched: usize,
}

impl EscapeDetector {
    pub fn new(seq: Vec<u8>) -> Self {
        debug_assert!(!seq.is_empty());
        EscapeDetector { seq, matched: 0 }
    }

    /// Feed one chunk of input. Returns the bytes to forward and whether the
    /// full detach sequence was seen; the sequence itself is swallowed.
    pub fn feed(&mut self, input: &[u8]) -> (Vec<u8>, bool) {
        let mut out = Vec::with_capacity(input.len());
        for &byte in input {
            if byte == self.seq[self.matched] {
                self.matched += 1;
                if self.matched == self.seq.len() {
                    self.matched = 0;
                    return (out, true);
                }
                continue;
            }
            if self.matched > 0 {
                // Broken prefix: release the held bytes, then reconsider the
                // current byte as a possible new sequence start.
                out.extend_from_slice(&self.seq[..self.matched]);
                self.matched = 0;
                if byte == self.seq[0] {
                    self.matched = 1;
                    if self.seq.len() == 1 {
                        self.matched = 0;
                        return (out, true);
                    }
                    continue;
                }
            }
            out.push(byte);
        }
        (out, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_sequence_parses() {
        assert_eq!(parse_detach_keys("ctrl-o,ctrl-c").unwrap(), vec![0x0f, 0x03]);
    }

    #[test]
    fn named_and_plain_keys() {
        assert_eq!(parse_detach_keys("ctrl-a").unwrap(), vec![0x01]);
        assert_eq!(parse_detach_keys("ctrl-[").unwrap(), vec![0x1b]);
        assert_eq!(parse_detach_keys("q").unwrap(), vec![b'q']);
        assert_eq!(parse_detach_keys("ctrl-p,q").unwrap(), vec![0x10, b'q']);
    }

    #[test]
    fn bad_specs_are_rejected() {
        assert!(parse_detach_keys("").is_err());
        assert!(parse_detach_keys("ctrl-").is_err());
        assert!(parse_detach_keys("ctrl-1").is_err());
        assert!(parse_detach_keys("escape").is_err());
    }

    #[test]
    fn plain_input_passes_through() {
        let mut detector = EscapeDetector::new(vec![0x0f, 0x03]);
        let (out, detach) = detector.feed(b"ls -la\n");
        assert_eq!(out, b"ls -la\n");
        assert!(!detach);
    }

    #[test]
    fn full_sequence_detaches_and_is_swallowed() {
        let mut detector = EscapeDetector::new(vec![0x0f, 0x03]);
        let (out, detach) = detector.feed(&[b'a', 0x0f, 0x03]);
        assert_eq!(out, b"a");
        assert!(detach);
    }

    #[test]
    fn sequence_split_across_reads() {
        let mut detector = EscapeDetector::new(vec![0x0f, 0x03]);
        let (out, detach) = detector.feed(&[0x0f]);
        assert!(out.is_empty());
        assert!(!detach);
        let (out, detach) = detector.feed(&[0x03]);
        assert!(out.is_empty());
        assert!(detach);
    }

    #[test]
    fn broken_prefix_is_released() {
        let mut detector = EscapeDetector::new(vec![0x0f, 0x03]);
        let (out, detach) = detector.feed(&[0x0f]);
        assert!(out.is_empty() && !detach);
        let (out, detach) = detector.feed(b"x");
        assert_eq!(out, &[0x0f, b'x']);
        assert!(!detach);
    }

    #[test]
    fn prefix_byte_restarts_the_match() {
        let mut detector = EscapeDetector::new(vec![0x0f, 0x03]);
        let (out, detach) = detector.feed(&[0x0f, 0x0f, 0x03]);
        assert_eq!(out, &[0x0f]);
        assert!(detach);
    }

    #[test]
    fn single_key_sequence() {
        let mut detector = EscapeDetector::new(vec![b'q']);
        let (out, detach) = detector.feed(b"abq");
        assert_eq!(out, b"ab");
        assert!(detach);
    }
}
