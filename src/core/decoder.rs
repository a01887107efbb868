//! Character decoding for the inbound stream
//!
//! BBS servers send a mix of UTF-8 and raw code page 437 line art with no
//! signal saying which is which. The decoder tries UTF-8 first and falls back
//! to CP437 one byte at a time:
//!
//! - `0x00..=0x7F` is ASCII and passes straight through.
//! - A byte that can start a UTF-8 sequence is buffered until the sequence
//!   completes (possibly in a later chunk).
//! - A byte that cannot start a sequence, or a buffered prefix that turns out
//!   not to be UTF-8, is emitted byte-by-byte through the CP437 table. The byte
//!   that broke the sequence is then reconsidered on its own.
//!
//! This is best effort. CP437 text that happens to form valid UTF-8 (a lead
//! byte such as `├` followed by shade or line glyphs in `0x80..=0xBF`) decodes
//! as UTF-8, and a lead byte at the very end of the stream is held until the
//! next byte arrives or [`CharDecoder::flush`] is called.

use tracing::trace;

/// Streaming UTF-8-then-CP437 decoder
#[derive(Debug, Clone, Default)]
pub struct CharDecoder {
    /// Bytes accumulated for current character
    buffer: [u8; 4],
    /// Number of bytes in buffer
    len: usize,
    /// Expected total bytes for current character
    expected: usize,
}

impl CharDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset the decoder state, discarding any partial sequence
    pub fn reset(&mut self) {
        self.len = 0;
        self.expected = 0;
    }

    /// Check if decoder is in the middle of a sequence
    pub fn is_pending(&self) -> bool {
        self.len > 0
    }

    /// Decode a run of bytes, appending characters to `out`
    pub fn decode_all(&mut self, bytes: &[u8], out: &mut Vec<char>) {
        for &byte in bytes {
            self.decode(byte, out);
        }
    }

    /// Feed one byte; zero or more characters are appended to `out`
    pub fn decode(&mut self, byte: u8, out: &mut Vec<char>) {
        if self.len == 0 {
            self.start(byte, out);
            return;
        }

        if !self.accepts(byte) {
            self.flush(out);
            self.start(byte, out);
            return;
        }

        self.buffer[self.len] = byte;
        self.len += 1;
        if self.len < self.expected {
            return;
        }

        match std::str::from_utf8(&self.buffer[..self.len])
            .ok()
            .and_then(|s| s.chars().next())
        {
            Some(ch) => {
                out.push(ch);
                self.reset();
            }
            None => self.flush(out),
        }
    }

    /// Emit any buffered bytes as CP437
    pub fn flush(&mut self, out: &mut Vec<char>) {
        if self.len > 0 {
            trace!("cp437 fallback for {:02x?}", &self.buffer[..self.len]);
        }
        out.extend(self.buffer[..self.len].iter().map(|&b| cp437(b)));
        self.reset();
    }

    fn start(&mut self, byte: u8, out: &mut Vec<char>) {
        let expected = match byte {
            0x00..=0x7F => {
                out.push(byte as char);
                return;
            }
            0xC2..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF4 => 4,
            // Continuation bytes, overlong leads and 0xF5.. never start UTF-8
            _ => {
                out.push(cp437(byte));
                return;
            }
        };
        self.buffer[0] = byte;
        self.len = 1;
        self.expected = expected;
    }

    /// Whether `byte` is a valid continuation at the current position
    fn accepts(&self, byte: u8) -> bool {
        if self.len == 1 {
            // Second-byte limits exclude overlongs, surrogates and > U+10FFFF
            let range = match self.buffer[0] {
                0xE0 => 0xA0..=0xBF,
                0xED => 0x80..=0x9F,
                0xF0 => 0x90..=0xBF,
                0xF4 => 0x80..=0x8F,
                _ => 0x80..=0xBF,
            };
            range.contains(&byte)
        } else {
            (0x80..=0xBF).contains(&byte)
        }
    }
}

/// Map a byte through IBM code page 437. C0 controls and DEL stay as-is.
pub fn cp437(byte: u8) -> char {
    if byte < 0x80 {
        byte as char
    } else {
        CP437_HIGH[(byte - 0x80) as usize]
    }
}

#[rustfmt::skip]
const CP437_HIGH: [char; 128] = [
    // 0x80
    'Ç', 'ü', 'é', 'â', 'ä', 'à', 'å', 'ç', 'ê', 'ë', 'è', 'ï', 'î', 'ì', 'Ä', 'Å',
    // 0x90
    'É', 'æ', 'Æ', 'ô', 'ö', 'ò', 'û', 'ù', 'ÿ', 'Ö', 'Ü', '¢', '£', '¥', '₧', 'ƒ',
    // 0xA0
    'á', 'í', 'ó', 'ú', 'ñ', 'Ñ', 'ª', 'º', '¿', '⌐', '¬', '½', '¼', '¡', '«', '»',
    // 0xB0
    '░', '▒', '▓', '│', '┤', '╡', '╢', '╖', '╕', '╣', '║', '╗', '╝', '╜', '╛', '┐',
    // 0xC0
    '└', '┴', '┬', '├', '─', '┼', '╞', '╟', '╚', '╔', '╩', '╦', '╠', '═', '╬', '╧',
    // 0xD0
    '╨', '╤', '╥', '╙', '╘', '╒', '╓', '╫', '╪', '┘', '┌', '█', '▄', '▌', '▐', '▀',
    // 0xE0
    'α', 'ß', 'Γ', 'π', 'Σ', 'σ', 'µ', 'τ', 'Φ', 'Θ', 'Ω', 'δ', '∞', 'φ', 'ε', '∩',
    // 0xF0
    '≡', '±', '≥', '≤', '⌠', '⌡', '÷', '≈', '°', '∙', '·', '√', 'ⁿ', '²', '■', '\u{a0}',
];

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn decode(bytes: &[u8]) -> String {
        let mut decoder = CharDecoder::new();
        let mut out = Vec::new();
        decoder.decode_all(bytes, &mut out);
        decoder.flush(&mut out);
        out.into_iter().collect()
    }

    #[test]
    fn test_ascii_passthrough() {
        assert_eq!(decode(b"Hello\x1b[0m\r\n"), "Hello\x1b[0m\r\n");
    }

    #[test]
    fn test_utf8_sequences() {
        assert_eq!(decode("é中😀".as_bytes()), "é中😀");
        assert_eq!(decode("┌─┐".as_bytes()), "┌─┐");
    }

    #[test]
    fn test_cp437_box_drawing() {
        assert_eq!(decode(&[0xDA, 0xC4, 0xC4, b'\r']), "┌──\r");
        assert_eq!(decode(&[0xB0, 0xB1, 0xB2, 0xDB]), "░▒▓█");
    }

    #[test]
    fn test_cp437_that_is_valid_utf8_decodes_as_utf8() {
        // ─┐ in CP437 is also U+013F
        assert_eq!(decode(&[0xC4, 0xBF]), "\u{13f}");
    }

    #[test]
    fn test_invalid_lead_bytes_use_table() {
        assert_eq!(decode(&[0x80, 0xC0, 0xC1, 0xF5, 0xFF]), "Ç└┴⌡\u{a0}");
    }

    #[test]
    fn test_broken_sequence_reprocesses_next_byte() {
        // E2 starts a 3-byte sequence; 'A' breaks it
        assert_eq!(decode(&[0xE2, b'A']), "ΓA");
        // ED A0 would be a surrogate
        assert_eq!(decode(&[0xED, 0xA0, 0x80]), "φáÇ");
        // F4 90 is above U+10FFFF
        assert_eq!(decode(&[0xF4, 0x90]), "⌠É");
    }

    #[test]
    fn test_sequence_split_across_chunks() {
        let mut decoder = CharDecoder::new();
        let mut out = Vec::new();
        let bytes = "中".as_bytes();

        decoder.decode_all(&bytes[..1], &mut out);
        assert!(out.is_empty());
        assert!(decoder.is_pending());

        decoder.decode_all(&bytes[1..], &mut out);
        assert_eq!(out, vec!['中']);
        assert!(!decoder.is_pending());
    }

    #[test]
    fn test_never_drops_bytes() {
        let bytes: Vec<u8> = (0x80..=0xFF).collect();
        let decoded: Vec<char> = {
            let mut decoder = CharDecoder::new();
            let mut out = Vec::new();
            for &b in &bytes {
                decoder.decode(b, &mut out);
                decoder.flush(&mut out);
            }
            out
        };
        assert_eq!(decoded.len(), 128);
        assert_eq!(decoded[0x33], '│');
    }
}
