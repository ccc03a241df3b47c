//! Escaping for instrument-directed commands.
//!
//! The adapter treats CR, LF, ESC and `+` as its own control characters, so each of
//! them must be preceded by ESC when it is meant for the instrument. On top of that,
//! every byte is followed by a NUL: the USB-serial receiver in this deployment drops
//! every other byte, and the padding keeps the real data intact after that lossy
//! stage. The padding must stay until the receiver fault is confirmed gone on the
//! actual hardware.

/// Carriage return.
pub const CR: u8 = 13;
/// Line feed.
pub const LF: u8 = 10;
/// Escape character, also the escape marker.
pub const ESC: u8 = 27;
/// Plus sign, the first byte of a controller command.
pub const PLUS: u8 = 43;
/// Pad byte emitted after every character.
pub const PAD: u8 = 0;

/// Returns true if the adapter would interpret `byte` itself.
pub fn is_reserved(byte: u8) -> bool {
    matches!(byte, CR | LF | ESC | PLUS)
}

/// Substituted for characters the ASCII line encoding cannot carry.
pub const REPLACEMENT: u8 = b'?';

/// Encode `text` one byte per character: ASCII passes through, anything else becomes `?`.
pub fn encode_ascii(text: &str) -> Vec<u8> {
    text.chars()
        .map(|c| if c.is_ascii() { c as u8 } else { REPLACEMENT })
        .collect()
}

/// Escape an instrument command for the adapter.
///
/// The text is ASCII-encoded first, so every character yields exactly one data byte.
/// Each reserved byte gets an ESC in front of it, and every byte, escaped or not, is
/// followed by a NUL. The transform is one-way.
pub fn escape(instrument_command: &str) -> Vec<u8> {
    escape_bytes(&encode_ascii(instrument_command))
}

/// Escape already-encoded bytes.
pub fn escape_bytes(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len() * 2 + bytes.len() / 4);
    for &byte in bytes {
        if is_reserved(byte) {
            out.push(ESC);
        }
        out.push(byte);
        out.push(PAD);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_input() {
        assert!(escape("").is_empty());
    }

    #[test]
    fn test_plain_command_is_padded() {
        assert_eq!(
            escape("DT 2"),
            vec![0x44, 0x00, 0x54, 0x00, 0x20, 0x00, 0x32, 0x00]
        );
    }

    #[test]
    fn test_plain_text_doubles_length_without_escapes() {
        let input = "DT 2,1,0.0025";
        let out = escape(input);
        assert_eq!(out.len(), 2 * input.len());
        assert!(!out.contains(&ESC));
        for (i, byte) in input.bytes().enumerate() {
            assert_eq!(out[2 * i], byte);
            assert_eq!(out[2 * i + 1], PAD);
        }
    }

    #[test]
    fn test_each_reserved_byte_is_escaped() {
        for reserved in [CR, LF, ESC, PLUS] {
            let input = String::from_utf8(vec![b'A', reserved, b'B']).unwrap();
            assert_eq!(
                escape(&input),
                vec![b'A', PAD, ESC, reserved, PAD, b'B', PAD],
                "reserved byte {}",
                reserved
            );
        }
    }

    #[test]
    fn test_mixed_input() {
        let out = escape("+\r\n");
        assert_eq!(out, vec![ESC, PLUS, PAD, ESC, CR, PAD, ESC, LF, PAD]);
    }

    #[test]
    fn test_reserved_bytes_always_preceded_by_esc() {
        let input = "A+B\rC\nD\x1bE++";
        let out = escape(input);
        let reserved_count = input.bytes().filter(|b| is_reserved(*b)).count();
        assert_eq!(out.len(), 2 * input.len() + reserved_count);

        // Walk the output: [ESC] byte PAD for every input byte.
        let mut pos = 0;
        for byte in input.bytes() {
            if is_reserved(byte) {
                assert_eq!(out[pos], ESC);
                pos += 1;
            }
            assert_eq!(out[pos], byte);
            assert_eq!(out[pos + 1], PAD);
            pos += 2;
        }
        assert_eq!(pos, out.len());
    }

    #[test]
    fn test_non_ascii_is_one_byte_per_character() {
        let out = escape("µs");
        assert_eq!(out, vec![REPLACEMENT, PAD, b's', PAD]);
        assert_eq!(out.len(), 2 * "µs".chars().count());
    }

    #[test]
    fn test_encode_ascii_replaces_only_non_ascii() {
        assert_eq!(encode_ascii("DT 2"), b"DT 2".to_vec());
        assert_eq!(encode_ascii("5 µs ±"), b"5 ?s ?".to_vec());
    }
}
