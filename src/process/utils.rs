use std::borrow::Cow;

/// The RFB files are ISO-8859-1. Every byte maps to the code point of the
/// same value, so ASCII input is borrowed untouched.
pub fn decode_latin1(raw: &[u8]) -> Cow<'_, str> {
    if raw.is_ascii() {
        // ASCII is valid UTF-8.
        Cow::Borrowed(std::str::from_utf8(raw).unwrap_or_default())
    } else {
        Cow::Owned(raw.iter().map(|&b| b as char).collect())
    }
}

/// Trim whitespace + strip outer quotes if present.
pub fn clean_str(raw: &str) -> &str {
    let trimmed = raw.trim();
    if trimmed.len() >= 2 && trimmed.starts_with('"') && trimmed.ends_with('"') {
        trimmed[1..trimmed.len() - 1].trim()
    } else {
        trimmed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latin1_accents_decode() {
        // "SÃO PAULO" with 0xC3 = 'Ã'
        let raw = b"S\xC3O PAULO";
        assert_eq!(decode_latin1(raw), "SÃO PAULO");
        assert!(matches!(decode_latin1(b"ATIVA"), Cow::Borrowed("ATIVA")));
    }

    #[test]
    fn clean_strips_padding_and_quotes() {
        assert_eq!(clean_str("  abc "), "abc");
        assert_eq!(clean_str("\" 12 \""), "12");
        assert_eq!(clean_str("\""), "\"");
        assert_eq!(clean_str(""), "");
    }
}
