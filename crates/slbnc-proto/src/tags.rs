//! IRCv3 message tag escaping utilities.

use std::fmt::{Result as FmtResult, Write};

/// The message-tags escape table: raw character to its wire sequence.
const TAG_ESCAPES: [(char, &str); 5] = [
    (';', "\\:"),
    (' ', "\\s"),
    ('\\', "\\\\"),
    ('\r', "\\r"),
    ('\n', "\\n"),
];

/// Write a tag value in wire form, escaping the characters the message-tags
/// grammar reserves.
pub fn escape_tag_value(f: &mut dyn Write, value: &str) -> FmtResult {
    for c in value.chars() {
        match TAG_ESCAPES.iter().find(|(raw, _)| *raw == c) {
            Some((_, escaped)) => f.write_str(escaped)?,
            None => f.write_char(c)?,
        }
    }
    Ok(())
}

/// Decode a tag value from wire form.
///
/// Unknown escape sequences drop the backslash and keep the character; a
/// dangling trailing backslash is dropped entirely, per the message-tags
/// grammar.
pub fn unescape_tag_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();

    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some(':') => out.push(';'),
            Some('s') => out.push(' '),
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some(other) => out.push(other),
            None => {}
        }
    }

    out
}

/// Encode key/value pairs as a `;`-separated tag string.
///
/// Used for data payloads carried inside a message parameter (e.g. the
/// per-buffer lines of `BOUNCER LISTBUFFERS`), not for the leading `@tags`
/// section, which [`crate::Message`] serializes itself.
pub fn encode_pairs<'a, I>(pairs: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut out = String::new();
    for (i, (key, value)) in pairs.into_iter().enumerate() {
        if i > 0 {
            out.push(';');
        }
        out.push_str(key);
        out.push('=');
        let _ = escape_tag_value(&mut out, value);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_round_trip() {
        let raw = "a;b c\\d\r\n";
        let mut escaped = String::new();
        escape_tag_value(&mut escaped, raw).unwrap();
        assert_eq!(escaped, "a\\:b\\sc\\\\d\\r\\n");
        assert_eq!(unescape_tag_value(&escaped), raw);
    }

    #[test]
    fn unescape_unknown_sequence_keeps_char() {
        assert_eq!(unescape_tag_value("\\x"), "x");
    }

    #[test]
    fn unescape_trailing_backslash_is_dropped() {
        assert_eq!(unescape_tag_value("abc\\"), "abc");
    }

    #[test]
    fn encode_pairs_escapes_values() {
        let encoded = encode_pairs([("network", "freenode"), ("topic", "a topic; here")]);
        assert_eq!(encoded, "network=freenode;topic=a\\stopic\\:\\shere");
    }
}
