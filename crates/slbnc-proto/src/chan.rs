//! Channel name utilities.
//!
//! A buffer name is a channel when it starts with one of the network's
//! channel-type prefixes. The prefixes come from the upstream's ISUPPORT
//! `CHANTYPES` token; `DEFAULT_CHANTYPES` applies when no upstream context
//! is available.

/// Channel prefixes assumed when the upstream has not advertised CHANTYPES.
pub const DEFAULT_CHANTYPES: &str = "#&";

/// Check whether `name` is a channel name under the given prefix set.
///
/// Invalid names (empty, containing space, comma, BEL or NUL) are never
/// channels regardless of prefix.
pub fn is_channel_name_with(name: &str, chantypes: &str) -> bool {
    let mut chars = name.chars();

    let first = match chars.next() {
        Some(c) => c,
        None => return false,
    };

    if !chantypes.contains(first) {
        return false;
    }

    for c in chars {
        if c == ' ' || c == ',' || c == '\x07' || c == '\0' {
            return false;
        }
    }

    true
}

/// Check whether `name` is a channel name under the default prefix set.
pub fn is_channel_name(name: &str) -> bool {
    is_channel_name_with(name, DEFAULT_CHANTYPES)
}

/// Extract the CHANTYPES prefix set from a sequence of ISUPPORT tokens.
///
/// Tokens look like `CHANTYPES=#` or `AWAYLEN=200`; the 005 parameter list
/// is stored token-by-token. Returns `None` when no CHANTYPES token is
/// present.
pub fn chantypes_from_isupport<'a, I>(tokens: I) -> Option<String>
where
    I: IntoIterator<Item = &'a str>,
{
    for token in tokens {
        if let Some(value) = token.strip_prefix("CHANTYPES=") {
            return Some(value.to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_prefixes() {
        assert!(is_channel_name("#rust"));
        assert!(is_channel_name("&local"));
        assert!(!is_channel_name("bob"));
        assert!(!is_channel_name(""));
    }

    #[test]
    fn custom_prefixes() {
        assert!(is_channel_name_with("!chan", "#&!+"));
        assert!(!is_channel_name_with("!chan", "#"));
    }

    #[test]
    fn rejects_invalid_characters() {
        assert!(!is_channel_name("#with space"));
        assert!(!is_channel_name("#a,b"));
        assert!(!is_channel_name("#a\x07b"));
    }

    #[test]
    fn chantypes_extraction() {
        let tokens = ["AWAYLEN=200", "CHANTYPES=#", "NICKLEN=31"];
        assert_eq!(chantypes_from_isupport(tokens), Some("#".to_string()));

        let none = ["AWAYLEN=200", "NICKLEN=31"];
        assert_eq!(chantypes_from_isupport(none), None);
    }
}
