//! The owned IRC message type: parsing and serialization.
//!
//! Message format:
//!
//! ```text
//! [@tags] [:prefix] <command> [params...] [:trailing]
//! ```
//!
//! The command is kept as an uppercased string rather than a closed enum: a
//! bouncer forwards verbs it does not recognize, so every syntactically
//! valid command must survive a parse/serialize round trip.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use nom::{
    bytes::complete::{take_until, take_while1},
    character::complete::{char, space0},
    combinator::opt,
    error::ErrorKind,
    sequence::preceded,
    IResult,
};
use smallvec::SmallVec;

use crate::error::{MessageParseError, ProtocolError};
use crate::prefix::Prefix;
use crate::tags::{escape_tag_value, unescape_tag_value};

/// An IRCv3 message tag: key and optional value.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Tag(
    /// Tag key (e.g. `time`, `msgid`).
    pub String,
    /// Optional tag value, unescaped.
    pub Option<String>,
);

impl Tag {
    /// Create a new tag with a key and optional value.
    pub fn new(key: impl Into<String>, value: Option<String>) -> Self {
        Tag(key.into(), value)
    }
}

/// An owned IRC message.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Message {
    /// IRCv3 message tags (e.g. `time`, `msgid`).
    pub tags: Option<Vec<Tag>>,
    /// Message prefix/source (e.g. `nick!user@host`).
    pub prefix: Option<Prefix>,
    /// Uppercased command name or three-digit numeric.
    pub command: String,
    /// Positional parameters, trailing included as the last entry.
    pub params: Vec<String>,
}

impl Message {
    /// Construct a message from a command and parameters.
    pub fn new<C, P>(command: C, params: P) -> Self
    where
        C: Into<String>,
        P: IntoIterator,
        P::Item: Into<String>,
    {
        Message {
            tags: None,
            prefix: None,
            command: command.into().to_uppercase(),
            params: params.into_iter().map(Into::into).collect(),
        }
    }

    /// Set the prefix/source of this message.
    #[must_use]
    pub fn with_prefix(mut self, prefix: Prefix) -> Self {
        self.prefix = Some(prefix);
        self
    }

    /// Add a single IRCv3 tag to this message.
    #[must_use]
    pub fn with_tag<K, V>(mut self, key: K, value: Option<V>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        let tag = Tag::new(key, value.map(Into::into));
        self.tags.get_or_insert_with(Vec::new).push(tag);
        self
    }

    /// Get a parameter by position.
    pub fn param(&self, index: usize) -> Option<&str> {
        self.params.get(index).map(String::as_str)
    }

    /// Get the nickname from the message prefix, if present.
    pub fn source_nickname(&self) -> Option<&str> {
        self.prefix.as_ref().and_then(Prefix::nick)
    }

    /// Get the value of an IRCv3 tag by key.
    pub fn tag_value(&self, key: &str) -> Option<&str> {
        self.tags
            .as_ref()?
            .iter()
            .find(|Tag(k, _)| k == key)
            .and_then(|Tag(_, v)| v.as_deref())
    }
}

// ============================================================================
// Parsing
// ============================================================================

/// Parse IRCv3 message tags (the part after `@` and before the first space).
fn parse_tags_section(input: &str) -> IResult<&str, &str> {
    preceded(char('@'), take_until(" "))(input)
}

/// Parse message prefix (the part after `:` and before the first space).
fn parse_prefix_section(input: &str) -> IResult<&str, &str> {
    preceded(char(':'), take_while1(|c| c != ' '))(input)
}

/// Parse the command name.
///
/// RFC 2812: a command is `1*letter` or exactly `3digit`. The token runs to
/// the next space or line ending and is validated as a whole.
fn parse_command(input: &str) -> IResult<&str, &str> {
    let boundary = input.find([' ', '\r', '\n']).unwrap_or(input.len());
    let (token, rest) = input.split_at(boundary);

    let valid = match token.len() {
        0 => false,
        3 if token.bytes().all(|b| b.is_ascii_digit()) => true,
        _ => token.bytes().all(|b| b.is_ascii_alphabetic()),
    };

    if valid {
        Ok((rest, token))
    } else {
        Err(nom::Err::Error(nom::error::Error::new(
            input,
            ErrorKind::AlphaNumeric,
        )))
    }
}

/// RFC 2812 parameter cap.
const MAX_PARAMS: usize = 15;

/// Split the remainder after the command into parameters.
///
/// The trailing parameter starts at the first ` :` and keeps its spaces;
/// everything before it is whitespace-separated, with runs of spaces
/// collapsing.
fn parse_params(input: &str) -> SmallVec<[&str; MAX_PARAMS]> {
    let input = input.trim_end_matches(['\r', '\n']);

    let (middle, trailing) = match input.find(" :") {
        Some(idx) => (&input[..idx], Some(&input[idx + 2..])),
        None => (input, None),
    };

    let mut params: SmallVec<[&str; MAX_PARAMS]> = SmallVec::new();
    params.extend(middle.split_ascii_whitespace().take(MAX_PARAMS));

    if params.len() < MAX_PARAMS {
        if let Some(trailing) = trailing {
            params.push(trailing);
        }
    }

    params
}

/// Parse a raw tags string into `Tag` structs.
fn parse_tags_string(tags_str: &str) -> Vec<Tag> {
    tags_str
        .split(';')
        .filter(|s| !s.is_empty())
        .map(|tag| {
            let mut iter = tag.splitn(2, '=');
            let key = iter.next().unwrap_or("");
            let value = iter.next().map(unescape_tag_value);
            Tag(key.to_string(), value)
        })
        .collect()
}

/// Parse a complete message into its borrowed components.
fn parse_message(
    input: &str,
) -> IResult<&str, (Option<&str>, Option<&str>, &str, SmallVec<[&str; MAX_PARAMS]>)> {
    let (input, tags) = opt(parse_tags_section)(input)?;
    let (input, _) = space0(input)?;

    let (input, prefix) = opt(parse_prefix_section)(input)?;
    let (input, _) = space0(input)?;

    let (input, command) = parse_command(input)?;

    let params = parse_params(input);

    Ok(("", (tags, prefix, command, params)))
}

impl FromStr for Message {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Message, Self::Err> {
        if s.trim_end_matches(['\r', '\n']).is_empty() {
            return Err(ProtocolError::InvalidMessage {
                string: s.to_owned(),
                cause: MessageParseError::EmptyMessage,
            });
        }

        let (_, (tags, prefix, command, params)) =
            parse_message(s).map_err(|_| ProtocolError::InvalidMessage {
                string: s.to_owned(),
                cause: MessageParseError::InvalidCommand,
            })?;

        Ok(Message {
            tags: tags.map(parse_tags_string),
            prefix: prefix.map(Prefix::new_from_str),
            command: command.to_uppercase(),
            params: params.into_iter().map(str::to_string).collect(),
        })
    }
}

// ============================================================================
// Serialization
// ============================================================================

impl Display for Message {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if let Some(ref tags) = self.tags {
            write!(f, "@")?;

            for (i, tag) in tags.iter().enumerate() {
                if i > 0 {
                    write!(f, ";")?;
                }

                write!(f, "{}", tag.0)?;

                if let Some(ref value) = tag.1 {
                    write!(f, "=")?;
                    escape_tag_value(f, value)?;
                }
            }

            write!(f, " ")?;
        }

        if let Some(ref prefix) = self.prefix {
            write!(f, ":{} ", prefix)?;
        }

        write!(f, "{}", self.command)?;

        let last = self.params.len().saturating_sub(1);
        for (i, param) in self.params.iter().enumerate() {
            let needs_colon =
                i == last && (param.is_empty() || param.contains(' ') || param.starts_with(':'));
            if needs_colon {
                write!(f, " :{}", param)?;
            } else {
                write!(f, " {}", param)?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_simple_ping() {
        let msg: Message = "PING :server".parse().unwrap();
        assert_eq!(msg.command, "PING");
        assert_eq!(msg.params, vec!["server"]);
    }

    #[test]
    fn parse_privmsg_with_prefix() {
        let msg: Message = ":nick!user@host PRIVMSG #channel :Hello, world!"
            .parse()
            .unwrap();
        assert_eq!(msg.command, "PRIVMSG");
        assert_eq!(msg.source_nickname(), Some("nick"));
        assert_eq!(msg.params, vec!["#channel", "Hello, world!"]);
    }

    #[test]
    fn parse_with_tags() {
        let msg: Message = "@time=2023-01-01T00:00:00Z;msgid=abc123 :nick PRIVMSG #ch :Hi"
            .parse()
            .unwrap();
        assert_eq!(msg.tag_value("time"), Some("2023-01-01T00:00:00Z"));
        assert_eq!(msg.tag_value("msgid"), Some("abc123"));
        assert_eq!(msg.tag_value("missing"), None);
    }

    #[test]
    fn parse_lowercase_command_is_uppercased() {
        let msg: Message = "privmsg #a hi".parse().unwrap();
        assert_eq!(msg.command, "PRIVMSG");
    }

    #[test]
    fn parse_numeric() {
        let msg: Message = ":irc.example.com 001 bob :Welcome".parse().unwrap();
        assert_eq!(msg.command, "001");
        assert_eq!(msg.params, vec!["bob", "Welcome"]);
    }

    #[test]
    fn parse_crlf_terminated() {
        let msg: Message = "NICK bob\r\n".parse().unwrap();
        assert_eq!(msg.command, "NICK");
        assert_eq!(msg.params, vec!["bob"]);
    }

    #[test]
    fn parse_collapses_consecutive_spaces() {
        let msg: Message = "JOIN   #a".parse().unwrap();
        assert_eq!(msg.params, vec!["#a"]);
    }

    #[test]
    fn parse_rejects_empty_and_garbage() {
        assert!("".parse::<Message>().is_err());
        assert!("\r\n".parse::<Message>().is_err());
        assert!("12 not-a-command".parse::<Message>().is_err());
    }

    #[test]
    fn serialize_trailing_rules() {
        let msg = Message::new("PRIVMSG", ["#a", "two words"]);
        assert_eq!(msg.to_string(), "PRIVMSG #a :two words");

        let msg = Message::new("PRIVMSG", ["#a", "oneword"]);
        assert_eq!(msg.to_string(), "PRIVMSG #a oneword");

        let msg = Message::new("TOPIC", ["#a", ""]);
        assert_eq!(msg.to_string(), "TOPIC #a :");
    }

    #[test]
    fn serialize_with_prefix_and_tags() {
        let msg = Message::new("PRIVMSG", ["#a", "hi there"])
            .with_prefix(Prefix::new_from_str("nick!user@host"))
            .with_tag("time", Some("x"));
        assert_eq!(msg.to_string(), "@time=x :nick!user@host PRIVMSG #a :hi there");
    }

    #[test]
    fn round_trip() {
        for raw in [
            "PING token",
            ":bnc PRIVMSG bob :Welcome to your BNC!",
            "@a=b;c :n!u@h NOTICE #x :hi there",
            "CAP REQ :server-time echo-message",
        ] {
            let msg: Message = raw.parse().unwrap();
            assert_eq!(msg.to_string(), raw);
        }
    }
}
