//! # slbnc-proto
//!
//! IRC wire-protocol library for the Straylight bouncer.
//!
//! Unlike a full IRC daemon, a bouncer mostly shuttles lines it did not
//! originate, so the message model here is generic: a command name plus
//! positional parameters, with optional IRCv3 tags and a prefix. Verbs the
//! bouncer does not understand still round-trip through [`Message`] intact.
//!
//! ```rust
//! use slbnc_proto::Message;
//!
//! let msg: Message = ":nick!user@host PRIVMSG #channel :Hello!".parse().unwrap();
//! assert_eq!(msg.command, "PRIVMSG");
//! assert_eq!(msg.params, vec!["#channel", "Hello!"]);
//! ```

#![deny(clippy::all)]
#![warn(missing_docs)]

pub mod casemap;
pub mod chan;
#[cfg(feature = "tokio")]
pub mod codec;
pub mod error;
pub mod message;
pub mod prefix;
pub mod tags;

pub use casemap::{irc_eq, irc_to_lower};
pub use chan::is_channel_name;
#[cfg(feature = "tokio")]
pub use codec::IrcCodec;
pub use error::{MessageParseError, ProtocolError};
pub use message::{Message, Tag};
pub use prefix::Prefix;
