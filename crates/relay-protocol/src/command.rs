//! Client → server commands.
//!
//! A control line is split on single spaces; the first field is the tag,
//! matched case-insensitively. Lines whose first field is not a known tag
//! are chat and are relayed verbatim, including unknown `/tags`.

use std::fmt;

use relay_core::{DomainError, FileName, Handle, TransferDescriptor};

/// Recognized command tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandTag {
    Register,
    Store,
    Dir,
    Get,
    Leave,
}

impl CommandTag {
    pub const ALL: [CommandTag; 5] = [
        CommandTag::Register,
        CommandTag::Store,
        CommandTag::Dir,
        CommandTag::Get,
        CommandTag::Leave,
    ];

    /// Wire form of the tag, including the leading slash.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Register => "/register",
            Self::Store => "/store",
            Self::Dir => "/dir",
            Self::Get => "/get",
            Self::Leave => "/leave",
        }
    }

    pub const fn usage(&self) -> &'static str {
        match self {
            Self::Register => "/register <handle>",
            Self::Store => "/store <filename> <size>",
            Self::Dir => "/dir",
            Self::Get => "/get <filename>",
            Self::Leave => "/leave",
        }
    }

    /// Number of arguments following the tag.
    pub const fn arity(&self) -> usize {
        match self {
            Self::Register | Self::Get => 1,
            Self::Store => 2,
            Self::Dir | Self::Leave => 0,
        }
    }

    /// Looks up a tag, ignoring ASCII case.
    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|candidate| candidate.as_str().eq_ignore_ascii_case(tag))
    }
}

impl fmt::Display for CommandTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded control line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Claim a unique handle
    Register { handle: Handle },

    /// Upload: exactly `size` raw bytes follow the control line
    Store(TransferDescriptor),

    /// List the server directory
    Dir,

    /// Download a file
    Get { name: FileName },

    /// Close the session
    Leave,

    /// Anything else, relayed verbatim to the other sessions
    Chat(String),
}

/// Format violations. These never close the connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("Incorrect command format for {tag}: expected {expected} argument(s), got {actual}")]
    Arity {
        tag: CommandTag,
        expected: usize,
        actual: usize,
    },

    #[error("Incorrect command format for {tag}: {source}")]
    InvalidArgument {
        tag: CommandTag,
        #[source]
        source: DomainError,
    },
}

impl CommandError {
    /// Tag of the command that failed to parse.
    pub fn tag(&self) -> CommandTag {
        match self {
            Self::Arity { tag, .. } | Self::InvalidArgument { tag, .. } => *tag,
        }
    }
}

impl Command {
    /// Decodes a control line.
    pub fn parse(line: &str) -> Result<Self, CommandError> {
        let mut fields = line.trim_end_matches(' ').split(' ');

        let Some(tag) = fields.next().and_then(CommandTag::from_tag) else {
            return Ok(Self::Chat(line.to_string()));
        };

        let args: Vec<&str> = fields.collect();
        let invalid = |source: DomainError| CommandError::InvalidArgument { tag, source };

        match (tag, args.as_slice()) {
            (CommandTag::Register, [handle]) => Ok(Self::Register {
                handle: Handle::new(*handle).map_err(invalid)?,
            }),
            (CommandTag::Store, [name, size]) => {
                let name = FileName::new(*name).map_err(invalid)?;
                let size = TransferDescriptor::parse_size(size).map_err(invalid)?;
                Ok(Self::Store(TransferDescriptor::new(name, size)))
            }
            (CommandTag::Dir, []) => Ok(Self::Dir),
            (CommandTag::Get, [name]) => Ok(Self::Get {
                name: FileName::new(*name).map_err(invalid)?,
            }),
            (CommandTag::Leave, []) => Ok(Self::Leave),
            (tag, args) => Err(CommandError::Arity {
                tag,
                expected: tag.arity(),
                actual: args.len(),
            }),
        }
    }

    /// Tag of this command, `None` for chat.
    pub fn tag(&self) -> Option<CommandTag> {
        match self {
            Self::Register { .. } => Some(CommandTag::Register),
            Self::Store(_) => Some(CommandTag::Store),
            Self::Dir => Some(CommandTag::Dir),
            Self::Get { .. } => Some(CommandTag::Get),
            Self::Leave => Some(CommandTag::Leave),
            Self::Chat(_) => None,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Register { handle } => write!(f, "{} {handle}", CommandTag::Register),
            Self::Store(desc) => write!(f, "{} {} {}", CommandTag::Store, desc.name, desc.size),
            Self::Dir => write!(f, "{}", CommandTag::Dir),
            Self::Get { name } => write!(f, "{} {name}", CommandTag::Get),
            Self::Leave => write!(f, "{}", CommandTag::Leave),
            Self::Chat(text) => f.write_str(text),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_register() {
        let cmd = Command::parse("/register alice").unwrap();
        assert_eq!(
            cmd,
            Command::Register {
                handle: Handle::new("alice").unwrap()
            }
        );
        assert_eq!(cmd.to_string(), "/register alice");
    }

    #[test]
    fn test_parse_is_case_insensitive() {
        assert_eq!(Command::parse("/DIR").unwrap(), Command::Dir);
        assert!(matches!(
            Command::parse("/Get a.txt").unwrap(),
            Command::Get { .. }
        ));
    }

    #[test]
    fn test_parse_store() {
        match Command::parse("/store report.txt 11").unwrap() {
            Command::Store(desc) => {
                assert_eq!(desc.name.as_str(), "report.txt");
                assert_eq!(desc.size, 11);
            }
            other => panic!("expected Store, got {other:?}"),
        }
    }

    #[test]
    fn test_trailing_spaces_ignored() {
        assert_eq!(Command::parse("/dir   ").unwrap(), Command::Dir);
        assert_eq!(Command::parse("/leave ").unwrap(), Command::Leave);
    }

    #[test]
    fn test_arity_errors() {
        let err = Command::parse("/store onlyonearg").unwrap_err();
        assert_eq!(
            err,
            CommandError::Arity {
                tag: CommandTag::Store,
                expected: 2,
                actual: 1
            }
        );

        assert_eq!(Command::parse("/register").unwrap_err().tag(), CommandTag::Register);
        assert_eq!(Command::parse("/dir extra").unwrap_err().tag(), CommandTag::Dir);
        assert_eq!(Command::parse("/get a b").unwrap_err().tag(), CommandTag::Get);
        // double space yields an empty field
        assert!(Command::parse("/register  bob").is_err());
    }

    #[test]
    fn test_invalid_arguments() {
        let err = Command::parse("/store report.txt -1").unwrap_err();
        assert!(matches!(
            err,
            CommandError::InvalidArgument {
                tag: CommandTag::Store,
                ..
            }
        ));
        assert!(Command::parse("/store report.txt ten").is_err());
        assert!(Command::parse("/get ..").is_err());
        assert!(Command::parse(&format!("/register {}", "x".repeat(40))).is_err());
    }

    #[test]
    fn test_chat_fallthrough() {
        assert_eq!(
            Command::parse("hello everyone").unwrap(),
            Command::Chat("hello everyone".to_string())
        );
        // unknown tags are relayed, not rejected
        assert_eq!(
            Command::parse("/shrug ok").unwrap(),
            Command::Chat("/shrug ok".to_string())
        );
        assert_eq!(Command::parse("").unwrap(), Command::Chat(String::new()));
        assert_eq!(Command::parse("hi").unwrap().tag(), None);
    }

    #[test]
    fn test_tag_table() {
        for tag in CommandTag::ALL {
            assert_eq!(CommandTag::from_tag(tag.as_str()), Some(tag));
            assert!(tag.usage().starts_with(tag.as_str()));
        }
        assert_eq!(CommandTag::from_tag("/join"), None);
    }
}
