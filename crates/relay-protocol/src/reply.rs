//! Server → client replies.
//!
//! Every reply is a single control line. Relayed chat lines are sent
//! verbatim, so a client classifies an incoming line with [`Reply::parse`]
//! and treats anything without a recognized shape as chat.

use std::fmt;

use relay_core::{FileName, Handle, TransferDescriptor};

use crate::command::CommandTag;

const REGISTRATION_FAILED: &str = "Error: Registration failed. Handle or alias already exists.";
const ALREADY_REGISTERED_PREFIX: &str = "Error: You are already registered with handle '";
const FORMAT_ERROR_PREFIX: &str = "Error: Incorrect command format for ";
const LISTING_HEADER: &str = "Directory Listing:";
const EMPTY_LISTING: &str = "Directory Listing: (empty)";
const SERVER_FULL: &str = "Error: Server is full.";
const LISTING_UNAVAILABLE: &str = "Error: Directory listing unavailable.";

/// A decoded server reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// `/register` succeeded
    Welcome { handle: Handle },

    /// Another live session holds the handle
    RegistrationFailed,

    /// This session already bound a handle
    AlreadyRegistered { handle: Handle },

    /// Wrong argument count or unparsable field
    FormatError { tag: CommandTag },

    /// Non-empty directory listing, sorted
    Listing(Vec<String>),

    /// Explicit marker for an empty directory
    EmptyDirectory,

    /// The server directory could not be read
    ListingUnavailable,

    /// Fetch header; exactly `size` raw bytes follow
    Sending(TransferDescriptor),

    /// Fetch target missing
    NotFound { name: FileName },

    /// Store completed
    Stored { name: FileName },

    /// Store payload was consumed but could not be saved
    StoreFailed { name: FileName },

    /// Fetch completed; trails the raw bytes
    Sent { name: FileName },

    /// Connection refused at capacity
    ServerFull,

    /// Relayed chat line
    Chat(String),
}

impl Reply {
    /// Builds a listing reply, substituting the empty marker when needed.
    pub fn listing(mut names: Vec<String>) -> Self {
        if names.is_empty() {
            return Self::EmptyDirectory;
        }
        names.sort();
        Self::Listing(names)
    }

    /// Classifies an incoming line. Unrecognized lines are chat.
    pub fn parse(line: &str) -> Self {
        Self::parse_known(line).unwrap_or_else(|| Self::Chat(line.to_string()))
    }

    fn parse_known(line: &str) -> Option<Self> {
        match line {
            REGISTRATION_FAILED => return Some(Self::RegistrationFailed),
            EMPTY_LISTING => return Some(Self::EmptyDirectory),
            SERVER_FULL => return Some(Self::ServerFull),
            LISTING_UNAVAILABLE => return Some(Self::ListingUnavailable),
            _ => {}
        }

        if let Some(rest) = line.strip_prefix(ALREADY_REGISTERED_PREFIX) {
            let handle = rest.strip_suffix("'.")?;
            return Handle::new(handle)
                .ok()
                .map(|handle| Self::AlreadyRegistered { handle });
        }

        if let Some(rest) = line.strip_prefix(FORMAT_ERROR_PREFIX) {
            let (tag, _usage) = rest.split_once(". Usage: ")?;
            return CommandTag::from_tag(tag).map(|tag| Self::FormatError { tag });
        }

        if let Some(rest) = line.strip_prefix("Error: File ") {
            let name = rest.strip_suffix(" does not exist.")?;
            return file_name(name).map(|name| Self::NotFound { name });
        }

        if let Some(rest) = line.strip_prefix("Error: Failed to store ") {
            let name = rest.strip_suffix('.')?;
            return file_name(name).map(|name| Self::StoreFailed { name });
        }

        if let Some(rest) = line.strip_prefix(LISTING_HEADER) {
            let body = rest.strip_prefix('\n')?;
            let names: Vec<String> = body.split('\n').map(str::to_string).collect();
            return Some(Self::Listing(names));
        }

        if let Some(rest) = line.strip_prefix("Welcome ") {
            let handle = rest.strip_suffix('!')?;
            return Handle::new(handle)
                .ok()
                .map(|handle| Self::Welcome { handle });
        }

        if let Some(rest) = line.strip_prefix("Sending ") {
            let (name, size) = rest.split_once(' ')?;
            let name = file_name(name)?;
            let size = TransferDescriptor::parse_size(size).ok()?;
            return Some(Self::Sending(TransferDescriptor::new(name, size)));
        }

        if let Some(rest) = line.strip_prefix("File ") {
            if let Some(name) = rest.strip_suffix(" received successfully") {
                return file_name(name).map(|name| Self::Stored { name });
            }
            if let Some(name) = rest.strip_suffix(" sent successfully") {
                return file_name(name).map(|name| Self::Sent { name });
            }
        }

        None
    }
}

fn file_name(name: &str) -> Option<FileName> {
    FileName::new(name).ok()
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Welcome { handle } => write!(f, "Welcome {handle}!"),
            Self::RegistrationFailed => f.write_str(REGISTRATION_FAILED),
            Self::AlreadyRegistered { handle } => {
                write!(f, "{ALREADY_REGISTERED_PREFIX}{handle}'.")
            }
            Self::FormatError { tag } => {
                write!(f, "{FORMAT_ERROR_PREFIX}{tag}. Usage: {}", tag.usage())
            }
            Self::Listing(names) => {
                f.write_str(LISTING_HEADER)?;
                for name in names {
                    write!(f, "\n{name}")?;
                }
                Ok(())
            }
            Self::EmptyDirectory => f.write_str(EMPTY_LISTING),
            Self::ListingUnavailable => f.write_str(LISTING_UNAVAILABLE),
            Self::Sending(desc) => write!(f, "Sending {} {}", desc.name, desc.size),
            Self::NotFound { name } => write!(f, "Error: File {name} does not exist."),
            Self::Stored { name } => write!(f, "File {name} received successfully"),
            Self::StoreFailed { name } => write!(f, "Error: Failed to store {name}."),
            Self::Sent { name } => write!(f, "File {name} sent successfully"),
            Self::ServerFull => f.write_str(SERVER_FULL),
            Self::Chat(text) => f.write_str(text),
        }
    }
}
