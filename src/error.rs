use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Crate-wide error. Layer-specific errors convert into this at module
/// boundaries; the session dispatcher decides what reaches the wire.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Mailbox(#[from] MailboxError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("client closed the connection")]
    ConnectionClosed,
}

/// Failures while turning client bytes into a [`Command`](crate::types::Command).
///
/// All of these end up as a tagged `BAD`; the session keeps running.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("bad syntax: {0}")]
    BadSyntax(String),

    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("unknown search key: {0}")]
    UnknownSearchKey(String),

    #[error("bad literal: {0}")]
    BadLiteral(String),
}

/// Failures while operating on a mailbox or the MH store underneath it.
#[derive(Debug, Error)]
pub enum MailboxError {
    #[error("no such mailbox: {0}")]
    NoSuchMailbox(String),

    #[error("mailbox already exists: {0}")]
    MailboxExists(String),

    #[error("invalid mailbox name: {0}")]
    InvalidMailboxName(String),

    #[error("no message with key {key} in mailbox {mailbox}")]
    NoSuchMessage { mailbox: String, key: u32 },

    /// The advisory dot-lock could not be taken within the configured
    /// timeout. The dispatcher re-queues the command rather than failing it.
    #[error("unable to lock mailbox {0}")]
    Lock(String),

    /// On-disk state disagrees with itself (malformed `.mh_sequences`,
    /// missing message file, mangled UID header). Policy: clear the cache,
    /// force a resync, retry once.
    #[error("mailbox {mailbox} is inconsistent: {reason}")]
    Inconsistency { mailbox: String, reason: String },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// The outcome a command handler reports to the dispatcher when it cannot
/// complete. `No`/`Bad` render directly as tagged responses; the other two
/// carry dispatcher policy: a lock timeout re-queues the command, an
/// inconsistency earns one cache-clearing retry before the client is cut
/// loose with `* BYE`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("{0}")]
    No(String),

    #[error("{0}")]
    Bad(String),

    #[error("unable to lock mailbox {0}, try again")]
    Lock(String),

    #[error("{0}")]
    Inconsistent(String),
}

impl CommandError {
    pub fn no(text: impl Into<String>) -> Self {
        CommandError::No(text.into())
    }

    pub fn bad(text: impl Into<String>) -> Self {
        CommandError::Bad(text.into())
    }
}

impl From<ParseError> for CommandError {
    fn from(error: ParseError) -> Self {
        CommandError::Bad(error.to_string())
    }
}

impl From<MailboxError> for CommandError {
    fn from(error: MailboxError) -> Self {
        match error {
            MailboxError::Lock(name) => CommandError::Lock(name),
            // A message key we believed in but whose file is gone is the
            // same transient on-disk disagreement as a mangled header.
            inconsistency @ (MailboxError::Inconsistency { .. }
            | MailboxError::NoSuchMessage { .. }) => {
                CommandError::Inconsistent(inconsistency.to_string())
            }
            other => CommandError::No(other.to_string()),
        }
    }
}

impl From<Error> for CommandError {
    fn from(error: Error) -> Self {
        match error {
            Error::Parse(e) => e.into(),
            Error::Mailbox(e) => e.into(),
            other => CommandError::No(other.to_string()),
        }
    }
}
