use std::fmt;

use chrono::{DateTime, FixedOffset};

use crate::types::{
    fetch::{FetchAttribute, StatusAttribute},
    flag::Flag,
    search::SearchKey,
    sequence::SequenceSet,
};

/// A mailbox name as used internally: hierarchical with `/`, `INBOX`
/// case-folded to `inbox`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MailboxName(String);

impl MailboxName {
    pub fn new(raw: &str) -> MailboxName {
        // CREATE "mbox/" must behave like CREATE "mbox".
        let raw = raw.strip_suffix('/').unwrap_or(raw);
        if raw.eq_ignore_ascii_case("inbox") {
            MailboxName("inbox".to_string())
        } else {
            MailboxName(raw.to_string())
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_inbox(&self) -> bool {
        self.0 == "inbox"
    }

    /// The name as rendered on the wire (`INBOX` in its canonical spelling).
    pub fn wire_name(&self) -> String {
        if self.is_inbox() {
            "INBOX".to_string()
        } else {
            self.0.clone()
        }
    }
}

impl fmt::Display for MailboxName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.wire_name())
    }
}

/// `["+" / "-"] "FLAGS"`: what a STORE does with its flag list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreType {
    Replace,
    Add,
    Remove,
}

/// Whether a STORE wants the resulting flags echoed back (`.SILENT`
/// suppresses the untagged FETCH to the issuing client).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreResponse {
    Answer,
    Silent,
}

/// A full tagged client command.
///
/// Long-running commands carry their progress here so that a yielded
/// command can be pushed to the back of the folder's queue and resumed
/// where it left off.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub tag: String,
    pub body: CommandBody,
    /// Index into the expanded message set where processing resumes.
    pub cursor: usize,
    /// Accumulated SEARCH hits from previous partial runs.
    pub hits: Vec<u32>,
    /// Set when the command yielded and was queued for continuation.
    pub needs_continuation: bool,
}

impl Command {
    pub fn new(tag: impl Into<String>, body: CommandBody) -> Command {
        Command {
            tag: tag.into(),
            body,
            cursor: 0,
            hits: Vec::new(),
            needs_continuation: false,
        }
    }

    /// The command name used in `<tag> OK <name> completed`.
    pub fn name(&self) -> &'static str {
        self.body.name()
    }

    /// Whether this is the `UID` form of FETCH/STORE/COPY/SEARCH.
    pub fn uid_command(&self) -> bool {
        match &self.body {
            CommandBody::Fetch { uid, .. }
            | CommandBody::Store { uid, .. }
            | CommandBody::Copy { uid, .. }
            | CommandBody::Search { uid, .. } => *uid,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandBody {
    // Any state.
    Capability,
    Noop,
    Logout,
    Id(Option<Vec<(String, String)>>),
    Namespace,

    // Not-authenticated state only; the engine itself starts sessions
    // authenticated, so these merely produce sensible answers.
    Login {
        username: String,
        password: String,
    },
    Authenticate {
        mechanism: String,
    },

    // Authenticated state.
    Select {
        mailbox: MailboxName,
    },
    Examine {
        mailbox: MailboxName,
    },
    Create {
        mailbox: MailboxName,
    },
    Delete {
        mailbox: MailboxName,
    },
    Rename {
        from: MailboxName,
        to: MailboxName,
    },
    Subscribe {
        mailbox: MailboxName,
    },
    Unsubscribe {
        mailbox: MailboxName,
    },
    List {
        reference: String,
        pattern: String,
    },
    Lsub {
        reference: String,
        pattern: String,
    },
    Status {
        mailbox: MailboxName,
        attributes: Vec<StatusAttribute>,
    },
    Append {
        mailbox: MailboxName,
        flags: Vec<Flag>,
        date_time: Option<DateTime<FixedOffset>>,
        message: Vec<u8>,
    },
    Idle,
    /// The bare `DONE` line terminating IDLE; it has no tag of its own.
    Done,

    // Selected state.
    Check,
    Close,
    Unselect,
    Expunge,
    Search {
        charset: Option<String>,
        criteria: SearchKey,
        uid: bool,
    },
    Fetch {
        set: SequenceSet,
        attributes: Vec<FetchAttribute>,
        uid: bool,
    },
    Store {
        set: SequenceSet,
        kind: StoreType,
        response: StoreResponse,
        flags: Vec<Flag>,
        uid: bool,
    },
    Copy {
        set: SequenceSet,
        mailbox: MailboxName,
        uid: bool,
    },
}

impl CommandBody {
    pub fn name(&self) -> &'static str {
        match self {
            CommandBody::Capability => "CAPABILITY",
            CommandBody::Noop => "NOOP",
            CommandBody::Logout => "LOGOUT",
            CommandBody::Id(_) => "ID",
            CommandBody::Namespace => "NAMESPACE",
            CommandBody::Login { .. } => "LOGIN",
            CommandBody::Authenticate { .. } => "AUTHENTICATE",
            CommandBody::Select { .. } => "SELECT",
            CommandBody::Examine { .. } => "EXAMINE",
            CommandBody::Create { .. } => "CREATE",
            CommandBody::Delete { .. } => "DELETE",
            CommandBody::Rename { .. } => "RENAME",
            CommandBody::Subscribe { .. } => "SUBSCRIBE",
            CommandBody::Unsubscribe { .. } => "UNSUBSCRIBE",
            CommandBody::List { .. } => "LIST",
            CommandBody::Lsub { .. } => "LSUB",
            CommandBody::Status { .. } => "STATUS",
            CommandBody::Append { .. } => "APPEND",
            CommandBody::Idle => "IDLE",
            CommandBody::Done => "DONE",
            CommandBody::Check => "CHECK",
            CommandBody::Close => "CLOSE",
            CommandBody::Unselect => "UNSELECT",
            CommandBody::Expunge => "EXPUNGE",
            CommandBody::Search { uid, .. } => {
                if *uid {
                    "UID SEARCH"
                } else {
                    "SEARCH"
                }
            }
            CommandBody::Fetch { uid, .. } => {
                if *uid {
                    "UID FETCH"
                } else {
                    "FETCH"
                }
            }
            CommandBody::Store { uid, .. } => {
                if *uid {
                    "UID STORE"
                } else {
                    "STORE"
                }
            }
            CommandBody::Copy { uid, .. } => {
                if *uid {
                    "UID COPY"
                } else {
                    "COPY"
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inbox_case_folding() {
        for raw in ["INBOX", "inbox", "InBoX"] {
            let name = MailboxName::new(raw);
            assert!(name.is_inbox());
            assert_eq!(name.as_str(), "inbox");
            assert_eq!(name.wire_name(), "INBOX");
        }
        assert_eq!(MailboxName::new("Archive/2023").as_str(), "Archive/2023");
        assert_eq!(MailboxName::new("Archive/").as_str(), "Archive");
    }
}
