//! Typed values for the subset of IMAP4rev1 this server speaks.

pub mod command;
pub mod fetch;
pub mod flag;
pub mod search;
pub mod sequence;

pub use command::{Command, CommandBody, MailboxName, StoreResponse, StoreType};
pub use fetch::{FetchAttribute, Macro, Part, Section, StatusAttribute};
pub use flag::{Flag, MailboxAttribute, PERMANENT_FLAGS, SYSTEM_FLAGS};
pub use search::SearchKey;
pub use sequence::{SeqNo, Sequence, SequenceSet};
