use chrono::NaiveDate;

use crate::types::sequence::SequenceSet;

/// `search-key`: one node of a parsed search expression.
///
/// A `SEARCH` command's keys are joined by an implicit top-level [`And`];
/// `OR` is binary, `NOT` unary, and a parenthesised list recurses.
///
/// [`And`]: SearchKey::And
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchKey {
    All,
    And(Vec<SearchKey>),
    Or(Box<SearchKey>, Box<SearchKey>),
    Not(Box<SearchKey>),

    Answered,
    Deleted,
    Draft,
    Flagged,
    Recent,
    Seen,
    Unanswered,
    Undeleted,
    Undraft,
    Unflagged,
    Unseen,
    /// `NEW` is `RECENT AND UNSEEN`; kept as its own node so the parser
    /// stays a transliteration of the grammar.
    New,
    /// `OLD` is `NOT RECENT`.
    Old,
    Keyword(String),
    Unkeyword(String),

    Bcc(String),
    Body(String),
    Cc(String),
    From(String),
    Header(String, String),
    Subject(String),
    Text(String),
    To(String),

    Before(NaiveDate),
    On(NaiveDate),
    Since(NaiveDate),
    SentBefore(NaiveDate),
    SentOn(NaiveDate),
    SentSince(NaiveDate),

    Larger(u32),
    Smaller(u32),

    SequenceSet(SequenceSet),
    Uid(SequenceSet),
}
