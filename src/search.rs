//! Evaluation of a parsed search expression against one message.

use chrono::{DateTime, Local, NaiveDate, TimeZone, Utc};

use crate::{
    message::Message,
    types::{Flag, SearchKey},
};

/// The per-message context a search expression is evaluated in.
///
/// The caller (the mailbox) supplies flag membership and identity; the
/// message itself is loaded through the cache before evaluation.
pub struct SearchContext<'a> {
    pub message: &'a Message,
    pub msn: u32,
    pub uid: u32,
    pub msn_max: u32,
    pub uid_max: u32,
    pub flags: Vec<Flag>,
    pub internal_date: DateTime<Local>,
}

impl SearchContext<'_> {
    fn has_flag(&self, flag: &Flag) -> bool {
        self.flags.contains(flag)
    }

    fn sent_date(&self) -> Option<NaiveDate> {
        let header = self.message.header("date")?;
        let seconds = mailparse::dateparse(header).ok()?;
        Some(Utc.timestamp_opt(seconds, 0).single()?.date_naive())
    }
}

/// Does the message match the expression?
pub fn matches(ctx: &SearchContext, key: &SearchKey) -> bool {
    match key {
        SearchKey::All => true,
        SearchKey::And(keys) => keys.iter().all(|key| matches(ctx, key)),
        SearchKey::Or(left, right) => matches(ctx, left) || matches(ctx, right),
        SearchKey::Not(inner) => !matches(ctx, inner),

        SearchKey::Answered => ctx.has_flag(&Flag::Answered),
        SearchKey::Deleted => ctx.has_flag(&Flag::Deleted),
        SearchKey::Draft => ctx.has_flag(&Flag::Draft),
        SearchKey::Flagged => ctx.has_flag(&Flag::Flagged),
        SearchKey::Recent => ctx.has_flag(&Flag::Recent),
        SearchKey::Seen => ctx.has_flag(&Flag::Seen),
        SearchKey::Unanswered => !ctx.has_flag(&Flag::Answered),
        SearchKey::Undeleted => !ctx.has_flag(&Flag::Deleted),
        SearchKey::Undraft => !ctx.has_flag(&Flag::Draft),
        SearchKey::Unflagged => !ctx.has_flag(&Flag::Flagged),
        SearchKey::Unseen => !ctx.has_flag(&Flag::Seen),
        SearchKey::New => ctx.has_flag(&Flag::Recent) && !ctx.has_flag(&Flag::Seen),
        SearchKey::Old => !ctx.has_flag(&Flag::Recent),
        SearchKey::Keyword(name) => ctx.has_flag(&Flag::from_wire(name)),
        SearchKey::Unkeyword(name) => !ctx.has_flag(&Flag::from_wire(name)),

        SearchKey::Header(name, needle) => header_contains(ctx.message, name, needle),
        SearchKey::Bcc(needle) => header_contains(ctx.message, "bcc", needle),
        SearchKey::Cc(needle) => header_contains(ctx.message, "cc", needle),
        SearchKey::From(needle) => header_contains(ctx.message, "from", needle),
        SearchKey::To(needle) => header_contains(ctx.message, "to", needle),
        SearchKey::Subject(needle) => header_contains(ctx.message, "subject", needle),
        SearchKey::Body(needle) => body_contains(ctx.message, needle),
        SearchKey::Text(needle) => {
            ctx.message
                .headers()
                .iter()
                .any(|(_, value)| value.to_lowercase().contains(needle))
                || body_contains(ctx.message, needle)
        }

        SearchKey::Before(date) => ctx.internal_date.date_naive() < *date,
        SearchKey::On(date) => ctx.internal_date.date_naive() == *date,
        SearchKey::Since(date) => ctx.internal_date.date_naive() >= *date,
        SearchKey::SentBefore(date) => {
            matches!(ctx.sent_date(), Some(sent) if sent < *date)
        }
        SearchKey::SentOn(date) => {
            matches!(ctx.sent_date(), Some(sent) if sent == *date)
        }
        SearchKey::SentSince(date) => {
            matches!(ctx.sent_date(), Some(sent) if sent >= *date)
        }

        SearchKey::Larger(size) => ctx.message.size() > *size as usize,
        SearchKey::Smaller(size) => ctx.message.size() < *size as usize,

        SearchKey::SequenceSet(set) => set.contains(ctx.msn, ctx.msn_max),
        SearchKey::Uid(set) => set.contains(ctx.uid, ctx.uid_max),
    }
}

fn header_contains(message: &Message, name: &str, needle: &str) -> bool {
    message
        .headers()
        .iter()
        .any(|(header, value)| {
            header.eq_ignore_ascii_case(name) && value.to_lowercase().contains(needle)
        })
}

/// Case-insensitive substring over every leaf part's transfer-decoded
/// payload.
fn body_contains(message: &Message, needle: &str) -> bool {
    fn walk(node: &crate::message::PartNode, needle: &str) -> bool {
        if let Some(decoded) = node.decoded() {
            if String::from_utf8_lossy(decoded).to_lowercase().contains(needle) {
                return true;
            }
        }
        if let Some(embedded) = &node.embedded {
            if walk(embedded, needle) {
                return true;
            }
        }
        node.children.iter().any(|child| walk(child, needle))
    }

    walk(message.root(), needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SequenceSet;

    const MESSAGE: &[u8] = b"Date: Mon, 7 Feb 1994 21:52:25 -0800\r\n\
From: Fred Foobar <foobar@example.com>\r\n\
Subject: Afternoon Meeting\r\n\
To: mooch@example.com\r\n\
\r\n\
Hello Joe, do you think we can meet at 3:30 tomorrow?\r\n";

    fn context(message: &Message, flags: Vec<Flag>) -> SearchContext {
        SearchContext {
            message,
            msn: 2,
            uid: 20,
            msn_max: 5,
            uid_max: 50,
            flags,
            internal_date: Local.timestamp_opt(760_000_000, 0).unwrap(), // 1994-01-31
        }
    }

    #[test]
    fn flag_keys() {
        let message = Message::parse(MESSAGE).unwrap();
        let ctx = context(&message, vec![Flag::Recent, Flag::Flagged]);

        assert!(matches(&ctx, &SearchKey::All));
        assert!(matches(&ctx, &SearchKey::Recent));
        assert!(matches(&ctx, &SearchKey::Flagged));
        assert!(matches(&ctx, &SearchKey::Unseen));
        assert!(matches(&ctx, &SearchKey::New));
        assert!(!matches(&ctx, &SearchKey::Old));
        assert!(!matches(&ctx, &SearchKey::Seen));
        assert!(matches(&ctx, &SearchKey::Unkeyword("todo".to_string())));

        let ctx = context(&message, vec![Flag::Seen, Flag::Keyword("todo".to_string())]);
        assert!(matches(&ctx, &SearchKey::Old));
        assert!(!matches(&ctx, &SearchKey::New));
        assert!(matches(&ctx, &SearchKey::Keyword("todo".to_string())));
    }

    #[test]
    fn boolean_combinators() {
        let message = Message::parse(MESSAGE).unwrap();
        let ctx = context(&message, vec![Flag::Seen]);

        assert!(matches(
            &ctx,
            &SearchKey::And(vec![SearchKey::Seen, SearchKey::Unanswered])
        ));
        assert!(!matches(
            &ctx,
            &SearchKey::And(vec![SearchKey::Seen, SearchKey::Answered])
        ));
        assert!(matches(
            &ctx,
            &SearchKey::Or(
                Box::new(SearchKey::Answered),
                Box::new(SearchKey::Seen)
            )
        ));
        assert!(matches(&ctx, &SearchKey::Not(Box::new(SearchKey::Answered))));
    }

    #[test]
    fn header_body_text() {
        let message = Message::parse(MESSAGE).unwrap();
        let ctx = context(&message, vec![]);

        // Search strings arrive lower-cased from the parser.
        assert!(matches(&ctx, &SearchKey::Subject("afternoon".to_string())));
        assert!(matches(&ctx, &SearchKey::From("fred".to_string())));
        assert!(!matches(&ctx, &SearchKey::From("barney".to_string())));
        assert!(matches(
            &ctx,
            &SearchKey::Header("to".to_string(), "mooch".to_string())
        ));
        assert!(matches(&ctx, &SearchKey::Body("3:30 tomorrow".to_string())));
        assert!(!matches(&ctx, &SearchKey::Body("afternoon".to_string())));
        assert!(matches(&ctx, &SearchKey::Text("afternoon".to_string())));
        assert!(matches(&ctx, &SearchKey::Text("hello joe".to_string())));
    }

    #[test]
    fn date_keys() {
        let message = Message::parse(MESSAGE).unwrap();
        let ctx = context(&message, vec![]);
        let internal = ctx.internal_date.date_naive();

        assert!(matches(&ctx, &SearchKey::On(internal)));
        assert!(matches(
            &ctx,
            &SearchKey::Before(internal.succ_opt().unwrap())
        ));
        assert!(matches(&ctx, &SearchKey::Since(internal)));
        assert!(!matches(&ctx, &SearchKey::Before(internal)));

        // Sent* keys run on the Date: header (1994-02-08 UTC).
        let sent = NaiveDate::from_ymd_opt(1994, 2, 8).unwrap();
        assert!(matches(&ctx, &SearchKey::SentOn(sent)));
        assert!(matches(&ctx, &SearchKey::SentSince(sent)));
        assert!(!matches(&ctx, &SearchKey::SentBefore(sent)));
        assert!(matches(
            &ctx,
            &SearchKey::SentBefore(sent.succ_opt().unwrap())
        ));
    }

    #[test]
    fn size_and_set_keys() {
        let message = Message::parse(MESSAGE).unwrap();
        let ctx = context(&message, vec![]);
        let size = message.size() as u32;

        assert!(matches(&ctx, &SearchKey::Larger(size - 1)));
        assert!(!matches(&ctx, &SearchKey::Larger(size)));
        assert!(matches(&ctx, &SearchKey::Smaller(size + 1)));

        let set = SequenceSet::try_from("1:3").unwrap();
        assert!(matches(&ctx, &SearchKey::SequenceSet(set)));
        let set = SequenceSet::try_from("4:*").unwrap();
        assert!(!matches(&ctx, &SearchKey::SequenceSet(set)));

        let set = SequenceSet::try_from("20").unwrap();
        assert!(matches(&ctx, &SearchKey::Uid(set)));
        let set = SequenceSet::try_from("*").unwrap();
        assert!(!matches(&ctx, &SearchKey::Uid(set)));
    }
}
