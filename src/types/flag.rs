use std::fmt;

/// A message flag.
///
/// MH does not allow `\` in sequence names, so each system flag maps to a
/// conventional sequence name on disk (`\Seen` additionally being derived
/// from the *absence* of `unseen`). Keywords pass through verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Flag {
    Answered,
    Deleted,
    Draft,
    Flagged,
    /// Set on arrival, cleared once any client has seen the message's
    /// flags. Clients may never STORE it.
    Recent,
    Seen,
    Keyword(String),
}

impl Flag {
    /// Parse the wire form (`\Seen`, `\Answered`, or a keyword atom).
    pub fn from_wire(s: &str) -> Flag {
        match s.to_ascii_lowercase().as_str() {
            "\\answered" => Flag::Answered,
            "\\deleted" => Flag::Deleted,
            "\\draft" => Flag::Draft,
            "\\flagged" => Flag::Flagged,
            "\\recent" => Flag::Recent,
            "\\seen" => Flag::Seen,
            _ => Flag::Keyword(s.to_string()),
        }
    }

    /// The MH sequence name that stores this flag.
    pub fn seq_name(&self) -> &str {
        match self {
            Flag::Answered => "replied",
            Flag::Deleted => "Deleted",
            Flag::Draft => "Draft",
            Flag::Flagged => "flagged",
            Flag::Recent => "Recent",
            Flag::Seen => "Seen",
            Flag::Keyword(name) => name,
        }
    }

    /// The reverse of [`Flag::seq_name`].
    pub fn from_seq_name(name: &str) -> Flag {
        match name {
            "replied" => Flag::Answered,
            "Deleted" => Flag::Deleted,
            "Draft" => Flag::Draft,
            "flagged" => Flag::Flagged,
            "Recent" => Flag::Recent,
            "Seen" => Flag::Seen,
            _ => Flag::Keyword(name.to_string()),
        }
    }

    /// Keywords become MH sequence names verbatim, so they must be valid
    /// ones. Anything MH would choke on is rejected with `BAD` at STORE
    /// time.
    pub fn valid_keyword(name: &str) -> bool {
        !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    }
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Flag::Answered => write!(f, "\\Answered"),
            Flag::Deleted => write!(f, "\\Deleted"),
            Flag::Draft => write!(f, "\\Draft"),
            Flag::Flagged => write!(f, "\\Flagged"),
            Flag::Recent => write!(f, "\\Recent"),
            Flag::Seen => write!(f, "\\Seen"),
            Flag::Keyword(name) => write!(f, "{name}"),
        }
    }
}

/// The `FLAGS (...)` line sent on SELECT.
pub const SYSTEM_FLAGS: &str =
    "\\Answered \\Deleted \\Draft \\Flagged \\Recent \\Seen";

/// The `[PERMANENTFLAGS (...)]` response code sent on SELECT.
pub const PERMANENT_FLAGS: &str =
    "\\Answered \\Deleted \\Draft \\Flagged \\Seen \\*";

/// Mailbox name attributes as reported by LIST and persisted in the state
/// database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MailboxAttribute {
    Marked,
    Unmarked,
    Noselect,
    HasChildren,
    HasNoChildren,
}

impl MailboxAttribute {
    pub fn from_str(s: &str) -> Option<MailboxAttribute> {
        match s {
            "\\Marked" => Some(MailboxAttribute::Marked),
            "\\Unmarked" => Some(MailboxAttribute::Unmarked),
            "\\Noselect" => Some(MailboxAttribute::Noselect),
            "\\HasChildren" => Some(MailboxAttribute::HasChildren),
            "\\HasNoChildren" => Some(MailboxAttribute::HasNoChildren),
            _ => None,
        }
    }
}

impl fmt::Display for MailboxAttribute {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MailboxAttribute::Marked => write!(f, "\\Marked"),
            MailboxAttribute::Unmarked => write!(f, "\\Unmarked"),
            MailboxAttribute::Noselect => write!(f, "\\Noselect"),
            MailboxAttribute::HasChildren => write!(f, "\\HasChildren"),
            MailboxAttribute::HasNoChildren => write!(f, "\\HasNoChildren"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_round_trip() {
        for (wire, flag) in [
            ("\\Answered", Flag::Answered),
            ("\\Deleted", Flag::Deleted),
            ("\\Draft", Flag::Draft),
            ("\\Flagged", Flag::Flagged),
            ("\\Recent", Flag::Recent),
            ("\\Seen", Flag::Seen),
        ] {
            assert_eq!(Flag::from_wire(wire), flag);
            assert_eq!(flag.to_string(), wire);
        }
        assert_eq!(
            Flag::from_wire("todo"),
            Flag::Keyword("todo".to_string())
        );
    }

    #[test]
    fn sequence_names() {
        assert_eq!(Flag::Answered.seq_name(), "replied");
        assert_eq!(Flag::Flagged.seq_name(), "flagged");
        assert_eq!(Flag::from_seq_name("replied"), Flag::Answered);
        assert_eq!(
            Flag::from_seq_name("todo"),
            Flag::Keyword("todo".to_string())
        );
    }

    #[test]
    fn keyword_validity() {
        assert!(Flag::valid_keyword("todo"));
        assert!(Flag::valid_keyword("to-do_1.2"));
        assert!(!Flag::valid_keyword(""));
        assert!(!Flag::valid_keyword("has space"));
        assert!(!Flag::valid_keyword("colon:bad"));
    }
}
