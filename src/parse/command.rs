use abnf_core::streaming::{crlf as CRLF, sp as SP};
use nom::{
    branch::alt,
    bytes::complete::{tag, tag_no_case},
    combinator::{map, opt, value},
    multi::{separated_list0, separated_list1},
    sequence::{delimited, preceded, tuple},
    IResult,
};

use crate::{
    error::ParseError,
    parse::{
        core::{astring, astring_utf8, atom, imap_tag, list_mailbox, literal, nil, string},
        datetime::date_time,
        fetch_att::fetch_atts,
        search::search,
        sequence::sequence_set,
    },
    types::{
        Command, CommandBody, Flag, MailboxName, StatusAttribute, StoreResponse, StoreType,
    },
};

/// Parse one complete command line (literals already resolved by the
/// session layer).
///
/// `command = tag SP (command-any / command-auth / command-nonauth /
///            command-select) CRLF`, plus the bare `DONE` line that
/// terminates IDLE.
pub fn parse_command(input: &[u8]) -> Result<Command, ParseError> {
    if let Ok((rest, ())) = done(input) {
        if rest.is_empty() {
            return Ok(Command::new("", CommandBody::Done));
        }
    }

    let parsed = tuple((imap_tag, SP, command_body, CRLF))(input);

    match parsed {
        Ok((rest, (tag, _, body, _))) if rest.is_empty() => Ok(Command::new(tag, body)),
        Ok((rest, _)) => Err(ParseError::BadSyntax(format!(
            "trailing garbage after command: {:?}",
            String::from_utf8_lossy(rest)
        ))),
        Err(_) => Err(classify_failure(input)),
    }
}

/// Produce the most useful error we can for a line the grammar rejected.
fn classify_failure(input: &[u8]) -> ParseError {
    let Ok((rest, (_, _, verb))) = tuple((imap_tag, SP, atom))(input) else {
        return ParseError::BadSyntax(format!(
            "{:?}",
            String::from_utf8_lossy(&input[..input.len().min(64)])
        ));
    };

    let known = [
        "CAPABILITY",
        "NOOP",
        "ID",
        "NAMESPACE",
        "LOGOUT",
        "AUTHENTICATE",
        "LOGIN",
        "SELECT",
        "EXAMINE",
        "CREATE",
        "DELETE",
        "RENAME",
        "SUBSCRIBE",
        "UNSUBSCRIBE",
        "LIST",
        "LSUB",
        "STATUS",
        "APPEND",
        "CHECK",
        "CLOSE",
        "UNSELECT",
        "EXPUNGE",
        "SEARCH",
        "FETCH",
        "STORE",
        "COPY",
        "UID",
        "IDLE",
        "DONE",
    ];

    let verb_upper = verb.to_ascii_uppercase();
    if !known.contains(&verb_upper.as_str()) {
        return ParseError::UnknownCommand(verb.to_string());
    }

    if verb_upper == "SEARCH" || (verb_upper == "UID" && is_uid_search(rest)) {
        if let Some(key) = first_bad_search_key(input) {
            return ParseError::UnknownSearchKey(key);
        }
    }

    ParseError::BadSyntax(format!("malformed {verb_upper} command"))
}

fn is_uid_search(after_uid: &[u8]) -> bool {
    after_uid
        .get(1..7)
        .map(|word| word.eq_ignore_ascii_case(b"SEARCH"))
        .unwrap_or(false)
}

/// Best-effort: find the first token the search grammar chokes on.
fn first_bad_search_key(input: &[u8]) -> Option<String> {
    let line = std::str::from_utf8(input).ok()?;
    let known_keys = [
        "ALL",
        "ANSWERED",
        "BCC",
        "BEFORE",
        "BODY",
        "CC",
        "CHARSET",
        "DELETED",
        "DRAFT",
        "FLAGGED",
        "FROM",
        "HEADER",
        "KEYWORD",
        "LARGER",
        "NEW",
        "NOT",
        "OLD",
        "ON",
        "OR",
        "RECENT",
        "SEEN",
        "SENTBEFORE",
        "SENTON",
        "SENTSINCE",
        "SINCE",
        "SMALLER",
        "SUBJECT",
        "TEXT",
        "TO",
        "UID",
        "UNANSWERED",
        "UNDELETED",
        "UNDRAFT",
        "UNFLAGGED",
        "UNKEYWORD",
        "UNSEEN",
    ];

    let mut words = line.split_whitespace().skip(1); // tag
    let verb = words.next()?;
    if verb.eq_ignore_ascii_case("UID") {
        words.next(); // SEARCH
    }

    words
        .find(|word| {
            let upper = word.to_ascii_uppercase();
            let bare = upper.trim_matches(|c| c == '(' || c == ')');
            !bare.is_empty()
                && bare.chars().all(|c| c.is_ascii_alphabetic())
                && !known_keys.contains(&bare)
        })
        .map(str::to_string)
}

/// `DONE CRLF`, with no tag; only meaningful while IDLE is in progress.
fn done(input: &[u8]) -> IResult<&[u8], ()> {
    value((), tuple((tag_no_case(b"DONE"), CRLF)))(input)
}

fn command_body(input: &[u8]) -> IResult<&[u8], CommandBody> {
    alt((command_any, command_nonauth, command_auth, command_select))(input)
}

/// `command-any = "CAPABILITY" / "LOGOUT" / "NOOP" / id / "NAMESPACE"`
fn command_any(input: &[u8]) -> IResult<&[u8], CommandBody> {
    alt((
        value(CommandBody::Capability, tag_no_case(b"CAPABILITY")),
        value(CommandBody::Logout, tag_no_case(b"LOGOUT")),
        value(CommandBody::Noop, tag_no_case(b"NOOP")),
        value(CommandBody::Namespace, tag_no_case(b"NAMESPACE")),
        id,
    ))(input)
}

/// `id = "ID" SP id-params-list` (RFC 2971);
/// `id-params-list = "(" [string SP nstring *(SP string SP nstring)] ")" / nil`
fn id(input: &[u8]) -> IResult<&[u8], CommandBody> {
    let field_pair = map(
        tuple((string, SP, alt((map(string, Some), map(nil, |_| None))))),
        |(key, _, value)| {
            (
                String::from_utf8_lossy(&key).into_owned(),
                value
                    .map(|v| String::from_utf8_lossy(&v).into_owned())
                    .unwrap_or_default(),
            )
        },
    );

    map(
        preceded(
            tuple((tag_no_case(b"ID"), SP)),
            alt((
                map(nil, |_| None),
                map(
                    delimited(tag(b"("), separated_list0(SP, field_pair), tag(b")")),
                    Some,
                ),
            )),
        ),
        CommandBody::Id,
    )(input)
}

/// `command-nonauth = login / authenticate`
///
/// STARTTLS is terminated ahead of us; it is not in our capability set.
fn command_nonauth(input: &[u8]) -> IResult<&[u8], CommandBody> {
    alt((login, authenticate))(input)
}

/// `login = "LOGIN" SP userid SP password`
fn login(input: &[u8]) -> IResult<&[u8], CommandBody> {
    map(
        tuple((tag_no_case(b"LOGIN"), SP, astring, SP, astring)),
        |(_, _, username, _, password)| CommandBody::Login {
            username: String::from_utf8_lossy(&username).into_owned(),
            password: String::from_utf8_lossy(&password).into_owned(),
        },
    )(input)
}

/// `authenticate = "AUTHENTICATE" SP auth-type`
fn authenticate(input: &[u8]) -> IResult<&[u8], CommandBody> {
    map(
        tuple((tag_no_case(b"AUTHENTICATE"), SP, atom)),
        |(_, _, mechanism)| CommandBody::Authenticate {
            mechanism: mechanism.to_string(),
        },
    )(input)
}

/// `mailbox = "INBOX" / astring`
fn mailbox(input: &[u8]) -> IResult<&[u8], MailboxName> {
    map(astring_utf8, |name| MailboxName::new(&name))(input)
}

/// `flag = "\Answered" / "\Flagged" / "\Deleted" / "\Seen" / "\Draft" /
///         flag-keyword / flag-extension`
fn flag(input: &[u8]) -> IResult<&[u8], Flag> {
    alt((
        map(preceded(tag(b"\\"), atom), |name| {
            Flag::from_wire(&format!("\\{name}"))
        }),
        map(atom, |name| Flag::from_wire(name)),
    ))(input)
}

/// `flag-list = "(" [flag *(SP flag)] ")"`
fn flag_list(input: &[u8]) -> IResult<&[u8], Vec<Flag>> {
    delimited(tag(b"("), separated_list0(SP, flag), tag(b")"))(input)
}

/// `command-auth = append / create / delete / examine / list / lsub /
///                 rename / select / status / subscribe / unsubscribe /
///                 idle`
fn command_auth(input: &[u8]) -> IResult<&[u8], CommandBody> {
    alt((
        append,
        create,
        delete,
        examine,
        list,
        lsub,
        rename,
        select,
        status,
        subscribe,
        unsubscribe,
        value(CommandBody::Idle, tag_no_case(b"IDLE")),
    ))(input)
}

/// `append = "APPEND" SP mailbox [SP flag-list] [SP date-time] SP literal`
fn append(input: &[u8]) -> IResult<&[u8], CommandBody> {
    map(
        tuple((
            tag_no_case(b"APPEND"),
            SP,
            mailbox,
            opt(preceded(SP, flag_list)),
            opt(preceded(SP, date_time)),
            SP,
            literal,
        )),
        |(_, _, mailbox, flags, date_time, _, message)| CommandBody::Append {
            mailbox,
            flags: flags.unwrap_or_default(),
            date_time,
            message,
        },
    )(input)
}

/// `create = "CREATE" SP mailbox`
fn create(input: &[u8]) -> IResult<&[u8], CommandBody> {
    map(
        preceded(tuple((tag_no_case(b"CREATE"), SP)), mailbox),
        |mailbox| CommandBody::Create { mailbox },
    )(input)
}

/// `delete = "DELETE" SP mailbox`
fn delete(input: &[u8]) -> IResult<&[u8], CommandBody> {
    map(
        preceded(tuple((tag_no_case(b"DELETE"), SP)), mailbox),
        |mailbox| CommandBody::Delete { mailbox },
    )(input)
}

/// `examine = "EXAMINE" SP mailbox`
fn examine(input: &[u8]) -> IResult<&[u8], CommandBody> {
    map(
        preceded(tuple((tag_no_case(b"EXAMINE"), SP)), mailbox),
        |mailbox| CommandBody::Examine { mailbox },
    )(input)
}

/// `list = "LIST" SP mailbox SP list-mailbox`
fn list(input: &[u8]) -> IResult<&[u8], CommandBody> {
    map(
        tuple((tag_no_case(b"LIST"), SP, astring_utf8, SP, list_mailbox)),
        |(_, _, reference, _, pattern)| CommandBody::List { reference, pattern },
    )(input)
}

/// `lsub = "LSUB" SP mailbox SP list-mailbox`
fn lsub(input: &[u8]) -> IResult<&[u8], CommandBody> {
    map(
        tuple((tag_no_case(b"LSUB"), SP, astring_utf8, SP, list_mailbox)),
        |(_, _, reference, _, pattern)| CommandBody::Lsub { reference, pattern },
    )(input)
}

/// `rename = "RENAME" SP mailbox SP mailbox`
fn rename(input: &[u8]) -> IResult<&[u8], CommandBody> {
    map(
        tuple((tag_no_case(b"RENAME"), SP, mailbox, SP, mailbox)),
        |(_, _, from, _, to)| CommandBody::Rename { from, to },
    )(input)
}

/// `select = "SELECT" SP mailbox`
fn select(input: &[u8]) -> IResult<&[u8], CommandBody> {
    map(
        preceded(tuple((tag_no_case(b"SELECT"), SP)), mailbox),
        |mailbox| CommandBody::Select { mailbox },
    )(input)
}

/// `status-att = "MESSAGES" / "RECENT" / "UIDNEXT" / "UIDVALIDITY" /
///               "UNSEEN"`
fn status_att(input: &[u8]) -> IResult<&[u8], StatusAttribute> {
    alt((
        value(StatusAttribute::Messages, tag_no_case(b"MESSAGES")),
        value(StatusAttribute::Recent, tag_no_case(b"RECENT")),
        value(StatusAttribute::UidNext, tag_no_case(b"UIDNEXT")),
        value(StatusAttribute::UidValidity, tag_no_case(b"UIDVALIDITY")),
        value(StatusAttribute::Unseen, tag_no_case(b"UNSEEN")),
    ))(input)
}

/// `status = "STATUS" SP mailbox SP "(" status-att *(SP status-att) ")"`
fn status(input: &[u8]) -> IResult<&[u8], CommandBody> {
    map(
        tuple((
            tag_no_case(b"STATUS"),
            SP,
            mailbox,
            SP,
            delimited(tag(b"("), separated_list1(SP, status_att), tag(b")")),
        )),
        |(_, _, mailbox, _, attributes)| CommandBody::Status {
            mailbox,
            attributes,
        },
    )(input)
}

/// `subscribe = "SUBSCRIBE" SP mailbox`
fn subscribe(input: &[u8]) -> IResult<&[u8], CommandBody> {
    map(
        preceded(tuple((tag_no_case(b"SUBSCRIBE"), SP)), mailbox),
        |mailbox| CommandBody::Subscribe { mailbox },
    )(input)
}

/// `unsubscribe = "UNSUBSCRIBE" SP mailbox`
fn unsubscribe(input: &[u8]) -> IResult<&[u8], CommandBody> {
    map(
        preceded(tuple((tag_no_case(b"UNSUBSCRIBE"), SP)), mailbox),
        |mailbox| CommandBody::Unsubscribe { mailbox },
    )(input)
}

/// `command-select = "CHECK" / "CLOSE" / "UNSELECT" / "EXPUNGE" / copy /
///                   fetch / store / uid / search`
fn command_select(input: &[u8]) -> IResult<&[u8], CommandBody> {
    alt((
        value(CommandBody::Check, tag_no_case(b"CHECK")),
        value(CommandBody::Close, tag_no_case(b"CLOSE")),
        value(CommandBody::Unselect, tag_no_case(b"UNSELECT")),
        value(CommandBody::Expunge, tag_no_case(b"EXPUNGE")),
        copy,
        fetch,
        store,
        uid,
        map(search, |(charset, criteria)| CommandBody::Search {
            charset,
            criteria,
            uid: false,
        }),
    ))(input)
}

/// `copy = "COPY" SP sequence-set SP mailbox`
fn copy(input: &[u8]) -> IResult<&[u8], CommandBody> {
    map(
        tuple((tag_no_case(b"COPY"), SP, sequence_set, SP, mailbox)),
        |(_, _, set, _, mailbox)| CommandBody::Copy {
            set,
            mailbox,
            uid: false,
        },
    )(input)
}

/// `fetch = "FETCH" SP sequence-set SP ("ALL" / "FULL" / "FAST" /
///          fetch-att / "(" fetch-att *(SP fetch-att) ")")`
fn fetch(input: &[u8]) -> IResult<&[u8], CommandBody> {
    map(
        tuple((tag_no_case(b"FETCH"), SP, sequence_set, SP, fetch_atts)),
        |(_, _, set, _, attributes)| CommandBody::Fetch {
            set,
            attributes,
            uid: false,
        },
    )(input)
}

/// `store = "STORE" SP sequence-set SP store-att-flags` with
/// `store-att-flags = (["+" / "-"] "FLAGS" [".SILENT"]) SP
///                    (flag-list / (flag *(SP flag)))`
fn store(input: &[u8]) -> IResult<&[u8], CommandBody> {
    let store_att_flags = tuple((
        map(
            opt(alt((
                value(StoreType::Add, tag(b"+")),
                value(StoreType::Remove, tag(b"-")),
            ))),
            |kind| kind.unwrap_or(StoreType::Replace),
        ),
        tag_no_case(b"FLAGS"),
        map(opt(tag_no_case(b".SILENT")), |silent| match silent {
            Some(_) => StoreResponse::Silent,
            None => StoreResponse::Answer,
        }),
        SP,
        alt((flag_list, separated_list1(SP, flag))),
    ));

    map(
        tuple((tag_no_case(b"STORE"), SP, sequence_set, SP, store_att_flags)),
        |(_, _, set, _, (kind, _, response, _, flags))| CommandBody::Store {
            set,
            kind,
            response,
            flags,
            uid: false,
        },
    )(input)
}

/// `uid = "UID" SP (copy / fetch / search / store)`
///
/// The sub-command is parsed by the same parsers; only the `uid` marker
/// differs, and the engine interprets the sequence set against UIDs.
fn uid(input: &[u8]) -> IResult<&[u8], CommandBody> {
    let (remaining, (_, _, mut body)) = tuple((
        tag_no_case(b"UID"),
        SP,
        alt((
            copy,
            fetch,
            store,
            map(search, |(charset, criteria)| CommandBody::Search {
                charset,
                criteria,
                uid: false,
            }),
        )),
    ))(input)?;

    match &mut body {
        CommandBody::Copy { uid, .. }
        | CommandBody::Fetch { uid, .. }
        | CommandBody::Store { uid, .. }
        | CommandBody::Search { uid, .. } => *uid = true,
        _ => unreachable!(),
    }

    Ok((remaining, body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FetchAttribute, SearchKey, SeqNo, Sequence, SequenceSet};
    use pretty_assertions::assert_eq;

    fn parse(line: &[u8]) -> Command {
        parse_command(line).unwrap()
    }

    #[test]
    fn any_state_commands() {
        assert_eq!(
            parse(b"a001 CAPABILITY\r\n"),
            Command::new("a001", CommandBody::Capability)
        );
        assert_eq!(
            parse(b"a002 noop\r\n"),
            Command::new("a002", CommandBody::Noop)
        );
        assert_eq!(
            parse(b"a003 LOGOUT\r\n"),
            Command::new("a003", CommandBody::Logout)
        );
        assert_eq!(
            parse(b"a004 ID NIL\r\n"),
            Command::new("a004", CommandBody::Id(None))
        );
        assert_eq!(
            parse(b"a005 ID (\"name\" \"sodr\" \"version\" \"19.34\")\r\n"),
            Command::new(
                "a005",
                CommandBody::Id(Some(vec![
                    ("name".to_string(), "sodr".to_string()),
                    ("version".to_string(), "19.34".to_string()),
                ]))
            )
        );
    }

    #[test]
    fn mailbox_commands() {
        assert_eq!(
            parse(b"a SELECT INBOX\r\n"),
            Command::new(
                "a",
                CommandBody::Select {
                    mailbox: MailboxName::new("inbox")
                }
            )
        );
        assert_eq!(
            parse(b"a EXAMINE Archive/2023\r\n"),
            Command::new(
                "a",
                CommandBody::Examine {
                    mailbox: MailboxName::new("Archive/2023")
                }
            )
        );
        assert_eq!(
            parse(b"a CREATE \"quoted box\"\r\n"),
            Command::new(
                "a",
                CommandBody::Create {
                    mailbox: MailboxName::new("quoted box")
                }
            )
        );
        assert_eq!(
            parse(b"a RENAME foo bar\r\n"),
            Command::new(
                "a",
                CommandBody::Rename {
                    from: MailboxName::new("foo"),
                    to: MailboxName::new("bar"),
                }
            )
        );
        assert_eq!(
            parse(b"a LIST \"\" *\r\n"),
            Command::new(
                "a",
                CommandBody::List {
                    reference: String::new(),
                    pattern: "*".to_string(),
                }
            )
        );
        assert_eq!(
            parse(b"a STATUS inbox (MESSAGES UNSEEN)\r\n"),
            Command::new(
                "a",
                CommandBody::Status {
                    mailbox: MailboxName::new("inbox"),
                    attributes: vec![StatusAttribute::Messages, StatusAttribute::Unseen],
                }
            )
        );
    }

    #[test]
    fn append_with_literal() {
        let cmd = parse(
            b"a APPEND inbox (\\Seen) \"01-Jul-2003 10:52:37 +0200\" {11}\r\nFrom: x\r\n\r\n",
        );
        match cmd.body {
            CommandBody::Append {
                mailbox,
                flags,
                date_time,
                message,
            } => {
                assert_eq!(mailbox, MailboxName::new("inbox"));
                assert_eq!(flags, vec![Flag::Seen]);
                assert!(date_time.is_some());
                assert_eq!(message, b"From: x\r\n\r\n");
            }
            other => panic!("unexpected body: {other:?}"),
        }
    }

    #[test]
    fn selected_state_commands() {
        assert_eq!(
            parse(b"a FETCH 1:5 (FLAGS UID)\r\n"),
            Command::new(
                "a",
                CommandBody::Fetch {
                    set: SequenceSet(vec![Sequence::Range(
                        SeqNo::Value(1),
                        SeqNo::Value(5)
                    )]),
                    attributes: vec![FetchAttribute::Flags, FetchAttribute::Uid],
                    uid: false,
                }
            )
        );
        assert_eq!(
            parse(b"a STORE 1 +FLAGS.SILENT (\\Deleted)\r\n"),
            Command::new(
                "a",
                CommandBody::Store {
                    set: SequenceSet(vec![Sequence::Single(SeqNo::Value(1))]),
                    kind: StoreType::Add,
                    response: StoreResponse::Silent,
                    flags: vec![Flag::Deleted],
                    uid: false,
                }
            )
        );
        assert_eq!(
            parse(b"a COPY 2:4 Archive\r\n"),
            Command::new(
                "a",
                CommandBody::Copy {
                    set: SequenceSet(vec![Sequence::Range(
                        SeqNo::Value(2),
                        SeqNo::Value(4)
                    )]),
                    mailbox: MailboxName::new("Archive"),
                    uid: false,
                }
            )
        );
    }

    #[test]
    fn uid_commands() {
        let cmd = parse(b"a UID FETCH 1 (FLAGS)\r\n");
        assert!(cmd.uid_command());
        assert_eq!(cmd.name(), "UID FETCH");

        let cmd = parse(b"a UID SEARCH UNSEEN\r\n");
        match cmd.body {
            CommandBody::Search { criteria, uid, .. } => {
                assert!(uid);
                assert_eq!(criteria, SearchKey::Unseen);
            }
            other => panic!("unexpected body: {other:?}"),
        }
    }

    #[test]
    fn idle_and_done() {
        assert_eq!(
            parse(b"a IDLE\r\n"),
            Command::new("a", CommandBody::Idle)
        );
        assert_eq!(parse(b"DONE\r\n"), Command::new("", CommandBody::Done));
        assert_eq!(parse(b"done\r\n"), Command::new("", CommandBody::Done));
    }

    #[test]
    fn errors() {
        assert_eq!(
            parse_command(b"a FROBNICATE\r\n"),
            Err(ParseError::UnknownCommand("FROBNICATE".to_string()))
        );
        assert_eq!(
            parse_command(b"a SEARCH FNORD\r\n"),
            Err(ParseError::UnknownSearchKey("FNORD".to_string()))
        );
        assert!(matches!(
            parse_command(b"a FETCH\r\n"),
            Err(ParseError::BadSyntax(_))
        ));
        assert!(matches!(
            parse_command(b"\r\n"),
            Err(ParseError::BadSyntax(_))
        ));
    }
}
