use abnf_core::streaming::sp as SP;
use nom::{
    branch::alt,
    bytes::complete::{tag, tag_no_case},
    combinator::{map, map_res, opt, value},
    multi::{many1, separated_list1},
    sequence::{delimited, preceded, tuple},
    IResult,
};

use crate::{
    parse::{
        core::{astring, atom, header_fld_name, number},
        datetime::date,
        sequence::sequence_set,
    },
    types::SearchKey,
};

fn search_string(input: &[u8]) -> IResult<&[u8], String> {
    // Search strings are matched case-insensitively; lower-case once here.
    map_res(astring, |bytes| {
        String::from_utf8(bytes).map(|s| s.to_lowercase())
    })(input)
}

/// `search = "SEARCH" [SP "CHARSET" SP astring] 1*(SP search-key)`
///
/// Multiple keys at the top level are joined by an implicit `AND`.
pub fn search(input: &[u8]) -> IResult<&[u8], (Option<String>, SearchKey)> {
    let (remaining, (_, charset, mut criteria)) = tuple((
        tag_no_case(b"SEARCH"),
        opt(map(
            tuple((SP, tag_no_case(b"CHARSET"), SP, search_string)),
            |(_, _, _, charset)| charset,
        )),
        many1(preceded(SP, search_key)),
    ))(input)?;

    let criteria = if criteria.len() == 1 {
        criteria.pop().unwrap()
    } else {
        SearchKey::And(criteria)
    };

    Ok((remaining, (charset, criteria)))
}

/// `search-key = "ALL" / "ANSWERED" / "BCC" SP astring /
///               "BEFORE" SP date / "BODY" SP astring /
///               "CC" SP astring / "DELETED" / "FLAGGED" /
///               "FROM" SP astring / "KEYWORD" SP flag-keyword /
///               "NEW" / "OLD" / "ON" SP date / "RECENT" / "SEEN" /
///               "SINCE" SP date / "SUBJECT" SP astring /
///               "TEXT" SP astring / "TO" SP astring /
///               "UNANSWERED" / "UNDELETED" / "UNFLAGGED" /
///               "UNKEYWORD" SP flag-keyword / "UNSEEN" /
///               "DRAFT" / "HEADER" SP header-fld-name SP astring /
///               "LARGER" SP number / "NOT" SP search-key /
///               "OR" SP search-key SP search-key /
///               "SENTBEFORE" SP date / "SENTON" SP date /
///               "SENTSINCE" SP date / "SMALLER" SP number /
///               "UID" SP sequence-set / "UNDRAFT" / sequence-set /
///               "(" search-key *(SP search-key) ")"`
pub fn search_key(input: &[u8]) -> IResult<&[u8], SearchKey> {
    alt((
        alt((
            map(
                preceded(tuple((tag_no_case(b"BCC"), SP)), search_string),
                SearchKey::Bcc,
            ),
            map(
                preceded(tuple((tag_no_case(b"BEFORE"), SP)), date),
                SearchKey::Before,
            ),
            map(
                preceded(tuple((tag_no_case(b"BODY"), SP)), search_string),
                SearchKey::Body,
            ),
            map(
                preceded(tuple((tag_no_case(b"CC"), SP)), search_string),
                SearchKey::Cc,
            ),
            map(
                preceded(tuple((tag_no_case(b"FROM"), SP)), search_string),
                SearchKey::From,
            ),
            map(
                preceded(tuple((tag_no_case(b"KEYWORD"), SP)), atom),
                |keyword| SearchKey::Keyword(keyword.to_string()),
            ),
            map(
                preceded(tuple((tag_no_case(b"ON"), SP)), date),
                SearchKey::On,
            ),
            map(
                preceded(tuple((tag_no_case(b"SINCE"), SP)), date),
                SearchKey::Since,
            ),
            map(
                preceded(tuple((tag_no_case(b"SUBJECT"), SP)), search_string),
                SearchKey::Subject,
            ),
            map(
                preceded(tuple((tag_no_case(b"TEXT"), SP)), search_string),
                SearchKey::Text,
            ),
            map(
                preceded(tuple((tag_no_case(b"TO"), SP)), search_string),
                SearchKey::To,
            ),
            value(SearchKey::All, tag_no_case(b"ALL")),
            value(SearchKey::Answered, tag_no_case(b"ANSWERED")),
            value(SearchKey::Deleted, tag_no_case(b"DELETED")),
            value(SearchKey::Flagged, tag_no_case(b"FLAGGED")),
            value(SearchKey::New, tag_no_case(b"NEW")),
            value(SearchKey::Old, tag_no_case(b"OLD")),
            value(SearchKey::Recent, tag_no_case(b"RECENT")),
            value(SearchKey::Seen, tag_no_case(b"SEEN")),
        )),
        alt((
            map(
                preceded(tuple((tag_no_case(b"UNKEYWORD"), SP)), atom),
                |keyword| SearchKey::Unkeyword(keyword.to_string()),
            ),
            value(SearchKey::Unanswered, tag_no_case(b"UNANSWERED")),
            value(SearchKey::Undeleted, tag_no_case(b"UNDELETED")),
            value(SearchKey::Undraft, tag_no_case(b"UNDRAFT")),
            value(SearchKey::Unflagged, tag_no_case(b"UNFLAGGED")),
            value(SearchKey::Unseen, tag_no_case(b"UNSEEN")),
            value(SearchKey::Draft, tag_no_case(b"DRAFT")),
            map(
                tuple((
                    tag_no_case(b"HEADER"),
                    SP,
                    header_fld_name,
                    SP,
                    search_string,
                )),
                |(_, _, name, _, string)| SearchKey::Header(name.to_lowercase(), string),
            ),
            map(
                preceded(tuple((tag_no_case(b"LARGER"), SP)), number),
                SearchKey::Larger,
            ),
            map(
                preceded(tuple((tag_no_case(b"NOT"), SP)), search_key),
                |key| SearchKey::Not(Box::new(key)),
            ),
            map(
                tuple((tag_no_case(b"OR"), SP, search_key, SP, search_key)),
                |(_, _, left, _, right)| SearchKey::Or(Box::new(left), Box::new(right)),
            ),
            map(
                preceded(tuple((tag_no_case(b"SENTBEFORE"), SP)), date),
                SearchKey::SentBefore,
            ),
            map(
                preceded(tuple((tag_no_case(b"SENTON"), SP)), date),
                SearchKey::SentOn,
            ),
            map(
                preceded(tuple((tag_no_case(b"SENTSINCE"), SP)), date),
                SearchKey::SentSince,
            ),
            map(
                preceded(tuple((tag_no_case(b"SMALLER"), SP)), number),
                SearchKey::Smaller,
            ),
            map(
                preceded(tuple((tag_no_case(b"UID"), SP)), sequence_set),
                SearchKey::Uid,
            ),
            map(sequence_set, SearchKey::SequenceSet),
            map(
                delimited(tag(b"("), separated_list1(SP, search_key), tag(b")")),
                |mut keys| {
                    if keys.len() == 1 {
                        keys.pop().unwrap()
                    } else {
                        SearchKey::And(keys)
                    }
                },
            ),
        )),
    ))(input)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{SeqNo, Sequence, SequenceSet};

    fn parse(input: &[u8]) -> (Option<String>, SearchKey) {
        let (rest, parsed) = search(input).unwrap();
        assert_eq!(rest, b"\r\n");
        parsed
    }

    #[test]
    fn single_key() {
        assert_eq!(parse(b"SEARCH ALL\r\n"), (None, SearchKey::All));
        assert_eq!(parse(b"search unseen\r\n"), (None, SearchKey::Unseen));
        assert_eq!(
            parse(b"SEARCH UID 5\r\n"),
            (
                None,
                SearchKey::Uid(SequenceSet(vec![Sequence::Single(SeqNo::Value(5))]))
            )
        );
    }

    #[test]
    fn implicit_and_and_nesting() {
        let (_, (_, key)) = search(b"SEARCH UNSEEN LARGER 1024\r\n").unwrap();
        assert_eq!(
            key,
            SearchKey::And(vec![SearchKey::Unseen, SearchKey::Larger(1024)])
        );

        let (_, (_, key)) =
            search(b"SEARCH OR FROM alice (SUBJECT hello UNSEEN)\r\n").unwrap();
        assert_eq!(
            key,
            SearchKey::Or(
                Box::new(SearchKey::From("alice".to_string())),
                Box::new(SearchKey::And(vec![
                    SearchKey::Subject("hello".to_string()),
                    SearchKey::Unseen,
                ])),
            )
        );

        let (_, (_, key)) = search(b"SEARCH NOT DELETED\r\n").unwrap();
        assert_eq!(key, SearchKey::Not(Box::new(SearchKey::Deleted)));
    }

    #[test]
    fn charset_and_strings() {
        assert_eq!(
            parse(b"SEARCH CHARSET UTF-8 SUBJECT \"Hi There\"\r\n"),
            (
                Some("utf-8".to_string()),
                SearchKey::Subject("hi there".to_string())
            )
        );
    }

    #[test]
    fn dates_and_headers() {
        let (_, (_, key)) = search(b"SEARCH SENTSINCE 1-Feb-1994\r\n").unwrap();
        assert_eq!(
            key,
            SearchKey::SentSince(chrono::NaiveDate::from_ymd_opt(1994, 2, 1).unwrap())
        );

        let (_, (_, key)) = search(b"SEARCH HEADER X-Spam-Status yes\r\n").unwrap();
        assert_eq!(
            key,
            SearchKey::Header("x-spam-status".to_string(), "yes".to_string())
        );
    }

    #[test]
    fn message_sets() {
        let (_, (_, key)) = search(b"SEARCH 2:4\r\n").unwrap();
        assert_eq!(
            key,
            SearchKey::SequenceSet(SequenceSet(vec![Sequence::Range(
                SeqNo::Value(2),
                SeqNo::Value(4)
            )]))
        );
    }
}
