use abnf_core::streaming::sp as SP;
use nom::{
    branch::alt,
    bytes::complete::{tag, tag_no_case},
    combinator::{map, opt, value},
    multi::{separated_list0, separated_list1},
    sequence::{delimited, preceded, tuple},
    IResult,
};

use crate::{
    parse::core::{header_fld_name, number, nz_number},
    types::{FetchAttribute, Macro, Part, Section},
};

/// `section-part = nz-number *("." nz-number)`
fn section_part(input: &[u8]) -> IResult<&[u8], Part> {
    map(separated_list1(tag(b"."), nz_number), Part)(input)
}

/// `header-list = "(" header-fld-name *(SP header-fld-name) ")"`
fn header_list(input: &[u8]) -> IResult<&[u8], Vec<String>> {
    delimited(
        tag(b"("),
        separated_list1(SP, header_fld_name),
        tag(b")"),
    )(input)
}

#[derive(Clone)]
enum Msgtext {
    Header,
    HeaderFields(Vec<String>),
    HeaderFieldsNot(Vec<String>),
    Text,
}

/// `section-msgtext = "HEADER" /
///                    "HEADER.FIELDS" [".NOT"] SP header-list /
///                    "TEXT"`
fn section_msgtext(input: &[u8]) -> IResult<&[u8], Msgtext> {
    alt((
        map(
            preceded(tuple((tag_no_case(b"HEADER.FIELDS.NOT"), SP)), header_list),
            Msgtext::HeaderFieldsNot,
        ),
        map(
            preceded(tuple((tag_no_case(b"HEADER.FIELDS"), SP)), header_list),
            Msgtext::HeaderFields,
        ),
        value(Msgtext::Header, tag_no_case(b"HEADER")),
        value(Msgtext::Text, tag_no_case(b"TEXT")),
    ))(input)
}

fn msgtext_to_section(part: Option<Part>, msgtext: Msgtext) -> Section {
    match msgtext {
        Msgtext::Header => Section::Header(part),
        Msgtext::HeaderFields(fields) => Section::HeaderFields(part, fields),
        Msgtext::HeaderFieldsNot(fields) => Section::HeaderFieldsNot(part, fields),
        Msgtext::Text => Section::Text(part),
    }
}

/// `section = "[" [section-spec] "]"` with
/// `section-spec = section-msgtext / (section-part ["." section-text])` and
/// `section-text = section-msgtext / "MIME"`
pub fn section(input: &[u8]) -> IResult<&[u8], Option<Section>> {
    let section_spec = alt((
        map(section_msgtext, |msgtext| msgtext_to_section(None, msgtext)),
        map(
            tuple((
                section_part,
                opt(preceded(
                    tag(b"."),
                    alt((
                        map(section_msgtext, Some),
                        value(None, tag_no_case(b"MIME")),
                    )),
                )),
            )),
            |(part, text)| match text {
                None => Section::Part(part),
                Some(None) => Section::Mime(part),
                Some(Some(msgtext)) => msgtext_to_section(Some(part), msgtext),
            },
        ),
    ));

    delimited(tag(b"["), opt(section_spec), tag(b"]"))(input)
}

/// `"<" number "." number ">"`: the `<offset.length>` partial. The RFC
/// wants a non-zero length but an empty slice is accepted and answered
/// with a zero-length literal.
fn partial(input: &[u8]) -> IResult<&[u8], (u32, u32)> {
    delimited(
        tag(b"<"),
        map(tuple((number, tag(b"."), number)), |(start, _, len)| {
            (start, len)
        }),
        tag(b">"),
    )(input)
}

/// `fetch-att = "ENVELOPE" /
///              "FLAGS" /
///              "INTERNALDATE" /
///              "RFC822" [".HEADER" / ".SIZE" / ".TEXT"] /
///              "BODY" ["STRUCTURE"] /
///              "UID" /
///              "BODY" section ["<" number "." nz-number ">"] /
///              "BODY.PEEK" section ["<" number "." nz-number ">"]`
pub fn fetch_att(input: &[u8]) -> IResult<&[u8], FetchAttribute> {
    alt((
        value(FetchAttribute::Envelope, tag_no_case(b"ENVELOPE")),
        value(FetchAttribute::Flags, tag_no_case(b"FLAGS")),
        value(FetchAttribute::InternalDate, tag_no_case(b"INTERNALDATE")),
        value(FetchAttribute::BodyStructure, tag_no_case(b"BODYSTRUCTURE")),
        map(
            tuple((tag_no_case(b"BODY.PEEK"), section, opt(partial))),
            |(_, section, partial)| FetchAttribute::BodyExt {
                section,
                partial,
                peek: true,
            },
        ),
        map(
            tuple((tag_no_case(b"BODY"), section, opt(partial))),
            |(_, section, partial)| FetchAttribute::BodyExt {
                section,
                partial,
                peek: false,
            },
        ),
        value(FetchAttribute::Body, tag_no_case(b"BODY")),
        value(FetchAttribute::Uid, tag_no_case(b"UID")),
        value(FetchAttribute::Rfc822Header, tag_no_case(b"RFC822.HEADER")),
        value(FetchAttribute::Rfc822Size, tag_no_case(b"RFC822.SIZE")),
        value(FetchAttribute::Rfc822Text, tag_no_case(b"RFC822.TEXT")),
        value(FetchAttribute::Rfc822, tag_no_case(b"RFC822")),
    ))(input)
}

/// `"ALL" / "FULL" / "FAST" / fetch-att / "(" fetch-att *(SP fetch-att) ")"`
///
/// Macros expand immediately; the engine only ever sees attribute lists.
pub fn fetch_atts(input: &[u8]) -> IResult<&[u8], Vec<FetchAttribute>> {
    alt((
        map(tag_no_case(b"ALL"), |_| Macro::All.expand()),
        map(tag_no_case(b"FAST"), |_| Macro::Fast.expand()),
        map(tag_no_case(b"FULL"), |_| Macro::Full.expand()),
        delimited(tag(b"("), separated_list0(SP, fetch_att), tag(b")")),
        map(fetch_att, |att| vec![att]),
    ))(input)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_att(input: &[u8]) -> FetchAttribute {
        let (rest, att) = fetch_att(input).unwrap();
        assert_eq!(rest, b"\r\n");
        att
    }

    #[test]
    fn plain_atts() {
        assert_eq!(parse_att(b"envelope\r\n"), FetchAttribute::Envelope);
        assert_eq!(parse_att(b"RFC822.SIZE\r\n"), FetchAttribute::Rfc822Size);
        assert_eq!(parse_att(b"BODYSTRUCTURE\r\n"), FetchAttribute::BodyStructure);
        assert_eq!(parse_att(b"BODY\r\n"), FetchAttribute::Body);
    }

    #[test]
    fn body_sections() {
        assert_eq!(
            parse_att(b"BODY[]\r\n"),
            FetchAttribute::BodyExt {
                section: None,
                partial: None,
                peek: false,
            }
        );
        assert_eq!(
            parse_att(b"BODY.PEEK[HEADER]\r\n"),
            FetchAttribute::BodyExt {
                section: Some(Section::Header(None)),
                partial: None,
                peek: true,
            }
        );
        assert_eq!(
            parse_att(b"BODY[1.2.TEXT]<0.1024>\r\n"),
            FetchAttribute::BodyExt {
                section: Some(Section::Text(Some(Part(vec![1, 2])))),
                partial: Some((0, 1024)),
                peek: false,
            }
        );
        assert_eq!(
            parse_att(b"BODY[2.MIME]\r\n"),
            FetchAttribute::BodyExt {
                section: Some(Section::Mime(Part(vec![2]))),
                partial: None,
                peek: false,
            }
        );
        assert_eq!(
            parse_att(b"BODY[HEADER.FIELDS (Date From)]\r\n"),
            FetchAttribute::BodyExt {
                section: Some(Section::HeaderFields(
                    None,
                    vec!["Date".to_string(), "From".to_string()]
                )),
                partial: None,
                peek: false,
            }
        );
    }

    #[test]
    fn att_lists_and_macros() {
        let (_, atts) = fetch_atts(b"ALL\r\n").unwrap();
        assert_eq!(atts, Macro::All.expand());

        let (_, atts) = fetch_atts(b"(FLAGS UID)\r\n").unwrap();
        assert_eq!(atts, vec![FetchAttribute::Flags, FetchAttribute::Uid]);

        let (_, atts) = fetch_atts(b"FLAGS\r\n").unwrap();
        assert_eq!(atts, vec![FetchAttribute::Flags]);
    }
}
