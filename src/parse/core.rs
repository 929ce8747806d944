use abnf_core::streaming::dquote;
use nom::{
    branch::alt,
    bytes::complete::{tag, take, take_while1},
    character::is_digit,
    combinator::{map, map_res, opt, verify},
    sequence::tuple,
    IResult,
};

/// `number = 1*DIGIT`
pub fn number(input: &[u8]) -> IResult<&[u8], u32> {
    map_res(take_while1(is_digit), |digits: &[u8]| {
        // Guaranteed ASCII digits.
        std::str::from_utf8(digits).unwrap().parse::<u32>()
    })(input)
}

/// `nz-number = digit-nz *DIGIT`
pub fn nz_number(input: &[u8]) -> IResult<&[u8], u32> {
    verify(number, |number| *number != 0)(input)
}

/// `atom-specials = "(" / ")" / "{" / SP / CTL / list-wildcards /
///                  quoted-specials / resp-specials`
pub fn is_atom_char(byte: u8) -> bool {
    !matches!(
        byte,
        b'(' | b')' | b'{' | b' ' | b'%' | b'*' | b'"' | b'\\' | b']'
    ) && byte > 0x1f
        && byte != 0x7f
}

/// `ASTRING-CHAR = ATOM-CHAR / resp-specials`
pub fn is_astring_char(byte: u8) -> bool {
    is_atom_char(byte) || byte == b']'
}

/// `atom = 1*ATOM-CHAR`
pub fn atom(input: &[u8]) -> IResult<&[u8], &str> {
    map_res(take_while1(is_atom_char), std::str::from_utf8)(input)
}

/// `tag = 1*<any ASTRING-CHAR except "+">`
pub fn imap_tag(input: &[u8]) -> IResult<&[u8], String> {
    map(
        map_res(
            take_while1(|byte| is_astring_char(byte) && byte != b'+'),
            std::str::from_utf8,
        ),
        str::to_string,
    )(input)
}

/// `quoted = DQUOTE *QUOTED-CHAR DQUOTE`
///
/// `QUOTED-CHAR` is any text char except `"` and `\`, or either of those
/// backslash-escaped.
pub fn quoted(input: &[u8]) -> IResult<&[u8], Vec<u8>> {
    let (mut remaining, _) = dquote(input)?;

    let mut value = Vec::new();
    loop {
        match remaining.first() {
            Some(b'"') => return Ok((&remaining[1..], value)),
            Some(b'\\') => match remaining.get(1) {
                Some(escaped @ (b'"' | b'\\')) => {
                    value.push(*escaped);
                    remaining = &remaining[2..];
                }
                _ => {
                    return Err(nom::Err::Error(nom::error::Error::new(
                        remaining,
                        nom::error::ErrorKind::Escaped,
                    )))
                }
            },
            Some(byte) if *byte != b'\r' && *byte != b'\n' => {
                value.push(*byte);
                remaining = &remaining[1..];
            }
            _ => {
                return Err(nom::Err::Error(nom::error::Error::new(
                    remaining,
                    nom::error::ErrorKind::Char,
                )))
            }
        }
    }
}

/// `literal = "{" number ["+"] "}" CRLF *CHAR8`
///
/// By the time the parser runs, the session has already appended the
/// announced bytes, so the octets simply follow the CRLF.
pub fn literal(input: &[u8]) -> IResult<&[u8], Vec<u8>> {
    let (remaining, (_, size, _, _, _)) = tuple((
        tag(b"{"),
        number,
        opt(tag(b"+")),
        tag(b"}"),
        tag(b"\r\n"),
    ))(input)?;

    let (remaining, octets) = take(size as usize)(remaining)?;

    Ok((remaining, octets.to_vec()))
}

/// `string = quoted / literal`
pub fn string(input: &[u8]) -> IResult<&[u8], Vec<u8>> {
    alt((quoted, literal))(input)
}

/// `astring = 1*ASTRING-CHAR / string`
pub fn astring(input: &[u8]) -> IResult<&[u8], Vec<u8>> {
    alt((
        map(take_while1(is_astring_char), <[u8]>::to_vec),
        string,
    ))(input)
}

/// An `astring` that must be valid UTF-8 (mailbox names, header field
/// names, search strings).
pub fn astring_utf8(input: &[u8]) -> IResult<&[u8], String> {
    map_res(astring, String::from_utf8)(input)
}

/// `nil = "NIL"`
pub fn nil(input: &[u8]) -> IResult<&[u8], ()> {
    map(nom::bytes::complete::tag_no_case(b"NIL"), |_| ())(input)
}

/// `header-fld-name = astring`
pub fn header_fld_name(input: &[u8]) -> IResult<&[u8], String> {
    astring_utf8(input)
}

/// `list-mailbox = 1*list-char / string`; `list-char` adds the wildcards
/// `%` and `*` to the atom characters.
pub fn list_mailbox(input: &[u8]) -> IResult<&[u8], String> {
    alt((
        map_res(
            take_while1(|byte| is_atom_char(byte) || byte == b'%' || byte == b'*'),
            |bytes: &[u8]| std::str::from_utf8(bytes).map(str::to_string),
        ),
        map_res(string, String::from_utf8),
    ))(input)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers() {
        assert_eq!(number(b"42 "), Ok((&b" "[..], 42)));
        assert_eq!(nz_number(b"7)"), Ok((&b")"[..], 7)));
        assert!(nz_number(b"0 ").is_err());
        assert!(number(b"x").is_err());
    }

    #[test]
    fn atoms_and_tags() {
        assert_eq!(atom(b"NOOP\r\n"), Ok((&b"\r\n"[..], "NOOP")));
        assert_eq!(imap_tag(b"a001 "), Ok((&b" "[..], "a001".to_string())));
        // "+" may not appear in a tag.
        assert_eq!(imap_tag(b"a+b "), Ok((&b"+b "[..], "a".to_string())));
    }

    #[test]
    fn quoted_strings() {
        assert_eq!(quoted(b"\"\" "), Ok((&b" "[..], b"".to_vec())));
        assert_eq!(
            quoted(b"\"hello world\"x"),
            Ok((&b"x"[..], b"hello world".to_vec()))
        );
        assert_eq!(
            quoted(br#""a \"b\" \\c""#),
            Ok((&b""[..], br#"a "b" \c"#.to_vec()))
        );
        assert!(quoted(b"\"unterminated").is_err());
        assert!(quoted(b"\"bad\r\n\"").is_err());
    }

    #[test]
    fn literals() {
        assert_eq!(
            literal(b"{5}\r\nhello rest"),
            Ok((&b" rest"[..], b"hello".to_vec()))
        );
        // Non-synchronising form.
        assert_eq!(
            literal(b"{3+}\r\nabcd"),
            Ok((&b"d"[..], b"abc".to_vec()))
        );
        assert!(literal(b"{5}\r\nhi").is_err());
    }

    #[test]
    fn astrings() {
        assert_eq!(astring(b"box "), Ok((&b" "[..], b"box".to_vec())));
        assert_eq!(
            astring(b"\"two words\" "),
            Ok((&b" "[..], b"two words".to_vec()))
        );
        // resp-specials are fine in astrings.
        assert_eq!(astring(b"a]b "), Ok((&b" "[..], b"a]b".to_vec())));
    }

    #[test]
    fn list_mailboxes() {
        assert_eq!(
            list_mailbox(b"Archive/%\r\n"),
            Ok((&b"\r\n"[..], "Archive/%".to_string()))
        );
        assert_eq!(list_mailbox(b"*\r\n"), Ok((&b"\r\n"[..], "*".to_string())));
    }
}
