use abnf_core::streaming::dquote as DQUOTE;
use chrono::{DateTime, FixedOffset, NaiveDate};
use nom::{
    bytes::complete::take_while1,
    combinator::{map_res, opt},
    sequence::{delimited, tuple},
    IResult,
};

fn is_date_text_char(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || byte == b'-'
}

/// `date = date-text / DQUOTE date-text DQUOTE` where
/// `date-text = date-day "-" date-month "-" date-year`
///
/// Used by the SEARCH date keys.
pub fn date(input: &[u8]) -> IResult<&[u8], NaiveDate> {
    let date_text = map_res(take_while1(is_date_text_char), |text: &[u8]| {
        let text = std::str::from_utf8(text).map_err(|_| ())?;
        NaiveDate::parse_from_str(text, "%d-%b-%Y").map_err(|_| ())
    });

    let (remaining, (open, parsed)) = tuple((opt(DQUOTE), date_text))(input)?;
    if open.is_some() {
        let (remaining, _) = DQUOTE(remaining)?;
        Ok((remaining, parsed))
    } else {
        Ok((remaining, parsed))
    }
}

/// `date-time = DQUOTE date-day-fixed "-" date-month "-" date-year SP
///              time SP zone DQUOTE`
///
/// Used by APPEND to carry the message's INTERNALDATE. `date-day-fixed`
/// may be space-padded (`" 1-Jul-2003 ..."`).
pub fn date_time(input: &[u8]) -> IResult<&[u8], DateTime<FixedOffset>> {
    map_res(
        delimited(DQUOTE, take_while1(|byte| byte != b'"'), DQUOTE),
        |text: &[u8]| {
            let text = std::str::from_utf8(text).map_err(|_| ())?;
            DateTime::parse_from_str(text.trim_start(), "%d-%b-%Y %H:%M:%S %z")
                .map_err(|_| ())
        },
    )(input)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dates() {
        let expected = NaiveDate::from_ymd_opt(2003, 7, 1).unwrap();
        assert_eq!(date(b"1-Jul-2003 "), Ok((&b" "[..], expected)));
        assert_eq!(date(b"01-Jul-2003 "), Ok((&b" "[..], expected)));
        assert_eq!(date(b"\"1-Jul-2003\" "), Ok((&b" "[..], expected)));
        assert!(date(b"1-Julx-2003 ").is_err());
        assert!(date(b"32-Jul-2003 ").is_err());
    }

    #[test]
    fn date_times() {
        let (rest, parsed) =
            date_time(b"\"01-Jul-2003 10:52:37 +0200\"\r\n").unwrap();
        assert_eq!(rest, b"\r\n");
        assert_eq!(
            parsed,
            DateTime::parse_from_rfc2822("Tue, 1 Jul 2003 10:52:37 +0200").unwrap()
        );

        // Space-padded day-fixed form.
        let (_, parsed) = date_time(b"\" 1-Jul-2003 10:52:37 +0200\"").unwrap();
        assert_eq!(
            parsed,
            DateTime::parse_from_rfc2822("Tue, 1 Jul 2003 10:52:37 +0200").unwrap()
        );

        assert!(date_time(b"\"01-Jul-2003 10:52:37\"").is_err());
    }
}
