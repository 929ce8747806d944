use nom::{bytes::complete::take_while1, combinator::map_res, IResult};

use crate::types::SequenceSet;

/// `sequence-set = (seq-number / seq-range) *("," (seq-number / seq-range))`
///
/// The token is cut out by character class and handed to
/// [`SequenceSet::try_from`], which enforces the grammar (no leading
/// zeroes, at most one `:` per item).
pub fn sequence_set(input: &[u8]) -> IResult<&[u8], SequenceSet> {
    map_res(
        take_while1(|byte: u8| byte.is_ascii_digit() || matches!(byte, b':' | b',' | b'*')),
        |token: &[u8]| {
            let token = std::str::from_utf8(token).map_err(|_| ())?;
            SequenceSet::try_from(token)
        },
    )(input)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{SeqNo, Sequence};

    #[test]
    fn parse() {
        let (rest, set) = sequence_set(b"1:5,8,*:10 (FLAGS)\r\n").unwrap();
        assert_eq!(rest, b" (FLAGS)\r\n");
        assert_eq!(
            set.0,
            vec![
                Sequence::Range(SeqNo::Value(1), SeqNo::Value(5)),
                Sequence::Single(SeqNo::Value(8)),
                Sequence::Range(SeqNo::Largest, SeqNo::Value(10)),
            ]
        );

        assert!(sequence_set(b"01 ").is_err());
        assert!(sequence_set(b"x ").is_err());
    }
}
