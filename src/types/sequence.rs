use std::fmt;

use crate::error::CommandError;

/// `seq-number = nz-number / "*"`
///
/// `*` is the largest number in use: the message count for message sequence
/// numbers, the highest UID for UID commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SeqNo {
    Value(u32),
    Largest,
}

impl SeqNo {
    pub fn expand(&self, largest: u32) -> u32 {
        match self {
            SeqNo::Value(value) => *value,
            SeqNo::Largest => largest,
        }
    }
}

/// `seq-range = seq-number ":" seq-number` or a lone `seq-number`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Sequence {
    Single(SeqNo),
    Range(SeqNo, SeqNo),
}

/// `sequence-set = (seq-number / seq-range) *("," (seq-number / seq-range))`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SequenceSet(pub Vec<Sequence>);

impl SequenceSet {
    /// Expand into a sorted, de-duplicated list of numbers.
    ///
    /// `largest` replaces `*`. For non-UID commands a number beyond
    /// `largest` (including `*` in an empty mailbox) is a client error and
    /// answered `BAD`; ranges run inclusive and `M:N` with `M > N` is
    /// treated as `N:M`. UID commands tolerate out-of-range numbers; an
    /// empty mailbox makes `*` expand to `0`, which simply matches nothing.
    pub fn to_list(&self, largest: u32, uid_cmd: bool) -> Result<Vec<u32>, CommandError> {
        let mut result = Vec::new();

        for item in &self.0 {
            match item {
                Sequence::Single(seq_no) => {
                    let value = seq_no.expand(largest);
                    if !uid_cmd && (value > largest || value == 0) {
                        return Err(CommandError::bad(format!(
                            "Message index '{}' is greater than the size of the mailbox",
                            item
                        )));
                    }
                    result.push(value);
                }
                Sequence::Range(from, to) => {
                    let start = from.expand(largest);
                    let end = to.expand(largest);
                    if !uid_cmd
                        && (start == 0 || end == 0 || start > largest || end > largest)
                    {
                        return Err(CommandError::bad(format!(
                            "Message sequence '{}' is greater than the size of the mailbox",
                            item
                        )));
                    }
                    let (lo, hi) = if start <= end { (start, end) } else { (end, start) };
                    result.extend(lo..=hi);
                }
            }
        }

        result.sort_unstable();
        result.dedup();
        Ok(result)
    }

    /// Membership test without materialising the whole set. Used by the
    /// search engine for `MESSAGE_SET` and `UID` keys.
    pub fn contains(&self, value: u32, largest: u32) -> bool {
        self.0.iter().any(|item| match item {
            Sequence::Single(seq_no) => seq_no.expand(largest) == value,
            Sequence::Range(from, to) => {
                let start = from.expand(largest);
                let end = to.expand(largest);
                let (lo, hi) = if start <= end { (start, end) } else { (end, start) };
                (lo..=hi).contains(&value)
            }
        })
    }
}

impl fmt::Display for SeqNo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SeqNo::Value(value) => write!(f, "{value}"),
            SeqNo::Largest => write!(f, "*"),
        }
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Sequence::Single(seq_no) => write!(f, "{seq_no}"),
            Sequence::Range(from, to) => write!(f, "{from}:{to}"),
        }
    }
}

impl fmt::Display for SequenceSet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (i, item) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{item}")?;
        }
        Ok(())
    }
}

impl TryFrom<&str> for SeqNo {
    type Error = ();

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        if value == "*" {
            Ok(SeqNo::Largest)
        } else if value.starts_with('0') {
            // The IMAP grammar does not allow leading zeroes even though
            // `str::parse` would accept them.
            Err(())
        } else {
            Ok(SeqNo::Value(value.parse::<u32>().map_err(|_| ())?))
        }
    }
}

impl TryFrom<&str> for Sequence {
    type Error = ();

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value.split(':').count() {
            1 => Ok(Sequence::Single(SeqNo::try_from(value)?)),
            2 => {
                let mut split = value.split(':');
                let start = split.next().unwrap();
                let end = split.next().unwrap();
                Ok(Sequence::Range(
                    SeqNo::try_from(start)?,
                    SeqNo::try_from(end)?,
                ))
            }
            _ => Err(()),
        }
    }
}

impl TryFrom<&str> for SequenceSet {
    type Error = ();

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let mut items = Vec::new();
        for part in value.split(',') {
            items.push(Sequence::try_from(part)?);
        }
        if items.is_empty() {
            return Err(());
        }
        Ok(SequenceSet(items))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_positive() {
        let tests = [
            ("1", vec![Sequence::Single(SeqNo::Value(1))]),
            ("*", vec![Sequence::Single(SeqNo::Largest)]),
            (
                "1:2,3",
                vec![
                    Sequence::Range(SeqNo::Value(1), SeqNo::Value(2)),
                    Sequence::Single(SeqNo::Value(3)),
                ],
            ),
            (
                "4:*",
                vec![Sequence::Range(SeqNo::Value(4), SeqNo::Largest)],
            ),
        ];

        for (input, expected) in tests {
            assert_eq!(SequenceSet::try_from(input).unwrap().0, expected);
        }
    }

    #[test]
    fn parse_negative() {
        for input in ["", " ", "0", "01", "*1", ":", ":*", "1:", "1,", "1:2:3"] {
            assert!(SequenceSet::try_from(input).is_err(), "{input:?}");
        }
    }

    #[test]
    fn expansion() {
        let tests = [
            ("*", 3, vec![3]),
            ("1:*", 3, vec![1, 2, 3]),
            ("5,1:2", 5, vec![1, 2, 5]),
            ("*:2", 3, vec![2, 3]),
            ("3:1", 3, vec![1, 2, 3]),
            ("1,1,1", 3, vec![1]),
        ];

        for (input, largest, expected) in tests {
            let set = SequenceSet::try_from(input).unwrap();
            assert_eq!(set.to_list(largest, false).unwrap(), expected, "{input}");
        }
    }

    #[test]
    fn expansion_out_of_range() {
        let set = SequenceSet::try_from("5").unwrap();
        assert!(set.to_list(3, false).is_err());
        assert_eq!(set.to_list(3, true).unwrap(), vec![5]);

        // `*` in an empty mailbox: BAD for msn commands, `{0}` for UID.
        let set = SequenceSet::try_from("*").unwrap();
        assert!(set.to_list(0, false).is_err());
        assert_eq!(set.to_list(0, true).unwrap(), vec![0]);
    }

    #[test]
    fn membership() {
        let set = SequenceSet::try_from("1:3,7,9:*").unwrap();
        for value in [1, 2, 3, 7, 9, 10, 12] {
            assert!(set.contains(value, 12), "{value}");
        }
        for value in [0, 4, 6, 8, 13] {
            assert!(!set.contains(value, 12), "{value}");
        }
    }
}
