use std::fmt;

/// `section-part = nz-number *("." nz-number)` : a dotted path selecting a
/// (possibly nested) MIME part, 1-indexed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Part(pub Vec<u32>);

impl fmt::Display for Part {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (i, number) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ".")?;
            }
            write!(f, "{number}")?;
        }
        Ok(())
    }
}

/// `section-spec = section-msgtext / (section-part ["." section-text])`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Section {
    /// `[n.n...]` with no trailing text specifier.
    Part(Part),
    /// `[HEADER]` / `[n.HEADER]`
    Header(Option<Part>),
    /// `[HEADER.FIELDS (...)]` / `[n.HEADER.FIELDS (...)]`
    HeaderFields(Option<Part>, Vec<String>),
    /// `[HEADER.FIELDS.NOT (...)]` / `[n.HEADER.FIELDS.NOT (...)]`
    HeaderFieldsNot(Option<Part>, Vec<String>),
    /// `[TEXT]` / `[n.TEXT]`
    Text(Option<Part>),
    /// `[n.MIME]`; only valid with a part path.
    Mime(Part),
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fn prefix(f: &mut fmt::Formatter, part: &Option<Part>) -> fmt::Result {
            if let Some(part) = part {
                write!(f, "{part}.")?;
            }
            Ok(())
        }

        match self {
            Section::Part(part) => write!(f, "{part}"),
            Section::Header(part) => {
                prefix(f, part)?;
                write!(f, "HEADER")
            }
            Section::HeaderFields(part, fields) => {
                prefix(f, part)?;
                write!(f, "HEADER.FIELDS ({})", fields.join(" "))
            }
            Section::HeaderFieldsNot(part, fields) => {
                prefix(f, part)?;
                write!(f, "HEADER.FIELDS.NOT ({})", fields.join(" "))
            }
            Section::Text(part) => {
                prefix(f, part)?;
                write!(f, "TEXT")
            }
            Section::Mime(part) => write!(f, "{part}.MIME"),
        }
    }
}

/// `fetch-att`: a single requested message attribute.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FetchAttribute {
    Envelope,
    Flags,
    InternalDate,
    Uid,
    Rfc822,
    Rfc822Header,
    Rfc822Size,
    Rfc822Text,
    /// `BODY` with no section: BODYSTRUCTURE without extension data.
    Body,
    BodyStructure,
    /// `BODY[section]<partial>` / `BODY.PEEK[section]<partial>`
    BodyExt {
        section: Option<Section>,
        partial: Option<(u32, u32)>,
        peek: bool,
    },
}

impl FetchAttribute {
    /// Whether rendering this attribute counts as "reading" the message,
    /// which implicitly sets `\Seen`.
    pub fn fetches_body(&self) -> bool {
        matches!(
            self,
            FetchAttribute::Rfc822
                | FetchAttribute::Rfc822Text
                | FetchAttribute::BodyExt { peek: false, .. }
        )
    }
}

impl fmt::Display for FetchAttribute {
    /// The label echoed in the FETCH response. Note that `BODY.PEEK`
    /// answers as `BODY`, and a partial answers with only its origin octet.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FetchAttribute::Envelope => write!(f, "ENVELOPE"),
            FetchAttribute::Flags => write!(f, "FLAGS"),
            FetchAttribute::InternalDate => write!(f, "INTERNALDATE"),
            FetchAttribute::Uid => write!(f, "UID"),
            FetchAttribute::Rfc822 => write!(f, "RFC822"),
            FetchAttribute::Rfc822Header => write!(f, "RFC822.HEADER"),
            FetchAttribute::Rfc822Size => write!(f, "RFC822.SIZE"),
            FetchAttribute::Rfc822Text => write!(f, "RFC822.TEXT"),
            FetchAttribute::Body => write!(f, "BODY"),
            FetchAttribute::BodyStructure => write!(f, "BODYSTRUCTURE"),
            FetchAttribute::BodyExt {
                section, partial, ..
            } => {
                write!(f, "BODY[")?;
                if let Some(section) = section {
                    write!(f, "{section}")?;
                }
                write!(f, "]")?;
                if let Some((start, _)) = partial {
                    write!(f, "<{start}>")?;
                }
                Ok(())
            }
        }
    }
}

/// `"ALL" / "FULL" / "FAST"`: shorthand attribute sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Macro {
    All,
    Fast,
    Full,
}

impl Macro {
    pub fn expand(&self) -> Vec<FetchAttribute> {
        use FetchAttribute::*;

        match self {
            Macro::All => vec![Flags, InternalDate, Rfc822Size, Envelope],
            Macro::Fast => vec![Flags, InternalDate, Rfc822Size],
            Macro::Full => vec![Flags, InternalDate, Rfc822Size, Envelope, Body],
        }
    }
}

/// `STATUS` attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusAttribute {
    Messages,
    Recent,
    UidNext,
    UidValidity,
    Unseen,
}

impl fmt::Display for StatusAttribute {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StatusAttribute::Messages => write!(f, "MESSAGES"),
            StatusAttribute::Recent => write!(f, "RECENT"),
            StatusAttribute::UidNext => write!(f, "UIDNEXT"),
            StatusAttribute::UidValidity => write!(f, "UIDVALIDITY"),
            StatusAttribute::Unseen => write!(f, "UNSEEN"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attribute_labels() {
        let tests: [(FetchAttribute, &str); 6] = [
            (FetchAttribute::Rfc822Size, "RFC822.SIZE"),
            (
                FetchAttribute::BodyExt {
                    section: None,
                    partial: None,
                    peek: false,
                },
                "BODY[]",
            ),
            (
                FetchAttribute::BodyExt {
                    section: Some(Section::Header(None)),
                    partial: None,
                    peek: true,
                },
                "BODY[HEADER]",
            ),
            (
                FetchAttribute::BodyExt {
                    section: Some(Section::Part(Part(vec![1, 2]))),
                    partial: Some((0, 1024)),
                    peek: false,
                },
                "BODY[1.2]<0>",
            ),
            (
                FetchAttribute::BodyExt {
                    section: Some(Section::HeaderFields(
                        None,
                        vec!["DATE".to_string(), "FROM".to_string()],
                    )),
                    partial: None,
                    peek: false,
                },
                "BODY[HEADER.FIELDS (DATE FROM)]",
            ),
            (
                FetchAttribute::BodyExt {
                    section: Some(Section::Mime(Part(vec![2]))),
                    partial: None,
                    peek: false,
                },
                "BODY[2.MIME]",
            ),
        ];

        for (attribute, expected) in tests {
            assert_eq!(attribute.to_string(), expected);
        }
    }

    #[test]
    fn macros_expand() {
        assert_eq!(Macro::Fast.expand().len(), 3);
        assert_eq!(Macro::All.expand().len(), 4);
        assert_eq!(Macro::Full.expand().len(), 5);
    }
}
