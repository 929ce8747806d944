//! Rendering of FETCH data items.
//!
//! Each attribute renders to `LABEL value` bytes ready to be joined into a
//! `* n FETCH (...)` response. Body sections come back as length-prefixed
//! literals; all byte counts are over the CRLF-serialised message.

use chrono::{DateTime, Local};
use mailparse::MailAddr;

use crate::{
    error::CommandError,
    message::{Message, PartNode},
    types::{FetchAttribute, Flag, Part, Section},
};

/// Everything needed to render one message's attributes.
pub struct FetchContext<'a> {
    pub message: &'a Message,
    pub msn: u32,
    pub uid: u32,
    pub flags: Vec<Flag>,
    pub internal_date: DateTime<Local>,
}

/// Render a single data item as `LABEL value`.
pub fn render(ctx: &FetchContext, attribute: &FetchAttribute) -> Result<Vec<u8>, CommandError> {
    let label = attribute.to_string();
    let value: Vec<u8> = match attribute {
        FetchAttribute::Flags => {
            let flags: Vec<String> = ctx.flags.iter().map(Flag::to_string).collect();
            format!("({})", flags.join(" ")).into_bytes()
        }
        FetchAttribute::InternalDate => format!(
            "\"{}\"",
            ctx.internal_date.format("%d-%b-%Y %H:%M:%S %z")
        )
        .into_bytes(),
        FetchAttribute::Uid => ctx.uid.to_string().into_bytes(),
        FetchAttribute::Rfc822Size => ctx.message.size().to_string().into_bytes(),
        FetchAttribute::Envelope => envelope(ctx.message.root()).into_bytes(),
        FetchAttribute::Body => bodystructure(ctx.message, ctx.message.root(), false).into_bytes(),
        FetchAttribute::BodyStructure => {
            bodystructure(ctx.message, ctx.message.root(), true).into_bytes()
        }
        FetchAttribute::Rfc822 => as_literal(&section_bytes(ctx.message, &None)?),
        FetchAttribute::Rfc822Header => {
            as_literal(&section_bytes(ctx.message, &Some(Section::Header(None)))?)
        }
        FetchAttribute::Rfc822Text => {
            as_literal(&section_bytes(ctx.message, &Some(Section::Text(None)))?)
        }
        FetchAttribute::BodyExt {
            section, partial, ..
        } => {
            let mut bytes = section_bytes(ctx.message, section)?;
            if let Some((offset, length)) = partial {
                let start = (*offset as usize).min(bytes.len());
                let end = (start + *length as usize).min(bytes.len());
                bytes = bytes[start..end].to_vec();
            }
            as_literal(&bytes)
        }
    };

    let mut rendered = label.into_bytes();
    rendered.push(b' ');
    rendered.extend_from_slice(&value);
    Ok(rendered)
}

/// `{N}\r\n<octets>`
fn as_literal(bytes: &[u8]) -> Vec<u8> {
    let mut out = format!("{{{}}}\r\n", bytes.len()).into_bytes();
    out.extend_from_slice(bytes);
    out
}

fn bad_section(reason: impl Into<String>) -> CommandError {
    CommandError::Bad(reason.into())
}

fn resolve_part<'a>(message: &'a Message, path: &Part) -> Result<&'a PartNode, CommandError> {
    message.find_part(path).ok_or_else(|| {
        bad_section(format!("message has no section {path}"))
    })
}

/// Extract the bytes a `BODY[section]` refers to.
pub fn section_bytes(
    message: &Message,
    section: &Option<Section>,
) -> Result<Vec<u8>, CommandError> {
    let bytes = match section {
        // The entire message.
        None => message.raw().to_vec(),

        // Header block, trailing blank line included.
        Some(Section::Header(part)) => {
            let node = match part {
                None => message.root(),
                Some(path) => resolve_part(message, path)?,
            };
            // HEADER on a message/rfc822 part means the embedded message's
            // headers.
            let node = match (&node.embedded, node.content_type().as_str()) {
                (Some(embedded), "message/rfc822") => embedded.as_ref(),
                _ => node,
            };
            header_block(message, node)
        }

        Some(Section::HeaderFields(part, fields)) => {
            let node = match part {
                None => message.root(),
                Some(path) => resolve_part(message, path)?,
            };
            header_fields(node, fields, false)
        }

        Some(Section::HeaderFieldsNot(part, fields)) => {
            let node = match part {
                None => message.root(),
                Some(path) => resolve_part(message, path)?,
            };
            header_fields(node, fields, true)
        }

        // Body without the top-level headers; sub-part headers stay.
        Some(Section::Text(part)) => {
            let node = match part {
                None => message.root(),
                Some(path) => resolve_part(message, path)?,
            };
            message.body_slice(node).to_vec()
        }

        // The MIME headers of the addressed part.
        Some(Section::Mime(path)) => {
            let node = resolve_part(message, path)?;
            header_block(message, node)
        }

        // A part's content (without its MIME headers).
        Some(Section::Part(path)) => {
            if path.0.first() != Some(&1) && path.0.len() == 1 && !message.root().is_multipart() {
                return Err(bad_section(format!(
                    "trying to retrieve section {path} and this message is not multipart"
                )));
            }
            let node = resolve_part(message, path)?;
            message.body_slice(node).to_vec()
        }
    };

    Ok(bytes)
}

fn header_block(message: &Message, node: &PartNode) -> Vec<u8> {
    let slice = message.part_slice(node);
    let body_offset = message.body_slice(node).len();
    slice[..slice.len() - body_offset].to_vec()
}

/// Regenerate a header block keeping (or skipping) the named fields.
/// Matching is case-insensitive; the trailing blank line is always there.
fn header_fields(node: &PartNode, fields: &[String], skip: bool) -> Vec<u8> {
    let mut out = Vec::new();
    for (name, value) in node.headers() {
        let listed = fields
            .iter()
            .any(|field| field.eq_ignore_ascii_case(name));
        if listed != skip {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
    }
    out.extend_from_slice(b"\r\n");
    out
}

/// Escape and quote a string value; `NIL` for nothing.
fn quoted(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for ch in value.chars() {
        if ch == '"' || ch == '\\' {
            out.push('\\');
        }
        out.push(ch);
    }
    out.push('"');
    out
}

fn nil_or_quoted(value: Option<&str>) -> String {
    match value {
        Some(value) => quoted(value),
        None => "NIL".to_string(),
    }
}

/// The ENVELOPE 10-tuple: `(date subject from sender reply-to to cc bcc
/// in-reply-to message-id)`. `sender` and `reply-to` fall back to `from`.
pub fn envelope(node: &PartNode) -> String {
    let from_rendered = address_list(node, "from");

    let mut fields = Vec::with_capacity(10);
    fields.push(nil_or_quoted(node.header("date")));
    fields.push(nil_or_quoted(node.header("subject")));
    fields.push(from_rendered.clone());
    for field in ["sender", "reply-to"] {
        if node.header(field).is_some() {
            fields.push(address_list(node, field));
        } else {
            fields.push(from_rendered.clone());
        }
    }
    for field in ["to", "cc", "bcc"] {
        fields.push(address_list(node, field));
    }
    fields.push(nil_or_quoted(node.header("in-reply-to")));
    fields.push(nil_or_quoted(node.header("message-id")));

    format!("({})", fields.join(" "))
}

/// A parenthesised list of 4-tuple address structures, or NIL.
fn address_list(node: &PartNode, field: &str) -> String {
    let Some(value) = node.header(field) else {
        return "NIL".to_string();
    };

    let Ok(parsed) = mailparse::addrparse(value) else {
        return "NIL".to_string();
    };

    let mut singles = Vec::new();
    for addr in parsed.iter() {
        match addr {
            MailAddr::Single(single) => singles.push(single.clone()),
            MailAddr::Group(group) => singles.extend(group.addrs.iter().cloned()),
        }
    }

    if singles.is_empty() {
        return "NIL".to_string();
    }

    let mut out = String::from("(");
    for single in singles {
        let display = match &single.display_name {
            Some(name) if !name.is_empty() => quoted(name),
            _ => "NIL".to_string(),
        };
        let (mailbox, host) = match single.addr.split_once('@') {
            Some((mailbox, host)) => (quoted(mailbox), quoted(host)),
            // MAILER-DAEMON and friends have no host part.
            None => (quoted(&single.addr), "NIL".to_string()),
        };
        out.push_str(&format!("({display} NIL {mailbox} {host})"));
    }
    out.push(')');
    out
}

/// Content-Type parameters as `("NAME" "value" ...)`, or NIL.
fn body_parameters(node: &PartNode) -> String {
    if node.params.is_empty() {
        return "NIL".to_string();
    }
    let mut pieces = Vec::new();
    for (key, value) in &node.params {
        pieces.push(quoted(&key.to_uppercase()));
        pieces.push(quoted(value));
    }
    format!("({})", pieces.join(" "))
}

/// `("TYPE" ("NAME" "value" ...))` from Content-Disposition, or NIL.
fn body_disposition(node: &PartNode) -> String {
    let Some(value) = node.header("content-disposition") else {
        return "NIL".to_string();
    };

    let parsed = mailparse::parse_content_disposition(value);
    let kind = match parsed.disposition {
        mailparse::DispositionType::Inline => "INLINE".to_string(),
        mailparse::DispositionType::Attachment => "ATTACHMENT".to_string(),
        mailparse::DispositionType::FormData => "FORM-DATA".to_string(),
        mailparse::DispositionType::Extension(ref other) => other.to_uppercase(),
    };

    if parsed.params.is_empty() {
        format!("({} NIL)", quoted(&kind))
    } else {
        let mut pieces = Vec::new();
        for (key, value) in &parsed.params {
            pieces.push(format!("{} {}", quoted(&key.to_uppercase()), quoted(value)));
        }
        format!("({} ({}))", quoted(&kind), pieces.join(" "))
    }
}

/// Body language from any `*-language` headers, or NIL.
fn body_language(node: &PartNode) -> String {
    let mut languages = Vec::new();
    for (name, value) in node.headers() {
        if !name.to_lowercase().ends_with("-language") {
            continue;
        }
        let separator = if value.contains(',') { ',' } else { ';' };
        languages.extend(value.split(separator).map(|v| v.trim().to_string()));
    }

    match languages.len() {
        0 => "NIL".to_string(),
        1 => quoted(&languages[0]),
        _ => format!(
            "({})",
            languages
                .iter()
                .map(|language| quoted(language))
                .collect::<Vec<_>>()
                .join(" ")
        ),
    }
}

fn body_location(node: &PartNode) -> String {
    nil_or_quoted(node.header("content-location"))
}

/// The BODYSTRUCTURE of a part. With `extension_data` false this is the
/// `BODY` form: the same structure cut off before the extension fields.
pub fn bodystructure(message: &Message, node: &PartNode, extension_data: bool) -> String {
    if node.is_multipart() {
        let subparts: String = node
            .children
            .iter()
            .map(|child| bodystructure(message, child, extension_data))
            .collect();

        if !extension_data {
            return format!("({} {})", subparts, quoted(&node.subtype));
        }
        return format!(
            "({} {} {} {} {} {})",
            subparts,
            quoted(&node.subtype),
            body_parameters(node),
            body_disposition(node),
            body_language(node),
            body_location(node),
        );
    }

    let mut fields = Vec::new();
    fields.push(quoted(&node.maintype));
    fields.push(quoted(&node.subtype));
    fields.push(body_parameters(node));
    // Body id and description; nothing sets these.
    fields.push("NIL".to_string());
    fields.push("NIL".to_string());
    fields.push(match &node.encoding {
        Some(encoding) => quoted(&encoding.to_uppercase()),
        None => quoted("7bit"),
    });
    fields.push(message.body_slice(node).len().to_string());

    if node.content_type() == "message/rfc822" {
        if let Some(embedded) = &node.embedded {
            fields.push(envelope(embedded));
            fields.push(bodystructure(message, embedded, extension_data));
        } else {
            fields.push("NIL".to_string());
            fields.push("NIL".to_string());
        }
        fields.push(node.body_lines(message).to_string());
    } else if node.maintype == "text" {
        fields.push(node.body_lines(message).to_string());
    }

    if extension_data {
        // MD5 first; never computed.
        fields.push("NIL".to_string());
        fields.push(body_disposition(node));
        fields.push(body_language(node));
        fields.push(body_location(node));
    }

    format!("({})", fields.join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    const SIMPLE: &[u8] = b"Date: Mon, 7 Feb 1994 21:52:25 -0800\r\n\
From: Fred Foobar <foobar@Blurdybloop.COM>\r\n\
Subject: afternoon meeting\r\n\
To: mooch@owatagu.siam.edu\r\n\
Message-Id: <B27397-0100000@Blurdybloop.COM>\r\n\
MIME-Version: 1.0\r\n\
Content-Type: TEXT/PLAIN; CHARSET=US-ASCII\r\n\
\r\n\
Hello Joe, do you think we can meet at 3:30 tomorrow?\r\n";

    fn context(message: &Message) -> FetchContext {
        FetchContext {
            message,
            msn: 1,
            uid: 7,
            flags: vec![Flag::Recent, Flag::Seen],
            internal_date: Local.timestamp_opt(1_046_000_000, 0).unwrap(),
        }
    }

    #[test]
    fn flags_uid_size() {
        let message = Message::parse(SIMPLE).unwrap();
        let ctx = context(&message);

        assert_eq!(
            render(&ctx, &FetchAttribute::Flags).unwrap(),
            b"FLAGS (\\Recent \\Seen)".to_vec()
        );
        assert_eq!(
            render(&ctx, &FetchAttribute::Uid).unwrap(),
            b"UID 7".to_vec()
        );
        assert_eq!(
            render(&ctx, &FetchAttribute::Rfc822Size).unwrap(),
            format!("RFC822.SIZE {}", SIMPLE.len()).into_bytes()
        );
    }

    #[test]
    fn body_section_round_trips_size() {
        let message = Message::parse(SIMPLE).unwrap();
        let full = section_bytes(&message, &None).unwrap();
        assert_eq!(full.len(), message.size());
        assert_eq!(full, SIMPLE);
    }

    #[test]
    fn envelope_of_rfc3501_example() {
        let message = Message::parse(SIMPLE).unwrap();
        assert_eq!(
            envelope(message.root()),
            "(\"Mon, 7 Feb 1994 21:52:25 -0800\" \"afternoon meeting\" \
((\"Fred Foobar\" NIL \"foobar\" \"Blurdybloop.COM\")) \
((\"Fred Foobar\" NIL \"foobar\" \"Blurdybloop.COM\")) \
((\"Fred Foobar\" NIL \"foobar\" \"Blurdybloop.COM\")) \
((NIL NIL \"mooch\" \"owatagu.siam.edu\")) NIL NIL NIL \
\"<B27397-0100000@Blurdybloop.COM>\")"
        );
    }

    #[test]
    fn bodystructure_of_simple_text() {
        let message = Message::parse(SIMPLE).unwrap();
        let body = message.body_slice(message.root()).len();
        assert_eq!(
            bodystructure(&message, message.root(), true),
            format!(
                "(\"text\" \"plain\" (\"CHARSET\" \"US-ASCII\") NIL NIL \"7bit\" {body} 1 NIL NIL NIL NIL)"
            )
        );
        // The BODY form is the same structure without the extension fields.
        assert_eq!(
            bodystructure(&message, message.root(), false),
            format!(
                "(\"text\" \"plain\" (\"CHARSET\" \"US-ASCII\") NIL NIL \"7bit\" {body} 1)"
            )
        );
    }

    #[test]
    fn header_fields_subsetting() {
        let message = Message::parse(SIMPLE).unwrap();

        let bytes = section_bytes(
            &message,
            &Some(Section::HeaderFields(
                None,
                vec!["SUBJECT".to_string(), "FROM".to_string()],
            )),
        )
        .unwrap();
        assert_eq!(
            bytes,
            b"From: Fred Foobar <foobar@Blurdybloop.COM>\r\nSubject: afternoon meeting\r\n\r\n"
                .to_vec()
        );

        let bytes = section_bytes(
            &message,
            &Some(Section::HeaderFieldsNot(
                None,
                vec![
                    "DATE".to_string(),
                    "FROM".to_string(),
                    "TO".to_string(),
                    "MESSAGE-ID".to_string(),
                    "MIME-VERSION".to_string(),
                    "CONTENT-TYPE".to_string(),
                ],
            )),
        )
        .unwrap();
        assert_eq!(bytes, b"Subject: afternoon meeting\r\n\r\n".to_vec());
    }

    #[test]
    fn text_and_header_sections() {
        let message = Message::parse(SIMPLE).unwrap();

        let header = section_bytes(&message, &Some(Section::Header(None))).unwrap();
        assert!(header.starts_with(b"Date: "));
        assert!(header.ends_with(b"\r\n\r\n"));

        let text = section_bytes(&message, &Some(Section::Text(None))).unwrap();
        assert_eq!(
            text,
            b"Hello Joe, do you think we can meet at 3:30 tomorrow?\r\n".to_vec()
        );
        assert_eq!(header.len() + text.len(), message.size());
    }

    #[test]
    fn partial_slices() {
        let message = Message::parse(SIMPLE).unwrap();
        let ctx = context(&message);

        let rendered = render(
            &ctx,
            &FetchAttribute::BodyExt {
                section: Some(Section::Text(None)),
                partial: Some((6, 3)),
                peek: true,
            },
        )
        .unwrap();
        assert_eq!(rendered, b"BODY[TEXT]<6> {3}\r\nJoe".to_vec());

        // Offset beyond the end yields an empty literal.
        let rendered = render(
            &ctx,
            &FetchAttribute::BodyExt {
                section: Some(Section::Text(None)),
                partial: Some((100_000, 10)),
                peek: true,
            },
        )
        .unwrap();
        assert_eq!(rendered, b"BODY[TEXT]<100000> {0}\r\n".to_vec());
    }

    const MULTIPART: &[u8] = b"From: alice@example.com\r\n\
To: bob@example.com\r\n\
Subject: report\r\n\
MIME-Version: 1.0\r\n\
Content-Type: multipart/mixed; boundary=\"xyz\"\r\n\
\r\n\
--xyz\r\n\
Content-Type: text/plain; charset=\"us-ascii\"\r\n\
\r\n\
see attached\r\n\
--xyz\r\n\
Content-Type: application/octet-stream; name=\"data.bin\"\r\n\
Content-Disposition: attachment; filename=\"data.bin\"\r\n\
Content-Transfer-Encoding: base64\r\n\
\r\n\
AAEC\r\n\
--xyz--\r\n";

    #[test]
    fn multipart_bodystructure_shape() {
        let message = Message::parse(MULTIPART).unwrap();
        let rendered = bodystructure(&message, message.root(), true);

        assert!(rendered.starts_with("((\"text\" \"plain\""));
        assert!(rendered.contains("(\"application\" \"octet-stream\""));
        assert!(rendered.contains("\"BASE64\""));
        assert!(rendered.contains("(\"ATTACHMENT\" (\"FILENAME\" \"data.bin\"))"));
        assert!(rendered.ends_with("\"mixed\" (\"BOUNDARY\" \"xyz\") NIL NIL NIL)"));

        // BODY drops all extension data.
        let body_form = bodystructure(&message, message.root(), false);
        assert!(body_form.ends_with("\"mixed\")"));
        assert!(!body_form.contains("ATTACHMENT"));
    }

    #[test]
    fn numeric_sections() {
        let message = Message::parse(MULTIPART).unwrap();

        let bytes =
            section_bytes(&message, &Some(Section::Part(Part(vec![1])))).unwrap();
        assert_eq!(bytes, b"see attached".to_vec());

        let bytes =
            section_bytes(&message, &Some(Section::Mime(Part(vec![2])))).unwrap();
        assert!(bytes.starts_with(b"Content-Type: application/octet-stream"));
        assert!(bytes.ends_with(b"\r\n\r\n"));

        // Section 1 of a flat message is its body.
        let flat = Message::parse(SIMPLE).unwrap();
        let bytes = section_bytes(&flat, &Some(Section::Part(Part(vec![1])))).unwrap();
        assert_eq!(
            bytes,
            b"Hello Joe, do you think we can meet at 3:30 tomorrow?\r\n".to_vec()
        );
        // ... but section 2 of it does not exist.
        assert!(section_bytes(&flat, &Some(Section::Part(Part(vec![2])))).is_err());
    }
}
