//! Owned representation of a parsed message.
//!
//! Everything an IMAP client is told about a message (sizes, sections,
//! line counts) is computed over the CRLF-serialised form, whatever the
//! on-disk bytes use. A [`Message`] therefore normalises once at parse
//! time and keeps offsets into that canonical buffer, so section extraction
//! is slicing, not re-serialisation. Instances are owned (no borrows into
//! the store) so the message cache can hold them.

use mailparse::{MailHeaderMap, MailParseError, ParsedMail};

use crate::types::Part;

/// The header recording a message's permanent identity:
/// `X-asimapd-uid: <uid-validity:010>.<uid:010>`, inserted at the end of
/// the header block.
pub const UID_HEADER: &str = "X-asimapd-uid";

#[derive(Debug, Clone)]
pub struct Message {
    /// Full message, CRLF line endings.
    raw: Vec<u8>,
    root: PartNode,
}

/// One MIME part. Offsets index [`Message::raw`].
#[derive(Debug, Clone)]
pub struct PartNode {
    start: usize,
    /// First byte after the part's blank line; equals `end` when the part
    /// has no body.
    body_start: usize,
    end: usize,
    /// Header (name, unfolded raw value) pairs in original order.
    headers: Vec<(String, String)>,
    pub maintype: String,
    pub subtype: String,
    /// Content-Type parameters in declared order.
    pub params: Vec<(String, String)>,
    /// `Content-Transfer-Encoding`, if declared.
    pub encoding: Option<String>,
    /// Transfer-decoded payload; leaves only.
    decoded: Option<Vec<u8>>,
    /// Sub-parts of a `multipart/*` part.
    pub children: Vec<PartNode>,
    /// The message inside a `message/rfc822` part.
    pub embedded: Option<Box<PartNode>>,
}

impl Message {
    pub fn parse(bytes: &[u8]) -> Result<Message, MailParseError> {
        let raw = normalize_crlf(bytes);
        let parsed = mailparse::parse_mail(&raw)?;
        let root = build_node(&raw, 0, &parsed)?;
        Ok(Message { raw, root })
    }

    /// The CRLF-serialised message; `RFC822.SIZE` is its length and
    /// `BODY[]` its content.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn size(&self) -> usize {
        self.raw.len()
    }

    pub fn root(&self) -> &PartNode {
        &self.root
    }

    /// Resolve a numeric section path (1-indexed at each level).
    ///
    /// Returns `None` for a path into parts that do not exist. The
    /// IMAP quirk that `[1]` addresses a non-multipart message's own body
    /// is handled by the fetch engine, not here.
    pub fn find_part(&self, path: &Part) -> Option<&PartNode> {
        let mut node = &self.root;
        for &index in &path.0 {
            let index = index as usize;
            if !node.children.is_empty() {
                node = node.children.get(index - 1)?;
            } else if let Some(embedded) = &node.embedded {
                // Descending into message/rfc822 addresses the embedded
                // message's parts.
                let inner = embedded.as_ref();
                if !inner.children.is_empty() {
                    node = inner.children.get(index - 1)?;
                } else if index == 1 {
                    node = inner;
                } else {
                    return None;
                }
            } else if index == 1 {
                // Section 1 of a non-multipart is the part itself.
            } else {
                return None;
            }
        }
        Some(node)
    }

    pub fn part_slice(&self, part: &PartNode) -> &[u8] {
        &self.raw[part.start..part.end]
    }

    pub fn body_slice(&self, part: &PartNode) -> &[u8] {
        &self.raw[part.body_start..part.end]
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.root.headers
    }

    /// First value of the named header on the top-level message,
    /// case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.root.header(name)
    }
}

impl PartNode {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(header, _)| header.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn is_multipart(&self) -> bool {
        self.maintype == "multipart"
    }

    pub fn content_type(&self) -> String {
        format!("{}/{}", self.maintype, self.subtype)
    }

    /// Transfer-decoded payload (leaves only); multiparts yield nothing.
    pub fn decoded(&self) -> Option<&[u8]> {
        self.decoded.as_deref()
    }

    /// Lines in the body, the way text line counts are reported.
    pub fn body_lines(&self, message: &Message) -> usize {
        let body = message.body_slice(self);
        if body.is_empty() {
            return 0;
        }
        let newlines = body.iter().filter(|byte| **byte == b'\n').count();
        if body.ends_with(b"\n") {
            newlines
        } else {
            newlines + 1
        }
    }
}

fn build_node(
    base: &[u8],
    base_offset: usize,
    parsed: &ParsedMail,
) -> Result<PartNode, MailParseError> {
    let start = offset_of(base, parsed.raw_bytes) + base_offset;
    let end = start + parsed.raw_bytes.len();
    let body_start = start
        + find_body_start(parsed.raw_bytes).unwrap_or(parsed.raw_bytes.len());

    let headers = parsed
        .headers
        .iter()
        .map(|header| {
            (
                header.get_key(),
                unfold(&String::from_utf8_lossy(header.get_value_raw())),
            )
        })
        .collect();

    let mimetype = parsed.ctype.mimetype.to_lowercase();
    let (maintype, subtype) = mimetype
        .split_once('/')
        .map(|(main, sub)| (main.to_string(), sub.to_string()))
        .unwrap_or_else(|| (mimetype.clone(), String::new()));

    // Parameters as actually declared; a defaulted charset must not show
    // up in BODYSTRUCTURE.
    let params = parsed
        .headers
        .get_first_value("content-type")
        .map(|value| parse_header_params(&value))
        .unwrap_or_default();

    let encoding = parsed
        .headers
        .get_first_value("content-transfer-encoding")
        .map(|value| value.trim().to_string());

    let mut children = Vec::new();
    let mut embedded = None;
    let mut decoded = None;

    if maintype == "multipart" {
        for subpart in &parsed.subparts {
            children.push(build_node(base, base_offset, subpart)?);
        }
    } else if mimetype == "message/rfc822" {
        // mailparse does not descend into embedded messages; parse the
        // body slice and shift its offsets into our coordinate space.
        let body = &base[body_start - base_offset..end - base_offset];
        let inner = mailparse::parse_mail(body)?;
        embedded = Some(Box::new(build_node(body, body_start, &inner)?));
    } else {
        decoded = Some(parsed.get_body_raw()?);
    }

    Ok(PartNode {
        start,
        body_start,
        end,
        headers,
        maintype,
        subtype,
        params,
        encoding,
        decoded,
        children,
        embedded,
    })
}

/// `key=value` parameters after the first `;` of a structured header.
fn parse_header_params(value: &str) -> Vec<(String, String)> {
    let mut params = Vec::new();
    for segment in value.split(';').skip(1) {
        let Some((key, value)) = segment.split_once('=') else {
            continue;
        };
        let value = value.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .unwrap_or(value);
        params.push((key.trim().to_string(), value.to_string()));
    }
    params
}

fn offset_of(base: &[u8], slice: &[u8]) -> usize {
    slice.as_ptr() as usize - base.as_ptr() as usize
}

/// Offset of the first body byte (just past the blank line), if any.
fn find_body_start(part: &[u8]) -> Option<usize> {
    if part.starts_with(b"\r\n") {
        return Some(2);
    }
    part.windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|position| position + 4)
}

/// Normalise every line ending to CRLF.
pub fn normalize_crlf(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len() + bytes.len() / 32);
    let mut previous = 0u8;
    for &byte in bytes {
        if byte == b'\n' && previous != b'\r' {
            out.push(b'\r');
        }
        out.push(byte);
        previous = byte;
    }
    out
}

/// Collapse header folding whitespace into single spaces.
fn unfold(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut in_fold = false;
    for ch in value.chars() {
        match ch {
            '\r' | '\n' => in_fold = true,
            ' ' | '\t' if in_fold => {}
            _ => {
                if in_fold {
                    out.push(' ');
                    in_fold = false;
                }
                out.push(ch);
            }
        }
    }
    out
}

/// Pull `(uid_validity, uid)` out of the UID header in a message's header
/// block, operating on raw on-disk bytes. `None` if absent or mangled.
pub fn parse_uid_header(bytes: &[u8]) -> Option<(u32, u32)> {
    let prefix = format!("{}:", UID_HEADER.to_lowercase());

    for line in header_block_lines(bytes) {
        let lowered = line.to_ascii_lowercase();
        if let Some(value) = String::from_utf8_lossy(&lowered)
            .strip_prefix(&prefix)
            .map(str::to_string)
        {
            let value = value.trim().to_string();
            let (uid_vv, uid) = value.split_once('.')?;
            return Some((uid_vv.parse().ok()?, uid.parse().ok()?));
        }
    }
    None
}

/// Rewrite the message bytes so the header block ends with the given UID
/// header (replacing any previous one). Line-ending style of the original
/// is preserved.
pub fn stamp_uid_header(bytes: &[u8], uid_vv: u32, uid: u32) -> Vec<u8> {
    let eol: &[u8] = match bytes.iter().position(|byte| *byte == b'\n') {
        Some(position) if position > 0 && bytes[position - 1] == b'\r' => b"\r\n",
        Some(_) => b"\n",
        None => b"\r\n",
    };

    let header_line = format!("{UID_HEADER}: {uid_vv:010}.{uid:010}");
    let prefix = format!("{}:", UID_HEADER.to_lowercase());

    let mut out = Vec::with_capacity(bytes.len() + header_line.len() + 2);
    let mut rest = bytes;
    let mut in_headers = true;

    while in_headers {
        let (line, remainder, terminated) = next_line(rest);
        if line.is_empty() && terminated {
            // Blank line: end of headers. Insert our stamp before it.
            out.extend_from_slice(header_line.as_bytes());
            out.extend_from_slice(eol);
            in_headers = false;
            out.extend_from_slice(rest);
            break;
        }
        if !terminated && remainder.is_empty() {
            // Header block runs to EOF (no body).
            if !line.to_ascii_lowercase().starts_with(prefix.as_bytes()) {
                out.extend_from_slice(line);
                if !line.is_empty() {
                    out.extend_from_slice(eol);
                }
            }
            out.extend_from_slice(header_line.as_bytes());
            out.extend_from_slice(eol);
            break;
        }

        if !line.to_ascii_lowercase().starts_with(prefix.as_bytes()) {
            out.extend_from_slice(line);
            out.extend_from_slice(eol);
        }
        rest = remainder;
    }

    out
}

/// Iterate the lines of the header block (up to the first blank line).
fn header_block_lines(bytes: &[u8]) -> impl Iterator<Item = &[u8]> {
    let mut rest = bytes;
    let mut done = false;
    std::iter::from_fn(move || {
        if done || rest.is_empty() {
            return None;
        }
        let (line, remainder, _) = next_line(rest);
        rest = remainder;
        if line.is_empty() {
            done = true;
            return None;
        }
        Some(line)
    })
}

/// Split off one line (without its terminator). Returns
/// `(line, rest, saw_terminator)`.
fn next_line(bytes: &[u8]) -> (&[u8], &[u8], bool) {
    match bytes.iter().position(|byte| *byte == b'\n') {
        Some(position) => {
            let line = if position > 0 && bytes[position - 1] == b'\r' {
                &bytes[..position - 1]
            } else {
                &bytes[..position]
            };
            (line, &bytes[position + 1..], true)
        }
        None => (bytes, &[], false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const SIMPLE: &[u8] = b"From: alice@example.com\r\n\
To: bob@example.com\r\n\
Subject: hello\r\n\
\r\n\
Hi Bob,\r\n\
this is a test.\r\n";

    const MULTIPART: &[u8] = b"From: alice@example.com\r\n\
Subject: report\r\n\
MIME-Version: 1.0\r\n\
Content-Type: multipart/mixed; boundary=\"xyz\"\r\n\
\r\n\
--xyz\r\n\
Content-Type: text/plain; charset=\"us-ascii\"\r\n\
\r\n\
see attached\r\n\
--xyz\r\n\
Content-Type: text/html\r\n\
Content-Transfer-Encoding: 7bit\r\n\
\r\n\
<p>see attached</p>\r\n\
--xyz--\r\n";

    #[test]
    fn bare_lf_input_is_normalised() {
        let message = Message::parse(b"Subject: x\nFrom: y\n\nbody\nline two\n").unwrap();
        assert!(message.raw().starts_with(b"Subject: x\r\nFrom: y\r\n\r\n"));
        assert_eq!(message.size(), message.raw().len());
        assert_eq!(
            message.size(),
            b"Subject: x\r\nFrom: y\r\n\r\nbody\r\nline two\r\n".len()
        );
    }

    #[test]
    fn simple_message_shape() {
        let message = Message::parse(SIMPLE).unwrap();
        assert_eq!(message.header("subject"), Some("hello"));
        assert_eq!(message.root().content_type(), "text/plain");
        assert_eq!(
            message.body_slice(message.root()),
            b"Hi Bob,\r\nthis is a test.\r\n"
        );
        assert_eq!(message.root().body_lines(&message), 2);
    }

    #[test]
    fn multipart_children_and_slices() {
        let message = Message::parse(MULTIPART).unwrap();
        let root = message.root();
        assert!(root.is_multipart());
        assert_eq!(root.subtype, "mixed");
        assert_eq!(root.children.len(), 2);

        let first = message.find_part(&Part(vec![1])).unwrap();
        assert_eq!(first.content_type(), "text/plain");
        assert_eq!(message.body_slice(first), b"see attached");

        let second = message.find_part(&Part(vec![2])).unwrap();
        assert_eq!(second.content_type(), "text/html");
        assert!(message
            .part_slice(second)
            .starts_with(b"Content-Type: text/html"));

        assert!(message.find_part(&Part(vec![3])).is_none());
    }

    #[test]
    fn section_one_of_flat_message() {
        let message = Message::parse(SIMPLE).unwrap();
        let part = message.find_part(&Part(vec![1])).unwrap();
        assert_eq!(part.content_type(), "text/plain");
        assert!(message.find_part(&Part(vec![2])).is_none());
    }

    #[test]
    fn embedded_rfc822() {
        let outer: &[u8] = b"From: forwarder@example.com\r\n\
Content-Type: message/rfc822\r\n\
\r\n\
From: original@example.com\r\n\
Subject: inner\r\n\
\r\n\
inner body\r\n";

        let message = Message::parse(outer).unwrap();
        let root = message.root();
        assert_eq!(root.content_type(), "message/rfc822");
        let inner = root.embedded.as_deref().unwrap();
        assert_eq!(inner.header("subject"), Some("inner"));
        assert_eq!(message.body_slice(inner), b"inner body\r\n");
    }

    #[test]
    fn folded_headers_unfold() {
        let message = Message::parse(
            b"Subject: a very\r\n long subject\r\nFrom: x\r\n\r\nbody\r\n",
        )
        .unwrap();
        assert_eq!(message.header("subject"), Some("a very long subject"));
    }

    #[test]
    fn uid_header_round_trip() {
        let stamped = stamp_uid_header(SIMPLE, 3, 42);
        assert_eq!(parse_uid_header(&stamped), Some((3, 42)));

        // Re-stamping replaces rather than duplicates.
        let restamped = stamp_uid_header(&stamped, 3, 43);
        assert_eq!(parse_uid_header(&restamped), Some((3, 43)));
        let occurrences = String::from_utf8_lossy(&restamped)
            .matches("X-asimapd-uid")
            .count();
        assert_eq!(occurrences, 1);

        // Body is untouched.
        assert!(restamped.ends_with(b"Hi Bob,\r\nthis is a test.\r\n"));
    }

    #[test]
    fn uid_header_keeps_line_ending_style() {
        let lf_message = b"From: x\nSubject: y\n\nbody\n";
        let stamped = stamp_uid_header(lf_message, 1, 7);
        assert!(!stamped.windows(2).any(|w| w == b"\r\n"));
        assert_eq!(parse_uid_header(&stamped), Some((1, 7)));
    }

    #[test]
    fn missing_or_mangled_uid_header() {
        assert_eq!(parse_uid_header(SIMPLE), None);
        let mangled = stamp_uid_header(SIMPLE, 1, 1);
        let mangled = String::from_utf8(mangled)
            .unwrap()
            .replace("0000000001.0000000001", "garbage");
        assert_eq!(parse_uid_header(mangled.as_bytes()), None);
    }
}
