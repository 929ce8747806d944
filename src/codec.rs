//! Wire framing between the socket and the command parser.
//!
//! The protocol receiver is always in one of two states: reading a line, or
//! reading a counted literal followed by more line data. [`CommandCodec`]
//! runs that state machine over a [`BytesMut`] and hands the session either
//! a fully-buffered command line (all literals resolved) or an action it
//! must take first (`+ Ready for more input` for a synchronising literal).

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{error::ParseError, parse::parse_command, types::Command};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandCodec {
    state: State,
    /// Offset just past the last resolved literal. The `{N}` announcement
    /// scan must not look inside literal octets, or a message body ending
    /// in `{5}` would read as another literal.
    literal_end: usize,
    max_literal_size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum State {
    /// Scanning for the CRLF that ends the current line.
    ReadLine { to_consume_acc: usize },
    /// Accumulating the announced number of literal octets.
    ReadLiteral { to_consume_acc: usize, needed: u32 },
}

/// What the decoder produced for the session loop.
#[derive(Debug, PartialEq, Eq)]
pub enum Event {
    Command(Command),
    /// The line announced a synchronising `{N}` literal; send
    /// `+ Ready for more input` and keep reading.
    SendLiteralAck(u32),
    /// The announced literal exceeds the configured maximum; send a `BAD`
    /// and drop the line.
    SendLiteralReject(u32),
    /// The line did not parse; the tag (if one could be salvaged) lets the
    /// session answer with a tagged `BAD`.
    ParseFailed { tag: Option<String>, error: ParseError },
}

#[derive(Debug)]
pub enum CodecError {
    Io(std::io::Error),
    /// A bare LF without a preceding CR.
    NotCrLf,
    /// `{...}` that is not a number.
    BadLiteral,
}

impl From<std::io::Error> for CodecError {
    fn from(error: std::io::Error) -> Self {
        CodecError::Io(error)
    }
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            CodecError::Io(error) => write!(f, "i/o error: {error}"),
            CodecError::NotCrLf => write!(f, "line not terminated with CRLF"),
            CodecError::BadLiteral => write!(f, "malformed literal"),
        }
    }
}

impl std::error::Error for CodecError {}

impl CommandCodec {
    pub fn new(max_literal_size: usize) -> CommandCodec {
        CommandCodec {
            state: State::ReadLine { to_consume_acc: 0 },
            literal_end: 0,
            max_literal_size,
        }
    }
}

impl Decoder for CommandCodec {
    type Item = Event;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Event>, CodecError> {
        loop {
            match self.state {
                State::ReadLine {
                    ref mut to_consume_acc,
                } => {
                    match find_crlf_inclusive(*to_consume_acc, src) {
                        Ok(Some(to_consume)) => {
                            *to_consume_acc += to_consume;

                            let scan_from = self.literal_end;
                            match parse_literal_announcement(
                                &src[scan_from..*to_consume_acc - 2],
                            ) {
                                // Complete command line; hand it to the parser.
                                Ok(None) => {
                                    let line = &src[..*to_consume_acc];
                                    let event = match parse_command(line) {
                                        Ok(command) => Event::Command(command),
                                        Err(error) => Event::ParseFailed {
                                            tag: salvage_tag(line),
                                            error,
                                        },
                                    };

                                    src.advance(*to_consume_acc);
                                    self.state = State::ReadLine { to_consume_acc: 0 };
                                    self.literal_end = 0;

                                    return Ok(Some(event));
                                }
                                // Literal announced; keep the consumed line in
                                // the buffer and switch states.
                                Ok(Some((needed, sync))) => {
                                    if self.max_literal_size < needed as usize {
                                        src.advance(*to_consume_acc);
                                        self.state = State::ReadLine { to_consume_acc: 0 };
                                        self.literal_end = 0;

                                        return Ok(Some(Event::SendLiteralReject(needed)));
                                    }

                                    src.reserve(needed as usize);
                                    self.state = State::ReadLiteral {
                                        to_consume_acc: *to_consume_acc,
                                        needed,
                                    };

                                    if sync {
                                        return Ok(Some(Event::SendLiteralAck(needed)));
                                    }
                                    // LITERAL+: no continuation request, the
                                    // octets are already on their way.
                                }
                                Err(error) => {
                                    src.clear();
                                    self.state = State::ReadLine { to_consume_acc: 0 };
                                    self.literal_end = 0;

                                    return Err(error);
                                }
                            }
                        }
                        // More data needed.
                        Ok(None) => return Ok(None),
                        Err(error) => {
                            src.clear();
                            self.state = State::ReadLine { to_consume_acc: 0 };
                            self.literal_end = 0;

                            return Err(error);
                        }
                    }
                }
                State::ReadLiteral {
                    to_consume_acc,
                    needed,
                } => {
                    if to_consume_acc + needed as usize <= src.len() {
                        self.literal_end = to_consume_acc + needed as usize;
                        self.state = State::ReadLine {
                            to_consume_acc: to_consume_acc + needed as usize,
                        };
                    } else {
                        return Ok(None);
                    }
                }
            }
        }
    }
}

impl Encoder<&[u8]> for CommandCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: &[u8], dst: &mut BytesMut) -> Result<(), std::io::Error> {
        dst.extend_from_slice(item);
        Ok(())
    }
}

/// Find the CRLF ending the current line, skipping `skip` already-scanned
/// bytes. Returns the number of bytes up to and including the LF.
fn find_crlf_inclusive(skip: usize, buf: &BytesMut) -> Result<Option<usize>, CodecError> {
    match buf.iter().skip(skip).position(|byte| *byte == b'\n') {
        Some(position) => {
            if position == 0 || buf[skip + position - 1] != b'\r' {
                Err(CodecError::NotCrLf)
            } else {
                Ok(Some(position + 1))
            }
        }
        None => Ok(None),
    }
}

/// If `line` (without its CRLF) ends in `{N}` or `{N+}`, return the octet
/// count and whether the literal is synchronising.
fn parse_literal_announcement(line: &[u8]) -> Result<Option<(u32, bool)>, CodecError> {
    if line.is_empty() || line[line.len() - 1] != b'}' {
        return Ok(None);
    }

    let Some(open) = line.iter().rposition(|byte| *byte == b'{') else {
        return Ok(None);
    };

    let mut digits = &line[open + 1..line.len() - 1];
    let sync = if digits.last() == Some(&b'+') {
        digits = &digits[..digits.len() - 1];
        false
    } else {
        true
    };

    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return Err(CodecError::BadLiteral);
    }

    let number = std::str::from_utf8(digits)
        .expect("checked ascii digits")
        .parse::<u32>()
        .map_err(|_| CodecError::BadLiteral)?;

    Ok(Some((number, sync)))
}

/// Pull the leading tag out of an unparsable line so the `BAD` can still be
/// tagged.
fn salvage_tag(line: &[u8]) -> Option<String> {
    let line = std::str::from_utf8(line).ok()?;
    let tag = line.split_whitespace().next()?;
    if tag.is_empty() {
        None
    } else {
        Some(tag.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CommandBody;

    #[test]
    fn lines_across_reads() {
        let mut codec = CommandCodec::new(1024);
        let mut src = BytesMut::new();

        let feeds: [(&[u8], Option<Event>); 5] = [
            (b"", None),
            (b"a noop", None),
            (b"\r", None),
            (
                b"\n",
                Some(Event::Command(Command::new("a", CommandBody::Noop))),
            ),
            (b"", None),
        ];

        for (bytes, expected) in feeds {
            src.extend_from_slice(bytes);
            assert_eq!(codec.decode(&mut src).unwrap(), expected);
        }
    }

    #[test]
    fn synchronising_literal() {
        let mut codec = CommandCodec::new(1024);
        let mut src = BytesMut::new();

        src.extend_from_slice(b"a append inbox {11}\r\n");
        assert_eq!(
            codec.decode(&mut src).unwrap(),
            Some(Event::SendLiteralAck(11))
        );

        // Literal octets trickling in.
        src.extend_from_slice(b"From:");
        assert_eq!(codec.decode(&mut src).unwrap(), None);
        src.extend_from_slice(b" x\r\n\r\n\r\n");

        match codec.decode(&mut src).unwrap() {
            Some(Event::Command(command)) => match command.body {
                CommandBody::Append { message, .. } => {
                    assert_eq!(message, b"From: x\r\n\r\n")
                }
                other => panic!("unexpected body: {other:?}"),
            },
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn non_synchronising_literal() {
        let mut codec = CommandCodec::new(1024);
        let mut src = BytesMut::new();

        // LITERAL+: octets follow immediately, no ack event.
        src.extend_from_slice(b"a append inbox {11+}\r\nFrom: x\r\n\r\n\r\n");
        match codec.decode(&mut src).unwrap() {
            Some(Event::Command(command)) => {
                assert!(matches!(command.body, CommandBody::Append { .. }))
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn literal_octets_do_not_announce_literals() {
        let mut codec = CommandCodec::new(1024);
        let mut src = BytesMut::new();

        // The 9 message octets end in "{3}"; that must not start another
        // literal read.
        src.extend_from_slice(b"a append inbox {9}\r\n");
        assert_eq!(
            codec.decode(&mut src).unwrap(),
            Some(Event::SendLiteralAck(9))
        );
        src.extend_from_slice(b"body {3}\n\r\n");
        match codec.decode(&mut src).unwrap() {
            Some(Event::Command(command)) => match command.body {
                CommandBody::Append { message, .. } => {
                    assert_eq!(message, b"body {3}\n")
                }
                other => panic!("unexpected body: {other:?}"),
            },
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn oversized_literal() {
        let mut codec = CommandCodec::new(10);
        let mut src = BytesMut::new();

        src.extend_from_slice(b"a append inbox {4096}\r\n");
        assert_eq!(
            codec.decode(&mut src).unwrap(),
            Some(Event::SendLiteralReject(4096))
        );
    }

    #[test]
    fn parse_failures_are_events() {
        let mut codec = CommandCodec::new(1024);
        let mut src = BytesMut::new();

        src.extend_from_slice(b"a1 frobnicate\r\n");
        match codec.decode(&mut src).unwrap() {
            Some(Event::ParseFailed { tag, error }) => {
                assert_eq!(tag.as_deref(), Some("a1"));
                assert_eq!(error, ParseError::UnknownCommand("frobnicate".to_string()));
            }
            other => panic!("unexpected event: {other:?}"),
        }

        // The session keeps running afterwards.
        src.extend_from_slice(b"a2 noop\r\n");
        assert_eq!(
            codec.decode(&mut src).unwrap(),
            Some(Event::Command(Command::new("a2", CommandBody::Noop)))
        );
    }

    #[test]
    fn bare_lf_is_an_error() {
        let mut codec = CommandCodec::new(1024);
        let mut src = BytesMut::new();

        src.extend_from_slice(b"a noop\n");
        assert!(matches!(
            codec.decode(&mut src),
            Err(CodecError::NotCrLf)
        ));
    }
}
