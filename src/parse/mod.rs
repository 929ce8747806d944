//! nom parsers for the formal syntax of the commands this server accepts
//! ([RFC 3501 section 9](https://datatracker.ietf.org/doc/html/rfc3501#section-9)).
//!
//! The session layer has already resolved `{N}` / `{N+}` literal
//! continuations, so every parser here sees one complete command ending in
//! CRLF. Each parser function carries its ABNF production as a doc comment.

pub mod command;
pub mod core;
pub mod datetime;
pub mod fetch_att;
pub mod search;
pub mod sequence;

pub use command::parse_command;
