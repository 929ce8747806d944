//! An IMAP4rev1 server engine for MH mail stores.
//!
//! The engine serves one user: it maps the directories and numbered
//! message files of an MH store to IMAP mailboxes with stable UIDs,
//! notices external mutation (delivery agents, other MH readers) by mtime
//! and reconciles it into the protocol's unsolicited responses, and speaks
//! the `IMAP4rev1 IDLE ID UNSELECT UIDPLUS LITERAL+ CHILDREN` command set
//! over any `AsyncRead + AsyncWrite` byte stream.
//!
//! TLS termination, authentication, and process management are the
//! embedding program's business: hand [`run_session`] an
//! already-authenticated stream and the user's MH root, or keep a
//! [`UserServer`] around yourself and attach any number of concurrent
//! sessions to it with [`client::run_session`].

pub mod cache;
pub mod client;
pub mod codec;
pub mod config;
pub mod db;
pub mod error;
pub mod fetch;
pub mod mbox;
pub mod message;
pub mod mh;
pub mod parse;
pub mod search;
pub mod server;
pub mod types;

use std::{path::PathBuf, sync::Arc};

use tokio::io::{AsyncRead, AsyncWrite};

pub use config::Config;
pub use error::{Error, Result};
pub use server::UserServer;

/// Serve a single authenticated session over `stream` against the MH
/// store at `mh_root`, returning when the client logs out or disconnects.
pub async fn run_session<S>(stream: S, mh_root: impl Into<PathBuf>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let server = UserServer::new(Config::new(mh_root)).await?;
    client::run_session(server, stream).await
}

/// Convenience wrapper: build the per-user server for a configuration and
/// hand out the shared handle sessions attach to.
pub async fn user_server(config: Config) -> Result<Arc<UserServer>> {
    UserServer::new(config).await
}
