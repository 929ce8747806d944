//! One authenticated client session: the command dispatcher and the
//! selected-mailbox state machine.
//!
//! The session owns the socket. Reads go through [`CommandCodec`]; writes
//! funnel through an unbounded channel drained by a writer task, which is
//! also where folders deliver unsolicited responses, so ordering within a
//! command falls out of channel FIFO.

use std::sync::Arc;

use futures::StreamExt;
use log::{debug, warn};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    sync::mpsc,
};
use tokio_util::codec::FramedRead;

use crate::{
    codec::{CodecError, CommandCodec, Event},
    error::{CommandError, Error, MailboxError},
    mbox::{render_uid_set, ClientHandle, Mailbox, Progress, QueuedCommand, ResyncOptions},
    server::UserServer,
    types::{Command, CommandBody, MailboxAttribute, MailboxName},
};

const CAPABILITIES: &str = "IMAP4REV1 IDLE ID UNSELECT UIDPLUS LITERAL+ CHILDREN";

/// Serve one already-authenticated connection until the client logs out
/// or the stream ends.
pub async fn run_session<S>(server: Arc<UserServer>, stream: S) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    server.session_started();
    let result = session_loop(&server, stream).await;
    server.session_ended();
    result
}

async fn session_loop<S>(server: &Arc<UserServer>, stream: S) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, mut write_half) = tokio::io::split(stream);
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();

    let writer = tokio::spawn(async move {
        while let Some(chunk) = rx.recv().await {
            if write_half.write_all(&chunk).await.is_err() {
                break;
            }
        }
        let _ = write_half.shutdown().await;
    });

    let handle = ClientHandle::new(server.next_client_id(), tx);
    let mut session = Session {
        server: server.clone(),
        handle: handle.clone(),
        selected: None,
        idle_tag: None,
        logged_out: false,
    };

    session
        .handle
        .push_line(format!("* OK [CAPABILITY {CAPABILITIES}] mhimapd ready"));

    let codec = CommandCodec::new(server.config().max_literal_size);
    let mut framed = FramedRead::new(read_half, codec);

    while let Some(event) = framed.next().await {
        match event {
            Ok(Event::Command(command)) => session.dispatch(command).await,
            Ok(Event::SendLiteralAck(_)) => {
                session.handle.push_line("+ Ready for more input");
            }
            Ok(Event::SendLiteralReject(size)) => {
                session
                    .handle
                    .push_line(format!("* BAD literal of {size} octets is too large"));
            }
            Ok(Event::ParseFailed { tag, error }) => {
                let tag = tag.unwrap_or_else(|| "*".to_string());
                session.handle.push_line(format!("{tag} BAD {error}"));
            }
            Err(CodecError::Io(error)) => {
                debug!("client#{}: read error: {error}", session.handle.id);
                break;
            }
            Err(error) => {
                session.handle.push_line(format!("* BAD {error}"));
            }
        }

        // Anything parked on a continuation queue gets a slice of time
        // after every read.
        server.process_command_queues().await;

        if session.logged_out || session.handle.is_dropped() {
            break;
        }
    }

    if let Some((mailbox, _)) = session.selected.take() {
        mailbox.unselect(session.handle.id).await;
    }
    session.handle.clear_pending_expunges();
    drop(session);
    drop(handle);

    let _ = writer.await;
    Ok(())
}

struct Session {
    server: Arc<UserServer>,
    handle: ClientHandle,
    selected: Option<(Arc<Mailbox>, bool)>,
    /// Tag of the in-flight IDLE, if the client is idling.
    idle_tag: Option<String>,
    logged_out: bool,
}

impl Session {
    async fn dispatch(&mut self, command: Command) {
        // While idling only DONE means anything.
        if let Some(idle_tag) = self.idle_tag.take() {
            if matches!(command.body, CommandBody::Done) {
                self.handle.set_idling(false);
                self.handle
                    .push_line(format!("{idle_tag} OK IDLE terminated"));
            } else {
                self.idle_tag = Some(idle_tag);
                self.handle.push_line("* BAD expected DONE");
            }
            return;
        }

        // The long-running verbs manage their own pending-expunge policy
        // and tagged responses.
        if matches!(
            command.body,
            CommandBody::Search { .. }
                | CommandBody::Fetch { .. }
                | CommandBody::Store { .. }
                | CommandBody::Copy { .. }
        ) {
            self.handle_selected_verb(command).await;
            return;
        }

        // Every other command permits (and therefore flushes) deferred
        // EXPUNGE responses.
        for line in self.handle.take_pending_expunges() {
            self.handle.push(line.into_bytes());
        }

        let result = self.handle_simple(&command).await;
        match result {
            Ok(Disposition::Complete(code)) => push_tagged_ok(&self.handle, &command, code),
            Ok(Disposition::NoResponse) => {}
            Err(error) => push_tagged_err(&self.handle, &command, &error),
        }
    }

    async fn handle_simple(
        &mut self,
        command: &Command,
    ) -> Result<Disposition, CommandError> {
        match &command.body {
            CommandBody::Capability => {
                self.handle.push_line(format!("* CAPABILITY {CAPABILITIES}"));
                Ok(Disposition::ok())
            }
            CommandBody::Noop => {
                if let Some((mailbox, _)) = &self.selected {
                    mailbox.resync(ResyncOptions::default()).await?;
                }
                Ok(Disposition::ok())
            }
            CommandBody::Id(_) => {
                self.handle.push_line(format!(
                    "* ID (\"name\" \"mhimapd\" \"version\" \"{}\" \"os\" \"{}\")",
                    env!("CARGO_PKG_VERSION"),
                    std::env::consts::OS,
                ));
                Ok(Disposition::ok())
            }
            CommandBody::Namespace => {
                self.handle.push_line("* NAMESPACE ((\"\" \"/\")) NIL NIL");
                Ok(Disposition::ok())
            }
            CommandBody::Logout => {
                self.handle.push_line("* BYE Logging out of mhimapd");
                self.logged_out = true;
                Ok(Disposition::ok())
            }
            CommandBody::Login { .. } | CommandBody::Authenticate { .. } => Err(
                CommandError::bad("client already is in the authenticated state"),
            ),
            CommandBody::Done => Err(CommandError::bad("DONE without IDLE")),

            CommandBody::Select { mailbox } => self.do_select(mailbox, false).await,
            CommandBody::Examine { mailbox } => self.do_select(mailbox, true).await,
            CommandBody::Create { mailbox } => {
                self.server.create_mailbox(mailbox).await?;
                Ok(Disposition::ok())
            }
            CommandBody::Delete { mailbox } => {
                self.server.delete_mailbox(mailbox).await?;
                Ok(Disposition::ok())
            }
            CommandBody::Rename { from, to } => {
                self.server.rename_mailbox(from, to).await?;
                Ok(Disposition::ok())
            }
            CommandBody::Subscribe { mailbox } => {
                let mailbox = self.server.get_mailbox(mailbox).await?;
                mailbox.set_subscribed(true).await?;
                Ok(Disposition::ok())
            }
            CommandBody::Unsubscribe { mailbox } => {
                let mailbox = self.server.get_mailbox(mailbox).await?;
                mailbox.set_subscribed(false).await?;
                Ok(Disposition::ok())
            }
            CommandBody::List { reference, pattern } => {
                self.do_list(reference, pattern, false).await
            }
            CommandBody::Lsub { reference, pattern } => {
                self.do_list(reference, pattern, true).await
            }
            CommandBody::Status {
                mailbox,
                attributes,
            } => {
                let name = mailbox.clone();
                let selected_here = self
                    .selected
                    .as_ref()
                    .map(|(selected, _)| selected.name() == name.as_str())
                    .unwrap_or(false);
                let mailbox = self.server.get_mailbox(&name).await?;
                if !selected_here {
                    mailbox.resync(ResyncOptions::default()).await?;
                }
                let line = mailbox.status_line(attributes).await;
                self.handle.push_line(format!(
                    "* STATUS {} ({line})",
                    render_mailbox_name(&name)
                ));
                Ok(Disposition::ok())
            }
            CommandBody::Append {
                mailbox,
                flags,
                date_time,
                message,
            } => {
                let mailbox = self.server.get_mailbox(mailbox).await.map_err(trycreate)?;
                let (uid_vv, uid) = mailbox.append(message, flags, *date_time).await?;
                Ok(Disposition::Complete(Some(format!(
                    "[APPENDUID {uid_vv} {uid}]"
                ))))
            }
            CommandBody::Idle => {
                self.handle.push_line("+ idling");
                self.handle.set_idling(true);
                self.idle_tag = Some(command.tag.clone());
                Ok(Disposition::NoResponse)
            }

            CommandBody::Check => {
                let (mailbox, _) = self.require_selected()?;
                mailbox
                    .resync(ResyncOptions {
                        optional: false,
                        ..ResyncOptions::default()
                    })
                    .await?;
                Ok(Disposition::ok())
            }
            CommandBody::Close => {
                let (mailbox, _) = self.require_selected()?;
                mailbox.close(self.handle.id).await?;
                self.selected = None;
                self.handle.clear_pending_expunges();
                Ok(Disposition::ok())
            }
            CommandBody::Unselect => {
                let (mailbox, _) = self.require_selected()?;
                mailbox.unselect(self.handle.id).await;
                self.selected = None;
                self.handle.clear_pending_expunges();
                Ok(Disposition::ok())
            }
            CommandBody::Expunge => {
                let (mailbox, read_only) = self.require_selected()?;
                if read_only {
                    return Err(CommandError::no("mailbox is read-only"));
                }
                mailbox.expunge(Some(&self.handle)).await?;
                Ok(Disposition::ok())
            }

            CommandBody::Search { .. }
            | CommandBody::Fetch { .. }
            | CommandBody::Store { .. }
            | CommandBody::Copy { .. } => unreachable!("handled by handle_selected_verb"),
        }
    }

    fn require_selected(&self) -> Result<(Arc<Mailbox>, bool), CommandError> {
        self.selected
            .clone()
            .ok_or_else(|| CommandError::no("no mailbox selected"))
    }

    async fn do_select(
        &mut self,
        name: &MailboxName,
        read_only: bool,
    ) -> Result<Disposition, CommandError> {
        // Whatever happens next, any previous selection ends here.
        if let Some((current, _)) = self.selected.take() {
            current.unselect(self.handle.id).await;
            self.handle.clear_pending_expunges();
        }

        let mailbox = self.server.get_mailbox(name).await?;
        let lines = mailbox.select(&self.handle, read_only).await?;
        for line in lines {
            self.handle.push_line(line);
        }
        self.selected = Some((mailbox, read_only));

        let code = if read_only {
            "[READ-ONLY]"
        } else {
            "[READ-WRITE]"
        };
        Ok(Disposition::Complete(Some(code.to_string())))
    }

    async fn do_list(
        &mut self,
        reference: &str,
        pattern: &str,
        lsub: bool,
    ) -> Result<Disposition, CommandError> {
        let verb = if lsub { "LSUB" } else { "LIST" };

        // An empty pattern just asks for the hierarchy delimiter.
        if pattern.is_empty() {
            self.handle
                .push_line(format!("* {verb} (\\Noselect) \"/\" \"\""));
            return Ok(Disposition::ok());
        }

        let listing = self
            .server
            .list_mailboxes(reference, pattern, lsub)
            .await?;
        for (name, attributes) in listing {
            let attributes = attributes
                .iter()
                .map(MailboxAttribute::to_string)
                .collect::<Vec<_>>()
                .join(" ");
            self.handle.push_line(format!(
                "* {verb} ({attributes}) \"/\" {}",
                quote_if_needed(&name)
            ));
        }
        Ok(Disposition::ok())
    }

    /// FETCH / STORE / SEARCH / COPY: possibly long-running, possibly
    /// queued behind earlier long-running commands.
    async fn handle_selected_verb(&mut self, mut command: Command) {
        let Some((mailbox, read_only)) = self.selected.clone() else {
            push_tagged_err(
                &self.handle,
                &command,
                &CommandError::no("no mailbox selected"),
            );
            return;
        };

        // Earlier commands are still in flight for this folder: keep
        // ordering by joining the back of the queue.
        if mailbox.has_queued_commands().await {
            mailbox
                .push_queued_command(QueuedCommand {
                    handle: self.handle.clone(),
                    command,
                    read_only,
                })
                .await;
            return;
        }

        match run_selected_verb(&self.server, &mailbox, &self.handle, read_only, &mut command)
            .await
        {
            Ok((Progress::Done, code)) => push_tagged_ok(&self.handle, &command, code),
            Ok((Progress::Yielded, _)) | Err(CommandError::Lock(_)) => {
                mailbox
                    .push_queued_command(QueuedCommand {
                        handle: self.handle.clone(),
                        command,
                        read_only,
                    })
                    .await;
            }
            Err(error) => push_tagged_err(&self.handle, &command, &error),
        }
    }
}

enum Disposition {
    Complete(Option<String>),
    NoResponse,
}

impl Disposition {
    fn ok() -> Disposition {
        Disposition::Complete(None)
    }
}

/// Execute one FETCH/STORE/SEARCH/COPY invocation (fresh or resumed from
/// the continuation queue), applying the pending-expunge rules and the
/// inconsistency retry policy.
pub(crate) async fn run_selected_verb(
    server: &Arc<UserServer>,
    mailbox: &Arc<Mailbox>,
    handle: &ClientHandle,
    read_only: bool,
    command: &mut Command,
) -> Result<(Progress, Option<String>), CommandError> {
    let uid_cmd = command.uid_command();
    match &command.body {
        // RFC 3501: no EXPUNGE may be delivered during these; with
        // expunges pending the msn numbering would lie, so refuse.
        CommandBody::Fetch { .. } | CommandBody::Store { .. } | CommandBody::Search { .. }
            if !uid_cmd =>
        {
            if handle.has_pending_expunges() {
                return Err(CommandError::no("There are pending EXPUNGEs."));
            }
        }
        // The UID variants (and COPY) permit them; flush first.
        _ => {
            for line in handle.take_pending_expunges() {
                handle.push(line.into_bytes());
            }
        }
    }

    match run_selected_verb_once(server, mailbox, handle, read_only, command).await {
        Err(CommandError::Inconsistent(reason)) => {
            // On-disk state stopped making sense; drop caches, rescan, and
            // give it one more chance before cutting the client loose.
            warn!(
                "{}: inconsistency ({reason}); clearing cache and retrying",
                mailbox.name()
            );
            mailbox.clear_cache_entries();
            if let Err(error) = mailbox
                .resync(ResyncOptions {
                    force: true,
                    optional: false,
                    ..ResyncOptions::default()
                })
                .await
            {
                handle.unceremonious_bye(&format!("unrecoverable mailbox state: {error}"));
                return Err(CommandError::no(error.to_string()));
            }

            match run_selected_verb_once(server, mailbox, handle, read_only, command).await {
                Err(CommandError::Inconsistent(reason)) => {
                    handle.unceremonious_bye(&format!(
                        "unrecoverable mailbox state: {reason}"
                    ));
                    Err(CommandError::no(reason))
                }
                other => other,
            }
        }
        other => other,
    }
}

async fn run_selected_verb_once(
    server: &Arc<UserServer>,
    mailbox: &Arc<Mailbox>,
    handle: &ClientHandle,
    read_only: bool,
    command: &mut Command,
) -> Result<(Progress, Option<String>), CommandError> {
    match &command.body {
        CommandBody::Search { charset, .. } => {
            if let Some(charset) = charset {
                if !matches!(charset.as_str(), "us-ascii" | "ascii" | "utf-8") {
                    return Err(CommandError::no(format!(
                        "[BADCHARSET (US-ASCII UTF-8)] {charset} is not supported"
                    )));
                }
            }
            mailbox
                .search(command, handle)
                .await
                .map(|progress| (progress, None))
        }
        CommandBody::Fetch { .. } => mailbox
            .fetch(command, handle, read_only)
            .await
            .map(|progress| (progress, None)),
        CommandBody::Store { .. } => mailbox
            .store(command, handle, read_only)
            .await
            .map(|progress| (progress, None)),
        CommandBody::Copy {
            mailbox: destination,
            ..
        } => {
            let destination = server.get_mailbox(destination).await.map_err(trycreate)?;
            let (src_uids, dst_uids) = mailbox.copy(command, &destination).await?;
            let code = if src_uids.is_empty() {
                None
            } else {
                Some(format!(
                    "[COPYUID {} {} {}]",
                    destination.uid_vv().await,
                    render_uid_set(&src_uids),
                    render_uid_set(&dst_uids)
                ))
            };
            Ok((Progress::Done, code))
        }
        _ => Err(CommandError::bad("not a selected-state command")),
    }
}

pub(crate) fn push_tagged_ok(handle: &ClientHandle, command: &Command, code: Option<String>) {
    if handle.is_dropped() {
        return;
    }
    let code = code.map(|code| format!("{code} ")).unwrap_or_default();
    handle.push_line(format!(
        "{} OK {code}{} completed",
        command.tag,
        command.name()
    ));
}

pub(crate) fn push_tagged_err(handle: &ClientHandle, command: &Command, error: &CommandError) {
    if handle.is_dropped() {
        return;
    }
    let line = match error {
        CommandError::No(text) | CommandError::Inconsistent(text) => {
            format!("{} NO {text}", command.tag)
        }
        CommandError::Bad(text) => format!("{} BAD {text}", command.tag),
        CommandError::Lock(name) => format!(
            "{} BAD unable to lock mailbox {name}, try again",
            command.tag
        ),
    };
    handle.push_line(line);
}

/// APPEND/COPY to a missing mailbox invite the client to create it.
fn trycreate(error: MailboxError) -> CommandError {
    match error {
        MailboxError::NoSuchMailbox(name) => {
            CommandError::no(format!("[TRYCREATE] no such mailbox: {name}"))
        }
        other => other.into(),
    }
}

fn render_mailbox_name(name: &MailboxName) -> String {
    quote_if_needed(&name.wire_name())
}

fn quote_if_needed(name: &str) -> String {
    if !name.is_empty()
        && name
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '/' | '-' | '_' | '.'))
    {
        name.to_string()
    } else {
        let escaped = name.replace('\\', "\\\\").replace('"', "\\\"");
        format!("\"{escaped}\"")
    }
}
