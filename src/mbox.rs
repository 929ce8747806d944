//! Folder-level IMAP state: the stable UID index over a mutable MH folder,
//! resynchronisation against external change, the selected-client registry,
//! and the verbs that operate on a selected mailbox.

use std::{
    collections::{BTreeSet, HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex as StdMutex,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use chrono::{DateTime, Local, TimeZone};
use log::{debug, error, info, warn};
use tokio::sync::{mpsc::UnboundedSender, RwLock};

use crate::{
    cache::MessageCache,
    db::{Database, MailboxRow},
    error::{CommandError, MailboxError},
    fetch::{render, FetchContext},
    message::{self, Message},
    mh::{MhFolder, Sequences},
    search::{matches, SearchContext},
    types::{
        Command, CommandBody, FetchAttribute, Flag, MailboxAttribute, StoreResponse, StoreType,
        PERMANENT_FLAGS, SYSTEM_FLAGS,
    },
};

pub type ClientId = u64;

/// How long FETCH/SEARCH run before yielding to other clients.
const TIME_BUDGET: Duration = Duration::from_secs(1);
/// How many messages STORE/COPY process before yielding.
const COUNT_BUDGET: usize = 100;
/// Rescan horizon: messages younger than the folder mtime minus this many
/// seconds get rescanned on an incremental resync.
const RESYNC_HORIZON: i64 = 30;

/// The session side of a connected client, shared with every folder the
/// client selects. The folder pushes unsolicited responses through it.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    pub id: ClientId,
    tx: UnboundedSender<Vec<u8>>,
    idling: Arc<AtomicBool>,
    pending_expunges: Arc<StdMutex<Vec<String>>>,
    dropped: Arc<AtomicBool>,
}

impl ClientHandle {
    pub fn new(id: ClientId, tx: UnboundedSender<Vec<u8>>) -> ClientHandle {
        ClientHandle {
            id,
            tx,
            idling: Arc::new(AtomicBool::new(false)),
            pending_expunges: Arc::new(StdMutex::new(Vec::new())),
            dropped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Send raw response bytes; a gone client is not an error.
    pub fn push(&self, data: impl Into<Vec<u8>>) {
        let _ = self.tx.send(data.into());
    }

    pub fn push_line(&self, line: impl AsRef<str>) {
        self.push(format!("{}\r\n", line.as_ref()).into_bytes());
    }

    pub fn set_idling(&self, idling: bool) {
        self.idling.store(idling, Ordering::SeqCst);
    }

    pub fn is_idling(&self) -> bool {
        self.idling.load(Ordering::SeqCst)
    }

    pub fn queue_expunge(&self, line: String) {
        self.pending_expunges.lock().unwrap().push(line);
    }

    pub fn has_pending_expunges(&self) -> bool {
        !self.pending_expunges.lock().unwrap().is_empty()
    }

    pub fn take_pending_expunges(&self) -> Vec<String> {
        std::mem::take(&mut *self.pending_expunges.lock().unwrap())
    }

    pub fn clear_pending_expunges(&self) {
        self.pending_expunges.lock().unwrap().clear();
    }

    /// `* BYE ...` followed by connection teardown; used when mailbox
    /// state is beyond repair.
    pub fn unceremonious_bye(&self, reason: &str) {
        self.push_line(format!("* BYE {reason}"));
        self.dropped.store(true, Ordering::SeqCst);
    }

    pub fn is_dropped(&self) -> bool {
        self.dropped.load(Ordering::SeqCst)
    }
}

/// A command parked on the folder's continuation queue.
#[derive(Debug)]
pub struct QueuedCommand {
    pub handle: ClientHandle,
    pub command: Command,
    pub read_only: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct ResyncOptions {
    pub force: bool,
    pub notify: bool,
    pub only_notify: Option<ClientId>,
    pub dont_notify: Option<ClientId>,
    pub publish_uids: bool,
    pub optional: bool,
}

impl Default for ResyncOptions {
    fn default() -> Self {
        ResyncOptions {
            force: false,
            notify: true,
            only_notify: None,
            dont_notify: None,
            publish_uids: false,
            optional: true,
        }
    }
}

/// Whether a long-running verb finished or parked itself for continuation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    Done,
    Yielded,
}

struct SelectedClient {
    handle: ClientHandle,
    read_only: bool,
}

struct State {
    db_id: i64,
    uid_vv: u32,
    next_uid: u32,
    mtime: i64,
    attributes: BTreeSet<MailboxAttribute>,
    /// Message keys in folder order; `uids[i]` belongs to `msg_keys[i]`.
    msg_keys: Vec<u32>,
    uids: Vec<u32>,
    num_msgs: u32,
    num_recent: u32,
    /// Last-synchronised snapshot of the on-disk sequences.
    sequences: Sequences,
    clients: HashMap<ClientId, SelectedClient>,
    command_queue: VecDeque<QueuedCommand>,
    subscribed: bool,
    last_resync: i64,
    /// Set when the last client detaches; drives idle expiry.
    idle_since: Option<tokio::time::Instant>,
}

pub struct Mailbox {
    name: String,
    folder: MhFolder,
    db: Database,
    cache: Arc<StdMutex<MessageCache>>,
    state: RwLock<State>,
}

impl Mailbox {
    /// Materialise a mailbox from its persisted row. The caller (the
    /// per-user server) has already made sure the folder exists on disk
    /// and the row exists in the database.
    pub async fn from_row(
        row: MailboxRow,
        folder: MhFolder,
        db: Database,
        cache: Arc<StdMutex<MessageCache>>,
    ) -> Result<Arc<Mailbox>, MailboxError> {
        let sequences = db
            .load_sequences(row.id)
            .await
            .map_err(|error| MailboxError::Inconsistency {
                mailbox: row.name.clone(),
                reason: format!("loading sequences: {error}"),
            })?;

        let state = State {
            db_id: row.id,
            uid_vv: row.uid_vv,
            next_uid: row.next_uid.max(1),
            mtime: row.mtime,
            attributes: row.attributes.into_iter().collect(),
            msg_keys: Vec::new(),
            uids: row.uids,
            num_msgs: row.num_msgs,
            num_recent: row.num_recent,
            sequences,
            clients: HashMap::new(),
            command_queue: VecDeque::new(),
            subscribed: row.subscribed,
            last_resync: row.last_resync,
            idle_since: Some(tokio::time::Instant::now()),
        };

        let mailbox = Arc::new(Mailbox {
            name: row.name,
            folder,
            db,
            cache,
            state: RwLock::new(state),
        });

        // Settle message keys so msn mapping works before the first client
        // arrives.
        mailbox
            .resync(ResyncOptions {
                optional: false,
                ..ResyncOptions::default()
            })
            .await?;

        Ok(mailbox)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn uid_vv(&self) -> u32 {
        self.state.read().await.uid_vv
    }

    pub async fn subscribed(&self) -> bool {
        self.state.read().await.subscribed
    }

    pub async fn set_subscribed(&self, subscribed: bool) -> Result<(), MailboxError> {
        self.state.write().await.subscribed = subscribed;
        self.db
            .set_subscribed(&self.name, subscribed)
            .await
            .map_err(|error| MailboxError::Inconsistency {
                mailbox: self.name.clone(),
                reason: format!("persisting subscription: {error}"),
            })
    }

    pub async fn attributes(&self) -> Vec<MailboxAttribute> {
        self.state.read().await.attributes.iter().copied().collect()
    }

    pub async fn set_has_children(&self, has_children: bool) {
        let mut state = self.state.write().await;
        if has_children {
            state.attributes.remove(&MailboxAttribute::HasNoChildren);
            state.attributes.insert(MailboxAttribute::HasChildren);
        } else {
            state.attributes.remove(&MailboxAttribute::HasChildren);
            state.attributes.insert(MailboxAttribute::HasNoChildren);
        }
    }

    pub async fn is_noselect(&self) -> bool {
        self.state
            .read()
            .await
            .attributes
            .contains(&MailboxAttribute::Noselect)
    }

    pub async fn has_clients(&self) -> bool {
        !self.state.read().await.clients.is_empty()
    }

    pub async fn has_idling_clients(&self) -> bool {
        self.state
            .read()
            .await
            .clients
            .values()
            .any(|client| client.handle.is_idling())
    }

    /// How long this folder has been without clients, if it is.
    pub async fn idle_for(&self) -> Option<Duration> {
        self.state
            .read()
            .await
            .idle_since
            .map(|since| since.elapsed())
    }

    pub async fn has_queued_commands(&self) -> bool {
        !self.state.read().await.command_queue.is_empty()
    }

    pub async fn push_queued_command(&self, queued: QueuedCommand) {
        self.state.write().await.command_queue.push_back(queued);
    }

    pub async fn pop_queued_command(&self) -> Option<QueuedCommand> {
        self.state.write().await.command_queue.pop_front()
    }

    pub fn clear_cache_entries(&self) {
        self.cache.lock().unwrap().clear_folder(&self.name);
    }

    // ------------------------------------------------------------------
    // Resynchronisation.

    /// Reconcile in-memory state with the on-disk folder and synthesise
    /// whatever untagged responses that reconciliation implies.
    pub async fn resync(&self, options: ResyncOptions) -> Result<(), MailboxError> {
        let mut state = self.state.write().await;
        state.last_resync = now_seconds();

        // A \Noselect mailbox is a tombstone; track its mtime and nothing
        // else.
        if state.attributes.contains(&MailboxAttribute::Noselect) {
            state.mtime = self.folder.mtime().await.unwrap_or(state.mtime);
            self.commit(&mut state).await?;
            return Ok(());
        }

        let start_mtime = self.folder.mtime().await?;
        if options.optional && start_mtime <= state.mtime && !options.force {
            return Ok(());
        }

        let notify = if options.only_notify.is_some() {
            false
        } else {
            options.notify
        };
        let mut force = options.force;

        let lock = self.folder.lock().await?;

        let result = self
            .resync_locked(&mut state, options, notify, &mut force)
            .await;
        lock.unlock();
        result?;

        // The scan itself may have touched the store (UID stamps, the
        // sequences rewrite), so take the mtime afterwards.
        state.mtime = self.folder.mtime().await?;
        self.commit(&mut state).await?;
        Ok(())
    }

    async fn resync_locked(
        &self,
        state: &mut State,
        options: ResyncOptions,
        notify: bool,
        force: &mut bool,
    ) -> Result<(), MailboxError> {
        let msgs = self.folder.keys().await?;
        let mut sequences = self.folder.get_sequences().await?;

        // `Seen` is everything not in `unseen`.
        let unseen = sequences.get("unseen").cloned().unwrap_or_default();
        let seen: BTreeSet<u32> = msgs
            .iter()
            .copied()
            .filter(|key| !unseen.contains(key))
            .collect();
        if seen.is_empty() {
            sequences.remove("Seen");
        } else {
            sequences.insert("Seen".to_string(), seen);
        }

        // Interesting folders are \Marked.
        let interesting = !unseen.is_empty()
            || sequences
                .get("Recent")
                .map(|recent| !recent.is_empty())
                .unwrap_or(false);
        if interesting {
            state.attributes.remove(&MailboxAttribute::Unmarked);
            state.attributes.insert(MailboxAttribute::Marked);
        } else {
            state.attributes.remove(&MailboxAttribute::Marked);
            state.attributes.insert(MailboxAttribute::Unmarked);
        }

        self.folder.set_sequences(&sequences).await?;

        if state.uids.is_empty() && !msgs.is_empty() {
            *force = true;
        }

        let found_uids;
        if msgs.is_empty() {
            self.clear_cache_entries();
            if !state.uids.is_empty() {
                warn!("{}: folder emptied behind our back", self.name);
            }
            self.send_expunges(state, &[]);
            found_uids = Vec::new();
        } else {
            // A database reset shows up as the last message carrying a UID
            // at or past next_uid; adopt it and rescan.
            if let Ok(bytes) = self.folder.get_bytes(*msgs.last().unwrap()).await {
                if let Some((uid_vv, uid)) = message::parse_uid_header(&bytes) {
                    if uid_vv == state.uid_vv && uid >= state.next_uid {
                        warn!(
                            "{}: last message uid {uid} is at or past next_uid {}; \
                             forcing full rescan",
                            self.name, state.next_uid
                        );
                        state.next_uid = uid + 1;
                        *force = true;
                    }
                }
            }

            // Fewer messages than cached UIDs: something was removed
            // externally and we cannot tell what without a full scan.
            if msgs.len() < state.uids.len() {
                warn!(
                    "{}: {} messages on disk but {} cached uids; forcing full rescan",
                    self.name,
                    msgs.len(),
                    state.uids.len()
                );
                *force = true;
            }

            if *force {
                self.clear_cache_entries();
                found_uids =
                    self.update_msg_uids(state, &msgs, &mut sequences).await?;
                self.send_expunges(state, &found_uids);
            } else {
                let first_new = self.find_first_new_message(&msgs, state.mtime).await;
                let first_without_uid = self
                    .find_msg_without_uid_vv(state.uid_vv, &msgs)
                    .await;

                match (first_new, first_without_uid) {
                    (None, None) => {
                        found_uids = state.uids.clone();
                    }
                    (new, missing) => {
                        let start = [new, missing].into_iter().flatten().min().unwrap();
                        let start_idx =
                            msgs.iter().position(|key| *key == start).unwrap_or(0);
                        debug!(
                            "{}: rescanning from key {start} (index {start_idx})",
                            self.name
                        );
                        let tail = self
                            .update_msg_uids(state, &msgs[start_idx..], &mut sequences)
                            .await?;
                        let mut uids = state.uids[..start_idx.min(state.uids.len())]
                            .to_vec();
                        uids.extend(tail);
                        self.send_expunges(state, &uids);
                        found_uids = uids;
                    }
                }
            }
        }

        // Sequences may have gained Recent entries during the scan.
        let sequences = self.folder.get_sequences().await?;
        let num_recent = sequences
            .get("Recent")
            .map(|recent| recent.len() as u32)
            .unwrap_or(0);

        if msgs.len() as u32 != state.num_msgs || num_recent != state.num_recent {
            let recipients: Vec<ClientHandle> = state
                .clients
                .values()
                .filter(|client| {
                    notify
                        || client.handle.is_idling()
                        || options.only_notify == Some(client.handle.id)
                })
                // An EXISTS below what this client believes would leak the
                // shrinkage before its queued EXPUNGEs; it infers the new
                // count from those instead.
                .filter(|client| !client.handle.has_pending_expunges())
                .map(|client| client.handle.clone())
                .collect();
            for handle in recipients {
                handle.push_line(format!("* {} EXISTS", msgs.len()));
                handle.push_line(format!("* {num_recent} RECENT"));
            }
        }

        state.num_msgs = msgs.len() as u32;
        state.num_recent = num_recent;
        state.uids = found_uids;
        state.msg_keys = msgs.clone();

        self.publish_flag_changes(
            state,
            &msgs,
            &sequences,
            options.dont_notify,
            options.publish_uids,
        );
        state.sequences = sequences;

        self.pack_if_necessary(state, &msgs).await?;

        Ok(())
    }

    /// Scan the given keys left to right, re-stamping every message whose
    /// UID header is missing, from another uid-validity epoch, or out of
    /// order. Returns the UIDs in key order.
    async fn update_msg_uids(
        &self,
        state: &mut State,
        keys: &[u32],
        sequences: &mut Sequences,
    ) -> Result<Vec<u32>, MailboxError> {
        let mut uids = Vec::with_capacity(keys.len());
        let mut highest = 0u32;
        let mut sequences_dirty = false;

        for &key in keys {
            let bytes = self.folder.get_bytes(key).await?;
            let parsed = message::parse_uid_header(&bytes);

            if let Some((uid_vv, uid)) = parsed {
                if uid_vv == state.uid_vv && uid > highest {
                    highest = uid;
                    uids.push(uid);
                    continue;
                }
            }

            // Newly delivered (or re-bobbled) message: stamp a fresh UID,
            // leave the INTERNALDATE alone, and mark it \Recent.
            let uid = state.next_uid;
            state.next_uid += 1;
            let stamped = message::stamp_uid_header(&bytes, state.uid_vv, uid);
            self.folder
                .set_bytes_preserving_mtime(key, &stamped)
                .await?;
            self.cache.lock().unwrap().remove(&self.name, key);

            if parsed.map(|(uid_vv, _)| uid_vv != state.uid_vv).unwrap_or(true) {
                sequences.entry("Recent".to_string()).or_default().insert(key);
                sequences_dirty = true;
            }

            highest = uid;
            uids.push(uid);
        }

        if state.next_uid <= highest {
            state.next_uid = highest + 1;
        }
        if sequences_dirty {
            self.folder.set_sequences(sequences).await?;
        }

        Ok(uids)
    }

    /// First key whose file mtime is later than the folder's last known
    /// mtime (minus a safety horizon).
    async fn find_first_new_message(&self, keys: &[u32], folder_mtime: i64) -> Option<u32> {
        let horizon = folder_mtime - RESYNC_HORIZON;
        for &key in keys {
            match self.folder.message_mtime(key).await {
                Ok(mtime) if mtime > horizon => return Some(key),
                Ok(_) => {}
                Err(_) => return Some(key),
            }
        }
        None
    }

    /// Scan from the end towards the front, returning the earliest message
    /// of the trailing run that lacks a header from our uid-validity epoch.
    async fn find_msg_without_uid_vv(&self, uid_vv: u32, keys: &[u32]) -> Option<u32> {
        let mut earliest = None;
        for &key in keys.iter().rev() {
            let valid = match self.folder.get_bytes(key).await {
                Ok(bytes) => message::parse_uid_header(&bytes)
                    .map(|(found, _)| found == uid_vv)
                    .unwrap_or(false),
                Err(_) => false,
            };
            if valid {
                break;
            }
            earliest = Some(key);
        }
        earliest
    }

    /// Diff old UID list against the new one and deliver `* n EXPUNGE`
    /// for every vanished message, highest msn first. Idling clients get
    /// them now, everyone else on their next permitting command.
    fn send_expunges(&self, state: &mut State, found_uids: &[u32]) {
        let found: BTreeSet<u32> = found_uids.iter().copied().collect();
        let mut lines = Vec::new();

        for (index, uid) in state.uids.iter().enumerate().rev() {
            if !found.contains(uid) {
                lines.push(format!("* {} EXPUNGE", index + 1));
            }
        }

        if lines.is_empty() {
            return;
        }
        info!("{}: expunging {} externally removed messages", self.name, lines.len());

        for client in state.clients.values() {
            for line in &lines {
                if client.handle.is_idling() {
                    client.handle.push_line(line);
                } else {
                    client.handle.queue_expunge(format!("{line}\r\n"));
                }
            }
        }
    }

    /// Messages whose sequence membership changed since the last snapshot
    /// get an unsolicited `* n FETCH (FLAGS ...)` to every listener except
    /// `dont_notify`.
    fn publish_flag_changes(
        &self,
        state: &State,
        msgs: &[u32],
        sequences: &Sequences,
        dont_notify: Option<ClientId>,
        publish_uids: bool,
    ) {
        let mut changed: BTreeSet<u32> = BTreeSet::new();

        let old_names: BTreeSet<&String> = state.sequences.keys().collect();
        let new_names: BTreeSet<&String> = sequences.keys().collect();
        for name in old_names.symmetric_difference(&new_names) {
            if let Some(keys) = sequences.get(*name) {
                changed.extend(keys);
            }
            if let Some(keys) = state.sequences.get(*name) {
                changed.extend(keys);
            }
        }
        for (name, keys) in sequences {
            if let Some(old_keys) = state.sequences.get(name) {
                changed.extend(keys.symmetric_difference(old_keys));
            }
        }

        // Never announce flags for messages that vanished in this resync.
        let present: BTreeSet<u32> = msgs.iter().copied().collect();
        changed.retain(|key| present.contains(key));

        if changed.is_empty() {
            return;
        }

        for key in changed {
            let Some(index) = msgs.iter().position(|k| *k == key) else {
                continue;
            };
            let flags = render_flags(sequences, key);
            let uid_suffix = if publish_uids {
                match state.uids.get(index) {
                    Some(uid) => format!(" UID {uid}"),
                    None => {
                        error!(
                            "{}: no uid for message index {index} while publishing flags",
                            self.name
                        );
                        String::new()
                    }
                }
            } else {
                String::new()
            };
            let line = format!("* {} FETCH (FLAGS ({flags}){uid_suffix})", index + 1);

            for client in state.clients.values() {
                if dont_notify == Some(client.handle.id) {
                    continue;
                }
                client.handle.push_line(&line);
            }
        }
    }

    /// Folders with serious key gaps get packed so keys do not run away
    /// from message counts. The snapshot is refreshed immediately so the
    /// next resync does not read the renumbering as flag changes.
    async fn pack_if_necessary(
        &self,
        state: &mut State,
        msgs: &[u32],
    ) -> Result<(), MailboxError> {
        if msgs.len() <= 100 {
            return Ok(());
        }
        let highest = *msgs.last().unwrap() as f64;
        if highest < msgs.len() as f64 * 1.25 {
            return Ok(());
        }

        info!("{}: packing ({} keys, highest {highest})", self.name, msgs.len());
        self.folder.pack().await?;
        self.clear_cache_entries();
        state.msg_keys = self.folder.keys().await?;
        state.sequences = self.folder.get_sequences().await?;
        Ok(())
    }

    async fn commit(&self, state: &mut State) -> Result<(), MailboxError> {
        let row = MailboxRow {
            id: state.db_id,
            name: self.name.clone(),
            uid_vv: state.uid_vv,
            attributes: state.attributes.iter().copied().collect(),
            mtime: state.mtime,
            next_uid: state.next_uid,
            num_msgs: state.num_msgs,
            num_recent: state.num_recent,
            uids: state.uids.clone(),
            last_resync: state.last_resync,
            subscribed: state.subscribed,
        };
        let map_err = |error: sqlx::Error| MailboxError::Inconsistency {
            mailbox: self.name.clone(),
            reason: format!("persisting state: {error}"),
        };
        let id = self.db.save_mailbox(&row).await.map_err(map_err)?;
        state.db_id = id;
        self.db
            .save_sequences(id, &state.sequences)
            .await
            .map_err(map_err)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Selected-state verbs.

    /// Attach a client. Returns the untagged responses of a successful
    /// SELECT/EXAMINE in protocol order.
    pub async fn select(
        &self,
        handle: &ClientHandle,
        read_only: bool,
    ) -> Result<Vec<String>, MailboxError> {
        if self.is_noselect().await {
            return Err(MailboxError::NoSuchMailbox(self.name.clone()));
        }

        self.resync(ResyncOptions {
            optional: false,
            ..ResyncOptions::default()
        })
        .await?;

        let mut state = self.state.write().await;
        state.clients.insert(
            handle.id,
            SelectedClient {
                handle: handle.clone(),
                read_only,
            },
        );
        state.idle_since = None;

        let mut lines = vec![
            format!("* {} EXISTS", state.num_msgs),
            format!("* {} RECENT", state.num_recent),
        ];
        if let Some(unseen) = state.sequences.get("unseen").and_then(|keys| keys.first()) {
            if let Some(index) = state.msg_keys.iter().position(|key| key == unseen) {
                lines.push(format!("* OK [UNSEEN {}]", index + 1));
            }
        }
        lines.push(format!("* OK [UIDVALIDITY {}]", state.uid_vv));
        lines.push(format!("* OK [UIDNEXT {}]", state.next_uid));
        lines.push(format!("* FLAGS ({SYSTEM_FLAGS})"));
        lines.push(format!("* OK [PERMANENTFLAGS ({PERMANENT_FLAGS})]"));

        Ok(lines)
    }

    /// Detach a client; its queued commands go with it.
    pub async fn unselect(&self, client_id: ClientId) {
        let mut state = self.state.write().await;
        state.clients.remove(&client_id);
        state
            .command_queue
            .retain(|queued| queued.handle.id != client_id);
        if state.clients.is_empty() {
            state.idle_since = Some(tokio::time::Instant::now());
        }
    }

    /// CLOSE: detach, and silently expunge if the mailbox was writable.
    pub async fn close(&self, client_id: ClientId) -> Result<(), MailboxError> {
        let read_only = {
            let state = self.state.read().await;
            state
                .clients
                .get(&client_id)
                .map(|client| client.read_only)
                .unwrap_or(true)
        };

        self.unselect(client_id).await;
        if !read_only {
            self.expunge(None).await?;
        }
        Ok(())
    }

    /// Remove every `\Deleted` message. `issuer` (and idling clients) see
    /// the `* n EXPUNGE` responses immediately; other clients get them
    /// queued. Passing no issuer keeps the whole thing silent towards
    /// non-idling clients (the CLOSE behaviour).
    pub async fn expunge(&self, issuer: Option<&ClientHandle>) -> Result<(), MailboxError> {
        {
            let mut state = self.state.write().await;
            let lock = self.folder.lock().await?;
            let result = self.expunge_locked(&mut state, issuer).await;
            lock.unlock();
            result?;
        }

        self.resync(ResyncOptions {
            notify: false,
            optional: false,
            ..ResyncOptions::default()
        })
        .await
    }

    async fn expunge_locked(
        &self,
        state: &mut State,
        issuer: Option<&ClientHandle>,
    ) -> Result<(), MailboxError> {
        let mut sequences = self.folder.get_sequences().await?;
        let deleted: Vec<u32> = sequences
            .get("Deleted")
            .map(|keys| keys.iter().copied().collect())
            .unwrap_or_default();
        if deleted.is_empty() {
            return Ok(());
        }

        // Highest msn first, so earlier responses do not renumber later
        // ones.
        for &key in deleted.iter().rev() {
            let Some(index) = state.msg_keys.iter().position(|k| *k == key) else {
                continue;
            };
            let msn = index + 1;

            self.folder.remove(key).await?;
            self.cache.lock().unwrap().remove(&self.name, key);
            state.msg_keys.remove(index);
            state.uids.remove(index);
            for keys in sequences.values_mut() {
                keys.remove(&key);
            }

            let line = format!("* {msn} EXPUNGE");
            for client in state.clients.values() {
                let is_issuer = issuer.map(|handle| handle.id) == Some(client.handle.id);
                if is_issuer || client.handle.is_idling() {
                    client.handle.push_line(&line);
                } else {
                    client.handle.queue_expunge(format!("{line}\r\n"));
                }
            }
        }

        self.folder.set_sequences(&sequences).await?;
        state.num_msgs = state.msg_keys.len() as u32;
        state.sequences = sequences;
        Ok(())
    }

    /// APPEND: add the message, stamp `\Recent`, assign its UID via a
    /// forced resync, and report `(uid_validity, uid)` for APPENDUID.
    pub async fn append(
        &self,
        bytes: &[u8],
        flags: &[Flag],
        date_time: Option<DateTime<chrono::FixedOffset>>,
    ) -> Result<(u32, u32), MailboxError> {
        let new_key = {
            let lock = self.folder.lock().await?;

            let mut sequence_names: Vec<String> = flags
                .iter()
                .filter(|flag| !matches!(flag, Flag::Recent))
                .map(|flag| flag.seq_name().to_string())
                .collect();
            sequence_names.push("Recent".to_string());
            if !flags.contains(&Flag::Seen) {
                sequence_names.push("unseen".to_string());
            }

            let result = self.folder.add(bytes, &sequence_names).await;
            let new_key = match result {
                Ok(new_key) => new_key,
                Err(error) => {
                    lock.unlock();
                    return Err(error);
                }
            };

            if let Some(date_time) = date_time {
                let mtime = SystemTime::UNIX_EPOCH
                    + Duration::from_secs(date_time.timestamp().max(0) as u64);
                crate::mh::set_file_mtime(&self.folder.message_path(new_key), mtime)?;
            }
            lock.unlock();
            new_key
        };

        self.resync(ResyncOptions {
            optional: false,
            ..ResyncOptions::default()
        })
        .await?;

        let state = self.state.read().await;
        let index = state
            .msg_keys
            .iter()
            .position(|key| *key == new_key)
            .ok_or_else(|| MailboxError::Inconsistency {
                mailbox: self.name.clone(),
                reason: format!("appended message {new_key} vanished during resync"),
            })?;
        Ok((state.uid_vv, state.uids[index]))
    }

    /// STATUS attributes from current state (the caller resyncs first when
    /// the folder was not already live).
    pub async fn status_line(&self, attributes: &[crate::types::StatusAttribute]) -> String {
        use crate::types::StatusAttribute;

        let state = self.state.read().await;
        let unseen = state
            .sequences
            .get("unseen")
            .map(|keys| keys.len())
            .unwrap_or(0);

        let mut pieces = Vec::new();
        for attribute in attributes {
            let value = match attribute {
                StatusAttribute::Messages => state.num_msgs as usize,
                StatusAttribute::Recent => state.num_recent as usize,
                StatusAttribute::UidNext => state.next_uid as usize,
                StatusAttribute::UidValidity => state.uid_vv as usize,
                StatusAttribute::Unseen => unseen,
            };
            pieces.push(format!("{attribute} {value}"));
        }
        pieces.join(" ")
    }

    // ------------------------------------------------------------------
    // FETCH / STORE / SEARCH / COPY.

    /// Map the command's sequence set onto (msn, key, uid) triples.
    async fn resolve_set(
        &self,
        command: &Command,
    ) -> Result<Vec<(u32, u32, u32)>, CommandError> {
        let state = self.state.read().await;
        let (set, uid_cmd) = match &command.body {
            CommandBody::Fetch { set, uid, .. }
            | CommandBody::Store { set, uid, .. }
            | CommandBody::Copy { set, uid, .. } => (set, *uid),
            _ => return Ok(Vec::new()),
        };

        let mut out = Vec::new();
        if uid_cmd {
            // Membership tests, not expansion: `UID FETCH 1:*` must not
            // materialise four billion numbers.
            let uid_max = state.uids.last().copied().unwrap_or(0);
            for (index, uid) in state.uids.iter().enumerate() {
                if set.contains(*uid, uid_max) {
                    out.push((index as u32 + 1, state.msg_keys[index], *uid));
                }
            }
        } else {
            let msns = set.to_list(state.num_msgs, false)?;
            for msn in msns {
                let index = msn as usize - 1;
                if index < state.msg_keys.len() {
                    out.push((msn, state.msg_keys[index], state.uids[index]));
                }
            }
        }
        Ok(out)
    }

    /// Load a message through the cache.
    async fn cached_message(&self, key: u32) -> Result<Arc<Message>, MailboxError> {
        if let Some(message) = self.cache.lock().unwrap().get(&self.name, key) {
            return Ok(message);
        }
        let bytes = self.folder.get_bytes(key).await?;
        let message =
            Arc::new(
                Message::parse(&bytes).map_err(|error| MailboxError::Inconsistency {
                    mailbox: self.name.clone(),
                    reason: format!("unparsable message {key}: {error}"),
                })?,
            );
        self.cache
            .lock()
            .unwrap()
            .add(&self.name, key, message.clone());
        Ok(message)
    }

    /// FETCH. Pushes `* n FETCH (...)` responses to the issuing client,
    /// yielding if the time budget runs out.
    pub async fn fetch(
        &self,
        command: &mut Command,
        handle: &ClientHandle,
        read_only: bool,
    ) -> Result<Progress, CommandError> {
        let uid_cmd = command.uid_command();
        let mut attributes = match &command.body {
            CommandBody::Fetch { attributes, .. } => attributes.clone(),
            _ => return Err(CommandError::bad("not a FETCH")),
        };
        // UID FETCH always reports the UID, asked for or not.
        if uid_cmd && !attributes.contains(&FetchAttribute::Uid) {
            attributes.insert(0, FetchAttribute::Uid);
        }
        let fetches_body = attributes.iter().any(FetchAttribute::fetches_body);
        let wants_flags = attributes.contains(&FetchAttribute::Flags);

        let triples = self.resolve_set(command).await?;
        let started = tokio::time::Instant::now();

        // Side effects go into a working copy; the in-memory snapshot
        // stays behind so the post-command resync can diff it and notify
        // the other clients.
        let mut sequences = self.state.read().await.sequences.clone();
        let mut sequences_dirty = false;

        while command.cursor < triples.len() {
            if started.elapsed() > TIME_BUDGET {
                command.needs_continuation = true;
                if sequences_dirty {
                    self.flush_sequence_changes(handle, &sequences, uid_cmd).await?;
                }
                return Ok(Progress::Yielded);
            }

            let (msn, key, uid) = triples[command.cursor];
            command.cursor += 1;

            let message = self.cached_message(key).await.map_err(CommandError::from)?;
            let internal_date = self.internal_date(key).await?;

            let mut implied_seen = false;
            if fetches_body && !read_only {
                if let Some(unseen) = sequences.get_mut("unseen") {
                    if unseen.remove(&key) {
                        implied_seen = true;
                        sequences_dirty = true;
                        sequences
                            .entry("Seen".to_string())
                            .or_default()
                            .insert(key);
                    }
                }
            }

            let context = FetchContext {
                message: &message,
                msn,
                uid,
                flags: flags_for_key(&sequences, key),
                internal_date,
            };

            let mut rendered = Vec::new();
            for attribute in &attributes {
                rendered.push(render(&context, attribute)?);
            }
            if implied_seen && !wants_flags {
                rendered.push(render(&context, &FetchAttribute::Flags)?);
            }

            // Reporting the flags consumes this client's view of \Recent;
            // nobody else will ever see it. A FETCH that never rendered
            // FLAGS (explicitly or via the implicit \Seen echo) leaves it
            // alone.
            if (wants_flags || implied_seen) && !read_only {
                if let Some(recent) = sequences.get_mut("Recent") {
                    if recent.remove(&key) {
                        sequences_dirty = true;
                    }
                }
            }

            let mut line = format!("* {msn} FETCH (").into_bytes();
            for (index, piece) in rendered.iter().enumerate() {
                if index > 0 {
                    line.push(b' ');
                }
                line.extend_from_slice(piece);
            }
            line.extend_from_slice(b")\r\n");
            handle.push(line);
        }

        if sequences_dirty {
            self.flush_sequence_changes(handle, &sequences, uid_cmd).await?;
        }
        command.needs_continuation = false;
        Ok(Progress::Done)
    }

    /// Write mutated sequences back to disk and fan the flag diffs out to
    /// the other clients (the issuing one already saw them inline).
    async fn flush_sequence_changes(
        &self,
        handle: &ClientHandle,
        sequences: &Sequences,
        publish_uids: bool,
    ) -> Result<(), CommandError> {
        {
            let lock = self.folder.lock().await.map_err(CommandError::from)?;
            let result = self.folder.set_sequences(sequences).await;
            lock.unlock();
            result.map_err(CommandError::from)?;
        }

        self.resync(ResyncOptions {
            optional: false,
            notify: false,
            dont_notify: Some(handle.id),
            publish_uids,
            ..ResyncOptions::default()
        })
        .await
        .map_err(CommandError::from)
    }

    /// STORE. Flag changes are answered to the issuing client unless
    /// `.SILENT`, and fanned out to everyone else through resync.
    pub async fn store(
        &self,
        command: &mut Command,
        handle: &ClientHandle,
        read_only: bool,
    ) -> Result<Progress, CommandError> {
        if read_only {
            return Err(CommandError::no("mailbox is read-only"));
        }

        let (kind, response, flags, uid_cmd) = match &command.body {
            CommandBody::Store {
                kind,
                response,
                flags,
                uid,
                ..
            } => (*kind, *response, flags.clone(), *uid),
            _ => return Err(CommandError::bad("not a STORE")),
        };

        if flags.contains(&Flag::Recent) {
            return Err(CommandError::no("\\Recent flag may not be set or unset"));
        }
        for flag in &flags {
            if let Flag::Keyword(name) = flag {
                if !Flag::valid_keyword(name) {
                    return Err(CommandError::bad(format!(
                        "invalid keyword: {name}"
                    )));
                }
            }
        }

        let triples = self.resolve_set(command).await?;

        {
            // Hold the state read lock so no resync rewrites the snapshot
            // while the disk is ahead of it.
            let _state = self.state.read().await;
            let lock = self.folder.lock().await.map_err(CommandError::from)?;

            let mut sequences = match self.folder.get_sequences().await {
                Ok(sequences) => sequences,
                Err(error) => {
                    lock.unlock();
                    return Err(error.into());
                }
            };

            let processed: Vec<(u32, u32, u32)> = triples
                .iter()
                .skip(command.cursor)
                .take(COUNT_BUDGET)
                .copied()
                .collect();
            for (_, key, _) in &processed {
                apply_store(&mut sequences, *key, kind, &flags);
            }
            command.cursor += processed.len();

            let result = self.folder.set_sequences(&sequences).await;
            lock.unlock();
            result.map_err(CommandError::from)?;

            // The issuing client sees results inline; the in-memory
            // snapshot stays behind so the resync below can diff it for
            // everyone else.
            if response == StoreResponse::Answer {
                for (msn, key, uid) in &processed {
                    let flags = render_flags(&sequences, *key);
                    let uid_suffix = if uid_cmd {
                        format!(" UID {uid}")
                    } else {
                        String::new()
                    };
                    handle.push_line(format!(
                        "* {msn} FETCH (FLAGS ({flags}){uid_suffix})"
                    ));
                }
            }
        }

        self.resync(ResyncOptions {
            optional: false,
            notify: false,
            dont_notify: Some(handle.id),
            publish_uids: uid_cmd,
            ..ResyncOptions::default()
        })
        .await
        .map_err(CommandError::from)?;

        if command.cursor < triples.len() {
            command.needs_continuation = true;
            return Ok(Progress::Yielded);
        }
        command.needs_continuation = false;
        Ok(Progress::Done)
    }

    /// SEARCH. Accumulates hits across yields; the `* SEARCH` response is
    /// pushed when the whole set has been evaluated.
    pub async fn search(
        &self,
        command: &mut Command,
        handle: &ClientHandle,
    ) -> Result<Progress, CommandError> {
        let (criteria, uid_cmd) = match &command.body {
            CommandBody::Search { criteria, uid, .. } => (criteria.clone(), *uid),
            _ => return Err(CommandError::bad("not a SEARCH")),
        };

        // Settle UIDs before evaluating; no notifications mid-command.
        if command.cursor == 0 {
            self.resync(ResyncOptions {
                notify: false,
                optional: false,
                ..ResyncOptions::default()
            })
            .await
            .map_err(CommandError::from)?;
        }

        let (msg_keys, uids, sequences) = {
            let state = self.state.read().await;
            (
                state.msg_keys.clone(),
                state.uids.clone(),
                state.sequences.clone(),
            )
        };
        let msn_max = msg_keys.len() as u32;
        let uid_max = uids.last().copied().unwrap_or(0);

        let started = tokio::time::Instant::now();

        while command.cursor < msg_keys.len() {
            if started.elapsed() > TIME_BUDGET {
                command.needs_continuation = true;
                return Ok(Progress::Yielded);
            }

            let index = command.cursor;
            command.cursor += 1;
            let key = msg_keys[index];

            let message = self.cached_message(key).await.map_err(CommandError::from)?;
            let internal_date = self.internal_date(key).await?;
            let context = SearchContext {
                message: &message,
                msn: index as u32 + 1,
                uid: uids[index],
                msn_max,
                uid_max,
                flags: flags_for_key(&sequences, key),
                internal_date,
            };

            if matches(&context, &criteria) {
                let hit = if uid_cmd {
                    uids[index]
                } else {
                    index as u32 + 1
                };
                command.hits.push(hit);
            }
        }

        let rendered: Vec<String> = command.hits.iter().map(u32::to_string).collect();
        if rendered.is_empty() {
            handle.push_line("* SEARCH");
        } else {
            handle.push_line(format!("* SEARCH {}", rendered.join(" ")));
        }
        command.needs_continuation = false;
        Ok(Progress::Done)
    }

    /// COPY into `destination`, preserving INTERNALDATE and flags, marking
    /// the copies `\Recent`. Returns the UID sets for COPYUID.
    pub async fn copy(
        &self,
        command: &mut Command,
        destination: &Arc<Mailbox>,
    ) -> Result<(Vec<u32>, Vec<u32>), CommandError> {
        let triples = self.resolve_set(command).await?;

        let mut src_uids = Vec::new();
        let mut new_keys = Vec::new();

        for (_, key, uid) in &triples {
            let bytes = self.folder.get_bytes(*key).await.map_err(CommandError::from)?;
            let mtime = self.folder.message_mtime(*key).await.map_err(CommandError::from)?;

            let sequences = {
                let state = self.state.read().await;
                let mut names: Vec<String> = state
                    .sequences
                    .iter()
                    .filter(|(name, keys)| *name != "Recent" && keys.contains(key))
                    .map(|(name, _)| name.clone())
                    .collect();
                names.push("Recent".to_string());
                names
            };

            let lock = destination.folder.lock().await.map_err(CommandError::from)?;
            let added = destination.folder.add(&bytes, &sequences).await;
            let new_key = match added {
                Ok(new_key) => new_key,
                Err(error) => {
                    lock.unlock();
                    return Err(error.into());
                }
            };
            let mtime = SystemTime::UNIX_EPOCH + Duration::from_secs(mtime.max(0) as u64);
            let touched =
                crate::mh::set_file_mtime(&destination.folder.message_path(new_key), mtime);
            lock.unlock();
            touched.map_err(|error| CommandError::no(error.to_string()))?;

            src_uids.push(*uid);
            new_keys.push(new_key);
        }

        // The destination assigns UIDs on its own resync.
        destination
            .resync(ResyncOptions {
                optional: false,
                ..ResyncOptions::default()
            })
            .await
            .map_err(CommandError::from)?;

        let state = destination.state.read().await;
        let mut dst_uids = Vec::with_capacity(new_keys.len());
        for new_key in new_keys {
            match state.msg_keys.iter().position(|key| *key == new_key) {
                Some(index) => dst_uids.push(state.uids[index]),
                None => {
                    return Err(CommandError::no(format!(
                        "copied message {new_key} vanished from {}",
                        destination.name
                    )))
                }
            }
        }

        Ok((src_uids, dst_uids))
    }

    /// Turn this mailbox into a `\Noselect` tombstone under a fresh
    /// uid-validity, so clients can tell any later re-creation apart.
    pub async fn tombstone(&self, uid_vv: u32) -> Result<(), MailboxError> {
        let mut state = self.state.write().await;
        state.attributes.insert(MailboxAttribute::Noselect);
        state.attributes.remove(&MailboxAttribute::Marked);
        state.attributes.insert(MailboxAttribute::Unmarked);
        state.uid_vv = uid_vv;
        state.next_uid = 1;
        state.uids.clear();
        state.msg_keys.clear();
        state.num_msgs = 0;
        state.num_recent = 0;
        state.sequences.clear();
        info!("{}: now \\Noselect with uid_validity {uid_vv}", self.name);
        self.commit(&mut state).await
    }

    /// Persist current state; called when the folder is expired from
    /// memory.
    pub async fn commit_state(&self) -> Result<(), MailboxError> {
        let mut state = self.state.write().await;
        self.commit(&mut state).await
    }

    /// Move every message into `destination`, preserving INTERNALDATE and
    /// flags, and leave this folder empty. This is how RENAME treats
    /// INBOX.
    pub async fn move_all_messages(
        &self,
        destination: &Arc<Mailbox>,
    ) -> Result<(), MailboxError> {
        let keys = {
            let lock = self.folder.lock().await?;
            let keys = self.folder.keys().await;
            lock.unlock();
            keys?
        };

        for key in keys {
            let bytes = self.folder.get_bytes(key).await?;
            let mtime = self.folder.message_mtime(key).await?;
            let sequence_names: Vec<String> = {
                let state = self.state.read().await;
                state
                    .sequences
                    .iter()
                    .filter(|(_, members)| members.contains(&key))
                    .map(|(name, _)| name.clone())
                    .collect()
            };

            let lock = destination.folder.lock().await?;
            let added = destination.folder.add(&bytes, &sequence_names).await;
            let new_key = match added {
                Ok(new_key) => new_key,
                Err(error) => {
                    lock.unlock();
                    return Err(error);
                }
            };
            let mtime = SystemTime::UNIX_EPOCH + Duration::from_secs(mtime.max(0) as u64);
            let touched =
                crate::mh::set_file_mtime(&destination.folder.message_path(new_key), mtime);
            lock.unlock();
            touched?;

            self.folder.remove(key).await?;
        }

        {
            let lock = self.folder.lock().await?;
            let result = self.folder.set_sequences(&Sequences::new()).await;
            lock.unlock();
            result?;
        }
        self.clear_cache_entries();

        destination
            .resync(ResyncOptions {
                optional: false,
                ..ResyncOptions::default()
            })
            .await?;
        self.resync(ResyncOptions {
            optional: false,
            notify: false,
            ..ResyncOptions::default()
        })
        .await
    }

    async fn internal_date(&self, key: u32) -> Result<DateTime<Local>, CommandError> {
        let seconds = self
            .folder
            .message_mtime(key)
            .await
            .map_err(CommandError::from)?;
        Ok(Local
            .timestamp_opt(seconds, 0)
            .earliest()
            .unwrap_or_else(Local::now))
    }
}

/// Apply one STORE action to the on-disk sequence map, maintaining the
/// `Seen`/`unseen` duality.
fn apply_store(sequences: &mut Sequences, key: u32, kind: StoreType, flags: &[Flag]) {
    match kind {
        StoreType::Add => {
            for flag in flags {
                add_flag(sequences, key, flag);
            }
        }
        StoreType::Remove => {
            for flag in flags {
                remove_flag(sequences, key, flag);
            }
        }
        StoreType::Replace => {
            // Clear everything except Recent, then add the listed flags.
            let names: Vec<String> = sequences.keys().cloned().collect();
            for name in names {
                if name != "Recent" {
                    remove_flag_raw(sequences, key, &name);
                }
            }
            // Everything is unseen again until Seen gets re-added.
            sequences.entry("unseen".to_string()).or_default().insert(key);
            for flag in flags {
                add_flag(sequences, key, flag);
            }
        }
    }

    sequences.retain(|_, keys| !keys.is_empty());
}

fn add_flag(sequences: &mut Sequences, key: u32, flag: &Flag) {
    if *flag == Flag::Seen {
        if let Some(unseen) = sequences.get_mut("unseen") {
            unseen.remove(&key);
        }
    }
    sequences
        .entry(flag.seq_name().to_string())
        .or_default()
        .insert(key);
}

fn remove_flag(sequences: &mut Sequences, key: u32, flag: &Flag) {
    if *flag == Flag::Seen {
        sequences.entry("unseen".to_string()).or_default().insert(key);
    }
    remove_flag_raw(sequences, key, flag.seq_name());
}

fn remove_flag_raw(sequences: &mut Sequences, key: u32, name: &str) {
    if let Some(keys) = sequences.get_mut(name) {
        keys.remove(&key);
    }
}

/// The flags a message carries, from the sequences it is a member of.
/// `unseen` is bookkeeping, not a flag.
pub(crate) fn flags_for_key(sequences: &Sequences, key: u32) -> Vec<Flag> {
    let mut flags: Vec<Flag> = sequences
        .iter()
        .filter(|(name, keys)| *name != "unseen" && keys.contains(&key))
        .map(|(name, _)| Flag::from_seq_name(name))
        .collect();
    flags.sort();
    flags.dedup();
    flags
}

fn render_flags(sequences: &Sequences, key: u32) -> String {
    flags_for_key(sequences, key)
        .iter()
        .map(Flag::to_string)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Collapse a sorted UID list into IMAP set syntax (`1:3,5`).
pub fn render_uid_set(uids: &[u32]) -> String {
    let mut pieces: Vec<String> = Vec::new();
    let mut run: Option<(u32, u32)> = None;

    for &uid in uids {
        run = match run {
            Some((start, stop)) if stop + 1 == uid => Some((start, uid)),
            Some((start, stop)) => {
                pieces.push(render_run(start, stop));
                Some((uid, uid))
            }
            None => Some((uid, uid)),
        };
    }
    if let Some((start, stop)) = run {
        pieces.push(render_run(start, stop));
    }
    pieces.join(",")
}

fn render_run(start: u32, stop: u32) -> String {
    if start == stop {
        start.to_string()
    } else {
        format!("{start}:{stop}")
    }
}

fn now_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uid_set_rendering() {
        assert_eq!(render_uid_set(&[]), "");
        assert_eq!(render_uid_set(&[1]), "1");
        assert_eq!(render_uid_set(&[1, 2, 3]), "1:3");
        assert_eq!(render_uid_set(&[1, 2, 3, 5, 9, 10]), "1:3,5,9:10");
    }

    #[test]
    fn store_actions_maintain_seen_duality() {
        let mut sequences = Sequences::new();
        sequences.insert("unseen".to_string(), BTreeSet::from([1, 2]));

        apply_store(&mut sequences, 1, StoreType::Add, &[Flag::Seen]);
        assert!(!sequences.get("unseen").unwrap().contains(&1));
        assert!(sequences.get("Seen").unwrap().contains(&1));

        apply_store(&mut sequences, 1, StoreType::Remove, &[Flag::Seen]);
        assert!(sequences.get("unseen").unwrap().contains(&1));
        assert!(!sequences.contains_key("Seen"));

        apply_store(
            &mut sequences,
            2,
            StoreType::Add,
            &[Flag::Flagged, Flag::Answered],
        );
        assert!(sequences.get("flagged").unwrap().contains(&2));
        assert!(sequences.get("replied").unwrap().contains(&2));

        // REPLACE clears everything but Recent, then applies.
        sequences.entry("Recent".to_string()).or_default().insert(2);
        apply_store(&mut sequences, 2, StoreType::Replace, &[Flag::Deleted]);
        assert!(sequences.get("Deleted").unwrap().contains(&2));
        assert!(!sequences.contains_key("flagged"));
        assert!(!sequences.contains_key("replied"));
        assert!(sequences.get("Recent").unwrap().contains(&2));
        assert!(sequences.get("unseen").unwrap().contains(&2));
    }

    #[test]
    fn flags_come_from_sequences() {
        let mut sequences = Sequences::new();
        sequences.insert("Seen".to_string(), BTreeSet::from([1]));
        sequences.insert("Recent".to_string(), BTreeSet::from([1, 2]));
        sequences.insert("unseen".to_string(), BTreeSet::from([2]));
        sequences.insert("todo".to_string(), BTreeSet::from([1]));

        assert_eq!(
            flags_for_key(&sequences, 1),
            vec![
                Flag::Recent,
                Flag::Seen,
                Flag::Keyword("todo".to_string())
            ]
        );
        assert_eq!(flags_for_key(&sequences, 2), vec![Flag::Recent]);
    }
}
