//! The per-user server: owner of the state database, the folder table, the
//! message cache, and the periodic work that keeps folders honest while
//! nobody is looking at them.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex as StdMutex,
    },
    time::Duration,
};

use log::{debug, error, info, warn};
use tokio::sync::Mutex;

use crate::{
    cache::MessageCache,
    client,
    config::Config,
    db::{Database, MailboxRow},
    error::{CommandError, MailboxError},
    mbox::{Mailbox, Progress, ResyncOptions},
    mh::MhStore,
    types::{MailboxAttribute, MailboxName},
};

/// How often the light housekeeping pass runs.
const HOUSEKEEPING_TICK: Duration = Duration::from_secs(30);
/// Full-store mtime sweep cadence, in housekeeping ticks.
const FULL_SWEEP_TICKS: u32 = 10;
/// Wall-clock budget for one pass over the continuation queues.
const QUEUE_BUDGET: Duration = Duration::from_secs(5);

pub struct UserServer {
    config: Config,
    store: MhStore,
    db: Database,
    cache: Arc<StdMutex<MessageCache>>,
    /// Folders currently materialised in memory.
    mailboxes: Mutex<HashMap<String, Arc<Mailbox>>>,
    next_client_id: AtomicU64,
    sessions: AtomicUsize,
    last_session_exit: StdMutex<tokio::time::Instant>,
}

impl UserServer {
    /// Open (or initialise) everything for one user and start the
    /// housekeeping task. The task holds only a weak reference, so
    /// dropping the last `Arc` shuts it down.
    pub async fn new(config: Config) -> Result<Arc<UserServer>, crate::error::Error> {
        let store = MhStore::new(&config.mh_root, config.lock_timeout);

        // A brand-new user starts with an empty INBOX.
        tokio::fs::create_dir_all(config.mh_root.join("inbox")).await?;

        let db = Database::open(&config.mh_root).await?;
        let cache = Arc::new(StdMutex::new(MessageCache::new(config.cache_max_bytes)));

        let server = Arc::new(UserServer {
            config,
            store,
            db,
            cache,
            mailboxes: Mutex::new(HashMap::new()),
            next_client_id: AtomicU64::new(1),
            sessions: AtomicUsize::new(0),
            last_session_exit: StdMutex::new(tokio::time::Instant::now()),
        });

        server.find_all_folders().await?;

        let weak = Arc::downgrade(&server);
        tokio::spawn(async move {
            let mut tick: u32 = 0;
            loop {
                tokio::time::sleep(HOUSEKEEPING_TICK).await;
                let Some(server) = weak.upgrade() else {
                    return;
                };
                tick = tick.wrapping_add(1);
                server.housekeeping(tick % FULL_SWEEP_TICKS == 0).await;
            }
        });

        Ok(server)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &MhStore {
        &self.store
    }

    pub(crate) fn next_client_id(&self) -> u64 {
        self.next_client_id.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn session_started(&self) {
        self.sessions.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn session_ended(&self) {
        self.sessions.fetch_sub(1, Ordering::SeqCst);
        *self.last_session_exit.lock().unwrap() = tokio::time::Instant::now();
    }

    /// True once no session has existed for the configured exit period;
    /// the embedding process uses this to decide when to go away.
    pub fn should_exit(&self) -> bool {
        self.sessions.load(Ordering::SeqCst) == 0
            && self.last_session_exit.lock().unwrap().elapsed() >= self.config.user_idle_exit
    }

    // ------------------------------------------------------------------
    // Folder table.

    /// Fetch (materialising if needed) the named mailbox.
    pub async fn get_mailbox(&self, name: &MailboxName) -> Result<Arc<Mailbox>, MailboxError> {
        validate_name(name)?;
        let key = name.as_str().to_string();

        {
            let mailboxes = self.mailboxes.lock().await;
            if let Some(mailbox) = mailboxes.get(&key) {
                return Ok(mailbox.clone());
            }
        }

        if !self.store.folder_exists(&key) {
            return Err(MailboxError::NoSuchMailbox(name.wire_name()));
        }

        let row = match self.db.fetch_mailbox(&key).await.map_err(db_error(&key))? {
            Some(row) => row,
            None => self.create_row(&key).await?,
        };

        let mailbox = Mailbox::from_row(
            row,
            self.store.folder(&key),
            self.db.clone(),
            self.cache.clone(),
        )
        .await?;
        mailbox
            .set_has_children(self.has_inferiors(&key).await?)
            .await;

        let mut mailboxes = self.mailboxes.lock().await;
        // Another task may have raced us here; first one in wins.
        let entry = mailboxes.entry(key).or_insert(mailbox);
        Ok(entry.clone())
    }

    async fn create_row(&self, name: &str) -> Result<MailboxRow, MailboxError> {
        let uid_vv = self.db.next_uid_vv().await.map_err(db_error(name))?;
        let mut row = MailboxRow {
            id: 0,
            name: name.to_string(),
            uid_vv,
            attributes: vec![MailboxAttribute::Unmarked, MailboxAttribute::HasNoChildren],
            mtime: 0,
            next_uid: 1,
            num_msgs: 0,
            num_recent: 0,
            uids: Vec::new(),
            last_resync: 0,
            subscribed: false,
        };
        row.id = self.db.save_mailbox(&row).await.map_err(db_error(name))?;
        info!("registered mailbox {name} with uid_validity {uid_vv}");
        Ok(row)
    }

    async fn has_inferiors(&self, name: &str) -> Result<bool, MailboxError> {
        let prefix = format!("{name}/");
        Ok(self
            .store
            .list_folders()
            .await?
            .iter()
            .any(|folder| folder.starts_with(&prefix)))
    }

    /// Walk the MH root and register every folder we have not seen yet.
    /// Run at startup so LIST answers without materialising anything.
    pub async fn find_all_folders(&self) -> Result<(), MailboxError> {
        let mut names = self.store.list_folders().await?;
        if !names.iter().any(|name| name == "inbox") {
            names.push("inbox".to_string());
        }

        for name in &names {
            if self
                .db
                .fetch_mailbox(name)
                .await
                .map_err(db_error(name))?
                .is_none()
            {
                let mut row = self.create_row(name).await?;
                let prefix = format!("{name}/");
                let has_children = names.iter().any(|other| other.starts_with(&prefix));
                row.attributes = vec![
                    MailboxAttribute::Unmarked,
                    if has_children {
                        MailboxAttribute::HasChildren
                    } else {
                        MailboxAttribute::HasNoChildren
                    },
                ];
                self.db.save_mailbox(&row).await.map_err(db_error(name))?;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Mailbox-level commands (CREATE / DELETE / RENAME / LIST / STATUS).

    pub async fn create_mailbox(&self, name: &MailboxName) -> Result<(), CommandError> {
        if name.is_inbox() {
            return Err(CommandError::no("INBOX always exists"));
        }
        validate_name(name)?;

        // A \Noselect tombstone may be re-created; it gets a brand new
        // identity rather than reviving the old uid-validity.
        let tombstone = matches!(
            self.db
                .fetch_mailbox(name.as_str())
                .await
                .map_err(db_error(name.as_str()))?,
            Some(row) if row.attributes.contains(&MailboxAttribute::Noselect)
        );

        if self.store.folder_exists(name.as_str()) {
            if !tombstone {
                return Err(CommandError::no(format!(
                    "mailbox already exists: {name}"
                )));
            }
        } else {
            self.store.create_folder(name.as_str()).await?;
        }

        if tombstone {
            self.mailboxes.lock().await.remove(name.as_str());
            self.db
                .delete_mailbox(name.as_str())
                .await
                .map_err(db_error(name.as_str()))?;
        }

        self.get_mailbox(name).await?;
        // Creating `a/b` implicitly creates `a`; pick up any such
        // intermediates.
        self.find_all_folders().await?;
        self.refresh_parent_attributes(name).await;
        Ok(())
    }

    pub async fn delete_mailbox(&self, name: &MailboxName) -> Result<(), CommandError> {
        if name.is_inbox() {
            return Err(CommandError::no("INBOX may not be deleted"));
        }

        let mailbox = self.get_mailbox(name).await?;
        if mailbox.has_clients().await {
            return Err(CommandError::no(format!("mailbox {name} is in use")));
        }

        let has_inferiors = self.has_inferiors(name.as_str()).await?;
        let subscribed = mailbox.subscribed().await;

        // Either way the messages go.
        let folder = self.store.folder(name.as_str());
        let lock = folder.lock().await?;
        let mut result = Ok(());
        match folder.keys().await {
            Ok(keys) => {
                for key in keys {
                    if let Err(error) = folder.remove(key).await {
                        result = Err(error);
                        break;
                    }
                }
            }
            Err(error) => result = Err(error),
        }
        if result.is_ok() {
            result = folder.set_sequences(&Default::default()).await;
        }
        lock.unlock();
        result?;
        self.cache.lock().unwrap().clear_folder(name.as_str());

        if has_inferiors || subscribed {
            // Keep the name as a \Noselect tombstone with a fresh
            // uid-validity, so a later re-creation is distinguishable.
            let uid_vv = self
                .db
                .next_uid_vv()
                .await
                .map_err(db_error(name.as_str()))?;
            mailbox.tombstone(uid_vv).await?;
        } else {
            self.mailboxes.lock().await.remove(name.as_str());
            self.store.remove_folder(name.as_str()).await?;
            self.db
                .delete_mailbox(name.as_str())
                .await
                .map_err(db_error(name.as_str()))?;
        }

        self.refresh_parent_attributes(name).await;
        Ok(())
    }

    pub async fn rename_mailbox(
        &self,
        from: &MailboxName,
        to: &MailboxName,
    ) -> Result<(), CommandError> {
        validate_name(to)?;
        if to.is_inbox() || self.store.folder_exists(to.as_str()) {
            return Err(CommandError::no(format!("mailbox already exists: {to}")));
        }

        if from.is_inbox() {
            return self.rename_inbox(to).await;
        }

        let mailbox = self.get_mailbox(from).await?;
        if mailbox.has_clients().await {
            return Err(CommandError::no(format!("mailbox {from} is in use")));
        }

        // Drop in-memory instances of the folder and its inferiors; they
        // re-materialise under the new name on demand.
        {
            let mut mailboxes = self.mailboxes.lock().await;
            let prefix = format!("{}/", from.as_str());
            mailboxes.retain(|name, _| name != from.as_str() && !name.starts_with(&prefix));
        }
        self.cache.lock().unwrap().clear_folder(from.as_str());

        self.store
            .rename_folder(from.as_str(), to.as_str())
            .await?;
        self.db
            .rename_mailbox(from.as_str(), to.as_str())
            .await
            .map_err(db_error(from.as_str()))?;

        self.refresh_parent_attributes(from).await;
        self.refresh_parent_attributes(to).await;
        Ok(())
    }

    /// RENAME of INBOX moves its messages into a freshly created folder
    /// and leaves INBOX empty.
    async fn rename_inbox(&self, to: &MailboxName) -> Result<(), CommandError> {
        self.create_mailbox(to).await?;
        let destination = self.get_mailbox(to).await?;
        let inbox = self.get_mailbox(&MailboxName::new("inbox")).await?;
        inbox.move_all_messages(&destination).await?;
        Ok(())
    }

    /// LIST/LSUB: every known mailbox matching the pattern, with its
    /// current attributes.
    pub async fn list_mailboxes(
        &self,
        reference: &str,
        pattern: &str,
        subscribed_only: bool,
    ) -> Result<Vec<(String, Vec<MailboxAttribute>)>, CommandError> {
        let regex = pattern_to_regex(reference, pattern)
            .map_err(|_| CommandError::bad("unparsable LIST pattern"))?;

        let rows = self
            .db
            .all_mailboxes()
            .await
            .map_err(db_error("mailbox list"))?;

        let mut out = Vec::new();
        for row in rows {
            if subscribed_only && !row.subscribed {
                continue;
            }
            let wire_name = if row.name == "inbox" {
                "INBOX".to_string()
            } else {
                row.name.clone()
            };
            if regex.is_match(&row.name) || regex.is_match(&wire_name) {
                // Prefer live attributes when the folder is materialised.
                let attributes = match self.mailboxes.lock().await.get(&row.name) {
                    Some(mailbox) => mailbox.attributes().await,
                    None => row.attributes,
                };
                out.push((wire_name, attributes));
            }
        }
        Ok(out)
    }

    async fn refresh_parent_attributes(&self, name: &MailboxName) {
        let Some((parent, _)) = name.as_str().rsplit_once('/') else {
            return;
        };
        let parent = MailboxName::new(parent);
        if let Ok(mailbox) = self.get_mailbox(&parent).await {
            match self.has_inferiors(parent.as_str()).await {
                Ok(has_children) => mailbox.set_has_children(has_children).await,
                Err(error) => warn!("checking inferiors of {parent}: {error}"),
            }
        }
    }

    // ------------------------------------------------------------------
    // Background work.

    async fn housekeeping(self: &Arc<Self>, full_sweep: bool) {
        let active: Vec<Arc<Mailbox>> =
            self.mailboxes.lock().await.values().cloned().collect();

        for mailbox in &active {
            // Folders someone is idling on get refreshed so IDLE clients
            // hear about external deliveries promptly.
            if mailbox.has_idling_clients().await {
                if let Err(error) = mailbox.resync(ResyncOptions::default()).await {
                    warn!("resync of {} failed: {error}", mailbox.name());
                }
            }
        }

        // Expire folders nobody has touched in a while.
        let mut expired = Vec::new();
        {
            let mut mailboxes = self.mailboxes.lock().await;
            let expiry = self.config.folder_idle_expiry;
            let names: Vec<String> = mailboxes.keys().cloned().collect();
            for name in names {
                let mailbox = mailboxes[&name].clone();
                if let Some(idle) = mailbox.idle_for().await {
                    if idle >= expiry && !mailbox.has_queued_commands().await {
                        mailboxes.remove(&name);
                        expired.push(mailbox);
                    }
                }
            }
        }
        for mailbox in expired {
            debug!("expiring idle folder {}", mailbox.name());
            if let Err(error) = mailbox.commit_state().await {
                error!("committing {} on expiry: {error}", mailbox.name());
            }
            self.cache.lock().unwrap().clear_folder(mailbox.name());
        }

        if full_sweep {
            self.sweep_changed_folders().await;
        }

        self.process_command_queues().await;
    }

    /// Compare every known folder's stored mtime against the disk and
    /// resync the ones that moved. Folders not in memory are materialised
    /// (and later expired again).
    async fn sweep_changed_folders(&self) {
        let rows = match self.db.all_mailboxes().await {
            Ok(rows) => rows,
            Err(error) => {
                error!("mtime sweep could not list mailboxes: {error}");
                return;
            }
        };

        for row in rows {
            if row.attributes.contains(&MailboxAttribute::Noselect) {
                continue;
            }
            let folder = self.store.folder(&row.name);
            let on_disk = match folder.mtime().await {
                Ok(mtime) => mtime,
                // Scan problems are a next-tick problem.
                Err(error) => {
                    debug!("skipping {} this sweep: {error}", row.name);
                    continue;
                }
            };
            if on_disk == row.mtime {
                continue;
            }

            debug!(
                "{}: on-disk mtime {on_disk} != stored {}; resyncing",
                row.name, row.mtime
            );
            match self.get_mailbox(&MailboxName::new(&row.name)).await {
                Ok(mailbox) => {
                    if let Err(error) = mailbox.resync(ResyncOptions::default()).await {
                        warn!("sweep resync of {} failed: {error}", row.name);
                    }
                }
                Err(error) => warn!("sweep could not open {}: {error}", row.name),
            }
        }
    }

    /// Round-robin the continuation queues: one queued command per folder
    /// per lap, within a wall-clock budget.
    pub async fn process_command_queues(self: &Arc<Self>) {
        let started = tokio::time::Instant::now();

        loop {
            let active: Vec<Arc<Mailbox>> =
                self.mailboxes.lock().await.values().cloned().collect();

            let mut ran_any = false;
            for mailbox in active {
                if started.elapsed() > QUEUE_BUDGET {
                    return;
                }
                let Some(mut queued) = mailbox.pop_queued_command().await else {
                    continue;
                };
                ran_any = true;

                let result = client::run_selected_verb(
                    self,
                    &mailbox,
                    &queued.handle,
                    queued.read_only,
                    &mut queued.command,
                )
                .await;

                match result {
                    Ok((Progress::Yielded, _)) => {
                        mailbox.push_queued_command(queued).await;
                    }
                    Ok((Progress::Done, code)) => {
                        client::push_tagged_ok(&queued.handle, &queued.command, code);
                    }
                    Err(CommandError::Lock(_)) => {
                        // Still contended; try again next lap.
                        mailbox.push_queued_command(queued).await;
                    }
                    Err(error) => {
                        client::push_tagged_err(&queued.handle, &queued.command, &error);
                    }
                }
            }

            if !ran_any {
                return;
            }
        }
    }
}

fn db_error(name: &str) -> impl Fn(sqlx::Error) -> MailboxError + '_ {
    move |error| MailboxError::Inconsistency {
        mailbox: name.to_string(),
        reason: format!("database: {error}"),
    }
}

/// Mailbox names must stay inside the MH root, and a name that is just
/// digits is forbidden; MH would read it as a message key.
fn validate_name(name: &MailboxName) -> Result<(), MailboxError> {
    let raw = name.as_str();
    if raw.is_empty() || raw.bytes().all(|byte| byte.is_ascii_digit()) {
        return Err(MailboxError::InvalidMailboxName(raw.to_string()));
    }
    for component in raw.split('/') {
        if component.is_empty() || component == "." || component == ".." {
            return Err(MailboxError::InvalidMailboxName(raw.to_string()));
        }
    }
    Ok(())
}

/// Translate a LIST pattern into an anchored regex: `*` crosses hierarchy
/// boundaries, `%` does not.
fn pattern_to_regex(reference: &str, pattern: &str) -> Result<regex::Regex, regex::Error> {
    let full = format!("{reference}{pattern}");
    let mut translated = String::with_capacity(full.len() + 8);
    translated.push('^');
    for ch in full.chars() {
        match ch {
            '*' => translated.push_str(".*"),
            '%' => translated.push_str("[^/]*"),
            other => translated.push_str(&regex::escape(&other.to_string())),
        }
    }
    translated.push('$');
    regex::Regex::new(&translated)
}
