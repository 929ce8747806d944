//! Size-bounded cache of parsed messages.
//!
//! Parsing a MIME tree is the expensive step of FETCH/SEARCH, so parsed
//! messages are kept across commands, keyed by `(folder, message-key)`.
//! The budget is measured over the CRLF-serialised size; when it
//! overflows, the globally least-recently-used entry goes, whatever folder
//! it belongs to. Entries are owned by the cache; consumers get `Arc`
//! clones.

use std::sync::Arc;

use log::debug;
use lru::LruCache;

use crate::message::Message;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    folder: String,
    msg_key: u32,
}

#[derive(Debug)]
pub struct MessageCache {
    entries: LruCache<CacheKey, Arc<Message>>,
    max_bytes: usize,
    current_bytes: usize,
}

impl MessageCache {
    pub fn new(max_bytes: usize) -> MessageCache {
        MessageCache {
            entries: LruCache::unbounded(),
            max_bytes,
            current_bytes: 0,
        }
    }

    pub fn current_bytes(&self) -> usize {
        self.current_bytes
    }

    /// Insert (or replace) a parsed message, evicting the oldest entries
    /// until the byte budget holds again.
    pub fn add(&mut self, folder: &str, msg_key: u32, message: Arc<Message>) {
        let key = CacheKey {
            folder: folder.to_string(),
            msg_key,
        };

        if let Some(previous) = self.entries.put(key, message.clone()) {
            self.current_bytes -= previous.size();
        }
        self.current_bytes += message.size();

        while self.current_bytes > self.max_bytes {
            match self.entries.pop_lru() {
                Some((evicted_key, evicted)) => {
                    self.current_bytes -= evicted.size();
                    debug!(
                        "cache evicted {}/{} ({} bytes)",
                        evicted_key.folder,
                        evicted_key.msg_key,
                        evicted.size()
                    );
                }
                None => break,
            }
        }
    }

    /// Look up a message, refreshing its recency.
    pub fn get(&mut self, folder: &str, msg_key: u32) -> Option<Arc<Message>> {
        let key = CacheKey {
            folder: folder.to_string(),
            msg_key,
        };
        self.entries.get(&key).cloned()
    }

    pub fn remove(&mut self, folder: &str, msg_key: u32) {
        let key = CacheKey {
            folder: folder.to_string(),
            msg_key,
        };
        if let Some(removed) = self.entries.pop(&key) {
            self.current_bytes -= removed.size();
        }
    }

    /// Drop every entry belonging to one folder; any write to a folder
    /// invalidates this way.
    pub fn clear_folder(&mut self, folder: &str) {
        let keys: Vec<CacheKey> = self
            .entries
            .iter()
            .filter(|(key, _)| key.folder == folder)
            .map(|(key, _)| key.clone())
            .collect();
        for key in keys {
            if let Some(removed) = self.entries.pop(&key) {
                self.current_bytes -= removed.size();
            }
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.current_bytes = 0;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(padding: usize) -> Arc<Message> {
        let mut bytes = b"Subject: x\r\n\r\n".to_vec();
        bytes.extend(std::iter::repeat(b'a').take(padding));
        bytes.extend_from_slice(b"\r\n");
        Arc::new(Message::parse(&bytes).unwrap())
    }

    #[test]
    fn add_get_remove() {
        let mut cache = MessageCache::new(1024 * 1024);
        cache.add("inbox", 1, message(10));
        cache.add("inbox", 2, message(10));

        assert!(cache.get("inbox", 1).is_some());
        assert!(cache.get("inbox", 3).is_none());
        assert!(cache.get("archive", 1).is_none());

        cache.remove("inbox", 1);
        assert!(cache.get("inbox", 1).is_none());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn byte_budget_evicts_globally_oldest() {
        let each = message(100).size();
        let mut cache = MessageCache::new(each * 3);

        cache.add("a", 1, message(100));
        cache.add("a", 2, message(100));
        cache.add("b", 1, message(100));
        assert_eq!(cache.len(), 3);

        // Touch a/1 so a/2 is the global LRU, then overflow.
        cache.get("a", 1);
        cache.add("b", 2, message(100));

        assert_eq!(cache.len(), 3);
        assert!(cache.get("a", 2).is_none());
        assert!(cache.get("a", 1).is_some());
        assert!(cache.current_bytes() <= each * 3);
    }

    #[test]
    fn replace_accounts_bytes_once() {
        let mut cache = MessageCache::new(1024 * 1024);
        cache.add("inbox", 1, message(10));
        let first = cache.current_bytes();
        cache.add("inbox", 1, message(10));
        assert_eq!(cache.current_bytes(), first);
    }

    #[test]
    fn clear_folder_only_touches_that_folder() {
        let mut cache = MessageCache::new(1024 * 1024);
        cache.add("inbox", 1, message(10));
        cache.add("inbox", 2, message(10));
        cache.add("archive", 1, message(10));

        cache.clear_folder("inbox");
        assert!(cache.get("inbox", 1).is_none());
        assert!(cache.get("inbox", 2).is_none());
        assert!(cache.get("archive", 1).is_some());
    }
}
