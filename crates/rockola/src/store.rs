//! Persistent server state.
//!
//! Users, per-track preferences, global preferences, playlists, scheduled
//! events and the queue snapshot all live as JSON files under the state
//! directory. Writes are atomic (temp file + rename); every mutator
//! persists immediately, so a crash loses nothing but the in-flight change.
//!
//! This is the file-backed implementation behind the narrow TrackDB seam
//! the core consumes; the track index itself lives in [`crate::trackdb`].

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use rand::Rng;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use rockoproto::Rights;

use crate::queue::QueueEntry;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("corrupt state file {path}: {source}")]
    Corrupt {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// A persisted user record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub password: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Rights string as granted; parsed on demand.
    pub rights: String,
    /// Present while registration is awaiting confirmation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmation: Option<String>,
    /// Cookies issued before this stamp are dead.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revoked_at: Option<u64>,
    #[serde(default)]
    pub created: u64,
}

impl UserRecord {
    pub fn rights(&self) -> Rights {
        Rights::parse(&self.rights).unwrap_or_else(|e| {
            warn!(rights = %self.rights, error = %e, "ignoring unparseable stored rights");
            Rights::empty()
        })
    }

    /// Registered users cannot log in until confirmed.
    pub fn is_confirmed(&self) -> bool {
        self.confirmation.is_none()
    }
}

/// Playlist visibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sharing {
    /// Readable by everyone, writable by the owner.
    Public,
    /// Owner only.
    Private,
    /// Readable and writable by anyone with the play right.
    Shared,
}

impl Sharing {
    pub fn as_str(self) -> &'static str {
        match self {
            Sharing::Public => "public",
            Sharing::Private => "private",
            Sharing::Shared => "shared",
        }
    }

    pub fn parse(s: &str) -> Option<Sharing> {
        match s {
            "public" => Some(Sharing::Public),
            "private" => Some(Sharing::Private),
            "shared" => Some(Sharing::Shared),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Playlist {
    pub owner: String,
    pub sharing: Sharing,
    pub lines: Vec<String>,
}

/// A persisted scheduled event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledEvent {
    pub id: String,
    pub who: String,
    /// Trigger time, seconds since epoch.
    pub when: u64,
    pub priority: String,
    /// `play` or `set-global`.
    pub action: String,
    pub args: Vec<String>,
}

/// Usernames travel on the wire unquoted in cookies and events; keep them
/// to a tame charset.
pub fn valid_username(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@'))
}

pub struct Store {
    home: PathBuf,
    users: BTreeMap<String, UserRecord>,
    prefs: BTreeMap<String, BTreeMap<String, String>>,
    globals: BTreeMap<String, String>,
    playlists: BTreeMap<String, Playlist>,
    schedule: BTreeMap<String, ScheduledEvent>,
    /// Last played time per track, for the random chooser's replay gap.
    played: BTreeMap<String, u64>,
}

impl Store {
    pub fn open(home: &Path) -> Result<Store, StoreError> {
        std::fs::create_dir_all(home).map_err(|source| StoreError::Io {
            path: home.to_path_buf(),
            source,
        })?;
        let store = Store {
            home: home.to_path_buf(),
            users: load_json(&home.join("users.json"))?,
            prefs: load_json(&home.join("prefs.json"))?,
            globals: load_json(&home.join("globals.json"))?,
            playlists: load_json(&home.join("playlists.json"))?,
            schedule: load_json(&home.join("schedule.json"))?,
            played: load_json(&home.join("played.json"))?,
        };
        debug!(
            home = %home.display(),
            users = store.users.len(),
            "state store opened"
        );
        Ok(store)
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    // --- users ---

    pub fn user(&self, name: &str) -> Option<&UserRecord> {
        self.users.get(name)
    }

    pub fn usernames(&self) -> impl Iterator<Item = &str> {
        self.users.keys().map(|s| s.as_str())
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    /// Create a user; fails if the name is taken or invalid.
    pub fn create_user(&mut self, name: &str, record: UserRecord) -> Result<bool, StoreError> {
        if !valid_username(name) || self.users.contains_key(name) {
            return Ok(false);
        }
        self.users.insert(name.to_string(), record);
        self.save_users()?;
        Ok(true)
    }

    pub fn delete_user(&mut self, name: &str) -> Result<bool, StoreError> {
        let existed = self.users.remove(name).is_some();
        if existed {
            self.save_users()?;
        }
        Ok(existed)
    }

    /// Mutate a user record in place; persists when the closure returns
    /// `true`.
    pub fn update_user(
        &mut self,
        name: &str,
        f: impl FnOnce(&mut UserRecord) -> bool,
    ) -> Result<bool, StoreError> {
        let Some(record) = self.users.get_mut(name) else {
            return Ok(false);
        };
        if f(record) {
            self.save_users()?;
        }
        Ok(true)
    }

    /// Find the user awaiting confirmation with this token.
    pub fn user_by_confirmation(&self, token: &str) -> Option<&str> {
        self.users
            .iter()
            .find(|(_, r)| r.confirmation.as_deref() == Some(token))
            .map(|(name, _)| name.as_str())
    }

    fn save_users(&self) -> Result<(), StoreError> {
        save_json(&self.home.join("users.json"), &self.users)
    }

    // --- per-track preferences ---

    pub fn pref(&self, track: &str, key: &str) -> Option<&str> {
        self.prefs.get(track)?.get(key).map(|s| s.as_str())
    }

    pub fn prefs_of(&self, track: &str) -> impl Iterator<Item = (&str, &str)> {
        self.prefs
            .get(track)
            .into_iter()
            .flat_map(|m| m.iter().map(|(k, v)| (k.as_str(), v.as_str())))
    }

    pub fn set_pref(&mut self, track: &str, key: &str, value: &str) -> Result<(), StoreError> {
        self.prefs
            .entry(track.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
        save_json(&self.home.join("prefs.json"), &self.prefs)
    }

    pub fn unset_pref(&mut self, track: &str, key: &str) -> Result<bool, StoreError> {
        let Some(map) = self.prefs.get_mut(track) else {
            return Ok(false);
        };
        let existed = map.remove(key).is_some();
        if map.is_empty() {
            self.prefs.remove(track);
        }
        if existed {
            save_json(&self.home.join("prefs.json"), &self.prefs)?;
        }
        Ok(existed)
    }

    /// All tracks carrying any preference; used by `search` for tag terms.
    pub fn tracks_with_prefs(&self) -> impl Iterator<Item = (&str, &BTreeMap<String, String>)> {
        self.prefs.iter().map(|(t, m)| (t.as_str(), m))
    }

    // --- global preferences ---

    pub fn global(&self, key: &str) -> Option<&str> {
        self.globals.get(key).map(|s| s.as_str())
    }

    pub fn set_global(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        self.globals.insert(key.to_string(), value.to_string());
        save_json(&self.home.join("globals.json"), &self.globals)
    }

    pub fn unset_global(&mut self, key: &str) -> Result<bool, StoreError> {
        let existed = self.globals.remove(key).is_some();
        if existed {
            save_json(&self.home.join("globals.json"), &self.globals)?;
        }
        Ok(existed)
    }

    /// Play is enabled unless explicitly turned off.
    pub fn playing_enabled(&self) -> bool {
        self.global("playing") != Some("no")
    }

    /// Random play is enabled unless explicitly turned off.
    pub fn random_enabled(&self) -> bool {
        self.global("random-play") != Some("no")
    }

    // --- playlists ---

    pub fn playlist(&self, name: &str) -> Option<&Playlist> {
        self.playlists.get(name)
    }

    pub fn playlists(&self) -> impl Iterator<Item = (&str, &Playlist)> {
        self.playlists.iter().map(|(n, p)| (n.as_str(), p))
    }

    pub fn set_playlist(&mut self, name: &str, playlist: Playlist) -> Result<(), StoreError> {
        self.playlists.insert(name.to_string(), playlist);
        save_json(&self.home.join("playlists.json"), &self.playlists)
    }

    pub fn delete_playlist(&mut self, name: &str) -> Result<bool, StoreError> {
        let existed = self.playlists.remove(name).is_some();
        if existed {
            save_json(&self.home.join("playlists.json"), &self.playlists)?;
        }
        Ok(existed)
    }

    // --- scheduled events ---

    pub fn schedule_ids(&self) -> impl Iterator<Item = &str> {
        self.schedule.keys().map(|s| s.as_str())
    }

    pub fn scheduled_event(&self, id: &str) -> Option<&ScheduledEvent> {
        self.schedule.get(id)
    }

    /// Earliest pending event, if any.
    pub fn next_scheduled(&self) -> Option<&ScheduledEvent> {
        self.schedule.values().min_by_key(|e| e.when)
    }

    pub fn add_scheduled(
        &mut self,
        who: String,
        when: u64,
        priority: String,
        action: String,
        args: Vec<String>,
    ) -> Result<String, StoreError> {
        let id = format!("{:08x}", rand::thread_rng().gen::<u32>());
        let event = ScheduledEvent {
            id: id.clone(),
            who,
            when,
            priority,
            action,
            args,
        };
        self.schedule.insert(id.clone(), event);
        save_json(&self.home.join("schedule.json"), &self.schedule)?;
        Ok(id)
    }

    pub fn delete_scheduled(&mut self, id: &str) -> Result<bool, StoreError> {
        let existed = self.schedule.remove(id).is_some();
        if existed {
            save_json(&self.home.join("schedule.json"), &self.schedule)?;
        }
        Ok(existed)
    }

    // --- played times ---

    pub fn played_time(&self, track: &str) -> Option<u64> {
        self.played.get(track).copied()
    }

    pub fn note_played(&mut self, track: &str, now: u64) -> Result<(), StoreError> {
        self.played.insert(track.to_string(), now);
        save_json(&self.home.join("played.json"), &self.played)
    }

    // --- queue snapshot ---

    /// One marshalled entry per line.
    pub fn save_queue(&self, entries: &[QueueEntry]) -> Result<(), StoreError> {
        let path = self.home.join("queue");
        let mut text = String::new();
        for entry in entries {
            text.push_str(&serde_json::to_string(entry).map_err(|source| StoreError::Corrupt {
                path: path.clone(),
                source,
            })?);
            text.push('\n');
        }
        atomic_write(&path, text.as_bytes())
    }

    /// Unreadable lines are skipped with a warning rather than refusing to
    /// start.
    pub fn load_queue(&self) -> Result<Vec<QueueEntry>, StoreError> {
        let path = self.home.join("queue");
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(StoreError::Io { path, source }),
        };
        let mut entries = Vec::new();
        for (lineno, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<QueueEntry>(line) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!(
                    path = %path.display(),
                    line = lineno + 1,
                    error = %e,
                    "skipping unreadable queue entry"
                ),
            }
        }
        Ok(entries)
    }
}

pub(crate) fn load_json<T: DeserializeOwned + Default>(path: &Path) -> Result<T, StoreError> {
    match std::fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes).map_err(|source| StoreError::Corrupt {
            path: path.to_path_buf(),
            source,
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(source) => Err(StoreError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

pub(crate) fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let json = serde_json::to_vec_pretty(value).map_err(|source| StoreError::Corrupt {
        path: path.to_path_buf(),
        source,
    })?;
    atomic_write(path, &json)
}

fn atomic_write(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let io_err = |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };
    let tmp = path.with_extension("tmp");
    let mut file = std::fs::File::create(&tmp).map_err(io_err)?;
    file.write_all(bytes).map_err(io_err)?;
    file.sync_all().map_err(io_err)?;
    std::fs::rename(&tmp, path).map_err(io_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{Origin, Queue};
    use pretty_assertions::assert_eq;

    fn store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        (dir, store)
    }

    fn user(rights: &str) -> UserRecord {
        UserRecord {
            password: "pw".to_string(),
            email: None,
            rights: rights.to_string(),
            confirmation: None,
            revoked_at: None,
            created: 0,
        }
    }

    #[test]
    fn test_users_persist_across_reopen() {
        let (dir, mut store) = store();
        assert!(store.create_user("alice", user("read,play")).unwrap());
        assert!(!store.create_user("alice", user("read")).unwrap(), "duplicate refused");

        let store = Store::open(dir.path()).unwrap();
        let alice = store.user("alice").unwrap();
        assert_eq!(alice.rights(), Rights::READ | Rights::PLAY);
    }

    #[test]
    fn test_invalid_usernames_refused() {
        let (_dir, mut store) = store();
        assert!(!store.create_user("", user("read")).unwrap());
        assert!(!store.create_user("has space", user("read")).unwrap());
        assert!(!store.create_user("semi;colon", user("read")).unwrap());
        assert!(store.create_user("ok-name_2@host", user("read")).unwrap());
    }

    #[test]
    fn test_update_user() {
        let (_dir, mut store) = store();
        store.create_user("alice", user("read")).unwrap();
        let found = store
            .update_user("alice", |u| {
                u.email = Some("a@example.com".to_string());
                true
            })
            .unwrap();
        assert!(found);
        assert_eq!(store.user("alice").unwrap().email.as_deref(), Some("a@example.com"));
        assert!(!store.update_user("nobody", |_| true).unwrap());
    }

    #[test]
    fn test_prefs_distinguish_unset_from_missing() {
        let (_dir, mut store) = store();
        store.set_pref("a.ogg", "tags", "loud, fast").unwrap();
        assert_eq!(store.pref("a.ogg", "tags"), Some("loud, fast"));
        assert_eq!(store.pref("a.ogg", "other"), None);
        assert!(store.unset_pref("a.ogg", "tags").unwrap());
        assert!(!store.unset_pref("a.ogg", "tags").unwrap());
        assert_eq!(store.pref("a.ogg", "tags"), None);
    }

    #[test]
    fn test_globals_round_trip() {
        let (_dir, mut store) = store();
        assert!(store.playing_enabled());
        store.set_global("playing", "no").unwrap();
        assert!(!store.playing_enabled());
        assert!(store.unset_global("playing").unwrap());
        assert!(store.playing_enabled());
    }

    #[test]
    fn test_playlists() {
        let (_dir, mut store) = store();
        store
            .set_playlist(
                "alice.mix",
                Playlist {
                    owner: "alice".to_string(),
                    sharing: Sharing::Private,
                    lines: vec!["a.ogg".to_string()],
                },
            )
            .unwrap();
        assert_eq!(store.playlist("alice.mix").unwrap().lines, vec!["a.ogg"]);
        assert!(store.delete_playlist("alice.mix").unwrap());
        assert!(!store.delete_playlist("alice.mix").unwrap());
    }

    #[test]
    fn test_schedule_orders_by_time() {
        let (_dir, mut store) = store();
        store
            .add_scheduled("alice".into(), 2000, "normal".into(), "play".into(), vec!["t".into()])
            .unwrap();
        let first = store
            .add_scheduled("bob".into(), 1000, "normal".into(), "play".into(), vec!["u".into()])
            .unwrap();
        assert_eq!(store.next_scheduled().unwrap().id, first);
        assert!(store.delete_scheduled(&first).unwrap());
        assert_ne!(store.next_scheduled().unwrap().id, first);
    }

    #[test]
    fn test_queue_snapshot_jsonl() {
        let (dir, store) = store();
        let mut q = Queue::new(10);
        q.push_back("a.ogg".into(), Some("alice".into()), Origin::Picked, 1);
        q.push_back("b.ogg".into(), None, Origin::Random, 2);
        store.save_queue(&q.snapshot()).unwrap();

        // One JSON object per line.
        let text = std::fs::read_to_string(dir.path().join("queue")).unwrap();
        assert_eq!(text.lines().count(), 2);

        let restored = store.load_queue().unwrap();
        assert_eq!(restored.len(), 2);
        assert_eq!(restored[0].track, "a.ogg");
        assert_eq!(restored[1].origin, Origin::Random);
    }

    #[test]
    fn test_queue_snapshot_skips_bad_lines() {
        let (dir, store) = store();
        std::fs::write(
            dir.path().join("queue"),
            "{not json}\n{\"id\":\"x-1\",\"track\":\"t.ogg\",\"origin\":\"picked\",\"state\":\"unplayed\",\"queued_at\":5}\n",
        )
        .unwrap();
        let restored = store.load_queue().unwrap();
        assert_eq!(restored.len(), 1);
        assert_eq!(restored[0].track, "t.ogg");
    }

    #[test]
    fn test_played_times() {
        let (_dir, mut store) = store();
        assert_eq!(store.played_time("a.ogg"), None);
        store.note_played("a.ogg", 1234).unwrap();
        assert_eq!(store.played_time("a.ogg"), Some(1234));
    }
}
