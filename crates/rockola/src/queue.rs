//! The queue engine data model.
//!
//! A queue is the optional playing entry, the pending list behind it, and
//! the bounded recent list of terminal entries. The engine is the sole
//! mutator of queue state; everything else observes it through the server
//! context.
//!
//! **Key invariant:** at most one entry is ever in a playing state, and an
//! entry that reaches a terminal state moves to the recent list and never
//! re-enters the queue.

use std::collections::VecDeque;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use rockoproto::quote_word;

/// Lifecycle state of a queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    /// Waiting its turn; the head entry may additionally be prepared.
    Unplayed,
    /// The mixer is draining this entry's decoder.
    Started,
    /// Playing but suspended; resumes to `Started`.
    Paused,
    /// Played to completion.
    Ok,
    /// Forcibly terminated by a user.
    Scratched,
    /// Decoder failed or could not be spawned.
    Failed,
    /// Terminated by server shutdown.
    Quitting,
    /// No decoder is configured for this track.
    NoPlayer,
    /// A scratch jingle, currently playing.
    IsScratch,
}

impl EntryState {
    pub fn is_playing(self) -> bool {
        matches!(self, EntryState::Started | EntryState::Paused | EntryState::IsScratch)
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            EntryState::Ok
                | EntryState::Scratched
                | EntryState::Failed
                | EntryState::Quitting
                | EntryState::NoPlayer
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EntryState::Unplayed => "unplayed",
            EntryState::Started => "started",
            EntryState::Paused => "paused",
            EntryState::Ok => "ok",
            EntryState::Scratched => "scratched",
            EntryState::Failed => "failed",
            EntryState::Quitting => "quitting",
            EntryState::NoPlayer => "no_player",
            EntryState::IsScratch => "is_scratch",
        }
    }
}

/// How an entry got into the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    /// A user picked it.
    Picked,
    /// The random injector chose it.
    Random,
    /// A scratch jingle.
    Scratch,
    /// Random origin claimed by a user.
    Adopted,
    /// Queued by a scheduled event.
    Scheduled,
}

impl Origin {
    pub fn as_str(self) -> &'static str {
        match self {
            Origin::Picked => "picked",
            Origin::Random => "random",
            Origin::Scratch => "scratch",
            Origin::Adopted => "adopted",
            Origin::Scheduled => "scheduled",
        }
    }
}

/// One queued (or recently played) track.
///
/// Serialized one-per-line into the queue snapshot; runtime-only fields
/// (prepared flag, frame counters) are reset on restore.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: String,
    pub track: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submitter: Option<String>,
    pub origin: Origin,
    pub state: EntryState,
    /// Submission time, seconds since epoch.
    pub queued_at: u64,
    /// Derived expected start time; refreshed whenever the queue changes.
    #[serde(default)]
    pub expected_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scratched_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_status: Option<i32>,
    /// Samples played so far.
    #[serde(skip)]
    pub sofar_samples: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resumed_at: Option<u64>,
    /// Samples played when the current pause began.
    #[serde(skip)]
    pub samples_at_pause: u64,
    #[serde(skip)]
    pub prepared: bool,
}

impl QueueEntry {
    /// Seconds of audio played so far.
    pub fn sofar_seconds(&self, sample_rate: u32, channels: u8) -> u64 {
        let per_second = sample_rate as u64 * channels.max(1) as u64;
        self.sofar_samples / per_second.max(1)
    }

    pub fn is_random(&self) -> bool {
        matches!(self.origin, Origin::Random)
    }

    /// Marshal for the wire: `key value` words, quoted as needed, omitting
    /// absent fields. Used by `queue`, `recent`, `playing` and the `queue`
    /// event.
    pub fn marshal(&self, sample_rate: u32, channels: u8) -> String {
        let mut words: Vec<String> = Vec::new();
        let mut push = |k: &str, v: &str| {
            words.push(k.to_string());
            words.push(quote_word(v));
        };
        push("id", &self.id);
        push("track", &self.track);
        if let Some(s) = &self.submitter {
            push("submitter", s);
        }
        push("origin", self.origin.as_str());
        push("state", self.state.as_str());
        push("when", &self.queued_at.to_string());
        if self.expected_at != 0 {
            push("expected", &self.expected_at.to_string());
        }
        if let Some(at) = self.started_at {
            push("played", &at.to_string());
        }
        push("sofar", &self.sofar_seconds(sample_rate, channels).to_string());
        if let Some(s) = &self.scratched_by {
            push("scratched_by", s);
        }
        if let Some(w) = self.wait_status {
            push("wait", &w.to_string());
        }
        words.join(" ")
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("no such queue entry {0:?}")]
    NoSuchEntry(String),
    #[error("cannot move the playing track")]
    MovePlaying,
}

/// The queue proper.
#[derive(Debug)]
pub struct Queue {
    playing: Option<QueueEntry>,
    pending: VecDeque<QueueEntry>,
    recent: VecDeque<QueueEntry>,
    history: usize,
    session: u32,
    next_seq: u64,
}

impl Queue {
    pub fn new(history: usize) -> Self {
        Queue {
            playing: None,
            pending: VecDeque::new(),
            recent: VecDeque::new(),
            history,
            session: rand::thread_rng().gen(),
            next_seq: 1,
        }
    }

    /// IDs are unique for the lifetime of the process: a random session tag
    /// plus a monotonic counter. Restored entries keep their old IDs, which
    /// cannot collide because the session tag is fresh.
    fn allocate_id(&mut self) -> String {
        let id = format!("{:08x}-{:x}", self.session, self.next_seq);
        self.next_seq += 1;
        id
    }

    pub fn playing(&self) -> Option<&QueueEntry> {
        self.playing.as_ref()
    }

    pub fn playing_mut(&mut self) -> Option<&mut QueueEntry> {
        self.playing.as_mut()
    }

    pub fn pending(&self) -> impl Iterator<Item = &QueueEntry> {
        self.pending.iter()
    }

    /// Recent list, newest first.
    pub fn recent(&self) -> impl Iterator<Item = &QueueEntry> {
        self.recent.iter().rev()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn head(&self) -> Option<&QueueEntry> {
        self.pending.front()
    }

    pub fn head_mut(&mut self) -> Option<&mut QueueEntry> {
        self.pending.front_mut()
    }

    /// Is `track` already queued or playing?
    pub fn contains_track(&self, track: &str) -> bool {
        self.playing.iter().chain(self.pending.iter()).any(|e| e.track == track)
    }

    fn new_entry(
        &mut self,
        track: String,
        submitter: Option<String>,
        origin: Origin,
        now: u64,
    ) -> QueueEntry {
        QueueEntry {
            id: self.allocate_id(),
            track,
            submitter,
            origin,
            state: EntryState::Unplayed,
            queued_at: now,
            expected_at: 0,
            scratched_by: None,
            wait_status: None,
            sofar_samples: 0,
            started_at: None,
            paused_at: None,
            resumed_at: None,
            samples_at_pause: 0,
            prepared: false,
        }
    }

    /// Append at the tail; returns the new entry's ID.
    pub fn push_back(
        &mut self,
        track: String,
        submitter: Option<String>,
        origin: Origin,
        now: u64,
    ) -> String {
        let entry = self.new_entry(track, submitter, origin, now);
        let id = entry.id.clone();
        self.pending.push_back(entry);
        id
    }

    /// Insert at the head (next to play).
    pub fn push_front(
        &mut self,
        track: String,
        submitter: Option<String>,
        origin: Origin,
        now: u64,
    ) -> String {
        let entry = self.new_entry(track, submitter, origin, now);
        let id = entry.id.clone();
        self.pending.push_front(entry);
        id
    }

    /// Insert directly after the pending entry `target`.
    pub fn push_after(
        &mut self,
        target: &str,
        track: String,
        submitter: Option<String>,
        origin: Origin,
        now: u64,
    ) -> Result<String, QueueError> {
        let pos = self
            .pending
            .iter()
            .position(|e| e.id == target)
            .ok_or_else(|| QueueError::NoSuchEntry(target.to_string()))?;
        let entry = self.new_entry(track, submitter, origin, now);
        let id = entry.id.clone();
        self.pending.insert(pos + 1, entry);
        Ok(id)
    }

    /// Find a pending or playing entry.
    pub fn find(&self, id: &str) -> Option<&QueueEntry> {
        self.playing
            .iter()
            .chain(self.pending.iter())
            .find(|e| e.id == id)
    }

    pub fn find_mut(&mut self, id: &str) -> Option<&mut QueueEntry> {
        self.playing
            .iter_mut()
            .chain(self.pending.iter_mut())
            .find(|e| e.id == id)
    }

    /// Remove a pending entry. The playing entry cannot be removed, only
    /// scratched.
    pub fn remove(&mut self, id: &str) -> Option<QueueEntry> {
        let pos = self.pending.iter().position(|e| e.id == id)?;
        self.pending.remove(pos)
    }

    /// Move a pending entry by `delta` positions; positive is towards the
    /// head. Returns the new position.
    pub fn move_offset(&mut self, id: &str, delta: i64) -> Result<usize, QueueError> {
        if self.playing.as_ref().is_some_and(|p| p.id == id) {
            return Err(QueueError::MovePlaying);
        }
        let pos = self
            .pending
            .iter()
            .position(|e| e.id == id)
            .ok_or_else(|| QueueError::NoSuchEntry(id.to_string()))?;
        let new_pos = if delta >= 0 {
            pos.saturating_sub(delta as usize)
        } else {
            (pos + (-delta) as usize).min(self.pending.len() - 1)
        };
        let entry = self.pending.remove(pos).expect("position just found");
        self.pending.insert(new_pos, entry);
        Ok(new_pos)
    }

    /// Re-anchor a pending entry directly after `target`, or to the head
    /// when `target` is empty.
    pub fn move_after(&mut self, id: &str, target: &str) -> Result<usize, QueueError> {
        if self.playing.as_ref().is_some_and(|p| p.id == id) {
            return Err(QueueError::MovePlaying);
        }
        if !target.is_empty() && self.pending.iter().all(|e| e.id != target) {
            return Err(QueueError::NoSuchEntry(target.to_string()));
        }
        let pos = self
            .pending
            .iter()
            .position(|e| e.id == id)
            .ok_or_else(|| QueueError::NoSuchEntry(id.to_string()))?;
        let entry = self.pending.remove(pos).expect("position just found");
        let new_pos = if target.is_empty() {
            0
        } else {
            let anchor = self
                .pending
                .iter()
                .position(|e| e.id == target)
                .expect("checked above");
            anchor + 1
        };
        self.pending.insert(new_pos, entry);
        Ok(new_pos)
    }

    /// Promote the head to the playing slot. The caller must have prepared
    /// it and is responsible for setting its state.
    pub fn start_head(&mut self) -> Option<&mut QueueEntry> {
        debug_assert!(self.playing.is_none(), "a track is already playing");
        let entry = self.pending.pop_front()?;
        self.playing = Some(entry);
        self.playing.as_mut()
    }

    /// Retire the playing entry into the recent list with a terminal state.
    pub fn finish_playing(
        &mut self,
        state: EntryState,
        wait_status: Option<i32>,
    ) -> Option<QueueEntry> {
        debug_assert!(state.is_terminal());
        let mut entry = self.playing.take()?;
        // A scratch verdict recorded by the scratch handler wins over the
        // generic exit-status verdict.
        if entry.state != EntryState::Scratched {
            entry.state = state;
        }
        entry.wait_status = wait_status;
        self.recent.push_back(entry.clone());
        while self.recent.len() > self.history {
            self.recent.pop_front();
        }
        Some(entry)
    }

    /// Retire a pending entry straight into the recent list (decoder could
    /// not be spawned, no player configured).
    pub fn retire_pending(&mut self, id: &str, state: EntryState) -> Option<QueueEntry> {
        debug_assert!(state.is_terminal());
        let mut entry = self.remove(id)?;
        entry.state = state;
        self.recent.push_back(entry.clone());
        while self.recent.len() > self.history {
            self.recent.pop_front();
        }
        Some(entry)
    }

    /// Refresh the derived expected start times. `length_of` supplies a
    /// track length in seconds where known.
    pub fn refresh_expected(&mut self, now: u64, length_of: impl Fn(&str) -> Option<u64>) {
        let mut at = now;
        if let Some(playing) = &self.playing {
            if let Some(len) = length_of(&playing.track) {
                at = now + len;
            }
        }
        for entry in &mut self.pending {
            entry.expected_at = at;
            if let Some(len) = length_of(&entry.track) {
                at += len;
            }
        }
    }

    /// Everything worth snapshotting, playing entry first.
    pub fn snapshot(&self) -> Vec<QueueEntry> {
        self.playing
            .iter()
            .chain(self.pending.iter())
            .cloned()
            .collect()
    }

    /// Restore a snapshot: every entry goes back to `Unplayed` and keeps
    /// its old ID.
    pub fn restore(&mut self, entries: Vec<QueueEntry>) {
        for mut entry in entries {
            entry.state = EntryState::Unplayed;
            entry.prepared = false;
            entry.sofar_samples = 0;
            self.pending.push_back(entry);
        }
    }
}
