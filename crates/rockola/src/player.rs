//! Playback orchestration.
//!
//! One local task owns the whole pipeline: it prepares the head of the
//! queue (spawns decoders), starts tracks, pumps PCM from the playing
//! entry's decoder through the mixer driver, and retires finished entries
//! to the recent list. Command handlers never touch the pipeline directly;
//! they mutate queue state, kill decoder children, and poke
//! [`PlayerState::notify`].

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use rand::seq::SliceRandom;
use tokio::io::AsyncReadExt;
use tokio::process::ChildStdout;
use tokio::sync::Notify;
use tracing::{debug, info, trace, warn};

use crate::mixer::{apply_volume, MixerDriver};
use crate::queue::{EntryState, Origin};
use crate::reactor::children::{self, Child};
use crate::server::Jukebox;
use crate::unix_now;

/// PCM chunk pulled from a decoder per iteration (~46ms of stereo 44.1k).
const CHUNK_BYTES: usize = 8192;

/// A spawned decoder waiting for (or feeding) playback.
pub struct PreparedDecoder {
    pub child: Child,
    pub stdout: Option<ChildStdout>,
}

/// Shared control surface between command handlers and the player task.
#[derive(Default)]
pub struct PlayerState {
    /// Kicked whenever queue or play state changes.
    pub notify: Notify,
    /// Decoders by queue entry ID. The player task is the only spawner;
    /// handlers may kill (scratch, remove) but reaping stays here.
    pub decoders: RefCell<HashMap<String, PreparedDecoder>>,
}

impl PlayerState {
    pub fn wake(&self) {
        self.notify.notify_waiters();
    }

    /// Kill the decoder for an entry (if any) and reap it in the
    /// background. Safe to call for entries that were never prepared.
    pub fn discard_decoder(&self, id: &str) {
        if let Some(mut decoder) = self.decoders.borrow_mut().remove(id) {
            decoder.child.start_kill();
            tokio::task::spawn_local(async move {
                let _ = decoder.child.wait().await;
            });
        }
    }
}

/// Outcome of the pause request, mapped to protocol responses by the
/// handler.
#[derive(Debug, PartialEq, Eq)]
pub enum PauseOutcome {
    Paused,
    AlreadyPaused,
    NotPlaying,
    NotPausable,
}

pub fn request_pause(jb: &Jukebox) -> PauseOutcome {
    let mut queue = jb.queue.borrow_mut();
    let Some(playing) = queue.playing_mut() else {
        return PauseOutcome::NotPlaying;
    };
    match playing.state {
        EntryState::Paused => PauseOutcome::AlreadyPaused,
        EntryState::Started => {
            playing.state = EntryState::Paused;
            playing.paused_at = Some(unix_now());
            playing.samples_at_pause = playing.sofar_samples;
            drop(queue);
            jb.player.wake();
            jb.publish("state pause");
            PauseOutcome::Paused
        }
        // Scratch jingles cannot be paused.
        _ => PauseOutcome::NotPausable,
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum ResumeOutcome {
    Resumed,
    NotPaused,
}

pub fn request_resume(jb: &Jukebox) -> ResumeOutcome {
    let mut queue = jb.queue.borrow_mut();
    let Some(playing) = queue.playing_mut() else {
        return ResumeOutcome::NotPaused;
    };
    if playing.state != EntryState::Paused {
        return ResumeOutcome::NotPaused;
    }
    playing.state = EntryState::Started;
    playing.resumed_at = Some(unix_now());
    drop(queue);
    jb.player.wake();
    jb.publish("state resume");
    ResumeOutcome::Resumed
}

#[derive(Debug, PartialEq, Eq)]
pub enum ScratchError {
    NotPlaying,
    WrongId,
}

/// Scratch the playing track: implied resume, terminal `Scratched`, the
/// decoder killed, and a random jingle (if configured) queued next.
pub fn request_scratch(
    jb: &Jukebox,
    who: Option<&str>,
    id: Option<&str>,
) -> Result<String, ScratchError> {
    let scratched_id = {
        let mut queue = jb.queue.borrow_mut();
        let Some(playing) = queue.playing_mut() else {
            return Err(ScratchError::NotPlaying);
        };
        if id.is_some_and(|id| id != playing.id) {
            return Err(ScratchError::WrongId);
        }
        // Scratching a paused track resumes it first; the pipeline needs
        // to run to observe the kill.
        playing.state = EntryState::Scratched;
        playing.scratched_by = who.map(|s| s.to_string());
        playing.id.clone()
    };

    jb.player.discard_decoder(&scratched_id);

    // Queue the jingle ahead of everything else.
    let jingle = {
        let config = jb.config.borrow();
        config
            .scratches
            .choose(&mut rand::thread_rng())
            .cloned()
    };
    if let Some(jingle) = jingle {
        let id = jb
            .queue
            .borrow_mut()
            .push_front(jingle, None, Origin::Scratch, unix_now());
        trace!(id, "queued scratch jingle");
    }

    jb.publish(&format!(
        "scratched {} {}",
        scratched_id,
        who.unwrap_or("-")
    ));
    jb.player.wake();
    jb.save_queue();
    Ok(scratched_id)
}

/// Spawn decoders until the head of the queue is prepared, retiring
/// entries that cannot be played. Idempotent; cheap when the head is
/// already prepared.
pub fn prepare_head(jb: &Jukebox) {
    loop {
        let (id, track) = {
            let queue = jb.queue.borrow();
            match queue.head() {
                Some(head) if !head.prepared => (head.id.clone(), head.track.clone()),
                _ => return,
            }
        };

        let argv = {
            let config = jb.config.borrow();
            config.find_player(&track).map(|p| p.command_for(&track))
        };
        let Some(argv) = argv else {
            warn!(track, "no player configured, retiring entry");
            if let Some(entry) = jb.queue.borrow_mut().retire_pending(&id, EntryState::NoPlayer) {
                jb.publish(&format!("recent {}", entry.id));
            }
            jb.save_queue();
            continue;
        };

        match children::spawn_decoder(&format!("decode:{}", id), &argv) {
            Ok((child, stdout)) => {
                jb.player.decoders.borrow_mut().insert(
                    id.clone(),
                    PreparedDecoder {
                        child,
                        stdout: Some(stdout),
                    },
                );
                if let Some(head) = jb.queue.borrow_mut().head_mut() {
                    head.prepared = true;
                }
                trace!(id, track, "head prepared");
                return;
            }
            Err(e) => {
                warn!(track, error = %e, "decoder spawn failed, retiring entry");
                jb.player.discard_decoder(&id);
                if let Some(entry) = jb.queue.borrow_mut().retire_pending(&id, EntryState::Failed) {
                    jb.publish(&format!("recent {}", entry.id));
                }
                jb.save_queue();
            }
        }
    }
}

/// The player task. Runs until shutdown.
pub async fn run(jb: Rc<Jukebox>, mut driver: MixerDriver) {
    info!("player task running");
    loop {
        if jb.shutdown.is_cancelled() {
            break;
        }

        jb.top_up_random();
        if jb.playing_enabled() {
            prepare_head(&jb);
        }

        let startable = jb.playing_enabled()
            && jb.queue.borrow().playing().is_none()
            && jb.queue.borrow().head().is_some_and(|h| h.prepared);

        if !startable {
            tokio::select! {
                _ = jb.player.notify.notified() => {}
                _ = jb.shutdown.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
            }
            continue;
        }

        // Start the head track.
        let (id, stdout) = {
            let mut queue = jb.queue.borrow_mut();
            let entry = queue.start_head().expect("head checked above");
            entry.state = if entry.origin == Origin::Scratch {
                EntryState::IsScratch
            } else {
                EntryState::Started
            };
            entry.started_at = Some(unix_now());
            let id = entry.id.clone();
            let stdout = jb
                .player
                .decoders
                .borrow_mut()
                .get_mut(&id)
                .and_then(|d| d.stdout.take());
            (id, stdout)
        };
        let Some(stdout) = stdout else {
            // Decoder vanished between preparation and start.
            warn!(id, "prepared decoder missing at start");
            finish(&jb, &id, EntryState::Failed).await;
            continue;
        };

        info!(id, "track started");
        jb.publish(&format!("playing {}", id));
        jb.save_queue();

        let outcome = stream_track(&jb, &mut driver, &id, stdout).await;

        finish(&jb, &id, outcome).await;
    }

    // Shutdown: kill any leftover decoders and snapshot the queue.
    let ids: Vec<String> = jb.player.decoders.borrow().keys().cloned().collect();
    for id in ids {
        jb.player.discard_decoder(&id);
    }
    driver.close().await;
    jb.save_queue();
    info!("player task stopped");
}

/// Pump PCM until EOF, scratch, disable or shutdown. Returns the terminal
/// state the entry should get (scratch verdicts are preserved by the
/// queue).
async fn stream_track(
    jb: &Rc<Jukebox>,
    driver: &mut MixerDriver,
    id: &str,
    mut stdout: ChildStdout,
) -> EntryState {
    let mut buf = vec![0u8; CHUNK_BYTES];
    let mut carry: Option<u8> = None;
    let mut chunks: u64 = 0;

    loop {
        if jb.shutdown.is_cancelled() {
            return EntryState::Quitting;
        }

        let state = jb.queue.borrow().playing().map(|p| p.state);
        match state {
            Some(EntryState::Scratched) => return EntryState::Scratched,
            Some(EntryState::Paused) => {
                tokio::select! {
                    _ = jb.player.notify.notified() => {}
                    _ = jb.shutdown.cancelled() => {}
                }
                continue;
            }
            Some(_) => {}
            None => return EntryState::Failed,
        }

        // Disabling play mid-track behaves like a system scratch.
        if !jb.playing_enabled() {
            jb.player.discard_decoder(id);
            return EntryState::Scratched;
        }

        if driver.ensure_open().await.is_err() {
            // ensure_open imposed its backoff already; try again.
            continue;
        }
        driver.pace().await;

        let n = match stdout.read(&mut buf).await {
            Ok(0) => return EntryState::Ok,
            Ok(n) => n,
            Err(e) => {
                debug!(id, error = %e, "decoder read error");
                return EntryState::Failed;
            }
        };

        // Re-align to 16-bit samples across reads.
        let mut bytes = Vec::with_capacity(n + 1);
        if let Some(b) = carry.take() {
            bytes.push(b);
        }
        bytes.extend_from_slice(&buf[..n]);
        if bytes.len() % 2 != 0 {
            carry = bytes.pop();
        }
        let mut samples: Vec<i16> = bytes
            .chunks_exact(2)
            .map(|pair| i16::from_ne_bytes([pair[0], pair[1]]))
            .collect();

        let (left, right) = jb.volume.get();
        let channels = jb.config.borrow().channels;
        apply_volume(&mut samples, left, right, channels);

        match driver.play(&samples).await {
            Ok(consumed) => {
                if let Some(playing) = jb.queue.borrow_mut().playing_mut() {
                    playing.sofar_samples += consumed as u64;
                }
                chunks += 1;
                if chunks % 64 == 0 {
                    trace!(id, chunks, "streaming");
                }
            }
            Err(e) => {
                // Device trouble: drop this chunk, the driver is now in
                // its error state and will back off before reopening.
                debug!(id, error = %e, "device error, chunk dropped");
            }
        }

        // Keep the next head warm for a gapless transition.
        if jb.queue.borrow().head().is_some_and(|h| !h.prepared) {
            prepare_head(jb);
        }
    }
}

/// Reap the decoder and retire the entry.
async fn finish(jb: &Rc<Jukebox>, id: &str, outcome: EntryState) {
    let decoder = jb.player.decoders.borrow_mut().remove(id);
    let wait_status = match decoder {
        Some(mut decoder) => {
            decoder.child.start_kill();
            match decoder.child.wait().await {
                Ok(status) => Some(status_code(status)),
                Err(e) => {
                    warn!(id, error = %e, "failed to reap decoder");
                    None
                }
            }
        }
        None => None,
    };

    let outcome = match outcome {
        // EOF with a failed exit status means the decoder died midway.
        EntryState::Ok if wait_status.is_some_and(|c| c != 0) => EntryState::Failed,
        other => other,
    };

    let finished = jb.queue.borrow_mut().finish_playing(outcome, wait_status);
    if let Some(entry) = finished {
        info!(id = entry.id, state = entry.state.as_str(), "track finished");
        if let Err(e) = jb.store.borrow_mut().note_played(&entry.track, unix_now()) {
            warn!(error = %e, "could not record played time");
        }
        jb.publish(&format!("recent {}", entry.id));
    }
    jb.save_queue();
    jb.top_up_random();
}

fn status_code(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|s| 128 + s))
        .unwrap_or(-1)
}
