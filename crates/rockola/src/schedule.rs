//! The scheduler task.
//!
//! Sleeps until the earliest persisted event is due, executes it, and
//! deletes it. Events whose trigger time already passed while the server
//! was down are dropped at startup with a warning rather than fired late.

use std::rc::Rc;
use std::time::Duration;

use tracing::{info, warn};

use crate::queue::Origin;
use crate::server::Jukebox;
use crate::store::ScheduledEvent;
use crate::unix_now;

/// Longest nap between re-plans, bounding clock drift.
const MAX_NAP: Duration = Duration::from_secs(60);

pub async fn run(jb: Rc<Jukebox>) {
    drop_stale_events(&jb);

    loop {
        if jb.shutdown.is_cancelled() {
            return;
        }
        let next = jb.store.borrow().next_scheduled().cloned();
        let nap = match next {
            None => MAX_NAP,
            Some(event) => {
                let now = unix_now();
                if event.when <= now {
                    execute(&jb, event);
                    continue;
                }
                Duration::from_secs(event.when - now).min(MAX_NAP)
            }
        };
        tokio::select! {
            _ = tokio::time::sleep(nap) => {}
            _ = jb.schedule_changed.notified() => {}
            _ = jb.shutdown.cancelled() => return,
        }
    }
}

fn drop_stale_events(jb: &Jukebox) {
    let now = unix_now();
    let stale: Vec<String> = {
        let store = jb.store.borrow();
        store
            .schedule_ids()
            .filter(|id| {
                store
                    .scheduled_event(id)
                    .is_some_and(|e| e.when <= now)
            })
            .map(|id| id.to_string())
            .collect()
    };
    for id in stale {
        warn!(id, "dropping scheduled event whose time passed while down");
        if let Err(e) = jb.store.borrow_mut().delete_scheduled(&id) {
            warn!(id, error = %e, "could not delete stale event");
        }
    }
}

fn execute(jb: &Jukebox, event: ScheduledEvent) {
    // Delete first so a panicking action cannot re-fire forever.
    if let Err(e) = jb.store.borrow_mut().delete_scheduled(&event.id) {
        warn!(id = %event.id, error = %e, "could not delete fired event");
    }
    info!(id = %event.id, action = %event.action, who = %event.who, "scheduled event fired");

    match event.action.as_str() {
        "play" => {
            let Some(track) = event.args.first() else {
                warn!(id = %event.id, "play event without a track");
                return;
            };
            if !jb.tracks.borrow().exists(track) {
                warn!(id = %event.id, track, "scheduled track no longer exists");
                return;
            }
            let id = jb.queue.borrow_mut().push_back(
                track.clone(),
                Some(event.who.clone()),
                Origin::Scheduled,
                unix_now(),
            );
            let marshalled = {
                let queue = jb.queue.borrow();
                queue.find(&id).map(|e| jb.marshal_entry(e))
            };
            if let Some(m) = marshalled {
                jb.publish(&format!("queue {}", m));
            }
            jb.save_queue();
            jb.player.wake();
        }
        "set-global" => {
            let (key, value) = match event.args.as_slice() {
                [key] => (key.clone(), None),
                [key, value] => (key.clone(), Some(value.clone())),
                _ => {
                    warn!(id = %event.id, "malformed set-global event");
                    return;
                }
            };
            let result = match &value {
                Some(value) => jb.store.borrow_mut().set_global(&key, value),
                None => jb.store.borrow_mut().unset_global(&key).map(|_| ()),
            };
            match result {
                Ok(()) => {
                    jb.publish(&format!("global_pref {}", rockoproto::quote_word(&key)));
                    jb.player.wake();
                }
                Err(e) => warn!(id = %event.id, error = %e, "set-global failed"),
            }
        }
        other => warn!(id = %event.id, action = %other, "unknown scheduled action"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rockoconf::Config;

    fn jukebox() -> (tempfile::TempDir, Rc<Jukebox>) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.home = dir.path().to_path_buf();
        let jb = Jukebox::new(config, None).unwrap();
        (dir, jb)
    }

    #[test]
    fn test_stale_events_dropped_at_startup() {
        let (_dir, jb) = jukebox();
        jb.store
            .borrow_mut()
            .add_scheduled(
                "alice".into(),
                unix_now() - 100,
                "normal".into(),
                "play".into(),
                vec!["t.ogg".into()],
            )
            .unwrap();
        let future = jb
            .store
            .borrow_mut()
            .add_scheduled(
                "alice".into(),
                unix_now() + 10_000,
                "normal".into(),
                "play".into(),
                vec!["t.ogg".into()],
            )
            .unwrap();

        drop_stale_events(&jb);
        let store = jb.store.borrow();
        let remaining: Vec<&str> = store.schedule_ids().collect();
        assert_eq!(remaining, vec![future.as_str()]);
    }

    #[test]
    fn test_execute_set_global() {
        let (_dir, jb) = jukebox();
        let event = ScheduledEvent {
            id: "ev1".into(),
            who: "alice".into(),
            when: 0,
            priority: "normal".into(),
            action: "set-global".into(),
            args: vec!["required-tag".into(), "party".into()],
        };
        execute(&jb, event);
        assert_eq!(jb.store.borrow().global("required-tag"), Some("party"));
    }

    #[test]
    fn test_execute_play_enqueues_as_scheduled() {
        let (dir, jb) = jukebox();
        // Index one track by hand.
        let root = dir.path().join("music");
        std::fs::create_dir_all(&root).unwrap();
        let track = root.join("a.raw");
        std::fs::write(&track, b"pcm").unwrap();
        {
            let mut config = jb.config.borrow_mut();
            config.collections = vec![root];
            config.players.push(rockoconf::PlayerSpec {
                pattern: "*.raw".into(),
                command: vec!["cat".into()],
            });
        }
        let scanned = crate::trackdb::TrackDb::scan(
            &jb.config.borrow(),
            &crate::trackdb::TrackDb::default(),
            unix_now(),
        );
        *jb.tracks.borrow_mut() = scanned;

        let event = ScheduledEvent {
            id: "ev2".into(),
            who: "alice".into(),
            when: 0,
            priority: "normal".into(),
            action: "play".into(),
            args: vec![track.to_string_lossy().into_owned()],
        };
        execute(&jb, event);
        let queue = jb.queue.borrow();
        let entry = queue.head().unwrap();
        assert_eq!(entry.origin, Origin::Scheduled);
        assert_eq!(entry.submitter.as_deref(), Some("alice"));
    }
}
