//! Playlists: shared named track lists with a per-connection lock
//! protocol around writes.
//!
//! A connection holds at most one lock. Locks die with the connection,
//! and a stale lock (older than `playlist_lock_timeout`) can be stolen.

use std::rc::Rc;
use std::time::Instant;

use tracing::{debug, info};

use rockoproto::status::{BODY, NOT_AUTHORIZED, NOT_FOUND, OK, VALUE};
use rockoproto::Rights;

use crate::connection::Connection;
use crate::server::{Jukebox, PlaylistLock};
use crate::store::{Playlist, Sharing};

fn can_read(playlist: &Playlist, user: Option<&str>, rights: Rights) -> bool {
    match playlist.sharing {
        Sharing::Public | Sharing::Shared => true,
        Sharing::Private => {
            rights.contains(Rights::ADMIN) || user == Some(playlist.owner.as_str())
        }
    }
}

fn can_write(playlist: &Playlist, user: Option<&str>, rights: Rights) -> bool {
    match playlist.sharing {
        Sharing::Shared => true,
        Sharing::Public | Sharing::Private => {
            rights.contains(Rights::ADMIN) || user == Some(playlist.owner.as_str())
        }
    }
}

pub(super) fn list(jb: &Rc<Jukebox>, conn: &mut Connection) {
    let user = conn.user();
    let rights = conn.rights();
    let store = jb.store.borrow();
    let names: Vec<String> = store
        .playlists()
        .filter(|(_, p)| can_read(p, user.as_deref(), rights))
        .map(|(name, _)| name.to_string())
        .collect();
    conn.reply_body(BODY, "playlists follow", names);
}

pub(super) fn get(jb: &Rc<Jukebox>, conn: &mut Connection, args: &[String]) {
    let store = jb.store.borrow();
    let Some(playlist) = store.playlist(&args[0]) else {
        conn.reply(NOT_FOUND, &format!("no such playlist {:?}", args[0]));
        return;
    };
    if !can_read(playlist, conn.user().as_deref(), conn.rights()) {
        conn.reply(NOT_AUTHORIZED, "not authorized to read that playlist");
        return;
    }
    conn.reply_body(BODY, "playlist follows", playlist.lines.clone());
}

pub(super) fn get_share(jb: &Rc<Jukebox>, conn: &mut Connection, args: &[String]) {
    let store = jb.store.borrow();
    let Some(playlist) = store.playlist(&args[0]) else {
        conn.reply(NOT_FOUND, &format!("no such playlist {:?}", args[0]));
        return;
    };
    if !can_read(playlist, conn.user().as_deref(), conn.rights()) {
        conn.reply(NOT_AUTHORIZED, "not authorized to read that playlist");
        return;
    }
    conn.reply(VALUE, playlist.sharing.as_str());
}

pub(super) fn set_share(jb: &Rc<Jukebox>, conn: &mut Connection, args: &[String]) {
    let Some(sharing) = Sharing::parse(&args[1]) else {
        conn.reply(NOT_FOUND, &format!("bad sharing {:?}", args[1]));
        return;
    };
    let Some(mut playlist) = jb.store.borrow().playlist(&args[0]).cloned() else {
        conn.reply(NOT_FOUND, &format!("no such playlist {:?}", args[0]));
        return;
    };
    if !can_write(&playlist, conn.user().as_deref(), conn.rights()) {
        conn.reply(NOT_AUTHORIZED, "not authorized to share that playlist");
        return;
    }
    playlist.sharing = sharing;
    if let Err(e) = jb.store.borrow_mut().set_playlist(&args[0], playlist) {
        conn.reply(NOT_FOUND, &e.to_string());
        return;
    }
    jb.publish(&format!(
        "playlist_modified {} {}",
        rockoproto::quote_word(&args[0]),
        sharing.as_str()
    ));
    conn.reply(OK, "sharing updated");
}

pub(super) fn lock(jb: &Rc<Jukebox>, conn: &mut Connection, args: &[String]) {
    let name = &args[0];
    if conn.lock.is_some() {
        conn.reply(NOT_FOUND, "already holding a lock");
        return;
    }
    let timeout = jb.config.borrow().playlist_lock_timeout;
    let mut locks = jb.locks.borrow_mut();
    if let Some(existing) = locks.get(name) {
        if existing.taken_at.elapsed() < timeout {
            conn.reply(NOT_FOUND, "already locked");
            return;
        }
        debug!(playlist = %name, "stealing stale playlist lock");
    }
    locks.insert(
        name.clone(),
        PlaylistLock {
            conn_id: conn.shared.id,
            taken_at: Instant::now(),
        },
    );
    conn.lock = Some(name.clone());
    conn.reply(OK, "locked");
}

pub(super) fn unlock(jb: &Rc<Jukebox>, conn: &mut Connection) {
    let Some(name) = conn.lock.take() else {
        conn.reply(NOT_FOUND, "no lock held");
        return;
    };
    jb.locks.borrow_mut().remove(&name);
    conn.reply(OK, "unlocked");
}

/// Body-carrying: the playlist contents follow the command line, dot
/// terminated. Requires the lock on that playlist.
pub(super) async fn set(jb: &Rc<Jukebox>, conn: &mut Connection, args: &[String]) {
    let name = &args[0];
    if conn.lock.as_deref() != Some(name.as_str()) {
        // The body still has to be drained to keep the protocol in sync.
        let _ = conn.read_body().await;
        conn.reply(NOT_FOUND, "playlist is not locked by you");
        return;
    }
    let Ok(Some(lines)) = conn.read_body().await else {
        debug!("connection lost mid-body");
        return;
    };
    let max = jb.config.borrow().playlist_max;
    if lines.len() > max {
        conn.reply(NOT_FOUND, &format!("playlist too long (max {})", max));
        return;
    }

    let user = conn.user();
    let existing = jb.store.borrow().playlist(name).cloned();
    let playlist = match existing {
        Some(mut playlist) => {
            if !can_write(&playlist, user.as_deref(), conn.rights()) {
                conn.reply(NOT_AUTHORIZED, "not authorized to modify that playlist");
                return;
            }
            playlist.lines = lines;
            playlist
        }
        None => {
            let Some(owner) = user else {
                conn.reply(NOT_AUTHORIZED, "not authorized");
                return;
            };
            Playlist {
                owner,
                sharing: Sharing::Private,
                lines,
            }
        }
    };
    if let Err(e) = jb.store.borrow_mut().set_playlist(name, playlist) {
        conn.reply(NOT_FOUND, &e.to_string());
        return;
    }
    info!(playlist = %name, "playlist updated");
    jb.publish(&format!(
        "playlist_modified {}",
        rockoproto::quote_word(name)
    ));
    conn.reply(OK, "playlist set");
}

pub(super) fn delete(jb: &Rc<Jukebox>, conn: &mut Connection, args: &[String]) {
    let name = &args[0];
    {
        let store = jb.store.borrow();
        let Some(playlist) = store.playlist(name) else {
            conn.reply(NOT_FOUND, &format!("no such playlist {:?}", name));
            return;
        };
        if !can_write(playlist, conn.user().as_deref(), conn.rights()) {
            conn.reply(NOT_AUTHORIZED, "not authorized to delete that playlist");
            return;
        }
    }
    match jb.store.borrow_mut().delete_playlist(name) {
        Ok(_) => {
            jb.publish(&format!(
                "playlist_deleted {}",
                rockoproto::quote_word(name)
            ));
            conn.reply(OK, "playlist deleted");
        }
        Err(e) => conn.reply(NOT_FOUND, &e.to_string()),
    }
}
