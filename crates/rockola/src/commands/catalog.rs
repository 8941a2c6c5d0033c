//! Catalog commands: browsing, searching, and the rescanner.

use std::rc::Rc;
use std::time::Duration;

use regex::Regex;
use tracing::info;

use rockoproto::status::{BODY, NOT_FOUND, OK, VALUE};

use crate::connection::Connection;
use crate::server::{spawn_rescan, Jukebox};

use super::resolve_track;

/// Optional case-insensitive filter argument used by `dirs`/`files`.
fn parse_filter(conn: &Connection, arg: Option<&String>) -> Result<Option<Regex>, ()> {
    match arg {
        None => Ok(None),
        Some(pattern) => match Regex::new(&format!("(?i){}", pattern)) {
            Ok(re) => Ok(Some(re)),
            Err(_) => {
                conn.reply(NOT_FOUND, &format!("bad regexp {:?}", pattern));
                Err(())
            }
        },
    }
}

pub(super) fn dirs(jb: &Rc<Jukebox>, conn: &mut Connection, args: &[String]) {
    let Ok(filter) = parse_filter(conn, args.get(1)) else {
        return;
    };
    let lines = jb.tracks.borrow().dirs(&args[0], filter.as_ref());
    conn.reply_body(BODY, "directories follow", lines);
}

pub(super) fn files(jb: &Rc<Jukebox>, conn: &mut Connection, args: &[String], playable_only: bool) {
    let Ok(filter) = parse_filter(conn, args.get(1)) else {
        return;
    };
    let lines = jb
        .tracks
        .borrow()
        .files(&args[0], filter.as_ref(), playable_only);
    conn.reply_body(BODY, "files follow", lines);
}

pub(super) fn exists(jb: &Rc<Jukebox>, conn: &mut Connection, args: &[String]) {
    let found = resolve_track(jb, &args[0]).is_some();
    conn.reply(VALUE, if found { "yes" } else { "no" });
}

pub(super) fn length(jb: &Rc<Jukebox>, conn: &mut Connection, args: &[String]) {
    let Some(track) = resolve_track(jb, &args[0]) else {
        conn.reply(NOT_FOUND, &format!("no such track {:?}", args[0]));
        return;
    };
    let seconds = jb
        .tracks
        .borrow()
        .info(&track)
        .and_then(|i| i.length)
        .unwrap_or(0);
    conn.reply(VALUE, &seconds.to_string());
}

/// Human-oriented name parts derived from the path: title is the file
/// stem, album its directory, artist the directory above that.
pub(super) fn part(jb: &Rc<Jukebox>, conn: &mut Connection, args: &[String]) {
    let Some(track) = resolve_track(jb, &args[0]) else {
        conn.reply(NOT_FOUND, &format!("no such track {:?}", args[0]));
        return;
    };
    // args[1] is the context (display/short); both render identically here.
    let path = std::path::Path::new(&track);
    let value = match args[2].as_str() {
        "title" => path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default(),
        "album" => path
            .parent()
            .and_then(|p| p.file_name())
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default(),
        "artist" => path
            .parent()
            .and_then(|p| p.parent())
            .and_then(|p| p.file_name())
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default(),
        _ => String::new(),
    };
    conn.reply(VALUE, &value);
}

pub(super) fn resolve(jb: &Rc<Jukebox>, conn: &mut Connection, args: &[String]) {
    match resolve_track(jb, &args[0]) {
        Some(track) => conn.reply(VALUE, &track),
        None => conn.reply(NOT_FOUND, &format!("cannot resolve {:?}", args[0])),
    }
}

pub(super) fn search(jb: &Rc<Jukebox>, conn: &mut Connection, args: &[String]) {
    let store = jb.store.borrow();
    let results = jb.tracks.borrow().search(args, |track| {
        store
            .pref(track, "tags")
            .map(split_tags)
            .unwrap_or_default()
    });
    drop(store);
    conn.reply_body(BODY, "search results", results);
}

pub(super) fn tags(jb: &Rc<Jukebox>, conn: &mut Connection) {
    let store = jb.store.borrow();
    let mut all: Vec<String> = store
        .tracks_with_prefs()
        .filter_map(|(_, prefs)| prefs.get("tags"))
        .flat_map(|value| split_tags(value))
        .collect();
    all.sort();
    all.dedup();
    conn.reply_body(BODY, "tags follow", all);
}

pub(super) fn new(jb: &Rc<Jukebox>, conn: &mut Connection, args: &[String]) {
    let config_max = jb.config.borrow().new_max;
    let max = args
        .first()
        .and_then(|s| s.parse::<usize>().ok())
        .map(|n| n.min(config_max))
        .unwrap_or(config_max);
    let lines = jb.tracks.borrow().newest(max);
    conn.reply_body(BODY, "new tracks", lines);
}

pub(super) fn stats(jb: &Rc<Jukebox>, conn: &mut Connection) {
    let tracks = jb.tracks.borrow();
    let store = jb.store.borrow();
    let queue = jb.queue.borrow();
    let lines = vec![
        format!("uptime {}", jb.started_at.elapsed().as_secs()),
        format!("version {}", env!("CARGO_PKG_VERSION")),
        format!("tracks {}", tracks.len()),
        format!("tracks_playable {}", tracks.playable_count()),
        format!("users {}", store.user_count()),
        format!("queue_length {}", queue.pending_len()),
        format!("recent_length {}", queue.recent().count()),
        format!("connections {}", jb.connections.borrow().len()),
        format!("log_subscribers {}", jb.events.subscriber_count()),
        format!(
            "rescan_in_progress {}",
            if jb.rescan.running.get() { "yes" } else { "no" }
        ),
    ];
    conn.reply_body(BODY, "statistics", lines);
}

/// Kick off (and with `wait`, suspend on) the rescanner subprocess. The
/// wait variant is a suspension point: this connection dispatches nothing
/// further until the scan lands.
pub(super) async fn rescan(jb: &Rc<Jukebox>, conn: &mut Connection, args: &[String]) {
    let wait = match args.first().map(|s| s.as_str()) {
        None => false,
        Some("wait") => true,
        Some(other) => {
            conn.reply(NOT_FOUND, &format!("bad rescan flag {:?}", other));
            return;
        }
    };
    if let Err(e) = spawn_rescan(jb) {
        conn.reply(NOT_FOUND, &e);
        return;
    }
    info!(wait, "rescan requested");
    if !wait {
        conn.reply(OK, "initiated");
        return;
    }
    while jb.rescan.running.get() {
        tokio::select! {
            _ = jb.rescan.done.notified() => {}
            _ = tokio::time::sleep(Duration::from_millis(250)) => {}
            _ = jb.shutdown.cancelled() => {
                conn.reply(NOT_FOUND, "server shutting down");
                return;
            }
        }
    }
    conn.reply(OK, "rescan complete");
}

fn split_tags(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_tags() {
        assert_eq!(split_tags("loud, fast ,  live"), vec!["loud", "fast", "live"]);
        assert_eq!(split_tags(""), Vec::<String>::new());
        assert_eq!(split_tags(" ,, "), Vec::<String>::new());
    }
}
