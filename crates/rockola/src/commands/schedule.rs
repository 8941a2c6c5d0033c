//! Scheduled event commands. The scheduler task itself lives in
//! [`crate::schedule`]; this is just the list/get/add/del surface.

use std::rc::Rc;

use chrono::NaiveDateTime;

use rockoproto::status::{BODY, NOT_AUTHORIZED, NOT_FOUND, VALUE};
use rockoproto::{quote, quote_word, Rights};

use crate::connection::Connection;
use crate::server::Jukebox;
use crate::unix_now;

use super::resolve_track;

/// Accept either raw epoch seconds or a local `YYYY-MM-DDTHH:MM[:SS]`.
fn parse_when(spec: &str) -> Option<u64> {
    if let Ok(seconds) = spec.parse::<u64>() {
        return Some(seconds);
    }
    let fmt = if spec.len() == 16 {
        "%Y-%m-%dT%H:%M"
    } else {
        "%Y-%m-%dT%H:%M:%S"
    };
    let naive = NaiveDateTime::parse_from_str(spec, fmt).ok()?;
    let local = naive.and_local_timezone(chrono::Local).single()?;
    u64::try_from(local.timestamp()).ok()
}

pub(super) fn list(jb: &Rc<Jukebox>, conn: &mut Connection) {
    let store = jb.store.borrow();
    let mut events: Vec<(&str, u64)> = store
        .schedule_ids()
        .filter_map(|id| store.scheduled_event(id).map(|e| (id, e.when)))
        .collect();
    events.sort_by_key(|(_, when)| *when);
    let ids: Vec<String> = events.into_iter().map(|(id, _)| id.to_string()).collect();
    conn.reply_body(BODY, "scheduled events", ids);
}

pub(super) fn get(jb: &Rc<Jukebox>, conn: &mut Connection, args: &[String]) {
    let store = jb.store.borrow();
    let Some(event) = store.scheduled_event(&args[0]) else {
        conn.reply(NOT_FOUND, &format!("no such event {:?}", args[0]));
        return;
    };
    let mut lines = vec![
        quote(["who", event.who.as_str()]),
        format!("when {}", event.when),
        quote(["priority", event.priority.as_str()]),
        quote(["action", event.action.as_str()]),
    ];
    for (i, arg) in event.args.iter().enumerate() {
        lines.push(format!("arg.{} {}", i, quote_word(arg)));
    }
    conn.reply_body(BODY, "event follows", lines);
}

pub(super) fn add(jb: &Rc<Jukebox>, conn: &mut Connection, args: &[String]) {
    let Some(user) = conn.user() else {
        conn.reply(NOT_AUTHORIZED, "not authorized");
        return;
    };
    let Some(when) = parse_when(&args[0]) else {
        conn.reply(NOT_FOUND, &format!("bad time {:?}", args[0]));
        return;
    };
    if when <= unix_now() {
        conn.reply(NOT_FOUND, "scheduled time is in the past");
        return;
    }
    let priority = &args[1];
    if !matches!(priority.as_str(), "normal" | "junk") {
        conn.reply(NOT_FOUND, &format!("bad priority {:?}", priority));
        return;
    }

    let action = &args[2];
    let action_args = &args[3..];
    let stored_args: Vec<String> = match action.as_str() {
        "play" => {
            if !conn.rights().contains(Rights::PLAY) {
                conn.reply(NOT_AUTHORIZED, "not authorized to schedule play");
                return;
            }
            let [track] = action_args else {
                conn.reply(NOT_FOUND, "play takes exactly one track");
                return;
            };
            let Some(resolved) = resolve_track(jb, track) else {
                conn.reply(NOT_FOUND, &format!("no such track {:?}", track));
                return;
            };
            vec![resolved]
        }
        "set-global" => {
            if !conn.rights().contains(Rights::GLOBAL_PREFS) {
                conn.reply(NOT_AUTHORIZED, "not authorized to schedule set-global");
                return;
            }
            match action_args {
                [key] => vec![key.clone()],
                [key, value] => vec![key.clone(), value.clone()],
                _ => {
                    conn.reply(NOT_FOUND, "set-global takes a key and optional value");
                    return;
                }
            }
        }
        other => {
            conn.reply(NOT_FOUND, &format!("unknown action {:?}", other));
            return;
        }
    };

    let added = jb.store.borrow_mut().add_scheduled(
        user,
        when,
        priority.clone(),
        action.clone(),
        stored_args,
    );
    match added {
        Ok(id) => {
            jb.publish(&format!("schedule_add {}", id));
            jb.schedule_changed.notify_waiters();
            conn.reply(VALUE, &id);
        }
        Err(e) => conn.reply(NOT_FOUND, &e.to_string()),
    }
}

pub(super) fn del(jb: &Rc<Jukebox>, conn: &mut Connection, args: &[String]) {
    let id = &args[0];
    {
        let store = jb.store.borrow();
        let Some(event) = store.scheduled_event(id) else {
            conn.reply(NOT_FOUND, &format!("no such event {:?}", id));
            return;
        };
        let is_owner = conn.user().as_deref() == Some(event.who.as_str());
        if !is_owner && !conn.rights().contains(Rights::ADMIN) {
            conn.reply(NOT_AUTHORIZED, "not authorized to delete that event");
            return;
        }
    }
    match jb.store.borrow_mut().delete_scheduled(id) {
        Ok(true) => {
            jb.publish(&format!("schedule_del {}", id));
            jb.schedule_changed.notify_waiters();
            conn.reply(rockoproto::status::OK, "event deleted");
        }
        Ok(false) => conn.reply(NOT_FOUND, &format!("no such event {:?}", id)),
        Err(e) => conn.reply(NOT_FOUND, &e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_when_epoch() {
        assert_eq!(parse_when("1234567890"), Some(1234567890));
    }

    #[test]
    fn test_parse_when_datetime() {
        let parsed = parse_when("2030-05-01T12:30").unwrap();
        let with_seconds = parse_when("2030-05-01T12:30:00").unwrap();
        assert_eq!(parsed, with_seconds);
        assert!(parsed > 1_800_000_000);
    }

    #[test]
    fn test_parse_when_garbage() {
        assert_eq!(parse_when("next tuesday"), None);
        assert_eq!(parse_when("2030-13-01T00:00"), None);
    }
}
