//! Track and global preferences.
//!
//! `555` (no value) is deliberately distinct from `550` (bad track or
//! key): clients can tell "never had a value" from "you asked about
//! something that does not exist".

use std::rc::Rc;

use rockoproto::status::{BODY, NOT_FOUND, NO_VALUE, OK, VALUE};
use rockoproto::{quote, quote_word};

use crate::connection::Connection;
use crate::server::Jukebox;

use super::resolve_track;

pub(super) fn get(jb: &Rc<Jukebox>, conn: &mut Connection, args: &[String]) {
    let Some(track) = resolve_track(jb, &args[0]) else {
        conn.reply(NOT_FOUND, &format!("no such track {:?}", args[0]));
        return;
    };
    match jb.store.borrow().pref(&track, &args[1]) {
        Some(value) => conn.reply(VALUE, value),
        None => conn.reply(NO_VALUE, "no value"),
    }
}

pub(super) fn set(jb: &Rc<Jukebox>, conn: &mut Connection, args: &[String]) {
    let Some(track) = resolve_track(jb, &args[0]) else {
        conn.reply(NOT_FOUND, &format!("no such track {:?}", args[0]));
        return;
    };
    if let Err(e) = jb.store.borrow_mut().set_pref(&track, &args[1], &args[2]) {
        conn.reply(NOT_FOUND, &e.to_string());
        return;
    }
    jb.publish(&format!("prefs_changed {}", quote_word(&track)));
    conn.reply(OK, "preference set");
}

pub(super) fn unset(jb: &Rc<Jukebox>, conn: &mut Connection, args: &[String]) {
    let Some(track) = resolve_track(jb, &args[0]) else {
        conn.reply(NOT_FOUND, &format!("no such track {:?}", args[0]));
        return;
    };
    match jb.store.borrow_mut().unset_pref(&track, &args[1]) {
        Ok(existed) => {
            if existed {
                jb.publish(&format!("prefs_changed {}", quote_word(&track)));
            }
            conn.reply(OK, "preference unset");
        }
        Err(e) => conn.reply(NOT_FOUND, &e.to_string()),
    }
}

pub(super) fn prefs(jb: &Rc<Jukebox>, conn: &mut Connection, args: &[String]) {
    let Some(track) = resolve_track(jb, &args[0]) else {
        conn.reply(NOT_FOUND, &format!("no such track {:?}", args[0]));
        return;
    };
    let store = jb.store.borrow();
    let lines: Vec<String> = store
        .prefs_of(&track)
        .map(|(key, value)| quote([key, value]))
        .collect();
    conn.reply_body(BODY, "preferences follow", lines);
}

pub(super) fn get_global(jb: &Rc<Jukebox>, conn: &mut Connection, args: &[String]) {
    match jb.store.borrow().global(&args[0]) {
        Some(value) => conn.reply(VALUE, value),
        None => conn.reply(NO_VALUE, "no value"),
    }
}

pub(super) fn set_global(jb: &Rc<Jukebox>, conn: &mut Connection, args: &[String]) {
    if let Err(e) = jb.store.borrow_mut().set_global(&args[0], &args[1]) {
        conn.reply(NOT_FOUND, &e.to_string());
        return;
    }
    jb.publish(&format!("global_pref {}", quote_word(&args[0])));
    // The enable flags live in the globals table; poke the player in case
    // one of them just changed.
    jb.player.wake();
    conn.reply(OK, "global preference set");
}

pub(super) fn unset_global(jb: &Rc<Jukebox>, conn: &mut Connection, args: &[String]) {
    match jb.store.borrow_mut().unset_global(&args[0]) {
        Ok(existed) => {
            if existed {
                jb.publish(&format!("global_pref {}", quote_word(&args[0])));
            }
            jb.player.wake();
            conn.reply(OK, "global preference unset");
        }
        Err(e) => conn.reply(NOT_FOUND, &e.to_string()),
    }
}
