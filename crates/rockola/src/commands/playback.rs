//! Playback commands: queue mutation, transport control, RTP listeners.

use std::rc::Rc;

use tracing::info;

use rockoproto::quote_word;
use rockoproto::status::{COMMENT, NOT_AUTHORIZED, NOT_FOUND, OK, VALUE};

use crate::connection::Connection;
use crate::player::{self, PauseOutcome, ResumeOutcome, ScratchError};
use crate::queue::{Origin, QueueError};
use crate::server::Jukebox;
use crate::unix_now;

use super::resolve_track;

fn publish_queue_entry(jb: &Jukebox, id: &str) {
    let marshalled = {
        let queue = jb.queue.borrow();
        queue.find(id).map(|e| jb.marshal_entry(e))
    };
    if let Some(marshalled) = marshalled {
        jb.publish(&format!("queue {}", marshalled));
    }
}

pub(super) fn play(jb: &Rc<Jukebox>, conn: &mut Connection, args: &[String]) {
    let Some(user) = conn.user() else {
        conn.reply(NOT_AUTHORIZED, "not authorized");
        return;
    };
    let Some(track) = resolve_track(jb, &args[0]) else {
        conn.reply(NOT_FOUND, &format!("no such track {:?}", args[0]));
        return;
    };
    let id = jb
        .queue
        .borrow_mut()
        .push_back(track, Some(user), Origin::Picked, unix_now());
    publish_queue_entry(jb, &id);
    jb.save_queue();
    jb.player.wake();
    conn.reply(VALUE, &id);
}

pub(super) fn playafter(jb: &Rc<Jukebox>, conn: &mut Connection, args: &[String]) {
    let Some(user) = conn.user() else {
        conn.reply(NOT_AUTHORIZED, "not authorized");
        return;
    };
    let (target, names) = args.split_first().expect("arity checked");
    let mut anchor = target.clone();
    let mut last_id = None;
    for name in names {
        let Some(track) = resolve_track(jb, name) else {
            conn.reply(NOT_FOUND, &format!("no such track {:?}", name));
            return;
        };
        let inserted = jb.queue.borrow_mut().push_after(
            &anchor,
            track,
            Some(user.clone()),
            Origin::Picked,
            unix_now(),
        );
        match inserted {
            Ok(id) => {
                publish_queue_entry(jb, &id);
                anchor = id.clone();
                last_id = Some(id);
            }
            Err(QueueError::NoSuchEntry(id)) => {
                conn.reply(NOT_FOUND, &format!("no such queue entry {:?}", id));
                return;
            }
            Err(e) => {
                conn.reply(NOT_FOUND, &e.to_string());
                return;
            }
        }
    }
    jb.save_queue();
    jb.player.wake();
    conn.reply(VALUE, &last_id.expect("at least one track inserted"));
}

pub(super) fn pause(jb: &Rc<Jukebox>, conn: &mut Connection) {
    match player::request_pause(jb) {
        PauseOutcome::Paused => conn.reply(OK, "pausing"),
        PauseOutcome::AlreadyPaused => conn.reply(OK, "already paused"),
        PauseOutcome::NotPlaying => conn.reply(NOT_FOUND, "nothing playing"),
        PauseOutcome::NotPausable => conn.reply(NOT_FOUND, "cannot pause a scratch"),
    }
}

pub(super) fn resume(jb: &Rc<Jukebox>, conn: &mut Connection) {
    match player::request_resume(jb) {
        ResumeOutcome::Resumed => conn.reply(OK, "resumed"),
        ResumeOutcome::NotPaused => conn.reply(NOT_FOUND, "not paused"),
    }
}

pub(super) fn scratch(jb: &Rc<Jukebox>, conn: &mut Connection, args: &[String]) {
    let Some(user) = conn.user() else {
        conn.reply(NOT_AUTHORIZED, "not authorized");
        return;
    };
    {
        let queue = jb.queue.borrow();
        let Some(playing) = queue.playing() else {
            conn.reply(NOT_FOUND, "nothing playing");
            return;
        };
        if !conn
            .rights()
            .can_scratch(&user, playing.submitter.as_deref(), playing.is_random())
        {
            conn.reply(NOT_AUTHORIZED, "not authorized to scratch that track");
            return;
        }
    }
    match player::request_scratch(jb, Some(&user), args.first().map(|s| s.as_str())) {
        Ok(_) => conn.reply(OK, "scratched"),
        Err(ScratchError::NotPlaying) => conn.reply(NOT_FOUND, "nothing playing"),
        Err(ScratchError::WrongId) => {
            conn.reply(NOT_FOUND, "that track is not playing")
        }
    }
}

pub(super) fn remove(jb: &Rc<Jukebox>, conn: &mut Connection, args: &[String]) {
    let Some(user) = conn.user() else {
        conn.reply(NOT_AUTHORIZED, "not authorized");
        return;
    };
    let id = &args[0];
    {
        let queue = jb.queue.borrow();
        if queue.playing().is_some_and(|p| &p.id == id) {
            conn.reply(NOT_FOUND, "cannot remove the playing track, scratch it");
            return;
        }
        let Some(entry) = queue.find(id) else {
            conn.reply(NOT_FOUND, &format!("no such queue entry {:?}", id));
            return;
        };
        if !conn
            .rights()
            .can_remove(&user, entry.submitter.as_deref(), entry.is_random())
        {
            conn.reply(NOT_AUTHORIZED, "not authorized to remove that track");
            return;
        }
    }
    jb.player.discard_decoder(id);
    jb.queue.borrow_mut().remove(id);
    jb.publish(&format!("removed {} {}", id, user));
    jb.save_queue();
    jb.top_up_random();
    jb.player.wake();
    conn.reply(OK, "removed");
}

pub(super) fn move_offset(jb: &Rc<Jukebox>, conn: &mut Connection, args: &[String]) {
    let Some(user) = conn.user() else {
        conn.reply(NOT_AUTHORIZED, "not authorized");
        return;
    };
    let id = &args[0];
    let Ok(delta) = args[1].parse::<i64>() else {
        conn.reply(NOT_FOUND, &format!("bad offset {:?}", args[1]));
        return;
    };
    {
        let queue = jb.queue.borrow();
        let Some(entry) = queue.find(id) else {
            conn.reply(NOT_FOUND, &format!("no such queue entry {:?}", id));
            return;
        };
        if !conn
            .rights()
            .can_move(&user, entry.submitter.as_deref(), entry.is_random())
        {
            conn.reply(NOT_AUTHORIZED, "not authorized to move that track");
            return;
        }
    }
    match jb.queue.borrow_mut().move_offset(id, delta) {
        Ok(_) => {
            jb.publish(&format!("moved {} {}", id, user));
            jb.save_queue();
            jb.player.wake();
            conn.reply(OK, "moved");
        }
        Err(QueueError::MovePlaying) => {
            conn.reply(NOT_FOUND, "cannot move the playing track")
        }
        Err(e) => conn.reply(NOT_FOUND, &e.to_string()),
    }
}

pub(super) fn moveafter(jb: &Rc<Jukebox>, conn: &mut Connection, args: &[String]) {
    let Some(user) = conn.user() else {
        conn.reply(NOT_AUTHORIZED, "not authorized");
        return;
    };
    let (target, ids) = args.split_first().expect("arity checked");
    // Rights are evaluated for every entry before anything moves.
    {
        let queue = jb.queue.borrow();
        for id in ids {
            let Some(entry) = queue.find(id) else {
                conn.reply(NOT_FOUND, &format!("no such queue entry {:?}", id));
                return;
            };
            if !conn
                .rights()
                .can_move(&user, entry.submitter.as_deref(), entry.is_random())
            {
                conn.reply(NOT_AUTHORIZED, "not authorized to move that track");
                return;
            }
        }
    }
    let mut anchor = target.clone();
    for id in ids {
        match jb.queue.borrow_mut().move_after(id, &anchor) {
            Ok(_) => anchor = id.clone(),
            Err(QueueError::MovePlaying) => {
                conn.reply(NOT_FOUND, "cannot move the playing track");
                return;
            }
            Err(e) => {
                conn.reply(NOT_FOUND, &e.to_string());
                return;
            }
        }
    }
    jb.publish(&format!("moved {}", user));
    jb.save_queue();
    jb.player.wake();
    conn.reply(OK, "moved");
}

pub(super) fn adopt(jb: &Rc<Jukebox>, conn: &mut Connection, args: &[String]) {
    let Some(user) = conn.user() else {
        conn.reply(NOT_AUTHORIZED, "not authorized");
        return;
    };
    let id = &args[0];
    {
        let mut queue = jb.queue.borrow_mut();
        let Some(entry) = queue.find_mut(id) else {
            conn.reply(NOT_FOUND, &format!("no such queue entry {:?}", id));
            return;
        };
        if entry.origin != Origin::Random {
            conn.reply(NOT_FOUND, "only random tracks can be adopted");
            return;
        }
        entry.origin = Origin::Adopted;
        entry.submitter = Some(user.clone());
    }
    jb.publish(&format!("adopted {} {}", id, user));
    jb.save_queue();
    conn.reply(OK, "adopted");
}

pub(super) fn playing(jb: &Rc<Jukebox>, conn: &mut Connection) {
    jb.refresh_expected();
    let queue = jb.queue.borrow();
    match queue.playing() {
        Some(entry) => conn.reply(VALUE, &jb.marshal_entry(entry)),
        None => conn.reply(COMMENT, "nothing playing"),
    }
}

pub(super) fn queue(jb: &Rc<Jukebox>, conn: &mut Connection) {
    jb.refresh_expected();
    let queue = jb.queue.borrow();
    let lines: Vec<String> = queue.pending().map(|e| jb.marshal_entry(e)).collect();
    conn.reply_body(rockoproto::status::BODY, "queue follows", lines);
}

pub(super) fn recent(jb: &Rc<Jukebox>, conn: &mut Connection) {
    let queue = jb.queue.borrow();
    let lines: Vec<String> = queue.recent().map(|e| jb.marshal_entry(e)).collect();
    conn.reply_body(rockoproto::status::BODY, "recently played", lines);
}

pub(super) fn enable(jb: &Rc<Jukebox>, conn: &mut Connection, on: bool) {
    let value = if on { "yes" } else { "no" };
    if let Err(e) = jb.store.borrow_mut().set_global("playing", value) {
        conn.reply(NOT_FOUND, &e.to_string());
        return;
    }
    info!(user = ?conn.user(), enabled = on, "play state changed");
    jb.publish(if on {
        "state enable_play"
    } else {
        "state disable_play"
    });
    jb.player.wake();
    conn.reply(OK, if on { "play enabled" } else { "play disabled" });
}

pub(super) fn enabled(jb: &Rc<Jukebox>, conn: &mut Connection) {
    conn.reply(VALUE, if jb.playing_enabled() { "yes" } else { "no" });
}

pub(super) fn random_enable(jb: &Rc<Jukebox>, conn: &mut Connection, on: bool) {
    let value = if on { "yes" } else { "no" };
    if let Err(e) = jb.store.borrow_mut().set_global("random-play", value) {
        conn.reply(NOT_FOUND, &e.to_string());
        return;
    }
    jb.publish(if on {
        "state enable_random"
    } else {
        "state disable_random"
    });
    if on {
        // Top up within this reactor iteration, not at some later tick.
        jb.top_up_random();
    }
    jb.player.wake();
    conn.reply(OK, if on { "random play enabled" } else { "random play disabled" });
}

pub(super) fn random_enabled(jb: &Rc<Jukebox>, conn: &mut Connection) {
    conn.reply(VALUE, if jb.random_enabled() { "yes" } else { "no" });
}

pub(super) fn rtp_address(jb: &Rc<Jukebox>, conn: &mut Connection) {
    let config = jb.config.borrow();
    match &config.broadcast {
        Some((addr, port)) => conn.reply(
            VALUE,
            &format!("{} {}", quote_word(addr), port),
        ),
        None => conn.reply(NOT_FOUND, "no broadcast address configured"),
    }
}

pub(super) fn rtp_request(jb: &Rc<Jukebox>, conn: &mut Connection, args: &[String]) {
    let Ok(ip) = args[0].parse::<std::net::IpAddr>() else {
        conn.reply(NOT_FOUND, &format!("bad address {:?}", args[0]));
        return;
    };
    let Ok(port) = args[1].parse::<u16>() else {
        conn.reply(NOT_FOUND, &format!("bad port {:?}", args[1]));
        return;
    };
    jb.rtp_recipients
        .borrow_mut()
        .insert(conn.shared.id, std::net::SocketAddr::new(ip, port));
    info!(addr = %ip, port, "RTP unicast recipient registered");
    conn.reply(OK, "requested");
}

pub(super) fn rtp_cancel(jb: &Rc<Jukebox>, conn: &mut Connection) {
    if jb.rtp_recipients.borrow_mut().remove(&conn.shared.id).is_some() {
        conn.reply(OK, "cancelled");
    } else {
        conn.reply(NOT_FOUND, "no RTP stream requested");
    }
}
