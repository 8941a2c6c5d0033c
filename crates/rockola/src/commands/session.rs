//! Session commands: authentication, volume, the event log, shutdown.

use std::rc::Rc;

use tracing::{info, warn};

use rockoproto::auth::hash_response;
use rockoproto::status::{AUTH_FAILED, NOT_AUTHORIZED, NOT_FOUND, OK, USER_OK, VALUE};
use rockoproto::Rights;

use crate::connection::Connection;
use crate::server::Jukebox;
use crate::unix_now;

/// The challenge/response login. Succeeds at most once per connection.
pub(super) fn user(jb: &Rc<Jukebox>, conn: &mut Connection, args: &[String]) {
    if conn.user().is_some() {
        conn.reply(AUTH_FAILED, "already authenticated");
        return;
    }
    let (name, response) = (&args[0], &args[1]);
    let algorithm = jb.config.borrow().authorization_algorithm;

    let verdict = {
        let store = jb.store.borrow();
        match store.user(name) {
            Some(record) if record.is_confirmed() => {
                let expected = hash_response(algorithm, &conn.nonce, &record.password);
                if expected.eq_ignore_ascii_case(response) {
                    Some(record.rights())
                } else {
                    None
                }
            }
            // Unknown and unconfirmed users fail identically.
            _ => None,
        }
    };

    match verdict {
        Some(rights) => {
            let effective = if conn.shared.local {
                rights | Rights::LOCAL
            } else {
                rights
            };
            *conn.shared.user.borrow_mut() = Some(name.clone());
            conn.shared.rights.set(effective);
            info!(user = %name, "authenticated");
            conn.reply(USER_OK, "OK");
        }
        None => {
            warn!(user = %name, "authentication failed");
            conn.reply(AUTH_FAILED, "authentication failed");
        }
    }
}

pub(super) fn version(conn: &mut Connection) {
    conn.reply(VALUE, env!("CARGO_PKG_VERSION"));
}

/// Read or set the output volume. Reading needs only `read`; setting
/// needs the `volume` right.
pub(super) fn volume(jb: &Rc<Jukebox>, conn: &mut Connection, args: &[String]) {
    if !args.is_empty() {
        if !conn.rights().contains(Rights::VOLUME) {
            conn.reply(NOT_AUTHORIZED, "not authorized to set the volume");
            return;
        }
        let parse = |s: &String| s.parse::<u8>().ok().filter(|v| *v <= 100);
        let (left, right) = match args {
            [both] => match parse(both) {
                Some(v) => (v, v),
                None => {
                    conn.reply(NOT_FOUND, &format!("bad volume {:?}", both));
                    return;
                }
            },
            [l, r] => match (parse(l), parse(r)) {
                (Some(l), Some(r)) => (l, r),
                _ => {
                    conn.reply(NOT_FOUND, "bad volume (0-100)");
                    return;
                }
            },
            _ => unreachable!("arity checked"),
        };
        jb.volume.set((left, right));
        jb.publish(&format!("volume {} {}", left, right));
    }
    let (left, right) = jb.volume.get();
    conn.reply(VALUE, &format!("{} {}", left, right));
}

/// Subscribe this connection to the event log. The reply is followed by
/// the current-state prelude, then live events until the client speaks
/// again or disconnects.
pub(super) fn log(jb: &Rc<Jukebox>, conn: &mut Connection) {
    conn.reply(rockoproto::status::LOG_FOLLOWS, "log follows");

    // Prelude: enough state for a fresh client to render the world.
    let now = unix_now();
    let mut prelude = |line: String| {
        let _ = conn.writer.send_line(&format!("{:x} {}", now, line));
    };
    prelude(
        if jb.playing_enabled() {
            "state enable_play"
        } else {
            "state disable_play"
        }
        .to_string(),
    );
    prelude(
        if jb.random_enabled() {
            "state enable_random"
        } else {
            "state disable_random"
        }
        .to_string(),
    );
    let (left, right) = jb.volume.get();
    prelude(format!("volume {} {}", left, right));
    if let Some(playing) = jb.queue.borrow().playing() {
        prelude(format!("playing {}", playing.id));
    }

    // Live events flow through a channel pumped into this connection's
    // writer, keeping them ordered with the response we just sent.
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<String>();
    jb.events.subscribe(Rc::clone(&conn.shared), tx);
    conn.log_active = true;

    let writer = conn.writer.clone();
    tokio::task::spawn_local(async move {
        while let Some(line) = rx.recv().await {
            if writer.send_line(&line).is_err() {
                break;
            }
        }
    });
}

pub(super) fn shutdown(jb: &Rc<Jukebox>, conn: &mut Connection) {
    info!(user = ?conn.user(), "shutdown requested");
    conn.reply(OK, "shutting down");
    jb.shutdown.cancel();
}

pub(super) fn reconfigure(jb: &Rc<Jukebox>, conn: &mut Connection) {
    match jb.reconfigure() {
        Ok(()) => conn.reply(OK, "reconfigured"),
        Err(e) => conn.reply(NOT_FOUND, &format!("reconfiguration failed: {}", e)),
    }
}
