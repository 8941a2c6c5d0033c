//! The command table and dispatcher.
//!
//! Every command declares a name, an arity range, and a rights mask.
//! Dispatch rejects unknown names and arity violations with `500` and
//! missing rights with `510`; handlers take over from there. A command
//! with an empty rights mask is available before authentication. For
//! multi-bit masks (`scratch`, `move`, `remove`) holding *any* of the bits
//! admits the command, and the handler applies the per-entry ownership
//! rules.

pub mod catalog;
pub mod playback;
pub mod playlists;
pub mod prefs;
pub mod schedule;
pub mod session;
pub mod users;

use std::rc::Rc;

use tracing::debug;

use rockoproto::status::{BAD_COMMAND, NOT_AUTHORIZED};
use rockoproto::Rights;

use crate::connection::Connection;
use crate::server::Jukebox;

/// "As many as you like".
const MANY: usize = usize::MAX;

pub struct CommandDef {
    pub name: &'static str,
    pub min: usize,
    pub max: usize,
    pub rights: Rights,
}

macro_rules! cmd {
    ($name:literal, $min:expr, $max:expr, $($right:ident)|*) => {
        CommandDef {
            name: $name,
            min: $min,
            max: $max,
            rights: Rights::empty()$(.union(Rights::$right))*,
        }
    };
}

static COMMANDS: &[CommandDef] = &[
    // Playback
    cmd!("play", 1, 1, PLAY),
    cmd!("playafter", 2, MANY, PLAY),
    cmd!("pause", 0, 0, PAUSE),
    cmd!("resume", 0, 0, PAUSE),
    cmd!("scratch", 0, 1, SCRATCH_OWN | SCRATCH_RANDOM | SCRATCH_ANY),
    cmd!("remove", 1, 1, REMOVE_OWN | REMOVE_RANDOM | REMOVE_ANY),
    cmd!("move", 2, 2, MOVE_OWN | MOVE_RANDOM | MOVE_ANY),
    cmd!("moveafter", 1, MANY, MOVE_OWN | MOVE_RANDOM | MOVE_ANY),
    cmd!("adopt", 1, 1, PLAY),
    cmd!("playing", 0, 0, READ),
    cmd!("queue", 0, 0, READ),
    cmd!("recent", 0, 0, READ),
    cmd!("enable", 0, 0, GLOBAL_PREFS),
    cmd!("disable", 0, 0, GLOBAL_PREFS),
    cmd!("enabled", 0, 0, READ),
    cmd!("random-enable", 0, 0, GLOBAL_PREFS),
    cmd!("random-disable", 0, 0, GLOBAL_PREFS),
    cmd!("random-enabled", 0, 0, READ),
    // Catalog
    cmd!("dirs", 1, 2, READ),
    cmd!("files", 1, 2, READ),
    cmd!("allfiles", 1, 2, READ),
    cmd!("exists", 1, 1, READ),
    cmd!("length", 1, 1, READ),
    cmd!("part", 3, 3, READ),
    cmd!("resolve", 1, 1, READ),
    cmd!("search", 1, MANY, READ),
    cmd!("tags", 0, 0, READ),
    cmd!("new", 0, 1, READ),
    cmd!("stats", 0, 0, READ),
    cmd!("rescan", 0, 1, RESCAN),
    // Preferences
    cmd!("get", 2, 2, READ),
    cmd!("set", 3, 3, PREFS),
    cmd!("unset", 2, 2, PREFS),
    cmd!("prefs", 1, 1, READ),
    cmd!("get-global", 1, 1, READ),
    cmd!("set-global", 2, 2, GLOBAL_PREFS),
    cmd!("unset-global", 1, 1, GLOBAL_PREFS),
    // Users
    cmd!("adduser", 2, 3, ADMIN),
    cmd!("deluser", 1, 1, ADMIN),
    cmd!("edituser", 3, 3, READ),
    cmd!("userinfo", 2, 2, READ),
    cmd!("users", 0, 0, READ),
    cmd!("register", 3, 3, REGISTER),
    cmd!("confirm", 1, 1,),
    cmd!("reminder", 1, 1,),
    cmd!("make-cookie", 0, 0, READ),
    cmd!("revoke", 0, 0, READ),
    // Playlists
    cmd!("playlists", 0, 0, READ),
    cmd!("playlist-get", 1, 1, READ),
    cmd!("playlist-get-share", 1, 1, READ),
    cmd!("playlist-set-share", 2, 2, PLAY),
    cmd!("playlist-lock", 1, 1, PLAY),
    cmd!("playlist-unlock", 0, 0, PLAY),
    cmd!("playlist-set", 1, 1, PLAY),
    cmd!("playlist-delete", 1, 1, PLAY),
    // Scheduling
    cmd!("schedule-list", 0, 0, READ),
    cmd!("schedule-get", 1, 1, READ),
    cmd!("schedule-add", 3, MANY, PLAY | GLOBAL_PREFS),
    cmd!("schedule-del", 1, 1, READ),
    // RTP
    cmd!("rtp-address", 0, 0, READ),
    cmd!("rtp-request", 2, 2, READ),
    cmd!("rtp-cancel", 0, 0, READ),
    // Session
    cmd!("user", 2, 2,),
    cmd!("cookie", 1, 1,),
    cmd!("nop", 0, 0,),
    cmd!("version", 0, 0, READ),
    cmd!("volume", 0, 2, READ),
    cmd!("log", 0, 0, READ),
    cmd!("shutdown", 0, 0, ADMIN),
    cmd!("reconfigure", 0, 0, ADMIN),
];

fn lookup(name: &str) -> Option<&'static CommandDef> {
    COMMANDS.iter().find(|def| def.name == name)
}

/// Dispatch one parsed command line.
pub async fn execute(jb: &Rc<Jukebox>, conn: &mut Connection, words: Vec<String>) {
    let Some((name, args)) = words.split_first() else {
        conn.reply(BAD_COMMAND, "empty command");
        return;
    };
    let Some(def) = lookup(name) else {
        conn.reply(BAD_COMMAND, &format!("unknown command {:?}", name));
        return;
    };
    if args.len() < def.min || args.len() > def.max {
        conn.reply(
            BAD_COMMAND,
            &format!("wrong number of arguments to {:?}", name),
        );
        return;
    }
    if !def.rights.is_empty() && (conn.rights() & def.rights).is_empty() {
        debug!(command = %name, "rights check failed");
        conn.reply(NOT_AUTHORIZED, "not authorized");
        return;
    }

    match def.name {
        // Playback
        "play" => playback::play(jb, conn, args),
        "playafter" => playback::playafter(jb, conn, args),
        "pause" => playback::pause(jb, conn),
        "resume" => playback::resume(jb, conn),
        "scratch" => playback::scratch(jb, conn, args),
        "remove" => playback::remove(jb, conn, args),
        "move" => playback::move_offset(jb, conn, args),
        "moveafter" => playback::moveafter(jb, conn, args),
        "adopt" => playback::adopt(jb, conn, args),
        "playing" => playback::playing(jb, conn),
        "queue" => playback::queue(jb, conn),
        "recent" => playback::recent(jb, conn),
        "enable" => playback::enable(jb, conn, true),
        "disable" => playback::enable(jb, conn, false),
        "enabled" => playback::enabled(jb, conn),
        "random-enable" => playback::random_enable(jb, conn, true),
        "random-disable" => playback::random_enable(jb, conn, false),
        "random-enabled" => playback::random_enabled(jb, conn),
        "rtp-address" => playback::rtp_address(jb, conn),
        "rtp-request" => playback::rtp_request(jb, conn, args),
        "rtp-cancel" => playback::rtp_cancel(jb, conn),
        // Catalog
        "dirs" => catalog::dirs(jb, conn, args),
        "files" => catalog::files(jb, conn, args, true),
        "allfiles" => catalog::files(jb, conn, args, false),
        "exists" => catalog::exists(jb, conn, args),
        "length" => catalog::length(jb, conn, args),
        "part" => catalog::part(jb, conn, args),
        "resolve" => catalog::resolve(jb, conn, args),
        "search" => catalog::search(jb, conn, args),
        "tags" => catalog::tags(jb, conn),
        "new" => catalog::new(jb, conn, args),
        "stats" => catalog::stats(jb, conn),
        "rescan" => return catalog::rescan(jb, conn, args).await,
        // Preferences
        "get" => prefs::get(jb, conn, args),
        "set" => prefs::set(jb, conn, args),
        "unset" => prefs::unset(jb, conn, args),
        "prefs" => prefs::prefs(jb, conn, args),
        "get-global" => prefs::get_global(jb, conn, args),
        "set-global" => prefs::set_global(jb, conn, args),
        "unset-global" => prefs::unset_global(jb, conn, args),
        // Users
        "adduser" => users::adduser(jb, conn, args),
        "deluser" => users::deluser(jb, conn, args),
        "edituser" => users::edituser(jb, conn, args),
        "userinfo" => users::userinfo(jb, conn, args),
        "users" => users::users(jb, conn),
        "register" => return users::register(jb, conn, args).await,
        "confirm" => users::confirm(jb, conn, args),
        "reminder" => return users::reminder(jb, conn, args).await,
        "make-cookie" => users::make_cookie(jb, conn),
        "revoke" => users::revoke(jb, conn),
        // Playlists
        "playlists" => playlists::list(jb, conn),
        "playlist-get" => playlists::get(jb, conn, args),
        "playlist-get-share" => playlists::get_share(jb, conn, args),
        "playlist-set-share" => playlists::set_share(jb, conn, args),
        "playlist-lock" => playlists::lock(jb, conn, args),
        "playlist-unlock" => playlists::unlock(jb, conn),
        "playlist-set" => return playlists::set(jb, conn, args).await,
        "playlist-delete" => playlists::delete(jb, conn, args),
        // Scheduling
        "schedule-list" => schedule::list(jb, conn),
        "schedule-get" => schedule::get(jb, conn, args),
        "schedule-add" => schedule::add(jb, conn, args),
        "schedule-del" => schedule::del(jb, conn, args),
        // Session
        "user" => session::user(jb, conn, args),
        "cookie" => users::login_cookie(jb, conn, &args[0]),
        "nop" => conn.reply(rockoproto::status::OK, "nop"),
        "version" => session::version(conn),
        "volume" => session::volume(jb, conn, args),
        "log" => session::log(jb, conn),
        "shutdown" => session::shutdown(jb, conn),
        "reconfigure" => session::reconfigure(jb, conn),
        other => unreachable!("command {:?} in table but not dispatched", other),
    }
}

/// Resolve a user-supplied track name against the index.
pub(crate) fn resolve_track(jb: &Jukebox, name: &str) -> Option<String> {
    let config = jb.config.borrow();
    jb.tracks.borrow().resolve(name, &config.collections)
}
