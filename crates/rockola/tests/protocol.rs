//! End-to-end protocol tests: a real server on an ephemeral TCP port,
//! driven through the protocol client. Playback is pointed at the null
//! sink and play/random are disabled so the queue holds still unless a
//! test says otherwise.

use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;

use tokio::task::LocalSet;

use rockoconf::{Api, Config, PlayerSpec};
use rockola::queue::Origin;
use rockola::server::{self, Jukebox};
use rockola::store::UserRecord;
use rockola::trackdb::TrackDb;
use rockola::unix_now;
use rockoproto::{status, Client};

struct TestServer {
    jb: Rc<Jukebox>,
    addr: SocketAddr,
    _dir: tempfile::TempDir,
}

fn user(password: &str, rights: &str) -> UserRecord {
    UserRecord {
        password: password.to_string(),
        email: Some("user@example.com".to_string()),
        rights: rights.to_string(),
        confirmation: None,
        revoked_at: None,
        created: 0,
    }
}

async fn spawn_server() -> TestServer {
    let dir = tempfile::tempdir().unwrap();

    // A little collection of raw "tracks" decodable by cat.
    let music = dir.path().join("music");
    std::fs::create_dir_all(music.join("rock")).unwrap();
    for name in ["rock/one.raw", "rock/two.raw", "three.raw"] {
        std::fs::write(music.join(name), vec![0u8; 64]).unwrap();
    }

    let mut config = Config::default();
    config.home = dir.path().join("state");
    config.collections = vec![music];
    config.players = vec![PlayerSpec {
        pattern: "*.raw".to_string(),
        command: vec!["cat".to_string()],
    }];
    config.api = Api::None;
    config.authorization_algorithm = rockoproto::Algorithm::Sha256;

    let jb = Jukebox::new(config, None).unwrap();
    {
        let mut store = jb.store.borrow_mut();
        store
            .create_user(
                "alice",
                user(
                    "secret",
                    "read,play,pause,move-own,remove-own,scratch-own,prefs,global-prefs,volume",
                ),
            )
            .unwrap();
        store.create_user("bob", user("hunter2", "read")).unwrap();
        store.create_user("admin", user("grownup", "all")).unwrap();
        // Keep the pipeline quiet unless a test wants it.
        store.set_global("playing", "no").unwrap();
        store.set_global("random-play", "no").unwrap();
    }
    *jb.tracks.borrow_mut() = TrackDb::scan(&jb.config.borrow(), &TrackDb::default(), unix_now());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let jb2 = Rc::clone(&jb);
    tokio::task::spawn_local(async move {
        let _ = server::start(jb2, vec![listener], None).await;
    });
    TestServer {
        jb,
        addr,
        _dir: dir,
    }
}

async fn client(server: &TestServer) -> Client {
    Client::connect("127.0.0.1", server.addr.port())
        .await
        .expect("connect")
}

async fn login(server: &TestServer, name: &str, password: &str) -> Client {
    let mut c = client(server).await;
    let reply = c.login(name, password).await.expect("login i/o");
    assert!(reply.is_success(), "login failed: {}", reply.status);
    c
}

fn track(server: &TestServer, name: &str) -> String {
    server
        ._dir
        .path()
        .join("music")
        .join(name)
        .to_string_lossy()
        .into_owned()
}

/// Wait (bounded) for an event line matching the predicate.
async fn expect_event(c: &mut Client, want: impl Fn(&str) -> bool) -> String {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let event = tokio::time::timeout_at(deadline, c.next_event())
            .await
            .expect("timed out waiting for event")
            .expect("event i/o")
            .expect("log stream closed");
        // Strip the hex timestamp.
        let (stamp, rest) = event.split_once(' ').expect("stamped event");
        u64::from_str_radix(stamp, 16).expect("hex timestamp");
        if want(rest) {
            return rest.to_string();
        }
    }
}

#[tokio::test]
async fn test_greeting_and_challenge_login() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let server = spawn_server().await;

            let mut c = client(&server).await;
            assert_eq!(c.algorithm(), rockoproto::Algorithm::Sha256);

            let reply = c.login("alice", "wrong password").await.unwrap();
            assert_eq!(reply.status.code, status::AUTH_FAILED);

            // The nonce is per-connection; a fresh connection logs in fine.
            let mut c = client(&server).await;
            let reply = c.login("alice", "secret").await.unwrap();
            assert_eq!(reply.status.code, status::USER_OK);

            // Commands now work.
            let reply = c.command(&["version"]).await.unwrap();
            assert_eq!(reply.status.code, status::VALUE);

            // Auth succeeds at most once per connection.
            let reply = c.login("alice", "secret").await.unwrap();
            assert_eq!(reply.status.code, status::AUTH_FAILED);

            server.jb.shutdown.cancel();
        })
        .await;
}

#[tokio::test]
async fn test_commands_require_auth_and_rights() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let server = spawn_server().await;

            // Pre-auth: everything right-gated is 510.
            let mut c = client(&server).await;
            let reply = c.command(&["queue"]).await.unwrap();
            assert_eq!(reply.status.code, status::NOT_AUTHORIZED);

            // Unknown command and arity violations are 500.
            let reply = c.command(&["frobnicate"]).await.unwrap();
            assert_eq!(reply.status.code, status::BAD_COMMAND);
            let reply = c.command(&["user", "alice"]).await.unwrap();
            assert_eq!(reply.status.code, status::BAD_COMMAND);

            // bob has read only: play is denied and has no side effect.
            let mut bob = login(&server, "bob", "hunter2").await;
            let t = track(&server, "rock/one.raw");
            let reply = bob.command(&["play", &t]).await.unwrap();
            assert_eq!(reply.status.code, status::NOT_AUTHORIZED);
            assert_eq!(server.jb.queue.borrow().pending_len(), 0);

            server.jb.shutdown.cancel();
        })
        .await;
}

#[tokio::test]
async fn test_queue_lifecycle() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let server = spawn_server().await;
            let mut alice = login(&server, "alice", "secret").await;

            let one = track(&server, "rock/one.raw");
            let two = track(&server, "rock/two.raw");
            let three = track(&server, "three.raw");

            let id1 = alice.expect(&["play", &one]).await.unwrap().value().to_string();
            let id2 = alice.expect(&["play", &two]).await.unwrap().value().to_string();

            let reply = alice.expect(&["queue"]).await.unwrap();
            assert_eq!(reply.lines().len(), 2);
            assert!(reply.lines()[0].contains(&format!("id {}", id1)));
            assert!(reply.lines()[0].contains("state unplayed"));
            assert!(reply.lines()[0].contains("submitter alice"));

            // playafter re-anchors behind id1.
            let id3 = alice
                .expect(&["playafter", &id1, &three])
                .await
                .unwrap()
                .value()
                .to_string();
            let reply = alice.expect(&["queue"]).await.unwrap();
            let order: Vec<bool> = vec![
                reply.lines()[0].contains(&format!("id {}", id1)),
                reply.lines()[1].contains(&format!("id {}", id3)),
                reply.lines()[2].contains(&format!("id {}", id2)),
            ];
            assert_eq!(order, vec![true, true, true]);

            // move own entry to the head.
            alice.expect(&["move", &id2, "2"]).await.unwrap();
            let reply = alice.expect(&["queue"]).await.unwrap();
            assert!(reply.lines()[0].contains(&format!("id {}", id2)));

            // remove own entry.
            alice.expect(&["remove", &id3]).await.unwrap();
            let reply = alice.expect(&["queue"]).await.unwrap();
            assert_eq!(reply.lines().len(), 2);

            // playing: nothing is playing (play disabled).
            let reply = alice.command(&["playing"]).await.unwrap();
            assert_eq!(reply.status.code, status::COMMENT);

            // Unauthorized move: bob lacks every move right.
            let mut bob = login(&server, "bob", "hunter2").await;
            let reply = bob.command(&["move", &id1, "1"]).await.unwrap();
            assert_eq!(reply.status.code, status::NOT_AUTHORIZED);

            server.jb.shutdown.cancel();
        })
        .await;
}

#[tokio::test]
async fn test_prefs_round_trip() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let server = spawn_server().await;
            let mut alice = login(&server, "alice", "secret").await;
            let t = track(&server, "rock/one.raw");

            // set K V; get K -> 252 V
            alice.expect(&["set", &t, "tags", "loud, live"]).await.unwrap();
            let reply = alice.expect(&["get", &t, "tags"]).await.unwrap();
            assert_eq!(reply.value(), "loud, live");

            // unset K; get K -> 555 (distinct from 550)
            alice.expect(&["unset", &t, "tags"]).await.unwrap();
            let reply = alice.command(&["get", &t, "tags"]).await.unwrap();
            assert_eq!(reply.status.code, status::NO_VALUE);

            let reply = alice.command(&["get", "/no/such/track", "tags"]).await.unwrap();
            assert_eq!(reply.status.code, status::NOT_FOUND);

            // Globals go through the same distinction.
            let reply = alice.command(&["get-global", "theme"]).await.unwrap();
            assert_eq!(reply.status.code, status::NO_VALUE);
            alice.expect(&["set-global", "theme", "dark"]).await.unwrap();
            let reply = alice.expect(&["get-global", "theme"]).await.unwrap();
            assert_eq!(reply.value(), "dark");

            server.jb.shutdown.cancel();
        })
        .await;
}

#[tokio::test]
async fn test_catalog_queries() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let server = spawn_server().await;
            let mut alice = login(&server, "alice", "secret").await;
            let music = server._dir.path().join("music");

            let reply = alice
                .expect(&["dirs", &music.to_string_lossy()])
                .await
                .unwrap();
            assert_eq!(reply.lines().len(), 1);
            assert!(reply.lines()[0].ends_with("/rock"));

            let reply = alice
                .expect(&["files", &music.join("rock").to_string_lossy()])
                .await
                .unwrap();
            assert_eq!(reply.lines().len(), 2);

            let t = track(&server, "rock/one.raw");
            let reply = alice.expect(&["exists", &t]).await.unwrap();
            assert_eq!(reply.value(), "yes");
            let reply = alice.expect(&["exists", "/nope"]).await.unwrap();
            assert_eq!(reply.value(), "no");

            // resolve maps collection-relative names to track paths.
            let reply = alice.expect(&["resolve", "rock/one.raw"]).await.unwrap();
            assert_eq!(reply.value(), t);

            let reply = alice.expect(&["search", "one"]).await.unwrap();
            assert_eq!(reply.lines(), [t.clone()]);

            let reply = alice.expect(&["stats"]).await.unwrap();
            assert!(reply.lines().iter().any(|l| l == "tracks 3"));

            server.jb.shutdown.cancel();
        })
        .await;
}

#[tokio::test]
async fn test_event_log_sees_mutations() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let server = spawn_server().await;
            let mut watcher = login(&server, "alice", "secret").await;
            let reply = watcher.command(&["log"]).await.unwrap();
            assert_eq!(reply.status.code, status::LOG_FOLLOWS);

            // The prelude announces current state.
            expect_event(&mut watcher, |e| e == "state disable_play").await;

            let mut actor = login(&server, "alice", "secret").await;
            let t = track(&server, "rock/two.raw");
            let id = actor.expect(&["play", &t]).await.unwrap().value().to_string();

            let event = expect_event(&mut watcher, |e| e.starts_with("queue ")).await;
            assert!(event.contains(&format!("id {}", id)));

            actor.expect(&["remove", &id]).await.unwrap();
            expect_event(&mut watcher, |e| e == format!("removed {} alice", id)).await;

            server.jb.shutdown.cancel();
        })
        .await;
}

#[tokio::test]
async fn test_playlist_body_and_lock_contention() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let server = spawn_server().await;
            let mut alice = login(&server, "alice", "secret").await;

            alice.expect(&["playlist-lock", "mix"]).await.unwrap();

            // Same connection cannot take a second lock.
            let reply = alice.command(&["playlist-lock", "other"]).await.unwrap();
            assert_eq!(reply.status.code, status::NOT_FOUND);

            // Dotted body lines survive the framing.
            let body = vec![
                track(&server, "rock/one.raw"),
                ".hidden.raw".to_string(),
                "plain".to_string(),
            ];
            let reply = alice
                .command_with_body(&["playlist-set", "mix"], &body)
                .await
                .unwrap();
            assert!(reply.is_success(), "{}", reply.status);

            let reply = alice.expect(&["playlist-get", "mix"]).await.unwrap();
            assert_eq!(reply.lines(), body.as_slice());

            // Second connection: lock contention while alice holds it.
            let mut admin = login(&server, "admin", "grownup").await;
            let reply = admin.command(&["playlist-lock", "mix"]).await.unwrap();
            assert_eq!(reply.status.code, status::NOT_FOUND);

            // Locks die with the connection.
            drop(alice);
            let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
            loop {
                let reply = admin.command(&["playlist-lock", "mix"]).await.unwrap();
                if reply.is_success() {
                    break;
                }
                assert!(
                    tokio::time::Instant::now() < deadline,
                    "lock never released after disconnect"
                );
                tokio::time::sleep(Duration::from_millis(20)).await;
            }

            // Private playlist: admin may read, bob may not.
            let reply = admin.expect(&["playlist-get-share", "mix"]).await.unwrap();
            assert_eq!(reply.value(), "private");
            let mut bob = login(&server, "bob", "hunter2").await;
            let reply = bob.command(&["playlists"]).await.unwrap();
            assert!(reply.lines().is_empty());

            server.jb.shutdown.cancel();
        })
        .await;
}

#[tokio::test]
async fn test_cookie_round_trip_and_revocation() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let server = spawn_server().await;
            let mut alice = login(&server, "alice", "secret").await;
            let cookie = alice.expect(&["make-cookie"]).await.unwrap().value().to_string();

            // A fresh connection logs in with the cookie alone.
            let mut other = client(&server).await;
            let reply = other.login_cookie(&cookie).await.unwrap();
            assert_eq!(reply.status.code, status::COOKIE_USER);
            assert_eq!(reply.status.text, "alice");
            assert_eq!(other.user(), Some("alice"));

            // Revocation kills it for future sessions.
            alice.expect(&["revoke"]).await.unwrap();
            let mut third = client(&server).await;
            let reply = third.login_cookie(&cookie).await.unwrap();
            assert_eq!(reply.status.code, status::AUTH_FAILED);

            server.jb.shutdown.cancel();
        })
        .await;
}

#[tokio::test]
async fn test_user_management_and_rights_propagation() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let server = spawn_server().await;
            // remote_userman defaults to off; turn it on for this test.
            server.jb.config.borrow_mut().remote_userman = true;

            let mut admin = login(&server, "admin", "grownup").await;
            admin
                .expect(&["adduser", "carol", "pw", "read,play"])
                .await
                .unwrap();

            let mut carol = login(&server, "carol", "pw").await;
            let t = track(&server, "three.raw");
            carol.expect(&["play", &t]).await.unwrap();

            // Rights are revoked in place on live connections.
            admin
                .expect(&["edituser", "carol", "rights", "read"])
                .await
                .unwrap();
            let reply = carol.command(&["play", &t]).await.unwrap();
            assert_eq!(reply.status.code, status::NOT_AUTHORIZED);

            // Self-service: carol may change her own email but not bob's.
            carol
                .expect(&["edituser", "carol", "email", "c@example.com"])
                .await
                .unwrap();
            let reply = carol
                .command(&["edituser", "bob", "email", "evil@example.com"])
                .await
                .unwrap();
            assert_eq!(reply.status.code, status::NOT_AUTHORIZED);

            // userinfo: own rights readable, admin required for others.
            let reply = carol.expect(&["userinfo", "carol", "rights"]).await.unwrap();
            assert_eq!(reply.value(), "read");
            let reply = carol.command(&["userinfo", "bob", "email"]).await.unwrap();
            assert_eq!(reply.status.code, status::NOT_AUTHORIZED);

            admin.expect(&["deluser", "carol"]).await.unwrap();
            let reply = admin.command(&["userinfo", "carol", "rights"]).await.unwrap();
            assert_eq!(reply.status.code, status::NOT_FOUND);

            server.jb.shutdown.cancel();
        })
        .await;
}

#[tokio::test]
async fn test_random_top_up_within_one_iteration() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let server = spawn_server().await;
            server.jb.config.borrow_mut().queue_pad = 3;

            let mut alice = login(&server, "alice", "secret").await;
            let t = track(&server, "rock/one.raw");
            alice.expect(&["play", &t]).await.unwrap();

            // Enabling random play tops the queue up immediately.
            alice.expect(&["random-enable"]).await.unwrap();
            let reply = alice.expect(&["queue"]).await.unwrap();
            assert_eq!(reply.lines().len(), 3);
            let randoms = reply
                .lines()
                .iter()
                .filter(|l| l.contains("origin random"))
                .count();
            assert_eq!(randoms, 2);

            // Adoption claims a random entry.
            let random_line = reply
                .lines()
                .iter()
                .find(|l| l.contains("origin random"))
                .unwrap();
            let words = rockoproto::split(random_line, rockoproto::SplitFlags::QUOTES).unwrap();
            let id = words[words.iter().position(|w| w == "id").unwrap() + 1].clone();
            alice.expect(&["adopt", &id]).await.unwrap();
            let reply = alice.expect(&["queue"]).await.unwrap();
            let adopted = reply
                .lines()
                .iter()
                .find(|l| l.contains(&format!("id {}", id)))
                .unwrap();
            assert!(adopted.contains("origin adopted"));
            assert!(adopted.contains("submitter alice"));

            server.jb.shutdown.cancel();
        })
        .await;
}

#[tokio::test]
async fn test_playback_end_to_end_with_null_sink() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let server = spawn_server().await;
            let mut watcher = login(&server, "alice", "secret").await;
            watcher.command(&["log"]).await.unwrap();

            let mut alice = login(&server, "alice", "secret").await;
            let t = track(&server, "rock/one.raw");
            let id = alice.expect(&["play", &t]).await.unwrap().value().to_string();

            // Turning play on starts the head track.
            server
                .jb
                .store
                .borrow_mut()
                .set_global("playing", "yes")
                .unwrap();
            server.jb.player.wake();

            expect_event(&mut watcher, |e| e == format!("playing {}", id)).await;
            // 64 bytes of "PCM" drain immediately; the entry retires.
            expect_event(&mut watcher, |e| e == format!("recent {}", id)).await;

            let reply = alice.expect(&["recent"]).await.unwrap();
            assert!(reply.lines()[0].contains(&format!("id {}", id)));
            assert!(reply.lines()[0].contains("state ok"));

            server.jb.shutdown.cancel();
        })
        .await;
}

#[tokio::test]
async fn test_volume_and_enable_surface() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let server = spawn_server().await;
            let mut alice = login(&server, "alice", "secret").await;

            let reply = alice.expect(&["volume"]).await.unwrap();
            assert_eq!(reply.value(), "100 100");
            let reply = alice.expect(&["volume", "60", "40"]).await.unwrap();
            assert_eq!(reply.value(), "60 40");

            // bob can read but not set.
            let mut bob = login(&server, "bob", "hunter2").await;
            let reply = bob.expect(&["volume"]).await.unwrap();
            assert_eq!(reply.value(), "60 40");
            let reply = bob.command(&["volume", "0"]).await.unwrap();
            assert_eq!(reply.status.code, status::NOT_AUTHORIZED);

            let reply = alice.expect(&["enabled"]).await.unwrap();
            assert_eq!(reply.value(), "no");
            alice.expect(&["enable"]).await.unwrap();
            let reply = alice.expect(&["enabled"]).await.unwrap();
            assert_eq!(reply.value(), "yes");
            alice.expect(&["disable"]).await.unwrap();

            server.jb.shutdown.cancel();
        })
        .await;
}

#[tokio::test]
async fn test_schedule_surface() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let server = spawn_server().await;
            let mut alice = login(&server, "alice", "secret").await;
            let t = track(&server, "rock/one.raw");

            // Past times are refused.
            let reply = alice
                .command(&["schedule-add", "100", "normal", "play", &t])
                .await
                .unwrap();
            assert_eq!(reply.status.code, status::NOT_FOUND);

            let when = (unix_now() + 3600).to_string();
            let id = alice
                .expect(&["schedule-add", &when, "normal", "play", &t])
                .await
                .unwrap()
                .value()
                .to_string();

            let reply = alice.expect(&["schedule-list"]).await.unwrap();
            assert_eq!(reply.lines(), [id.clone()]);

            let reply = alice.expect(&["schedule-get", &id]).await.unwrap();
            assert!(reply.lines().iter().any(|l| l == "who alice"));
            assert!(reply.lines().iter().any(|l| l == "action play"));

            // bob is neither owner nor admin.
            let mut bob = login(&server, "bob", "hunter2").await;
            let reply = bob.command(&["schedule-del", &id]).await.unwrap();
            assert_eq!(reply.status.code, status::NOT_AUTHORIZED);

            alice.expect(&["schedule-del", &id]).await.unwrap();
            let reply = alice.expect(&["schedule-list"]).await.unwrap();
            assert!(reply.lines().is_empty());

            server.jb.shutdown.cancel();
        })
        .await;
}

#[tokio::test]
async fn test_queue_survives_restart() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let server = spawn_server().await;
            let mut alice = login(&server, "alice", "secret").await;
            let t = track(&server, "rock/one.raw");
            let id = alice.expect(&["play", &t]).await.unwrap().value().to_string();
            server.jb.shutdown.cancel();
            // Give the snapshot a beat to land.
            tokio::time::sleep(Duration::from_millis(50)).await;

            // A second jukebox over the same home dir restores the entry.
            let config = server.jb.config.borrow().clone();
            let jb2 = Jukebox::new(config, None).unwrap();
            let queue = jb2.queue.borrow();
            let restored = queue.head().expect("entry restored");
            assert_eq!(restored.id, id);
            assert_eq!(restored.track, t);
            assert_eq!(restored.origin, Origin::Picked);
            assert_eq!(restored.submitter.as_deref(), Some("alice"));
        })
        .await;
}

#[tokio::test]
async fn test_rtp_request_registration() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let server = spawn_server().await;
            let mut alice = login(&server, "alice", "secret").await;

            // No broadcast configured.
            let reply = alice.command(&["rtp-address"]).await.unwrap();
            assert_eq!(reply.status.code, status::NOT_FOUND);

            let reply = alice.command(&["rtp-cancel"]).await.unwrap();
            assert_eq!(reply.status.code, status::NOT_FOUND);

            alice.expect(&["rtp-request", "127.0.0.1", "9005"]).await.unwrap();
            assert_eq!(server.jb.rtp_recipients.borrow().len(), 1);
            alice.expect(&["rtp-cancel"]).await.unwrap();
            assert_eq!(server.jb.rtp_recipients.borrow().len(), 0);

            // Recipients are dropped on disconnect, too.
            alice.expect(&["rtp-request", "127.0.0.1", "9005"]).await.unwrap();
            drop(alice);
            let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
            while !server.jb.rtp_recipients.borrow().is_empty() {
                assert!(tokio::time::Instant::now() < deadline);
                tokio::time::sleep(Duration::from_millis(20)).await;
            }

            server.jb.shutdown.cancel();
        })
        .await;
}

#[tokio::test]
async fn test_local_socket_bypasses_remote_userman_gate() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let server = spawn_server().await;

            // Over TCP with remote_userman off, even the admin may not
            // manage users.
            let mut remote_admin = login(&server, "admin", "grownup").await;
            let reply = remote_admin
                .command(&["adduser", "dave", "pw"])
                .await
                .unwrap();
            assert_eq!(reply.status.code, status::NOT_AUTHORIZED);

            // The same admin over the local socket may.
            let socket_path = server._dir.path().join("socket");
            let unix = tokio::net::UnixListener::bind(&socket_path).unwrap();
            let jb = Rc::clone(&server.jb);
            tokio::task::spawn_local(async move {
                let _ = server::start(jb, Vec::new(), Some(unix)).await;
            });

            let mut local_admin = Client::connect_unix(&socket_path).await.unwrap();
            let reply = local_admin.login("admin", "grownup").await.unwrap();
            assert!(reply.is_success());
            local_admin.expect(&["adduser", "dave", "pw"]).await.unwrap();
            assert!(server.jb.store.borrow().user("dave").is_some());

            server.jb.shutdown.cancel();
        })
        .await;
}

#[tokio::test]
async fn test_rights_check_is_ownership_aware() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let server = spawn_server().await;
            // carol gets move-own only; she may not touch alice's entries.
            server
                .jb
                .store
                .borrow_mut()
                .create_user("carol", user("pw", "read,play,move-own"))
                .unwrap();

            let mut alice = login(&server, "alice", "secret").await;
            let mut carol = login(&server, "carol", "pw").await;

            let one = track(&server, "rock/one.raw");
            let two = track(&server, "rock/two.raw");
            let alice_id = alice.expect(&["play", &one]).await.unwrap().value().to_string();
            let carol_id = carol.expect(&["play", &two]).await.unwrap().value().to_string();

            // Dispatch admits carol (she holds *a* move right) but the
            // ownership check rejects the foreign entry.
            let reply = carol.command(&["move", &alice_id, "1"]).await.unwrap();
            assert_eq!(reply.status.code, status::NOT_AUTHORIZED);

            carol.expect(&["move", &carol_id, "1"]).await.unwrap();
            let reply = carol.expect(&["queue"]).await.unwrap();
            assert!(reply.lines()[0].contains(&format!("id {}", carol_id)));

            server.jb.shutdown.cancel();
        })
        .await;
}
