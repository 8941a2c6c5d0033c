//! Server assembly: the shared context object and the accept/signal loops.
//!
//! `Jukebox` is the one context threaded through every handler: config,
//! store, track index, queue, event bus, cookie factory, connection
//! registry. It is reference-counted but never crosses a thread; all
//! mutation happens through `RefCell`/`Cell` on the single runtime thread.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use rand::RngCore;
use tokio::net::{TcpListener, UnixListener};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use rockoconf::Config;
use rockoproto::Rights;

use crate::connection::{self, ConnShared};
use crate::cookies::CookieFactory;
use crate::events::EventLog;
use crate::mixer::{backend_for, MixerDriver};
use crate::player::PlayerState;
use crate::queue::{Origin, Queue, QueueEntry};
use crate::random;
use crate::rtp::RecipientSet;
use crate::schedule;
use crate::store::{Store, UserRecord};
use crate::trackdb::TrackDb;
use crate::unix_now;

/// Tracks an in-flight rescanner child.
#[derive(Default)]
pub struct RescanControl {
    pub running: Cell<bool>,
    pub done: tokio::sync::Notify,
}

/// One held playlist lock.
pub struct PlaylistLock {
    pub conn_id: u64,
    pub taken_at: Instant,
}

/// The server context.
pub struct Jukebox {
    pub config: RefCell<Config>,
    pub config_path: Option<PathBuf>,
    pub store: RefCell<Store>,
    pub tracks: RefCell<TrackDb>,
    pub queue: RefCell<Queue>,
    pub events: EventLog,
    pub cookies: RefCell<CookieFactory>,
    pub player: PlayerState,
    pub rescan: RescanControl,
    pub volume: Cell<(u8, u8)>,
    pub connections: RefCell<Vec<Rc<ConnShared>>>,
    pub locks: RefCell<HashMap<String, PlaylistLock>>,
    pub rtp_recipients: RecipientSet,
    /// Last reminder mail per user; bounded by the user count.
    pub reminders: RefCell<HashMap<String, u64>>,
    /// Kicked when the schedule table changes so the scheduler re-plans.
    pub schedule_changed: tokio::sync::Notify,
    pub shutdown: CancellationToken,
    pub started_at: Instant,
    next_conn_id: Cell<u64>,
}

impl Jukebox {
    pub fn new(config: Config, config_path: Option<PathBuf>) -> Result<Rc<Jukebox>> {
        let store = Store::open(&config.home).context("cannot open state store")?;
        let tracks = TrackDb::load(&config.home).context("cannot load track index")?;
        let mut queue = Queue::new(config.history);
        let restored = store.load_queue().context("cannot restore queue")?;
        if !restored.is_empty() {
            info!(entries = restored.len(), "queue restored from snapshot");
        }
        queue.restore(restored);

        let now = unix_now();
        let cookies = CookieFactory::new(
            config.cookie_key_lifetime,
            config.cookie_login_lifetime,
            now,
        );

        let jb = Rc::new(Jukebox {
            config: RefCell::new(config),
            config_path,
            store: RefCell::new(store),
            tracks: RefCell::new(tracks),
            queue: RefCell::new(queue),
            events: EventLog::new(),
            cookies: RefCell::new(cookies),
            player: PlayerState::default(),
            rescan: RescanControl::default(),
            volume: Cell::new((100, 100)),
            connections: RefCell::new(Vec::new()),
            locks: RefCell::new(HashMap::new()),
            rtp_recipients: RecipientSet::default(),
            reminders: RefCell::new(HashMap::new()),
            schedule_changed: tokio::sync::Notify::new(),
            shutdown: CancellationToken::new(),
            started_at: Instant::now(),
            next_conn_id: Cell::new(1),
        });
        jb.bootstrap_root()?;
        Ok(jb)
    }

    /// First run: create the root user with every right and a random
    /// password, left readable only in the state directory.
    fn bootstrap_root(&self) -> Result<()> {
        let mut store = self.store.borrow_mut();
        if store.user_count() > 0 {
            return Ok(());
        }
        let mut secret = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut secret);
        let password = hex::encode(secret);
        store
            .create_user(
                "root",
                UserRecord {
                    password: password.clone(),
                    email: None,
                    rights: Rights::all_grantable().to_string(),
                    confirmation: None,
                    revoked_at: None,
                    created: unix_now(),
                },
            )
            .context("cannot create root user")?;
        let path = store.home().join("rootpass");
        std::fs::write(&path, format!("{}\n", password))
            .with_context(|| format!("cannot write {}", path.display()))?;
        info!(path = %path.display(), "created root user, password written");
        Ok(())
    }

    pub fn next_conn_id(&self) -> u64 {
        let id = self.next_conn_id.get();
        self.next_conn_id.set(id + 1);
        id
    }

    /// Publish an event to the log bus.
    pub fn publish(&self, message: &str) {
        let remote_userman = self.config.borrow().remote_userman;
        self.events.publish(remote_userman, message);
    }

    pub fn playing_enabled(&self) -> bool {
        self.store.borrow().playing_enabled()
    }

    pub fn random_enabled(&self) -> bool {
        self.store.borrow().random_enabled()
    }

    pub fn marshal_entry(&self, entry: &QueueEntry) -> String {
        let config = self.config.borrow();
        entry.marshal(config.sample_rate, config.channels)
    }

    /// Recompute derived expected start times from known track lengths.
    pub fn refresh_expected(&self) {
        let tracks = self.tracks.borrow();
        self.queue
            .borrow_mut()
            .refresh_expected(unix_now(), |track| tracks.info(track).and_then(|i| i.length));
    }

    pub fn save_queue(&self) {
        let snapshot = self.queue.borrow().snapshot();
        if let Err(e) = self.store.borrow().save_queue(&snapshot) {
            warn!(error = %e, "cannot snapshot queue");
        }
    }

    /// Top the queue up to `queue_pad` with randomly chosen tracks.
    pub fn top_up_random(&self) {
        if !self.random_enabled() {
            return;
        }
        let pad = self.config.borrow().queue_pad;
        let mut added = false;
        loop {
            if self.queue.borrow().pending_len() >= pad {
                break;
            }
            let choice = {
                let tracks = self.tracks.borrow();
                let store = self.store.borrow();
                let queue = self.queue.borrow();
                let config = self.config.borrow();
                random::choose(
                    &tracks,
                    &store,
                    &queue,
                    &config,
                    unix_now(),
                    &mut rand::thread_rng(),
                )
            };
            let Some(track) = choice else { break };
            let id = self
                .queue
                .borrow_mut()
                .push_back(track, None, Origin::Random, unix_now());
            let marshalled = {
                let queue = self.queue.borrow();
                self.marshal_entry(queue.find(&id).expect("just added"))
            };
            self.publish(&format!("queue {}", marshalled));
            added = true;
        }
        if added {
            self.save_queue();
            self.player.wake();
        }
    }

    /// Register a live connection for rights propagation.
    pub fn register_conn(&self, conn: Rc<ConnShared>) {
        self.connections.borrow_mut().push(conn);
    }

    /// Tear down everything a closed connection held.
    pub fn unregister_conn(&self, conn_id: u64) {
        self.connections.borrow_mut().retain(|c| c.id != conn_id);
        self.events.unsubscribe(conn_id);
        self.rtp_recipients.borrow_mut().remove(&conn_id);
        self.locks
            .borrow_mut()
            .retain(|_, lock| lock.conn_id != conn_id);
    }

    /// Update the in-place rights of every live connection authenticated
    /// as `user` (edituser propagation).
    pub fn propagate_rights(&self, user: &str, rights: Rights) {
        for conn in self.connections.borrow().iter() {
            if conn.user.borrow().as_deref() == Some(user) {
                let effective = if conn.local {
                    rights | Rights::LOCAL
                } else {
                    rights
                };
                conn.rights.set(effective);
            }
        }
        self.publish(&format!(
            "rights_changed {}",
            rockoproto::quote_word(&rights.to_string())
        ));
    }

    /// Reload configuration from disk and apply what is runtime-mutable.
    pub fn reconfigure(&self) -> Result<()> {
        let fresh = Config::load(self.config_path.as_deref()).context("reloading config")?;
        *self.config.borrow_mut() = fresh;
        info!("configuration reloaded");
        self.player.wake();
        Ok(())
    }

    /// Reload the track index (after the rescanner finished).
    pub fn reload_tracks(&self) -> Result<()> {
        let home = self.config.borrow().home.clone();
        *self.tracks.borrow_mut() = TrackDb::load(&home)?;
        info!(tracks = self.tracks.borrow().len(), "track index reloaded");
        Ok(())
    }

}

/// Kick off the rescanner subprocess unless one is already running. The
/// index is reloaded and `rescanned` published when the child succeeds.
pub fn spawn_rescan(jb: &Rc<Jukebox>) -> std::result::Result<(), String> {
    if jb.rescan.running.get() {
        return Err("rescan already underway".to_string());
    }
    let exe = std::env::current_exe().map_err(|e| e.to_string())?;
    let mut argv = vec![exe.to_string_lossy().into_owned()];
    if let Some(path) = &jb.config_path {
        argv.push("--config".to_string());
        argv.push(path.to_string_lossy().into_owned());
    }
    argv.push("rescan".to_string());

    let child =
        crate::reactor::children::spawn_helper("rescan", &argv).map_err(|e| e.to_string())?;
    jb.rescan.running.set(true);

    let jb = Rc::clone(jb);
    tokio::task::spawn_local(async move {
        let mut child = child;
        match child.wait().await {
            Ok(status) if status.success() => {
                if let Err(e) = jb.reload_tracks() {
                    error!(error = %e, "rescan finished but index reload failed");
                } else {
                    jb.publish("rescanned");
                    jb.top_up_random();
                }
            }
            Ok(status) => warn!(%status, "rescanner failed"),
            Err(e) => warn!(error = %e, "could not reap rescanner"),
        }
        jb.rescan.running.set(false);
        jb.rescan.done.notify_waiters();
    });
    Ok(())
}

/// Bind every configured listener and serve until shutdown. Failing to
/// bind anything configured is fatal.
pub async fn serve(jb: Rc<Jukebox>) -> Result<()> {
    let (tcp_addrs, socket_path) = {
        let config = jb.config.borrow();
        (config.listen.clone(), config.socket.clone())
    };
    if tcp_addrs.is_empty() && socket_path.is_none() {
        bail!("no listeners configured (need `listen` or `socket`)");
    }

    let mut tcp = Vec::new();
    for (addr, port) in &tcp_addrs {
        let listener = TcpListener::bind((addr.as_str(), *port))
            .await
            .with_context(|| format!("cannot bind {}:{}", addr, port))?;
        info!(addr, port, "listening");
        tcp.push(listener);
    }

    let unix = match &socket_path {
        Some(path) => {
            // A stale socket file from a previous run would fail the bind.
            let _ = std::fs::remove_file(path);
            let listener = UnixListener::bind(path)
                .with_context(|| format!("cannot bind {}", path.display()))?;
            info!(path = %path.display(), "listening on local socket");
            Some(listener)
        }
        None => None,
    };

    let result = start(Rc::clone(&jb), tcp, unix).await;
    if let Some(path) = socket_path {
        let _ = std::fs::remove_file(path);
    }
    result
}

/// Serve pre-bound listeners (tests hand in ephemeral ones directly).
pub async fn start(
    jb: Rc<Jukebox>,
    tcp: Vec<TcpListener>,
    unix: Option<UnixListener>,
) -> Result<()> {
    for listener in tcp {
        tokio::task::spawn_local(accept_tcp(Rc::clone(&jb), listener));
    }
    if let Some(listener) = unix {
        tokio::task::spawn_local(accept_unix(Rc::clone(&jb), listener));
    }

    // The audio pipeline. Clone the config out so no borrow spans the
    // backend's async setup.
    let config = jb.config.borrow().clone();
    let backend =
        backend_for(&config, jb.rtp_recipients.clone()).context("cannot build audio backend")?;
    let driver = MixerDriver::new(backend, &config)
        .await
        .context("cannot initialize audio backend")?;
    tokio::task::spawn_local(crate::player::run(Rc::clone(&jb), driver));

    // The scheduler.
    tokio::task::spawn_local(schedule::run(Rc::clone(&jb)));

    // Signals drive shutdown and reconfiguration.
    tokio::task::spawn_local(signal_loop(Rc::clone(&jb)));

    jb.shutdown.cancelled().await;
    jb.save_queue();
    info!("server stopped");
    Ok(())
}

async fn signal_loop(jb: Rc<Jukebox>) {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "cannot install SIGINT handler");
            return;
        }
    };
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "cannot install SIGTERM handler");
            return;
        }
    };
    let mut sighup = match signal(SignalKind::hangup()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "cannot install SIGHUP handler");
            return;
        }
    };

    loop {
        tokio::select! {
            _ = sigint.recv() => {
                info!("SIGINT, shutting down");
                jb.shutdown.cancel();
                return;
            }
            _ = sigterm.recv() => {
                info!("SIGTERM, shutting down");
                jb.shutdown.cancel();
                return;
            }
            _ = sighup.recv() => {
                info!("SIGHUP, reconfiguring");
                if let Err(e) = jb.reconfigure() {
                    error!(error = %e, "reconfiguration failed, keeping old config");
                }
            }
            _ = jb.shutdown.cancelled() => return,
        }
    }
}

async fn accept_tcp(jb: Rc<Jukebox>, listener: TcpListener) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    if at_connection_limit(&jb) {
                        warn!(%peer, "connection limit reached, refusing");
                        continue;
                    }
                    debug!(%peer, "accepted connection");
                    tokio::task::spawn_local(connection::run(
                        Rc::clone(&jb),
                        Box::new(stream),
                        false,
                    ));
                }
                // Transient accept failures must not kill the listener.
                Err(e) => warn!(error = %e, "accept failed"),
            },
            _ = jb.shutdown.cancelled() => return,
        }
    }
}

async fn accept_unix(jb: Rc<Jukebox>, listener: UnixListener) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    if at_connection_limit(&jb) {
                        warn!("connection limit reached, refusing local client");
                        continue;
                    }
                    debug!("accepted local connection");
                    tokio::task::spawn_local(connection::run(
                        Rc::clone(&jb),
                        Box::new(stream),
                        true,
                    ));
                }
                Err(e) => warn!(error = %e, "accept failed on local socket"),
            },
            _ = jb.shutdown.cancelled() => return,
        }
    }
}

/// The hard registration bound: beyond it new connections are refused at
/// accept time, never crashing the server.
fn at_connection_limit(jb: &Jukebox) -> bool {
    jb.connections.borrow().len() >= jb.config.borrow().max_connections
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> (tempfile::TempDir, Config) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.home = dir.path().to_path_buf();
        (dir, config)
    }

    #[test]
    fn test_bootstrap_creates_root_once() {
        let (dir, config) = test_config();
        {
            let jb = Jukebox::new(config.clone(), None).unwrap();
            let store = jb.store.borrow();
            let root = store.user("root").unwrap();
            assert!(root.rights().contains(Rights::ADMIN));
            assert!(dir.path().join("rootpass").exists());
        }
        // Second startup keeps the same password.
        let pass1 = std::fs::read_to_string(dir.path().join("rootpass")).unwrap();
        let jb = Jukebox::new(config, None).unwrap();
        assert_eq!(jb.store.borrow().user_count(), 1);
        let pass2 = std::fs::read_to_string(dir.path().join("rootpass")).unwrap();
        assert_eq!(pass1, pass2);
    }

    #[test]
    fn test_conn_ids_monotonic() {
        let (_dir, config) = test_config();
        let jb = Jukebox::new(config, None).unwrap();
        let a = jb.next_conn_id();
        let b = jb.next_conn_id();
        assert!(b > a);
    }

    #[test]
    fn test_unregister_releases_everything() {
        let (_dir, config) = test_config();
        let jb = Jukebox::new(config, None).unwrap();
        let conn = Rc::new(ConnShared {
            id: 42,
            local: false,
            user: RefCell::new(None),
            rights: Cell::new(Rights::empty()),
        });
        jb.register_conn(Rc::clone(&conn));
        jb.locks.borrow_mut().insert(
            "p".to_string(),
            PlaylistLock {
                conn_id: 42,
                taken_at: Instant::now(),
            },
        );
        jb.rtp_recipients
            .borrow_mut()
            .insert(42, "127.0.0.1:9005".parse().unwrap());

        jb.unregister_conn(42);
        assert!(jb.connections.borrow().is_empty());
        assert!(jb.locks.borrow().is_empty());
        assert!(jb.rtp_recipients.borrow().is_empty());
    }

    #[test]
    fn test_propagate_rights_updates_matching_conns() {
        let (_dir, config) = test_config();
        let jb = Jukebox::new(config, None).unwrap();
        let alice = Rc::new(ConnShared {
            id: 1,
            local: false,
            user: RefCell::new(Some("alice".to_string())),
            rights: Cell::new(Rights::READ),
        });
        let local_alice = Rc::new(ConnShared {
            id: 2,
            local: true,
            user: RefCell::new(Some("alice".to_string())),
            rights: Cell::new(Rights::READ | Rights::LOCAL),
        });
        let bob = Rc::new(ConnShared {
            id: 3,
            local: false,
            user: RefCell::new(Some("bob".to_string())),
            rights: Cell::new(Rights::READ),
        });
        for c in [&alice, &local_alice, &bob] {
            jb.register_conn(Rc::clone(c));
        }

        jb.propagate_rights("alice", Rights::READ | Rights::PLAY);
        assert_eq!(alice.rights.get(), Rights::READ | Rights::PLAY);
        assert_eq!(
            local_alice.rights.get(),
            Rights::READ | Rights::PLAY | Rights::LOCAL
        );
        assert_eq!(bob.rights.get(), Rights::READ);
    }
}
