//! The Rockola jukebox daemon.
//!
//! A single-threaded, cooperative server: one tokio current-thread runtime
//! runs the protocol engine, the queue engine, the mixer driver and the RTP
//! transmitter as local tasks over shared `Rc<RefCell<...>>` state. Blocking
//! work (decoders, the rescanner, the mailer) happens in subprocesses
//! supervised through [`reactor::children`].

pub mod commands;
pub mod connection;
pub mod cookies;
pub mod events;
pub mod mixer;
pub mod player;
pub mod queue;
pub mod random;
pub mod reactor;
pub mod rescan;
pub mod rtp;
pub mod schedule;
pub mod server;
pub mod store;
pub mod trackdb;

pub use server::Jukebox;

/// Seconds since the Unix epoch.
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
