//! The single-threaded event core.
//!
//! The C-era jukebox owned a hand-rolled poll loop; here the tokio
//! current-thread runtime is the demultiplexer and this module carries the
//! parts that stay our problem: per-connection buffered I/O with hard
//! back-pressure bounds, and subprocess supervision with reaping.
//!
//! Everything in the server runs on one thread. State is shared with
//! `Rc<RefCell<...>>`, tasks are `spawn_local`, and nothing blocks.

pub mod children;
pub mod io;
