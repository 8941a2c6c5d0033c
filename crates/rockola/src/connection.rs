//! Per-connection protocol engine.
//!
//! Each accepted socket gets one local task running [`run`]: greeting,
//! then a strict request/response line loop. The reader switches into
//! body-collection mode inside body-carrying handlers, so no other command
//! dispatches while a body is in flight. Responses and event-log lines
//! share the connection's bounded writer and therefore stay ordered.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use tracing::{debug, info_span, Instrument};
use unicode_normalization::UnicodeNormalization;

use rockoproto::{self as proto, generate_nonce, split, Rights, SplitFlags, PROTOCOL_VERSION};

use crate::commands;
use crate::reactor::io::{spawn_writer, BoxedStream, ConnWriter, LineError, LineReader};
use crate::server::Jukebox;

/// The slice of connection state other subsystems need to see: the event
/// bus filters on rights, `edituser` rewrites them in place.
pub struct ConnShared {
    pub id: u64,
    pub local: bool,
    pub user: RefCell<Option<String>>,
    pub rights: Cell<Rights>,
}

impl ConnShared {
    pub fn username(&self) -> Option<String> {
        self.user.borrow().clone()
    }
}

pub struct Connection {
    pub shared: Rc<ConnShared>,
    pub reader: LineReader,
    pub writer: ConnWriter,
    /// The challenge sent in the greeting.
    pub nonce: [u8; 16],
    /// Set once the connection holds a `log` subscription.
    pub log_active: bool,
    /// Name of the playlist lock this connection holds, if any.
    pub lock: Option<String>,
}

impl Connection {
    pub fn user(&self) -> Option<String> {
        self.shared.username()
    }

    pub fn rights(&self) -> Rights {
        self.shared.rights.get()
    }

    /// Send one response line; errors surface as a dead writer, which the
    /// main loop notices.
    pub fn reply(&self, code: u16, text: &str) {
        let _ = self.writer.send_line(&format!("{:03} {}", code, text));
    }

    /// Send a `x53` response followed by a dot-escaped body.
    pub fn reply_body<I, S>(&self, code: u16, text: &str, lines: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.reply(code, text);
        for line in lines {
            let _ = self
                .writer
                .send_line(&proto::escape_body_line(line.as_ref()));
        }
        let _ = self.writer.send_line(proto::BODY_TERMINATOR);
    }

    /// Collect a dot-terminated body (the reader variant switch). `None`
    /// means the peer went away mid-body.
    pub async fn read_body(&mut self) -> Result<Option<Vec<String>>, LineError> {
        let mut lines = Vec::new();
        loop {
            match self.reader.next_line().await? {
                None => return Ok(None),
                Some(line) if line == proto::BODY_TERMINATOR => return Ok(Some(lines)),
                Some(line) => lines.push(proto::unescape_body_line(&line)),
            }
        }
    }
}

/// Serve one client connection to completion.
pub async fn run(jb: Rc<Jukebox>, stream: BoxedStream, local: bool) {
    let id = jb.next_conn_id();
    let span = info_span!("conn", id, local);
    serve_connection(jb, stream, local, id).instrument(span).await;
}

async fn serve_connection(jb: Rc<Jukebox>, stream: BoxedStream, local: bool, id: u64) {
    let (read_half, write_half) = tokio::io::split(stream);
    let (time_bound, space_bound, algorithm) = {
        let config = jb.config.borrow();
        (
            config.connection_timeout,
            config.connection_buffer,
            config.authorization_algorithm,
        )
    };
    let writer = spawn_writer(write_half, time_bound, space_bound);

    let nonce = generate_nonce();
    let greeting = format!(
        "{:03} {} {} {}",
        proto::status::GREETING,
        PROTOCOL_VERSION,
        algorithm,
        hex::encode(nonce)
    );
    if writer.send_line(&greeting).is_err() {
        return;
    }

    let shared = Rc::new(ConnShared {
        id,
        local,
        user: RefCell::new(None),
        rights: Cell::new(Rights::empty()),
    });
    jb.register_conn(Rc::clone(&shared));

    let mut conn = Connection {
        shared,
        reader: LineReader::new(read_half),
        writer,
        nonce,
        log_active: false,
        lock: None,
    };

    loop {
        if !conn.writer.is_alive() {
            debug!("writer abandoned, closing connection");
            break;
        }

        let line = tokio::select! {
            line = conn.reader.next_line() => line,
            _ = jb.shutdown.cancelled() => break,
        };

        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => {
                debug!("client closed connection");
                break;
            }
            Err(LineError::TooLong) => {
                // The codec discarded the oversized line; the connection
                // itself is still usable.
                conn.reply(proto::status::BAD_COMMAND, "line too long");
                continue;
            }
            Err(LineError::Io(e)) => {
                debug!(error = %e, "read error");
                break;
            }
        };

        // Inbound text is normalized to NFC before any parsing.
        let line: String = line.nfc().collect();

        let words = match split(&line, SplitFlags::QUOTES) {
            Ok(words) => words,
            Err(e) => {
                conn.reply(proto::status::BAD_COMMAND, &format!("syntax error: {}", e));
                continue;
            }
        };
        if words.is_empty() {
            conn.reply(proto::status::BAD_COMMAND, "empty command");
            continue;
        }

        // A connection that was following the log returns to command mode
        // the moment it speaks again.
        if conn.log_active {
            jb.events.unsubscribe(conn.shared.id);
            conn.log_active = false;
        }

        commands::execute(&jb, &mut conn, words).await;
    }

    if let Some(user) = conn.user() {
        debug!(user, "connection closed");
    }
    jb.unregister_conn(conn.shared.id);
}
