//! The event log bus.
//!
//! In-process fan-out of textual state-change events to subscribed
//! connections. Each delivered line is prefixed with a lowercase hex
//! seconds-since-epoch timestamp. `user_*` events are sensitive: they only
//! go to admin subscribers, and over non-local transports only when remote
//! user management is enabled.

use std::cell::RefCell;
use std::rc::Rc;

use tokio::sync::mpsc;
use tracing::trace;

use rockoproto::Rights;

use crate::connection::ConnShared;
use crate::unix_now;

struct Subscription {
    conn: Rc<ConnShared>,
    tx: mpsc::UnboundedSender<String>,
}

/// One per server; held in the server context.
#[derive(Default)]
pub struct EventLog {
    subs: RefCell<Vec<Subscription>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a connection's writer channel to the bus.
    pub fn subscribe(&self, conn: Rc<ConnShared>, tx: mpsc::UnboundedSender<String>) {
        self.subs.borrow_mut().push(Subscription { conn, tx });
    }

    /// Drop a connection's subscription, if any. Idempotent.
    pub fn unsubscribe(&self, conn_id: u64) {
        self.subs.borrow_mut().retain(|s| s.conn.id != conn_id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subs.borrow().len()
    }

    /// Fan a message out to every live subscription that may see it.
    /// Subscriptions whose receiver is gone are pruned here.
    pub fn publish(&self, remote_userman: bool, message: &str) {
        let stamped = format!("{:x} {}", unix_now(), message);
        let sensitive = message.starts_with("user_");
        trace!(message, "event");
        self.subs.borrow_mut().retain(|sub| {
            if sensitive {
                let rights = sub.conn.rights.get();
                if !rights.contains(Rights::ADMIN) {
                    return true;
                }
                if !sub.conn.local && !remote_userman {
                    return true;
                }
            }
            sub.tx.send(stamped.clone()).is_ok()
        });
    }
}
