use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use super::{AcceptError, Socket};
use crate::config::DEFAULT_BACKLOG;

#[derive(Debug, Default)]
struct Queue {
    listening: bool,
    backlog: usize,
    /// Connections in SYN-RECEIVED.
    par_conn: usize,
    /// Established connections waiting in `accepted`.
    pending_conn: usize,
    accepted: VecDeque<Arc<Socket>>,
}

/// The accept queue of a listening socket.
///
/// A SYN reserves a slot as a partial connection. The slot turns into a
/// pending one when the handshake completes, and is freed when the
/// connection is accepted or dies before that.
#[derive(Debug, Default)]
pub(super) struct Listener {
    queue: Mutex<Queue>,
    ready: Condvar,
}

impl Listener {
    fn lock(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start accepting connections. A zero `backlog` picks the default.
    pub fn open(&self, backlog: usize) {
        let mut queue = self.lock();
        queue.listening = true;
        queue.backlog = if backlog == 0 { DEFAULT_BACKLOG } else { backlog };
    }

    #[cfg(test)]
    pub fn is_listening(&self) -> bool {
        self.lock().listening
    }

    /// Reserve a slot for a new connection in SYN-RECEIVED.
    pub fn reserve(&self) -> bool {
        let mut queue = self.lock();
        if !queue.listening || queue.backlog <= queue.par_conn + queue.pending_conn {
            return false;
        }
        queue.par_conn += 1;
        true
    }

    /// A partial connection died before completing its handshake.
    pub fn release_partial(&self) {
        let mut queue = self.lock();
        queue.par_conn = queue.par_conn.saturating_sub(1);
    }

    /// Queue a connection that just completed its handshake. Returns false
    /// if the listener was closed in the meantime.
    pub fn complete(&self, child: Arc<Socket>) -> bool {
        let mut queue = self.lock();
        if !queue.listening {
            return false;
        }
        queue.par_conn = queue.par_conn.saturating_sub(1);
        queue.pending_conn += 1;
        queue.accepted.push_back(child);
        self.ready.notify_one();
        true
    }

    /// Take the oldest established connection, waiting for one if `blocking`.
    pub fn accept(&self, blocking: bool) -> Result<Option<Arc<Socket>>, AcceptError> {
        let mut queue = self.lock();
        loop {
            if !queue.listening {
                return Err(AcceptError::InvalidState);
            }
            if let Some(child) = queue.accepted.pop_front() {
                queue.pending_conn -= 1;
                net_trace!("accepted, {} still queued", queue.pending_conn);
                return Ok(Some(child));
            }
            if !blocking {
                return Ok(None);
            }
            queue = self
                .ready
                .wait(queue)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Stop listening. Returns the connections nobody accepted.
    pub fn close(&self) -> Vec<Arc<Socket>> {
        let mut queue = self.lock();
        queue.listening = false;
        queue.par_conn = 0;
        queue.pending_conn = 0;
        let orphans = queue.accepted.drain(..).collect();
        self.ready.notify_all();
        orphans
    }

    #[cfg(test)]
    pub fn counts(&self) -> (usize, usize) {
        let queue = self.lock();
        (queue.par_conn, queue.pending_conn)
    }
}
