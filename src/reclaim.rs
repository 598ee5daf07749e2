//! Distributed reclamation and the heartbeat clock.
//!
//! One housekeeper task runs every half heartbeat interval: it checks that
//! the peer is still alive, sends our own heartbeat, and drains the stub
//! drop queue into `disposed_batch` notifications. A queue reaching the
//! batch size triggers an immediate drain instead of waiting for the next
//! tick.

use std::sync::Arc;
use std::time::Instant;

use tracing::{error, warn};

use crate::errors::Rejected;
use crate::ident::ObjectId;
use crate::scheduler::ScheduledHandle;
use crate::session::{SessionInner, ADMIN_DISPOSED_BATCH, ADMIN_HEARTBEAT};
use crate::value::Value;

/// Start the housekeeper for a session.
pub(crate) fn start(inner: &Arc<SessionInner>) -> Result<ScheduledHandle, Rejected> {
    let weak = Arc::downgrade(inner);
    let period = inner.config().heartbeat_interval / 2;
    inner.scheduler().schedule_at_fixed_rate(period, period, move || {
        if let Some(inner) = weak.upgrade() {
            housekeep(&inner);
        }
    })
}

fn housekeep(inner: &Arc<SessionInner>) {
    if inner.is_closing() {
        return;
    }

    if Instant::now() > inner.next_expected_heartbeat() {
        error!("no heartbeat received from peer; closing session");
        inner.close_session(true);
        return;
    }

    if let Ok(admin) = inner.admin_stub() {
        if let Err(e) = admin.call(ADMIN_HEARTBEAT, Vec::new()) {
            if !inner.is_closing() {
                warn!(error = %e, "unable to send heartbeat");
            }
        }
    }

    drain_disposed(inner);
}

/// Drain collected stub identifiers and notify the peer in batches.
pub(crate) fn drain_disposed(inner: &Arc<SessionInner>) {
    let batch_size = inner.config().dispose_batch_size;
    loop {
        let batch: Vec<ObjectId> = inner.take_dropped(batch_size);
        if batch.is_empty() {
            return;
        }

        // Finish the weak-table removal for every collected identifier.
        for id in &batch {
            inner.stubs.remove(*id);
        }

        if inner.is_closing() {
            continue;
        }

        let ids = Value::List(
            batch
                .iter()
                .map(|id| Value::Bytes(id.as_bytes().to_vec()))
                .collect(),
        );
        match inner.admin_stub() {
            Ok(admin) => {
                if let Err(e) = admin.call(ADMIN_DISPOSED_BATCH, vec![ids]) {
                    if !inner.is_closing() {
                        warn!(error = %e, "unable to notify peer of disposed stubs");
                    }
                    return;
                }
            }
            Err(_) => return,
        }
    }
}
