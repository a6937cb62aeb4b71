//! Co-tenant-tolerant socket binding
//!
//! Challenge servers bind well-known ports that another process (or another
//! instance of this library) may already own. Binding therefore follows a
//! deliberate policy: a bind failure on a port that answers a probe
//! connection is treated as "someone compatible is already serving", not as
//! an error.

use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tracing::warn;

use crate::error::{Error, Result};

/// How long the probe connection may take before the port counts as dead
const PROBE_TIMEOUT: Duration = Duration::from_millis(250);

/// Pause before the second bind attempt, in case the OS needs a beat
const REBIND_DELAY: Duration = Duration::from_millis(100);

/// Try to bind a TCP listener at `addr`, tolerating co-tenants.
///
/// Returns `Ok(Some(listener))` when the socket was bound, and
/// `Ok(None)` when something else already answers on the address; in that
/// case the caller must assume whatever is listening will answer the
/// challenge. Only errors that indicate the port is neither bindable nor
/// answering are returned.
///
/// The `Ok(None)` return is load-bearing: it is how concurrent processes
/// sharing a machine coexist on the challenge ports.
pub async fn robust_try_listen(addr: &str) -> Result<Option<TcpListener>> {
    let mut listen_err = None;

    for attempt in 0..2 {
        if attempt > 0 {
            tokio::time::sleep(REBIND_DELAY).await;
        }

        let err = match TcpListener::bind(addr).await {
            Ok(listener) => return Ok(Some(listener)),
            Err(e) => e,
        };

        // the bind failed; if we can connect, a compatible server already
        // has the port and will answer the challenge for us
        if probe(addr).await {
            return Ok(None);
        }

        // we could neither bind nor connect. Some OSes report "address
        // already in use" for listeners that are flapping or that the OS
        // itself contradicts; trust the bind error over the failed probe,
        // log loudly, and proceed without a listener.
        let msg = err.to_string();
        if msg.contains("address already in use") || msg.contains("one usage of each socket address")
        {
            warn!(
                addr = %addr,
                error = %msg,
                "OS reports the address in use but it does not answer probes; assuming an existing server will answer challenges"
            );
            return Ok(None);
        }

        listen_err = Some(err);
    }

    let err = listen_err
        .map(Error::Io)
        .unwrap_or_else(|| Error::Internal("listen failed without an error".to_string()));
    Err(Error::Transient(format!(
        "could not start challenge listener at {addr}: {err}"
    )))
}

async fn probe(addr: &str) -> bool {
    match tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect(addr)).await {
        Ok(Ok(conn)) => {
            drop(conn);
            true
        }
        _ => false,
    }
}
