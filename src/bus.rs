use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt as _};
use tokio::time::Instant;
use tokio_util::bytes::BytesMut;
use tracing::trace;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("bus did not go quiet for {quiet_window:?} within {ceiling:?}")]
    Busy { quiet_window: Duration, ceiling: Duration },
    #[error("could not read data from the bus")]
    Receive(#[source] std::io::Error),
    #[error("the connection was closed by the remote end")]
    Closed,
}

/// Collision avoidance on the shared RS-485 line.
///
/// Remotes and mainboards talk whenever they like, so before sending anything we wait for the
/// line to stay silent for a while.
#[derive(Clone, Copy, Debug)]
pub struct BusArbiter {
    pub quiet_window: Duration,
    pub ceiling: Duration,
}

impl Default for BusArbiter {
    fn default() -> Self {
        Self { quiet_window: Duration::from_millis(10), ceiling: Duration::from_secs(3) }
    }
}

impl BusArbiter {
    /// Return once nothing was received for `quiet_window`.
    ///
    /// Everything received in the meantime is appended to `received`.
    pub async fn wait_for_quiet<R: AsyncRead + Unpin>(
        &self,
        reader: &mut R,
        received: &mut BytesMut,
    ) -> Result<(), Error> {
        let started = Instant::now();
        let ceiling = started + self.ceiling;
        loop {
            let quiet_until = Instant::now() + self.quiet_window;
            if quiet_until > ceiling {
                return Err(Error::Busy { quiet_window: self.quiet_window, ceiling: self.ceiling });
            }
            match tokio::time::timeout_at(quiet_until, reader.read_buf(received)).await {
                Err(_) => {
                    trace!(message = "bus is quiet", waited = ?started.elapsed());
                    return Ok(());
                }
                Ok(Ok(0)) => return Err(Error::Closed),
                Ok(Ok(count)) => trace!(message = "bus is active", count, buffer = ?received),
                Ok(Err(e)) => return Err(Error::Receive(e)),
            }
        }
    }
}
