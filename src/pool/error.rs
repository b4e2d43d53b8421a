use deadpool::managed::{PoolError, TimeoutType};

use crate::Error;

/// Maps a failure to check out a channel onto our error taxonomy.
///
/// A zero-length wait that runs out of permits means every slot is taken.
pub(super) fn classify(err: PoolError<Error>, max_channels: usize) -> Error {
    match err {
        PoolError::Backend(e) => e,
        PoolError::Timeout(TimeoutType::Wait) => Error::CapacityExceeded { max_channels },
        PoolError::Closed => Error::Connection(anyhow::anyhow!(
            "The connection service has been disposed."
        )),
        err => Error::Connection(anyhow::anyhow!("Failed to check out a channel: {err}")),
    }
}
