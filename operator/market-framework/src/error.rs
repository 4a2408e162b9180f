use thiserror::Error;

/// Errors raised while pulling a block window from a chain.
///
/// A fetch error aborts the current polling pass and leaves the cursor where
/// it was, so the same window is scanned again on the next pass.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("failed to read the latest block height")]
    Head(#[source] anyhow::Error),

    #[error("failed to fetch {kind} events in blocks [{from}, {to}]")]
    Fetch {
        kind: String,
        from: u64,
        to: u64,
        #[source]
        source: anyhow::Error,
    },

    /// A handler could not reach one of its collaborators. The window is
    /// kept and handled again on the next pass.
    #[error("event handling in blocks [{from}, {to}] needs a retry")]
    Handler {
        from: u64,
        to: u64,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to resolve the starting cursor")]
    Cursor(#[source] anyhow::Error),

    #[error("range size must not be zero")]
    ZeroRange,
}

/// Why a handler gave up on an event.
#[derive(Debug, Error)]
pub enum HandleError {
    /// Transient failure: abort the pass and keep the cursor.
    #[error("retry window: {0:#}")]
    Retry(anyhow::Error),

    /// The event can never be applied: log it and move on.
    #[error("skip event: {0:#}")]
    Skip(anyhow::Error),
}

impl HandleError {
    /// Classifies a store failure: outages are retried, everything else is
    /// skipped.
    pub fn from_store(err: StoreError) -> Self {
        if err.is_transient() {
            HandleError::Retry(err.into())
        } else {
            HandleError::Skip(err.into())
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record {0} already exists")]
    Duplicate(String),

    #[error("record {0} not found")]
    NotFound(String),

    #[error("invalid stored value: {0}")]
    Invalid(String),

    #[error("store is not accepting requests")]
    Unavailable,

    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    /// True when the store could not be reached, as opposed to rejecting the
    /// request.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Unavailable => true,
            StoreError::Database(err) => matches!(
                err,
                sqlx::Error::Io(_)
                    | sqlx::Error::Tls(_)
                    | sqlx::Error::Protocol(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
            ),
            StoreError::Duplicate(_) | StoreError::NotFound(_) | StoreError::Invalid(_) => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("failed to connect to the message bus")]
    Connect(#[source] anyhow::Error),

    #[error("failed to publish to {subject}")]
    Publish {
        subject: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to subscribe to {subject}")]
    Subscribe {
        subject: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("no responders on {0}")]
    NoResponders(String),

    #[error("request on {0} timed out")]
    Timeout(String),

    #[error("request on {subject} failed")]
    Request {
        subject: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Failure seen by a caller of a bus query. Transport and decoding problems
/// collapse into one generic variant; callers never get a partial result.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("invalid query: {0}")]
    Invalid(String),

    #[error("internal error")]
    Internal,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_outages_are_retried() {
        assert!(matches!(
            HandleError::from_store(StoreError::Unavailable),
            HandleError::Retry(_)
        ));
        assert!(matches!(
            HandleError::from_store(StoreError::Database(sqlx::Error::PoolTimedOut)),
            HandleError::Retry(_)
        ));
        assert!(matches!(
            HandleError::from_store(StoreError::Duplicate("0xabc".into())),
            HandleError::Skip(_)
        ));
        assert!(!StoreError::Database(sqlx::Error::RowNotFound).is_transient());
    }
}
