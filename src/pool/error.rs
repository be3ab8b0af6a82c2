use crate::amqp::BrokerError;

use super::ChannelId;

/// Pool error.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Failed to open the pooled connection `{name}`")]
    BrokerUnreachable {
        name: String,
        #[source]
        source: BrokerError,
    },
    #[error("None of the pooled connections could be opened")]
    NoConnections,
    #[error("Failed to open a channel for the pool")]
    ChannelCreation(#[source] BrokerError),
    #[error("Failed to repair channel {id}")]
    ChannelRepair {
        id: ChannelId,
        #[source]
        source: BrokerError,
    },
    #[error("Waiting for a channel was cancelled")]
    Cancelled,
    #[error("The pool has been closed")]
    Closed,
}
