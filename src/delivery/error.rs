use crate::amqp::BrokerError;
use crate::pool;

/// Error returned by [`DeliveryService`](super::DeliveryService) operations.
#[derive(thiserror::Error, Debug)]
pub enum DeliveryError {
    #[error("Failed to acquire a healthy channel from the pool")]
    Pool(#[from] pool::Error),
    #[error("Generic error encountered when interacting with the broker")]
    Broker(#[from] BrokerError),
    #[error("The timeout threshold was reached while trying to publish the message")]
    Timeout,
    #[error("The batch size must be greater than zero")]
    InvalidBatchSize,
    #[error("The consumer task terminated abnormally")]
    ConsumerTask(#[source] tokio::task::JoinError),
}
