//! Publishing and consuming on pooled channels.
//!
//! [`DeliveryService`] is the entrypoint. Push consumers are implemented via the
//! [`DeliveryHandler`] trait, with [`SampledRequeue`] as a ready-made retry policy.
mod consumer;
mod envelope;
mod error;
mod service;

pub use consumer::{BrokerAction, ConsumerHandle, DeliveryHandler, SampledRequeue};
pub use envelope::Envelope;
pub use error::DeliveryError;
pub use service::DeliveryService;
