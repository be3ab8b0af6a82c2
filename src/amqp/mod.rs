//! Broker capabilities: the traits the pools are built on and their implementations.

pub mod broker;
mod factory;
pub mod in_memory;

pub use broker::{
    Broker, BrokerChannel, BrokerConnection, BrokerError, ChannelHandle, ConnectionHandle,
    DeliveryStream, Message,
};
pub use factory::{AmqpChannel, AmqpConnection, ConnectionFactory};

pub use lapin::{options, types, BasicProperties};
