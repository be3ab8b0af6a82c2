//! [`Broker`] implementation backed by a real RabbitMq instance, via [`lapin`].
use super::broker::{
    Broker, BrokerChannel, BrokerConnection, BrokerError, ChannelHandle, ConnectionHandle,
    DeliveryStream, Message,
};
use crate::configuration::RabbitMqSettings;
use amq_protocol_types::DeliveryTag;
use anyhow::Context;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicGetOptions,
        BasicNackOptions, BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions,
        QueueDeclareOptions,
    },
    publisher_confirm::Confirmation,
    tcp::{AMQPUriTcpExt, NativeTlsConnector},
    types::FieldTable,
    uri::{AMQPScheme, AMQPUri},
    BasicProperties, ConnectionProperties,
};
use std::sync::Arc;
use tokio::time::timeout;
use tracing::warn;

/// Reply code returned by the broker for a mandatory message without a matching queue.
const NO_ROUTE: u16 = 312;

#[derive(Clone)]
/// All the information required to connect to a RabbitMq broker.
pub struct ConnectionFactory {
    uri: AMQPUri,
    /// The timeout observed when trying to connect to RabbitMq.
    connection_timeout: std::time::Duration,
    /// TLS configuration for the connection to RabbitMq.
    /// If `None`, the connection will not be encrypted.
    tls: Option<Arc<Tls>>,
}

#[derive(Clone)]
struct Tls {
    connector: NativeTlsConnector,
    domain_name: String,
}

impl ConnectionFactory {
    /// Create a new connection factory from settings.
    ///
    /// If the connection timeout is left unspecified, it will be defaulted to 10 seconds.
    pub fn new_from_config(settings: &RabbitMqSettings) -> Result<Self, anyhow::Error> {
        let tls = settings
            .tls
            .as_ref()
            .map::<Result<Tls, anyhow::Error>, _>(|tls_settings| {
                let domain_name = tls_settings
                    .domain
                    .clone()
                    .unwrap_or_else(|| settings.amqp_uri().authority.host);

                let mut connector_builder = NativeTlsConnector::builder();
                if let Some(certificate) = tls_settings.ca_certificate_chain()? {
                    connector_builder.add_root_certificate(certificate);
                }
                let connector = connector_builder
                    .build()
                    .context("Failed to build the TLS connector for RabbitMQ.")?;
                Ok(Tls {
                    domain_name,
                    connector,
                })
            })
            .transpose()?;
        let connection_timeout = settings
            .connection_timeout()
            .unwrap_or_else(|| std::time::Duration::from_secs(10));
        Ok(Self {
            uri: settings.amqp_uri(),
            connection_timeout,
            tls: tls.map(Arc::new),
        })
    }

    /// Replaces the TLS connector, along with the expected domain name for the certificate.
    pub fn set_tls_connector_with_domain(
        &mut self,
        connector: NativeTlsConnector,
        domain_name: String,
    ) {
        self.tls = Some(Arc::new(Tls {
            connector,
            domain_name,
        }));
    }

    /// Create a new connection to a RabbitMq broker, named `name`.
    ///
    /// It establishes an encrypted connection if `self.tls` is `Some`.
    #[tracing::instrument(name = "rabbitmq_connect", skip(self))]
    pub async fn new_connection(&self, name: &str) -> Result<lapin::Connection, BrokerError> {
        let properties = ConnectionProperties::default()
            .with_executor(tokio_executor_trait::Tokio::current())
            .with_connection_name(name.to_owned().into());
        let connection = timeout(self.connection_timeout, async {
            match &self.tls {
                None => self.connect_without_tls(properties).await,
                Some(tls) => self.connect_with_tls(properties, Arc::clone(tls)).await,
            }
        })
        .await
        .map_err(|_| BrokerError::TimedOut)?
        .map_err(|e| BrokerError::ConnectionFailed(e.into()))?;

        let connection_name = name.to_owned();
        connection.on_error(move |e| {
            warn!(connection = %connection_name, "RabbitMQ broken connection: {:?}", e);
        });
        Ok(connection)
    }

    async fn connect_without_tls(
        &self,
        properties: ConnectionProperties,
    ) -> Result<lapin::Connection, lapin::Error> {
        lapin::Connection::connect_uri(self.uri.clone(), properties).await
    }

    async fn connect_with_tls(
        &self,
        properties: ConnectionProperties,
        tls_configuration: Arc<Tls>,
    ) -> Result<lapin::Connection, lapin::Error> {
        lapin::Connection::connector(
            self.uri.clone(),
            Box::new(move |uri| {
                // Plain TCP first, then a TLS handshake expecting `domain_name` on the certificate.
                let mut amqp_uri = uri.clone();
                amqp_uri.scheme = AMQPScheme::AMQP;
                amqp_uri.connect().and_then(|tcp| {
                    tcp.into_native_tls(
                        &tls_configuration.connector,
                        &tls_configuration.domain_name,
                    )
                })
            }),
            properties,
        )
        .await
    }
}

#[async_trait::async_trait]
impl Broker for ConnectionFactory {
    async fn open_connection(&self, name: &str) -> Result<ConnectionHandle, BrokerError> {
        let inner = self.new_connection(name).await?;
        Ok(Arc::new(AmqpConnection {
            name: name.to_owned(),
            inner,
        }))
    }
}

/// A [`lapin::Connection`] together with the name it was opened with.
pub struct AmqpConnection {
    name: String,
    inner: lapin::Connection,
}

#[async_trait::async_trait]
impl BrokerConnection for AmqpConnection {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    #[tracing::instrument(name = "rabbitmq_create_channel", skip(self), fields(connection = %self.name))]
    async fn open_channel(&self) -> Result<ChannelHandle, BrokerError> {
        let channel = self.inner.create_channel().await?;
        Ok(Arc::new(AmqpChannel(channel)))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        Ok(self.inner.close(200, "Connection pool closed").await?)
    }
}

/// A [`lapin::Channel`] exposed through [`BrokerChannel`].
pub struct AmqpChannel(lapin::Channel);

impl AmqpChannel {
    /// Access the underlying [`lapin::Channel`], e.g. to declare topology.
    pub fn raw(&self) -> &lapin::Channel {
        &self.0
    }
}

#[async_trait::async_trait]
impl BrokerChannel for AmqpChannel {
    fn is_closed(&self) -> bool {
        !self.0.status().connected()
    }

    async fn enable_confirm_mode(&self) -> Result<(), BrokerError> {
        Ok(self
            .0
            .confirm_select(ConfirmSelectOptions { nowait: false })
            .await?)
    }

    #[tracing::instrument(level = "debug", skip(self, properties, body))]
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        properties: BasicProperties,
        body: &[u8],
    ) -> Result<(), BrokerError> {
        let options = BasicPublishOptions {
            mandatory,
            // The immediate flag was dropped in RabbitMQ 3.0: setting it causes a not-supported error.
            immediate: false,
        };
        let confirm = self
            .0
            .basic_publish(exchange, routing_key, options, body, properties)
            .await?
            .await?;

        match confirm {
            Confirmation::Ack(Some(returned)) if returned.reply_code == NO_ROUTE => {
                Err(BrokerError::Unroutable {
                    exchange: exchange.to_owned(),
                    routing_key: routing_key.to_owned(),
                })
            }
            Confirmation::Ack(_) | Confirmation::NotRequested => Ok(()),
            Confirmation::Nack(_) => Err(BrokerError::NegativeAck),
        }
    }

    async fn get(&self, queue: &str, auto_ack: bool) -> Result<Option<Message>, BrokerError> {
        let fetched = self
            .0
            .basic_get(queue, BasicGetOptions { no_ack: auto_ack })
            .await?;
        Ok(fetched.map(|fetched| {
            let mut message = Message::from(fetched.delivery);
            message.message_count = Some(fetched.message_count);
            message
        }))
    }

    async fn ack(&self, delivery_tag: DeliveryTag, multiple: bool) -> Result<(), BrokerError> {
        Ok(self
            .0
            .basic_ack(delivery_tag, BasicAckOptions { multiple })
            .await?)
    }

    async fn nack(
        &self,
        delivery_tag: DeliveryTag,
        multiple: bool,
        requeue: bool,
    ) -> Result<(), BrokerError> {
        Ok(self
            .0
            .basic_nack(delivery_tag, BasicNackOptions { multiple, requeue })
            .await?)
    }

    async fn message_count(&self, queue: &str) -> Result<u32, BrokerError> {
        let options = QueueDeclareOptions {
            passive: true,
            ..QueueDeclareOptions::default()
        };
        let queue = self
            .0
            .queue_declare(queue, options, FieldTable::default())
            .await?;
        Ok(queue.message_count())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch_count: u16,
        auto_ack: bool,
    ) -> Result<DeliveryStream, BrokerError> {
        self.0
            .basic_qos(prefetch_count, BasicQosOptions { global: false })
            .await?;
        let options = BasicConsumeOptions {
            no_ack: auto_ack,
            ..BasicConsumeOptions::default()
        };
        let consumer = self
            .0
            .basic_consume(queue, consumer_tag, options, FieldTable::default())
            .await?;
        Ok(consumer
            .map(|delivery| delivery.map(Message::from).map_err(BrokerError::from))
            .boxed())
    }

    async fn cancel_consumer(&self, consumer_tag: &str) -> Result<(), BrokerError> {
        Ok(self
            .0
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await?)
    }

    async fn close(&self) -> Result<(), BrokerError> {
        Ok(self.0.close(200, "Channel closed by pool").await?)
    }
}

impl From<lapin::message::Delivery> for Message {
    fn from(value: lapin::message::Delivery) -> Self {
        Self {
            delivery_tag: value.delivery_tag,
            exchange: value.exchange,
            routing_key: value.routing_key,
            redelivered: value.redelivered,
            properties: value.properties,
            data: value.data,
            message_count: None,
        }
    }
}
