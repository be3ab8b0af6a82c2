use amq_protocol_types::{FieldTable, ShortShortUInt, ShortString};
use lapin::BasicProperties;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;
use uuid::Uuid;

/// Delivery mode marking a message as persistent.
const PERSISTENT: ShortShortUInt = 2;

/// A message to be published via [`DeliveryService`](super::DeliveryService).
#[derive(Debug, Clone, Default)]
pub struct Envelope {
    /// The name of the exchange we are publishing the message to.
    /// Empty for the default exchange, which routes on queue names.
    pub exchange_name: String,
    pub routing_key: String,
    /// The body of the message, as a sequence of bytes.
    pub payload: Vec<u8>,
    /// Ask the broker to return the message if it cannot be routed to any queue.
    pub mandatory: bool,
    /// AMQP properties attached to the message; `None` for the defaults.
    pub properties: Option<BasicProperties>,
}

impl Envelope {
    pub fn with_payload(mut self, value: Vec<u8>) -> Self {
        self.payload = value;
        self
    }

    pub fn with_exchange_name(mut self, value: String) -> Self {
        self.exchange_name = value;
        self
    }

    pub fn with_routing_key(mut self, value: String) -> Self {
        self.routing_key = value;
        self
    }

    pub fn with_mandatory(mut self, value: bool) -> Self {
        self.mandatory = value;
        self
    }

    fn props(mut self, f: impl FnOnce(BasicProperties) -> BasicProperties) -> Self {
        self.properties = Some(f(self.properties.unwrap_or_default()));
        self
    }

    pub fn with_content_type(self, value: ShortString) -> Self {
        self.props(|p| p.with_content_type(value))
    }

    pub fn with_headers(self, value: FieldTable) -> Self {
        self.props(|p| p.with_headers(value))
    }

    pub fn with_delivery_mode(self, value: ShortShortUInt) -> Self {
        self.props(|p| p.with_delivery_mode(value))
    }

    pub fn with_correlation_id(self, value: ShortString) -> Self {
        self.props(|p| p.with_correlation_id(value))
    }

    pub fn with_message_id(self, value: ShortString) -> Self {
        self.props(|p| p.with_message_id(value))
    }
}

/// The properties a message is actually published with: the caller's, plus a timestamp, a
/// message id and persistence when left unspecified.
pub(crate) fn outgoing_properties(properties: Option<&BasicProperties>) -> BasicProperties {
    let props = properties.cloned().unwrap_or_default();

    let props = match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(now) => {
            let timestamp = (*props.timestamp()).unwrap_or(now.as_secs());
            props.with_timestamp(timestamp)
        }
        Err(_) => {
            warn!("System time is before 1970");
            props
        }
    };

    let message_id = props
        .message_id()
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string().into());
    let delivery_mode = (*props.delivery_mode()).unwrap_or(PERSISTENT);
    props
        .with_message_id(message_id)
        .with_delivery_mode(delivery_mode)
}
