/// Broker client seam and the in-memory broker.
pub mod broker;
/// Transport settings loading and validation.
pub mod config;
/// Opaque caller state carried through dispatch and handling.
pub mod context;
/// Send, publish and reply: turning operations into broker records.
pub mod dispatch;
/// Message envelope and its binary codec.
pub mod envelope;
/// Message type hierarchy: ancestry and assignability.
pub mod hierarchy;
/// Host contract: lazily created pump, dispatcher and subscription manager.
pub mod infrastructure;
/// Structured logging (formatting, filters, sinks).
pub mod logging;
/// Idempotent topic creation.
pub mod provision;
/// Receive side: workers, handler invocation, poison records.
pub mod pump;
/// Logical addresses and topic naming.
pub mod routing;
/// Subscription records and the subscription manager.
pub mod subscription;

// -----------------------------------------------------------------------------
//  Frequently used public types
// -----------------------------------------------------------------------------

/// Broker seam.
pub use broker::{
    BrokerAdmin, BrokerConnector, BrokerConsumer, BrokerProducer, BrokerRecord, InMemoryBroker,
    OffsetReset, RecordPosition, TopicSpec,
};
#[cfg(feature = "kafka")]
pub use broker::KafkaConnector;
/// Settings.
pub use config::TransportSettings;
pub use context::{ContextBag, TransportTransaction};
/// Outgoing messages and dispatch.
pub use dispatch::{
    DeliveryConstraint, DispatchOutcome, Dispatcher, MessageIntent, OutgoingMessage, Routing,
    TransportOperation, TransportOperations,
};
/// Envelope and codec.
pub use envelope::{header, CodecConfig, Envelope, EnvelopeCodec, Headers};
/// Type hierarchy.
pub use hierarchy::{RegistryBuilder, TypeDescriptor, TypeKind, TypeName, TypeRegistry};
/// Host contract.
pub use infrastructure::{
    AddressingMode, OutboundRoutingPolicy, TransactionMode, TransportCapabilities,
    TransportInfrastructure,
};
pub use logging::{init_logging, LoggingConfig, LoggingHandle};
pub use provision::TopicProvisioner;
/// Receive side.
pub use pump::{
    handler_fn, ConsumedTopics, IncomingMessage, LogAndAcknowledge, MessageHandler, MessagePump,
    ParkInErrorTopic, PoisonAction, PoisonMessagePolicy, PumpSettings, PumpState, PumpStats,
    PumpStatsSnapshot,
};
pub use routing::{is_type_topic, type_topic, validate_topic_name, LogicalAddress, TYPE_TOPIC_NAMESPACE};
pub use subscription::{
    InMemorySubscriptionStore, Subscription, SubscriptionManager, SubscriptionStore,
};
/// Errors.
pub use typebus_error::{
    BrokerError, ConfigError, DecodeError, DispatchError, EncodeError, HandlerError, ProvisionError,
    PumpError, RegistryError, StackError, StatusCode, SubscriptionError, TransportResult,
};
