//! Отправка: превращение send/publish/reply в записи брокера.

pub mod dispatcher;
pub mod message;

pub use dispatcher::{DispatchOutcome, Dispatcher, OperationOutcome};
pub use message::{
    DeliveryConstraint, MessageIntent, OutgoingMessage, OutgoingMessageBuilder, Routing,
    TransportOperation, TransportOperations,
};
