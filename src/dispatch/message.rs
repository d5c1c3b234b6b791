use std::{fmt, time::Duration};

use bytes::Bytes;
use uuid::Uuid;

use crate::{envelope::Headers, hierarchy::TypeName, routing::LogicalAddress};

/// Ограничение доставки, прикреплённое к сообщению.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryConstraint {
    /// Сообщение бесполезно, если не получено в течение указанного времени.
    DiscardIfNotReceivedBefore(Duration),
}

/// Намерение доставки; пишется в заголовок `typebus.MessageIntent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageIntent {
    Send,
    Reply,
    Publish,
}

impl MessageIntent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Send => "Send",
            Self::Reply => "Reply",
            Self::Publish => "Publish",
        }
    }
}

impl fmt::Display for MessageIntent {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Исходящее сообщение: конкретный тип, тело и дополнительные заголовки.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub message_id: String,
    pub message_type: TypeName,
    pub headers: Headers,
    pub body: Bytes,
    pub constraints: Vec<DeliveryConstraint>,
}

impl OutgoingMessage {
    pub fn builder(message_type: impl Into<TypeName>) -> OutgoingMessageBuilder {
        OutgoingMessageBuilder {
            message_id: None,
            message_type: message_type.into(),
            headers: Headers::new(),
            body: Bytes::new(),
            constraints: Vec::new(),
        }
    }

    /// TTL из ограничения `DiscardIfNotReceivedBefore`, если оно задано.
    pub fn time_to_be_received(&self) -> Option<Duration> {
        self.constraints.iter().find_map(|c| match c {
            DeliveryConstraint::DiscardIfNotReceivedBefore(ttl) => Some(*ttl),
        })
    }
}

pub struct OutgoingMessageBuilder {
    message_id: Option<String>,
    message_type: TypeName,
    headers: Headers,
    body: Bytes,
    constraints: Vec<DeliveryConstraint>,
}

impl OutgoingMessageBuilder {
    /// Явный идентификатор; по умолчанию UUID v4.
    pub fn message_id(
        mut self,
        id: impl Into<String>,
    ) -> Self {
        self.message_id = Some(id.into());
        self
    }

    pub fn body(
        mut self,
        body: impl Into<Bytes>,
    ) -> Self {
        self.body = body.into();
        self
    }

    pub fn header(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn time_to_be_received(
        mut self,
        ttl: Duration,
    ) -> Self {
        self.constraints
            .retain(|c| !matches!(c, DeliveryConstraint::DiscardIfNotReceivedBefore(_)));
        self.constraints
            .push(DeliveryConstraint::DiscardIfNotReceivedBefore(ttl));
        self
    }

    /// Адрес для ответа вместо входного топика отправителя.
    pub fn reply_to(
        mut self,
        topic: impl Into<String>,
    ) -> Self {
        self.headers.insert(
            crate::envelope::header::REPLY_TO_ADDRESS.to_string(),
            topic.into(),
        );
        self
    }

    pub fn build(self) -> OutgoingMessage {
        OutgoingMessage {
            message_id: self
                .message_id
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            message_type: self.message_type,
            headers: self.headers,
            body: self.body,
            constraints: self.constraints,
        }
    }
}

/// Куда и как доставить сообщение.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routing {
    /// Unicast на логический адрес.
    Send(LogicalAddress),
    /// Unicast на физический топик из `ReplyToAddress` входящего сообщения.
    Reply(String),
    /// Multicast по родословной типа.
    Publish,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportOperation {
    pub message: OutgoingMessage,
    pub routing: Routing,
}

impl TransportOperation {
    pub fn send(
        message: OutgoingMessage,
        destination: LogicalAddress,
    ) -> Self {
        Self {
            message,
            routing: Routing::Send(destination),
        }
    }

    pub fn reply(
        message: OutgoingMessage,
        reply_to: impl Into<String>,
    ) -> Self {
        Self {
            message,
            routing: Routing::Reply(reply_to.into()),
        }
    }

    pub fn publish(message: OutgoingMessage) -> Self {
        Self {
            message,
            routing: Routing::Publish,
        }
    }

    pub fn intent(&self) -> MessageIntent {
        match self.routing {
            Routing::Send(_) => MessageIntent::Send,
            Routing::Reply(_) => MessageIntent::Reply,
            Routing::Publish => MessageIntent::Publish,
        }
    }
}

/// Пакет операций для одного вызова `dispatch`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportOperations {
    operations: Vec<TransportOperation>,
}

impl TransportOperations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(
        &mut self,
        operation: TransportOperation,
    ) -> &mut Self {
        self.operations.push(operation);
        self
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, TransportOperation> {
        self.operations.iter()
    }
}

impl From<TransportOperation> for TransportOperations {
    fn from(op: TransportOperation) -> Self {
        Self {
            operations: vec![op],
        }
    }
}

impl From<Vec<TransportOperation>> for TransportOperations {
    fn from(operations: Vec<TransportOperation>) -> Self {
        Self { operations }
    }
}

impl IntoIterator for TransportOperations {
    type Item = TransportOperation;
    type IntoIter = std::vec::IntoIter<TransportOperation>;

    fn into_iter(self) -> Self::IntoIter {
        self.operations.into_iter()
    }
}
