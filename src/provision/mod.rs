//! Идемпотентное создание топиков.

use std::sync::Arc;

use dashmap::DashSet;
use tracing::{debug, info};
use typebus_error::ProvisionError;

use crate::{
    broker::{BrokerAdmin, TopicCreation, TopicSpec},
    routing::validate_topic_name,
};

/// Создаёт топики до того, как с ними начнут работать диспетчер и насос.
///
/// «Уже существует» считается успехом. Подтверждённые топики запоминаются,
/// повторный запрос к брокеру для них не выполняется.
pub struct TopicProvisioner {
    admin: Arc<dyn BrokerAdmin>,
    partitions: u32,
    replication_factor: u16,
    confirmed: DashSet<String>,
}

impl TopicProvisioner {
    pub fn new(
        admin: Arc<dyn BrokerAdmin>,
        partitions: u32,
        replication_factor: u16,
    ) -> Self {
        Self {
            admin,
            partitions: partitions.max(1),
            replication_factor: replication_factor.max(1),
            confirmed: DashSet::new(),
        }
    }

    /// Гарантирует существование каждого топика из `names`.
    ///
    /// Все имена проверяются до первого обращения к брокеру.
    pub async fn ensure_topics<S: AsRef<str>>(
        &self,
        names: &[S],
    ) -> Result<(), ProvisionError> {
        for name in names {
            validate_topic_name(name.as_ref())?;
        }

        for name in names {
            let name = name.as_ref();
            if self.confirmed.contains(name) {
                continue;
            }
            let spec = TopicSpec::new(name, self.partitions, self.replication_factor);
            let creation = self
                .admin
                .create_topic(&spec)
                .await
                .map_err(|source| ProvisionError::Broker {
                    topic: name.to_string(),
                    source,
                })?;
            match creation {
                TopicCreation::Created => info!(
                    topic = name,
                    partitions = self.partitions,
                    "Topic provisioned"
                ),
                TopicCreation::AlreadyExists => debug!(topic = name, "Topic already exists"),
            }
            self.confirmed.insert(name.to_string());
        }
        Ok(())
    }

    pub fn admin(&self) -> &Arc<dyn BrokerAdmin> {
        &self.admin
    }

    /// Был ли топик подтверждён этим экземпляром.
    pub fn is_confirmed(
        &self,
        topic: &str,
    ) -> bool {
        self.confirmed.contains(topic)
    }
}
