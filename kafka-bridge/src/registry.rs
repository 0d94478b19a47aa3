use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use metrics::gauge;
use tracing::info;
use uuid::Uuid;

use crate::api::BridgeError;
use crate::endpoint::sink::SinkEndpoint;
use crate::endpoint::BridgeEndpoint;

const GENERATED_ID_PREFIX: &str = "kafka-bridge-consumer-";

/// Operations on one session are serialized by its lock.
pub type SharedSink = Arc<tokio::sync::Mutex<SinkEndpoint>>;

type Sessions = Arc<Mutex<HashMap<String, SharedSink>>>;

/// Owns the consumer instances, keyed by instance id. Entries only go away
/// when their endpoint closes.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Sessions,
}

fn lock(
    sessions: &Mutex<HashMap<String, SharedSink>>,
) -> MutexGuard<'_, HashMap<String, SharedSink>> {
    sessions.lock().unwrap_or_else(PoisonError::into_inner)
}

fn report_active(sessions: &HashMap<String, SharedSink>) {
    gauge!("bridge_consumers_active").set(sessions.len() as f64);
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new opened endpoint under `requested`, or under a generated
    /// id when no name is given.
    pub fn create<F>(
        &self,
        requested: Option<String>,
        build: F,
    ) -> Result<(String, SharedSink), BridgeError>
    where
        F: FnOnce(&str) -> SinkEndpoint,
    {
        // Not locked while the consumer is built and opened
        let id = {
            let sessions = lock(&self.sessions);
            match requested {
                Some(id) if sessions.contains_key(&id) => {
                    return Err(BridgeError::ConsumerAlreadyExists)
                }
                Some(id) => id,
                None => loop {
                    let id = format!("{}{}", GENERATED_ID_PREFIX, Uuid::new_v4());
                    if !sessions.contains_key(&id) {
                        break id;
                    }
                },
            }
        };

        let mut endpoint = build(&id);
        endpoint.open()?;

        let mut sessions = lock(&self.sessions);
        // A concurrent request may have taken the name meanwhile
        if sessions.contains_key(&id) {
            drop(sessions);
            endpoint.close();
            return Err(BridgeError::ConsumerAlreadyExists);
        }

        let registry = Arc::downgrade(&self.sessions);
        let key = id.clone();
        endpoint.close_handler(Box::new(move || {
            let Some(registry) = registry.upgrade() else {
                return;
            };
            let mut sessions = lock(&registry);
            if sessions.remove(&key).is_some() {
                info!("consumer instance {} removed", key);
            }
            report_active(&sessions);
        }));

        let endpoint = Arc::new(tokio::sync::Mutex::new(endpoint));
        sessions.insert(id.clone(), endpoint.clone());
        report_active(&sessions);
        info!("consumer instance {} created", id);

        Ok((id, endpoint))
    }

    pub fn lookup(&self, id: &str) -> Result<SharedSink, BridgeError> {
        lock(&self.sessions)
            .get(id)
            .cloned()
            .ok_or(BridgeError::ConsumerNotFound)
    }

    pub fn len(&self) -> usize {
        lock(&self.sessions).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Closes every endpoint, waiting for their in-flight operations.
    pub async fn close_all(&self) {
        let drained: Vec<SharedSink> = {
            let mut sessions = lock(&self.sessions);
            let drained = sessions.drain().map(|(_, endpoint)| endpoint).collect();
            report_active(&sessions);
            drained
        };

        for endpoint in drained {
            endpoint.lock().await.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::{SessionRegistry, GENERATED_ID_PREFIX};
    use crate::api::BridgeError;
    use crate::config::{ConsumerDefaults, KafkaConfig};
    use crate::converter::EmbeddedFormat;
    use crate::endpoint::sink::{SinkEndpoint, SinkState};
    use crate::kafka::ConsumerSettings;

    fn build(id: &str) -> SinkEndpoint {
        let kafka = KafkaConfig {
            kafka_hosts: "localhost:1".to_string(),
            kafka_tls: false,
            kafka_producer_acks: "all".to_string(),
            kafka_producer_linger_ms: 0,
            kafka_message_timeout_ms: 1000,
            kafka_compression_codec: "none".to_string(),
            kafka_producer_auto_create_topics: false,
        };
        let defaults = ConsumerDefaults {
            consumer_poll_timeout_ms: 10,
            consumer_max_bytes: None,
            consumer_max_poll_records: 10,
        };
        SinkEndpoint::new(
            id.to_string(),
            "group".to_string(),
            EmbeddedFormat::Json,
            ConsumerSettings::default(),
            kafka,
            &defaults,
        )
    }

    #[tokio::test]
    async fn requested_names_are_unique() {
        let registry = SessionRegistry::new();

        let (id, _) = registry.create(Some("consumer".to_string()), build).unwrap();
        assert_eq!(id, "consumer");

        assert!(matches!(
            registry.create(Some("consumer".to_string()), build),
            Err(BridgeError::ConsumerAlreadyExists)
        ));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn generated_ids_are_never_reused() {
        let registry = SessionRegistry::new();

        let mut ids = HashSet::new();
        for _ in 0..20 {
            let (id, endpoint) = registry.create(None, build).unwrap();
            assert!(id.starts_with(GENERATED_ID_PREFIX));
            assert_eq!(endpoint.lock().await.instance_id(), id);
            ids.insert(id);
        }
        assert_eq!(ids.len(), 20);
        assert_eq!(registry.len(), 20);
    }

    #[tokio::test]
    async fn names_taken_while_building_are_refused() {
        let registry = SessionRegistry::new();

        let result = registry.create(Some("consumer".to_string()), |id| {
            assert!(registry.is_empty());
            registry
                .create(Some("consumer".to_string()), build)
                .unwrap();
            build(id)
        });

        assert!(matches!(result, Err(BridgeError::ConsumerAlreadyExists)));
        // The refused endpoint closed without evicting the winner
        assert_eq!(registry.len(), 1);
        let winner = registry.lookup("consumer").unwrap();
        assert_eq!(winner.lock().await.state(), &SinkState::Uninitialized);
    }

    #[tokio::test]
    async fn deleted_sessions_are_removed_once() {
        let registry = SessionRegistry::new();
        let (id, endpoint) = registry.create(Some("consumer".to_string()), build).unwrap();

        let found = registry.lookup(&id).unwrap();
        found.lock().await.delete().unwrap();

        assert!(matches!(
            registry.lookup(&id),
            Err(BridgeError::ConsumerNotFound)
        ));
        assert!(registry.is_empty());
        assert_eq!(endpoint.lock().await.state(), &SinkState::Closed);

        // Same name can be taken again, and the stale endpoint does not evict it
        let (again, _) = registry.create(Some("consumer".to_string()), build).unwrap();
        assert_eq!(again, id);
        assert!(matches!(
            endpoint.lock().await.delete(),
            Err(BridgeError::ConsumerNotFound)
        ));
        assert!(registry.lookup(&id).is_ok());
    }

    #[tokio::test]
    async fn close_all_empties_the_registry() {
        let registry = SessionRegistry::new();
        let (_, first) = registry.create(None, build).unwrap();
        let (_, second) = registry.create(None, build).unwrap();

        registry.close_all().await;

        assert!(registry.is_empty());
        assert_eq!(first.lock().await.state(), &SinkState::Closed);
        assert_eq!(second.lock().await.state(), &SinkState::Closed);
    }
}
