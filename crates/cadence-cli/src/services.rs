use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{info, warn};

use cadence_config::{BrokerKind, CadenceConfig, EventsKind};
use cadence_events::{EventTransport, LocalTransport, SqliteTransport};
use cadence_queue::{Broker, JobQueue, MemoryBroker, SqliteBroker};
use cadence_storage::CadenceStorage;

/// Configuration plus the store, queue, and event transport every command works against.
pub struct Services {
    pub config: CadenceConfig,
    /// Directory relative task file paths are resolved against.
    pub base_dir: PathBuf,
    pub store: Arc<CadenceStorage>,
    pub queue: Arc<JobQueue>,
    pub transport: Arc<dyn EventTransport>,
}

impl Services {
    /// Load configuration from `config_path` (or `~/.cadence/config.json5`)
    /// and open the store and broker it names.
    pub fn open(config_path: Option<&Path>) -> anyhow::Result<Self> {
        let _ = dotenvy::dotenv();

        let path = match config_path {
            Some(p) => p.to_path_buf(),
            None => cadence_config::config_file_path()?,
        };
        let config = cadence_config::load_config_from(&path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?;
        let base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        let db_path = config.database_path()?;
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let store = Arc::new(CadenceStorage::open(&db_path)?);

        let broker: Arc<dyn Broker> = match config.broker.kind {
            BrokerKind::Sqlite => {
                let broker_path = config.broker.path.clone().unwrap_or_else(|| db_path.clone());
                Arc::new(SqliteBroker::open(&broker_path)?)
            }
            BrokerKind::Memory => {
                warn!("Using in-memory broker: queued work does not survive this process");
                Arc::new(MemoryBroker::new())
            }
        };

        let transport: Arc<dyn EventTransport> = match config.events.kind {
            EventsKind::Sqlite => {
                let events_path = config.events.path.clone().unwrap_or_else(|| db_path.clone());
                Arc::new(
                    SqliteTransport::open(&events_path)?
                        .with_poll_interval(Duration::from_millis(config.events.poll_interval_ms)),
                )
            }
            EventsKind::Memory => {
                warn!("Using in-process event transport: other processes cannot see these events");
                Arc::new(LocalTransport::new(config.events.capacity))
            }
        };
        info!(
            database = %db_path.display(),
            broker = ?config.broker.kind,
            events = ?config.events.kind,
            "Services opened"
        );

        let queue = Arc::new(JobQueue::new(store.clone(), broker));
        Ok(Self {
            config,
            base_dir,
            store,
            queue,
            transport,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_creates_database_next_to_config() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("config.json5");
        let db_path = dir.path().join("data").join("cadence.db");
        std::fs::write(
            &config_path,
            format!(
                "{{ database_path: {:?}, broker: {{ kind: 'memory' }} }}",
                db_path.display().to_string()
            ),
        )
        .unwrap();

        let services = Services::open(Some(&config_path)).unwrap();
        assert!(db_path.exists());
        assert_eq!(services.base_dir, dir.path());
        assert_eq!(services.config.broker.kind, BrokerKind::Memory);
        assert_eq!(services.config.events.kind, EventsKind::Sqlite);
    }

    #[tokio::test]
    async fn test_events_cross_separately_opened_services() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("config.json5");
        std::fs::write(
            &config_path,
            format!(
                "{{ database_path: {:?}, events: {{ poll_interval_ms: 10 }} }}",
                dir.path().join("cadence.db").display().to_string()
            ),
        )
        .unwrap();

        let runner = Services::open(Some(&config_path)).unwrap();
        let admin = Services::open(Some(&config_path)).unwrap();
        let bus = cadence_events::EventBus::new(runner.transport.clone());
        bus.subscribe("email-agent", None, None).await.unwrap();

        crate::admin::publish(
            &admin,
            "report.ready".into(),
            "cli".into(),
            Some("email-agent".into()),
            None,
        )
        .await
        .unwrap();

        let got = bus.listen(Some(Duration::from_secs(5))).await.unwrap();
        assert_eq!(got.event_type, "report.ready");
        assert_eq!(got.source_agent, "cli");
    }
}
