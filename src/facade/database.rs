use crate::connection::config::{BackendKind, ConnectionConfig};
use crate::core::Result;
use crate::interface::{StoreConnector, with_timeout};
use crate::session::Session;
use crate::storage::{MemoryDatabase, PostgresConnector};
use std::sync::Arc;
use tracing::info;

/// Entry point: owns the configuration and the connector every session
/// opens its connection through.
///
/// # Examples
///
/// ```
/// use concurrency_token_repro::{ConnectionConfig, Database, Person};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let db = Database::open(ConnectionConfig::memory("doc"))?;
/// db.ensure_created().await?;
///
/// let mut session = db.session().await?;
/// session.add(Person::new("John Doe", "555-555-5555", "123-45-6789"));
/// let report = session.save_changes().await?;
/// assert_eq!(report.inserted.len(), 1);
/// # Ok(())
/// # }
/// ```
pub struct Database {
    config: Arc<ConnectionConfig>,
    connector: Arc<dyn StoreConnector>,
    memory: Option<MemoryDatabase>,
}

impl Database {
    /// Build the connector the configuration selects. No connection is made
    /// until the first session or schema call.
    pub fn open(config: ConnectionConfig) -> Result<Self> {
        config.validate()?;

        let (connector, memory): (Arc<dyn StoreConnector>, Option<MemoryDatabase>) =
            match &config.backend {
                BackendKind::Memory { name } => {
                    let db = MemoryDatabase::new(name);
                    (Arc::new(db.clone()), Some(db))
                }
                BackendKind::Postgres => (
                    Arc::new(PostgresConnector::new(
                        &config.connection_string,
                        config.command_timeout,
                    )?),
                    None,
                ),
            };

        info!(backend = %config.redacted(), policy = %config.token_policy, "database opened");

        Ok(Self {
            config: Arc::new(config),
            connector,
            memory,
        })
    }

    /// Use a caller supplied connector instead of the configured backend.
    pub fn with_connector(config: ConnectionConfig, connector: Arc<dyn StoreConnector>) -> Self {
        Self {
            config: Arc::new(config),
            connector,
            memory: None,
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// The in-process database, when the memory backend is selected.
    pub fn memory(&self) -> Option<&MemoryDatabase> {
        self.memory.as_ref()
    }

    pub fn describe(&self) -> String {
        self.connector.describe()
    }

    /// Open a new, independent session.
    pub async fn session(&self) -> Result<Session> {
        Session::open(Arc::clone(&self.connector), Arc::clone(&self.config)).await
    }

    /// Drop the `people` table if it exists.
    pub async fn ensure_deleted(&self) -> Result<()> {
        let timeout = self.config.command_timeout;
        let mut store = with_timeout(timeout, self.connector.connect()).await?;
        with_timeout(timeout, store.drop_schema()).await?;
        info!("schema dropped");
        Ok(())
    }

    /// Create the `people` table if it does not exist.
    pub async fn ensure_created(&self) -> Result<()> {
        let timeout = self.config.command_timeout;
        let mut store = with_timeout(timeout, self.connector.connect()).await?;
        with_timeout(timeout, store.create_schema()).await?;
        info!("schema created");
        Ok(())
    }

    /// Drop and create the table, leaving it empty.
    pub async fn recreate(&self) -> Result<()> {
        self.ensure_deleted().await?;
        self.ensure_created().await
    }
}
