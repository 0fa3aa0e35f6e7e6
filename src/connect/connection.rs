use super::resolver::{MongoDbConnectionResolver, mask_password, split_authority};
use crate::config::ConfigParams;
use crate::context::CallContext;
use crate::driver::{ConnectOptions, DocumentDriver, DriverClient, DriverDatabase};
use crate::error::{PersistenceError, Result, codes};
use crate::refer::References;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::Mutex;
use tracing::{Level, event};

/// Database used when the connection string does not name one.
pub const DEFAULT_DATABASE: &str = "test";

struct OpenState {
    client: Arc<dyn DriverClient>,
    database: Arc<dyn DriverDatabase>,
    database_name: String,
}

/// Connection to a MongoDB cluster
///
/// Resolves its connection string through [`MongoDbConnectionResolver`],
/// opens one pooled client through the driver and hands out the client and
/// database handles to the persistence components that share it.
pub struct MongoDbConnection {
    driver: Arc<dyn DocumentDriver>,
    resolver: MongoDbConnectionResolver,
    options: ConnectOptions,
    state: RwLock<Option<OpenState>>,
    /// Serializes open and close
    lifecycle: Mutex<()>,
}

impl MongoDbConnection {
    pub fn new(driver: Arc<dyn DocumentDriver>) -> Self {
        Self {
            driver,
            resolver: MongoDbConnectionResolver::new(),
            options: ConnectOptions::default(),
            state: RwLock::new(None),
            lifecycle: Mutex::new(()),
        }
    }

    pub fn configure(&mut self, config: &ConfigParams) {
        self.resolver.configure(config);
        self.options = ConnectOptions::from_config(config);
    }

    pub fn set_references(&mut self, references: &References) {
        self.resolver.set_references(references);
    }

    pub fn options(&self) -> &ConnectOptions {
        &self.options
    }

    pub fn is_open(&self) -> bool {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Resolve the connection string and connect. No-op when already open.
    pub async fn open(&self, ctx: &CallContext) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.is_open() {
            return Ok(());
        }

        let uri = self.resolver.resolve(ctx).await.map_err(|err| {
            PersistenceError::connection(
                ctx.trace_id(),
                codes::CONNECT_FAILED,
                "Connection to MongoDB failed",
            )
            .with_cause(err)
        })?;

        let timeout = self.options.connect_timeout;
        let attempt = async {
            match tokio::time::timeout(timeout, self.driver.connect(&uri, &self.options)).await {
                Ok(connected) => connected.map_err(PersistenceError::from),
                Err(_) => Err(PersistenceError::connection(
                    ctx.trace_id(),
                    codes::CONNECT_FAILED,
                    format!("Connection to MongoDB timed out after {:?}", timeout),
                )),
            }
        };
        let client = ctx.run(attempt).await.map_err(|err| {
            err.into_connection(
                ctx.trace_id(),
                codes::CONNECT_FAILED,
                "Connection to MongoDB failed",
            )
        })?;

        let database_name = database_from_uri(&uri);
        let database = client.database(&database_name);
        event!(
            Level::DEBUG,
            trace_id = ctx.trace_id(),
            uri = %mask_password(&uri),
            database = %database_name,
            "connected to mongodb database"
        );

        *self.state.write().unwrap_or_else(PoisonError::into_inner) = Some(OpenState {
            client,
            database,
            database_name,
        });
        Ok(())
    }

    /// Close the client. No-op when already closed.
    ///
    /// The connection counts as closed even when the driver reports a
    /// failure.
    pub async fn close(&self, ctx: &CallContext) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        let Some(state) = self.state.write().unwrap_or_else(PoisonError::into_inner).take() else {
            return Ok(());
        };

        ctx.run(state.client.close()).await.map_err(|err| {
            err.into_connection(
                ctx.trace_id(),
                codes::DISCONNECT_FAILED,
                "Disconnect from MongoDB failed",
            )
        })?;

        event!(
            Level::DEBUG,
            trace_id = ctx.trace_id(),
            database = %state.database_name,
            "disconnected from mongodb database"
        );
        Ok(())
    }

    pub fn get_connection(&self) -> Option<Arc<dyn DriverClient>> {
        self.read_state(|state| Arc::clone(&state.client))
    }

    pub fn get_database(&self) -> Option<Arc<dyn DriverDatabase>> {
        self.read_state(|state| Arc::clone(&state.database))
    }

    pub fn get_database_name(&self) -> Option<String> {
        self.read_state(|state| state.database_name.clone())
    }

    fn read_state<R>(&self, f: impl FnOnce(&OpenState) -> R) -> Option<R> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(f)
    }
}

/// Database named in the path of a connection string.
fn database_from_uri(uri: &str) -> String {
    let tail = split_authority(uri).map_or("", |(_, _, tail)| tail);
    let name = tail
        .strip_prefix('/')
        .and_then(|path| path.split('?').next())
        .unwrap_or_default();
    if name.is_empty() {
        DEFAULT_DATABASE.to_string()
    } else {
        name.to_string()
    }
}
