//! Lazy, Two-Phase Store Connection
//!
//! Constructing a pipeline should be cheap and infallible; dialing an
//! external store is neither. [`LazyStore`] splits the two phases: the
//! constructor just records how to connect, and the first call that actually
//! needs the store runs the connect exactly once.
//!
//! The first outcome - success or failure - is cached for the life of the
//! process. A known-bad configuration is therefore not re-dialed on every
//! batch flush; callers keep getting the same `ConnectFailed` until a fresh
//! process retries with (hopefully) fixed configuration.
//!
//! ## Example
//!
//! ```ignore
//! use quotaflow_pipeline::LazyStore;
//! use quotaflow_core::BulkStore;
//!
//! let store: LazyStore<dyn BulkStore> = LazyStore::connect_with(|| async {
//!     let client = WarehouseSink::dial("warehouse.internal:443").await?;
//!     Ok(std::sync::Arc::new(client) as _)
//! });
//!
//! // Nothing has been dialed yet; the first get() connects.
//! let handle = store.get().await?;
//! ```

use crate::error::{PipelineError, Result};
use futures::future::BoxFuture;
use quotaflow_core::StoreError;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{error, info};

type Connector<S> =
    Box<dyn Fn() -> BoxFuture<'static, std::result::Result<Arc<S>, StoreError>> + Send + Sync>;

/// A store handle that connects on first use and caches the outcome.
pub struct LazyStore<S: ?Sized + Send + Sync + 'static> {
    /// First connect outcome; `Err` is cached just like `Ok`.
    cell: OnceCell<std::result::Result<Arc<S>, String>>,
    connect: Option<Connector<S>>,
}

impl<S: ?Sized + Send + Sync + 'static> LazyStore<S> {
    /// Wrap an already-connected store; `get()` never fails.
    pub fn ready(store: Arc<S>) -> Self {
        Self {
            cell: OnceCell::new_with(Some(Ok(store))),
            connect: None,
        }
    }

    /// Defer connection to `connect`, run once on first use.
    pub fn connect_with<F, Fut>(connect: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Arc<S>, StoreError>> + Send + 'static,
    {
        Self {
            cell: OnceCell::new(),
            connect: Some(Box::new(move || Box::pin(connect()))),
        }
    }

    /// Get the store, connecting on first call.
    ///
    /// # Errors
    ///
    /// `PipelineError::ConnectFailed` if the (first) connect failed; the
    /// same error is returned on every subsequent call without re-dialing.
    pub async fn get(&self) -> Result<Arc<S>> {
        let outcome = self
            .cell
            .get_or_init(|| async {
                match &self.connect {
                    Some(connect) => match connect().await {
                        Ok(store) => {
                            info!("store connected");
                            Ok(store)
                        }
                        Err(err) => {
                            error!(error = %err, "store connection failed; caching failure");
                            Err(err.to_string())
                        }
                    },
                    None => Err("no store configured".to_string()),
                }
            })
            .await;

        outcome
            .clone()
            .map_err(PipelineError::ConnectFailed)
    }

    /// Whether a connect attempt has already run (successfully or not).
    pub fn attempted(&self) -> bool {
        self.cell.initialized()
    }
}
