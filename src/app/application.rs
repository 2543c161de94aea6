use std::sync::Arc;

use super::handlers::{JobsHandler, ProfitsHandler};
use super::store::{JobStore, MemoryStore, ModelRegistry};
use super::ApiError;
use crate::{log_info, RpcClient, RpcConfig, TransportPtr};

/// Process-wide collaborators shared by every handler.
#[derive(Clone)]
pub struct Application {
    store: Arc<dyn JobStore>,
    client: RpcClient,
}

impl Application {
    pub fn new(store: Arc<dyn JobStore>, client: RpcClient) -> Self {
        Self { store, client }
    }

    /// Open a [`MemoryStore`] on `registry` and start an RPC client over
    /// `transport`.
    pub fn start(
        registry: &ModelRegistry,
        transport: TransportPtr,
        config: RpcConfig,
    ) -> Result<Self, ApiError> {
        // ---
        let store: Arc<dyn JobStore> = Arc::new(MemoryStore::open(registry)?);
        let client = RpcClient::start(transport, config)?;
        log_info!("Application started with tables {:?}", registry.table_names());
        Ok(Self::new(store, client))
    }

    pub fn jobs_handler(&self) -> JobsHandler {
        JobsHandler::new(Arc::clone(&self.store))
    }

    pub fn profits_handler(&self) -> ProfitsHandler {
        ProfitsHandler::new(Arc::clone(&self.store), self.client.clone())
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn client(&self) -> &RpcClient {
        &self.client
    }

    /// Close the RPC client. Calls still in flight fail with `Closed`.
    pub async fn shutdown(&self) -> Result<(), ApiError> {
        Ok(self.client.close().await?)
    }
}
