pub mod authz;
pub mod broadcaster;
pub mod config;
pub mod credential;
pub mod dispatcher;
pub mod error;
pub mod ipc;
pub mod protocol;
pub mod session;
pub mod storage;

use std::sync::Arc;

use broadcaster::Broadcaster;
use config::DaemonConfig;
use credential::CredentialVerifier;
use session::SessionRegistry;
use storage::Store;

/// Shared application state passed to the IPC layer and every dispatcher call.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<DaemonConfig>,
    pub store: Arc<Store>,
    pub registry: Arc<SessionRegistry>,
    pub broadcaster: Arc<Broadcaster>,
    pub credentials: Arc<dyn CredentialVerifier>,
    pub started_at: std::time::Instant,
}

impl AppContext {
    pub fn new(
        config: Arc<DaemonConfig>,
        store: Arc<Store>,
        credentials: Arc<dyn CredentialVerifier>,
    ) -> Self {
        let registry = SessionRegistry::new();
        let broadcaster = Arc::new(Broadcaster::new(store.clone(), registry.clone()));
        Self {
            config,
            store,
            registry,
            broadcaster,
            credentials,
            started_at: std::time::Instant::now(),
        }
    }
}
