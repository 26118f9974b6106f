use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::broker::Subscriber;
use crate::cluster::{SubscriptionCounters, Surveyor, Swarm};
use crate::conf;
use crate::security::{new_contract_provider, Cipher, ContractProvider, License};
use crate::store::{new_storage, surveyee, Storage};
use crate::trie::Trie;
use crate::utils::timestamp_secs;
use crate::Result;

/// Everything a connection needs to serve its client, shared by all of them.
#[derive(Clone)]
pub struct ServerContext {
    inner: Arc<ServerContextInner>,
}

pub struct ServerContextInner {
    pub license: License,
    pub cipher: Cipher,
    pub contracts: Arc<dyn ContractProvider>,
    pub trie: Arc<Trie<Subscriber>>,
    pub storage: Arc<dyn Storage>,
    pub swarm: Option<Swarm>,
    /// Local subscribers per SSID, the first and the last are replicated.
    pub counters: SubscriptionCounters,
    pub limits: conf::Limits,
    conn_id: AtomicU64,
    /// Cancelled when the broker shuts down.
    pub token: CancellationToken,
}

impl Deref for ServerContext {
    type Target = ServerContextInner;
    #[inline]
    fn deref(&self) -> &Self::Target {
        self.inner.as_ref()
    }
}

impl ServerContext {
    #[allow(clippy::new_ret_no_self)]
    pub fn new(license: License) -> ServerContextBuilder {
        ServerContextBuilder::new(license)
    }

    /// Unique id of a new client connection.
    #[inline]
    pub fn next_conn_id(&self) -> u64 {
        self.conn_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Stops the background tasks and leaves the cluster.
    pub fn close(&self) {
        if let Some(swarm) = &self.swarm {
            swarm.close();
        }
        self.token.cancel();
    }
}

impl fmt::Debug for ServerContext {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ServerContext")
            .field("license", &self.license)
            .field("contracts", &self.contracts.name())
            .field("storage", &self.storage.name())
            .field("swarm", &self.swarm)
            .finish()
    }
}

pub struct ServerContextBuilder {
    license: License,
    contract_provider: String,
    storage: conf::Storage,
    storage_provider: Option<Arc<dyn Storage>>,
    cluster: Option<conf::Cluster>,
    limits: conf::Limits,
    token: CancellationToken,
}

impl ServerContextBuilder {
    fn new(license: License) -> Self {
        Self {
            license,
            contract_provider: String::new(),
            storage: conf::Storage::default(),
            storage_provider: None,
            cluster: None,
            limits: conf::Limits::default(),
            token: CancellationToken::new(),
        }
    }

    pub fn contract_provider<N: Into<String>>(mut self, name: N) -> Self {
        self.contract_provider = name.into();
        self
    }

    pub fn storage(mut self, storage: conf::Storage) -> Self {
        self.storage = storage;
        self
    }

    /// Uses `storage` instead of building one from the storage config.
    pub fn storage_provider(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage_provider = Some(storage);
        self
    }

    /// Joins the cluster described by `cluster` when it has a listen address.
    pub fn cluster(mut self, cluster: conf::Cluster) -> Self {
        self.cluster = cluster.enabled().then_some(cluster);
        self
    }

    pub fn limits(mut self, limits: conf::Limits) -> Self {
        self.limits = limits;
        self
    }

    pub fn token(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    pub async fn build(self) -> Result<ServerContext> {
        let contracts = new_contract_provider(&self.contract_provider, &self.license)?;
        let storage = match self.storage_provider {
            Some(storage) => storage,
            None => new_storage(&self.storage, self.token.child_token())?,
        };
        let trie = Arc::new(Trie::new());

        let swarm = match self.cluster {
            Some(cfg) => {
                let swarm = Swarm::new(cfg, trie.clone(), self.token.clone());
                swarm.start().await?;
                storage.attach(Arc::new(swarm.clone()) as Arc<dyn Surveyor>);
                swarm.add_surveyee(surveyee(&storage));
                Some(swarm)
            }
            None => None,
        };

        log::info!(
            "contract provider is {}, storage provider is {}, cluster is {}",
            contracts.name(),
            storage.name(),
            if swarm.is_some() { "enabled" } else { "disabled" }
        );

        Ok(ServerContext {
            inner: Arc::new(ServerContextInner {
                cipher: self.license.cipher(),
                license: self.license,
                contracts,
                trie,
                storage,
                swarm,
                counters: SubscriptionCounters::default(),
                limits: self.limits,
                conn_id: AtomicU64::new(timestamp_secs() as u64),
                token: self.token,
            }),
        })
    }
}
