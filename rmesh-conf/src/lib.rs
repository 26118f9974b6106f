#![deny(unsafe_code)]

use std::fmt;
use std::net::SocketAddr;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use config::{builder::DefaultState, Config, ConfigBuilder, File};
use once_cell::sync::OnceCell;
use serde::Deserialize;

use rmesh_utils::*;

use self::logging::Log;

pub use self::options::Options;

pub mod logging;
pub mod options;

pub type Result<T> = anyhow::Result<T>;

static SETTINGS: OnceCell<Settings> = OnceCell::new();

#[derive(Clone)]
pub struct Settings(Arc<Inner>);

#[derive(Debug, Clone, Deserialize)]
pub struct Inner {
    /// Client listen address, serving raw MQTT and MQTT over WebSocket.
    #[serde(default = "Inner::listen_default", deserialize_with = "deserialize_addr")]
    pub listen: SocketAddr,
    /// License string, a fresh one is generated at start-up when empty.
    #[serde(default)]
    pub license: String,
    #[serde(default)]
    pub tls: Tls,
    #[serde(default)]
    pub limits: Limits,
    #[serde(default)]
    pub cluster: Cluster,
    #[serde(default)]
    pub storage: Storage,
    #[serde(default)]
    pub contract: Contract,
    #[serde(default)]
    pub vault: Vault,
    #[serde(default)]
    pub log: Log,
    #[serde(default, skip)]
    pub opts: Options,
}

impl Inner {
    fn listen_default() -> SocketAddr {
        ([0, 0, 0, 0], 8080).into()
    }
}

impl Deref for Settings {
    type Target = Inner;
    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl Settings {
    fn new(opts: Options) -> Result<Self> {
        let mut builder = Config::builder()
            .add_source(File::with_name("/etc/rmesh/rmesh").required(false))
            .add_source(File::with_name("rmesh").required(false))
            .add_source(
                config::Environment::with_prefix("rmesh")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        if let Some(cfg) = opts.cfg_name.as_ref() {
            builder = builder.add_source(File::with_name(cfg).required(true));
        }

        Self::build(builder, opts)
    }

    fn build(builder: ConfigBuilder<DefaultState>, opts: Options) -> Result<Self> {
        let mut inner: Inner = builder.build()?.try_deserialize()?;

        //Command line configuration overriding file configuration
        if let Some(listen) = opts.listen.as_ref() {
            inner.listen = to_addr(listen)?;
        }
        if let Some(listen) = opts.cluster_listen.as_ref() {
            inner.cluster.listen = Some(to_addr(listen)?);
        }
        if let Some(seed) = opts.cluster_seed.as_ref() {
            inner.cluster.seed.clone_from(seed);
        }
        if let Some(license) = opts.license.as_ref() {
            inner.license.clone_from(license);
        }

        inner.limits.packet_size_limit()?;
        inner.opts = opts;
        Ok(Self(Arc::new(inner)))
    }

    #[inline]
    pub fn instance() -> &'static Self {
        match SETTINGS.get() {
            Some(c) => c,
            None => {
                unreachable!("Settings not initialized");
            }
        }
    }

    #[inline]
    pub fn init(opts: Options) -> Result<&'static Self> {
        SETTINGS.set(Settings::new(opts)?).map_err(|_| anyhow!("Settings init failed"))?;
        SETTINGS.get().ok_or_else(|| anyhow!("Settings init failed"))
    }

    #[inline]
    pub fn logs() -> Result<()> {
        let cfg = Self::instance();
        log::debug!("Config info is {:?}", cfg.0);
        log::info!("listen is {}", cfg.listen);
        if let Some(tls) = cfg.tls.listen {
            log::info!("tls.listen is {}", tls);
        }
        log::info!("limits config is: {:?}", cfg.limits);
        match cfg.cluster.listen {
            Some(listen) => log::info!(
                "cluster listen is {}, seed is {:?}, name is {:?}",
                listen,
                cfg.cluster.seed,
                cfg.cluster.name
            ),
            None => log::info!("cluster is disabled, running standalone"),
        }
        log::info!("storage provider is {:?}, config: {:?}", cfg.storage.provider, cfg.storage.config);
        log::info!("contract provider is {:?}", cfg.contract.provider);
        Ok(())
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Settings ...")?;
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Tls {
    #[serde(default, deserialize_with = "deserialize_addr_option")]
    pub listen: Option<SocketAddr>,
    /// PEM certificate chain file
    #[serde(default)]
    pub certificate: String,
    /// PEM private key file
    #[serde(default)]
    pub private_key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Limits {
    #[serde(default = "Limits::max_packet_size_default")]
    pub max_packet_size: Bytesize,
    #[serde(default = "Limits::handshake_timeout_default", deserialize_with = "deserialize_duration")]
    pub handshake_timeout: Duration,
    #[serde(default = "Limits::send_timeout_default", deserialize_with = "deserialize_duration")]
    pub send_timeout: Duration,
    //Capacity of the outbound queue of each client connection.
    #[serde(default = "Limits::queue_len_default")]
    pub queue_len: usize,
}

impl Default for Limits {
    #[inline]
    fn default() -> Self {
        Self {
            max_packet_size: Self::max_packet_size_default(),
            handshake_timeout: Self::handshake_timeout_default(),
            send_timeout: Self::send_timeout_default(),
            queue_len: Self::queue_len_default(),
        }
    }
}

impl Limits {
    /// `max_packet_size` as the codec takes it.
    pub fn packet_size_limit(&self) -> Result<u32> {
        u32::try_from(self.max_packet_size.as_u64())
            .map_err(|_| anyhow!("limits.max_packet_size {:?} does not fit in 32 bits", self.max_packet_size))
    }

    fn max_packet_size_default() -> Bytesize {
        Bytesize::from("1M")
    }
    fn handshake_timeout_default() -> Duration {
        Duration::from_secs(30)
    }
    fn send_timeout_default() -> Duration {
        Duration::from_secs(10)
    }
    fn queue_len_default() -> usize {
        1024
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Cluster {
    /// Unique node name, either a hardware address or any string.
    #[serde(default)]
    pub name: String,
    /// Cluster listen address, the node runs standalone when unset.
    #[serde(default, deserialize_with = "deserialize_addr_option")]
    pub listen: Option<SocketAddr>,
    /// Address announced to other members, defaults to `listen`.
    #[serde(default, deserialize_with = "deserialize_addr_option")]
    pub advertise: Option<SocketAddr>,
    /// Address of any existing member, "host:port".
    #[serde(default)]
    pub seed: String,
    #[serde(default)]
    pub passphrase: String,
    #[serde(default = "Cluster::gossip_interval_default", deserialize_with = "deserialize_duration")]
    pub gossip_interval: Duration,
}

impl Default for Cluster {
    #[inline]
    fn default() -> Self {
        Self {
            name: String::new(),
            listen: None,
            advertise: None,
            seed: String::new(),
            passphrase: String::new(),
            gossip_interval: Self::gossip_interval_default(),
        }
    }
}

impl Cluster {
    fn gossip_interval_default() -> Duration {
        Duration::from_secs(30)
    }

    #[inline]
    pub fn enabled(&self) -> bool {
        self.listen.is_some()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Storage {
    /// One of "noop" or "inmemory".
    #[serde(default = "Storage::provider_default")]
    pub provider: String,
    #[serde(default)]
    pub config: StorageConfig,
}

impl Default for Storage {
    #[inline]
    fn default() -> Self {
        Self { provider: Self::provider_default(), config: StorageConfig::default() }
    }
}

impl Storage {
    fn provider_default() -> String {
        "inmemory".into()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    //Total size of cached messages before pruning kicks in.
    #[serde(default = "StorageConfig::maxsize_default")]
    pub maxsize: Bytesize,
    //Number of oldest messages evicted per pruning pass.
    #[serde(default = "StorageConfig::prune_default")]
    pub prune: usize,
}

impl Default for StorageConfig {
    #[inline]
    fn default() -> Self {
        Self { maxsize: Self::maxsize_default(), prune: Self::prune_default() }
    }
}

impl StorageConfig {
    fn maxsize_default() -> Bytesize {
        Bytesize::from("1G")
    }
    fn prune_default() -> usize {
        100
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Contract {
    #[serde(default = "Contract::provider_default")]
    pub provider: String,
}

impl Default for Contract {
    #[inline]
    fn default() -> Self {
        Self { provider: Self::provider_default() }
    }
}

impl Contract {
    fn provider_default() -> String {
        "single".into()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Vault {
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub app: String,
}

impl Vault {
    #[inline]
    pub fn enabled(&self) -> bool {
        !self.address.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use config::FileFormat;

    use super::*;

    fn load(toml: &str, opts: Options) -> Settings {
        let builder = Config::builder().add_source(File::from_str(toml, FileFormat::Toml));
        Settings::build(builder, opts).unwrap()
    }

    #[test]
    fn defaults() {
        let s = load("", Options::default());
        assert_eq!(s.listen, "0.0.0.0:8080".parse::<SocketAddr>().unwrap());
        assert!(s.license.is_empty());
        assert!(s.tls.listen.is_none());
        assert!(!s.cluster.enabled());
        assert_eq!(s.cluster.gossip_interval, Duration::from_secs(30));
        assert_eq!(s.storage.provider, "inmemory");
        assert_eq!(s.storage.config.maxsize.as_usize(), 1024 * 1024 * 1024);
        assert_eq!(s.storage.config.prune, 100);
        assert_eq!(s.limits.max_packet_size.as_usize(), 1024 * 1024);
        assert_eq!(s.contract.provider, "single");
        assert!(!s.vault.enabled());
    }

    #[test]
    fn file_values() {
        let s = load(
            r#"
listen = ":1883"
license = "abc"

[cluster]
name = "02:42:ac:11:00:02"
listen = "127.0.0.1:4000"
seed = "10.0.0.1:4000"
passphrase = "secret"
gossip_interval = "10s"

[storage]
provider = "noop"
config = { maxsize = "64M", prune = 10 }

[limits]
handshake_timeout = "5s"
queue_len = 16
"#,
            Options::default(),
        );
        assert_eq!(s.listen.port(), 1883);
        assert_eq!(s.license, "abc");
        assert!(s.cluster.enabled());
        assert_eq!(s.cluster.seed, "10.0.0.1:4000");
        assert_eq!(s.cluster.gossip_interval, Duration::from_secs(10));
        assert_eq!(s.storage.provider, "noop");
        assert_eq!(s.storage.config.maxsize.as_usize(), 64 * 1024 * 1024);
        assert_eq!(s.storage.config.prune, 10);
        assert_eq!(s.limits.handshake_timeout, Duration::from_secs(5));
        assert_eq!(s.limits.queue_len, 16);
    }

    #[test]
    fn packet_size_limit() {
        let s = load("[limits]\nmax_packet_size = \"256K\"", Options::default());
        assert_eq!(s.limits.packet_size_limit().unwrap(), 256 * 1024);

        let builder = Config::builder()
            .add_source(File::from_str("[limits]\nmax_packet_size = \"8G\"", FileFormat::Toml));
        assert!(Settings::build(builder, Options::default()).is_err());
    }

    #[test]
    fn command_line_overrides() {
        let opts = Options {
            listen: Some(":9090".into()),
            cluster_listen: Some("127.0.0.1:4001".into()),
            cluster_seed: Some("127.0.0.1:4000".into()),
            license: Some("cli".into()),
            ..Default::default()
        };
        let s = load("listen = \":1883\"\nlicense = \"file\"", opts);
        assert_eq!(s.listen.port(), 9090);
        assert_eq!(s.cluster.listen.unwrap().port(), 4001);
        assert_eq!(s.cluster.seed, "127.0.0.1:4000");
        assert_eq!(s.license, "cli");
        assert_eq!(s.opts.listen.as_deref(), Some(":9090"));
    }
}
