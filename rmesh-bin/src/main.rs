#![deny(unsafe_code)]

use std::process;
use std::time::Duration;

use structopt::StructOpt;

use rmesh::conf::{Options, Settings};
use rmesh::context::ServerContext;
use rmesh::logger::{config_logger, logger_init};
use rmesh::net::Builder;
use rmesh::security::{new_secret_store, License};
use rmesh::server::MqttServer;
use rmesh::Result;

const LICENSE_SECRET: &str = "rmesh/license";

#[tokio::main]
async fn main() {
    //init config
    let cfg = Settings::init(Options::from_args()).expect("settings init failed");

    //init log
    let logger = config_logger(&cfg.log.filename(), cfg.log.to, cfg.log.level).expect("logger config failed");
    logger_init(logger, cfg.log.level).expect("logger init failed");

    let _ = Settings::logs();

    if let Err(e) = run(cfg).await {
        log::error!("broker failed, {:?}", e);
        tokio::time::sleep(Duration::from_millis(100)).await;
        process::exit(1);
    }
}

async fn run(cfg: &'static Settings) -> Result<()> {
    let license = load_license(cfg).await?;

    let scx = ServerContext::new(license)
        .contract_provider(cfg.contract.provider.clone())
        .storage(cfg.storage.clone())
        .cluster(cfg.cluster.clone())
        .limits(cfg.limits.clone())
        .build()
        .await?;

    let server = MqttServer::new(scx.clone()).listener(builder("external/tcp", cfg)?.bind()?.tcp()?);
    #[cfg(feature = "tls")]
    let server = match cfg.tls.listen {
        Some(laddr) => server.listener(
            builder("external/tls", cfg)?
                .laddr(laddr)
                .tls_cert(Some(cfg.tls.certificate.clone()))
                .tls_key(Some(cfg.tls.private_key.clone()))
                .bind()?
                .tls()?,
        ),
        None => server,
    };
    server.build().start();

    shutdown_signal().await;
    log::info!("shutting down");
    scx.close();
    tokio::time::sleep(Duration::from_millis(500)).await;
    Ok(())
}

fn builder(name: &str, cfg: &Settings) -> Result<Builder> {
    Ok(Builder::new()
        .name(name)
        .laddr(cfg.listen)
        .max_packet_size(cfg.limits.packet_size_limit()?)
        .handshake_timeout(cfg.limits.handshake_timeout)
        .send_timeout(cfg.limits.send_timeout))
}

/// The configured license, then the secret store, then a fresh one.
async fn load_license(cfg: &Settings) -> Result<License> {
    if !cfg.license.is_empty() {
        return License::parse(&cfg.license);
    }

    let user = if cfg.cluster.name.is_empty() { cfg.listen.to_string() } else { cfg.cluster.name.clone() };
    let secrets = new_secret_store(&cfg.vault, &user)?;
    if let Some(text) = secrets.get_secret(LICENSE_SECRET).await {
        log::info!("license loaded from {}", secrets.name());
        return License::parse(&text);
    }

    let license = License::generate();
    log::warn!("no license configured, generated a new one: {}", license.encode());
    log::warn!("master key for contract {}: {}", license.contract, license.new_master_key());
    Ok(license)
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            log::warn!("SIGTERM handler not installed, {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
