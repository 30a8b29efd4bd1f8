use anyhow::Context;
use std::collections::HashMap;
use std::env;
use std::sync::Arc;

use hwlink_discovery::{
    authenticate, spawn_worker, AccountSource, DiscoveryEngine, JsonRpcBackend, LinkChannel,
    LinkConfig, SessionRegistry, SnapshotStore, SoftwareDevice, WalletSnapshot,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    // Initialize logger (set RUST_LOG=debug for verbose output, RUST_LOG=info for normal)
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = LinkConfig::from_env();

    let phrase = env::var("DEVICE_MNEMONIC").context("DEVICE_MNEMONIC is not set")?;
    let passphrase = env::var("DEVICE_PASSPHRASE").unwrap_or_default();
    let device = Arc::new(SoftwareDevice::from_mnemonic(&phrase, &passphrase)?);

    let backend = Arc::new(JsonRpcBackend::new(&config.backend_url, config.coin));
    let channel = Arc::new(LinkChannel::new(&config));
    channel
        .init(spawn_worker(backend))
        .await
        .context("Failed to start link worker")?;

    let descriptor = authenticate(device.as_ref(), &device.descriptor("emulator")).await?;

    let mut backends: HashMap<_, Arc<dyn AccountSource>> = HashMap::new();
    backends.insert(config.coin, channel.clone());
    let engine = DiscoveryEngine::new(device, SessionRegistry::new(), backends);

    // pick up where a previous run left off
    let store = env::var("SNAPSHOT_DIR").ok().map(SnapshotStore::new);
    if let Some(store) = &store {
        engine.load(store.load()?.discovery);
    }

    log::info!("Discovering {} accounts", config.coin.shortcut());
    let status = engine.start(&descriptor, config.coin).await?;
    log::info!("Discovery finished: {:?}", status);

    let key = descriptor.key()?;
    let record = engine
        .record(&key, config.coin)
        .context("Discovery left no record")?;
    println!("{}", serde_json::to_string_pretty(&record.addresses)?);

    if let Some(store) = &store {
        store.save(&WalletSnapshot {
            discovery: engine.records(),
            ..Default::default()
        })?;
    }

    channel.dispose();
    Ok(())
}
