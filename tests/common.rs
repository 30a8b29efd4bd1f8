//! Common test utilities for discovery integration tests
//!
//! This module provides shared test infrastructure including:
//! - A scripted device wrapping the software device (mismatch, fault and pause injection)
//! - An in-memory backend behind a live link worker
//! - A fixture wiring device, channel and discovery engine together

#![allow(dead_code)]

use async_trait::async_trait;
use bitcoin::bip32::{ChildNumber, DerivationPath};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, Notify};

use hwlink_discovery::{
    authenticate, spawn_worker, to_checksum_address, AccountSource, Coin, DeviceConnector,
    DeviceDescriptor, DeviceFault, DeviceFaultKind, DeviceKey, DiscoveryEngine, LinkChannel,
    LinkConfig, LinkEvent, MemoryBackend, Notification, PublicKeyResponse, SessionOptions, SessionRegistry,
    SoftwareDevice,
};

pub const TEST_MNEMONIC: &str = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";
pub const DEVICE_PATH: &str = "usb:1";

pub fn init_logger() {
    env_logger::builder()
        .filter_level(log::LevelFilter::Debug)
        .is_test(true)
        .try_init()
        .ok();
}

#[derive(Default)]
struct Script {
    mismatch_at: Option<u32>,
    fault_at: Option<u32>,
    pause_at: Option<u32>,
    address_calls: Vec<u32>,
    keep_session: Vec<bool>,
}

/// Software device whose answers can be scripted per address index
///
/// Every injected behavior fires once.
pub struct ScriptedDevice {
    inner: SoftwareDevice,
    script: Mutex<Script>,
    /// Notified when a paused call is reached
    pub reached: Notify,
    /// Notify to let a paused call continue
    pub resume: Notify,
}

impl ScriptedDevice {
    pub fn new() -> Self {
        Self::with_passphrase("")
    }

    pub fn with_passphrase(passphrase: &str) -> Self {
        Self {
            inner: SoftwareDevice::from_mnemonic(TEST_MNEMONIC, passphrase)
                .expect("Failed to create software device"),
            script: Mutex::new(Script::default()),
            reached: Notify::new(),
            resume: Notify::new(),
        }
    }

    pub fn descriptor(&self, path: &str) -> DeviceDescriptor {
        self.inner.descriptor(path)
    }

    /// Answer with another address at `index`
    pub fn mismatch_at(&self, index: u32) {
        self.script.lock().unwrap().mismatch_at = Some(index);
    }

    /// Fail the address call at `index` with a timeout
    pub fn fault_at(&self, index: u32) {
        self.script.lock().unwrap().fault_at = Some(index);
    }

    /// Hold the address call at `index` until `resume` is notified
    pub fn pause_at(&self, index: u32) {
        self.script.lock().unwrap().pause_at = Some(index);
    }

    /// Indices of every address the device was asked for, in order
    pub fn address_calls(&self) -> Vec<u32> {
        self.script.lock().unwrap().address_calls.clone()
    }

    /// `keep_session` flag of every public key call, in order
    pub fn keep_session_flags(&self) -> Vec<bool> {
        self.script.lock().unwrap().keep_session.clone()
    }

    /// Forget recorded calls, e.g. the authentication call
    pub fn clear_calls(&self) {
        let mut script = self.script.lock().unwrap();
        script.address_calls.clear();
        script.keep_session.clear();
    }

    pub fn address_at(&self, coin: Coin, index: u32) -> String {
        let path = address_path(coin, index);
        let address = self
            .inner
            .address_at(&path)
            .expect("Failed to derive address");
        to_checksum_address(&address).expect("Invalid address")
    }
}

#[async_trait]
impl DeviceConnector for ScriptedDevice {
    async fn derive_public_key(
        &self,
        path: &DerivationPath,
        session: &SessionOptions,
    ) -> Result<PublicKeyResponse, DeviceFault> {
        self.script.lock().unwrap().keep_session.push(session.keep_session);
        self.inner.derive_public_key(path, session).await
    }

    async fn derive_address(
        &self,
        path: &DerivationPath,
        session: &SessionOptions,
        show_on_device: bool,
    ) -> Result<String, DeviceFault> {
        let index = last_index(path);
        let (pause, fault, mismatch) = {
            let mut script = self.script.lock().unwrap();
            script.address_calls.push(index);
            (
                take_if(&mut script.pause_at, index),
                take_if(&mut script.fault_at, index),
                take_if(&mut script.mismatch_at, index),
            )
        };

        if pause {
            self.reached.notify_one();
            self.resume.notified().await;
        }
        if fault {
            return Err(DeviceFault::new(DeviceFaultKind::Timeout, "Device call timed out"));
        }
        if mismatch {
            let other = path_with_index(path, index + 1);
            return self.inner.derive_address(&other, session, show_on_device).await;
        }
        self.inner.derive_address(path, session, show_on_device).await
    }
}

fn take_if(slot: &mut Option<u32>, index: u32) -> bool {
    if *slot == Some(index) {
        *slot = None;
        true
    } else {
        false
    }
}

fn last_index(path: &DerivationPath) -> u32 {
    let components: &[ChildNumber] = path.as_ref();
    match components.last() {
        Some(ChildNumber::Normal { index }) => *index,
        _ => u32::MAX,
    }
}

fn path_with_index(path: &DerivationPath, index: u32) -> DerivationPath {
    let components: &[ChildNumber] = path.as_ref();
    let mut children = components.to_vec();
    children.pop();
    children.push(ChildNumber::from_normal_idx(index).expect("Invalid index"));
    DerivationPath::from(children)
}

fn address_path(coin: Coin, index: u32) -> DerivationPath {
    DerivationPath::from_str(&format!("{}/{}", coin.bip44_path(), index)).expect("Invalid path")
}

/// Link channel connected to a worker serving `backend`
pub async fn connect_memory(backend: Arc<MemoryBackend>) -> Arc<LinkChannel> {
    let config = LinkConfig {
        poll_interval: Duration::from_millis(20),
        ..Default::default()
    };
    let channel = Arc::new(LinkChannel::new(&config));
    channel
        .init(spawn_worker(backend))
        .await
        .expect("Link handshake failed");
    channel
}

/// Device, backend, channel and engine wired together
pub struct Fixture {
    pub device: Arc<ScriptedDevice>,
    pub backend: Arc<MemoryBackend>,
    pub channel: Arc<LinkChannel>,
    pub sessions: SessionRegistry,
    pub engine: DiscoveryEngine,
    pub descriptor: DeviceDescriptor,
}

impl Fixture {
    pub async fn new() -> Self {
        Self::with_coins(&[Coin::Ethereum]).await
    }

    pub async fn with_coins(coins: &[Coin]) -> Self {
        init_logger();

        let device = Arc::new(ScriptedDevice::new());
        let backend = Arc::new(MemoryBackend::new(Coin::Ethereum));
        let channel = connect_memory(backend.clone()).await;

        let mut backends: HashMap<Coin, Arc<dyn AccountSource>> = HashMap::new();
        for coin in coins {
            backends.insert(*coin, channel.clone());
        }

        let sessions = SessionRegistry::new();
        let engine = DiscoveryEngine::new(device.clone(), sessions.clone(), backends);
        let descriptor = authenticate(device.as_ref(), &device.descriptor(DEVICE_PATH))
            .await
            .expect("Failed to authenticate device");
        device.clear_calls();

        Self {
            device,
            backend,
            channel,
            sessions,
            engine,
            descriptor,
        }
    }

    pub fn key(&self) -> DeviceKey {
        self.descriptor.key().expect("Device is not authenticated")
    }

    pub fn address(&self, coin: Coin, index: u32) -> String {
        self.device.address_at(coin, index)
    }

    /// Give the address at `index` a balance and history
    pub fn fund(&self, coin: Coin, index: u32, balance: u128, transaction_count: u64) {
        self.backend
            .set_account(&self.address(coin, index), balance, transaction_count);
    }

    /// Fund indices `0..count` so discovery stops at `count`
    pub fn fund_range(&self, coin: Coin, count: u32) {
        for index in 0..count {
            self.fund(coin, index, 1_000 + index as u128, 1);
        }
    }

    pub fn disconnected(&self) -> DeviceDescriptor {
        DeviceDescriptor {
            connected: false,
            ..self.descriptor.clone()
        }
    }
}

/// Poll `condition` until it holds or a second has passed
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Next notification event, skipping connection events
pub async fn next_notification(events: &mut broadcast::Receiver<LinkEvent>) -> Notification {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("Timed out waiting for a notification")
            .expect("Event stream closed");
        if let LinkEvent::Notification(notification) = event {
            return notification;
        }
    }
}
