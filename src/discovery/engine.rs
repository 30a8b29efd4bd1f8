//! Discovery State Machine
//!
//! One run per (device identity, coin). A run claims the device session,
//! walks the account's addresses in index order and stops at the first
//! address with neither balance nor history:
//!
//! ```text
//! idle -> waiting-for-device -> running -> completed | interrupted | failed
//! ```
//!
//! Interruption is cooperative. The run checks its interrupt token before
//! and after every await, so a call already in flight completes and its
//! result is discarded. Records are only mutated by the run that owns the
//! current token; a superseded run can no longer write.

use async_trait::async_trait;
use bitcoin::bip32::DerivationPath;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;

use super::record::{AddressRecord, DiscoveryFault, DiscoveryRecord, DiscoveryStatus};
use crate::coin::Coin;
use crate::device::{DeviceConnector, DeviceDescriptor, DeviceKey, DeviceVerifier, SessionOptions};
use crate::error::{DiscoveryError, LinkError};
use crate::link::types::AccountInfo;
use crate::link::LinkChannel;
use crate::sequencer::AddressSequencer;
use crate::session::{SessionOwner, SessionRegistry};

const EVENT_CAPACITY: usize = 256;

/// Where balance and nonce of an address come from
#[async_trait]
pub trait AccountSource: Send + Sync {
    async fn account_info(&self, address: &str) -> Result<AccountInfo, LinkError>;
}

#[async_trait]
impl AccountSource for LinkChannel {
    async fn account_info(&self, address: &str) -> Result<AccountInfo, LinkError> {
        self.get_account_info(address).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    StatusChanged {
        device_key: DeviceKey,
        coin: Coin,
        status: DiscoveryStatus,
    },
    AddressAdded {
        device_key: DeviceKey,
        coin: Coin,
        address: AddressRecord,
    },
}

type RecordId = (DeviceKey, Coin);

struct Entry {
    record: DiscoveryRecord,
    interrupt: Arc<AtomicBool>,
}

impl Entry {
    fn new(record: DiscoveryRecord) -> Self {
        Self {
            record,
            interrupt: Arc::new(AtomicBool::new(false)),
        }
    }

    fn owned_by(&self, token: &Arc<AtomicBool>) -> bool {
        Arc::ptr_eq(&self.interrupt, token)
    }
}

/// How a run treats an existing record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Plan {
    /// Fresh public key, index 0
    Begin,
    /// Continue at `current_index`
    Resume,
    /// Continue past a completed record
    Extend,
}

enum Outcome {
    Completed,
    Interrupted,
}

struct Run {
    id: RecordId,
    token: Arc<AtomicBool>,
    plan: Plan,
}

struct Inner {
    device: Arc<dyn DeviceConnector>,
    verifier: DeviceVerifier,
    sessions: SessionRegistry,
    backends: HashMap<Coin, Arc<dyn AccountSource>>,
    entries: Mutex<HashMap<RecordId, Entry>>,
    events: broadcast::Sender<DiscoveryEvent>,
}

#[derive(Clone)]
pub struct DiscoveryEngine {
    inner: Arc<Inner>,
}

impl DiscoveryEngine {
    pub fn new(
        device: Arc<dyn DeviceConnector>,
        sessions: SessionRegistry,
        backends: HashMap<Coin, Arc<dyn AccountSource>>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                verifier: DeviceVerifier::new(Arc::clone(&device)),
                device,
                sessions,
                backends,
                entries: Mutex::new(HashMap::new()),
                events,
            }),
        }
    }

    /// Discover the addresses of `coin` on `device`
    ///
    /// Returns the status the record ended in. A run already in progress for
    /// the pair is left alone. Failures are returned as errors after the
    /// record was marked failed.
    pub async fn start(
        &self,
        device: &DeviceDescriptor,
        coin: Coin,
    ) -> Result<DiscoveryStatus, DiscoveryError> {
        self.discover(device, coin, false).await
    }

    /// Scan past a completed record
    pub async fn add_address(
        &self,
        device: &DeviceDescriptor,
        coin: Coin,
    ) -> Result<DiscoveryStatus, DiscoveryError> {
        self.discover(device, coin, true).await
    }

    /// Interrupt the running records of `key`; returns how many were touched
    ///
    /// Failed and waiting records keep their index so a later `start` or
    /// `restore` resumes them.
    pub fn stop(&self, key: &DeviceKey) -> usize {
        let mut changed = Vec::new();
        {
            let mut entries = self.lock();
            for ((entry_key, coin), entry) in entries.iter_mut() {
                if entry_key != key || !entry.record.is_running() {
                    continue;
                }
                interrupt(entry);
                changed.push(*coin);
            }
        }

        for coin in &changed {
            log::info!("Discovery of {} on {} interrupted", coin, key);
            self.emit_status(key, *coin, DiscoveryStatus::Interrupted);
        }
        changed.len()
    }

    /// Resume every record that was waiting for this device to come back
    pub async fn restore(
        &self,
        device: &DeviceDescriptor,
    ) -> Result<Vec<(Coin, Result<DiscoveryStatus, DiscoveryError>)>, DiscoveryError> {
        let key = device.key()?;
        let mut waiting: Vec<Coin> = self
            .lock()
            .iter()
            .filter(|((entry_key, _), entry)| *entry_key == key && entry.record.waiting_for_device)
            .map(|((_, coin), _)| *coin)
            .collect();
        waiting.sort_by_key(|coin| coin.symbol());

        let mut results = Vec::with_capacity(waiting.len());
        for coin in waiting {
            log::info!("Restoring discovery of {} on {}", coin, key);
            results.push((coin, self.start(device, coin).await));
        }
        Ok(results)
    }

    /// Drop every record of `key`, interrupting runs still in progress
    pub fn forget(&self, key: &DeviceKey) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|(entry_key, _), entry| {
            if entry_key == key {
                entry.interrupt.store(true, Ordering::SeqCst);
                false
            } else {
                true
            }
        });
        let removed = before - entries.len();
        if removed > 0 {
            log::info!("Forgot {} discovery records of {}", removed, key);
        }
        removed
    }

    /// Re-query balance and nonce of every discovered address
    ///
    /// Successful answers are applied even if some lookups fail; the first
    /// failure is then returned. Fields already populated never go back to
    /// unknown.
    pub async fn refresh(
        &self,
        key: &DeviceKey,
        coin: Coin,
    ) -> Result<Vec<AccountInfo>, DiscoveryError> {
        let backend = self.backend(coin)?;
        let addresses: Vec<String> = self
            .record(key, coin)
            .ok_or_else(|| DiscoveryError::NotFound(format!("{} on {}", coin, key)))?
            .addresses
            .into_iter()
            .map(|a| a.address)
            .collect();

        let lookups = addresses.iter().map(|address| backend.account_info(address));
        let results = futures::future::join_all(lookups).await;

        let mut fresh = Vec::new();
        let mut first_error = None;
        for result in results {
            match result {
                Ok(info) => fresh.push(info),
                Err(e) => {
                    log::warn!("Refresh of {} on {} failed: {}", coin, key, e);
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Some(entry) = self.lock().get_mut(&(key.clone(), coin)) {
            for info in &fresh {
                if let Some(record) = entry
                    .record
                    .addresses
                    .iter_mut()
                    .find(|a| a.address.eq_ignore_ascii_case(&info.address))
                {
                    record.apply(info);
                }
            }
        }

        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(fresh),
        }
    }

    pub fn record(&self, key: &DeviceKey, coin: Coin) -> Option<DiscoveryRecord> {
        self.lock()
            .get(&(key.clone(), coin))
            .map(|entry| entry.record.clone())
    }

    pub fn records(&self) -> Vec<DiscoveryRecord> {
        let mut records: Vec<DiscoveryRecord> =
            self.lock().values().map(|entry| entry.record.clone()).collect();
        records.sort_by(|a, b| {
            (&a.device_key.device_id, a.coin.symbol()).cmp(&(&b.device_key.device_id, b.coin.symbol()))
        });
        records
    }

    pub fn records_for_coin(&self, coin: Coin) -> Vec<DiscoveryRecord> {
        self.records().into_iter().filter(|r| r.coin == coin).collect()
    }

    /// Rehydrate records, e.g. from a snapshot; a run cut short by a restart is interrupted
    pub fn load(&self, records: Vec<DiscoveryRecord>) {
        let mut entries = self.lock();
        for mut record in records {
            if record.is_running() {
                record.set_status(DiscoveryStatus::Interrupted);
            }
            let replaced = entries.insert(
                (record.device_key.clone(), record.coin),
                Entry::new(record),
            );
            // a run still holding the old token must stop writing
            if let Some(old) = replaced {
                old.interrupt.store(true, Ordering::SeqCst);
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.inner.events.subscribe()
    }

    async fn discover(
        &self,
        device: &DeviceDescriptor,
        coin: Coin,
        ignore_completed: bool,
    ) -> Result<DiscoveryStatus, DiscoveryError> {
        let key = device.key()?;
        let backend = self.backend(coin)?;

        let run = match self.prepare(device, &key, coin, ignore_completed) {
            Ok(run) => run,
            Err(status) => return Ok(status),
        };

        let session = self
            .inner
            .sessions
            .acquire(&device.path, SessionOwner::Discovery)
            .await;

        let outcome = self.run(device, &run, backend.as_ref()).await;
        session.release();

        match outcome {
            Ok(Outcome::Completed)
                if self.update(&run, |record| record.set_status(DiscoveryStatus::Completed)) =>
            {
                log::info!("Discovery of {} on {} completed", coin, key);
                self.emit_status(&key, coin, DiscoveryStatus::Completed);
                Ok(DiscoveryStatus::Completed)
            }
            Ok(_) => Ok(DiscoveryStatus::Interrupted),
            Err(_) if self.is_interrupted(&run) => Ok(DiscoveryStatus::Interrupted),
            Err(e) => {
                log::error!("Discovery of {} on {} failed: {}", coin, key, e);
                let fault = DiscoveryFault::from(&e);
                let updated = self.update(&run, |record| {
                    record.set_status(DiscoveryStatus::Failed);
                    record.last_fault = Some(fault);
                });
                if updated {
                    self.emit_status(&key, coin, DiscoveryStatus::Failed);
                }
                Err(e)
            }
        }
    }

    /// Decide how to run, mark the record running and interrupt the device's other coins
    ///
    /// `Err` carries the status to report when there is nothing to run.
    fn prepare(
        &self,
        device: &DeviceDescriptor,
        key: &DeviceKey,
        coin: Coin,
        ignore_completed: bool,
    ) -> Result<Run, DiscoveryStatus> {
        let id = (key.clone(), coin);
        let mut interrupted = Vec::new();

        let run = {
            let mut entries = self.lock();

            let entry = entries
                .entry(id.clone())
                .or_insert_with(|| Entry::new(DiscoveryRecord::new(coin, key.clone())));
            let record = &entry.record;

            if record.is_running() {
                return Err(DiscoveryStatus::Running);
            }
            if record.completed && !ignore_completed {
                return Err(DiscoveryStatus::Completed);
            }
            if !device.connected && !record.completed {
                entry.record.set_status(DiscoveryStatus::WaitingForDevice);
                drop(entries);
                log::info!("Discovery of {} waits for device {}", coin, key);
                self.emit_status(key, coin, DiscoveryStatus::WaitingForDevice);
                return Err(DiscoveryStatus::WaitingForDevice);
            }

            let plan = if record.interrupted
                || record.extended_public_key.is_none()
                || record.has_consistency_fault()
            {
                Plan::Begin
            } else if record.completed {
                Plan::Extend
            } else {
                Plan::Resume
            };

            let token = Arc::new(AtomicBool::new(false));
            entry.interrupt = Arc::clone(&token);
            entry.record.set_status(DiscoveryStatus::Running);

            for ((other_key, other_coin), other) in entries.iter_mut() {
                if other_key == key && *other_coin != coin && other.record.is_running() {
                    interrupt(other);
                    interrupted.push(*other_coin);
                }
            }

            Run { id, token, plan }
        };

        for other in interrupted {
            log::info!("Discovery of {} on {} interrupted for {}", other, key, coin);
            self.emit_status(key, other, DiscoveryStatus::Interrupted);
        }
        log::info!("Discovery of {} on {} running ({:?})", coin, key, run.plan);
        self.emit_status(key, coin, DiscoveryStatus::Running);
        Ok(run)
    }

    async fn run(
        &self,
        device: &DeviceDescriptor,
        run: &Run,
        backend: &dyn AccountSource,
    ) -> Result<Outcome, DiscoveryError> {
        let (key, coin) = (&run.id.0, run.id.1);
        let base_path = DerivationPath::from_str(coin.bip44_path())
            .map_err(|e| DiscoveryError::Derivation(e.to_string()))?;
        let options = device.session_options(true);

        if self.is_interrupted(run) {
            return Ok(Outcome::Interrupted);
        }

        let sequencer = match run.plan {
            Plan::Begin => {
                let sequencer = self.begin(&base_path, &options).await?;
                if self.is_interrupted(run) {
                    return Ok(Outcome::Interrupted);
                }
                let xpub = sequencer.extended_public_key();
                if !self.update(run, |record| record.reset(xpub)) {
                    return Ok(Outcome::Interrupted);
                }
                sequencer
            }
            Plan::Resume | Plan::Extend => {
                let record = self
                    .record(key, coin)
                    .ok_or_else(|| DiscoveryError::NotFound(format!("{} on {}", coin, key)))?;
                let xpub = record
                    .extended_public_key
                    .ok_or_else(|| DiscoveryError::InvalidPublicKey("missing".into()))?;
                if run.plan == Plan::Extend {
                    self.update(run, |record| record.current_index += 1);
                }
                AddressSequencer::from_xpub_str(&xpub, base_path.clone())?
            }
        };

        loop {
            if self.is_interrupted(run) {
                return Ok(Outcome::Interrupted);
            }
            let index = match self.record(key, coin) {
                Some(record) => record.current_index,
                None => return Ok(Outcome::Interrupted),
            };

            let derived = sequencer.derive(index)?;
            let address = self.inner.verifier.verify(&options, &derived).await?;
            if self.is_interrupted(run) {
                return Ok(Outcome::Interrupted);
            }

            let info = backend.account_info(&address).await?;
            if self.is_interrupted(run) {
                return Ok(Outcome::Interrupted);
            }
            let empty = info.is_empty()?;

            let mut entry = AddressRecord {
                index,
                path: derived.address_n(),
                address,
                balance: None,
                nonce: None,
            };
            entry.apply(&info);

            let added = entry.clone();
            let appended = self.update(run, move |record| {
                record.addresses.retain(|a| a.index != index);
                record.addresses.push(entry);
                if !empty {
                    record.current_index = index + 1;
                }
            });
            if !appended {
                return Ok(Outcome::Interrupted);
            }
            log::debug!("{} #{} {} (empty: {})", coin, index, added.address, empty);
            self.emit(DiscoveryEvent::AddressAdded {
                device_key: key.clone(),
                coin,
                address: added,
            });

            if empty {
                break;
            }
        }

        // one last call without keep_session hands the device session back
        let release = SessionOptions {
            keep_session: false,
            ..options
        };
        if let Err(e) = self.inner.device.derive_public_key(&base_path, &release).await {
            log::warn!("Could not release device session of {}: {}", key, e);
        }
        Ok(Outcome::Completed)
    }

    /// Fetch the account public key and keep the device session open
    async fn begin(
        &self,
        base_path: &DerivationPath,
        options: &SessionOptions,
    ) -> Result<AddressSequencer, DiscoveryError> {
        let response = self.inner.device.derive_public_key(base_path, options).await?;
        match response.xpub {
            Some(xpub) => AddressSequencer::from_xpub_str(&xpub, base_path.clone()),
            None => AddressSequencer::from_public_key(
                &response.public_key,
                &response.chain_code,
                base_path.clone(),
            ),
        }
    }

    fn is_interrupted(&self, run: &Run) -> bool {
        run.token.load(Ordering::SeqCst)
    }

    /// Mutate the record only while `run` still owns it and was not interrupted
    fn update(&self, run: &Run, change: impl FnOnce(&mut DiscoveryRecord)) -> bool {
        let mut entries = self.lock();
        match entries.get_mut(&run.id) {
            Some(entry) if entry.owned_by(&run.token) && !self.is_interrupted(run) => {
                change(&mut entry.record);
                true
            }
            _ => false,
        }
    }

    fn backend(&self, coin: Coin) -> Result<Arc<dyn AccountSource>, DiscoveryError> {
        self.inner
            .backends
            .get(&coin)
            .cloned()
            .ok_or(DiscoveryError::NoBackend(coin))
    }

    fn emit_status(&self, key: &DeviceKey, coin: Coin, status: DiscoveryStatus) {
        self.emit(DiscoveryEvent::StatusChanged {
            device_key: key.clone(),
            coin,
            status,
        });
    }

    fn emit(&self, event: DiscoveryEvent) {
        let _ = self.inner.events.send(event);
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<RecordId, Entry>> {
        self.inner
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn interrupt(entry: &mut Entry) {
    entry.interrupt.store(true, Ordering::SeqCst);
    entry.record.set_status(DiscoveryStatus::Interrupted);
}
