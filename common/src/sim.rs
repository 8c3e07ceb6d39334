//! In-memory stand-ins for the board's GPIO, radio and flash, used by host
//! builds and tests.

use std::{
    collections::{BTreeMap, BTreeSet},
    net::Ipv4Addr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use log::debug;

use crate::{
    connection::{AccessPointConfig, IpInfo, LinkStatus, Radio, ScanEntry},
    error::{HardwareError, RadioError, StoreError},
    gpio::{Gpio, OutputPin},
    store::StorageBackend,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinMode {
    Output(bool),
    Input,
}

#[derive(Debug, Default)]
struct PinBank {
    modes: BTreeMap<u8, PinMode>,
    failing: BTreeSet<u8>,
}

/// Shared view of simulated pins; clones observe the same bank.
#[derive(Debug, Clone, Default)]
pub struct SimGpio {
    bank: Arc<Mutex<PinBank>>,
}

impl SimGpio {
    pub fn mode(&self, pin: u8) -> Option<PinMode> {
        lock(&self.bank).modes.get(&pin).copied()
    }

    /// Makes every later claim of `pin` fail.
    pub fn fail_pin(&self, pin: u8) {
        lock(&self.bank).failing.insert(pin);
    }

    pub fn clear_failures(&self) {
        lock(&self.bank).failing.clear();
    }
}

impl Gpio for SimGpio {
    type Output = SimPin;

    fn output(&mut self, pin: u8, high: bool) -> Result<SimPin, HardwareError> {
        let mut bank = lock(&self.bank);
        if bank.failing.contains(&pin) {
            return Err(HardwareError::new(pin, "pin unavailable"));
        }
        bank.modes.insert(pin, PinMode::Output(high));
        debug!("sim GPIO{pin} output {}", u8::from(high));
        Ok(SimPin {
            pin,
            bank: self.bank.clone(),
        })
    }

    fn quiesce(&mut self, pin: u8) -> Result<(), HardwareError> {
        lock(&self.bank).modes.insert(pin, PinMode::Input);
        debug!("sim GPIO{pin} input");
        Ok(())
    }
}

#[derive(Debug)]
pub struct SimPin {
    pin: u8,
    bank: Arc<Mutex<PinBank>>,
}

impl OutputPin for SimPin {
    fn set_level(&mut self, high: bool) -> Result<(), HardwareError> {
        let mut bank = lock(&self.bank);
        if bank.failing.contains(&self.pin) {
            return Err(HardwareError::new(self.pin, "write failed"));
        }
        bank.modes.insert(self.pin, PinMode::Output(high));
        debug!("sim GPIO{} -> {}", self.pin, u8::from(high));
        Ok(())
    }
}

/// Simulated station/AP radio.
///
/// Networks registered with [`SimRadio::accept`] join once the password
/// matches, [`SimRadio::refuse`] ones fail immediately, [`SimRadio::vanish`]
/// ones report the AP missing, and anything else never leaves `Connecting`.
#[derive(Debug, Clone)]
pub struct SimRadio {
    mac: [u8; 6],
    scan: Vec<ScanEntry>,
    accepted: BTreeMap<String, String>,
    refused: BTreeSet<String>,
    pending: Option<(String, String)>,
    joined: Option<String>,
    scans: u32,
    connects: Vec<String>,
    access_point: Option<AccessPointConfig>,
    scan_fails: bool,
    rejected: BTreeSet<String>,
    vanished: BTreeSet<String>,
    access_point_fails: bool,
}

impl SimRadio {
    pub fn new(mac: [u8; 6]) -> Self {
        Self {
            mac,
            scan: Vec::new(),
            accepted: BTreeMap::new(),
            refused: BTreeSet::new(),
            pending: None,
            joined: None,
            scans: 0,
            connects: Vec::new(),
            access_point: None,
            scan_fails: false,
            rejected: BTreeSet::new(),
            vanished: BTreeSet::new(),
            access_point_fails: false,
        }
    }

    pub fn set_scan(&mut self, scan: Vec<ScanEntry>) {
        self.scan = scan;
    }

    pub fn accept(&mut self, ssid: &str, password: &str) {
        self.accepted.insert(ssid.to_string(), password.to_string());
    }

    pub fn refuse(&mut self, ssid: &str) {
        self.refused.insert(ssid.to_string());
    }

    /// Makes the driver reject the connect call for `ssid` outright.
    pub fn reject_connect(&mut self, ssid: &str) {
        self.rejected.insert(ssid.to_string());
    }

    /// Keeps `ssid` in scan results but reports it gone once a join starts.
    pub fn vanish(&mut self, ssid: &str) {
        self.vanished.insert(ssid.to_string());
    }

    pub fn fail_scan(&mut self, fail: bool) {
        self.scan_fails = fail;
    }

    pub fn fail_access_point(&mut self, fail: bool) {
        self.access_point_fails = fail;
    }

    pub fn scan_count(&self) -> u32 {
        self.scans
    }

    pub fn connect_log(&self) -> &[String] {
        &self.connects
    }

    pub fn access_point(&self) -> Option<&AccessPointConfig> {
        self.access_point.as_ref()
    }
}

impl Radio for SimRadio {
    fn scan(&mut self) -> Result<Vec<ScanEntry>, RadioError> {
        self.scans += 1;
        if self.scan_fails {
            return Err(RadioError("scan aborted".into()));
        }
        Ok(self.scan.clone())
    }

    fn connect(&mut self, ssid: &str, password: &str) -> Result<(), RadioError> {
        self.connects.push(ssid.to_string());
        if self.rejected.contains(ssid) {
            return Err(RadioError(format!("driver rejected [{ssid}]")));
        }
        self.joined = None;
        self.pending = Some((ssid.to_string(), password.to_string()));
        Ok(())
    }

    fn status(&mut self) -> LinkStatus {
        let Some((ssid, password)) = &self.pending else {
            return if self.joined.is_some() {
                LinkStatus::GotIp
            } else {
                LinkStatus::Idle
            };
        };

        if self.vanished.contains(ssid) {
            return LinkStatus::NoApFound;
        }
        if self.refused.contains(ssid) {
            return LinkStatus::ConnectFailed;
        }
        match self.accepted.get(ssid) {
            Some(expected) if expected == password => {
                self.joined = Some(ssid.clone());
                self.pending = None;
                LinkStatus::GotIp
            }
            Some(_) => LinkStatus::WrongPassword,
            None => LinkStatus::Connecting,
        }
    }

    fn disconnect(&mut self) {
        self.pending = None;
        self.joined = None;
    }

    fn station_info(&mut self) -> Option<IpInfo> {
        self.joined.as_ref().map(|_| IpInfo {
            ip: Ipv4Addr::new(192, 168, 1, 50),
            netmask: Ipv4Addr::new(255, 255, 255, 0),
            gateway: Ipv4Addr::new(192, 168, 1, 1),
            dns: Some(Ipv4Addr::new(192, 168, 1, 1)),
        })
    }

    fn disable_access_point(&mut self) -> Result<(), RadioError> {
        self.access_point = None;
        Ok(())
    }

    fn start_access_point(&mut self, config: &AccessPointConfig) -> Result<(), RadioError> {
        if self.access_point_fails {
            return Err(RadioError("softAP did not start".into()));
        }
        self.access_point = Some(config.clone());
        Ok(())
    }

    fn mac_address(&mut self) -> Result<[u8; 6], RadioError> {
        Ok(self.mac)
    }
}

/// Table storage in memory. Clones share contents.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    tables: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
    fail_writes: Arc<AtomicBool>,
    failing_tables: Arc<Mutex<BTreeSet<String>>>,
}

impl MemoryBackend {
    pub fn get(&self, table: &str) -> Option<Vec<u8>> {
        lock(&self.tables).get(table).cloned()
    }

    pub fn put(&self, table: &str, payload: &[u8]) {
        lock(&self.tables).insert(table.to_string(), payload.to_vec());
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }

    /// Makes every later write of `table` fail; other tables still write.
    pub fn fail_table(&self, table: &str) {
        lock(&self.failing_tables).insert(table.to_string());
    }
}

impl StorageBackend for MemoryBackend {
    fn read(&self, table: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.get(table))
    }

    fn write(&self, table: &str, payload: &[u8]) -> Result<(), StoreError> {
        let rejected = self.fail_writes.load(Ordering::Relaxed)
            || lock(&self.failing_tables).contains(table);
        if rejected {
            return Err(StoreError::Backend(format!("flash write of `{table}` rejected")));
        }
        self.put(table, payload);
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // Pin and table state stays consistent across a panic; ignore poisoning.
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
