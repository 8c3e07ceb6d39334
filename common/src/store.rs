use log::{info, warn};
use serde::{de::DeserializeOwned, Serialize};

use crate::{
    config::{Config, IndicatorTable, NetworkCredential, NetworksTable, RelaysTable},
    error::{BoardError, StoreError, ValidationError},
};

pub const TABLE_NETWORKS: &str = "networks";
pub const TABLE_RELAYS: &str = "relays";
pub const TABLE_INDICATOR: &str = "indicator";

/// Byte storage keyed by table name. One document per table.
pub trait StorageBackend {
    fn read(&self, table: &str) -> Result<Option<Vec<u8>>, StoreError>;
    fn write(&self, table: &str, payload: &[u8]) -> Result<(), StoreError>;
}

/// A mutation that was applied to the in-memory config and hardware.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied {
    pub message: String,
    /// False when the change is live but the last durable snapshot predates it.
    pub persisted: bool,
}

pub struct ConfigStore<B> {
    backend: B,
}

impl<B: StorageBackend> ConfigStore<B> {
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Never fails: unreadable tables fall back to their defaults, and relays
    /// that break the pin/key invariants are dropped.
    pub fn load(&self) -> Config {
        let networks: NetworksTable = self.load_table(TABLE_NETWORKS);
        let relays: RelaysTable = self.load_table(TABLE_RELAYS);
        let indicator: IndicatorTable = self.load_table(TABLE_INDICATOR);

        let mut config = Config::from_tables(networks, relays, indicator);
        for entry in config.repair() {
            warn!("persisted config: dropped conflicting {entry}");
        }
        config
    }

    /// Writes every table. All tables are encoded and the previous contents
    /// read before the first write; if a write fails, the tables already
    /// written are put back so storage keeps the last successful save.
    pub fn save(&self, config: &Config) -> Result<(), StoreError> {
        let blank = Config::default();
        let tables = [
            (
                TABLE_NETWORKS,
                encode(&config.networks_table())?,
                encode(&blank.networks_table())?,
            ),
            (
                TABLE_RELAYS,
                encode(&config.relays_table())?,
                encode(&blank.relays_table())?,
            ),
            (
                TABLE_INDICATOR,
                encode(&config.indicator_table())?,
                encode(&blank.indicator_table())?,
            ),
        ];

        let mut previous = Vec::with_capacity(tables.len());
        for (table, _, empty) in &tables {
            previous.push(self.backend.read(table)?.unwrap_or_else(|| empty.clone()));
        }

        for (index, (table, payload, _)) in tables.iter().enumerate() {
            if let Err(err) = self.backend.write(table, payload) {
                for ((written, _, _), old) in tables[..index].iter().zip(&previous) {
                    if let Err(undo) = self.backend.write(written, old) {
                        warn!("failed to restore config table `{written}`: {undo}");
                    }
                }
                return Err(err);
            }
        }
        Ok(())
    }

    /// Saves and downgrades a failure to a logged warning.
    pub fn persist(&self, config: &Config) -> bool {
        match self.save(config) {
            Ok(()) => true,
            Err(err) => {
                warn!("failed to persist config, last saved snapshot is stale: {err}");
                false
            }
        }
    }

    pub(crate) fn commit(&self, config: &Config, message: String) -> Applied {
        info!("{message}");
        Applied {
            persisted: self.persist(config),
            message,
        }
    }

    pub fn add_network(
        &self,
        config: &mut Config,
        ssid: &str,
        password: &str,
    ) -> Result<Applied, BoardError> {
        if ssid.is_empty() {
            return Err(ValidationError::invalid("ssid", "must not be empty").into());
        }
        if config.networks.contains_key(ssid) {
            return Err(BoardError::Conflict(format!("SSID [{ssid}] already exists")));
        }

        config.networks.insert(
            ssid.to_string(),
            NetworkCredential {
                ssid: ssid.to_string(),
                password: password.to_string(),
            },
        );
        Ok(self.commit(config, format!("SSID [{ssid}] added")))
    }

    pub fn edit_network(
        &self,
        config: &mut Config,
        ssid: &str,
        password: &str,
    ) -> Result<Applied, BoardError> {
        let Some(network) = config.networks.get_mut(ssid) else {
            return Err(BoardError::NotFound(format!("SSID [{ssid}] not found")));
        };
        if network.password == password {
            return Err(BoardError::NoOp(format!(
                "Password for [{ssid}] is the same"
            )));
        }

        network.password = password.to_string();
        Ok(self.commit(config, format!("Password for [{ssid}] changed")))
    }

    pub fn delete_network(&self, config: &mut Config, ssid: &str) -> Result<Applied, BoardError> {
        if config.networks.remove(ssid).is_none() {
            return Err(BoardError::NotFound(format!("SSID [{ssid}] not found")));
        }
        Ok(self.commit(config, format!("SSID [{ssid}] removed")))
    }

    fn load_table<T: DeserializeOwned + Default>(&self, table: &str) -> T {
        match self.backend.read(table) {
            Ok(Some(raw)) => serde_json::from_slice(&raw).unwrap_or_else(|err| {
                warn!("config table `{table}` is unreadable ({err}); using defaults");
                T::default()
            }),
            Ok(None) => {
                info!("config table `{table}` not found; using defaults");
                T::default()
            }
            Err(err) => {
                warn!("failed to read config table `{table}` ({err}); using defaults");
                T::default()
            }
        }
    }
}

fn encode<T: Serialize>(table: &T) -> Result<Vec<u8>, StoreError> {
    Ok(serde_json::to_vec(table)?)
}
