use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// On-board LED, lit while the device is searching for a network.
pub const DEFAULT_INDICATOR_PIN: u8 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkCredential {
    pub ssid: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayDefinition {
    pub name: String,
    pub pin: u8,
    pub state: bool,
}

impl RelayDefinition {
    pub fn record(&self) -> RelayRecord {
        RelayRecord {
            pin: self.pin,
            state: self.state,
        }
    }
}

/// Wire and storage shape of a relay: the name is the enclosing map key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayRecord {
    pub pin: u8,
    #[serde(with = "level")]
    pub state: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinOwner<'a> {
    Indicator,
    Relay(&'a str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub networks: BTreeMap<String, NetworkCredential>,
    pub relays: BTreeMap<String, RelayDefinition>,
    pub indicator_pin: u8,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            networks: BTreeMap::new(),
            relays: BTreeMap::new(),
            indicator_pin: DEFAULT_INDICATOR_PIN,
        }
    }
}

impl Config {
    pub fn pin_owner(&self, pin: u8) -> Option<PinOwner<'_>> {
        if pin == self.indicator_pin {
            return Some(PinOwner::Indicator);
        }
        self.relays
            .values()
            .find(|relay| relay.pin == pin)
            .map(|relay| PinOwner::Relay(relay.name.as_str()))
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.networks.keys().any(String::is_empty) {
            return Err(ValidationError::Invariant("empty ssid key".into()));
        }

        let mut pins = BTreeSet::from([self.indicator_pin]);
        for (key, relay) in &self.relays {
            if key.is_empty() {
                return Err(ValidationError::Invariant("empty relay name".into()));
            }
            if key != &relay.name {
                return Err(ValidationError::Invariant(format!(
                    "relay key [{key}] does not match name [{}]",
                    relay.name
                )));
            }
            if !pins.insert(relay.pin) {
                return Err(ValidationError::Invariant(format!(
                    "pin [{}] assigned more than once",
                    relay.pin
                )));
            }
        }
        Ok(())
    }

    /// Drops the entries that break the key and pin invariants and keeps the
    /// rest. Relays are visited in name order, so the first claimant of a pin
    /// wins; the indicator always keeps its pin. Returns what was dropped.
    pub(crate) fn repair(&mut self) -> Vec<String> {
        let mut dropped = Vec::new();
        if self.networks.remove("").is_some() {
            dropped.push("network with an empty ssid".to_string());
        }

        let mut pins = BTreeSet::from([self.indicator_pin]);
        self.relays.retain(|key, relay| {
            let keep = !key.is_empty() && key == &relay.name && pins.insert(relay.pin);
            if !keep {
                dropped.push(format!("relay [{key}] on pin [{}]", relay.pin));
            }
            keep
        });
        dropped
    }

    pub(crate) fn networks_table(&self) -> NetworksTable {
        NetworksTable {
            saved_nets: self
                .networks
                .values()
                .map(|net| (net.ssid.clone(), net.password.clone()))
                .collect(),
        }
    }

    pub(crate) fn relays_table(&self) -> RelaysTable {
        RelaysTable {
            relay_pins: self
                .relays
                .values()
                .map(|relay| (relay.name.clone(), relay.record()))
                .collect(),
        }
    }

    pub(crate) fn indicator_table(&self) -> IndicatorTable {
        IndicatorTable {
            custom_led_pin: self.indicator_pin,
        }
    }

    pub(crate) fn from_tables(
        networks: NetworksTable,
        relays: RelaysTable,
        indicator: IndicatorTable,
    ) -> Self {
        Self {
            networks: networks
                .saved_nets
                .into_iter()
                .map(|(ssid, password)| (ssid.clone(), NetworkCredential { ssid, password }))
                .collect(),
            relays: relays
                .relay_pins
                .into_iter()
                .map(|(name, record)| {
                    let relay = RelayDefinition {
                        name: name.clone(),
                        pin: record.pin,
                        state: record.state,
                    };
                    (name, relay)
                })
                .collect(),
            indicator_pin: indicator.custom_led_pin,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct NetworksTable {
    pub saved_nets: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct RelaysTable {
    pub relay_pins: BTreeMap<String, RelayRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct IndicatorTable {
    pub custom_led_pin: u8,
}

impl Default for IndicatorTable {
    fn default() -> Self {
        Self {
            custom_led_pin: DEFAULT_INDICATOR_PIN,
        }
    }
}

/// Relay levels are stored as `0`/`1`; booleans are accepted on read.
pub mod level {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Flag(bool),
        Number(i64),
    }

    pub fn serialize<S: Serializer>(state: &bool, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(u8::from(*state))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
        match Raw::deserialize(deserializer)? {
            Raw::Flag(flag) => Ok(flag),
            Raw::Number(0) => Ok(false),
            Raw::Number(1) => Ok(true),
            Raw::Number(other) => Err(D::Error::custom(format!(
                "relay state must be 0 or 1, got {other}"
            ))),
        }
    }
}
