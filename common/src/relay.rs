use std::collections::BTreeMap;

use log::{info, warn};

use crate::{
    config::{Config, PinOwner, RelayDefinition},
    error::{BoardError, ValidationError},
    gpio::{Gpio, RuntimeHandle},
    store::{Applied, ConfigStore, StorageBackend},
};

/// Owns the output handle of every relay. Definitions live in [`Config`].
pub struct RelayController<G: Gpio> {
    gpio: G,
    handles: BTreeMap<String, RuntimeHandle<G::Output>>,
}

impl<G: Gpio> RelayController<G> {
    pub fn new(gpio: G) -> Self {
        Self {
            gpio,
            handles: BTreeMap::new(),
        }
    }

    pub fn gpio_mut(&mut self) -> &mut G {
        &mut self.gpio
    }

    /// Live level of a relay output, if one is bound.
    pub fn level(&self, name: &str) -> Option<bool> {
        self.handles.get(name).map(RuntimeHandle::level)
    }

    /// Binds an output for every persisted relay at its last persisted state.
    /// Relays whose pin cannot be claimed are skipped and retried on first use.
    pub fn restore(&mut self, config: &Config) -> usize {
        self.handles.clear();
        for relay in config.relays.values() {
            match RuntimeHandle::claim(&mut self.gpio, relay.pin, relay.state) {
                Ok(handle) => {
                    info!(
                        "relay [{}] restored on GPIO{} state {}",
                        relay.name,
                        relay.pin,
                        u8::from(relay.state)
                    );
                    self.handles.insert(relay.name.clone(), handle);
                }
                Err(err) => warn!("relay [{}] not restored: {err}", relay.name),
            }
        }
        self.handles.len()
    }

    pub fn add<B: StorageBackend>(
        &mut self,
        config: &mut Config,
        store: &ConfigStore<B>,
        name: &str,
        pin: u8,
    ) -> Result<Applied, BoardError> {
        if name.is_empty() {
            return Err(ValidationError::invalid("name", "must not be empty").into());
        }
        if config.relays.contains_key(name) {
            return Err(BoardError::Conflict(format!(
                "Relay [{name}] already exists"
            )));
        }
        ensure_pin_free(config, pin)?;

        let handle = RuntimeHandle::claim(&mut self.gpio, pin, false)?;
        self.handles.insert(name.to_string(), handle);
        config.relays.insert(
            name.to_string(),
            RelayDefinition {
                name: name.to_string(),
                pin,
                state: false,
            },
        );
        Ok(store.commit(config, format!("Added relay [{name}] pin [{pin}]")))
    }

    pub fn change_pin<B: StorageBackend>(
        &mut self,
        config: &mut Config,
        store: &ConfigStore<B>,
        name: &str,
        pin: u8,
    ) -> Result<Applied, BoardError> {
        let Some(relay) = config.relays.get(name) else {
            return Err(not_found(name));
        };
        if relay.pin == pin {
            return Err(BoardError::NoOp(format!(
                "Relay [{name}] pin is already [{pin}]"
            )));
        }
        ensure_pin_free(config, pin)?;

        let old_pin = relay.pin;
        let state = relay.state;
        let handle = RuntimeHandle::claim(&mut self.gpio, pin, state)?;
        // Release the old driver before parking its pin.
        drop(self.handles.insert(name.to_string(), handle));
        if let Err(err) = self.gpio.quiesce(old_pin) {
            warn!("failed to quiesce GPIO{old_pin}: {err}");
        }

        if let Some(relay) = config.relays.get_mut(name) {
            relay.pin = pin;
        }
        Ok(store.commit(config, format!("Relay [{name}] pin changed to [{pin}]")))
    }

    pub fn delete<B: StorageBackend>(
        &mut self,
        config: &mut Config,
        store: &ConfigStore<B>,
        name: &str,
    ) -> Result<Applied, BoardError> {
        let Some(relay) = config.relays.remove(name) else {
            return Err(not_found(name));
        };

        drop(self.handles.remove(name));
        if let Err(err) = self.gpio.quiesce(relay.pin) {
            warn!("failed to quiesce GPIO{}: {err}", relay.pin);
        }
        Ok(store.commit(config, format!("Relay [{name}] removed")))
    }

    /// `NoOp` when the relay already holds `state`; the config field is authoritative.
    pub fn set_state<B: StorageBackend>(
        &mut self,
        config: &mut Config,
        store: &ConfigStore<B>,
        name: &str,
        state: bool,
    ) -> Result<Applied, BoardError> {
        let Some(relay) = config.relays.get_mut(name) else {
            return Err(not_found(name));
        };
        let level = u8::from(state);
        if relay.state == state && self.handles.contains_key(name) {
            return Err(BoardError::NoOp(format!(
                "Relay [{name}] state is already [{level}]"
            )));
        }

        match self.handles.get_mut(name) {
            Some(handle) => handle.set(state)?,
            None => {
                let handle = RuntimeHandle::claim(&mut self.gpio, relay.pin, state)?;
                self.handles.insert(name.to_string(), handle);
            }
        }
        relay.state = state;
        Ok(store.commit(config, format!("Relay [{name}] state changed to [{level}]")))
    }
}

pub(crate) fn ensure_pin_free(config: &Config, pin: u8) -> Result<(), BoardError> {
    match config.pin_owner(pin) {
        None => Ok(()),
        Some(PinOwner::Indicator) => Err(BoardError::Conflict(format!(
            "Pin [{pin}] is used by the indicator"
        ))),
        Some(PinOwner::Relay(owner)) => Err(BoardError::Conflict(format!(
            "Pin [{pin}] is used by relay [{owner}]"
        ))),
    }
}

fn not_found(name: &str) -> BoardError {
    BoardError::NotFound(format!("Relay [{name}] not found"))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::sim::{MemoryBackend, PinMode, SimGpio};

    struct Fixture {
        gpio: SimGpio,
        backend: MemoryBackend,
        config: Config,
        store: ConfigStore<MemoryBackend>,
        relays: RelayController<SimGpio>,
    }

    fn fixture() -> Fixture {
        let gpio = SimGpio::default();
        let backend = MemoryBackend::default();
        Fixture {
            relays: RelayController::new(gpio.clone()),
            store: ConfigStore::new(backend.clone()),
            config: Config::default(),
            gpio,
            backend,
        }
    }

    #[test]
    fn set_state_twice_reports_change_then_noop() {
        let mut f = fixture();
        f.relays.add(&mut f.config, &f.store, "5", 10).unwrap();

        let first = f.relays.set_state(&mut f.config, &f.store, "5", true);
        assert!(first.is_ok());
        assert_eq!(f.gpio.mode(10), Some(PinMode::Output(true)));

        let second = f.relays.set_state(&mut f.config, &f.store, "5", true);
        assert!(matches!(second, Err(BoardError::NoOp(_))));
        assert_eq!(f.gpio.mode(10), Some(PinMode::Output(true)));
        assert!(f.store.load().relays["5"].state);
    }

    #[test]
    fn add_rejects_existing_name_regardless_of_pin() {
        let mut f = fixture();
        f.relays.add(&mut f.config, &f.store, "a", 10).unwrap();

        for pin in [10, 11] {
            assert!(matches!(
                f.relays.add(&mut f.config, &f.store, "a", pin),
                Err(BoardError::Conflict(_))
            ));
        }
        assert_eq!(f.config.relays.len(), 1);
    }

    #[test]
    fn add_rejects_pin_already_in_use() {
        let mut f = fixture();
        f.relays.add(&mut f.config, &f.store, "a", 10).unwrap();

        assert!(matches!(
            f.relays.add(&mut f.config, &f.store, "b", 10),
            Err(BoardError::Conflict(_))
        ));
        let led = f.config.indicator_pin;
        assert!(matches!(
            f.relays.add(&mut f.config, &f.store, "b", led),
            Err(BoardError::Conflict(_))
        ));
        assert!(f.config.validate().is_ok());
    }

    #[test]
    fn add_hardware_failure_registers_nothing() {
        let mut f = fixture();
        f.gpio.fail_pin(33);

        let err = f.relays.add(&mut f.config, &f.store, "x", 33).unwrap_err();
        assert_eq!(err.status(), 500);
        assert!(f.config.relays.is_empty());
        assert_eq!(f.relays.level("x"), None);
        assert!(f.backend.get(crate::store::TABLE_RELAYS).is_none());
    }

    #[test]
    fn change_pin_moves_state_and_parks_old_pin() {
        let mut f = fixture();
        f.relays.add(&mut f.config, &f.store, "a", 10).unwrap();
        f.relays.set_state(&mut f.config, &f.store, "a", true).unwrap();

        f.relays.change_pin(&mut f.config, &f.store, "a", 12).unwrap();

        assert_eq!(f.gpio.mode(12), Some(PinMode::Output(true)));
        assert_eq!(f.gpio.mode(10), Some(PinMode::Input));
        assert_eq!(f.store.load().relays["a"].pin, 12);
        assert!(matches!(
            f.relays.change_pin(&mut f.config, &f.store, "a", 12),
            Err(BoardError::NoOp(_))
        ));
        assert!(matches!(
            f.relays.change_pin(&mut f.config, &f.store, "zz", 1),
            Err(BoardError::NotFound(_))
        ));
    }

    #[test]
    fn delete_parks_pin_and_forgets_relay() {
        let mut f = fixture();
        f.relays.add(&mut f.config, &f.store, "a", 10).unwrap();
        f.relays.set_state(&mut f.config, &f.store, "a", true).unwrap();

        f.relays.delete(&mut f.config, &f.store, "a").unwrap();

        assert_eq!(f.gpio.mode(10), Some(PinMode::Input));
        assert!(f.store.load().relays.is_empty());
        assert!(matches!(
            f.relays.delete(&mut f.config, &f.store, "a"),
            Err(BoardError::NotFound(_))
        ));
    }

    #[test]
    fn restore_drives_persisted_levels() {
        let mut f = fixture();
        f.relays.add(&mut f.config, &f.store, "a", 10).unwrap();
        f.relays.add(&mut f.config, &f.store, "b", 11).unwrap();
        f.relays.set_state(&mut f.config, &f.store, "b", true).unwrap();

        let gpio = SimGpio::default();
        let mut rebooted = RelayController::new(gpio.clone());
        let restored = rebooted.restore(&f.store.load());

        assert_eq!(restored, 2);
        assert_eq!(gpio.mode(10), Some(PinMode::Output(false)));
        assert_eq!(gpio.mode(11), Some(PinMode::Output(true)));
    }

    #[test]
    fn unrestored_relay_is_claimed_on_first_write() {
        let mut f = fixture();
        f.relays.add(&mut f.config, &f.store, "a", 10).unwrap();

        let gpio = SimGpio::default();
        gpio.fail_pin(10);
        let mut rebooted = RelayController::new(gpio.clone());
        assert_eq!(rebooted.restore(&f.config), 0);

        gpio.clear_failures();
        rebooted
            .set_state(&mut f.config, &f.store, "a", false)
            .unwrap();
        assert_eq!(gpio.mode(10), Some(PinMode::Output(false)));
    }
}
