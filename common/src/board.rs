use std::time::Duration;

use log::{info, warn};

use crate::{
    config::Config,
    connection::{ConnectionManager, ConnectionPolicy, ConnectionReport, Radio},
    error::{BoardError, RadioError},
    gpio::Gpio,
    indicator::{reassign_indicator, Indicator},
    relay::RelayController,
    store::{Applied, ConfigStore, StorageBackend},
};

/// Everything the firmware mutates: the config, its store and the hardware handles.
pub struct Board<G: Gpio, B> {
    pub config: Config,
    pub store: ConfigStore<B>,
    pub relays: RelayController<G>,
    indicator: Option<Indicator<G::Output>>,
    connectivity: Option<ConnectionReport>,
}

impl<G: Gpio, B: StorageBackend> Board<G, B> {
    /// Loads the config, lights the indicator and restores every relay.
    pub fn boot(mut gpio: G, store: ConfigStore<B>) -> Self {
        let config = store.load();
        info!(
            "config loaded: {} saved networks, {} relays, indicator GPIO{}",
            config.networks.len(),
            config.relays.len(),
            config.indicator_pin
        );

        let indicator = match Indicator::claim(&mut gpio, config.indicator_pin) {
            Ok(indicator) => Some(indicator),
            Err(err) => {
                warn!("indicator unavailable: {err}");
                None
            }
        };

        let mut relays = RelayController::new(gpio);
        let restored = relays.restore(&config);
        if restored < config.relays.len() {
            warn!(
                "{} of {} relays could not be restored",
                config.relays.len() - restored,
                config.relays.len()
            );
        }

        Self {
            config,
            store,
            relays,
            indicator,
            connectivity: None,
        }
    }

    /// Runs the connection state machine once and keeps its report.
    pub fn connect<R, D>(
        &mut self,
        radio: &mut R,
        policy: ConnectionPolicy,
        delay: D,
    ) -> Result<&ConnectionReport, RadioError>
    where
        R: Radio,
        D: FnMut(Duration),
    {
        if let Some(indicator) = self.indicator.as_mut() {
            indicator.show_searching();
        }
        let report = ConnectionManager::new(policy).run(
            radio,
            &self.config.networks,
            self.indicator.as_mut(),
            delay,
        )?;
        Ok(self.connectivity.insert(report))
    }

    pub fn connectivity(&self) -> Option<&ConnectionReport> {
        self.connectivity.as_ref()
    }

    pub fn indicator(&self) -> Option<&Indicator<G::Output>> {
        self.indicator.as_ref()
    }

    pub fn set_indicator_pin(&mut self, pin: u8) -> Result<Applied, BoardError> {
        reassign_indicator(
            self.relays.gpio_mut(),
            &mut self.indicator,
            &mut self.config,
            &self.store,
            pin,
        )
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        config::NetworkCredential,
        connection::{ConnectionState, ScanEntry},
        sim::{MemoryBackend, PinMode, SimGpio, SimRadio},
    };

    #[test]
    fn boot_restores_state_written_before_power_cycle() {
        let backend = MemoryBackend::default();
        {
            let mut board = Board::boot(SimGpio::default(), ConfigStore::new(backend.clone()));
            board
                .relays
                .add(&mut board.config, &board.store, "heater", 14)
                .unwrap();
            board
                .relays
                .set_state(&mut board.config, &board.store, "heater", true)
                .unwrap();
        }

        let gpio = SimGpio::default();
        let board = Board::boot(gpio.clone(), ConfigStore::new(backend));

        assert_eq!(gpio.mode(14), Some(PinMode::Output(true)));
        assert!(board.config.relays["heater"].state);
        assert_eq!(board.relays.level("heater"), Some(true));
        assert!(board.indicator().is_some_and(|led| led.is_lit()));
    }

    #[test]
    fn connect_records_report() {
        let backend = MemoryBackend::default();
        let mut board = Board::boot(SimGpio::default(), ConfigStore::new(backend));
        board.config.networks.insert(
            "home".into(),
            NetworkCredential {
                ssid: "home".into(),
                password: "pw".into(),
            },
        );
        let mut radio = SimRadio::new([0; 6]);
        radio.set_scan(vec![ScanEntry {
            ssid: "home".into(),
            rssi: -55,
            encrypted: true,
        }]);
        radio.accept("home", "pw");

        let state = board
            .connect(&mut radio, ConnectionPolicy::default(), |_| {})
            .unwrap()
            .state
            .clone();

        assert_eq!(state, ConnectionState::Connected);
        assert!(board.connectivity().is_some());
        assert!(board.indicator().is_some_and(|led| !led.is_lit()));
    }

    #[test]
    fn indicator_pin_change_survives_reboot() {
        let backend = MemoryBackend::default();
        let mut board = Board::boot(SimGpio::default(), ConfigStore::new(backend.clone()));
        board.set_indicator_pin(21).unwrap();

        let gpio = SimGpio::default();
        let board = Board::boot(gpio.clone(), ConfigStore::new(backend));
        assert_eq!(board.config.indicator_pin, 21);
        assert_eq!(gpio.mode(21), Some(PinMode::Output(false)));
    }

    #[test]
    fn access_point_failure_reaches_boot() {
        let mut board = Board::boot(
            SimGpio::default(),
            ConfigStore::new(MemoryBackend::default()),
        );
        let mut radio = SimRadio::new([0; 6]);
        radio.fail_access_point(true);

        let result = board.connect(&mut radio, ConnectionPolicy::default(), |_| {});

        assert!(result.is_err());
        assert!(board.connectivity().is_none());
        assert!(board.indicator().is_some_and(|led| led.is_lit()));
    }
}
