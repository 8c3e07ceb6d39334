use log::warn;

use crate::{
    config::Config,
    error::{BoardError, HardwareError},
    gpio::{Gpio, OutputPin, RuntimeHandle},
    relay::ensure_pin_free,
    store::{Applied, ConfigStore, StorageBackend},
};

/// Connectivity LED. Active-low: the LED is lit while the pin is driven low.
#[derive(Debug)]
pub struct Indicator<P> {
    handle: RuntimeHandle<P>,
}

impl<P: OutputPin> Indicator<P> {
    /// Claims the pin with the LED lit, signalling "searching".
    pub fn claim<G: Gpio<Output = P>>(gpio: &mut G, pin: u8) -> Result<Self, HardwareError> {
        Ok(Self {
            handle: RuntimeHandle::claim(gpio, pin, false)?,
        })
    }

    pub fn pin(&self) -> u8 {
        self.handle.pin()
    }

    pub fn is_lit(&self) -> bool {
        !self.handle.level()
    }

    pub fn show_searching(&mut self) {
        self.drive(true);
    }

    pub fn clear(&mut self) {
        self.drive(false);
    }

    fn drive(&mut self, lit: bool) {
        if let Err(err) = self.handle.set(!lit) {
            warn!("indicator update failed: {err}");
        }
    }
}

/// Moves the indicator to `pin`, keeping its lit state and parking the old pin.
pub fn reassign_indicator<G: Gpio, B: StorageBackend>(
    gpio: &mut G,
    indicator: &mut Option<Indicator<G::Output>>,
    config: &mut Config,
    store: &ConfigStore<B>,
    pin: u8,
) -> Result<Applied, BoardError> {
    if config.indicator_pin == pin {
        return Err(BoardError::NoOp(format!(
            "Custom led pin is already [{pin}]"
        )));
    }
    ensure_pin_free(config, pin)?;

    let lit = indicator.as_ref().is_some_and(Indicator::is_lit);
    let mut moved = Indicator::claim(gpio, pin)?;
    if !lit {
        moved.clear();
    }

    let old_pin = config.indicator_pin;
    drop(indicator.replace(moved));
    if let Err(err) = gpio.quiesce(old_pin) {
        warn!("failed to quiesce GPIO{old_pin}: {err}");
    }

    config.indicator_pin = pin;
    Ok(store.commit(config, format!("Custom led pin changed to [{pin}]")))
}
