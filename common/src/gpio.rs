use crate::error::HardwareError;

/// A pin driven as a push-pull output.
pub trait OutputPin {
    fn set_level(&mut self, high: bool) -> Result<(), HardwareError>;
}

/// Pin allocation capability of the board.
pub trait Gpio {
    type Output: OutputPin;

    /// Claims `pin` as an output already driven to `high`.
    fn output(&mut self, pin: u8, high: bool) -> Result<Self::Output, HardwareError>;

    /// Drives `pin` low, then releases it as a floating input.
    fn quiesce(&mut self, pin: u8) -> Result<(), HardwareError>;
}

/// Live hardware handle bound to one pin. Tracks the last level written.
#[derive(Debug)]
pub struct RuntimeHandle<P> {
    pin: u8,
    level: bool,
    driver: P,
}

impl<P: OutputPin> RuntimeHandle<P> {
    pub fn claim<G>(gpio: &mut G, pin: u8, level: bool) -> Result<Self, HardwareError>
    where
        G: Gpio<Output = P>,
    {
        let driver = gpio.output(pin, level)?;
        Ok(Self { pin, level, driver })
    }

    pub fn pin(&self) -> u8 {
        self.pin
    }

    pub fn level(&self) -> bool {
        self.level
    }

    pub fn set(&mut self, level: bool) -> Result<(), HardwareError> {
        self.driver.set_level(level)?;
        self.level = level;
        Ok(())
    }
}
