pub mod board;
pub mod config;
pub mod connection;
pub mod error;
pub mod gpio;
pub mod indicator;
pub mod relay;
pub mod router;
pub mod sim;
pub mod store;

pub use board::Board;
pub use config::{Config, NetworkCredential, RelayDefinition, DEFAULT_INDICATOR_PIN};
pub use connection::{
    AccessPointConfig, ConnectionManager, ConnectionPolicy, ConnectionReport, ConnectionState,
    IpInfo, LinkStatus, Radio, ScanEntry,
};
pub use error::{BoardError, HardwareError, RadioError, StoreError, ValidationError};
pub use gpio::{Gpio, OutputPin, RuntimeHandle};
pub use indicator::Indicator;
pub use relay::RelayController;
pub use router::{ApiRequest, ApiResponse, Method, RequestRouter};
pub use store::{Applied, ConfigStore, StorageBackend};
