#![doc = include_str!("../README.md")]

pub mod app;
pub mod device;
#[cfg(feature = "async")]
pub mod driver;
pub mod network;
pub mod timer;
pub mod transaction;
pub mod transport;
pub mod util;

// Re-export main types without glob imports to avoid conflicts
pub use app::{AbortReason, Apdu, ApduType, Application, ApplicationConfig, ApplicationError};
pub use device::{DeviceDirectory, DeviceInfo, DeviceInfoCache, Segmentation};
pub use network::Address;
pub use timer::{Scheduler, TimerHandle, TimerQueue};
pub use transaction::{
    ClientSsm, ServerSsm, StateMachineAccessPoint, TransactionError, TransactionKey,
    TransactionState,
};
pub use transport::Transport;

pub const BACNET_MAX_APDU: usize = 1476;
