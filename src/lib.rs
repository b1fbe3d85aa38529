//! Multi-device BLE GATT link manager.
//!
//! [`BleManager`] tracks the connection lifecycle of every peripheral,
//! classifies the channels each one exposes, arms notifications one at a
//! time and runs chunked, flow-controlled transfers. The host Bluetooth
//! stack sits behind [`transport::Transport`]; consumers plug in through
//! the [`router::CallbackRouter`] or listen on an [`event::EventBus`].

pub mod address;
pub mod config;
pub mod device;
pub mod error;
pub mod event;
pub mod manager;
pub mod notify;
pub mod pool;
pub mod reconnect;
pub mod registry;
pub mod request;
pub mod router;
pub mod transfer;
pub mod transport;

pub use address::Address;
pub use config::Config;
pub use device::{ConnectionState, DeviceInfo};
pub use error::{LinkError, Result};
pub use event::{BleEvent, EventBus, EventSender};
pub use manager::BleManager;
pub use reconnect::ReconnectPolicy;
pub use router::{CallbackRouter, Category};
pub use transfer::{TransferHandle, TransferOutcome, TransferRequest};
pub use transport::{EventQueue, Transport, TransportEvent};
