// core/blockchain-monitor/src/lib.rs
// Real-time address monitoring over Blockbook WebSockets

pub mod callback;
pub mod health;
pub mod monitor;
pub mod protocol;
pub mod registry;

pub use callback::{
    AsyncFnCallback, CallbackError, FnCallback, TransactionCallback, TransactionNotification,
    WebhookCallback,
};
pub use health::{check_monitor, check_pool, HealthChecker, SERVICE_NAME};
pub use monitor::{Monitor, MonitorError, MonitorHandle, MonitorState, MonitorStats};
pub use protocol::{InboundMessage, ProtocolError, TransactionEvent};
pub use registry::{MonitorRegistry, RegistryError};
