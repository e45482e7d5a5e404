pub mod auth;
pub mod device;
pub mod metrics;

pub use auth::{auth_middleware, AuthUser};
pub use device::{device_id_from_headers, DeviceFingerprint};
pub use metrics::metrics_middleware;
