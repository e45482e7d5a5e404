pub mod auth_event;
pub mod device_session;
pub mod user;

pub use auth_event::{AuthEvent, AuthEventKind};
pub use device_session::{hash_token, DeviceSession, SessionRotation};
pub use user::{NewUser, User, UserResponse};
