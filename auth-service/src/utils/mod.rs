pub mod password;
pub mod ttl;
pub mod validation;

pub use password::{hash_password, verify_password, Password, PasswordHashString};
pub use ttl::parse_ttl;
pub use validation::ValidatedJson;
