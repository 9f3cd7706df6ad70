pub mod error;

pub use error::{ErrorClass, LicensaError, LicensaResult};
