pub mod codec;
pub mod constants;
pub mod envelope;
pub mod exchange;
pub mod keyring;
pub mod sealed;
pub mod types;

mod error;

pub use error::{AddressError, CodecError, ExchangeError, KeyRingError};
pub use sealed::{DeviceKek, SealError};
