// HSM Module - payment command firmware
//
// core owns the dispatch chain; the protocol engines (pin_block, mac, cvv)
// are state-free and borrow key material from the Key Store per operation.

pub mod core;
pub mod cvv;
pub mod errors;
pub mod mac;
pub mod pin_block;
pub mod tamper;

pub use self::core::PaymentHsm;
pub use self::errors::{CommandError, HsmError, InputViolation};
pub use self::tamper::{
    ClockRegressionMonitor, TamperController, TamperEvent, TamperMonitor, TamperReason,
};
