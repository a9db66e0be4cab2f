//! Platform-agnostic driver for the ON Semiconductor AX5043 sub-GHz
//! transceiver, built on the `embedded-hal` blocking SPI and delay traits.
//!
//! The driver owns the chip lifecycle: reset and self-test, crystal and PLL
//! calibration, register-table programming from a caller-supplied mission
//! profile, framed packet transmit and receive through the chip FIFO, and a
//! CW/Morse beacon mode.
//!
//! ```no_run
//! # fn run<SPI: embedded_hal::spi::SpiDevice, D: embedded_hal::delay::DelayNs>(
//! #     spi: SPI, delay: D) -> Result<(), ax5043_rs::Ax5043Error> {
//! use ax5043_rs::{uhf_params, AddressMask, Ax5043, DataChunkPolicy, Mode, Profile,
//!     UHF_REGISTERS};
//!
//! let mut params = uhf_params();
//! let profile = Profile {
//!     registers: UHF_REGISTERS,
//!     params: &mut params,
//!     local_addr: AddressMask { addr: [0x11, 0, 0, 0], mask: [0xFF, 0, 0, 0] },
//!     mode: Mode::Tx,
//!     data_policy: DataChunkPolicy::Replace,
//! };
//! let mut radio = Ax5043::new(spi, delay, profile);
//! radio.start()?;
//! let dest = AddressMask { addr: [0x42, 0, 0, 0], mask: [0xFF, 0, 0, 0] };
//! radio.transmit_packet(&dest, b"hello")?;
//! # Ok(())
//! # }
//! ```
#![cfg_attr(not(test), no_std)]

pub mod config;
pub mod cw;
pub mod driver;
pub mod registers;
mod rx;
mod tx;

pub use config::{
    set_register_value, uhf_params, AddressMask, ConfigValue, DataChunkPolicy, Mode, Profile,
    RegGroup, RegisterEntry, MAX_PACKET_LEN, UHF_REGISTERS,
};
pub use cw::{morse_code, MorseTiming};
pub use driver::{Ax5043, Ax5043Error, Ax5043State};
pub use registers::{Register, Status};
