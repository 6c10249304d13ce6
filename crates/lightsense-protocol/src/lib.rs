//! LightSense serial protocol
//!
//! This crate implements the host side of the light-sensor instrument's text
//! protocol: framing the raw serial byte stream into lines, encoding commands,
//! classifying responses and running the command/confirmation exchanges the
//! firmware expects.
//!
//! # Protocol Overview
//!
//! The protocol is half-duplex request/response over a serial byte stream:
//!
//! - **Commands** (host → instrument): ASCII text terminated with `\r\n`
//! - **Responses** (instrument → host): one line per command, terminated with `\n`
//! - **Double acknowledgement**: configuration commands are first answered
//!   with `OK`; the actual result is delivered in reply to a following `nop`
//!
//! Responses carry sentinels (`OK`, `ERROR`, `NA`, `NONE`, `CHECK_FAILED`,
//! `NO_CONF_SELECTED`, `TRUE`, `FALSE`, `ERRORS_CLEARED`) or a numeric payload.
//!
//! # Example
//!
//! ```rust,ignore
//! use lightsense_protocol::ProtocolClient;
//!
//! let mut client = ProtocolClient::new(link);
//! client.prompt_off()?;
//! client.ping()?;
//! let wavelength = client.guarded("get_wavelength", |c| c.get_wavelength(0))?;
//! ```

mod client;
mod commands;
mod error;
mod framer;
mod link;
mod responses;
pub mod testing;

pub use client::*;
pub use commands::*;
pub use error::*;
pub use framer::*;
pub use link::*;
pub use responses::*;
