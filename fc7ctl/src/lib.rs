//! Firmware control of FC7 front-end readout boards: the clock synthesizer, the chip-register
//! command bus, link training, the trigger FSM and event readout, all over a named-register bus.
//!
//! A board is built around any [`transport::RegisterBus`], then configured for a
//! [`core::Topology`] with a [`settings::Settings`]:
//!
//! ```no_run
//! use fc7ctl::prelude::*;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let topology: Topology = toml::from_str(&std::fs::read_to_string("topology.toml")?)?;
//! let mut board = Fc7::new(Mock::new());
//! board.configure(topology, &Settings::from_file("fc7.toml")?)?;
//! board.train()?;
//! board.start()?;
//! let events = board.read_exactly(100)?;
//! # Ok(())
//! # }
//! ```
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod blocks;
pub mod board;
pub mod core;
pub mod poll;
pub mod prelude;
pub mod settings;
pub mod transport;
