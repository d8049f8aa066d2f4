//! One module per firmware block. Every block holds a weak pointer back to its board's bus and
//! takes the bus lock once per public operation.

pub mod cdce;
pub mod codec;
pub mod command_processor;
pub mod fast_command;
pub mod link_trainer;
pub mod optical;
pub mod phase_tuner;
pub mod readout;
