//! The fast-command block: composes resync/test-pulse/trigger/bunch-reset pulses and runs the
//! trigger generation FSM.

use super::readout::{
    ReadoutReset,
    ResetError,
};
use crate::{
    core::FrontEndType,
    poll::{
        PollPolicy,
        Sleeper,
    },
    transport::{
        with_bus,
        BusWord,
        RegisterBus,
        TransportResult,
    },
};
use fc7ctl_derive::BusWord;
use packed_struct::prelude::*;
use serde::{
    Deserialize,
    Serialize,
};
use std::{
    sync::{
        Arc,
        Mutex,
        Weak,
    },
    time::Duration,
};
use thiserror::Error;
use tracing::{
    debug,
    info,
    warn,
};

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Transport(#[from] crate::transport::Error),
    #[error(transparent)]
    Reset(#[from] ResetError),
    #[error("Firmware reports unknown trigger source {0}")]
    UnknownSource(u32),
}

/// A single fast-command word. Several flags may be set at once, they are sent together.
#[derive(Debug, PackedStruct, Default, Copy, Clone, PartialEq, Eq, BusWord)]
#[packed_struct(bit_numbering = "lsb0", size_bytes = "4")]
pub struct FastCommand {
    #[packed_field(bits = "28..=31")]
    pub duration: Integer<u8, packed_bits::Bits<4>>,
    #[packed_field(bits = "19")]
    pub bc0: bool,
    #[packed_field(bits = "18")]
    pub l1a: bool,
    #[packed_field(bits = "17")]
    pub cal_pulse: bool,
    #[packed_field(bits = "16")]
    pub resync: bool,
}

/// The fast commands that can be issued on their own
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FastCommandKind {
    Resync,
    TestPulse,
    Trigger,
    BunchReset,
}

impl FastCommand {
    #[must_use]
    pub fn new(kind: FastCommandKind, duration: u8) -> Self {
        let mut cmd = Self {
            duration: (duration & 0xF).into(),
            ..Default::default()
        };
        match kind {
            FastCommandKind::Resync => cmd.resync = true,
            FastCommandKind::TestPulse => cmd.cal_pulse = true,
            FastCommandKind::Trigger => cmd.l1a = true,
            FastCommandKind::BunchReset => cmd.bc0 = true,
        }
        cmd
    }

    /// Aggregators need the bunch counter reset along with the resync
    #[must_use]
    pub fn aggregator_resync() -> Self {
        Self {
            resync: true,
            bc0: true,
            ..Default::default()
        }
    }

    /// Shutter commands of the self-counting pixel-strip front ends
    #[must_use]
    pub fn shutter_open() -> Self {
        Self {
            l1a: true,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn shutter_close() -> Self {
        Self {
            bc0: true,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn clear_counters() -> Self {
        Self {
            l1a: true,
            bc0: true,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn start_counter_read() -> Self {
        Self {
            resync: true,
            bc0: true,
            ..Default::default()
        }
    }
}

/// Timing of test-pulse (and antenna) injection, in bunch crossings
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestPulse {
    pub delay_after_fast_reset: u32,
    pub delay_after_test_pulse: u32,
    pub delay_before_next_pulse: u32,
    pub fast_reset: bool,
    pub test_pulse: bool,
    pub l1a: bool,
}

impl Default for TestPulse {
    fn default() -> Self {
        Self {
            delay_after_fast_reset: 50,
            delay_after_test_pulse: 200,
            delay_before_next_pulse: 400,
            fast_reset: true,
            test_pulse: true,
            l1a: true,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum TriggerSource {
    L1Trigger,
    Stubs,
    UserFrequency,
    Tlu,
    ExtDio5,
    TestPulse(TestPulse),
    Antenna(TestPulse),
    /// Bursts of back-to-back triggers, `delay` bunch crossings apart
    Consecutive { delay: u32 },
}

impl TriggerSource {
    #[must_use]
    pub const fn code(&self) -> u32 {
        match self {
            Self::L1Trigger => 1,
            Self::Stubs => 2,
            Self::UserFrequency => 3,
            Self::Tlu => 4,
            Self::ExtDio5 => 5,
            Self::TestPulse(_) => 6,
            Self::Antenna(_) => 7,
            Self::Consecutive { .. } => 8,
        }
    }
}

/// Everything the trigger FSM is configured with. Always applied as a whole.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerConfig {
    pub source: TriggerSource,
    /// Rate of the internal generator. The firmware's `user_trigger_frequency` counts kHz, so
    /// this is written as is; see [`TriggerConfig::rate_hz`] for the rate in Hz.
    pub rate_khz: u32,
    /// Extra triggers sent after every accepted one
    pub multiplicity: u32,
    /// Zero means unlimited
    pub triggers_to_accept: u32,
    pub stubs_mask: u32,
    pub backpressure: bool,
    pub initial_fast_reset: bool,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            source: TriggerSource::UserFrequency,
            rate_khz: 100,
            multiplicity: 0,
            triggers_to_accept: 0,
            stubs_mask: 1,
            backpressure: true,
            initial_fast_reset: false,
        }
    }
}

const CNFG: &str = "fc7_daq_cnfg.fast_command_block.";

pub(crate) const TRIGGER_SOURCE: &str = "fc7_daq_cnfg.fast_command_block.trigger_source";
pub(crate) const USER_FREQUENCY: &str = "fc7_daq_cnfg.fast_command_block.user_trigger_frequency";
pub(crate) const TRIGGERS_TO_ACCEPT: &str = "fc7_daq_cnfg.fast_command_block.triggers_to_accept";
const STUBS_MASK: &str = "fc7_daq_cnfg.fast_command_block.stubs_mask";
pub(crate) const MULTIPLICITY: &str = "fc7_daq_cnfg.fast_command_block.misc.trigger_multiplicity";
const BACKPRESSURE: &str = "fc7_daq_cnfg.fast_command_block.misc.backpressure_enable";
const INITIAL_FAST_RESET: &str = "fc7_daq_cnfg.fast_command_block.misc.initial_fast_reset_enable";
const TP_AFTER_RESET: &str = "fc7_daq_cnfg.fast_command_block.test_pulse.delay_after_fast_reset";
const TP_AFTER_PULSE: &str = "fc7_daq_cnfg.fast_command_block.test_pulse.delay_after_test_pulse";
const TP_BEFORE_NEXT: &str = "fc7_daq_cnfg.fast_command_block.test_pulse.delay_before_next_pulse";
const TP_EN_RESET: &str = "fc7_daq_cnfg.fast_command_block.test_pulse.en_fast_reset";
const TP_EN_PULSE: &str = "fc7_daq_cnfg.fast_command_block.test_pulse.en_test_pulse";
const TP_EN_L1A: &str = "fc7_daq_cnfg.fast_command_block.test_pulse.en_l1a";
const CONSECUTIVE_DELAY: &str = "fc7_daq_cnfg.fast_command_block.delay_between_two_consecutive";

impl TriggerConfig {
    #[must_use]
    pub fn rate_hz(&self) -> u32 {
        self.rate_khz.saturating_mul(1000)
    }

    /// Every configuration register this config sets, in write order
    #[must_use]
    pub fn registers(&self) -> Vec<(&'static str, u32)> {
        let mut regs = vec![
            (INITIAL_FAST_RESET, u32::from(self.initial_fast_reset)),
            (TRIGGERS_TO_ACCEPT, self.triggers_to_accept),
            (USER_FREQUENCY, self.rate_khz),
            (TRIGGER_SOURCE, self.source.code()),
            (STUBS_MASK, self.stubs_mask),
            (MULTIPLICITY, self.multiplicity),
            (BACKPRESSURE, u32::from(self.backpressure)),
        ];
        match self.source {
            TriggerSource::TestPulse(tp) | TriggerSource::Antenna(tp) => regs.extend([
                (TP_AFTER_RESET, tp.delay_after_fast_reset),
                (TP_AFTER_PULSE, tp.delay_after_test_pulse),
                (TP_BEFORE_NEXT, tp.delay_before_next_pulse),
                (TP_EN_RESET, u32::from(tp.fast_reset)),
                (TP_EN_PULSE, u32::from(tp.test_pulse)),
                (TP_EN_L1A, u32::from(tp.l1a)),
            ]),
            TriggerSource::Consecutive { delay } => regs.push((CONSECUTIVE_DELAY, delay)),
            _ => (),
        }
        regs
    }

    /// Rebuild the config currently loaded in the firmware
    /// # Errors
    /// Returns an error on bad transport or an unknown source code
    pub fn read<T: RegisterBus>(bus: &mut T) -> Result<Self, Error> {
        let test_pulse = |bus: &mut T| -> TransportResult<TestPulse> {
            Ok(TestPulse {
                delay_after_fast_reset: bus.read(TP_AFTER_RESET)?,
                delay_after_test_pulse: bus.read(TP_AFTER_PULSE)?,
                delay_before_next_pulse: bus.read(TP_BEFORE_NEXT)?,
                fast_reset: bus.read(TP_EN_RESET)? == 1,
                test_pulse: bus.read(TP_EN_PULSE)? == 1,
                l1a: bus.read(TP_EN_L1A)? == 1,
            })
        };
        let source = match bus.read(TRIGGER_SOURCE)? {
            1 => TriggerSource::L1Trigger,
            2 => TriggerSource::Stubs,
            3 => TriggerSource::UserFrequency,
            4 => TriggerSource::Tlu,
            5 => TriggerSource::ExtDio5,
            6 => TriggerSource::TestPulse(test_pulse(bus)?),
            7 => TriggerSource::Antenna(test_pulse(bus)?),
            8 => TriggerSource::Consecutive {
                delay: bus.read(CONSECUTIVE_DELAY)?,
            },
            c => return Err(Error::UnknownSource(c)),
        };
        Ok(Self {
            source,
            rate_khz: bus.read(USER_FREQUENCY)?,
            multiplicity: bus.read(MULTIPLICITY)?,
            triggers_to_accept: bus.read(TRIGGERS_TO_ACCEPT)?,
            stubs_mask: bus.read(STUBS_MASK)?,
            backpressure: bus.read(BACKPRESSURE)? == 1,
            initial_fast_reset: bus.read(INITIAL_FAST_RESET)? == 1,
        })
    }
}

/// State of the trigger FSM
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FsmState {
    Idle,
    Running,
    Paused,
    Unknown(u32),
}

impl From<u32> for FsmState {
    fn from(v: u32) -> Self {
        match v {
            0 => Self::Idle,
            1 => Self::Running,
            2 => Self::Paused,
            v => Self::Unknown(v),
        }
    }
}

/// Sequences fast commands and the trigger FSM for one board
#[derive(Debug)]
pub struct Sequencer<T> {
    /// Upwards pointer to the parent class' transport
    transport: Weak<Mutex<T>>,
    sleeper: Arc<dyn Sleeper>,
    readout_reset: ReadoutReset,
    front_end: Option<FrontEndType>,
    /// Wait for the FSM to go idle after a stop
    idle_policy: PollPolicy,
}

impl<T> Clone for Sequencer<T> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
            sleeper: self.sleeper.clone(),
            readout_reset: self.readout_reset.clone(),
            front_end: self.front_end,
            idle_policy: self.idle_policy,
        }
    }
}

impl<T> Sequencer<T>
where
    T: RegisterBus,
{
    const CONTROL: &'static str = "fc7_daq_ctrl.fast_command_block.control";
    const START: &'static str = "fc7_daq_ctrl.fast_command_block.control.start_trigger";
    const STOP: &'static str = "fc7_daq_ctrl.fast_command_block.control.stop_trigger";
    const RESET: &'static str = "fc7_daq_ctrl.fast_command_block.control.reset";
    const LOAD_CONFIG: &'static str = "fc7_daq_ctrl.fast_command_block.control.load_config";
    const FAST_RESET: &'static str = "fc7_daq_ctrl.fast_command_block.control.fast_reset";
    const ORBIT_RESET: &'static str = "fc7_daq_ctrl.fast_command_block.control.fast_orbit_reset";
    const FAST_DURATION: &'static str = "fc7_daq_ctrl.fast_command_block.control.fast_duration";
    const SHUTTER_OPEN: &'static str = "fc7_daq_ctrl.stub_counter_block.general.shutter_open";
    const SHUTTER_CLOSE: &'static str = "fc7_daq_ctrl.stub_counter_block.general.shutter_close";
    const FSM_STATE: &'static str = "fc7_daq_stat.fast_command_block.general.fsm_state";

    const SETTLE: Duration = Duration::from_millis(10);
    const CONFIG_SETTLE: Duration = Duration::from_millis(100);

    #[must_use]
    pub fn new(
        transport: Weak<Mutex<T>>,
        sleeper: Arc<dyn Sleeper>,
        readout_reset: ReadoutReset,
        front_end: Option<FrontEndType>,
        idle_policy: PollPolicy,
    ) -> Self {
        Self {
            transport,
            sleeper,
            readout_reset,
            front_end,
            idle_policy,
        }
    }

    /// Replace the trigger configuration. The FSM is reset, every register written, the
    /// configuration loaded and finally the readout path reset, strictly in that order.
    /// # Errors
    /// Returns an error on bad transport or if the DDR3 doesn't come back calibrated
    pub fn reconfigure(&self, config: &TriggerConfig) -> Result<(), Error> {
        with_bus(&self.transport, |bus| self.reconfigure_locked(bus, config))
    }

    pub(crate) fn reconfigure_locked(&self, bus: &mut T, config: &TriggerConfig) -> Result<(), Error> {
        bus.write(Self::RESET, 1)?;
        self.sleeper.sleep(Self::SETTLE);
        bus.write_stack(&config.registers())?;
        if matches!(config.source, TriggerSource::Consecutive { .. }) {
            bus.write(Self::FAST_DURATION, 15)?;
        }
        self.sleeper.sleep(Self::CONFIG_SETTLE);
        self.load_config_locked(bus)?;
        self.readout_reset.apply(bus)?;
        debug!(?config, "Trigger FSM reconfigured");
        Ok(())
    }

    pub(crate) fn readout_reset(&self) -> &ReadoutReset {
        &self.readout_reset
    }

    pub(crate) fn load_config_locked(&self, bus: &mut T) -> Result<(), Error> {
        bus.write(Self::LOAD_CONFIG, 1)?;
        self.sleeper.sleep(Self::SETTLE);
        Ok(())
    }

    /// The configuration currently loaded in the firmware
    /// # Errors
    /// Returns an error on bad transport
    pub fn config(&self) -> Result<TriggerConfig, Error> {
        with_bus(&self.transport, |bus| TriggerConfig::read(bus))
    }

    /// Clear the stub counter shutter and enable the trigger FSM
    /// # Errors
    /// Returns an error on bad transport
    pub fn start(&self) -> Result<(), Error> {
        with_bus(&self.transport, |bus| self.start_locked(bus))
    }

    pub(crate) fn start_locked(&self, bus: &mut T) -> Result<(), Error> {
        // Self-clearing is unreliable, so clear it by hand
        bus.write(Self::SHUTTER_OPEN, 1)?;
        bus.write(Self::SHUTTER_OPEN, 0)?;
        bus.write(Self::START, 1)?;
        info!("Triggers started");
        Ok(())
    }

    /// Stop the trigger FSM, returning whether it reported idle within the poll budget.
    /// Not reaching idle is only reported.
    /// # Errors
    /// Returns an error on bad transport
    pub fn stop(&self) -> Result<bool, Error> {
        with_bus(&self.transport, |bus| self.stop_locked(bus))
    }

    pub(crate) fn stop_locked(&self, bus: &mut T) -> Result<bool, Error> {
        bus.write(Self::SHUTTER_CLOSE, 1)?;
        bus.write(Self::SHUTTER_CLOSE, 0)?;
        bus.write(Self::STOP, 1)?;
        let idle = self.idle_policy.until(self.sleeper.as_ref(), || {
            Ok::<_, Error>(FsmState::from(bus.read(Self::FSM_STATE)?) == FsmState::Idle)
        })?;
        if idle {
            info!("Triggers stopped");
        } else {
            warn!("Trigger FSM did not return to idle after stop");
        }
        Ok(idle)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn pause(&self) -> Result<(), Error> {
        with_bus(&self.transport, |bus| {
            bus.write(Self::STOP, 1)?;
            Ok(())
        })
    }

    /// Reset the readout and continue triggering
    /// # Errors
    /// Returns an error on bad transport or if the DDR3 doesn't come back calibrated
    pub fn resume(&self) -> Result<(), Error> {
        with_bus(&self.transport, |bus| {
            self.readout_reset.apply(bus)?;
            bus.write(Self::START, 1)?;
            Ok(())
        })
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn fsm_state(&self) -> Result<FsmState, Error> {
        with_bus(&self.transport, |bus| Ok(bus.read(Self::FSM_STATE)?.into()))
    }

    /// Send one fast command. A resync to aggregator front ends also resets the bunch counter.
    /// # Errors
    /// Returns an error on bad transport
    pub fn issue(&self, kind: FastCommandKind, duration: u8) -> Result<(), Error> {
        with_bus(&self.transport, |bus| self.issue_locked(bus, kind, duration))
    }

    pub(crate) fn issue_locked(&self, bus: &mut T, kind: FastCommandKind, duration: u8) -> Result<(), Error> {
        let cmd = match (kind, self.front_end) {
            (FastCommandKind::Resync, Some(fe)) if fe.is_aggregator() => FastCommand {
                duration: (duration & 0xF).into(),
                ..FastCommand::aggregator_resync()
            },
            _ => FastCommand::new(kind, duration),
        };
        self.send_locked(bus, cmd)
    }

    pub(crate) fn send_locked(&self, bus: &mut T, cmd: FastCommand) -> Result<(), Error> {
        bus.write_word(Self::CONTROL, &cmd)?;
        debug!(?cmd, "Fast command sent");
        Ok(())
    }

    /// Send a hand-built fast command word
    /// # Errors
    /// Returns an error on bad transport
    pub fn send(&self, cmd: FastCommand) -> Result<(), Error> {
        with_bus(&self.transport, |bus| self.send_locked(bus, cmd))
    }

    /// Resynchronize the front ends, the way their family expects it
    /// # Errors
    /// Returns an error on bad transport
    pub fn fast_reset(&self) -> Result<(), Error> {
        with_bus(&self.transport, |bus| self.fast_reset_locked(bus))
    }

    pub(crate) fn fast_reset_locked(&self, bus: &mut T) -> Result<(), Error> {
        match self.front_end {
            Some(fe) if fe.is_aggregator() => self.send_locked(bus, FastCommand::aggregator_resync()),
            _ => {
                bus.write(Self::FAST_RESET, 1)?;
                Ok(())
            }
        }
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn orbit_reset(&self) -> Result<(), Error> {
        with_bus(&self.transport, |bus| self.orbit_reset_locked(bus))
    }

    pub(crate) fn orbit_reset_locked(&self, bus: &mut T) -> Result<(), Error> {
        bus.write(Self::ORBIT_RESET, 1)?;
        Ok(())
    }

    /// Open the counting shutter of self-counting front ends for `exposure`, then close it
    /// # Errors
    /// Returns an error on bad transport
    pub fn expose(&self, exposure: Duration) -> Result<(), Error> {
        with_bus(&self.transport, |bus| {
            self.send_locked(bus, FastCommand::clear_counters())?;
            self.send_locked(bus, FastCommand::shutter_open())?;
            self.sleeper.sleep(exposure);
            self.send_locked(bus, FastCommand::shutter_close())?;
            info!(?exposure, "Shutter exposure done");
            Ok(())
        })
    }

    /// Ask self-counting front ends to start shifting out their counters
    /// # Errors
    /// Returns an error on bad transport
    pub fn start_counter_read(&self) -> Result<(), Error> {
        self.send(FastCommand::start_counter_read())
    }
}
