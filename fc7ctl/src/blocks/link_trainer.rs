//! Brings the links to the front ends up: optical lock, per-line phase and word alignment,
//! and the aggregator-specific L1 and Bx0 alignment steps.

use super::{
    fast_command::{
        self,
        Sequencer,
        TriggerConfig,
        TriggerSource,
    },
    optical::{
        self,
        LinkStatus,
        OpticalLock,
    },
    phase_tuner::{
        self,
        line_status,
        send,
        set_pattern,
        Control,
        LineMode,
        LineSelect,
        LineTuningState,
    },
    readout::ResetError,
};
use crate::{
    core::{
        self,
        FrontEndType,
        LinkId,
        Topology,
    },
    poll::{
        PollPolicy,
        Sleeper,
    },
    transport::{
        with_bus,
        RegisterBus,
    },
};
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
    error,
    info,
    warn,
};

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Transport(#[from] crate::transport::Error),
    #[error(transparent)]
    Tuner(#[from] phase_tuner::Error),
    #[error(transparent)]
    Optical(#[from] optical::Error),
    #[error(transparent)]
    Sequencer(#[from] fast_command::Error),
    #[error(transparent)]
    Reset(#[from] ResetError),
    #[error(transparent)]
    Topology(#[from] core::Error),
    #[error("Line {select:?} did not tune after {attempts} attempts, last state {state:?}")]
    LineNotTuned {
        select: LineSelect,
        attempts: usize,
        state: LineTuningState,
    },
    #[error("No bitslip of hybrid {0}'s L1 line shows the alignment pattern")]
    L1WordNotFound(u8),
    #[error("Bx0 alignment failed, the decoder is in state {0}")]
    Bx0NotAligned(u32),
    #[error("Hardware never reported ready after retuning")]
    HardwareNotReady,
}

/// A training pattern and its length in bits
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Pattern {
    pub pattern: u8,
    pub length: u8,
}

/// Phase alignment of line 0, the L1 line
pub const L1_PATTERN: Pattern = Pattern {
    pattern: 0xAA,
    length: 8,
};

pub const STUB_PATTERN: Pattern = Pattern {
    pattern: 0xEA,
    length: 8,
};

/// Word alignment of an aggregator's L1 line
pub const AGGREGATOR_L1_PATTERN: Pattern = Pattern {
    pattern: 0xFE,
    length: 40,
};

/// How an aggregator's L1 line ended up word aligned
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum L1Alignment {
    /// The firmware's word aligner found it
    Automatic,
    /// Found by sweeping the bitslip by hand
    Manual(u8),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerSettings {
    /// Attempts per line, the interval is the wait after each alignment command
    pub line: PollPolicy,
    /// Attempts of the hardware retune, the interval is the wait after each
    pub hardware_ready: PollPolicy,
    /// How long triggers run while the word aligner looks at the L1 line
    #[serde(with = "crate::poll::micros")]
    pub word_alignment_run: Duration,
    /// How long triggers run for each bitslip of the manual sweep
    #[serde(with = "crate::poll::micros")]
    pub sweep_run: Duration,
}

impl Default for TrainerSettings {
    fn default() -> Self {
        Self {
            line: PollPolicy::new(10, Duration::from_millis(10)),
            hardware_ready: PollPolicy::new(10, Duration::from_millis(100)),
            word_alignment_run: Duration::from_millis(500),
            sweep_run: Duration::from_micros(100),
        }
    }
}

/// Everything learned while training one board
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrainingReport {
    pub optical: Vec<(LinkId, LinkStatus)>,
    pub lines: Vec<(LineSelect, LineTuningState)>,
    pub l1: Vec<(u8, L1Alignment)>,
}

#[derive(Debug)]
pub struct LinkTrainer<T> {
    /// Upwards pointer to the parent class' transport
    transport: Weak<Mutex<T>>,
    sleeper: Arc<dyn Sleeper>,
    optical: OpticalLock<T>,
    sequencer: Sequencer<T>,
    settings: TrainerSettings,
}

const L1_DEBUG: &str = "fc7_daq_stat.physical_interface_block.l1a_debug";
const SWEEP_WORDS: usize = 50;
const BX0_STATE: &str = "fc7_daq_stat.physical_interface_block.cic_decoder.bx0_alignment_state";
const BX0_ALIGNED: u32 = 8;
const TUNE_AGAIN: &str = "fc7_daq_ctrl.physical_interface_block.control.cbc3_tune_again";
const HARDWARE_READY: &str = "fc7_daq_stat.physical_interface_block.hardware_ready";
const CHIP_HARD_RESET: &str = "fc7_daq_ctrl.physical_interface_block.control.chip_hard_reset";
const CIC_HARD_RESET: &str = "fc7_daq_ctrl.physical_interface_block.control.cic_hard_reset";

impl<T> LinkTrainer<T>
where
    T: RegisterBus,
{
    const RESYNC_SETTLE: Duration = Duration::from_millis(100);
    const HARD_RESET_SETTLE: Duration = Duration::from_millis(10);

    #[must_use]
    pub fn new(
        transport: Weak<Mutex<T>>,
        sleeper: Arc<dyn Sleeper>,
        optical: OpticalLock<T>,
        sequencer: Sequencer<T>,
        settings: TrainerSettings,
    ) -> Self {
        Self {
            transport,
            sleeper,
            optical,
            sequencer,
            settings,
        }
    }

    pub(crate) fn optical(&self) -> &OpticalLock<T> {
        &self.optical
    }

    /// Train every link and line of `topology`
    /// # Errors
    /// Returns an error on bad transport or the first link that can't be trained
    pub fn train(&self, topology: &Topology) -> Result<TrainingReport, Error> {
        with_bus(&self.transport, |bus| self.train_locked(bus, topology))
    }

    pub(crate) fn train_locked(&self, bus: &mut T, topology: &Topology) -> Result<TrainingReport, Error> {
        let front_end = topology.front_end()?;
        let mut report = TrainingReport::default();
        if topology.optical {
            report.optical = self.optical.lock_locked(bus, &topology.links())?;
        }
        if front_end == FrontEndType::Cbc3 {
            // CBC lines are tuned by the firmware on its own
            self.retune_cbc3_locked(bus)?;
        } else {
            for hybrid in topology.hybrids() {
                let chips: Vec<u8> = if front_end.is_aggregator() {
                    vec![0]
                } else {
                    hybrid.readout_chips().map(|c| c.id).collect()
                };
                for chip in chips {
                    report
                        .lines
                        .extend(self.tune_chip_locked(bus, hybrid.id, chip, front_end)?);
                }
            }
        }
        if front_end.is_aggregator() {
            for hybrid in topology.hybrids() {
                report
                    .l1
                    .push((hybrid.id, self.align_l1_word_locked(bus, hybrid.id)?));
            }
            self.align_bx0_locked(bus)?;
        }
        info!(?front_end, lines = report.lines.len(), "Links trained");
        Ok(report)
    }

    /// Tune line 0, couple the first stub line to it, then tune the remaining stub lines
    fn tune_chip_locked(
        &self,
        bus: &mut T,
        hybrid: u8,
        chip: u8,
        front_end: FrontEndType,
    ) -> Result<Vec<(LineSelect, LineTuningState)>, Error> {
        let l1_select = LineSelect::new(hybrid, chip, 0);
        let l1 = self.tune_line_locked(bus, l1_select, L1_PATTERN)?;
        let first_stub = LineSelect::new(hybrid, chip, 1);
        let coupled =
            self.couple_stub_line_locked(bus, first_stub, &l1, front_end.stub_bitslip_offset())?;
        let mut lines = vec![(l1_select, l1), (first_stub, coupled)];
        for line in 2..=front_end.stub_lines() {
            let select = LineSelect::new(hybrid, chip, line);
            lines.push((select, self.tune_line_locked(bus, select, STUB_PATTERN)?));
        }
        Ok(lines)
    }

    /// Phase then word align one line
    /// # Errors
    /// Returns an error on bad transport or if the line doesn't tune within the attempt budget
    pub fn tune_line(&self, select: LineSelect, pattern: Pattern) -> Result<LineTuningState, Error> {
        with_bus(&self.transport, |bus| self.tune_line_locked(bus, select, pattern))
    }

    pub(crate) fn tune_line_locked(
        &self,
        bus: &mut T,
        select: LineSelect,
        pattern: Pattern,
    ) -> Result<LineTuningState, Error> {
        let policy = self.settings.line;
        let mut state = None;
        for attempt in 1..=policy.max_attempts {
            send(bus, select, &LineMode::Idle { l1_enable: false })?;
            set_pattern(bus, select, pattern.pattern, pattern.length)?;
            send(bus, select, &Control {
                phase_align: true,
                ..Default::default()
            })?;
            self.sleeper.sleep(policy.interval);
            send(bus, select, &Control {
                word_align: true,
                ..Default::default()
            })?;
            self.sleeper.sleep(policy.interval);
            let current = line_status(bus, select)?;
            if current.is_phase_tuned() && current.is_word_aligned() {
                info!(?select, delay = current.delay, bitslip = current.bitslip, "Line tuned");
                return Ok(current);
            }
            warn!(?select, attempt, stage = ?current.stage(), "Line not tuned yet");
            state = Some(current);
        }
        let state = match state {
            Some(s) => s,
            None => line_status(bus, select)?,
        };
        error!(?select, ?state, "Line failed to tune");
        Err(Error::LineNotTuned {
            select,
            attempts: policy.max_attempts,
            state,
        })
    }

    /// Force a stub line onto the delay of `l1`, with its bitslip shifted by `offset`
    fn couple_stub_line_locked(
        &self,
        bus: &mut T,
        select: LineSelect,
        l1: &LineTuningState,
        offset: u8,
    ) -> Result<LineTuningState, Error> {
        let bitslip = l1.bitslip.wrapping_add(offset) & 0x7;
        send(bus, select, &LineMode::ManualDelayBitslip {
            delay: l1.delay,
            bitslip,
        })?;
        send(bus, select, &Control {
            apply: true,
            ..Default::default()
        })?;
        self.sleeper.sleep(self.settings.line.interval);
        debug!(?select, delay = l1.delay, bitslip, "Stub line follows line 0");
        Ok(line_status(bus, select)?)
    }

    /// Let triggers run for `duration`
    fn run_triggers_locked(&self, bus: &mut T, duration: Duration) -> Result<(), Error> {
        self.sequencer.start_locked(bus)?;
        self.sleeper.sleep(duration);
        self.sequencer.stop_locked(bus)?;
        Ok(())
    }

    /// Word align an aggregator's L1 line. Triggers are needed for this, so the trigger
    /// configuration is swapped for a slow internal one and restored afterwards.
    /// # Errors
    /// Returns an error on bad transport or if no bitslip shows the pattern
    pub fn align_l1_word(&self, hybrid: u8) -> Result<L1Alignment, Error> {
        with_bus(&self.transport, |bus| self.align_l1_word_locked(bus, hybrid))
    }

    pub(crate) fn align_l1_word_locked(&self, bus: &mut T, hybrid: u8) -> Result<L1Alignment, Error> {
        let saved = TriggerConfig::read(bus)?;
        let temporary = TriggerConfig {
            source: TriggerSource::UserFrequency,
            rate_khz: 10,
            multiplicity: 0,
            backpressure: false,
            ..saved
        };
        self.sequencer.reconfigure_locked(bus, &temporary)?;
        let aligned = self.find_l1_word_locked(bus, hybrid);
        self.sequencer.reconfigure_locked(bus, &saved)?;
        aligned
    }

    fn find_l1_word_locked(&self, bus: &mut T, hybrid: u8) -> Result<L1Alignment, Error> {
        let select = LineSelect::new(hybrid, 0, 0);
        let pattern = AGGREGATOR_L1_PATTERN;
        self.sequencer.fast_reset_locked(bus)?;
        send(bus, select, &LineMode::Idle { l1_enable: false })?;
        set_pattern(bus, select, pattern.pattern, pattern.length)?;
        send(bus, select, &Control {
            word_align: true,
            ..Default::default()
        })?;
        self.run_triggers_locked(bus, self.settings.word_alignment_run)?;
        if line_status(bus, select)?.done {
            info!(hybrid, "L1 line word aligned");
            return Ok(L1Alignment::Automatic);
        }
        warn!(hybrid, "Word aligner failed on the L1 line, sweeping the bitslip");
        for bitslip in 0..8 {
            send(bus, select, &LineMode::ManualDelayBitslip { delay: 0, bitslip })?;
            self.run_triggers_locked(bus, self.settings.sweep_run)?;
            let words = bus.read_block(L1_DEBUG, SWEEP_WORDS)?;
            self.sequencer.readout_reset().apply(bus)?;
            if contains_pattern(&words, pattern.pattern) {
                info!(hybrid, bitslip, "L1 line aligned by hand");
                return Ok(L1Alignment::Manual(bitslip));
            }
            debug!(hybrid, bitslip, "No alignment pattern");
        }
        error!(hybrid, "L1 line could not be word aligned");
        Err(Error::L1WordNotFound(hybrid))
    }

    /// # Errors
    /// Returns an error on bad transport or if the decoder doesn't report alignment
    pub fn align_bx0(&self) -> Result<(), Error> {
        with_bus(&self.transport, |bus| self.align_bx0_locked(bus))
    }

    pub(crate) fn align_bx0_locked(&self, bus: &mut T) -> Result<(), Error> {
        self.sequencer.fast_reset_locked(bus)?;
        self.sleeper.sleep(Self::RESYNC_SETTLE);
        let state = bus.read(BX0_STATE)?;
        if state == BX0_ALIGNED {
            self.sequencer.readout_reset().apply(bus)?;
            info!("Bx0 aligned");
            Ok(())
        } else {
            error!(state, "Bx0 alignment failed");
            Err(Error::Bx0NotAligned(state))
        }
    }

    /// Restart the firmware's own CBC tuning until it reports ready
    /// # Errors
    /// Returns an error on bad transport or if it never gets ready
    pub fn retune_cbc3(&self) -> Result<(), Error> {
        with_bus(&self.transport, |bus| self.retune_cbc3_locked(bus))
    }

    pub(crate) fn retune_cbc3_locked(&self, bus: &mut T) -> Result<(), Error> {
        let policy = self.settings.hardware_ready;
        for attempt in 1..=policy.max_attempts {
            self.sequencer.fast_reset_locked(bus)?;
            bus.write(TUNE_AGAIN, 1)?;
            self.sleeper.sleep(policy.interval);
            if bus.read(HARDWARE_READY)? == 1 {
                info!(attempt, "Hardware tuning done");
                return Ok(());
            }
        }
        error!(attempts = policy.max_attempts, "Hardware never got ready");
        Err(Error::HardwareNotReady)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn reset_chips(&self) -> Result<(), Error> {
        self.hard_reset(CHIP_HARD_RESET)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn reset_aggregators(&self) -> Result<(), Error> {
        self.hard_reset(CIC_HARD_RESET)
    }

    fn hard_reset(&self, register: &str) -> Result<(), Error> {
        with_bus(&self.transport, |bus| self.hard_reset_locked(bus, register))
    }

    fn hard_reset_locked(&self, bus: &mut T, register: &str) -> Result<(), Error> {
        bus.write(register, 1)?;
        self.sleeper.sleep(Self::HARD_RESET_SETTLE);
        Ok(())
    }

    /// Hard reset whatever sits at the end of the command bus: the aggregators if there are
    /// any, the readout chips otherwise
    pub(crate) fn reset_front_ends_locked(&self, bus: &mut T, front_end: FrontEndType) -> Result<(), Error> {
        self.hard_reset_locked(
            bus,
            if front_end.is_aggregator() {
                CIC_HARD_RESET
            } else {
                CHIP_HARD_RESET
            },
        )
    }
}

/// Whether any byte of the captured words is `pattern`
fn contains_pattern(words: &[u32], pattern: u8) -> bool {
    words.iter().any(|w| w.to_be_bytes().contains(&pattern))
}
