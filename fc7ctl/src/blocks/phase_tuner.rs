//! Command interface of the per-line phase tuner in the physical interface block.
//!
//! Every command is a single word: the hybrid, chip and line it targets, a command type nibble,
//! and a 16-bit payload. Status requests are answered in the reply register.

use crate::transport::{
    BusWord,
    RegisterBus,
    TransportResult,
};
use fc7ctl_derive::{
    command_type,
    BusWord,
};
use packed_struct::prelude::*;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Transport(#[from] crate::transport::Error),
    #[error("Expected a type {expected} reply, got {word:#010x}")]
    UnexpectedReply { expected: u8, word: u32 },
}

pub(crate) const CONTROL: &str = "fc7_daq_ctrl.physical_interface_block.phase_tuning_ctrl";
pub(crate) const REPLY: &str = "fc7_daq_stat.physical_interface_block.phase_tuning_reply";

/// Payloads the phase tuner understands, tagged with their command type
pub trait TunerCommand {
    const COMMAND_TYPE: u8;
}

/// The line a command is aimed at
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct LineSelect {
    pub hybrid: u8,
    pub chip: u8,
    pub line: u8,
}

impl LineSelect {
    #[must_use]
    pub const fn new(hybrid: u8, chip: u8, line: u8) -> Self {
        Self { hybrid, chip, line }
    }

    /// The full command word for `payload`
    #[must_use]
    pub fn command<C: TunerCommand + BusWord>(&self, payload: &C) -> u32 {
        (u32::from(self.hybrid & 0xF) << 28)
            | (u32::from(self.chip & 0xF) << 24)
            | (u32::from(self.line & 0xF) << 20)
            | (u32::from(C::COMMAND_TYPE & 0xF) << 16)
            | (payload.to_word() & 0xFFFF)
    }
}

/// Ask for the mode, delay and bitslip of a line
#[command_type(0)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct ModeRequest;

/// Ask for the alignment FSM states of a line
#[command_type(1)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct AlignmentRequest;

impl BusWord for ModeRequest {
    fn to_word(&self) -> u32 {
        0
    }

    fn from_word(_: u32) -> TransportResult<Self> {
        Ok(Self)
    }
}

impl BusWord for AlignmentRequest {
    fn to_word(&self) -> u32 {
        0
    }

    fn from_word(_: u32) -> TransportResult<Self> {
        Ok(Self)
    }
}

/// Operating modes of a line
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LineModeKind {
    /// Automatic tuning, the tuner runs its own FSMs
    Idle,
    /// Copy the delay and bitslip of another line
    PatternInject,
    /// Use a delay and bitslip given by hand
    ManualDelayBitslip,
}

impl LineModeKind {
    #[must_use]
    pub const fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0 => Some(Self::Idle),
            1 => Some(Self::PatternInject),
            2 => Some(Self::ManualDelayBitslip),
            _ => None,
        }
    }

    #[must_use]
    pub const fn bits(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::PatternInject => 1,
            Self::ManualDelayBitslip => 2,
        }
    }
}

/// Set the mode of a line along with the settings that mode uses
#[command_type(2)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LineMode {
    Idle { l1_enable: bool },
    PatternInject { master_line: u8 },
    ManualDelayBitslip { delay: u8, bitslip: u8 },
}

impl LineMode {
    #[must_use]
    pub const fn kind(&self) -> LineModeKind {
        match self {
            Self::Idle { .. } => LineModeKind::Idle,
            Self::PatternInject { .. } => LineModeKind::PatternInject,
            Self::ManualDelayBitslip { .. } => LineModeKind::ManualDelayBitslip,
        }
    }
}

// The master line field overlaps the L1 enable bit, so this one is packed by hand
impl BusWord for LineMode {
    fn to_word(&self) -> u32 {
        let mode = u32::from(self.kind().bits()) << 12;
        mode | match *self {
            Self::Idle { l1_enable } => u32::from(l1_enable) << 11,
            Self::PatternInject { master_line } => u32::from(master_line & 0xF) << 8,
            Self::ManualDelayBitslip { delay, bitslip } => {
                (u32::from(delay & 0x1F) << 3) | u32::from(bitslip & 0x7)
            }
        }
    }

    fn from_word(word: u32) -> TransportResult<Self> {
        let bits = ((word >> 12) & 0x3) as u8;
        Ok(match LineModeKind::from_bits(bits) {
            Some(LineModeKind::Idle) => Self::Idle {
                l1_enable: word & (1 << 11) != 0,
            },
            Some(LineModeKind::PatternInject) => Self::PatternInject {
                master_line: ((word >> 8) & 0xF) as u8,
            },
            Some(LineModeKind::ManualDelayBitslip) => Self::ManualDelayBitslip {
                delay: ((word >> 3) & 0x1F) as u8,
                bitslip: (word & 0x7) as u8,
            },
            None => return Err(packed_struct::PackingError::InvalidValue.into()),
        })
    }
}

/// Length in bits of the training pattern
#[command_type(3)]
#[derive(Debug, PackedStruct, Default, Copy, Clone, PartialEq, Eq, BusWord)]
#[packed_struct(bit_numbering = "lsb0", size_bytes = "4")]
pub struct PatternLength {
    #[packed_field(bits = "0..=7")]
    pub length: u8,
}

/// One byte of the training pattern
#[command_type(4)]
#[derive(Debug, PackedStruct, Default, Copy, Clone, PartialEq, Eq, BusWord)]
#[packed_struct(bit_numbering = "lsb0", size_bytes = "4")]
pub struct PatternByte {
    #[packed_field(bits = "8..=15")]
    pub byte_id: u8,
    #[packed_field(bits = "0..=7")]
    pub pattern: u8,
}

/// Kick off the alignment FSMs, or apply the configured mode
#[command_type(5)]
#[derive(Debug, PackedStruct, Default, Copy, Clone, PartialEq, Eq, BusWord)]
#[packed_struct(bit_numbering = "lsb0", size_bytes = "4")]
pub struct Control {
    #[packed_field(bits = "2")]
    pub apply: bool,
    #[packed_field(bits = "1")]
    pub word_align: bool,
    #[packed_field(bits = "0")]
    pub phase_align: bool,
}

/// Answer to a [`ModeRequest`]
#[derive(Debug, PackedStruct, Default, Copy, Clone, PartialEq, Eq, BusWord)]
#[packed_struct(bit_numbering = "lsb0", size_bytes = "4")]
pub struct ModeReply {
    #[packed_field(bits = "24..=27")]
    pub reply_type: Integer<u8, packed_bits::Bits<4>>,
    #[packed_field(bits = "12..=13")]
    pub mode: Integer<u8, packed_bits::Bits<2>>,
    #[packed_field(bits = "3..=7")]
    pub delay: Integer<u8, packed_bits::Bits<5>>,
    #[packed_field(bits = "0..=2")]
    pub bitslip: Integer<u8, packed_bits::Bits<3>>,
}

/// Answer to an [`AlignmentRequest`]
#[derive(Debug, PackedStruct, Default, Copy, Clone, PartialEq, Eq, BusWord)]
#[packed_struct(bit_numbering = "lsb0", size_bytes = "4")]
pub struct AlignmentReply {
    #[packed_field(bits = "24..=27")]
    pub reply_type: Integer<u8, packed_bits::Bits<4>>,
    #[packed_field(bits = "19..=23")]
    pub delay: Integer<u8, packed_bits::Bits<5>>,
    #[packed_field(bits = "16..=18")]
    pub bitslip: Integer<u8, packed_bits::Bits<3>>,
    #[packed_field(bits = "15")]
    pub done: bool,
    #[packed_field(bits = "8..=11")]
    pub word_fsm: Integer<u8, packed_bits::Bits<4>>,
    #[packed_field(bits = "0..=3")]
    pub phase_fsm: Integer<u8, packed_bits::Bits<4>>,
}

/// Where an alignment FSM is at, from the outside
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Progress {
    Running,
    Tuned,
    Failed,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PhaseFsmState {
    Idle,
    ResetIdelay,
    WaitResetIdelay,
    ApplyInitialDelay,
    CheckInitialDelay,
    InitialSampling,
    ProcessInitialSampling,
    ApplyDelay,
    CheckDelay,
    Sampling,
    ProcessSampling,
    WaitGoodDelay,
    FailedInitial,
    FailedToApplyDelay,
    Tuned,
    Unknown,
}

impl PhaseFsmState {
    #[must_use]
    pub const fn from_bits(bits: u8) -> Self {
        match bits & 0xF {
            0 => Self::Idle,
            1 => Self::ResetIdelay,
            2 => Self::WaitResetIdelay,
            3 => Self::ApplyInitialDelay,
            4 => Self::CheckInitialDelay,
            5 => Self::InitialSampling,
            6 => Self::ProcessInitialSampling,
            7 => Self::ApplyDelay,
            8 => Self::CheckDelay,
            9 => Self::Sampling,
            10 => Self::ProcessSampling,
            11 => Self::WaitGoodDelay,
            12 => Self::FailedInitial,
            13 => Self::FailedToApplyDelay,
            14 => Self::Tuned,
            _ => Self::Unknown,
        }
    }

    #[must_use]
    pub const fn progress(self) -> Progress {
        match self {
            Self::Tuned => Progress::Tuned,
            Self::FailedInitial | Self::FailedToApplyDelay => Progress::Failed,
            _ => Progress::Running,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WordFsmState {
    Idle,
    WaitFrame,
    ApplyBitslip,
    WaitBitslip,
    PatternVerification,
    FailedFrame,
    FailedVerification,
    Tuned,
    Unknown(u8),
}

impl WordFsmState {
    #[must_use]
    pub const fn from_bits(bits: u8) -> Self {
        match bits & 0xF {
            0 => Self::Idle,
            1 => Self::WaitFrame,
            2 => Self::ApplyBitslip,
            3 => Self::WaitBitslip,
            4 => Self::PatternVerification,
            12 => Self::FailedFrame,
            13 => Self::FailedVerification,
            14 => Self::Tuned,
            b => Self::Unknown(b),
        }
    }

    #[must_use]
    pub const fn progress(self) -> Progress {
        match self {
            Self::Tuned => Progress::Tuned,
            Self::FailedFrame | Self::FailedVerification => Progress::Failed,
            _ => Progress::Running,
        }
    }
}

/// Where a line is in its training
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LineStage {
    Idle,
    PhaseAlignment(Progress),
    WordAlignment(Progress),
}

/// Everything the tuner reports about one line
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct LineTuningState {
    pub mode: Option<LineModeKind>,
    pub delay: u8,
    pub bitslip: u8,
    pub done: bool,
    pub phase_fsm: PhaseFsmState,
    pub word_fsm: WordFsmState,
}

impl LineTuningState {
    fn from_replies(mode: ModeReply, alignment: AlignmentReply) -> Self {
        Self {
            mode: LineModeKind::from_bits(mode.mode.into()),
            delay: mode.delay.into(),
            bitslip: mode.bitslip.into(),
            done: alignment.done,
            phase_fsm: PhaseFsmState::from_bits(alignment.phase_fsm.into()),
            word_fsm: WordFsmState::from_bits(alignment.word_fsm.into()),
        }
    }

    #[must_use]
    pub fn is_phase_tuned(&self) -> bool {
        self.phase_fsm == PhaseFsmState::Tuned
    }

    #[must_use]
    pub fn is_word_aligned(&self) -> bool {
        self.word_fsm == WordFsmState::Tuned
    }

    #[must_use]
    pub fn stage(&self) -> LineStage {
        match (self.phase_fsm, self.word_fsm) {
            (PhaseFsmState::Idle, WordFsmState::Idle) => LineStage::Idle,
            (PhaseFsmState::Tuned, word) => LineStage::WordAlignment(word.progress()),
            (phase, _) => LineStage::PhaseAlignment(phase.progress()),
        }
    }
}

/// Send one command to `select`
/// # Errors
/// Returns an error on bad transport
pub fn send<T, C>(bus: &mut T, select: LineSelect, payload: &C) -> Result<(), Error>
where
    T: RegisterBus,
    C: TunerCommand + BusWord,
{
    bus.write(CONTROL, select.command(payload))?;
    Ok(())
}

/// Send a request and read its reply, checking the reply type
fn request<T, C, R>(bus: &mut T, select: LineSelect, payload: &C) -> Result<R, Error>
where
    T: RegisterBus,
    C: TunerCommand + BusWord,
    R: BusWord,
{
    send(bus, select, payload)?;
    let word = bus.read(REPLY)?;
    let reply_type = ((word >> 24) & 0xF) as u8;
    if reply_type != C::COMMAND_TYPE {
        return Err(Error::UnexpectedReply {
            expected: C::COMMAND_TYPE,
            word,
        });
    }
    Ok(R::from_word(word)?)
}

/// Load a training pattern of `length` bits
/// # Errors
/// Returns an error on bad transport
pub fn set_pattern<T: RegisterBus>(
    bus: &mut T,
    select: LineSelect,
    pattern: u8,
    length: u8,
) -> Result<(), Error> {
    send(bus, select, &PatternLength { length })?;
    send(bus, select, &PatternByte { byte_id: 0, pattern })
}

/// # Errors
/// Returns an error on bad transport or a reply of the wrong type
pub fn line_status<T: RegisterBus>(bus: &mut T, select: LineSelect) -> Result<LineTuningState, Error> {
    let mode: ModeReply = request(bus, select, &ModeRequest)?;
    let alignment: AlignmentReply = request(bus, select, &AlignmentRequest)?;
    Ok(LineTuningState::from_replies(mode, alignment))
}
