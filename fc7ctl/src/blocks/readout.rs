//! The readout block. Acquired data lands either in a plain FIFO or in the DDR3 ring buffer,
//! from which it is drained by word count and carved into event frames.

use super::fast_command::{
    self,
    Sequencer,
    MULTIPLICITY,
    TRIGGERS_TO_ACCEPT,
    TRIGGER_SOURCE,
    USER_FREQUENCY,
};
use crate::{
    core::FrontEndType,
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
        atomic::{
            AtomicUsize,
            Ordering,
        },
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
pub enum ResetError {
    #[error(transparent)]
    Transport(#[from] crate::transport::Error),
    #[error("DDR3 did not report calibration done after the readout reset")]
    Ddr3NotCalibrated,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("No start-of-frame marker at word {offset}, found {word:#010x}")]
    MissingMarker { offset: usize, word: u32 },
    #[error("Frame at word {offset} declares a size of zero")]
    ZeroSize { offset: usize },
    #[error("Frame at word {offset} declares {declared} words but only {remaining} remain")]
    Overrun {
        offset: usize,
        declared: usize,
        remaining: usize,
    },
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Transport(#[from] crate::transport::Error),
    #[error(transparent)]
    Reset(#[from] ResetError),
    #[error(transparent)]
    Sequencer(#[from] fast_command::Error),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("Readout produced no data after {0} recovery attempts")]
    Exhausted(usize),
}

const READOUT_RESET: &str = "fc7_daq_ctrl.readout_block.control.readout_reset";
const WORDS: &str = "fc7_daq_stat.readout_block.general.words_cnt";
const REQUEST: &str = "fc7_daq_stat.readout_block.general.readout_req";
const HANDSHAKE: &str = "fc7_daq_cnfg.readout_block.global.data_handshake_enable";
const ZERO_SUPPRESSION: &str = "fc7_daq_cnfg.readout_block.global.zero_suppression_enable";
const PACKET_NBR: &str = "fc7_daq_cnfg.readout_block.packet_nbr";
const FIFO: &str = "fc7_daq_ctrl.readout_block.readout_fifo";
const DDR3: &str = "fc7_daq_ddr3";
pub(crate) const DDR3_TYPE: &str = "fc7_daq_stat.ddr3_block.is_ddr3_type";
const DDR3_CALIBRATED: &str = "fc7_daq_stat.ddr3_block.init_calib_done";
const TRIGGER_IN: &str = "fc7_daq_stat.fast_command_block.trigger_in_counter";

/// The firmware stores DDR3 events in 256-bit lines
const DDR3_LINE_WORDS: usize = 8;
const FRAME_MARKER: u32 = 0xFFFF;

/// Offset of the next unread word in the DDR3 ring buffer. Shared between everything that
/// drains or resets the readout of one board.
#[derive(Debug, Default, Clone)]
pub struct Ddr3Cursor(Arc<AtomicUsize>);

impl Ddr3Cursor {
    #[must_use]
    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    fn set(&self, offset: usize) {
        self.0.store(offset, Ordering::SeqCst);
    }

    fn advance(&self, words: usize) {
        self.0.fetch_add(words, Ordering::SeqCst);
    }
}

/// Resets the downstream readout path. Cloned into every block that needs to do so.
#[derive(Debug, Clone)]
pub struct ReadoutReset {
    ddr3: bool,
    cursor: Ddr3Cursor,
    sleeper: Arc<dyn Sleeper>,
    calibration: PollPolicy,
}

impl ReadoutReset {
    const PULSE: Duration = Duration::from_millis(10);

    #[must_use]
    pub fn new(ddr3: bool, sleeper: Arc<dyn Sleeper>, calibration: PollPolicy) -> Self {
        Self {
            ddr3,
            cursor: Ddr3Cursor::default(),
            sleeper,
            calibration,
        }
    }

    #[must_use]
    pub fn is_ddr3(&self) -> bool {
        self.ddr3
    }

    #[must_use]
    pub fn cursor(&self) -> &Ddr3Cursor {
        &self.cursor
    }

    pub(crate) fn apply<T: RegisterBus>(&self, bus: &mut T) -> Result<(), ResetError> {
        bus.write(READOUT_RESET, 1)?;
        self.sleeper.sleep(Self::PULSE);
        bus.write(READOUT_RESET, 0)?;
        self.sleeper.sleep(Self::PULSE);
        if self.ddr3 {
            self.cursor.set(0);
            let calibrated = self.calibration.until(self.sleeper.as_ref(), || {
                Ok::<_, ResetError>(bus.read(DDR3_CALIBRATED)? == 1)
            })?;
            if !calibrated {
                error!("DDR3 calibration never finished");
                return Err(ResetError::Ddr3NotCalibrated);
            }
        }
        debug!("Readout reset");
        Ok(())
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadoutSettings {
    /// The buffer signals readiness before it's drained
    pub handshake: bool,
    pub zero_suppression: bool,
    /// Stop/reset/start cycles before a failing read is given up on
    pub max_recovery_attempts: usize,
    /// Consecutive polls without a new trigger after which a wait counts as stalled
    pub stall_limit: usize,
    #[serde(with = "crate::poll::micros")]
    pub recovery_pause: Duration,
    /// Waiting for any data at all when asked to block
    pub data_wait: PollPolicy,
    /// Waiting for the readout request in handshake mode
    pub handshake_wait: PollPolicy,
    pub ddr3_calibration: PollPolicy,
}

impl Default for ReadoutSettings {
    fn default() -> Self {
        Self {
            handshake: false,
            zero_suppression: false,
            max_recovery_attempts: 5,
            stall_limit: 5,
            recovery_pause: Duration::from_millis(500),
            data_wait: PollPolicy::new(1000, Duration::from_millis(1)),
            handshake_wait: PollPolicy::new(10_000, Duration::from_micros(100)),
            ddr3_calibration: PollPolicy::new(50, Duration::from_millis(100)),
        }
    }
}

/// Size of one event in words, rounded up to whole DDR3 lines when the buffer is DDR3.
/// `None` when the front end produces variable sized events.
#[must_use]
pub fn expected_event_size(
    front_end: FrontEndType,
    n_hybrids: usize,
    n_chips: usize,
    ddr3: bool,
) -> Option<usize> {
    let size = front_end.event_size(n_hybrids, n_chips)?;
    Some(if ddr3 {
        size.div_ceil(DDR3_LINE_WORDS) * DDR3_LINE_WORDS
    } else {
        size
    })
}

/// Parameters of a fixed-count handshake read
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ReadPlan {
    pub triggers: u32,
    pub interval: Duration,
    pub max_iterations: u32,
}

impl ReadPlan {
    #[must_use]
    pub fn new(n_events: u32, multiplicity: u32, source: u32, rate_khz: u32) -> Self {
        let triggers = n_events.saturating_mul(multiplicity.saturating_add(1));
        // External DIO5 and test pulses run at 1 kHz regardless of the user frequency
        let rate = if source == 5 || source == 6 {
            1
        } else {
            rate_khz.max(1)
        };
        Self {
            triggers,
            interval: Duration::from_micros(u64::from(1500u32.div_ceil(rate))),
            max_iterations: triggers.saturating_mul(2).saturating_add(10),
        }
    }
}

/// One event frame inside a readout buffer
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Frame<'a> {
    /// Word offset of the header in the buffer
    pub offset: usize,
    /// The whole frame, header included
    pub words: &'a [u32],
}

/// Walks the frames of a readout buffer, stopping after the first malformed header
#[derive(Debug, Clone)]
pub struct Frames<'a> {
    words: &'a [u32],
    offset: usize,
    failed: bool,
}

impl<'a> Iterator for Frames<'a> {
    type Item = Result<Frame<'a>, FrameError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.offset >= self.words.len() {
            return None;
        }
        let offset = self.offset;
        let header = self.words[offset];
        let remaining = self.words.len() - offset;
        let declared = (header & 0xFFFF) as usize * 4;
        let res = if header >> 16 != FRAME_MARKER {
            Err(FrameError::MissingMarker {
                offset,
                word: header,
            })
        } else if declared == 0 {
            Err(FrameError::ZeroSize { offset })
        } else if declared > remaining {
            Err(FrameError::Overrun {
                offset,
                declared,
                remaining,
            })
        } else {
            self.offset += declared;
            Ok(Frame {
                offset,
                words: &self.words[offset..offset + declared],
            })
        };
        self.failed = res.is_err();
        Some(res)
    }
}

#[must_use]
pub fn frames(words: &[u32]) -> Frames<'_> {
    Frames {
        words,
        offset: 0,
        failed: false,
    }
}

/// Split a whole buffer into frames
/// # Errors
/// Returns an error on the first malformed frame
pub fn carve(words: &[u32]) -> Result<Vec<Frame<'_>>, FrameError> {
    frames(words).collect()
}

#[derive(Debug)]
pub struct Readout<T> {
    /// Upwards pointer to the parent class' transport
    transport: Weak<Mutex<T>>,
    sleeper: Arc<dyn Sleeper>,
    reset: ReadoutReset,
    sequencer: Sequencer<T>,
    settings: ReadoutSettings,
    event_size: Option<usize>,
}

impl<T> Readout<T>
where
    T: RegisterBus,
{
    #[must_use]
    pub fn new(
        transport: Weak<Mutex<T>>,
        sleeper: Arc<dyn Sleeper>,
        reset: ReadoutReset,
        sequencer: Sequencer<T>,
        settings: ReadoutSettings,
        event_size: Option<usize>,
    ) -> Self {
        Self {
            transport,
            sleeper,
            reset,
            sequencer,
            settings,
            event_size,
        }
    }

    #[must_use]
    pub fn event_size(&self) -> Option<usize> {
        self.event_size
    }

    #[must_use]
    pub fn cursor(&self) -> &Ddr3Cursor {
        self.reset.cursor()
    }

    pub(crate) fn apply_settings_locked(&self, bus: &mut T) -> Result<(), Error> {
        bus.write_stack(&[
            (HANDSHAKE, u32::from(self.settings.handshake)),
            (ZERO_SUPPRESSION, u32::from(self.settings.zero_suppression)),
        ])?;
        Ok(())
    }

    /// # Errors
    /// Returns an error on bad transport or if the DDR3 doesn't come back calibrated
    pub fn reset(&self) -> Result<(), Error> {
        with_bus(&self.transport, |bus| Ok(self.reset.apply(bus)?))
    }

    /// Drain whatever is in the buffer, returning the number of frames and the raw words.
    /// With `wait`, block until at least one word shows up.
    /// # Errors
    /// Returns an error on bad transport, malformed frames, or if recovery is exhausted
    pub fn read_available(&self, wait: bool) -> Result<(usize, Vec<u32>), Error> {
        with_bus(&self.transport, |bus| {
            let mut attempt = 0;
            loop {
                if let Some(words) = self.try_read_available(bus, wait)? {
                    let frames = frames(&words).try_fold(0, |n, f| f.map(|_| n + 1))?;
                    debug!(frames, words = words.len(), "Read available data");
                    return Ok((frames, words));
                }
                self.recover_or_give_up(bus, &mut attempt)?;
            }
        })
    }

    /// Arm the trigger FSM for exactly `n_events` and read them through the handshake. Every
    /// accepted trigger brings its multiplicity along, so `n_events * (multiplicity + 1)` events
    /// come back.
    /// # Errors
    /// Returns an error on bad transport or if recovery is exhausted
    pub fn read_exactly(&self, n_events: u32) -> Result<Vec<u32>, Error> {
        if n_events == 0 {
            return Ok(Vec::new());
        }
        with_bus(&self.transport, |bus| {
            let plan = ReadPlan::new(
                n_events,
                bus.read(MULTIPLICITY)?,
                bus.read(TRIGGER_SOURCE)?,
                bus.read(USER_FREQUENCY)?,
            );
            debug!(?plan, n_events, "Reading a fixed number of events");
            bus.write_stack(&[
                (PACKET_NBR, plan.triggers - 1),
                (HANDSHAKE, 1),
                (TRIGGERS_TO_ACCEPT, plan.triggers),
            ])?;
            self.sequencer.load_config_locked(bus)?;
            self.reset.apply(bus)?;
            self.sequencer.start_locked(bus)?;
            let mut attempt = 0;
            loop {
                if let Some(words) = self.collect(bus, &plan)? {
                    info!(n_events, words = words.len(), "Events read");
                    return Ok(words);
                }
                self.recover_or_give_up(bus, &mut attempt)?;
            }
        })
    }

    /// Stop, reset and restart the run. A stop that leaves the FSM running uses up an attempt
    /// of its own and is retried before anything is restarted.
    fn recover_or_give_up(&self, bus: &mut T, attempt: &mut usize) -> Result<(), Error> {
        let max = self.settings.max_recovery_attempts;
        loop {
            *attempt += 1;
            if *attempt > max {
                error!(attempts = max, "Readout never produced data");
                return Err(Error::Exhausted(max));
            }
            warn!(attempt = *attempt, max, "Readout stalled, restarting the run");
            if self.sequencer.stop_locked(bus)? {
                break;
            }
            warn!(attempt = *attempt, "Trigger FSM still running, stopping it again");
        }
        self.sleeper.sleep(self.settings.recovery_pause);
        self.reset.apply(bus)?;
        self.sleeper.sleep(self.settings.recovery_pause);
        self.sequencer.start_locked(bus)?;
        self.sleeper.sleep(self.settings.recovery_pause);
        Ok(())
    }

    /// `None` means the attempt failed and recovery should be tried
    fn try_read_available(&self, bus: &mut T, wait: bool) -> Result<Option<Vec<u32>>, Error> {
        let n_words = if wait {
            let found = self.settings.data_wait.poll(self.sleeper.as_ref(), |_| {
                let n = bus.read(WORDS)?;
                Ok::<_, Error>((n > 0).then_some(n))
            })?;
            match found {
                Some(n) => n as usize,
                None => return Ok(None),
            }
        } else {
            bus.read(WORDS)? as usize
        };
        if n_words == 0 {
            return Ok(Some(Vec::new()));
        }
        if self.settings.handshake {
            if !self.wait_for_request(bus)? {
                return Ok(None);
            }
            let n_words = bus.read(WORDS)? as usize;
            let words = self.drain(bus, n_words)?;
            self.reset.cursor.set(0);
            return Ok(Some(words));
        }
        let mut words = self.drain(bus, n_words)?;
        if self.reset.ddr3 {
            // The word count can stop partway into an event, fetch the rest of it
            let size = words.first().map_or(0, |h| (h & 0xFFFF) as usize * 4);
            if size > 0 && words.len() % size != 0 {
                let missing = size - words.len() % size;
                words.extend(self.drain(bus, missing)?);
            }
            if bus.read(REQUEST)? == 1 {
                self.reset.cursor.set(0);
            }
        }
        Ok(Some(words))
    }

    /// Wait for the readout request, giving up once triggers stop arriving
    fn wait_for_request(&self, bus: &mut T) -> Result<bool, Error> {
        let mut last = bus.read(TRIGGER_IN)?;
        let mut idle = 0;
        let outcome = self.settings.handshake_wait.poll(self.sleeper.as_ref(), |_| {
            if bus.read(REQUEST)? == 1 {
                return Ok::<_, Error>(Some(true));
            }
            let triggers = bus.read(TRIGGER_IN)?;
            if triggers == last {
                idle += 1;
                if idle >= self.settings.stall_limit {
                    return Ok(Some(false));
                }
            } else {
                idle = 0;
                last = triggers;
            }
            Ok(None)
        })?;
        Ok(outcome.unwrap_or(false))
    }

    /// One handshake collection. `None` means the attempt failed.
    fn collect(&self, bus: &mut T, plan: &ReadPlan) -> Result<Option<Vec<u32>>, Error> {
        let mut ready = false;
        let mut idle = 0;
        let mut last = (0, 0);
        let (mut n_words, mut triggers) = (0, 0);
        for _ in 0..plan.max_iterations {
            self.sleeper.sleep(plan.interval);
            n_words = bus.read(WORDS)?;
            triggers = bus.read(TRIGGER_IN)?;
            if bus.read(REQUEST)? == 1 {
                ready = true;
                break;
            }
            if (n_words, triggers) == last {
                idle += 1;
                if idle >= self.settings.stall_limit {
                    break;
                }
            } else {
                idle = 0;
                last = (n_words, triggers);
            }
        }
        if (!ready && triggers < plan.triggers) || n_words == 0 {
            warn!(ready, triggers, expected = plan.triggers, n_words, "Handshake readout failed");
            return Ok(None);
        }
        if let Some(size) = self.event_size {
            if n_words as usize % size != 0 {
                warn!(n_words, size, "Word count is not a whole number of events");
                return Ok(None);
            }
        }
        let words = self.drain(bus, n_words as usize)?;
        self.reset.cursor.set(0);
        let events = match self.event_size {
            Some(size) => words.len() / size,
            None => frames(&words).take_while(Result::is_ok).count(),
        };
        if events != plan.triggers as usize {
            warn!(events, expected = plan.triggers, "Read the wrong number of events");
            return Ok(None);
        }
        Ok(Some(words))
    }

    fn drain(&self, bus: &mut T, n_words: usize) -> Result<Vec<u32>, Error> {
        if self.reset.ddr3 {
            let offset = self.reset.cursor.get();
            let words = bus.read_block_offset(DDR3, n_words, offset)?;
            self.reset.cursor.advance(n_words);
            Ok(words)
        } else {
            Ok(bus.read_block(FIFO, n_words)?)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        poll::RecordingSleeper,
        transport::mock::{
            Access,
            Mock,
        },
    };
    use paste::paste;

    const POLICY: PollPolicy = PollPolicy::new(10, Duration::from_millis(10));

    /// A well formed frame of `size` 128-bit units
    fn frame(size: u16, fill: u32) -> Vec<u32> {
        let mut words = vec![fill; usize::from(size) * 4];
        words[0] = (FRAME_MARKER << 16) | u32::from(size);
        words
    }

    fn readout(
        mock: Mock,
        ddr3: bool,
        settings: ReadoutSettings,
        event_size: Option<usize>,
    ) -> (Arc<Mutex<Mock>>, Readout<Mock>) {
        let transport = Arc::new(Mutex::new(mock));
        let sleeper: Arc<dyn Sleeper> = Arc::new(RecordingSleeper::default());
        let reset = ReadoutReset::new(ddr3, sleeper.clone(), POLICY);
        let sequencer = Sequencer::new(
            Arc::downgrade(&transport),
            sleeper.clone(),
            reset.clone(),
            None,
            POLICY,
        );
        let readout = Readout::new(
            Arc::downgrade(&transport),
            sleeper,
            reset,
            sequencer,
            settings,
            event_size,
        );
        (transport, readout)
    }

    #[test]
    fn test_carve() {
        let mut words = frame(2, 7);
        words.extend(frame(1, 9));
        let frames = carve(&words).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].offset, 8);
        assert_eq!(frames[1].words, &frame(1, 9)[..]);
    }

    macro_rules! test_bad_frame {
        ($name:ident, $words:expr, $err:expr) => {
            paste! {
                #[test]
                fn [<test_bad_frame_ $name>]() {
                    let words: Vec<u32> = $words;
                    assert_eq!(carve(&words), Err($err));
                }
            }
        };
    }

    test_bad_frame!(
        missing_marker,
        [frame(1, 0), vec![0xDEAD_0001, 0, 0, 0]].concat(),
        FrameError::MissingMarker {
            offset: 4,
            word: 0xDEAD_0001
        }
    );
    test_bad_frame!(zero_size, vec![0xFFFF_0000, 0, 0, 0], FrameError::ZeroSize { offset: 0 });
    test_bad_frame!(
        overrun,
        frame(3, 1)[..10].to_vec(),
        FrameError::Overrun {
            offset: 0,
            declared: 12,
            remaining: 10
        }
    );

    #[test]
    fn test_frames_stop_after_error() {
        let words = vec![0x1234_5678, 0xFFFF_0001, 0, 0, 0];
        assert_eq!(frames(&words).count(), 1);
    }

    #[test]
    fn test_read_plan() {
        let plan = ReadPlan::new(10, 1, 3, 100);
        assert_eq!(plan.triggers, 20);
        assert_eq!(plan.interval, Duration::from_micros(15));
        assert_eq!(plan.max_iterations, 50);
        // Test pulses are always 1 kHz
        assert_eq!(ReadPlan::new(1, 0, 6, 100).interval, Duration::from_micros(1500));
        assert_eq!(ReadPlan::new(1, 0, 3, 7).interval, Duration::from_micros(215));
        assert_eq!(ReadPlan::new(1, 0, 3, 0).interval, Duration::from_micros(1500));
    }

    #[test]
    fn test_expected_event_size() {
        assert_eq!(expected_event_size(FrontEndType::Cbc3, 1, 8, false), Some(92));
        assert_eq!(expected_event_size(FrontEndType::Cbc3, 1, 8, true), Some(96));
        assert_eq!(expected_event_size(FrontEndType::Ssa, 1, 1, true), Some(16));
        assert_eq!(expected_event_size(FrontEndType::Cic2, 2, 16, true), None);
    }

    #[test]
    fn test_read_available_fifo() {
        let data = [frame(2, 1), frame(2, 2)].concat();
        let mut mock = Mock::new();
        mock.set(WORDS, 16);
        mock.push_block(FIFO, &data);
        let (_transport, readout) = readout(mock, false, ReadoutSettings::default(), Some(8));
        assert_eq!(readout.read_available(false).unwrap(), (2, data));
    }

    #[test]
    fn test_read_available_empty() {
        let (transport, readout) = readout(Mock::new(), false, ReadoutSettings::default(), None);
        assert_eq!(readout.read_available(false).unwrap(), (0, vec![]));
        assert!(transport
            .lock()
            .unwrap()
            .log()
            .iter()
            .all(|a| !matches!(a, Access::ReadBlock(..))));
    }

    #[test]
    fn test_read_available_malformed() {
        let mut mock = Mock::new();
        mock.set(WORDS, 4);
        mock.push_block(FIFO, &[0xFFFF_0000, 0, 0, 0]);
        let (_transport, readout) = readout(mock, false, ReadoutSettings::default(), None);
        assert!(matches!(
            readout.read_available(false),
            Err(Error::Frame(FrameError::ZeroSize { offset: 0 }))
        ));
    }

    #[test]
    fn test_ddr3_cursor() {
        let data = [frame(2, 1), frame(2, 2), frame(2, 3)].concat();
        let mut mock = Mock::new();
        mock.set(WORDS, 8);
        mock.push_block(DDR3, &data);
        let (transport, readout) = readout(mock, true, ReadoutSettings::default(), Some(8));
        assert_eq!(readout.read_available(false).unwrap(), (1, frame(2, 1)));
        assert_eq!(readout.cursor().get(), 8);
        // The count stops halfway into the next event, the rest is fetched too
        transport.lock().unwrap().set(WORDS, 12);
        let (n, words) = readout.read_available(false).unwrap();
        assert_eq!(n, 2);
        assert_eq!(words, [frame(2, 2), frame(2, 3)].concat());
        assert_eq!(readout.cursor().get(), 24);
    }

    #[test]
    fn test_ddr3_cursor_wraps_on_request() {
        let mut mock = Mock::new();
        mock.set(WORDS, 4);
        mock.set(REQUEST, 1);
        mock.push_block(DDR3, &frame(1, 5));
        let (_transport, readout) = readout(mock, true, ReadoutSettings::default(), None);
        readout.read_available(false).unwrap();
        assert_eq!(readout.cursor().get(), 0);
    }

    #[test]
    fn test_ddr3_reset_needs_calibration() {
        let (_uncalibrated_bus, uncalibrated) = readout(Mock::new(), true, ReadoutSettings::default(), None);
        assert!(matches!(
            uncalibrated.reset(),
            Err(Error::Reset(ResetError::Ddr3NotCalibrated))
        ));
        let mut mock = Mock::new();
        mock.set(DDR3_CALIBRATED, 1);
        let (_calibrated_bus, calibrated) = readout(mock, true, ReadoutSettings::default(), None);
        calibrated.reset().unwrap();
        assert_eq!(calibrated.cursor().get(), 0);
    }

    #[test]
    fn test_read_available_handshake() {
        let data = frame(2, 4);
        let mut mock = Mock::new();
        mock.set(WORDS, 8);
        mock.push_block(FIFO, &data);
        // The request asserts on the third poll
        let mut polls = 0;
        mock.on_read(REQUEST, move |_| {
            polls += 1;
            u32::from(polls >= 3)
        });
        mock.on_read(TRIGGER_IN, {
            let mut n = 0;
            move |_| {
                n += 1;
                n
            }
        });
        let settings = ReadoutSettings {
            handshake: true,
            ..Default::default()
        };
        let (_transport, readout) = readout(mock, false, settings, None);
        assert_eq!(readout.read_available(true).unwrap(), (1, data));
    }

    /// Every start, stop and readout reset, in order
    fn run_control(mock: &Mock) -> Vec<&'static str> {
        mock.log()
            .iter()
            .filter_map(|a| match a {
                Access::Write(n, 1) if n.as_str() == READOUT_RESET => Some("reset"),
                Access::Write(n, 1) if n.ends_with("start_trigger") => Some("start"),
                Access::Write(n, 1) if n.ends_with("stop_trigger") => Some("stop"),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_read_exactly() {
        let data = [frame(2, 1), frame(2, 2), frame(2, 3)].concat();
        let mut mock = Mock::new();
        mock.set(USER_FREQUENCY, 100);
        mock.set(TRIGGER_SOURCE, 3);
        mock.set(WORDS, 24);
        mock.set(TRIGGER_IN, 3);
        mock.set(REQUEST, 1);
        mock.push_block(FIFO, &data);
        let (transport, readout) = readout(mock, false, ReadoutSettings::default(), Some(8));
        assert_eq!(readout.read_exactly(3).unwrap(), data);
        let mock = transport.lock().unwrap();
        assert_eq!(mock.get(PACKET_NBR), 2);
        assert_eq!(mock.get(HANDSHAKE), 1);
        assert_eq!(mock.get(TRIGGERS_TO_ACCEPT), 3);
        assert_eq!(run_control(&mock), vec!["reset", "start"]);
    }

    #[test]
    fn test_read_exactly_with_multiplicity() {
        let data: Vec<u32> = (1..=6).flat_map(|i| frame(1, i)).collect();
        let mut mock = Mock::new();
        mock.set(USER_FREQUENCY, 10);
        mock.set(MULTIPLICITY, 2);
        mock.set(WORDS, 24);
        mock.set(TRIGGER_IN, 6);
        mock.set(REQUEST, 1);
        mock.push_block(FIFO, &data);
        let (transport, readout) = readout(mock, false, ReadoutSettings::default(), None);
        assert_eq!(readout.read_exactly(2).unwrap(), data);
        assert_eq!(transport.lock().unwrap().get(TRIGGERS_TO_ACCEPT), 6);
    }

    #[test]
    fn test_read_exactly_short_read_is_retried() {
        let data = [frame(2, 1), frame(2, 2), frame(2, 3)].concat();
        let mut mock = Mock::new();
        mock.set(USER_FREQUENCY, 100);
        // Two whole events where three were asked for
        mock.set(WORDS, 16);
        mock.set(TRIGGER_IN, 3);
        mock.set(REQUEST, 1);
        mock.push_block(FIFO, &data[..16]);
        let fill = data.clone();
        mock.on_write("fc7_daq_ctrl.fast_command_block.control.stop_trigger", move |state, _| {
            state.set(WORDS, 24);
            state.push_block(FIFO, &fill);
        });
        let (transport, readout) = readout(mock, false, ReadoutSettings::default(), Some(8));
        assert_eq!(readout.read_exactly(3).unwrap(), data);
        assert_eq!(
            run_control(&transport.lock().unwrap()),
            vec!["reset", "start", "stop", "reset", "start"]
        );
    }

    #[test]
    fn test_read_exactly_extra_frames_are_retried() {
        let mut mock = Mock::new();
        mock.set(USER_FREQUENCY, 100);
        mock.set(WORDS, 16);
        mock.set(TRIGGER_IN, 1);
        mock.set(REQUEST, 1);
        mock.push_block(FIFO, &[frame(2, 1), frame(2, 2)].concat());
        mock.on_write("fc7_daq_ctrl.fast_command_block.control.stop_trigger", |state, _| {
            state.set(WORDS, 8);
            state.push_block(FIFO, &frame(2, 9));
        });
        // Sparsified events, so only the frames tell how many there are
        let (_transport, readout) = readout(mock, false, ReadoutSettings::default(), None);
        assert_eq!(readout.read_exactly(1).unwrap(), frame(2, 9));
    }

    #[test]
    fn test_read_exactly_recovers_once() {
        let data = [frame(2, 1), frame(2, 2)].concat();
        let mut mock = Mock::new();
        mock.set(USER_FREQUENCY, 100);
        // Nothing arrives until the run is restarted
        let fill = data.clone();
        mock.on_write("fc7_daq_ctrl.fast_command_block.control.stop_trigger", move |state, _| {
            state.set(WORDS, 16);
            state.set(TRIGGER_IN, 2);
            state.set(REQUEST, 1);
            state.push_block(FIFO, &fill);
        });
        let (transport, readout) = readout(mock, false, ReadoutSettings::default(), Some(8));
        assert_eq!(readout.read_exactly(2).unwrap(), data);
        assert_eq!(
            run_control(&transport.lock().unwrap()),
            vec!["reset", "start", "stop", "reset", "start"]
        );
    }

    #[test]
    fn test_read_exactly_partial_event_is_retried() {
        let mut mock = Mock::new();
        mock.set(USER_FREQUENCY, 100);
        mock.set(WORDS, 12);
        mock.set(TRIGGER_IN, 2);
        mock.set(REQUEST, 1);
        mock.on_write("fc7_daq_ctrl.fast_command_block.control.stop_trigger", |state, _| {
            state.set(WORDS, 16);
            state.push_block(FIFO, &[frame(2, 1), frame(2, 2)].concat());
        });
        let (transport, readout) = readout(mock, false, ReadoutSettings::default(), Some(8));
        assert_eq!(readout.read_exactly(2).unwrap().len(), 16);
        assert_eq!(
            run_control(&transport.lock().unwrap()),
            vec!["reset", "start", "stop", "reset", "start"]
        );
    }

    #[test]
    fn test_read_exactly_gives_up() {
        let settings = ReadoutSettings {
            max_recovery_attempts: 3,
            ..Default::default()
        };
        let (transport, readout) = readout(Mock::new(), false, settings, None);
        assert!(matches!(readout.read_exactly(5), Err(Error::Exhausted(3))));
        let control = run_control(&transport.lock().unwrap());
        assert_eq!(control.iter().filter(|c| **c == "reset").count(), 4);
        assert_eq!(control.iter().filter(|c| **c == "stop").count(), 3);
    }

    #[test]
    fn test_recovery_counts_stops_that_miss_idle() {
        let settings = ReadoutSettings {
            max_recovery_attempts: 3,
            ..Default::default()
        };
        let mut mock = Mock::new();
        // The trigger FSM never leaves the running state
        mock.set("fc7_daq_stat.fast_command_block.general.fsm_state", 1);
        let (transport, readout) = readout(mock, false, settings, None);
        assert!(matches!(readout.read_exactly(5), Err(Error::Exhausted(3))));
        // Every attempt went into stopping, the run was never restarted
        assert_eq!(
            run_control(&transport.lock().unwrap()),
            vec!["reset", "start", "stop", "stop", "stop"]
        );
    }

    #[test]
    fn test_read_exactly_zero() {
        let (transport, readout) = readout(Mock::new(), false, ReadoutSettings::default(), None);
        assert!(readout.read_exactly(0).unwrap().is_empty());
        assert!(transport.lock().unwrap().log().is_empty());
    }

    #[test]
    fn test_settings_from_toml() {
        let settings: ReadoutSettings = toml::from_str(
            r"
            handshake = true
            max_recovery_attempts = 2
            recovery_pause = 1000
            ",
        )
        .unwrap();
        assert!(settings.handshake);
        assert_eq!(settings.max_recovery_attempts, 2);
        assert_eq!(settings.recovery_pause, Duration::from_millis(1));
        assert_eq!(settings.stall_limit, 5);
    }
}
