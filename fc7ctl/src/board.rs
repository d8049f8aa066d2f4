//! One readout board: the bus it sits on, what its firmware reports about itself, and the
//! blocks built for its current configuration. [`Boards`] indexes any number of them by id.

use crate::{
    blocks::{
        cdce::{
            self,
            Cdce,
        },
        codec::{
            Encoding,
            Transaction,
        },
        command_processor::{
            self,
            CommandProcessor,
        },
        fast_command::{
            self,
            Sequencer,
        },
        link_trainer::{
            self,
            LinkTrainer,
            TrainingReport,
        },
        optical::{
            self,
            OpticalLock,
        },
        readout::{
            self,
            expected_event_size,
            Readout,
            ReadoutReset,
            DDR3_TYPE,
        },
    },
    core::{
        self,
        FrontEndType,
        Topology,
    },
    poll::{
        Sleeper,
        ThreadSleeper,
    },
    settings::Settings,
    transport::{
        with_bus,
        RegisterBus,
    },
};
use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        Mutex,
    },
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
    Core(#[from] core::Error),
    #[error(transparent)]
    Clock(#[from] cdce::Error),
    #[error(transparent)]
    Commands(#[from] command_processor::Error),
    #[error(transparent)]
    Optical(#[from] optical::Error),
    #[error(transparent)]
    Sequencer(#[from] fast_command::Error),
    #[error(transparent)]
    Trainer(#[from] link_trainer::Error),
    #[error(transparent)]
    Readout(#[from] readout::Error),
    #[error("Firmware was built for {firmware:?} front ends but the topology has {topology:?}")]
    FrontEndMismatch {
        firmware: FrontEndType,
        topology: FrontEndType,
    },
    #[error("The board has not been configured yet")]
    NotConfigured,
    #[error("No board with id {0}")]
    UnknownBoard(BoardId),
}

pub type BoardId = u16;

/// How the firmware reaches its front ends
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Implementation {
    Optical,
    Electrical,
    /// Front ends are emulated in the firmware itself
    Emulation,
    Unknown(u32),
}

impl From<u32> for Implementation {
    fn from(v: u32) -> Self {
        match v {
            0 => Self::Optical,
            1 => Self::Electrical,
            2 => Self::Emulation,
            v => Self::Unknown(v),
        }
    }
}

/// What the firmware was built for
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BoardInfo {
    pub front_end: FrontEndType,
    pub n_hybrids: u32,
    /// Readout chips per hybrid
    pub n_chips: u32,
    pub implementation: Implementation,
    /// Events are buffered in DDR3 rather than a FIFO
    pub ddr3: bool,
    /// The command processor's protocol version, which picks the transaction encoding
    pub command_version: u32,
}

const INFO: &str = "fc7_daq_stat.general.info.";

impl BoardInfo {
    /// # Errors
    /// Returns an error on bad transport or an unknown chip type
    pub fn read<T: RegisterBus>(bus: &mut T) -> Result<Self, Error> {
        let info = |field: &str| format!("{INFO}{field}");
        Ok(Self {
            front_end: FrontEndType::from_code(bus.read(&info("chip_type"))?)?,
            n_hybrids: bus.read(&info("num_hybrids"))?,
            n_chips: bus.read(&info("num_chips"))?,
            implementation: bus.read(&info("implementation"))?.into(),
            ddr3: bus.read(DDR3_TYPE)? == 1,
            command_version: bus.read(CommandProcessor::<T>::VERSION)?,
        })
    }
}

/// Per-hybrid enable masks, as written to the firmware
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChipEnables {
    /// Hybrid id and a bit per readout chip that answered
    pub chips: Vec<(u8, u32)>,
    /// A bit per hybrid whose aggregator (or every readout chip) answered
    pub hybrids: u32,
}

const CHIPS_ENABLE: &str = "fc7_daq_cnfg.global.chips_enable_hyb_";
const HYBRID_ENABLE: &str = "fc7_daq_cnfg.global.hybrid_enable";

fn bit(n: u8) -> u32 {
    1u32.checked_shl(u32::from(n)).unwrap_or(0)
}

/// Read address 0 of every chip and enable the ones that answer
fn enable_chips<T: RegisterBus>(
    bus: &mut T,
    commands: &CommandProcessor<T>,
    topology: &Topology,
) -> Result<ChipEnables, Error> {
    let queries: Vec<_> = topology
        .hybrids()
        .flat_map(|h| h.chips.iter().map(|c| Transaction::read(h.id, c.id, 0, 0)))
        .collect();
    let replies = commands.query_chips_locked(bus, &queries)?;
    let answered = |hybrid: u8, chip: u8| {
        replies
            .iter()
            .any(|r| r.is_read && !r.failed && r.hybrid == hybrid && r.chip == chip)
    };
    let mut enables = ChipEnables::default();
    for hybrid in topology.hybrids() {
        let mask = hybrid
            .readout_chips()
            .filter(|c| answered(hybrid.id, c.id))
            .fold(0, |mask, c| mask | bit(c.id));
        let enabled = match hybrid.aggregator() {
            Some(aggregator) => answered(hybrid.id, aggregator.id),
            None => mask.count_ones() as usize == hybrid.readout_chips().count(),
        };
        if enabled {
            enables.hybrids |= bit(hybrid.id);
        } else {
            warn!(hybrid = hybrid.id, chips = mask, "Hybrid left disabled");
        }
        debug!(hybrid = hybrid.id, chips = mask, "Chips enabled");
        enables.chips.push((hybrid.id, mask));
    }
    let names: Vec<_> = enables
        .chips
        .iter()
        .map(|(id, mask)| (format!("{CHIPS_ENABLE}{id:02}"), *mask))
        .collect();
    let mut stack: Vec<(&str, u32)> = names.iter().map(|(n, v)| (n.as_str(), *v)).collect();
    stack.push((HYBRID_ENABLE, enables.hybrids));
    bus.write_stack(&stack)?;
    Ok(enables)
}

/// The blocks of one configuration. They all point back at the board's bus.
#[derive(Debug)]
pub struct Blocks<T> {
    pub clock: Cdce<T>,
    pub commands: CommandProcessor<T>,
    pub sequencer: Sequencer<T>,
    pub trainer: LinkTrainer<T>,
    pub readout: Readout<T>,
}

#[derive(Debug)]
struct Configured<T> {
    info: BoardInfo,
    topology: Topology,
    enables: ChipEnables,
    blocks: Blocks<T>,
}

#[derive(Debug)]
pub struct Fc7<T> {
    pub transport: Arc<Mutex<T>>,
    sleeper: Arc<dyn Sleeper>,
    configured: Option<Configured<T>>,
}

impl<T> Fc7<T>
where
    T: RegisterBus,
{
    pub fn new(transport: T) -> Self {
        Self::with_sleeper(transport, Arc::new(ThreadSleeper))
    }

    pub fn with_sleeper(transport: T, sleeper: Arc<dyn Sleeper>) -> Self {
        Self {
            transport: Arc::new(Mutex::new(transport)),
            sleeper,
            configured: None,
        }
    }

    /// Read the firmware's description of itself
    /// # Errors
    /// Returns an error on bad transport or an unknown chip type
    pub fn info(&self) -> Result<BoardInfo, Error> {
        with_bus(&Arc::downgrade(&self.transport), |bus| BoardInfo::read(bus))
    }

    fn configured(&self) -> Result<&Configured<T>, Error> {
        self.configured.as_ref().ok_or(Error::NotConfigured)
    }

    /// The blocks of the current configuration
    /// # Errors
    /// Returns an error if the board hasn't been configured
    pub fn blocks(&self) -> Result<&Blocks<T>, Error> {
        Ok(&self.configured()?.blocks)
    }

    #[must_use]
    pub fn topology(&self) -> Option<&Topology> {
        self.configured.as_ref().map(|c| &c.topology)
    }

    #[must_use]
    pub fn enables(&self) -> Option<&ChipEnables> {
        self.configured.as_ref().map(|c| &c.enables)
    }

    #[must_use]
    pub fn is_configured(&self) -> bool {
        self.configured.is_some()
    }

    /// Bring the board up for `topology`: check the firmware matches it, program the clock,
    /// resolve the transaction encoding and load its slave table, enable the chips that answer,
    /// then apply the trigger configuration (which ends in a readout reset).
    /// Any previous configuration is dropped first.
    /// # Errors
    /// Returns an error on bad transport, a firmware/topology mismatch, or the first step that
    /// fails. The board is left unconfigured.
    pub fn configure(&mut self, topology: Topology, settings: &Settings) -> Result<&BoardInfo, Error> {
        self.configured = None;
        let weak = Arc::downgrade(&self.transport);
        let sleeper = &self.sleeper;
        let configured = with_bus(&weak, |bus| {
            let info = BoardInfo::read(bus)?;
            let front_end = topology.front_end()?;
            if info.front_end != front_end {
                error!(firmware = ?info.front_end, topology = ?front_end, "Front-end mismatch");
                return Err(Error::FrontEndMismatch {
                    firmware: info.front_end,
                    topology: front_end,
                });
            }
            debug!(?info, "Board info");

            let reset = ReadoutReset::new(
                info.ddr3,
                sleeper.clone(),
                settings.readout.ddr3_calibration,
            );
            let sequencer = Sequencer::new(
                weak.clone(),
                sleeper.clone(),
                reset.clone(),
                Some(front_end),
                settings.polling.fsm_idle,
            );
            let encoding = Encoding::select(info.command_version, topology.optical);
            let blocks = Blocks {
                clock: Cdce::new(weak.clone(), sleeper.clone(), settings.polling.clock_lock),
                commands: CommandProcessor::new(
                    weak.clone(),
                    sleeper.clone(),
                    encoding.codec(&topology)?,
                    settings.polling.reply_fifo,
                    topology.n_chips(),
                ),
                trainer: LinkTrainer::new(
                    weak.clone(),
                    sleeper.clone(),
                    OpticalLock::new(weak.clone(), sleeper.clone(), settings.polling.optical_lock),
                    sequencer.clone(),
                    settings.trainer,
                ),
                readout: Readout::new(
                    weak.clone(),
                    sleeper.clone(),
                    reset,
                    sequencer.clone(),
                    settings.readout,
                    expected_event_size(
                        front_end,
                        topology.n_hybrids(),
                        topology.n_readout_chips(),
                        info.ddr3,
                    ),
                ),
                sequencer,
            };

            let clock = settings.clock;
            blocks
                .clock
                .configure_locked(bus, clock.mgt, clock.reference, clock.store)?;
            if topology.optical {
                // Nothing on the command bus answers until the links are up
                blocks.trainer.optical().lock_locked(bus, &topology.links())?;
            }
            blocks.commands.load_slave_table_locked(bus)?;
            blocks.trainer.reset_front_ends_locked(bus, front_end)?;
            let enables = enable_chips(bus, &blocks.commands, &topology)?;
            blocks.readout.apply_settings_locked(bus)?;
            blocks.sequencer.reconfigure_locked(bus, &settings.trigger)?;
            blocks.sequencer.orbit_reset_locked(bus)?;
            blocks.sequencer.fast_reset_locked(bus)?;
            info!(?front_end, ?encoding, hybrids = enables.hybrids, "Board configured");
            Ok(Configured {
                info,
                topology,
                enables,
                blocks,
            })
        })?;
        Ok(&self.configured.insert(configured).info)
    }

    /// Train the links of the configured topology
    /// # Errors
    /// Returns an error if the board isn't configured or a link can't be trained
    pub fn train(&self) -> Result<TrainingReport, Error> {
        let configured = self.configured()?;
        with_bus(&Arc::downgrade(&self.transport), |bus| {
            Ok(configured
                .blocks
                .trainer
                .train_locked(bus, &configured.topology)?)
        })
    }

    /// # Errors
    /// Returns an error if the board isn't configured or on bad transport
    pub fn start(&self) -> Result<(), Error> {
        Ok(self.blocks()?.sequencer.start()?)
    }

    /// Returns whether the trigger FSM went back to idle
    /// # Errors
    /// Returns an error if the board isn't configured or on bad transport
    pub fn stop(&self) -> Result<bool, Error> {
        Ok(self.blocks()?.sequencer.stop()?)
    }

    /// # Errors
    /// Returns an error if the board isn't configured or on bad transport
    pub fn pause(&self) -> Result<(), Error> {
        Ok(self.blocks()?.sequencer.pause()?)
    }

    /// # Errors
    /// Returns an error if the board isn't configured, on bad transport, or if the readout
    /// doesn't come back after its reset
    pub fn resume(&self) -> Result<(), Error> {
        Ok(self.blocks()?.sequencer.resume()?)
    }

    /// See [`Readout::read_available`]
    /// # Errors
    /// Returns an error if the board isn't configured or the read fails for good
    pub fn read_available(&self, wait: bool) -> Result<(usize, Vec<u32>), Error> {
        Ok(self.blocks()?.readout.read_available(wait)?)
    }

    /// See [`Readout::read_exactly`]
    /// # Errors
    /// Returns an error if the board isn't configured or the read fails for good
    pub fn read_exactly(&self, n_events: u32) -> Result<Vec<u32>, Error> {
        Ok(self.blocks()?.readout.read_exactly(n_events)?)
    }
}

/// Every board of a setup, by id. Operations always name the board they act on.
#[derive(Debug)]
pub struct Boards<T> {
    boards: BTreeMap<BoardId, Fc7<T>>,
}

impl<T> Default for Boards<T> {
    fn default() -> Self {
        Self {
            boards: BTreeMap::new(),
        }
    }
}

impl<T> Boards<T>
where
    T: RegisterBus,
{
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the board previously stored under `id`, if any
    pub fn insert(&mut self, id: BoardId, board: Fc7<T>) -> Option<Fc7<T>> {
        self.boards.insert(id, board)
    }

    pub fn remove(&mut self, id: BoardId) -> Option<Fc7<T>> {
        self.boards.remove(&id)
    }

    /// # Errors
    /// Returns an error if there is no such board
    pub fn get(&self, id: BoardId) -> Result<&Fc7<T>, Error> {
        self.boards.get(&id).ok_or(Error::UnknownBoard(id))
    }

    /// # Errors
    /// Returns an error if there is no such board
    pub fn get_mut(&mut self, id: BoardId) -> Result<&mut Fc7<T>, Error> {
        self.boards.get_mut(&id).ok_or(Error::UnknownBoard(id))
    }

    pub fn ids(&self) -> impl Iterator<Item = BoardId> + '_ {
        self.boards.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.boards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.boards.is_empty()
    }

    /// # Errors
    /// Returns an error if there is no such board or its configuration fails
    pub fn configure(
        &mut self,
        id: BoardId,
        topology: Topology,
        settings: &Settings,
    ) -> Result<BoardInfo, Error> {
        self.get_mut(id)?.configure(topology, settings).copied()
    }

    /// Start triggers on every board in id order, stopping at the first failure
    /// # Errors
    /// Returns the first board's error
    pub fn start_all(&self) -> Result<(), Error> {
        for (id, board) in &self.boards {
            board.start()?;
            debug!(id, "Board started");
        }
        Ok(())
    }

    /// Stop triggers on every board, returning whether each went idle
    /// # Errors
    /// Returns the first board's error
    pub fn stop_all(&self) -> Result<Vec<(BoardId, bool)>, Error> {
        self.boards
            .iter()
            .map(|(id, board)| Ok((*id, board.stop()?)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        blocks::codec::{
            reply_word,
            SlaveMap,
            SlaveTableCodec,
            TransactionCodec,
        },
        core::tests::topology,
        poll::RecordingSleeper,
        transport::mock::{
            Access,
            Mock,
        },
    };

    const CMD: &str = "fc7_daq_ctrl.command_processor_block.i2c.command_fifo";
    const REPLY: &str = "fc7_daq_ctrl.command_processor_block.i2c.reply_fifo";
    const NREPLIES: &str = "fc7_daq_stat.command_processor_block.i2c.nreplies";
    const FSM_RESET: &str = "fc7_daq_ctrl.fast_command_block.control.reset";
    const READOUT_RESET: &str = "fc7_daq_ctrl.readout_block.control.readout_reset";
    const CHIP_HARD_RESET: &str = "fc7_daq_ctrl.physical_interface_block.control.chip_hard_reset";

    /// An SSA board whose chips all answer except `absent`
    fn ssa_board(chip_type: u32, absent: Option<(u8, u8)>) -> Mock {
        let mut mock = Mock::new();
        mock.set("fc7_daq_stat.general.info.chip_type", chip_type);
        mock.set("fc7_daq_stat.general.info.num_hybrids", 2);
        mock.set("fc7_daq_stat.general.info.num_chips", 2);
        mock.set("fc7_daq_stat.general.info.implementation", 1);
        mock.set("fc7_daq_stat.command_processor_block.i2c.master_version", 1);
        mock.on_write("sysreg.ctrl.cdce_sync", |state, v| {
            state.set("fc7_daq_stat.general.clock_generator.clk_40_locked", v);
            state.set("fc7_daq_stat.general.clock_generator.ref_clk_locked", v);
        });
        let codec = SlaveTableCodec::new(SlaveMap::for_front_end(FrontEndType::Ssa, 2));
        mock.on_write_block(CMD, move |state, words| {
            let replies: Vec<u32> = codec
                .decode_all(words)
                .unwrap()
                .iter()
                .filter(|t| t.read_back && Some((t.hybrid, t.chip)) != absent)
                .map(|t| reply_word(codec.encoding(), t, false))
                .collect();
            state.blocks.remove(REPLY);
            state.push_block(REPLY, &replies);
            state.set(NREPLIES, u32::try_from(replies.len()).unwrap());
        });
        mock
    }

    fn board(mock: Mock) -> Fc7<Mock> {
        Fc7::with_sleeper(mock, Arc::new(RecordingSleeper::default()))
    }

    fn position(log: &[Access], access: &Access) -> usize {
        log.iter()
            .position(|a| a == access)
            .unwrap_or_else(|| panic!("{access:?} never happened"))
    }

    #[test]
    fn test_info() {
        let fc7 = board(ssa_board(3, None));
        let info = fc7.info().unwrap();
        assert_eq!(info.front_end, FrontEndType::Ssa);
        assert_eq!(info.n_hybrids, 2);
        assert_eq!(info.implementation, Implementation::Electrical);
        assert!(!info.ddr3);
        assert_eq!(info.command_version, 1);
    }

    #[test]
    fn test_configure() {
        let mut fc7 = board(ssa_board(3, Some((1, 1))));
        let info = *fc7
            .configure(topology(FrontEndType::Ssa, None, 2, 2), &Settings::default())
            .unwrap();
        assert_eq!(info.front_end, FrontEndType::Ssa);
        assert!(fc7.is_configured());
        assert_eq!(fc7.blocks().unwrap().readout.event_size(), Some(4 + 12 * 4));

        let enables = fc7.enables().unwrap();
        assert_eq!(enables.chips, vec![(0, 0b11), (1, 0b01)]);
        assert_eq!(enables.hybrids, 0b01);

        let mock = fc7.transport.lock().unwrap();
        assert_eq!(mock.writes_to("fc7_daq_cnfg.global.chips_enable_hyb_00"), [0b11]);
        assert_eq!(mock.writes_to("fc7_daq_cnfg.global.chips_enable_hyb_01"), [0b01]);
        assert_eq!(mock.writes_to(HYBRID_ENABLE), [0b01]);
        assert_eq!(mock.writes_to("fc7_daq_cnfg.fast_command_block.trigger_source"), [3]);

        // Clock, then chip queries, then the trigger FSM and finally the readout reset
        let log = mock.log();
        let sync = position(log, &Access::Write("sysreg.ctrl.cdce_sync".into(), 1));
        let hard_reset = position(log, &Access::Write(CHIP_HARD_RESET.into(), 1));
        let query = log
            .iter()
            .position(|a| matches!(a, Access::WriteBlock(name, _) if name.as_str() == CMD))
            .unwrap();
        let enable = position(log, &Access::Write(HYBRID_ENABLE.into(), 0b01));
        let fsm = position(log, &Access::Write(FSM_RESET.into(), 1));
        let readout = position(log, &Access::Write(READOUT_RESET.into(), 1));
        assert!(sync < hard_reset);
        assert!(hard_reset < query);
        assert!(query < enable);
        assert!(enable < fsm);
        assert!(fsm < readout);
    }

    #[test]
    fn test_front_end_mismatch() {
        let mut fc7 = board(ssa_board(2, None));
        match fc7.configure(topology(FrontEndType::Ssa, None, 2, 2), &Settings::default()) {
            Err(Error::FrontEndMismatch { firmware, topology }) => {
                assert_eq!(firmware, FrontEndType::Mpa);
                assert_eq!(topology, FrontEndType::Ssa);
            }
            other => panic!("Expected a mismatch, got {other:?}"),
        }
        assert!(!fc7.is_configured());
        // Nothing was written before the check
        assert!(fc7
            .transport
            .lock()
            .unwrap()
            .log()
            .iter()
            .all(|a| matches!(a, Access::Read(_))));
    }

    #[test]
    fn test_not_configured() {
        let fc7 = board(ssa_board(3, None));
        assert!(matches!(fc7.start(), Err(Error::NotConfigured)));
        assert!(matches!(fc7.train(), Err(Error::NotConfigured)));
        assert!(matches!(fc7.read_available(false), Err(Error::NotConfigured)));
    }

    #[test]
    fn test_run() {
        let mut fc7 = board(ssa_board(3, None));
        fc7.configure(topology(FrontEndType::Ssa, None, 1, 2), &Settings::default())
            .unwrap();
        fc7.start().unwrap();
        {
            let mut mock = fc7.transport.lock().unwrap();
            let mut words = vec![0; 8];
            words[0] = 0xFFFF_0001;
            words[4] = 0xFFFF_0001;
            mock.push_block("fc7_daq_ctrl.readout_block.readout_fifo", &words);
            mock.set("fc7_daq_stat.readout_block.general.words_cnt", 8);
        }
        let (frames, words) = fc7.read_available(false).unwrap();
        assert_eq!(frames, 2);
        assert_eq!(words.len(), 8);
        assert!(fc7.stop().unwrap());
    }

    #[test]
    fn test_arena() {
        let mut boards = Boards::new();
        assert!(boards.insert(0, board(ssa_board(3, None))).is_none());
        assert!(boards.insert(3, board(ssa_board(3, None))).is_none());
        assert_eq!(boards.ids().collect::<Vec<_>>(), [0, 3]);
        assert!(matches!(boards.get(1), Err(Error::UnknownBoard(1))));

        let info = boards
            .configure(3, topology(FrontEndType::Ssa, None, 1, 2), &Settings::default())
            .unwrap();
        assert_eq!(info.front_end, FrontEndType::Ssa);
        assert!(boards.get(3).unwrap().is_configured());
        assert!(!boards.get(0).unwrap().is_configured());
        // Board 0 was never configured, so starting everything fails on it
        assert!(matches!(boards.start_all(), Err(Error::NotConfigured)));

        boards.remove(0);
        boards.start_all().unwrap();
        assert_eq!(boards.stop_all().unwrap(), [(3, true)]);
        assert_eq!(boards.len(), 1);
    }
}
