//! Prelude (helpful reexports) for this package

pub use crate::{
    blocks::{
        cdce::{
            MgtClock,
            ReferenceSelect,
            ReferenceSource,
        },
        codec::{
            ChipRegister,
            Encoding,
            Reply,
            Transaction,
            TransactionCodec,
        },
        fast_command::{
            FastCommand,
            FastCommandKind,
            TriggerConfig,
            TriggerSource,
        },
        link_trainer::TrainingReport,
        readout::{
            carve,
            frames,
            Frame,
        },
    },
    board::{
        BoardId,
        BoardInfo,
        Boards,
        Fc7,
    },
    core::{
        Chip,
        FrontEndType,
        Hybrid,
        OpticalGroup,
        Topology,
    },
    poll::{
        PollPolicy,
        Sleeper,
        ThreadSleeper,
    },
    settings::Settings,
    transport::{
        mock::Mock,
        BusWord,
        RegisterBus,
    },
};
pub use fc7ctl_derive::BusWord;
