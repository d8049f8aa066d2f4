//! The core types describing what is connected to a board: front-end families and the read-only
//! topology of optical groups, hybrids and chips.

use crate::blocks::codec::SlaveEntry;
use serde::{
    Deserialize,
    Serialize,
};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("Firmware reports an unknown front-end chip type {0}")]
    UnknownChipType(u32),
    #[error("The topology contains no hybrids")]
    EmptyTopology,
}

/// Identifies one optical or electrical link, owned by the topology
pub type LinkId = u8;

/// The closed set of front-end ASIC families the firmware can drive
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FrontEndType {
    Cbc3,
    Mpa,
    Ssa,
    Cic,
    Cic2,
}

impl FrontEndType {
    /// Decode the `chip_type` info register
    /// # Errors
    /// Returns an error for codes this library doesn't know about
    pub fn from_code(code: u32) -> Result<Self, Error> {
        Ok(match code {
            1 => Self::Cbc3,
            2 => Self::Mpa,
            3 => Self::Ssa,
            4 => Self::Cic,
            5 => Self::Cic2,
            c => return Err(Error::UnknownChipType(c)),
        })
    }

    #[must_use]
    pub const fn code(self) -> u32 {
        match self {
            Self::Cbc3 => 1,
            Self::Mpa => 2,
            Self::Ssa => 3,
            Self::Cic => 4,
            Self::Cic2 => 5,
        }
    }

    /// Aggregator chips concentrate the data of several readout chips onto a hybrid's lines
    #[must_use]
    pub const fn is_aggregator(self) -> bool {
        matches!(self, Self::Cic | Self::Cic2)
    }

    /// Number of stub lines next to the L1 line (line 0)
    #[must_use]
    pub const fn stub_lines(self) -> u8 {
        match self {
            Self::Cbc3 | Self::Cic | Self::Cic2 => 5,
            Self::Mpa | Self::Ssa => 2,
        }
    }

    /// Added to the L1 line's bitslip when it is copied onto the first stub line
    #[must_use]
    pub const fn stub_bitslip_offset(self) -> u8 {
        if self.is_aggregator() {
            1
        } else {
            0
        }
    }

    /// Fixed event size in 32-bit words, or `None` when the aggregator sparsifies the data
    #[must_use]
    pub const fn event_size(self, n_hybrids: usize, n_chips: usize) -> Option<usize> {
        const HEADER: usize = 4;
        match self {
            Self::Cbc3 => Some(HEADER + 11 * n_chips),
            Self::Mpa => Some(HEADER + n_hybrids + 32 * n_chips),
            Self::Ssa => Some(HEADER + 12 * n_chips),
            Self::Cic | Self::Cic2 => None,
        }
    }

    /// Slave address table entries for a hybrid with `n_chips` readout chips.
    /// The position in the returned list is the slave index.
    #[must_use]
    pub fn slave_entries(self, n_chips: u8) -> Vec<SlaveEntry> {
        match self {
            Self::Cbc3 => (0..8).map(|id| SlaveEntry::new(0x41 + id, 1)).collect(),
            Self::Cic | Self::Cic2 => (0..8)
                .map(|id| SlaveEntry::new(0x41 + id, 1))
                .chain(std::iter::once(SlaveEntry::new(0x60, 2)))
                .collect(),
            Self::Mpa => (0..n_chips)
                .map(|id| SlaveEntry::new(0x40 + id, 2).without_nack())
                .collect(),
            Self::Ssa => (0..n_chips)
                .map(|id| SlaveEntry::new(0x20 + id, 2).without_nack())
                .collect(),
        }
    }
}

/// The aggregator sits after the eight CBCs in the slave table
pub const AGGREGATOR_CHIP_ID: u8 = 8;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chip {
    pub id: u8,
    pub kind: FrontEndType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hybrid {
    pub id: u8,
    pub chips: Vec<Chip>,
}

impl Hybrid {
    /// The readout chips, without any aggregator
    pub fn readout_chips(&self) -> impl Iterator<Item = &Chip> {
        self.chips.iter().filter(|c| !c.kind.is_aggregator())
    }

    #[must_use]
    pub fn aggregator(&self) -> Option<&Chip> {
        self.chips.iter().find(|c| c.kind.is_aggregator())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpticalGroup {
    pub link: LinkId,
    pub hybrids: Vec<Hybrid>,
}

/// Read-only description of everything connected to one board
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    /// Front ends are reached over optical links rather than electrical lines
    #[serde(default)]
    pub optical: bool,
    pub groups: Vec<OpticalGroup>,
}

impl Topology {
    pub fn hybrids(&self) -> impl Iterator<Item = &Hybrid> {
        self.groups.iter().flat_map(|g| g.hybrids.iter())
    }

    /// Every hybrid along with the link it hangs off
    pub fn hybrids_with_links(&self) -> impl Iterator<Item = (LinkId, &Hybrid)> {
        self.groups
            .iter()
            .flat_map(|g| g.hybrids.iter().map(move |h| (g.link, h)))
    }

    #[must_use]
    pub fn links(&self) -> Vec<LinkId> {
        self.groups.iter().map(|g| g.link).collect()
    }

    /// The front-end family that decides the board-wide behavior: the aggregator if
    /// there is one, otherwise the readout chips themselves
    /// # Errors
    /// Returns an error if there are no chips at all
    pub fn front_end(&self) -> Result<FrontEndType, Error> {
        let mut chips = self.hybrids().flat_map(|h| h.chips.iter());
        let first = chips.next().ok_or(Error::EmptyTopology)?;
        Ok(self
            .hybrids()
            .find_map(Hybrid::aggregator)
            .map_or(first.kind, |c| c.kind))
    }

    #[must_use]
    pub fn n_hybrids(&self) -> usize {
        self.hybrids().count()
    }

    #[must_use]
    pub fn n_readout_chips(&self) -> usize {
        self.hybrids().map(|h| h.readout_chips().count()).sum()
    }

    /// Number of chips a broadcast transaction reaches, aggregators included
    #[must_use]
    pub fn n_chips(&self) -> usize {
        self.hybrids().map(|h| h.chips.len()).sum()
    }
}
