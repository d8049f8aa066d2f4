//! Packing of chip register operations into command-processor words. Three encodings coexist:
//! the legacy direct-address single word, the slave-table indexed pair of words and the optical
//! variant of the latter that also carries the link. One of them is resolved per configuration
//! from the protocol version the firmware reports and held for the rest of the run.

use crate::{
    core::{
        FrontEndType,
        LinkId,
        Topology,
    },
    transport::{
        BusWord,
        TransportResult,
    },
};
use fc7ctl_derive::BusWord;
use packed_struct::prelude::*;
use std::{
    collections::HashMap,
    fmt::Debug,
};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("Chip {chip} on hybrid {hybrid} is not in the slave address table")]
    UnknownTarget { hybrid: u8, chip: u8 },
    #[error("Hybrid {0} is not connected to any optical link")]
    UnknownLink(u8),
    #[error("`{field}` = {value} doesn't fit in the {encoding:?} encoding")]
    FieldOverflow {
        encoding: Encoding,
        field: &'static str,
        value: u8,
    },
    #[error("Word {0:#010x} does not start a chip transaction")]
    Unexpected(u32),
    #[error("Transaction is missing its data word")]
    Truncated,
}

/// One register of a front-end chip. Pages select between register banks on chips that have them.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ChipRegister {
    pub page: u8,
    pub address: u8,
    pub value: u8,
}

/// A single register operation aimed at one chip
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub hybrid: u8,
    pub chip: u8,
    pub register: ChipRegister,
    /// A reply is expected for this transaction
    pub read_back: bool,
    pub write: bool,
}

impl Transaction {
    #[must_use]
    pub fn read(hybrid: u8, chip: u8, page: u8, address: u8) -> Self {
        Self {
            hybrid,
            chip,
            register: ChipRegister {
                page,
                address,
                value: 0,
            },
            read_back: true,
            write: false,
        }
    }

    #[must_use]
    pub fn write(hybrid: u8, chip: u8, register: ChipRegister, verify: bool) -> Self {
        Self {
            hybrid,
            chip,
            register,
            read_back: verify,
            write: true,
        }
    }
}

/// A decoded reply from the reply FIFO
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Reply {
    pub hybrid: u8,
    pub chip: u8,
    pub register: ChipRegister,
    pub is_read: bool,
    pub failed: bool,
}

impl Reply {
    /// Whether this reply acknowledges `sent` as written
    #[must_use]
    pub fn acknowledges(&self, sent: &Transaction) -> bool {
        !self.failed
            && !self.is_read
            && self.hybrid == sent.hybrid
            && self.chip == sent.chip
            && self.register == sent.register
    }
}

/// The three word layouts the command processor understands
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Encoding {
    Legacy,
    SlaveTable,
    Optical,
}

impl Encoding {
    /// Pick the encoding from the command processor's `master_version`
    #[must_use]
    pub fn select(version: u32, optical: bool) -> Self {
        match (optical, version) {
            (true, _) => Self::Optical,
            (false, 0) => Self::Legacy,
            (false, _) => Self::SlaveTable,
        }
    }

    /// Build the codec strategy for this encoding and configuration
    /// # Errors
    /// Returns an error if the topology is empty
    pub fn codec(
        self,
        topology: &Topology,
    ) -> Result<Box<dyn TransactionCodec>, crate::core::Error> {
        let front_end = topology.front_end()?;
        // Chip ids index the table directly, so it has to reach the highest one
        let n_chips = topology
            .hybrids()
            .flat_map(|h| h.readout_chips())
            .map(|c| c.id.saturating_add(1))
            .max()
            .unwrap_or_default();
        let slaves = SlaveMap::for_front_end(front_end, n_chips);
        Ok(match self {
            Self::Legacy => Box::new(LegacyCodec),
            Self::SlaveTable => Box::new(SlaveTableCodec { slaves }),
            Self::Optical => Box::new(OpticalCodec {
                slaves,
                links: topology
                    .hybrids_with_links()
                    .map(|(link, h)| (h.id, link))
                    .collect(),
            }),
        })
    }
}

/// The strategy every encoding implements
pub trait TransactionCodec: Debug + Send + Sync {
    fn encoding(&self) -> Encoding;

    /// Encode one chip transaction into its bus word(s)
    /// # Errors
    /// Returns an error if the target isn't addressable or a field doesn't fit
    fn encode(
        &self,
        register: &ChipRegister,
        hybrid: u8,
        chip: u8,
        read_back: bool,
        write: bool,
    ) -> Result<Vec<u32>, Error>;

    /// Encode a transaction aimed at every enabled chip at once
    /// # Errors
    /// Returns an error if a field doesn't fit
    fn encode_broadcast(
        &self,
        register: &ChipRegister,
        read_back: bool,
        write: bool,
    ) -> Result<Vec<u32>, Error>;

    /// Decode the transaction starting at `words[0]`, returning it and the number of words used
    /// # Errors
    /// Returns an error if the words aren't a chip-addressed transaction
    fn decode(&self, words: &[u32]) -> Result<(Transaction, usize), Error>;

    /// Decode one word from the reply FIFO
    /// # Errors
    /// Returns an error if the reply names a chip that isn't in the slave table
    fn decode_reply(&self, word: u32) -> Result<Reply, Error>;

    /// Whether the firmware will produce a reply for this command word
    fn expects_reply(&self, word: u32) -> bool;

    /// The slave table that must be loaded into the firmware for this encoding
    fn slave_map(&self) -> Option<&SlaveMap> {
        None
    }

    /// # Errors
    /// Returns an error if the target isn't addressable or a field doesn't fit
    fn encode_transaction(&self, t: &Transaction) -> Result<Vec<u32>, Error> {
        self.encode(&t.register, t.hybrid, t.chip, t.read_back, t.write)
    }

    /// Decode a whole command stream
    /// # Errors
    /// Returns the first decoding error
    fn decode_all(&self, mut words: &[u32]) -> Result<Vec<Transaction>, Error> {
        let mut transactions = vec![];
        while !words.is_empty() {
            let (t, used) = self.decode(words)?;
            transactions.push(t);
            words = &words[used..];
        }
        Ok(transactions)
    }
}

fn fits(encoding: Encoding, field: &'static str, value: u8, bits: u32) -> Result<(), Error> {
    if u32::from(value) >> bits == 0 {
        Ok(())
    } else {
        Err(Error::FieldOverflow {
            encoding,
            field,
            value,
        })
    }
}

const BROADCAST_OPCODE: u8 = 2;

/// The single-word direct-address layout of protocol version 0
#[derive(Debug, PackedStruct, Default, Copy, Clone, PartialEq, Eq, BusWord)]
#[packed_struct(bit_numbering = "lsb0", size_bytes = "4")]
pub struct LegacyWord {
    #[packed_field(bits = "28..=31")]
    opcode: Integer<u8, packed_bits::Bits<4>>,
    #[packed_field(bits = "24..=27")]
    hybrid: Integer<u8, packed_bits::Bits<4>>,
    #[packed_field(bits = "20..=23")]
    chip: Integer<u8, packed_bits::Bits<4>>,
    #[packed_field(bits = "19")]
    verify: bool,
    #[packed_field(bits = "17")]
    page: bool,
    #[packed_field(bits = "16")]
    read: bool,
    #[packed_field(bits = "8..=15")]
    address: u8,
    #[packed_field(bits = "0..=7")]
    value: u8,
}

#[derive(Debug, Default, Copy, Clone)]
pub struct LegacyCodec;

impl LegacyCodec {
    fn word(register: &ChipRegister, read_back: bool, write: bool) -> Result<LegacyWord, Error> {
        fits(Encoding::Legacy, "page", register.page, 1)?;
        Ok(LegacyWord {
            verify: write && read_back,
            page: register.page == 1,
            read: !write,
            address: register.address,
            // A read never carries a value
            value: if write { register.value } else { 0 },
            ..Default::default()
        })
    }
}

impl TransactionCodec for LegacyCodec {
    fn encoding(&self) -> Encoding {
        Encoding::Legacy
    }

    fn encode(
        &self,
        register: &ChipRegister,
        hybrid: u8,
        chip: u8,
        read_back: bool,
        write: bool,
    ) -> Result<Vec<u32>, Error> {
        fits(Encoding::Legacy, "hybrid", hybrid, 4)?;
        fits(Encoding::Legacy, "chip", chip, 4)?;
        let word = LegacyWord {
            hybrid: hybrid.into(),
            chip: chip.into(),
            ..Self::word(register, read_back, write)?
        };
        Ok(vec![word.to_word()])
    }

    fn encode_broadcast(
        &self,
        register: &ChipRegister,
        read_back: bool,
        write: bool,
    ) -> Result<Vec<u32>, Error> {
        let word = LegacyWord {
            opcode: BROADCAST_OPCODE.into(),
            ..Self::word(register, read_back, write)?
        };
        Ok(vec![word.to_word()])
    }

    fn decode(&self, words: &[u32]) -> Result<(Transaction, usize), Error> {
        let first = *words.first().ok_or(Error::Truncated)?;
        let word = LegacyWord::from_word(first).map_err(|_| Error::Unexpected(first))?;
        if u8::from(word.opcode) != 0 {
            return Err(Error::Unexpected(first));
        }
        Ok((
            Transaction {
                hybrid: word.hybrid.into(),
                chip: word.chip.into(),
                register: ChipRegister {
                    page: u8::from(word.page),
                    address: word.address,
                    value: word.value,
                },
                // The firmware answers every legacy read, so a read always comes back as read_back
                read_back: word.read || word.verify,
                write: !word.read,
            },
            1,
        ))
    }

    fn decode_reply(&self, word: u32) -> Result<Reply, Error> {
        let reply = LegacyWord::from_word(word).map_err(|_| Error::Unexpected(word))?;
        Ok(Reply {
            hybrid: reply.hybrid.into(),
            chip: reply.chip.into(),
            register: ChipRegister {
                page: u8::from(reply.page),
                address: reply.address,
                value: reply.value,
            },
            is_read: reply.read,
            failed: false,
        })
    }

    fn expects_reply(&self, word: u32) -> bool {
        LegacyWord::from_word(word).map_or(false, |w| w.read || w.verify)
    }
}

/// First word of a slave-table (or optical) transaction
#[derive(Debug, PackedStruct, Default, Copy, Clone, PartialEq, Eq, BusWord)]
#[packed_struct(bit_numbering = "lsb0", size_bytes = "4")]
pub struct IndexedWord {
    /// Always zero on electrical boards
    #[packed_field(bits = "29..=31")]
    link: Integer<u8, packed_bits::Bits<3>>,
    #[packed_field(bits = "28")]
    broadcast: bool,
    /// Set only on the data word following a write
    #[packed_field(bits = "27")]
    data: bool,
    #[packed_field(bits = "23..=26")]
    hybrid: Integer<u8, packed_bits::Bits<4>>,
    #[packed_field(bits = "18..=22")]
    slave: Integer<u8, packed_bits::Bits<5>>,
    #[packed_field(bits = "17")]
    verify: bool,
    #[packed_field(bits = "16")]
    read: bool,
    /// Holds the page on the first word and the value on the data word
    #[packed_field(bits = "8..=15")]
    page: u8,
    #[packed_field(bits = "0..=7")]
    payload: u8,
}

/// Layout of slave-table and optical replies
#[derive(Debug, PackedStruct, Default, Copy, Clone, PartialEq, Eq, BusWord)]
#[packed_struct(bit_numbering = "lsb0", size_bytes = "4")]
pub struct IndexedReply {
    #[packed_field(bits = "27..=30")]
    hybrid: Integer<u8, packed_bits::Bits<4>>,
    #[packed_field(bits = "22..=26")]
    slave: Integer<u8, packed_bits::Bits<5>>,
    #[packed_field(bits = "21")]
    failed: bool,
    #[packed_field(bits = "20")]
    read: bool,
    #[packed_field(bits = "16..=19")]
    page: Integer<u8, packed_bits::Bits<4>>,
    #[packed_field(bits = "8..=15")]
    address: u8,
    #[packed_field(bits = "0..=7")]
    value: u8,
}

/// One entry of the firmware's I2C slave address table
#[derive(Debug, PackedStruct, Default, Copy, Clone, PartialEq, Eq, BusWord)]
#[packed_struct(bit_numbering = "lsb0", size_bytes = "4")]
pub struct SlaveEntry {
    #[packed_field(bits = "25..=31")]
    pub i2c_address: Integer<u8, packed_bits::Bits<7>>,
    #[packed_field(bits = "24")]
    pub stop_for_read: bool,
    #[packed_field(bits = "23")]
    pub nack: bool,
    #[packed_field(bits = "10..=14")]
    pub register_bytes: Integer<u8, packed_bits::Bits<5>>,
    #[packed_field(bits = "5..=9")]
    pub write_bytes: Integer<u8, packed_bits::Bits<5>>,
    #[packed_field(bits = "0..=4")]
    pub read_bytes: Integer<u8, packed_bits::Bits<5>>,
}

impl SlaveEntry {
    /// A single-byte read/write slave with stop-for-read and NACK detection enabled
    #[must_use]
    pub fn new(i2c_address: u8, register_bytes: u8) -> Self {
        Self {
            i2c_address: i2c_address.into(),
            stop_for_read: true,
            nack: true,
            register_bytes: register_bytes.into(),
            write_bytes: 1u8.into(),
            read_bytes: 1u8.into(),
        }
    }

    #[must_use]
    pub fn without_nack(self) -> Self {
        Self {
            nack: false,
            ..self
        }
    }
}

/// Logical chip ids to slave-table indices, built once per configuration.
/// Every hybrid shares the same table, so the index only depends on the chip id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlaveMap {
    entries: Vec<SlaveEntry>,
    index: HashMap<u8, u8>,
}

impl SlaveMap {
    /// Chips are numbered in the order of `entries`
    #[must_use]
    pub fn new(entries: Vec<SlaveEntry>) -> Self {
        let index = (0..entries.len())
            .filter_map(|i| u8::try_from(i).ok())
            .map(|i| (i, i))
            .collect();
        Self { entries, index }
    }

    #[must_use]
    pub fn for_front_end(front_end: FrontEndType, n_chips: u8) -> Self {
        Self::new(front_end.slave_entries(n_chips))
    }

    /// The slave index for `chip`
    /// # Errors
    /// Returns an error if the chip has no entry
    pub fn index_of(&self, hybrid: u8, chip: u8) -> Result<u8, Error> {
        self.index
            .get(&chip)
            .copied()
            .ok_or(Error::UnknownTarget { hybrid, chip })
    }

    /// The chip id at slave index `slave`
    #[must_use]
    pub fn chip_at(&self, slave: u8) -> Option<u8> {
        self.index
            .iter()
            .find_map(|(chip, idx)| (*idx == slave).then_some(*chip))
    }

    /// The slave table as (register name, word) pairs, in index order
    #[must_use]
    pub fn registers(&self) -> Vec<(String, u32)> {
        self.entries
            .iter()
            .enumerate()
            .map(|(i, e)| {
                (
                    format!("fc7_daq_cnfg.command_processor_block.i2c_address_table.slave_{i}_config"),
                    e.to_word(),
                )
            })
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Shared encode and decode for the two indexed layouts, parameterized by the link
#[allow(clippy::too_many_arguments)]
fn encode_indexed(
    encoding: Encoding,
    slaves: &SlaveMap,
    link: u8,
    register: &ChipRegister,
    hybrid: u8,
    chip: u8,
    read_back: bool,
    write: bool,
) -> Result<Vec<u32>, Error> {
    fits(encoding, "hybrid", hybrid, 4)?;
    fits(encoding, "link", link, 3)?;
    let slave = slaves.index_of(hybrid, chip)?;
    let first = IndexedWord {
        link: link.into(),
        hybrid: hybrid.into(),
        slave: slave.into(),
        verify: read_back,
        read: !write,
        page: register.page,
        payload: register.address,
        ..Default::default()
    };
    let mut words = vec![first.to_word()];
    if write {
        words.push(
            IndexedWord {
                data: true,
                verify: false,
                read: false,
                page: 0,
                payload: register.value,
                ..first
            }
            .to_word(),
        );
    }
    Ok(words)
}

fn encode_indexed_broadcast(register: &ChipRegister, read_back: bool, write: bool) -> Vec<u32> {
    let first = IndexedWord {
        broadcast: true,
        verify: read_back,
        read: !write,
        page: register.page,
        payload: register.address,
        ..Default::default()
    };
    let mut words = vec![first.to_word()];
    if write {
        words.push(
            IndexedWord {
                broadcast: true,
                data: true,
                payload: register.value,
                ..Default::default()
            }
            .to_word(),
        );
    }
    words
}

fn decode_indexed(slaves: &SlaveMap, words: &[u32]) -> Result<(Transaction, usize), Error> {
    let first_raw = *words.first().ok_or(Error::Truncated)?;
    let first = IndexedWord::from_word(first_raw).map_err(|_| Error::Unexpected(first_raw))?;
    if first.data || first.broadcast {
        return Err(Error::Unexpected(first_raw));
    }
    let hybrid = first.hybrid.into();
    let slave: u8 = first.slave.into();
    let chip = slaves
        .chip_at(slave)
        .ok_or(Error::UnknownTarget { hybrid, chip: slave })?;
    let write = !first.read;
    let (value, used) = if write {
        let data_raw = *words.get(1).ok_or(Error::Truncated)?;
        let data = IndexedWord::from_word(data_raw).map_err(|_| Error::Unexpected(data_raw))?;
        if !data.data {
            return Err(Error::Truncated);
        }
        (data.payload, 2)
    } else {
        (0, 1)
    };
    Ok((
        Transaction {
            hybrid,
            chip,
            register: ChipRegister {
                page: first.page,
                address: first.payload,
                value,
            },
            read_back: first.verify,
            write,
        },
        used,
    ))
}

fn decode_indexed_reply(slaves: &SlaveMap, word: u32) -> Result<Reply, Error> {
    let reply = IndexedReply::from_word(word).map_err(|_| Error::Unexpected(word))?;
    let hybrid = reply.hybrid.into();
    let slave: u8 = reply.slave.into();
    let chip = slaves
        .chip_at(slave)
        .ok_or(Error::UnknownTarget { hybrid, chip: slave })?;
    Ok(Reply {
        hybrid,
        chip,
        register: ChipRegister {
            page: reply.page.into(),
            address: reply.address,
            value: reply.value,
        },
        is_read: reply.read,
        failed: reply.failed,
    })
}

fn indexed_expects_reply(word: u32) -> bool {
    IndexedWord::from_word(word).map_or(false, |w| !w.data && (w.read || w.verify))
}

/// Protocol version 1 and up: chips are addressed through the firmware's slave table
#[derive(Debug, Clone)]
pub struct SlaveTableCodec {
    slaves: SlaveMap,
}

impl SlaveTableCodec {
    #[must_use]
    pub fn new(slaves: SlaveMap) -> Self {
        Self { slaves }
    }
}

impl TransactionCodec for SlaveTableCodec {
    fn encoding(&self) -> Encoding {
        Encoding::SlaveTable
    }

    fn encode(
        &self,
        register: &ChipRegister,
        hybrid: u8,
        chip: u8,
        read_back: bool,
        write: bool,
    ) -> Result<Vec<u32>, Error> {
        encode_indexed(
            Encoding::SlaveTable,
            &self.slaves,
            0,
            register,
            hybrid,
            chip,
            read_back,
            write,
        )
    }

    fn encode_broadcast(
        &self,
        register: &ChipRegister,
        read_back: bool,
        write: bool,
    ) -> Result<Vec<u32>, Error> {
        Ok(encode_indexed_broadcast(register, read_back, write))
    }

    fn decode(&self, words: &[u32]) -> Result<(Transaction, usize), Error> {
        decode_indexed(&self.slaves, words)
    }

    fn decode_reply(&self, word: u32) -> Result<Reply, Error> {
        decode_indexed_reply(&self.slaves, word)
    }

    fn expects_reply(&self, word: u32) -> bool {
        indexed_expects_reply(word)
    }

    fn slave_map(&self) -> Option<&SlaveMap> {
        Some(&self.slaves)
    }
}

/// Slave-table addressing routed over an optical link
#[derive(Debug, Clone)]
pub struct OpticalCodec {
    slaves: SlaveMap,
    /// Hybrid id to the link it hangs off
    links: HashMap<u8, LinkId>,
}

impl OpticalCodec {
    #[must_use]
    pub fn new(slaves: SlaveMap, links: HashMap<u8, LinkId>) -> Self {
        Self { slaves, links }
    }
}

impl TransactionCodec for OpticalCodec {
    fn encoding(&self) -> Encoding {
        Encoding::Optical
    }

    fn encode(
        &self,
        register: &ChipRegister,
        hybrid: u8,
        chip: u8,
        read_back: bool,
        write: bool,
    ) -> Result<Vec<u32>, Error> {
        let link = *self.links.get(&hybrid).ok_or(Error::UnknownLink(hybrid))?;
        encode_indexed(
            Encoding::Optical,
            &self.slaves,
            link,
            register,
            hybrid,
            chip,
            read_back,
            write,
        )
    }

    fn encode_broadcast(
        &self,
        register: &ChipRegister,
        read_back: bool,
        write: bool,
    ) -> Result<Vec<u32>, Error> {
        Ok(encode_indexed_broadcast(register, read_back, write))
    }

    fn decode(&self, words: &[u32]) -> Result<(Transaction, usize), Error> {
        decode_indexed(&self.slaves, words)
    }

    fn decode_reply(&self, word: u32) -> Result<Reply, Error> {
        decode_indexed_reply(&self.slaves, word)
    }

    fn expects_reply(&self, word: u32) -> bool {
        indexed_expects_reply(word)
    }

    fn slave_map(&self) -> Option<&SlaveMap> {
        Some(&self.slaves)
    }
}

/// Build the reply the firmware would produce for `t`, for simulated boards
#[must_use]
pub fn reply_word(encoding: Encoding, t: &Transaction, failed: bool) -> u32 {
    match encoding {
        Encoding::Legacy => LegacyWord {
            hybrid: t.hybrid.into(),
            chip: t.chip.into(),
            page: t.register.page == 1,
            read: !t.write,
            address: t.register.address,
            value: t.register.value,
            ..Default::default()
        }
        .to_word(),
        Encoding::SlaveTable | Encoding::Optical => IndexedReply {
            hybrid: t.hybrid.into(),
            slave: t.chip.into(),
            failed,
            read: !t.write,
            page: (t.register.page & 0xF).into(),
            address: t.register.address,
            value: t.register.value,
        }
        .to_word(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::tests::topology;
    use paste::paste;

    fn cic_map() -> SlaveMap {
        SlaveMap::for_front_end(FrontEndType::Cic2, 8)
    }

    fn optical() -> OpticalCodec {
        OpticalCodec::new(cic_map(), HashMap::from([(0, 0), (1, 0), (2, 5), (3, 7)]))
    }

    fn sample(max_hybrid: u8, max_chip: u8, max_page: u8) -> Vec<Transaction> {
        let mut out = vec![];
        for hybrid in [0, max_hybrid / 2, max_hybrid] {
            for chip in [0, 3, max_chip] {
                for page in [0, max_page] {
                    for (address, value) in [(0x00, 0x00), (0x1D, 0x7F), (0xFF, 0xFF)] {
                        let register = ChipRegister {
                            page,
                            address,
                            value,
                        };
                        out.push(Transaction::write(hybrid, chip, register, true));
                        out.push(Transaction::write(hybrid, chip, register, false));
                        out.push(Transaction::read(hybrid, chip, page, address));
                    }
                }
            }
        }
        out
    }

    macro_rules! test_symmetric {
        ($name:ident, $codec:expr, $hybrid:literal, $chip:literal, $page:literal) => {
            paste! {
                #[test]
                fn [<test_symmetric_ $name>]() {
                    let codec = $codec;
                    for t in sample($hybrid, $chip, $page) {
                        let words = codec.encode_transaction(&t).unwrap();
                        assert_eq!(words.len(), if t.write && codec.encoding() != Encoding::Legacy { 2 } else { 1 });
                        let (decoded, used) = codec.decode(&words).unwrap();
                        assert_eq!(used, words.len());
                        assert_eq!(decoded, t);
                    }
                }
            }
        };
    }

    test_symmetric!(legacy, LegacyCodec, 15, 15, 1);

    #[test]
    fn test_legacy_reads_always_answered() {
        let blind_read = Transaction {
            read_back: false,
            ..Transaction::read(1, 2, 0, 0x10)
        };
        let words = LegacyCodec.encode_transaction(&blind_read).unwrap();
        assert!(LegacyCodec.expects_reply(words[0]));
        let (decoded, _) = LegacyCodec.decode(&words).unwrap();
        assert_eq!(decoded, Transaction::read(1, 2, 0, 0x10));
        // Writes keep their flag both ways
        let blind_write = Transaction::write(1, 2, ChipRegister::default(), false);
        let words = LegacyCodec.encode_transaction(&blind_write).unwrap();
        assert!(!LegacyCodec.expects_reply(words[0]));
        assert_eq!(LegacyCodec.decode(&words).unwrap().0, blind_write);
    }
    test_symmetric!(slave_table, SlaveTableCodec::new(cic_map()), 15, 8, 255);
    test_symmetric!(optical, optical(), 3, 8, 255);

    #[test]
    fn test_legacy_bit_exact() {
        let register = ChipRegister {
            page: 1,
            address: 0x2A,
            value: 0x5C,
        };
        let write = LegacyCodec.encode(&register, 3, 5, true, true).unwrap();
        assert_eq!(write, vec![(3 << 24) | (5 << 20) | (1 << 19) | (1 << 17) | (0x2A << 8) | 0x5C]);
        // Reads never carry a value, nor the verify flag
        let read = LegacyCodec.encode(&register, 3, 5, true, false).unwrap();
        assert_eq!(read, vec![(3 << 24) | (5 << 20) | (1 << 17) | (1 << 16) | (0x2A << 8)]);
        let bcast = LegacyCodec.encode_broadcast(&register, false, true).unwrap();
        assert_eq!(bcast, vec![(2 << 28) | (1 << 17) | (0x2A << 8) | 0x5C]);
    }

    #[test]
    fn test_slave_table_bit_exact() {
        let codec = SlaveTableCodec::new(cic_map());
        let register = ChipRegister {
            page: 0,
            address: 0x10,
            value: 0xAB,
        };
        let words = codec.encode(&register, 1, 8, true, true).unwrap();
        assert_eq!(
            words,
            vec![(1 << 23) | (8 << 18) | (1 << 17) | 0x10, (1 << 27) | (1 << 23) | (8 << 18) | 0xAB]
        );
    }

    #[test]
    fn test_optical_carries_link() {
        let codec = optical();
        let register = ChipRegister::default();
        let words = codec.encode(&register, 3, 0, true, false).unwrap();
        assert_eq!(words[0] >> 29, 7);
        assert_eq!(
            codec.encode(&register, 9, 0, true, false),
            Err(Error::UnknownLink(9))
        );
    }

    #[test]
    fn test_unknown_target() {
        let codec = SlaveTableCodec::new(SlaveMap::for_front_end(FrontEndType::Ssa, 4));
        assert_eq!(
            codec.encode(&ChipRegister::default(), 0, 4, false, true),
            Err(Error::UnknownTarget { hybrid: 0, chip: 4 })
        );
    }

    #[test]
    fn test_field_overflow() {
        assert!(matches!(
            LegacyCodec.encode(&ChipRegister { page: 2, ..Default::default() }, 0, 0, false, true),
            Err(Error::FieldOverflow { field: "page", .. })
        ));
        assert!(matches!(
            LegacyCodec.encode(&ChipRegister::default(), 16, 0, false, true),
            Err(Error::FieldOverflow { field: "hybrid", .. })
        ));
    }

    #[test]
    fn test_expects_reply() {
        let codec = SlaveTableCodec::new(cic_map());
        let register = ChipRegister::default();
        let verified = codec.encode(&register, 0, 0, true, true).unwrap();
        assert!(codec.expects_reply(verified[0]));
        // The data word never produces a reply of its own
        assert!(!codec.expects_reply(verified[1]));
        let blind = codec.encode(&register, 0, 0, false, true).unwrap();
        assert!(!codec.expects_reply(blind[0]));
        let read = codec.encode(&register, 0, 0, false, false).unwrap();
        assert!(codec.expects_reply(read[0]));
        let read = LegacyCodec.encode(&register, 0, 0, true, false).unwrap();
        assert!(LegacyCodec.expects_reply(read[0]));
    }

    #[test]
    fn test_decode_rejects_broadcast_and_data() {
        let codec = SlaveTableCodec::new(cic_map());
        let bcast = codec
            .encode_broadcast(&ChipRegister::default(), false, true)
            .unwrap();
        assert_eq!(codec.decode(&bcast), Err(Error::Unexpected(bcast[0])));
        assert_eq!(codec.decode(&bcast[1..]), Err(Error::Unexpected(bcast[1])));
        let write = codec
            .encode(&ChipRegister::default(), 0, 0, false, true)
            .unwrap();
        assert_eq!(codec.decode(&write[..1]), Err(Error::Truncated));
    }

    #[test]
    fn test_reply_decode() {
        let codec = SlaveTableCodec::new(cic_map());
        let t = Transaction::write(
            2,
            8,
            ChipRegister {
                page: 0,
                address: 0x33,
                value: 0x44,
            },
            true,
        );
        let reply = codec
            .decode_reply(reply_word(Encoding::SlaveTable, &t, false))
            .unwrap();
        assert!(reply.acknowledges(&t));
        let failed = codec
            .decode_reply(reply_word(Encoding::SlaveTable, &t, true))
            .unwrap();
        assert!(failed.failed);
        assert!(!failed.acknowledges(&t));
    }

    #[test]
    fn test_slave_registers() {
        let map = cic_map();
        let regs = map.registers();
        assert_eq!(regs.len(), 9);
        assert_eq!(
            regs[0],
            (
                "fc7_daq_cnfg.command_processor_block.i2c_address_table.slave_0_config".to_owned(),
                (0x41 << 25) | (1 << 24) | (1 << 23) | (1 << 10) | (1 << 5) | 1
            )
        );
        assert_eq!(regs[8].1 >> 25, 0x60);
    }

    #[test]
    fn test_select() {
        assert_eq!(Encoding::select(0, false), Encoding::Legacy);
        assert_eq!(Encoding::select(1, false), Encoding::SlaveTable);
        assert_eq!(Encoding::select(0, true), Encoding::Optical);
        let codec = Encoding::SlaveTable
            .codec(&topology(FrontEndType::Ssa, None, 2, 4))
            .unwrap();
        assert_eq!(codec.slave_map().map(SlaveMap::len), Some(4));
    }

    #[test]
    fn test_gapped_chip_ids() {
        let mut gapped = topology(FrontEndType::Mpa, None, 1, 2);
        gapped.groups[0].hybrids[0].chips[1].id = 6;
        let codec = Encoding::SlaveTable.codec(&gapped).unwrap();
        assert_eq!(codec.slave_map().map(SlaveMap::len), Some(7));
        let words = codec
            .encode(&ChipRegister::default(), 0, 6, true, false)
            .unwrap();
        assert_eq!(codec.decode(&words).unwrap().0.chip, 6);
    }
}
