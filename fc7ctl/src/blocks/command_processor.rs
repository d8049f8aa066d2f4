//! The command processor moves encoded chip transactions to the front ends and collects their
//! replies. Writes can be verified against the replies, in which case only the mismatching
//! transactions are resubmitted.

use super::codec::{
    self,
    ChipRegister,
    Reply,
    SlaveMap,
    Transaction,
    TransactionCodec,
};
use crate::{
    poll::{
        PollPolicy,
        Sleeper,
    },
    transport::{
        with_bus,
        RegisterBus,
    },
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
    warn,
};

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Transport(#[from] crate::transport::Error),
    #[error(transparent)]
    Codec(#[from] codec::Error),
    #[error("Expected {expected} replies but the firmware only produced {received}")]
    MissingReplies { expected: usize, received: usize },
    #[error("{0} read-back mismatches, the command bus is broken")]
    TooManyMismatches(usize),
}

/// Mismatching transactions of a verified write are resubmitted at most this many times
pub const MAX_WRITE_ATTEMPTS: usize = 5;
/// More mismatches than this in a single pass means a broken bus, not noise
pub const MAX_MISMATCHES: usize = 100;

/// Default wait for the reply FIFO, per expected reply
pub const REPLY_POLICY: PollPolicy = PollPolicy::new(100, Duration::from_micros(200));

#[derive(Debug)]
pub struct CommandProcessor<T> {
    /// Upwards pointer to the parent class' transport
    transport: Weak<Mutex<T>>,
    sleeper: Arc<dyn Sleeper>,
    /// The encoding resolved for this configuration
    codec: Box<dyn TransactionCodec>,
    policy: PollPolicy,
    /// Number of chips a broadcast reaches
    n_chips: usize,
}

impl<T> CommandProcessor<T>
where
    T: RegisterBus,
{
    const COMMAND_FIFO: &'static str = "fc7_daq_ctrl.command_processor_block.i2c.command_fifo";
    const REPLY_FIFO: &'static str = "fc7_daq_ctrl.command_processor_block.i2c.reply_fifo";
    const RESET_FIFOS: &'static str = "fc7_daq_ctrl.command_processor_block.i2c.control.reset_fifos";
    const N_REPLIES: &'static str = "fc7_daq_stat.command_processor_block.i2c.nreplies";
    pub(crate) const VERSION: &'static str = "fc7_daq_stat.command_processor_block.i2c.master_version";

    #[must_use]
    pub fn new(
        transport: Weak<Mutex<T>>,
        sleeper: Arc<dyn Sleeper>,
        codec: Box<dyn TransactionCodec>,
        policy: PollPolicy,
        n_chips: usize,
    ) -> Self {
        Self {
            transport,
            sleeper,
            codec,
            policy,
            n_chips,
        }
    }

    #[must_use]
    pub fn codec(&self) -> &dyn TransactionCodec {
        self.codec.as_ref()
    }

    /// Load the slave address table of the resolved encoding, if it has one
    pub(crate) fn load_slave_table_locked(&self, bus: &mut T) -> Result<(), Error> {
        if let Some(slaves) = self.codec.slave_map() {
            write_slave_table(bus, slaves)?;
        }
        Ok(())
    }

    /// Encode every transaction, dropping the ones whose target isn't addressable
    fn encode_batch(&self, transactions: &[Transaction]) -> Result<(Vec<u32>, Vec<Transaction>), Error> {
        let mut words = vec![];
        let mut kept = vec![];
        for t in transactions {
            match self.codec.encode_transaction(t) {
                Ok(w) => {
                    words.extend(w);
                    kept.push(*t);
                }
                Err(e @ (codec::Error::UnknownTarget { .. } | codec::Error::UnknownLink(_))) => {
                    warn!("Dropping transaction: {e}");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok((words, kept))
    }

    /// Push `words` through the command FIFO and collect up to `expected` raw replies
    fn issue(&self, bus: &mut T, words: &[u32], expected: usize) -> Result<Vec<u32>, Error> {
        bus.write(Self::RESET_FIFOS, 1)?;
        bus.write_block(Self::COMMAND_FIFO, words)?;
        if expected == 0 {
            return Ok(vec![]);
        }
        let policy = self
            .policy
            .scaled(u32::try_from(expected).unwrap_or(u32::MAX));
        let received = policy
            .poll(self.sleeper.as_ref(), |_| {
                let n = bus.read(Self::N_REPLIES)? as usize;
                Ok::<_, Error>((n >= expected).then_some(n))
            })?
            .map_or_else(|| bus.read(Self::N_REPLIES).map(|n| n as usize), Ok)?;
        if received < expected {
            warn!(expected, received, "Reply FIFO timed out");
        }
        debug!(words = words.len(), received, "Issued command batch");
        Ok(bus.read_block(Self::REPLY_FIFO, received.min(expected))?)
    }

    /// Issue a batch of transactions, returning whatever replies they produce
    /// # Errors
    /// Returns an error on bad transport or a malformed transaction
    pub fn write_transaction(&self, transactions: &[Transaction]) -> Result<Vec<Reply>, Error> {
        with_bus(&self.transport, |bus| {
            let (words, _) = self.encode_batch(transactions)?;
            let expected = words.iter().filter(|w| self.codec.expects_reply(**w)).count();
            let raw = self.issue(bus, &words, expected)?;
            raw.into_iter()
                .map(|w| self.codec.decode_reply(w).map_err(Error::from))
                .collect()
        })
    }

    /// Issue a batch of reads, every one of which must be answered
    /// # Errors
    /// Returns an error on bad transport or if replies are missing
    pub fn read_transaction(&self, transactions: &[Transaction]) -> Result<Vec<Reply>, Error> {
        with_bus(&self.transport, |bus| self.read_transaction_locked(bus, transactions))
    }

    pub(crate) fn read_transaction_locked(
        &self,
        bus: &mut T,
        transactions: &[Transaction],
    ) -> Result<Vec<Reply>, Error> {
        let (expected, replies) = self.issue_reads(bus, transactions)?;
        if replies.len() < expected {
            return Err(Error::MissingReplies {
                expected,
                received: replies.len(),
            });
        }
        Ok(replies)
    }

    /// Issue reads and keep whatever answers come back, chips that don't answer are simply absent
    pub(crate) fn query_chips_locked(&self, bus: &mut T, transactions: &[Transaction]) -> Result<Vec<Reply>, Error> {
        Ok(self.issue_reads(bus, transactions)?.1)
    }

    /// The number of reads actually sent, along with the decoded replies
    fn issue_reads(&self, bus: &mut T, transactions: &[Transaction]) -> Result<(usize, Vec<Reply>), Error> {
        let reads: Vec<_> = transactions
            .iter()
            .map(|t| Transaction {
                write: false,
                read_back: true,
                ..*t
            })
            .collect();
        let (words, kept) = self.encode_batch(&reads)?;
        let replies = self
            .issue(bus, &words, kept.len())?
            .into_iter()
            .map(|w| self.codec.decode_reply(w).map_err(Error::from))
            .collect::<Result<Vec<_>, _>>()?;
        Ok((kept.len(), replies))
    }

    /// Read a single register of a single chip
    /// # Errors
    /// Returns an error on bad transport or if the chip doesn't answer
    pub fn read_register(&self, hybrid: u8, chip: u8, page: u8, address: u8) -> Result<u8, Error> {
        let replies = self.read_transaction(&[Transaction::read(hybrid, chip, page, address)])?;
        replies
            .first()
            .map(|r| r.register.value)
            .ok_or(Error::MissingReplies {
                expected: 1,
                received: 0,
            })
    }

    /// Write a batch, verifying every transaction against its reply with [`Reply::acknowledges`]
    /// # Errors
    /// See [`CommandProcessor::write_verified_with`]
    pub fn write_verified(&self, transactions: &[Transaction]) -> Result<bool, Error> {
        self.write_verified_with(transactions, |sent, reply| reply.acknowledges(sent))
    }

    /// Write a batch and compare every transaction to its reply with `matches`. Mismatching
    /// transactions are resubmitted on their own until they all match, or until they have been
    /// resubmitted [`MAX_WRITE_ATTEMPTS`] times, in which case this returns `Ok(false)`.
    /// # Errors
    /// Returns an error on bad transport, or if a single pass produces [`MAX_MISMATCHES`] or more
    /// mismatches
    pub fn write_verified_with(
        &self,
        transactions: &[Transaction],
        matches: impl Fn(&Transaction, &Reply) -> bool,
    ) -> Result<bool, Error> {
        let transactions: Vec<_> = transactions
            .iter()
            .map(|t| Transaction {
                read_back: true,
                write: true,
                ..*t
            })
            .collect();
        with_bus(&self.transport, |bus| {
            self.write_verified_locked(bus, &transactions, &matches, 0)
        })
    }

    fn write_verified_locked(
        &self,
        bus: &mut T,
        transactions: &[Transaction],
        matches: &dyn Fn(&Transaction, &Reply) -> bool,
        attempt: usize,
    ) -> Result<bool, Error> {
        let (words, kept) = self.encode_batch(transactions)?;
        let raw = self.issue(bus, &words, kept.len())?;
        let mismatches: Vec<Transaction> = kept
            .iter()
            .enumerate()
            .filter(|(i, sent)| {
                !raw.get(*i)
                    .and_then(|w| self.codec.decode_reply(*w).ok())
                    .map_or(false, |reply| matches(sent, &reply))
            })
            .map(|(_, sent)| *sent)
            .collect();
        if mismatches.is_empty() {
            return Ok(true);
        }
        if mismatches.len() >= MAX_MISMATCHES {
            error!(mismatches = mismatches.len(), "Too many read-back errors");
            Err(Error::TooManyMismatches(mismatches.len()))
        } else if attempt < MAX_WRITE_ATTEMPTS {
            warn!(
                mismatches = mismatches.len(),
                attempt = attempt + 1,
                "Read-back mismatch, resubmitting"
            );
            self.write_verified_locked(bus, &mismatches, matches, attempt + 1)
        } else {
            warn!(
                mismatches = mismatches.len(),
                "Verified write still mismatching after {MAX_WRITE_ATTEMPTS} resubmissions"
            );
            Ok(false)
        }
    }

    /// Write `register` to every enabled chip at once. Broadcasts are never verified per chip,
    /// if `verify` is set this only checks that every chip acknowledged the write.
    /// # Errors
    /// Returns an error on bad transport
    pub fn write_broadcast(&self, register: &ChipRegister, verify: bool) -> Result<bool, Error> {
        with_bus(&self.transport, |bus| {
            let words = self.codec.encode_broadcast(register, verify, true)?;
            let expected = if verify { self.n_chips } else { 0 };
            let raw = self.issue(bus, &words, expected)?;
            Ok(raw.len() == expected
                && raw.iter().all(|w| {
                    self.codec
                        .decode_reply(*w)
                        .map_or(false, |r| !r.is_read && !r.failed)
                }))
        })
    }
}

/// Write the slave address table into the firmware
pub(crate) fn write_slave_table<T: RegisterBus>(bus: &mut T, slaves: &SlaveMap) -> Result<(), Error> {
    for (name, word) in slaves.registers() {
        bus.write(&name, word)?;
    }
    debug!(entries = slaves.len(), "Loaded slave address table");
    Ok(())
}
