//! Defines the register bus capability that every board transport must implement

pub mod mock;

use std::sync::{
    Arc,
    Mutex,
    Weak,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Register `{0}` is not in the address table")]
    UnknownRegister(String),
    #[error("Block access of {count} words at offset {offset} overruns `{name}`")]
    OutOfBounds {
        name: String,
        offset: usize,
        count: usize,
    },
    #[error(transparent)]
    Packing(#[from] packed_struct::PackingError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("The board this block belongs to has been dropped")]
    Dropped,
    #[error("A previous holder of the bus lock panicked")]
    Poisoned,
}

pub type TransportResult<T> = Result<T, Error>;

/// Types that implement this trait can be converted to and from a single 32-bit register word
pub trait BusWord: Sized {
    fn to_word(&self) -> u32;
    /// # Errors
    /// Returns an error if the word doesn't represent a valid value of this type
    fn from_word(word: u32) -> TransportResult<Self>;
}

impl BusWord for u32 {
    fn to_word(&self) -> u32 {
        *self
    }

    fn from_word(word: u32) -> TransportResult<Self> {
        Ok(word)
    }
}

impl BusWord for bool {
    fn to_word(&self) -> u32 {
        u32::from(*self)
    }

    fn from_word(word: u32) -> TransportResult<Self> {
        Ok(word != 0)
    }
}

/// The named-register capability used by every block on the board.
/// Names are hierarchical dotted identifiers resolved by the firmware address table,
/// the methods of this trait *assume* the board is already connected.
pub trait RegisterBus {
    /// Read a single 32-bit register
    /// # Errors
    /// Returns an error on bad transport or an unknown register
    fn read(&mut self, name: &str) -> TransportResult<u32>;

    /// Write a single 32-bit register
    /// # Errors
    /// Returns an error on bad transport or an unknown register
    fn write(&mut self, name: &str, value: u32) -> TransportResult<()>;

    /// Read `count` consecutive words from a block (FIFO or memory) register
    /// # Errors
    /// Returns an error on bad transport or an unknown register
    fn read_block(&mut self, name: &str, count: usize) -> TransportResult<Vec<u32>>;

    /// Write a sequence of words into a block (FIFO or memory) register
    /// # Errors
    /// Returns an error on bad transport or an unknown register
    fn write_block(&mut self, name: &str, values: &[u32]) -> TransportResult<()>;

    /// Read `count` words from a memory block starting `offset` words in.
    /// Transports with native offset support should override this.
    /// # Errors
    /// Returns an error on bad transport or an unknown register
    fn read_block_offset(
        &mut self,
        name: &str,
        count: usize,
        offset: usize,
    ) -> TransportResult<Vec<u32>> {
        let mut words = self.read_block(name, offset + count)?;
        Ok(words.split_off(offset))
    }

    /// Write a list of registers strictly in order
    /// # Errors
    /// Returns an error on the first failed write
    fn write_stack(&mut self, registers: &[(&str, u32)]) -> TransportResult<()> {
        for (name, value) in registers {
            self.write(name, *value)?;
        }
        Ok(())
    }

    /// Generically read a [`BusWord`] from the register `name`
    /// # Errors
    /// Returns an error on bad transport or if the word doesn't unpack
    fn read_word<W>(&mut self, name: &str) -> TransportResult<W>
    where
        W: BusWord,
        Self: Sized,
    {
        W::from_word(self.read(name)?)
    }

    /// Generically write a [`BusWord`] to the register `name`
    /// # Errors
    /// Returns an error on bad transport
    fn write_word<W>(&mut self, name: &str, word: &W) -> TransportResult<()>
    where
        W: BusWord,
        Self: Sized,
    {
        self.write(name, word.to_word())
    }
}

/// Grab the shared transport behind a block's upwards pointer
pub(crate) fn upgrade<T>(transport: &Weak<Mutex<T>>) -> TransportResult<Arc<Mutex<T>>> {
    transport.upgrade().ok_or(Error::Dropped)
}

/// Run `f` while holding the bus lock for its whole duration
pub(crate) fn with_bus<T, R, E>(
    transport: &Weak<Mutex<T>>,
    f: impl FnOnce(&mut T) -> Result<R, E>,
) -> Result<R, E>
where
    E: From<Error>,
{
    let tarc = upgrade(transport)?;
    let mut bus = tarc.lock().map_err(|_| Error::Poisoned)?;
    f(&mut bus)
}
