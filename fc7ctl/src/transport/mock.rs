//! Mock register bus used in testing the interface. Every access is logged in order and individual
//! registers can be scripted to behave like the firmware they stand in for.

use super::{
    Error,
    RegisterBus,
    TransportResult,
};
use kstring::KString;
use std::collections::{
    HashMap,
    VecDeque,
};

/// Values returned by a scripted register read
pub type ReadHandler = Box<dyn FnMut(&mut MockState) -> u32 + Send>;
/// Side effects of a register write on the simulated hardware
pub type WriteHook = Box<dyn FnMut(&mut MockState, u32) + Send>;
/// Words returned by a scripted block read, given the requested count
pub type BlockHandler = Box<dyn FnMut(&mut MockState, usize) -> Vec<u32> + Send>;
/// Side effects of a block write on the simulated hardware
pub type BlockWriteHook = Box<dyn FnMut(&mut MockState, &[u32]) + Send>;

/// A single bus access, as recorded by the mock
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Access {
    Read(KString),
    Write(KString, u32),
    ReadBlock(KString, usize),
    WriteBlock(KString, Vec<u32>),
}

impl Access {
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Access::Read(n)
            | Access::Write(n, _)
            | Access::ReadBlock(n, _)
            | Access::WriteBlock(n, _) => n.as_str(),
        }
    }
}

/// The simulated hardware state, visible to handlers and hooks
#[derive(Debug, Default)]
pub struct MockState {
    pub registers: HashMap<KString, u32>,
    pub blocks: HashMap<KString, VecDeque<u32>>,
}

impl MockState {
    #[must_use]
    pub fn get(&self, name: &str) -> u32 {
        self.registers.get(name).copied().unwrap_or_default()
    }

    pub fn set(&mut self, name: &str, value: u32) {
        self.registers.insert(KString::from_ref(name), value);
    }

    pub fn push_block(&mut self, name: &str, words: &[u32]) {
        self.blocks
            .entry(KString::from_ref(name))
            .or_default()
            .extend(words);
    }
}

/// A board that mocks reads and writes, useful for testing
#[derive(Default)]
pub struct Mock {
    state: MockState,
    /// If set, only these registers exist
    known: Option<Vec<KString>>,
    log: Vec<Access>,
    read_handlers: HashMap<KString, ReadHandler>,
    write_hooks: HashMap<KString, WriteHook>,
    block_handlers: HashMap<KString, BlockHandler>,
    block_write_hooks: HashMap<KString, BlockWriteHook>,
}

impl std::fmt::Debug for Mock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mock")
            .field("state", &self.state)
            .field("accesses", &self.log.len())
            .finish_non_exhaustive()
    }
}

impl Mock {
    /// Construct a permissive mock where every register starts at zero
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Construct a mock that only knows the registers in `registers`, with those initial values
    #[must_use]
    pub fn strict(registers: &[(&str, u32)]) -> Self {
        let mut mock = Self::default();
        for (name, value) in registers {
            mock.state.set(name, *value);
        }
        mock.known = Some(registers.iter().map(|(n, _)| KString::from_ref(n)).collect());
        mock
    }

    pub fn set(&mut self, name: &str, value: u32) {
        self.state.set(name, value);
    }

    #[must_use]
    pub fn get(&self, name: &str) -> u32 {
        self.state.get(name)
    }

    pub fn push_block(&mut self, name: &str, words: &[u32]) {
        self.state.push_block(name, words);
    }

    /// Script every read of `name`
    pub fn on_read(&mut self, name: &str, handler: impl FnMut(&mut MockState) -> u32 + Send + 'static) {
        self.read_handlers
            .insert(KString::from_ref(name), Box::new(handler));
    }

    /// Run `hook` after every write of `name`
    pub fn on_write(&mut self, name: &str, hook: impl FnMut(&mut MockState, u32) + Send + 'static) {
        self.write_hooks.insert(KString::from_ref(name), Box::new(hook));
    }

    /// Script every block read of `name`
    pub fn on_read_block(
        &mut self,
        name: &str,
        handler: impl FnMut(&mut MockState, usize) -> Vec<u32> + Send + 'static,
    ) {
        self.block_handlers
            .insert(KString::from_ref(name), Box::new(handler));
    }

    /// Run `hook` after every block write of `name`
    pub fn on_write_block(
        &mut self,
        name: &str,
        hook: impl FnMut(&mut MockState, &[u32]) + Send + 'static,
    ) {
        self.block_write_hooks
            .insert(KString::from_ref(name), Box::new(hook));
    }

    /// Every access since construction (or the last [`Mock::clear_log`]), in order
    #[must_use]
    pub fn log(&self) -> &[Access] {
        &self.log
    }

    pub fn clear_log(&mut self) {
        self.log.clear();
    }

    /// All the values written to `name`, in order
    #[must_use]
    pub fn writes_to(&self, name: &str) -> Vec<u32> {
        self.log
            .iter()
            .filter_map(|a| match a {
                Access::Write(n, v) if n.as_str() == name => Some(*v),
                _ => None,
            })
            .collect()
    }

    /// All the blocks written to `name`, in order
    #[must_use]
    pub fn blocks_written_to(&self, name: &str) -> Vec<Vec<u32>> {
        self.log
            .iter()
            .filter_map(|a| match a {
                Access::WriteBlock(n, v) if n.as_str() == name => Some(v.clone()),
                _ => None,
            })
            .collect()
    }

    fn check(&self, name: &str) -> TransportResult<()> {
        match &self.known {
            Some(known) if !known.iter().any(|k| k.as_str() == name) => {
                Err(Error::UnknownRegister(name.to_owned()))
            }
            _ => Ok(()),
        }
    }
}

impl RegisterBus for Mock {
    fn read(&mut self, name: &str) -> TransportResult<u32> {
        self.check(name)?;
        self.log.push(Access::Read(KString::from_ref(name)));
        if let Some(mut handler) = self.read_handlers.remove(name) {
            let value = handler(&mut self.state);
            self.read_handlers.insert(KString::from_ref(name), handler);
            Ok(value)
        } else {
            Ok(self.state.get(name))
        }
    }

    fn write(&mut self, name: &str, value: u32) -> TransportResult<()> {
        self.check(name)?;
        self.log.push(Access::Write(KString::from_ref(name), value));
        self.state.set(name, value);
        if let Some(mut hook) = self.write_hooks.remove(name) {
            hook(&mut self.state, value);
            self.write_hooks.insert(KString::from_ref(name), hook);
        }
        Ok(())
    }

    fn read_block(&mut self, name: &str, count: usize) -> TransportResult<Vec<u32>> {
        self.check(name)?;
        self.log.push(Access::ReadBlock(KString::from_ref(name), count));
        if let Some(mut handler) = self.block_handlers.remove(name) {
            let words = handler(&mut self.state, count);
            self.block_handlers.insert(KString::from_ref(name), handler);
            return Ok(words);
        }
        // Drain like a FIFO, an empty FIFO reads back zeros
        let fifo = self.state.blocks.entry(KString::from_ref(name)).or_default();
        Ok((0..count).map(|_| fifo.pop_front().unwrap_or_default()).collect())
    }

    fn write_block(&mut self, name: &str, values: &[u32]) -> TransportResult<()> {
        self.check(name)?;
        self.log
            .push(Access::WriteBlock(KString::from_ref(name), values.to_vec()));
        if let Some(mut hook) = self.block_write_hooks.remove(name) {
            hook(&mut self.state, values);
            self.block_write_hooks.insert(KString::from_ref(name), hook);
        } else {
            self.state.push_block(name, values);
        }
        Ok(())
    }

    fn read_block_offset(
        &mut self,
        name: &str,
        count: usize,
        offset: usize,
    ) -> TransportResult<Vec<u32>> {
        self.check(name)?;
        self.log.push(Access::ReadBlock(KString::from_ref(name), count));
        // Memory-like, reading doesn't consume
        let memory = self.state.blocks.entry(KString::from_ref(name)).or_default();
        if offset + count > memory.len() {
            return Err(Error::OutOfBounds {
                name: name.to_owned(),
                offset,
                count,
            });
        }
        Ok(memory.range(offset..offset + count).copied().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use paste::paste;

    macro_rules! test_rw_word {
        ($name:ident, $ty:ty, $v:expr) => {
            paste! {
                #[test]
                fn [<test_rw_word_ $name>]() {
                    let mut transport = Mock::new();
                    let word: $ty = $v;
                    transport.write_word("user.scratch", &word).unwrap();
                    let read_word: $ty = transport.read_word("user.scratch").unwrap();
                    assert_eq!(read_word, word);
                }
            }
        };
    }

    test_rw_word!(u32, u32, 0xDEAD_BEEF);
    test_rw_word!(bool, bool, true);

    #[test]
    fn test_unwritten_reads_zero() {
        let mut transport = Mock::new();
        assert_eq!(transport.read("fc7_daq_stat.general.info.chip_type").unwrap(), 0);
    }

    #[test]
    fn test_strict_rejects_unknown() {
        let mut transport = Mock::strict(&[("sysreg.spi.tx_data", 0)]);
        assert!(transport.write("sysreg.spi.tx_data", 1).is_ok());
        assert!(matches!(
            transport.read("sysreg.spi.rx_data"),
            Err(Error::UnknownRegister(_))
        ));
    }

    #[test]
    fn test_log_order() {
        let mut transport = Mock::new();
        transport
            .write_stack(&[("a.b", 1), ("a.c", 2), ("a.b", 3)])
            .unwrap();
        transport.read("a.c").unwrap();
        assert_eq!(transport.writes_to("a.b"), vec![1, 3]);
        assert_eq!(transport.log().len(), 4);
        assert_eq!(transport.log()[3], Access::Read("a.c".into()));
    }

    #[test]
    fn test_fifo_drains() {
        let mut transport = Mock::new();
        transport.write_block("fifo", &[1, 2, 3]).unwrap();
        assert_eq!(transport.read_block("fifo", 2).unwrap(), vec![1, 2]);
        assert_eq!(transport.read_block("fifo", 2).unwrap(), vec![3, 0]);
    }

    #[test]
    fn test_memory_offset() {
        let mut transport = Mock::new();
        transport.push_block("ddr", &[10, 11, 12, 13]);
        assert_eq!(transport.read_block_offset("ddr", 2, 1).unwrap(), vec![11, 12]);
        assert!(matches!(
            transport.read_block_offset("ddr", 2, 3),
            Err(Error::OutOfBounds { .. })
        ));
    }

    #[test]
    fn test_scripted_registers() {
        let mut transport = Mock::new();
        let mut n = 0;
        transport.on_read("counter", move |_| {
            n += 1;
            n
        });
        transport.on_write("trigger", |state, v| state.set("mirror", v * 2));
        assert_eq!(transport.read("counter").unwrap(), 1);
        assert_eq!(transport.read("counter").unwrap(), 2);
        transport.write("trigger", 21).unwrap();
        assert_eq!(transport.get("mirror"), 42);
    }
}
