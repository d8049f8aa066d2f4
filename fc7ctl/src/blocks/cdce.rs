//! Driver for the CDCE62005 clock synthesizer that generates the board's MGT and 40 MHz clocks.
//! The chip hangs off the system SPI master: every configuration word is loaded into the SPI
//! transmit register and then clocked out with a fixed command word.

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
};

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Transport(#[from] crate::transport::Error),
    #[error("A {0} MHz reference clock is not supported, it must be at least 40 MHz")]
    UnsupportedReference(u32),
    #[error("The clock generator did not lock after the sync pulse")]
    NotLocked,
}

/// Output frequency class of the MGT reference clock
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MgtClock {
    Mhz120,
    Mhz160,
    Mhz240,
    Mhz320,
}

/// Which input the synthesizer locks to
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReferenceSource {
    /// The external reference
    Primary,
    /// The on-board oscillator
    Secondary,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceSelect {
    pub source: ReferenceSource,
    pub frequency_mhz: u32,
}

impl Default for ReferenceSelect {
    fn default() -> Self {
        Self {
            source: ReferenceSource::Secondary,
            frequency_mhz: 40,
        }
    }
}

/// Clocks a word out of the SPI master towards the synthesizer
const SPI_COMMAND: u32 = 0x8FA3_8014;
/// Copies the register contents into the chip's EEPROM
const EEPROM_STORE: u32 = 0x0000_001F;

/// Build the register words for a configuration, in the order they must be written
/// # Errors
/// Returns an error if the reference frequency is unsupported
pub fn config_words(clock: MgtClock, reference: ReferenceSelect) -> Result<[u32; 9], Error> {
    let out1 = match clock {
        MgtClock::Mhz120 => 0xEB04_0321,
        MgtClock::Mhz160 => 0xEB02_0321,
        MgtClock::Mhz240 => 0xEB84_0321,
        MgtClock::Mhz320 => 0xEB82_0321,
    };
    let input_mux = match reference.source {
        ReferenceSource::Primary => 0x1000_0E75,
        ReferenceSource::Secondary => 0x1000_0EB5,
    };
    let divider = match reference.frequency_mhz {
        40 => 0x030E_02E6,
        f if f > 40 => 0x030E_02F6,
        f => return Err(Error::UnsupportedReference(f)),
    };
    Ok([
        0xEB04_0320,
        out1,
        0xEB84_0302,
        0xEA86_0303,
        0xEB14_0334,
        input_mux,
        divider,
        0xBD80_0DF7,
        0x8000_1808,
    ])
}

#[derive(Debug)]
pub struct Cdce<T> {
    /// Upwards pointer to the parent class' transport
    transport: Weak<Mutex<T>>,
    sleeper: Arc<dyn Sleeper>,
    /// How long to wait for the clocks to lock after a sync
    lock_policy: PollPolicy,
}

impl<T> Cdce<T>
where
    T: RegisterBus,
{
    const TX_DATA: &'static str = "sysreg.spi.tx_data";
    const COMMAND: &'static str = "sysreg.spi.command";
    const RX_DATA: &'static str = "sysreg.spi.rx_data";
    const REFSEL: &'static str = "sysreg.ctrl.cdce_refsel";
    const SYNC: &'static str = "sysreg.ctrl.cdce_sync";
    const CLK_40_LOCKED: &'static str = "fc7_daq_stat.general.clock_generator.clk_40_locked";
    const REF_CLK_LOCKED: &'static str = "fc7_daq_stat.general.clock_generator.ref_clk_locked";

    /// The chip ignores the SPI bus for this long after an EEPROM store
    pub const EEPROM_SETTLE: Duration = Duration::from_secs(1);
    const SYNC_HOLD: Duration = Duration::from_millis(10);

    #[must_use]
    pub fn new(transport: Weak<Mutex<T>>, sleeper: Arc<dyn Sleeper>, lock_policy: PollPolicy) -> Self {
        Self {
            transport,
            sleeper,
            lock_policy,
        }
    }

    /// Shift one word out to the synthesizer, returning what the SPI master read back
    fn spi_write(bus: &mut T, word: u32) -> Result<u32, Error> {
        bus.write_stack(&[(Self::TX_DATA, word), (Self::COMMAND, SPI_COMMAND)])?;
        // The first read returns the previous transfer
        bus.read(Self::RX_DATA)?;
        Ok(bus.read(Self::RX_DATA)?)
    }

    /// Program the synthesizer, lock it to `reference` and optionally persist the configuration
    /// into its EEPROM
    /// # Errors
    /// Returns an error for unsupported references (before touching the bus), on bad transport,
    /// or if the clocks don't lock
    pub fn configure(
        &self,
        clock: MgtClock,
        reference: ReferenceSelect,
        store: bool,
    ) -> Result<(), Error> {
        with_bus(&self.transport, |bus| self.configure_locked(bus, clock, reference, store))
    }

    pub(crate) fn configure_locked(
        &self,
        bus: &mut T,
        clock: MgtClock,
        reference: ReferenceSelect,
        store: bool,
    ) -> Result<(), Error> {
        let words = config_words(clock, reference)?;
        for word in words {
            let status = Self::spi_write(bus, word)?;
            debug!("CDCE word {word:#010x}, SPI status {status:#010x}");
        }
        self.select_reference_locked(bus, reference.source)?;
        if store {
            bus.write_stack(&[(Self::TX_DATA, EEPROM_STORE), (Self::COMMAND, SPI_COMMAND)])?;
            self.sleeper.sleep(Self::EEPROM_SETTLE);
            debug!("CDCE configuration stored to EEPROM");
        }
        info!(?clock, ?reference, "Clock generator configured");
        Ok(())
    }

    /// The reference select is only latched on the rising edge of sync, so it has to be written
    /// while sync is held low
    pub(crate) fn select_reference_locked(
        &self,
        bus: &mut T,
        source: ReferenceSource,
    ) -> Result<(), Error> {
        bus.write(Self::SYNC, 0)?;
        self.sleeper.sleep(Self::SYNC_HOLD);
        bus.write(
            Self::REFSEL,
            match source {
                ReferenceSource::Primary => 1,
                ReferenceSource::Secondary => 0,
            },
        )?;
        bus.write(Self::SYNC, 1)?;
        let locked = self.lock_policy.until(self.sleeper.as_ref(), || {
            Ok::<_, Error>(
                bus.read(Self::CLK_40_LOCKED)? == 1 && bus.read(Self::REF_CLK_LOCKED)? == 1,
            )
        })?;
        if locked {
            Ok(())
        } else {
            error!("Clock generator failed to lock");
            Err(Error::NotLocked)
        }
    }

    /// Pulse sync again, keeping the current reference
    /// # Errors
    /// Returns an error on bad transport or if the clocks don't lock
    pub fn resync(&self) -> Result<(), Error> {
        with_bus(&self.transport, |bus| {
            let source = if bus.read(Self::REFSEL)? == 1 {
                ReferenceSource::Primary
            } else {
                ReferenceSource::Secondary
            };
            self.select_reference_locked(bus, source)
        })
    }

    /// Whether both generated clocks currently report lock
    /// # Errors
    /// Returns an error on bad transport
    pub fn locked(&self) -> Result<bool, Error> {
        with_bus(&self.transport, |bus| {
            Ok(bus.read(Self::CLK_40_LOCKED)? == 1 && bus.read(Self::REF_CLK_LOCKED)? == 1)
        })
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

    const LOCK: PollPolicy = PollPolicy::new(10, Duration::from_millis(100));

    fn locking_mock() -> Mock {
        let mut mock = Mock::new();
        // The clocks lock once sync is raised
        mock.on_write("sysreg.ctrl.cdce_sync", |state, v| {
            state.set("fc7_daq_stat.general.clock_generator.clk_40_locked", v);
            state.set("fc7_daq_stat.general.clock_generator.ref_clk_locked", v);
        });
        mock
    }

    #[test]
    fn test_config_words() {
        let words = config_words(
            MgtClock::Mhz320,
            ReferenceSelect {
                source: ReferenceSource::Primary,
                frequency_mhz: 160,
            },
        )
        .unwrap();
        assert_eq!(words[1], 0xEB82_0321);
        assert_eq!(words[5], 0x1000_0E75);
        assert_eq!(words[6], 0x030E_02F6);
        let words = config_words(MgtClock::Mhz120, ReferenceSelect::default()).unwrap();
        assert_eq!(
            words,
            [
                0xEB04_0320,
                0xEB04_0321,
                0xEB84_0302,
                0xEA86_0303,
                0xEB14_0334,
                0x1000_0EB5,
                0x030E_02E6,
                0xBD80_0DF7,
                0x8000_1808
            ]
        );
    }

    #[test]
    fn test_unsupported_reference_touches_nothing() {
        let transport = Arc::new(Mutex::new(Mock::new()));
        let cdce = Cdce::new(
            Arc::downgrade(&transport),
            Arc::new(RecordingSleeper::default()),
            LOCK,
        );
        let reference = ReferenceSelect {
            source: ReferenceSource::Primary,
            frequency_mhz: 10,
        };
        assert!(matches!(
            cdce.configure(MgtClock::Mhz120, reference, true),
            Err(Error::UnsupportedReference(10))
        ));
        assert!(transport.lock().unwrap().log().is_empty());
    }

    #[test]
    fn test_configure_ordering() {
        let transport = Arc::new(Mutex::new(locking_mock()));
        let sleeper = Arc::new(RecordingSleeper::default());
        let cdce = Cdce::new(Arc::downgrade(&transport), sleeper.clone(), LOCK);
        cdce.configure(
            MgtClock::Mhz120,
            ReferenceSelect {
                source: ReferenceSource::Primary,
                frequency_mhz: 40,
            },
            true,
        )
        .unwrap();
        let mock = transport.lock().unwrap();
        let tx = mock.writes_to("sysreg.spi.tx_data");
        assert_eq!(tx.len(), 10);
        assert_eq!(tx[9], EEPROM_STORE);
        assert!(mock.writes_to("sysreg.spi.command").iter().all(|c| *c == SPI_COMMAND));
        // De-assert, select, re-assert, in that order
        let writes: Vec<_> = mock
            .log()
            .iter()
            .filter_map(|a| match a {
                Access::Write(n, v) if n.starts_with("sysreg.ctrl") => Some((n.as_str(), *v)),
                _ => None,
            })
            .collect();
        assert_eq!(
            writes,
            vec![
                ("sysreg.ctrl.cdce_sync", 0),
                ("sysreg.ctrl.cdce_refsel", 1),
                ("sysreg.ctrl.cdce_sync", 1)
            ]
        );
        // The EEPROM store is the last SPI transfer and is followed by the settle delay
        let last = mock.log().last().unwrap();
        assert_eq!(*last, Access::Write("sysreg.spi.command".into(), SPI_COMMAND));
        assert!(sleeper.total() >= Cdce::<Mock>::EEPROM_SETTLE);
    }

    #[test]
    fn test_never_locks() {
        let transport = Arc::new(Mutex::new(Mock::new()));
        let sleeper = Arc::new(RecordingSleeper::default());
        let cdce = Cdce::new(Arc::downgrade(&transport), sleeper.clone(), LOCK);
        assert!(matches!(cdce.resync(), Err(Error::NotLocked)));
        assert_eq!(sleeper.count(), 1 + LOCK.max_attempts);
        assert!(!cdce.locked().unwrap());
    }
}
