//! Lock acquisition of the optical links between the board and its optical groups

use crate::{
    core::LinkId,
    poll::{
        PollPolicy,
        Sleeper,
    },
    transport::{
        with_bus,
        BusWord,
        RegisterBus,
        TransportResult,
    },
};
use fc7ctl_derive::BusWord;
use packed_struct::prelude::*;
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
    warn,
};

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Transport(#[from] crate::transport::Error),
    #[error("Optical link {link} never locked after {resets} resets ({status:?})")]
    LinkUnlockable {
        link: LinkId,
        resets: usize,
        status: LinkStatus,
    },
}

/// Selects the link whose status the next status read returns
#[derive(Debug, PackedStruct, Default, Copy, Clone, PartialEq, Eq, BusWord)]
#[packed_struct(bit_numbering = "lsb0", size_bytes = "4")]
pub struct StatusRequest {
    #[packed_field(bits = "26..=31")]
    pub link: Integer<u8, packed_bits::Bits<6>>,
    #[packed_field(bits = "22")]
    pub request: bool,
}

/// Per-link readiness flags
#[derive(Debug, PackedStruct, Default, Copy, Clone, PartialEq, Eq, BusWord)]
#[packed_struct(bit_numbering = "lsb0", size_bytes = "4")]
pub struct LinkStatus {
    #[packed_field(bits = "2")]
    pub tx_ready: bool,
    /// The deserializer
    #[packed_field(bits = "1")]
    pub mgt_ready: bool,
    #[packed_field(bits = "0")]
    pub rx_ready: bool,
}

impl LinkStatus {
    #[must_use]
    pub fn locked(&self) -> bool {
        self.tx_ready && self.mgt_ready && self.rx_ready
    }
}

#[derive(Debug)]
pub struct OpticalLock<T> {
    /// Upwards pointer to the parent class' transport
    transport: Weak<Mutex<T>>,
    sleeper: Arc<dyn Sleeper>,
    /// Attempts are full resets, the interval is how long the links get to settle after each
    policy: PollPolicy,
}

impl<T> OpticalLock<T>
where
    T: RegisterBus,
{
    const GENERAL: &'static str = "fc7_daq_ctrl.optical_block.general";
    const STATUS: &'static str = "fc7_daq_stat.optical_block";

    #[must_use]
    pub fn new(transport: Weak<Mutex<T>>, sleeper: Arc<dyn Sleeper>, policy: PollPolicy) -> Self {
        Self {
            transport,
            sleeper,
            policy,
        }
    }

    fn status_locked(&self, bus: &mut T, link: LinkId) -> Result<LinkStatus, Error> {
        let request = StatusRequest {
            link: (link & 0x3F).into(),
            request: true,
        };
        bus.write_word(Self::GENERAL, &request)?;
        let status = bus.read_word(Self::STATUS)?;
        bus.write(Self::GENERAL, 0)?;
        Ok(status)
    }

    /// Current status of one link, without resetting anything
    /// # Errors
    /// Returns an error on bad transport
    pub fn status(&self, link: LinkId) -> Result<LinkStatus, Error> {
        with_bus(&self.transport, |bus| self.status_locked(bus, link))
    }

    /// Reset the optical block until every link in `links` reports lock.
    /// Returns the final status of each link.
    /// # Errors
    /// Returns an error on bad transport or if a link is still unlocked after every reset
    pub fn lock(&self, links: &[LinkId]) -> Result<Vec<(LinkId, LinkStatus)>, Error> {
        with_bus(&self.transport, |bus| self.lock_locked(bus, links))
    }

    pub(crate) fn lock_locked(
        &self,
        bus: &mut T,
        links: &[LinkId],
    ) -> Result<Vec<(LinkId, LinkStatus)>, Error> {
        let mut last = Vec::new();
        for reset in 1..=self.policy.max_attempts {
            bus.write(Self::GENERAL, 1)?;
            self.sleeper.sleep(self.policy.interval);
            last = links
                .iter()
                .map(|&link| Ok((link, self.status_locked(bus, link)?)))
                .collect::<Result<Vec<_>, Error>>()?;
            if last.iter().all(|(_, s)| s.locked()) {
                info!(?links, reset, "Optical links locked");
                return Ok(last);
            }
            for (link, status) in last.iter().filter(|(_, s)| !s.locked()) {
                debug!(link, ?status, "Optical link not locked");
            }
            warn!(reset, "Optical links not locked, resetting again");
        }
        let (link, status) = last
            .into_iter()
            .find(|(_, s)| !s.locked())
            .unwrap_or_default();
        error!(link, ?status, "Optical link never locked");
        Err(Error::LinkUnlockable {
            link,
            resets: self.policy.max_attempts,
            status,
        })
    }
}

/// Default budget of full resets, each followed by a long settle
pub const LOCK_POLICY: PollPolicy = PollPolicy::new(10, Duration::from_secs(2));
