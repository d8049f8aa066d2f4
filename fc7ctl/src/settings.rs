//! Run configuration of one board, loadable from TOML. Every field has a default, so an empty
//! document is a complete configuration.

use crate::{
    blocks::{
        cdce::{
            MgtClock,
            ReferenceSelect,
        },
        command_processor::REPLY_POLICY,
        fast_command::TriggerConfig,
        link_trainer::TrainerSettings,
        optical::LOCK_POLICY,
        readout::ReadoutSettings,
    },
    poll::PollPolicy,
};
use serde::{
    Deserialize,
    Serialize,
};
use std::{
    path::Path,
    time::Duration,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Toml(#[from] toml::de::Error),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClockSettings {
    pub mgt: MgtClock,
    pub reference: ReferenceSelect,
    /// Persist the configuration into the synthesizer's EEPROM
    pub store: bool,
}

impl Default for ClockSettings {
    fn default() -> Self {
        Self {
            mgt: MgtClock::Mhz120,
            reference: ReferenceSelect::default(),
            store: false,
        }
    }
}

/// Waits that don't belong to a single block's settings
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollSettings {
    pub clock_lock: PollPolicy,
    /// Attempts are full resets of the optical block
    pub optical_lock: PollPolicy,
    /// The interval is scaled by the number of expected replies
    pub reply_fifo: PollPolicy,
    pub fsm_idle: PollPolicy,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            clock_lock: PollPolicy::new(10, Duration::from_millis(100)),
            optical_lock: LOCK_POLICY,
            reply_fifo: REPLY_POLICY,
            fsm_idle: PollPolicy::new(10, Duration::from_millis(10)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub clock: ClockSettings,
    pub trigger: TriggerConfig,
    pub readout: ReadoutSettings,
    pub trainer: TrainerSettings,
    pub polling: PollSettings,
}

impl Settings {
    /// # Errors
    /// Returns an error if the document isn't valid TOML or has mistyped fields
    pub fn from_toml_str(s: &str) -> Result<Self, Error> {
        Ok(toml::from_str(s)?)
    }

    /// # Errors
    /// Returns an error if the file can't be read or doesn't parse
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        Self::from_toml_str(&std::fs::read_to_string(path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocks::{
        cdce::ReferenceSource,
        fast_command::TriggerSource,
    };

    #[test]
    fn test_empty_document() {
        let settings = Settings::from_toml_str("").unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.polling.optical_lock.max_attempts, 10);
        assert_eq!(settings.polling.optical_lock.interval, Duration::from_secs(2));
        assert_eq!(settings.readout.max_recovery_attempts, 5);
    }

    #[test]
    fn test_full_document() {
        let settings = Settings::from_toml_str(
            r#"
            [clock]
            mgt = "Mhz320"
            store = true
            reference = { source = "Primary", frequency_mhz = 160 }

            [trigger]
            rate_khz = 5
            multiplicity = 2
            source = { kind = "Consecutive", delay = 40 }

            [readout]
            handshake = true
            max_recovery_attempts = 2

            [trainer.line]
            max_attempts = 3
            interval = 2000

            [polling.reply_fifo]
            max_attempts = 20
            interval = 50
            "#,
        )
        .unwrap();
        assert_eq!(settings.clock.mgt, MgtClock::Mhz320);
        assert!(settings.clock.store);
        assert_eq!(settings.clock.reference.source, ReferenceSource::Primary);
        assert_eq!(settings.trigger.source, TriggerSource::Consecutive { delay: 40 });
        assert_eq!(settings.trigger.multiplicity, 2);
        assert_eq!(settings.trigger.stubs_mask, 1);
        assert!(settings.readout.handshake);
        assert_eq!(settings.readout.max_recovery_attempts, 2);
        assert_eq!(settings.trainer.line, PollPolicy::new(3, Duration::from_millis(2)));
        assert_eq!(settings.polling.reply_fifo.interval, Duration::from_micros(50));
        assert_eq!(settings.polling.fsm_idle, PollSettings::default().fsm_idle);
    }

    #[test]
    fn test_rejects_mistyped_field() {
        assert!(matches!(
            Settings::from_toml_str("[readout]\nhandshake = 3"),
            Err(Error::Toml(_))
        ));
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            Settings::from_file("/nonexistent/fc7ctl.toml"),
            Err(Error::Io(_))
        ));
    }
}
