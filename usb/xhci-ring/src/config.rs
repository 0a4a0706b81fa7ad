use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

bitflags! {
    /// Controller quirks changing how the rings are driven.
    pub struct Quirks: u32 {
        /// Spurious successful transfer event after a short packet.
        const SPURIOUS_SUCCESS = 1 << 0;
        /// Spurious successful transfer event on isochronous rings after an error on the last TRB.
        const ETRON_HOST = 1 << 1;
        /// Never soft retry a transaction error.
        const NO_SOFT_RETRY = 1 << 2;
        /// Link TRBs must always carry the chain bit.
        const LINK_TRB_CHAIN = 1 << 3;
        /// Full event rings are handled poorly, interrupt at least every few isochronous TDs.
        const AVOID_BEI = 1 << 4;
        /// 0.96 controller using the 1.0 TD size calculation.
        const MTK_HOST = 1 << 5;
        /// Vendor command completion events.
        const NEC_HOST = 1 << 6;
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum QuirkName {
    SpuriousSuccess,
    EtronHost,
    NoSoftRetry,
    LinkTrbChain,
    AvoidBei,
    MtkHost,
    NecHost,
}

impl QuirkName {
    pub fn flag(self) -> Quirks {
        match self {
            Self::SpuriousSuccess => Quirks::SPURIOUS_SUCCESS,
            Self::EtronHost => Quirks::ETRON_HOST,
            Self::NoSoftRetry => Quirks::NO_SOFT_RETRY,
            Self::LinkTrbChain => Quirks::LINK_TRB_CHAIN,
            Self::AvoidBei => Quirks::AVOID_BEI,
            Self::MtkHost => Quirks::MTK_HOST,
            Self::NecHost => Quirks::NEC_HOST,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct XhciConfig {
    /// TRB slots per ring segment, including the link TRB of producer rings.
    pub trbs_per_segment: usize,
    pub command_ring_segments: usize,
    pub event_ring_segments: usize,
    pub transfer_ring_segments: usize,
    pub isoc_ring_segments: usize,
    /// Upper bound a transfer ring may grow to.
    pub max_ring_segments: usize,
    pub command_timeout_ms: u64,
    /// How long the command ring may keep running after an abort was requested.
    pub abort_timeout_ms: u64,
    /// How long to wait for the Command Ring Stopped event once the ring stopped.
    pub stop_event_timeout_ms: u64,
    /// Window in which a Stop Endpoint command racing a starting endpoint is retried.
    pub stop_endpoint_retry_ms: u64,
    /// Transaction errors on a TD soft retried beyond the first one.
    pub max_soft_retry: u32,
    /// Interface version as reported by HCIVERSION, in BCD.
    pub hci_version: u16,
    pub quirks: Vec<QuirkName>,
}

impl Default for XhciConfig {
    fn default() -> Self {
        Self {
            trbs_per_segment: 256,
            command_ring_segments: 1,
            event_ring_segments: 1,
            transfer_ring_segments: 2,
            isoc_ring_segments: 4,
            max_ring_segments: 64,
            command_timeout_ms: 5000,
            abort_timeout_ms: 5000,
            stop_event_timeout_ms: 2000,
            stop_endpoint_retry_ms: 100,
            max_soft_retry: 3,
            hci_version: 0x110,
            quirks: Vec::new(),
        }
    }
}

impl XhciConfig {
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_toml(&fs::read_to_string(path)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.trbs_per_segment < 16 || self.trbs_per_segment > 4096 {
            return Err(Error::Config(format!(
                "trbs_per_segment must be within 16..=4096, got {}",
                self.trbs_per_segment
            )));
        }
        let segments = [
            ("command_ring_segments", self.command_ring_segments),
            ("event_ring_segments", self.event_ring_segments),
            ("transfer_ring_segments", self.transfer_ring_segments),
            ("isoc_ring_segments", self.isoc_ring_segments),
        ];
        for (name, count) in segments {
            if count == 0 || count > self.max_ring_segments {
                return Err(Error::Config(format!(
                    "{} must be within 1..={}, got {}",
                    name, self.max_ring_segments, count
                )));
            }
        }
        // ERSTSZ is a 16 bit field
        if self.event_ring_segments > u16::MAX as usize {
            return Err(Error::Config("too many event ring segments".into()));
        }
        Ok(())
    }

    pub fn quirks(&self) -> Quirks {
        self.quirks
            .iter()
            .fold(Quirks::empty(), |quirks, name| quirks | name.flag())
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
    pub fn abort_timeout(&self) -> Duration {
        Duration::from_millis(self.abort_timeout_ms)
    }
    pub fn stop_event_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_event_timeout_ms)
    }
    pub fn stop_endpoint_retry(&self) -> Duration {
        Duration::from_millis(self.stop_endpoint_retry_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_is_default() {
        let config = XhciConfig::from_toml("").unwrap();
        assert_eq!(config.trbs_per_segment, 256);
        assert_eq!(config.command_timeout(), Duration::from_secs(5));
        assert_eq!(config.abort_timeout(), Duration::from_secs(5));
        assert_eq!(config.stop_event_timeout(), Duration::from_secs(2));
        assert_eq!(config.max_soft_retry, 3);
        assert!(config.quirks().is_empty());
    }

    #[test]
    fn quirks_by_name() {
        let config = XhciConfig::from_toml(
            r#"
            trbs_per_segment = 64
            quirks = ["spurious-success", "etron-host"]
            "#,
        )
        .unwrap();
        assert_eq!(config.trbs_per_segment, 64);
        assert_eq!(
            config.quirks(),
            Quirks::SPURIOUS_SUCCESS | Quirks::ETRON_HOST
        );
    }

    #[test]
    fn rejects_bad_values() {
        assert!(matches!(
            XhciConfig::from_toml("trbs_per_segment = 4"),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            XhciConfig::from_toml("transfer_ring_segments = 0"),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            XhciConfig::from_toml("quirks = [\"bogus\"]"),
            Err(Error::Toml(_))
        ));
        assert!(matches!(
            XhciConfig::from_toml("no_such_key = 1"),
            Err(Error::Toml(_))
        ));
    }
}
