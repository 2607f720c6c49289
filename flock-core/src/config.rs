//! Engine tunables.

use serde::Deserialize;

/// Protocol tunables. Every field has a default so a partial (or absent)
/// config section works.
#[derive(Debug, Clone, Deserialize)]
pub struct ProtoConfig {
    /// Sequence space bound. Power of two. Doubles as the undefined-seqno
    /// sentinel.
    #[serde(default = "default_seqno_max")]
    pub seqno_max: u32,
    /// Maximum number of own un-acknowledged messages in flight.
    #[serde(default = "default_send_window")]
    pub send_window: u32,
    /// Peer silence span after which it is declared non-operational.
    #[serde(default = "default_inactive_timeout_ms")]
    pub inactive_timeout_ms: u64,
    /// Consensus timer period (inactivity checks, join re-announcement).
    #[serde(default = "default_consensus_period_ms")]
    pub consensus_period_ms: u64,
    /// Install timer period (stalled recovery round restart).
    #[serde(default = "default_install_period_ms")]
    pub install_period_ms: u64,
    /// Resend timer period (retransmission and ARU acknowledgement).
    #[serde(default = "default_resend_period_ms")]
    pub resend_period_ms: u64,
}

impl Default for ProtoConfig {
    fn default() -> Self {
        Self {
            seqno_max: default_seqno_max(),
            send_window: default_send_window(),
            inactive_timeout_ms: default_inactive_timeout_ms(),
            consensus_period_ms: default_consensus_period_ms(),
            install_period_ms: default_install_period_ms(),
            resend_period_ms: default_resend_period_ms(),
        }
    }
}

impl ProtoConfig {
    /// Peer inactivity expressed in consensus ticks.
    pub fn inactive_ticks(&self) -> u64 {
        (self.inactive_timeout_ms / self.consensus_period_ms.max(1)).max(1)
    }
}

fn default_seqno_max() -> u32 {
    0x8000_0000
}
fn default_send_window() -> u32 {
    32
}
fn default_inactive_timeout_ms() -> u64 {
    5_000
}
fn default_consensus_period_ms() -> u64 {
    1_000
}
fn default_install_period_ms() -> u64 {
    500
}
fn default_resend_period_ms() -> u64 {
    100
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = ProtoConfig::default();
        assert_eq!(c.seqno_max, 0x8000_0000);
        assert_eq!(c.send_window, 32);
        assert_eq!(c.consensus_period_ms, 1_000);
        assert_eq!(c.install_period_ms, 500);
        assert_eq!(c.resend_period_ms, 100);
        assert_eq!(c.inactive_ticks(), 5);
    }

    #[test]
    fn partial_toml_overrides() {
        let c: ProtoConfig = toml::from_str("seqno_max = 2048\nsend_window = 4\n").unwrap();
        assert_eq!(c.seqno_max, 2048);
        assert_eq!(c.send_window, 4);
        assert_eq!(c.resend_period_ms, 100);
    }
}
