use std::time::Duration;

use crate::status::{Status, StatusResult};

/// Tunable parameters shared by all protocol layers of a node.
#[derive(Debug, Clone)]
pub struct OvernetConfig {
    /// upper bound for a single wire packet, including framing
    pub mss: usize,
    /// packet assembly stops greedily filling once the remaining budget drops below this
    pub min_mss: usize,
    /// number of sequence numbers past the receive tip that per-packet state is tracked for;
    ///  packets beyond this are a protocol failure, not silently dropped
    pub lookahead_window: usize,
    /// receives without an outgoing ack before an ack is forced out immediately
    pub max_unacked_receives: usize,
    /// debounce interval for coalescing acks of rapid receive bursts
    pub ack_send_delay: Duration,
    /// delay between retries of an `Unavailable` send at the stream layer
    pub send_retry_delay: Duration,
    /// messages buffered for a not-yet-registered stream or link before refusing with
    ///  `ResourceExhausted`
    pub pending_message_limit: usize,
    /// initial handshake retransmission delay (grows by 11/10 per tick, jittered)
    pub handshake_backoff_base: Duration,
    /// handshake ticks before an un-established peer is forgotten
    pub handshake_retry_limit: u8,
    /// routing table entries not updated for this long are removed on flush
    pub entry_expiry: Duration,
    /// upper bound for a reassembled application message
    pub max_message_size: u64,
}

impl Default for OvernetConfig {
    fn default() -> OvernetConfig {
        OvernetConfig {
            mss: 1400,
            min_mss: 64,
            lookahead_window: 256,
            max_unacked_receives: 8,
            ack_send_delay: Duration::from_millis(25),
            send_retry_delay: Duration::from_millis(2),
            pending_message_limit: 128,
            handshake_backoff_base: Duration::from_millis(100),
            handshake_retry_limit: 5,
            entry_expiry: Duration::from_secs(300),
            max_message_size: 4 * 1024 * 1024,
        }
    }
}

impl OvernetConfig {
    pub fn validate(&self) -> StatusResult<()> {
        if self.min_mss < 16 || self.mss < self.min_mss {
            return Err(Status::invalid_argument(format!(
                "mss {} / min_mss {} are inconsistent", self.mss, self.min_mss)));
        }
        if self.lookahead_window < 2 {
            return Err(Status::invalid_argument("lookahead window must hold at least two packets"));
        }
        if self.max_unacked_receives == 0 {
            return Err(Status::invalid_argument("max_unacked_receives must be positive"));
        }
        if self.handshake_retry_limit == 0 {
            return Err(Status::invalid_argument("handshake retry limit must be positive"));
        }
        if self.max_message_size == 0 {
            return Err(Status::invalid_argument("max message size must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_default_is_valid() {
        assert!(OvernetConfig::default().validate().is_ok());
    }

    #[rstest]
    #[case::mss_below_min_mss(|c: &mut OvernetConfig| c.mss = 32)]
    #[case::tiny_min_mss(|c: &mut OvernetConfig| c.min_mss = 8)]
    #[case::window_too_small(|c: &mut OvernetConfig| c.lookahead_window = 1)]
    #[case::no_unacked_receives(|c: &mut OvernetConfig| c.max_unacked_receives = 0)]
    #[case::no_handshake_retries(|c: &mut OvernetConfig| c.handshake_retry_limit = 0)]
    #[case::zero_message_size(|c: &mut OvernetConfig| c.max_message_size = 0)]
    fn test_invalid_configs_rejected(#[case] break_it: fn(&mut OvernetConfig)) {
        let mut config = OvernetConfig::default();
        break_it(&mut config);
        assert!(config.validate().is_err());
    }
}
