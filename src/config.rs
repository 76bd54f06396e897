use std::time::Duration;
use anyhow::bail;

use crate::packet::{Seq, MESSAGE_PACKET_OVERHEAD};

pub struct RudpConfig {
    /// The maximum datagram size the application is willing to put on the wire. Payloads are
    ///  cut into fragments of [RudpConfig::max_fragment_size] bytes, leaving 20% of the MTU as
    ///  margin for packet framing.
    ///
    /// NB: this is not discovered, and it is the application's responsibility to pick a value
    ///  that all routes between peers support.
    pub mtu: usize,

    /// A sent packet that was not acknowledged after this time is sent again
    pub retransmit_timeout: Duration,
    /// Period at which a channel inspects its pending packets for overdue ones
    pub retransmit_check_interval: Duration,

    /// Period of the keepalive loop
    pub keepalive_interval: Duration,
    /// If a peer was silent for longer than this, a PING probe is sent to it
    pub keepalive_probe_threshold: Duration,
    /// If a peer was silent for longer than this, the channel is torn down locally
    pub dead_peer_threshold: Duration,

    /// Upper bound for every wait in a channel's background loops, i.e. the maximum time a
    ///  loop goes without re-checking its state if no wake-up signal arrives
    pub max_poll_interval: Duration,

    /// First sequence number of channels that were requested by this side
    pub client_start_sequence: Seq,
    /// First sequence number of channels that were assigned by this side
    pub server_start_sequence: Seq,

    pub message_packet_header: [u8; 2],
    pub control_packet_header: [u8; 2],

    /// Size of the buffer datagrams are received into. Longer datagrams are truncated by the
    ///  OS and subsequently fail to parse.
    pub receive_buffer_size: usize,

    /// Number of connection events that are buffered for slow subscribers before the oldest
    ///  are dropped
    pub event_channel_capacity: usize,
}

impl Default for RudpConfig {
    fn default() -> Self {
        RudpConfig {
            mtu: 8192,
            retransmit_timeout: Duration::from_secs(1),
            retransmit_check_interval: Duration::from_millis(100),
            keepalive_interval: Duration::from_secs(1),
            keepalive_probe_threshold: Duration::from_secs(2),
            dead_peer_threshold: Duration::from_secs(10),
            max_poll_interval: Duration::from_secs(1),
            client_start_sequence: 100,
            server_start_sequence: 200,
            message_packet_header: [0xFF, 0x01],
            control_packet_header: [0xFF, 0x02],
            receive_buffer_size: 65536,
            event_channel_capacity: 1024,
        }
    }
}

impl RudpConfig {
    /// floor(mtu * 0.8)
    pub fn max_fragment_size(&self) -> usize {
        self.mtu / 5 * 4 + (self.mtu % 5) * 4 / 5
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_fragment_size() == 0 {
            bail!("MTU is too small");
        }
        if self.mtu > i32::MAX as usize {
            bail!("MTU must fit into a 32 bit signed integer");
        }
        if self.message_packet_header == self.control_packet_header {
            bail!("message packets and control packets must have different header prefixes");
        }
        if self.client_start_sequence == self.server_start_sequence {
            bail!("client and server start sequence must be different");
        }
        if self.retransmit_timeout.is_zero()
            || self.retransmit_check_interval.is_zero()
            || self.keepalive_interval.is_zero()
            || self.max_poll_interval.is_zero()
        {
            bail!("timeouts and intervals must be positive");
        }
        if self.keepalive_probe_threshold >= self.dead_peer_threshold {
            bail!("keepalive probe threshold must be smaller than the dead peer threshold");
        }
        if self.receive_buffer_size < MESSAGE_PACKET_OVERHEAD + self.max_fragment_size() {
            bail!("receive buffer size is too small for the configured MTU");
        }
        if self.event_channel_capacity == 0 {
            bail!("event channel capacity must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::default(8192, 6553)]
    #[case::exact(100, 80)]
    #[case::rounded_down(99, 79)]
    #[case::tiny(1, 0)]
    fn test_max_fragment_size(#[case] mtu: usize, #[case] expected: usize) {
        let config = RudpConfig { mtu, ..Default::default() };
        assert_eq!(config.max_fragment_size(), expected);
    }

    #[test]
    fn test_validate_default() {
        assert!(RudpConfig::default().validate().is_ok());
    }

    #[rstest]
    #[case::mtu_too_small(RudpConfig { mtu: 1, ..Default::default() })]
    #[case::same_headers(RudpConfig { control_packet_header: [0xFF, 0x01], ..Default::default() })]
    #[case::same_start_sequence(RudpConfig { server_start_sequence: 100, ..Default::default() })]
    #[case::zero_retransmit_timeout(RudpConfig { retransmit_timeout: Duration::ZERO, ..Default::default() })]
    #[case::probe_after_dead(RudpConfig { keepalive_probe_threshold: Duration::from_secs(10), ..Default::default() })]
    #[case::receive_buffer_too_small(RudpConfig { receive_buffer_size: 1000, ..Default::default() })]
    fn test_validate_invalid(#[case] config: RudpConfig) {
        assert!(config.validate().is_err());
    }
}
