use std::time::Duration;
use tokio::time::Instant;

use crate::config::RudpConfig;

#[derive(Debug, Eq, PartialEq)]
pub(crate) enum Liveness {
    /// the channel is not active yet (client role channel before its handshake started)
    Unknown,
    Alive,
    /// the peer was quiet for a while, send it a probe
    Probe,
    Dead(Duration),
}

impl Liveness {
    pub fn check(last_liveness: Option<Instant>, now: Instant, config: &RudpConfig) -> Liveness {
        let Some(last_liveness) = last_liveness else {
            return Liveness::Unknown;
        };

        let silence = now.saturating_duration_since(last_liveness);
        if silence > config.dead_peer_threshold {
            Liveness::Dead(silence)
        }
        else if silence > config.keepalive_probe_threshold {
            Liveness::Probe
        }
        else {
            Liveness::Alive
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::fresh(0, Liveness::Alive)]
    #[case::at_probe_threshold(2000, Liveness::Alive)]
    #[case::probe(2001, Liveness::Probe)]
    #[case::at_dead_threshold(10_000, Liveness::Probe)]
    #[case::dead(10_001, Liveness::Dead(Duration::from_millis(10_001)))]
    fn test_check(#[case] silence_millis: u64, #[case] expected: Liveness) {
        let last = Instant::now();
        let now = last + Duration::from_millis(silence_millis);
        assert_eq!(Liveness::check(Some(last), now, &RudpConfig::default()), expected);
    }

    #[test]
    fn test_check_unknown() {
        assert_eq!(Liveness::check(None, Instant::now(), &RudpConfig::default()), Liveness::Unknown);
    }
}
