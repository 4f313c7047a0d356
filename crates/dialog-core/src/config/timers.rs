use std::time::Duration;

use serde::{Deserialize, Serialize};

/// RFC 3261 timer values.
///
/// Defaults follow RFC 3261 Table 4 for UDP:
///
/// - **T1** (500 ms): round-trip estimate, initial retransmit interval
/// - **T2** (4 s): retransmit interval cap for non-INVITE requests and
///   INVITE responses
/// - **T4** (5 s): how long the network may hold a message; Timer K
/// - **Timer B / H / J / D** (64·T1): give-up and linger windows
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimerSettings {
    pub t1: Duration,
    pub t2: Duration,
    pub t4: Duration,
    /// Client give-up timeout (Timer B for INVITE, Timer F otherwise)
    pub timer_b: Duration,
    /// How long a timed out client transaction lingers to absorb late
    /// responses
    pub timer_c: Duration,
    /// INVITE client transaction wait after a final response
    pub timer_d: Duration,
    /// INVITE server transaction wait for ACK
    pub timer_h: Duration,
    /// Non-INVITE server transaction wait after a final response
    pub timer_j: Duration,
    /// Timer B replacement once a provisional response arrived
    pub extended_timeout: Duration,
    /// How long a held 2xx ACK may wait for the UAC before a bug is logged
    pub uack_wait: Duration,
}

impl Default for TimerSettings {
    fn default() -> Self {
        TimerSettings {
            t1: Duration::from_millis(500),
            t2: Duration::from_secs(4),
            t4: Duration::from_secs(5),
            timer_b: Duration::from_secs(32),
            timer_c: Duration::from_secs(32),
            timer_d: Duration::from_secs(32),
            timer_h: Duration::from_secs(32),
            timer_j: Duration::from_secs(32),
            extended_timeout: Duration::from_secs(300),
            uack_wait: Duration::from_secs(32),
        }
    }
}

impl TimerSettings {
    /// Scale every 64·T1 style timer along with `t1`
    pub fn with_t1(mut self, t1: Duration) -> Self {
        let wait = t1 * 64;
        self.t1 = t1;
        self.timer_b = wait;
        self.timer_c = wait;
        self.timer_d = wait;
        self.timer_h = wait;
        self.timer_j = wait;
        self.uack_wait = wait;
        self
    }

    pub fn with_t2(mut self, t2: Duration) -> Self {
        self.t2 = t2;
        self
    }

    pub fn with_extended_timeout(mut self, timeout: Duration) -> Self {
        self.extended_timeout = timeout;
        self
    }

    /// Next retransmit interval after `current`, doubling and, when `capped`,
    /// limited to T2
    pub fn next_retransmit(&self, current: Duration, capped: bool) -> Duration {
        let next = current * 2;
        if capped { next.min(self.t2) } else { next }
    }
}
