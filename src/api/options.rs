use std::convert::TryFrom;
use tokio::time::Duration;

/// Timing knobs. Any field left as `None` takes the default. The defaults assume a LAN-ish
/// cluster; widen everything proportionally for higher-latency links.
#[derive(Clone, Default)]
pub struct RaftOptions {
    pub leader_heartbeat_duration: Option<Duration>,
    pub election_min_timeout: Option<Duration>,
    pub election_max_timeout: Option<Duration>,
    pub leader_append_entries_timeout: Option<Duration>,
}

pub(super) struct RaftOptionsValidated {
    pub leader_heartbeat_duration: Duration,
    pub election_min_timeout: Duration,
    pub election_max_timeout: Duration,
    pub leader_append_entries_timeout: Duration,
}

impl RaftOptionsValidated {
    fn validate(&self) -> Result<(), &'static str> {
        if self.leader_heartbeat_duration >= self.election_min_timeout {
            return Err("Election minimum timeout must be greater than leader's heartbeat period");
        }
        if self.election_min_timeout >= self.election_max_timeout {
            return Err("Election minimum timeout must be less than maximum timeout");
        }
        if self.leader_append_entries_timeout >= self.election_min_timeout {
            return Err("Leader's AppendEntries RPC timeout must be less than the election timeout");
        }

        Ok(())
    }
}

impl TryFrom<RaftOptions> for RaftOptionsValidated {
    type Error = &'static str;

    fn try_from(options: RaftOptions) -> Result<Self, Self::Error> {
        let values = RaftOptionsValidated {
            leader_heartbeat_duration: options.leader_heartbeat_duration.unwrap_or(Duration::from_millis(100)),
            election_min_timeout: options.election_min_timeout.unwrap_or(Duration::from_millis(250)),
            election_max_timeout: options.election_max_timeout.unwrap_or(Duration::from_millis(500)),
            leader_append_entries_timeout: options
                .leader_append_entries_timeout
                .unwrap_or(Duration::from_millis(100)),
        };

        values.validate()?;
        Ok(values)
    }
}
