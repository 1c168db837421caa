use tokio::time::Duration;

/// Tunable timing and sizing knobs. Unset fields fall back to defaults; the
/// whole set is validated once at node construction.
#[derive(Clone, Default)]
pub struct Options {
    /// Interval between empty AppendEntries calls to an idle follower.
    pub heartbeat_timeout: Option<Duration>,
    /// Base follower timeout before starting an election.
    pub election_timeout: Option<Duration>,
    /// Fraction of the election timeout added as random jitter.
    pub max_timeout_jitter: Option<f64>,
    /// Fraction of the election timeout within which a follower considers its
    /// leader alive and refuses to vote for a challenger.
    pub election_timeout_threshold: Option<f64>,
    /// Most entries shipped in one AppendEntries call.
    pub max_append_entries_size: Option<u64>,
    /// Largest snapshot chunk shipped in one InstallSnapshot call.
    pub max_snapshot_chunk_size: Option<u64>,
    /// How long a node lingers in the persist-error state before terminating.
    pub persist_error_notify_timeout: Option<Duration>,
    /// Per-attempt client wait for a response.
    pub rpc_timeout: Option<Duration>,
}

#[derive(Clone)]
pub(crate) struct OptionsValidated {
    pub heartbeat_timeout: Duration,
    pub election_timeout: Duration,
    pub max_timeout_jitter: f64,
    pub election_timeout_threshold: f64,
    pub max_append_entries_size: u64,
    pub max_snapshot_chunk_size: u64,
    pub persist_error_notify_timeout: Duration,
    pub rpc_timeout: Duration,
}

impl OptionsValidated {
    fn validate(&self) -> Result<(), &'static str> {
        if self.heartbeat_timeout >= self.election_timeout {
            return Err("heartbeat timeout must be less than the election timeout");
        }
        if self.max_timeout_jitter <= 0.0 {
            return Err("timeout jitter must be positive");
        }
        if !(0.0..=1.0).contains(&self.election_timeout_threshold) {
            return Err("election timeout threshold must be a fraction in [0, 1]");
        }
        if self.max_append_entries_size == 0 {
            return Err("append entries batch size must be non-zero");
        }
        if self.max_snapshot_chunk_size == 0 {
            return Err("snapshot chunk size must be non-zero");
        }
        Ok(())
    }
}

impl TryFrom<Options> for OptionsValidated {
    type Error = &'static str;

    fn try_from(options: Options) -> Result<Self, Self::Error> {
        let values = OptionsValidated {
            heartbeat_timeout: options.heartbeat_timeout.unwrap_or(Duration::from_millis(100)),
            election_timeout: options.election_timeout.unwrap_or(Duration::from_millis(500)),
            max_timeout_jitter: options.max_timeout_jitter.unwrap_or(0.5),
            election_timeout_threshold: options.election_timeout_threshold.unwrap_or(0.8),
            max_append_entries_size: options.max_append_entries_size.unwrap_or(64),
            max_snapshot_chunk_size: options.max_snapshot_chunk_size.unwrap_or(64 * 1024),
            persist_error_notify_timeout: options
                .persist_error_notify_timeout
                .unwrap_or(Duration::from_secs(1)),
            rpc_timeout: options.rpc_timeout.unwrap_or(Duration::from_millis(500)),
        };

        values.validate()?;
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(OptionsValidated::try_from(Options::default()).is_ok());
    }

    #[test]
    fn heartbeat_must_undercut_election_timeout() {
        let options = Options {
            heartbeat_timeout: Some(Duration::from_millis(500)),
            election_timeout: Some(Duration::from_millis(200)),
            ..Options::default()
        };
        assert!(OptionsValidated::try_from(options).is_err());
    }

    #[test]
    fn zero_batch_size_rejected() {
        let options = Options {
            max_append_entries_size: Some(0),
            ..Options::default()
        };
        assert!(OptionsValidated::try_from(options).is_err());
    }
}
