//! Tunables for the slot migration protocol: one struct holding every
//! configurable knob, with a `Default` carrying its implied defaults,
//! following the `ClusterConfig`/`ServerConfig` pattern used elsewhere in
//! this codebase.

/// Migration-related tunables. All durations are milliseconds.
#[derive(Debug, Clone, Copy)]
pub struct MigrationConfig {
    /// `cluster-migration-timeout`: the manual failover grace period a
    /// pause is first granted for.
    pub cluster_mf_timeout_ms: i64,
    /// Multiplier applied to `cluster_mf_timeout_ms` to get the initial
    /// pause deadline (§4.4).
    pub cluster_mf_pause_mult: i64,
    /// Extension applied to the pause deadline when failover is granted
    /// (§4.4): `now + CLUSTER_OPERATION_TIMEOUT`.
    pub cluster_operation_timeout_ms: i64,
    /// `repl_timeout` in §4.7 / §8: a job with no inbound interaction for
    /// longer than this, and not in `FAILOVER_GRANTED`, is timed out.
    pub replication_timeout_ms: i64,
    /// How many terminal jobs the supervisor keeps before trimming the
    /// oldest, per §4.7 step 4.
    pub finished_job_log_cap: usize,
    /// `slot_migration_max_failover_repl_bytes`: client output buffer cap
    /// the source checks before pausing writes. Negative means unlimited.
    pub max_failover_repl_bytes: i64,
    /// How often the supervisor's cluster-cron-equivalent tick runs.
    pub tick_interval_ms: u64,
    /// Total slots in the shard key space (matches
    /// [`slotstore_core::SLOT_COUNT`]; kept configurable for tests that
    /// want a smaller space).
    pub slot_count: u16,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            cluster_mf_timeout_ms: 5_000,
            cluster_mf_pause_mult: 2,
            cluster_operation_timeout_ms: 10_000,
            replication_timeout_ms: 60_000,
            finished_job_log_cap: 25,
            max_failover_repl_bytes: -1,
            tick_interval_ms: 100,
            slot_count: slotstore_core::SLOT_COUNT,
        }
    }
}

impl MigrationConfig {
    /// The pause deadline set on first `REQUEST-PAUSE`: `now +
    /// cluster_mf_timeout x CLUSTER_MF_PAUSE_MULT`.
    #[must_use]
    pub fn initial_pause_deadline(&self, now: i64) -> i64 {
        now + self.cluster_mf_timeout_ms * self.cluster_mf_pause_mult
    }

    /// The pause deadline extension applied on granting failover: `now +
    /// CLUSTER_OPERATION_TIMEOUT`. The longer of this and any existing
    /// deadline wins (§4.4, §9 open question).
    #[must_use]
    pub fn failover_pause_deadline(&self, now: i64) -> i64 {
        now + self.cluster_operation_timeout_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_sane() {
        let cfg = MigrationConfig::default();
        assert!(cfg.cluster_mf_timeout_ms > 0);
        assert!(cfg.max_failover_repl_bytes < 0, "unlimited by default");
    }

    #[test]
    fn pause_deadline_extension_takes_the_larger() {
        let cfg = MigrationConfig::default();
        let first = cfg.initial_pause_deadline(0);
        let extended = cfg.failover_pause_deadline(0);
        let existing = first.max(extended);
        assert!(existing >= first);
        assert!(existing >= extended);
    }

    proptest::proptest! {
        /// Whatever tunables and clock reading a job was created under, the
        /// deadline the supervisor would actually hold to after a failover
        /// grant (the larger of the initial and extended deadlines) is
        /// never smaller than either input -- across arbitrary positive
        /// multipliers and timeouts, not just the defaults above.
        #[test]
        fn deadline_extension_never_shrinks_the_held_deadline(
            cluster_mf_timeout_ms in 1i64..1_000_000,
            cluster_mf_pause_mult in 1i64..10,
            cluster_operation_timeout_ms in 1i64..1_000_000,
            now in 0i64..1_000_000_000,
        ) {
            let cfg = MigrationConfig {
                cluster_mf_timeout_ms,
                cluster_mf_pause_mult,
                cluster_operation_timeout_ms,
                ..MigrationConfig::default()
            };
            let first = cfg.initial_pause_deadline(now);
            let extended = cfg.failover_pause_deadline(now);
            let held = first.max(extended);
            proptest::prop_assert!(held >= first);
            proptest::prop_assert!(held >= extended);
        }
    }
}
