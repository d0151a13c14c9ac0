//! Daemon tunables and switch command lines.
use std::path::PathBuf;

pub const DEFAULT_SAMPLES_MAX: usize = 6;
pub const DEFAULT_PMD_CORE_THRESHOLD: f64 = 95.0;
pub const DEFAULT_LOAD_IMPROVE_MIN: f64 = 25.0;
pub const DEFAULT_VSW_WAIT_MIN: u64 = 0;
pub const DEFAULT_CB_PKTDROP_MIN: i64 = 10_000;
pub const DEFAULT_LOG_MAX_KB: u64 = 1024;
pub const DEFAULT_LOG_MAX_BACKUP_N: u32 = 1;

/// Runtime configuration, resolved once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Samples kept per counter ring. Larger means a better dry-run estimate
    /// and a longer time to reach a rebalance conclusion.
    pub samples_max: usize,
    /// Per-core load percentage above which a pmd is considered for rebalance.
    pub pmd_core_threshold: f64,
    /// Minimum variance improvement (percent) a dry-run must show before its
    /// assignment is committed.
    pub load_improve_min: f64,
    /// Seconds to let the switch settle after a commit.
    pub vsw_wait_min: u64,
    /// Packet drop threshold (ppm) that triggers the trace callback.
    pub cb_pktdrop_min: i64,
    pub log_file: PathBuf,
    pub log_max_kb: u64,
    pub log_max_backup_n: u32,
    pub socket_path: PathBuf,
    pub pid_file: PathBuf,
    /// Switch introspection command (ovs-appctl).
    pub sw_ctl: String,
    /// Switch configuration command (ovs-vsctl).
    pub sw_vsctl: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            samples_max: DEFAULT_SAMPLES_MAX,
            pmd_core_threshold: DEFAULT_PMD_CORE_THRESHOLD,
            load_improve_min: DEFAULT_LOAD_IMPROVE_MIN,
            vsw_wait_min: DEFAULT_VSW_WAIT_MIN,
            cb_pktdrop_min: DEFAULT_CB_PKTDROP_MIN,
            log_file: PathBuf::from("/var/log/netcontrold/ncd.log"),
            log_max_kb: DEFAULT_LOG_MAX_KB,
            log_max_backup_n: DEFAULT_LOG_MAX_BACKUP_N,
            socket_path: PathBuf::from("/var/run/netcontrold/ncd_ctrld.sock"),
            pid_file: PathBuf::from("/var/run/netcontrold/ncd.pid"),
            sw_ctl: "ovs-appctl".into(),
            sw_vsctl: "ovs-vsctl".into(),
        }
    }
}

impl Config {
    pub fn port_stats_cmd(&self) -> String {
        format!("{} dpctl/show -s", self.sw_ctl)
    }

    pub fn iface_stats_cmd(&self) -> String {
        format!("{} list interface", self.sw_vsctl)
    }

    pub fn pmd_stats_cmd(&self) -> String {
        format!("{} dpif-netdev/pmd-stats-show", self.sw_ctl)
    }

    pub fn pmd_rxq_cmd(&self) -> String {
        format!("{} dpif-netdev/pmd-rxq-show", self.sw_ctl)
    }

    pub fn switch_version_cmd(&self) -> String {
        format!("{} -V", self.sw_vsctl)
    }
}
