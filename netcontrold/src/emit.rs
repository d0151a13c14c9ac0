//! Render the model's proposed assignment as switch configuration, and the
//! per-port drop statistics the tracer watches.

use std::collections::{BTreeMap, BTreeSet};

use log::info;

use crate::collect::parse_port_stats;
use crate::config::Config;
use crate::error::Result;
use crate::event::EventLog;
use crate::model::{CoreId, Model, NumaId, PortStats};
use crate::shell::Shell;

/// Pick the pmds that stay non-isolated: the first (lowest core id) pmd of
/// every numa the model observed. Their ports keep no explicit affinity so
/// the switch has somewhere to land rxqs arriving later.
fn non_isolated_pmds(model: &Model) -> Vec<CoreId> {
    let mut seen: BTreeSet<NumaId> = BTreeSet::new();
    let mut picked = Vec::new();
    for pmd in model.pmds.values() {
        if seen.insert(pmd.numa_id) {
            picked.push(pmd.id);
        }
    }
    picked
}

/// Render the committed assignment as one switch-configuration command.
///
/// Port ids are refreshed from the switch first; a port the model believes
/// exists but is no longer reported is skipped with a "skip" event rather
/// than failing the commit.
pub fn rebalance_switch_cmd(
    model: &mut Model,
    shell: &dyn Shell,
    cfg: &Config,
    events: &EventLog,
) -> Result<String> {
    let non_isolated = non_isolated_pmds(model);

    let mut port_to_pmdq: BTreeMap<String, String> = BTreeMap::new();
    for (core, pmd) in &model.pmds {
        if non_isolated.contains(core) {
            continue;
        }
        for port in pmd.port_map.values() {
            if port.rxq_map.is_empty() {
                continue;
            }
            let pairs = port_to_pmdq.entry(port.name.clone()).or_default();
            for queue_id in port.rxq_map.keys() {
                pairs.push_str(&format!("{}:{},", queue_id, core));
            }
        }
    }

    // Refresh the name → id mapping; the switch may have dropped ports since
    // the window was sampled.
    model.port_ids.clear();
    let data = shell.exec(&cfg.port_stats_cmd())?;
    parse_port_stats(model, &data)?;

    let mut cmd = String::new();
    for (port_name, pairs) in &port_to_pmdq {
        if !model.port_ids.contains_key(port_name) {
            info!("not setting affinity for an unavailable port {}", port_name);
            events.append(port_name, "skip");
            continue;
        }
        cmd.push_str(&format!(
            "-- set Interface {} other_config:pmd-rxq-affinity={} ",
            port_name, pairs
        ));
    }

    // Ports still held by a non-isolated pmd get their previous affinity
    // removed instead.
    for core in &non_isolated {
        for port_name in model.pmds[core].port_map.keys() {
            if !model.port_ids.contains_key(port_name) {
                info!("not resetting affinity for unavailable port {}", port_name);
                events.append(port_name, "skip");
                continue;
            }
            if !port_to_pmdq.contains_key(port_name) {
                cmd.push_str(&format!(
                    "-- remove Interface {} other_config pmd-rxq-affinity ",
                    port_name
                ));
            }
        }
    }

    Ok(format!("{} --no-wait {}", cfg.sw_vsctl, cmd))
}

/// Command clearing the affinity of every port the daemon rebalanced, run on
/// shutdown. None when no port was touched.
pub fn clear_affinity_cmd(model: &Model, cfg: &Config) -> Option<String> {
    let mut cmd = String::new();
    for (name, stats) in &model.port_stats {
        if !stats.rebalance {
            continue;
        }
        cmd.push_str(&format!(
            "-- remove Interface {} other_config pmd-rxq-affinity ",
            name
        ));
    }
    if cmd.is_empty() {
        None
    } else {
        Some(format!("{} --no-wait {}", cfg.sw_vsctl, cmd))
    }
}

/// Packet drop rate of a port over the sample window, in parts per million,
/// for rx and tx.
pub fn port_drop_ppm(stats: &PortStats) -> (i64, i64) {
    let rx = stats.rx_cyc.sorted_diff_sum();
    let rx_drop = stats.rx_drop_cyc.sorted_diff_sum();
    let tx = stats.tx_cyc.sorted_diff_sum();
    let tx_drop = stats.tx_drop_cyc.sorted_diff_sum();

    let rx_ppm = if rx != 0 { 1_000_000 * rx_drop / rx } else { 0 };
    let tx_ppm = if tx != 0 { 1_000_000 * tx_drop / tx } else { 0 };
    (rx_ppm, tx_ppm)
}

/// Transmit retries of a port over the sample window.
pub fn port_tx_retry(stats: &PortStats) -> i64 {
    stats.tx_retry_cyc.sorted_diff_sum()
}
