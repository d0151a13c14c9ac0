//! Load estimation over the collected sample rings.

use crate::model::{Model, Pmd};

/// Population variance.
pub fn variance(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / values.len() as f64
}

/// Estimate how busy a pmd is, in [0, 100].
///
/// The rings hold cumulative counters sampled at unknown positions, so each
/// is sorted first and the growth over the window is the sum of adjacent
/// differences.
pub fn pmd_load(pmd: &Pmd) -> f64 {
    let rx_sum = pmd.rx_cyc.sorted_diff_sum();
    if rx_sum == 0 {
        // no activity without any packet.
        return 0.0;
    }

    let idle_sum = pmd.idle_cpu_cyc.sorted_diff_sum();
    let proc_sum = pmd.proc_cpu_cyc.sorted_diff_sum();

    let cpp = (idle_sum + proc_sum) as f64 / rx_sum as f64;
    let load = if cpp == 0.0 {
        // A pmd without any rxq configured: the dry-run adds processing and
        // removes idle cycles when assigning rxqs virtually, so their sum can
        // be null. Declare it busy while the dry-run is in flight.
        100.0
    } else {
        let pcpp = proc_sum as f64 / rx_sum as f64;
        (pcpp * 100.0) / cpp
    };
    load.max(0.0).min(100.0)
}

/// Refresh the load estimate of every pmd in the model.
pub fn update_pmd_load(model: &mut Model) {
    let loads: Vec<(u32, f64)> = model
        .pmds
        .values()
        .map(|pmd| (pmd.id, pmd_load(pmd)))
        .collect();
    for (id, load) in loads {
        if let Some(pmd) = model.pmd_mut(id) {
            pmd.pmd_load = load;
        }
    }
}

/// Variance of the current per-pmd loads.
pub fn load_variance(model: &Model) -> f64 {
    let loads: Vec<f64> = model.pmds.values().map(|p| p.pmd_load).collect();
    variance(&loads)
}

/// A rebalance is worth trying when at least one pmd sits at or above the
/// threshold with more than one rxq to give away, and at least one does not.
pub fn need_rebalance(model: &Model, threshold: f64) -> bool {
    let loaded = model
        .pmds
        .values()
        .filter(|pmd| pmd.pmd_load >= threshold && pmd.count_rxq() > 1)
        .count();
    loaded > 0 && loaded < model.pmds.len()
}
