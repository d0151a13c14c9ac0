//! Dry-run rebalancers: simulate a better rxq → pmd assignment in place.
//!
//! Both variants mutate the model only. A move detaches the rxq from its
//! owner, notes it in the port's `rxq_rebalanced` map, clones it (rings and
//! all) into the receiver, and mirrors the rxq's cycles on both pmds' stat
//! rings so the next load estimate already reflects the new assignment.

use std::collections::{BTreeMap, BTreeSet};

use itertools::Itertools;
use log::{debug, info};

use crate::error::{NcdError, Result};
use crate::load::{need_rebalance, update_pmd_load};
use crate::model::{CoreId, Model, NumaId, QueueId};

/// Returned when a dry-run is not applicable: fewer than two pmds, or no pmd
/// needs rebalance.
pub const NOT_APPLICABLE: i64 = -1;

fn move_rxq(
    model: &mut Model,
    owner: CoreId,
    receiver: CoreId,
    port_name: &str,
    queue_id: QueueId,
) -> Result<()> {
    let owner_numa = model
        .pmd(owner)
        .map(|p| p.numa_id)
        .ok_or_else(|| NcdError::Inconsistency(format!("pmd {} not in model", owner)))?;
    let receiver_numa = model
        .pmd(receiver)
        .map(|p| p.numa_id)
        .ok_or_else(|| NcdError::Inconsistency(format!("pmd {} not in model", receiver)))?;
    if owner_numa != receiver_numa {
        return Err(NcdError::Inconsistency(format!(
            "cross-numa move of rxq {} (port {}) from pmd {} to pmd {}",
            queue_id, port_name, owner, receiver
        )));
    }

    // Detach from the owner and note where the queue went.
    let (port_id, rxq) = {
        let pmd = model.pmd_mut(owner).expect("owner checked above");
        let port = pmd.find_port_by_name_mut(port_name).ok_or_else(|| {
            NcdError::Inconsistency(format!("port {} not in pmd {}", port_name, owner))
        })?;
        let rxq = port.del_rxq(queue_id)?;
        port.rxq_rebalanced.insert(queue_id, receiver);
        (port.id, rxq)
    };

    let samples = rxq.cpu_cyc.len();
    {
        let pmd = model.pmd_mut(owner).expect("owner checked above");
        for i in 0..samples {
            pmd.proc_cpu_cyc
                .set(i, pmd.proc_cpu_cyc.get(i) - rxq.cpu_cyc.get(i));
            pmd.idle_cpu_cyc
                .set(i, pmd.idle_cpu_cyc.get(i) + rxq.cpu_cyc.get(i));
            pmd.rx_cyc.set(i, pmd.rx_cyc.get(i) - rxq.rx_cyc.get(i));
        }
    }

    let pmd = model.pmd_mut(receiver).expect("receiver checked above");
    for i in 0..samples {
        pmd.proc_cpu_cyc
            .set(i, pmd.proc_cpu_cyc.get(i) + rxq.cpu_cyc.get(i));
        pmd.idle_cpu_cyc
            .set(i, pmd.idle_cpu_cyc.get(i) - rxq.cpu_cyc.get(i));
        pmd.rx_cyc.set(i, pmd.rx_cyc.get(i) + rxq.rx_cyc.get(i));
    }
    if pmd.find_port_by_name(port_name).is_none() {
        pmd.add_port(port_name, port_id)?;
    }
    let port = pmd
        .find_port_by_name_mut(port_name)
        .expect("placement was just ensured");
    let clone = port.add_rxq(queue_id)?;
    clone.cpu_cyc = rxq.cpu_cyc.clone();
    clone.rx_cyc = rxq.rx_cyc.clone();
    // The clone remembers the pmd it came from.
    clone.pmd = Some(owner);
    Ok(())
}

/// Traversal cursor for the cycle-ordered dry-run. Walks the pmd order and
/// snakes: when a sweep is spent and every pmd of the wanted numa has been
/// reached, the order reverses and the walk restarts from the near end.
struct SnakeCursor {
    order: Vec<CoreId>,
    numa_of: BTreeMap<CoreId, NumaId>,
    /// rxqs assigned per pmd so far, retained tops included.
    assigned: BTreeMap<CoreId, usize>,
    pmds_per_numa: BTreeMap<NumaId, usize>,
    pos: usize,
}

impl SnakeCursor {
    fn new(order: Vec<CoreId>, numa_of: BTreeMap<CoreId, NumaId>) -> Self {
        let mut pmds_per_numa: BTreeMap<NumaId, usize> = BTreeMap::new();
        for numa in numa_of.values() {
            *pmds_per_numa.entry(*numa).or_insert(0) += 1;
        }
        let assigned = order.iter().map(|c| (*c, 0)).collect();
        SnakeCursor {
            order,
            numa_of,
            assigned,
            pmds_per_numa,
            pos: 0,
        }
    }

    fn reached_in(&self, numa: NumaId) -> usize {
        self.assigned
            .iter()
            .filter(|(core, n)| self.numa_of[core] == numa && **n > 0)
            .count()
    }

    fn wrap(&mut self, numa: NumaId) {
        if self.reached_in(numa) < self.pmds_per_numa.get(&numa).copied().unwrap_or(0) {
            // Some pmd of this numa was never reached; sweep again in the
            // same direction before reversing.
            self.pos = 0;
        } else {
            self.order.reverse();
            self.pos = 0;
        }
    }

    /// Next pmd of this numa under the cursor. Slots scanned on the way are
    /// consumed.
    fn next_in_numa(&mut self, numa: NumaId) -> Result<CoreId> {
        let mut wraps = 0;
        loop {
            if self.pos >= self.order.len() {
                if wraps >= 2 {
                    return Err(NcdError::Inconsistency(format!(
                        "no rebalancing pmd on numa {}",
                        numa
                    )));
                }
                wraps += 1;
                self.wrap(numa);
            }
            let cand = self.order[self.pos];
            self.pos += 1;
            if self.numa_of[&cand] == numa {
                *self.assigned.get_mut(&cand).expect("cand is in order") += 1;
                return Ok(cand);
            }
        }
    }

    /// Advance the cursor onto the owner itself, consuming slots scanned on
    /// the way. Used for the busiest rxq of each pmd, which never moves.
    fn seek(&mut self, owner: CoreId) -> Result<CoreId> {
        let mut wraps = 0;
        loop {
            if self.pos >= self.order.len() {
                if wraps >= 2 {
                    return Err(NcdError::Inconsistency(format!(
                        "pmd {} unreachable in traversal order",
                        owner
                    )));
                }
                wraps += 1;
                self.pos = 0;
            }
            let cand = self.order[self.pos];
            self.pos += 1;
            if cand == owner {
                *self.assigned.get_mut(&cand).expect("owner is in order") += 1;
                return Ok(owner);
            }
        }
    }
}

/// One-shot redistribution of every rxq, busiest first, over a stable
/// topology-derived pmd order. `rr_order` is the platform's round-robin cpu
/// list (see [crate::cpu::rr_cpu_in_numa]).
///
/// The busiest rxq of each pmd stays put; every following rxq lands on the
/// next same-numa pmd of the snake walk, spreading adjacent-ranked rxqs onto
/// distinct pmds.
pub fn dryrun_by_cyc(model: &mut Model, rr_order: &[CoreId], threshold: f64) -> Result<i64> {
    if model.pmds.len() <= 1 {
        debug!("not enough pmds to rebalance ..");
        return Ok(NOT_APPLICABLE);
    }
    update_pmd_load(model);
    if !need_rebalance(model, threshold) {
        debug!("no pmd needs rebalance ..");
        return Ok(NOT_APPLICABLE);
    }

    let pmd_list: Vec<CoreId> = rr_order
        .iter()
        .copied()
        .filter(|core| model.pmds.contains_key(core))
        .collect();
    let numa_of: BTreeMap<CoreId, NumaId> = pmd_list
        .iter()
        .map(|core| (*core, model.pmds[core].numa_id))
        .collect();

    struct Ranked {
        owner: CoreId,
        port: String,
        queue_id: QueueId,
        numa: NumaId,
        cycles: i64,
    }
    let mut ranked: Vec<Ranked> = Vec::new();
    for core in &pmd_list {
        for port in model.pmds[core].port_map.values() {
            for rxq in port.rxq_map.values() {
                ranked.push(Ranked {
                    owner: *core,
                    port: port.name.clone(),
                    queue_id: rxq.id,
                    numa: port.numa_id,
                    cycles: rxq.cpu_cyc.total(),
                });
            }
        }
    }
    ranked.sort_by(|a, b| b.cycles.cmp(&a.cycles));

    // Owners of the busiest rxqs lead the traversal; pmds without any ranked
    // rxq close it.
    let mut order: Vec<CoreId> = Vec::new();
    for rxq in &ranked {
        if !order.contains(&rxq.owner) {
            order.push(rxq.owner);
        }
    }
    for core in &pmd_list {
        if !order.contains(core) {
            order.push(*core);
        }
    }

    debug!(
        "cpu numbering based on system info is {}",
        pmd_list.iter().join(",")
    );
    debug!(
        "traverse order on pmds based on rxqs is {}",
        order.iter().join(",")
    );

    let mut cursor = SnakeCursor::new(order, numa_of);
    let mut tops_taken: BTreeSet<CoreId> = BTreeSet::new();
    let mut moved = 0;

    for rxq in &ranked {
        let receiver = if tops_taken.insert(rxq.owner) {
            cursor.seek(rxq.owner)?
        } else {
            cursor.next_in_numa(rxq.numa)?
        };
        if receiver == rxq.owner {
            info!(
                "no change needed for rxq {} (port {}) in pmd {}",
                rxq.queue_id, rxq.port, rxq.owner
            );
            continue;
        }
        info!(
            "moving rxq {} (port {}) from pmd {} into pmd {} ..",
            rxq.queue_id, rxq.port, rxq.owner, receiver
        );
        move_rxq(model, rxq.owner, receiver, &rxq.port, rxq.queue_id)?;
        moved += 1;
    }

    if moved > 0 {
        update_pmd_load(model);
    }
    Ok(moved)
}

/// Idle-candidate cursor for the iterative dry-run: cycles through the
/// not-busy pmds, least loaded first, constrained to one numa per pick.
struct CandidateCursor {
    candidates: Vec<CoreId>,
    numa_of: BTreeMap<CoreId, NumaId>,
    pos: usize,
}

impl CandidateCursor {
    fn next_for_numa(&mut self, numa: NumaId) -> Option<CoreId> {
        let n = self.candidates.len();
        for step in 0..n {
            let idx = (self.pos + step) % n;
            let cand = self.candidates[idx];
            if self.numa_of[&cand] == numa {
                self.pos = (idx + 1) % n;
                return Some(cand);
            }
        }
        None
    }

    fn remove(&mut self, core: CoreId) {
        if let Some(idx) = self.candidates.iter().position(|c| *c == core) {
            self.candidates.remove(idx);
            if self.pos > idx {
                self.pos -= 1;
            }
            if !self.candidates.is_empty() {
                self.pos %= self.candidates.len();
            } else {
                self.pos = 0;
            }
        }
    }
}

fn rxq_share(cycles: i64, proc_total: i64) -> f64 {
    if proc_total == 0 {
        cycles as f64
    } else {
        cycles as f64 * 100.0 / proc_total as f64
    }
}

/// Incremental relief of overloaded pmds: hand the least-loaded rxq of each
/// busy pmd to the least-loaded pmd of the same numa, one queue per port,
/// re-estimating load after every move. Invoked repeatedly by the decision
/// loop until the estimate stops improving.
pub fn dryrun_by_iq(model: &mut Model, threshold: f64) -> Result<i64> {
    if model.pmds.len() <= 1 {
        debug!("not enough pmds to rebalance ..");
        return Ok(NOT_APPLICABLE);
    }
    update_pmd_load(model);
    if !need_rebalance(model, threshold) {
        debug!("no pmd needs rebalance ..");
        return Ok(NOT_APPLICABLE);
    }

    let mut by_load: Vec<CoreId> = model.pmds.keys().copied().collect();
    by_load.sort_by(|a, b| {
        model.pmds[a]
            .pmd_load
            .partial_cmp(&model.pmds[b].pmd_load)
            .expect("loads are finite")
    });

    let mut busy: Vec<CoreId> = Vec::new();
    let mut idle: Vec<CoreId> = Vec::new();
    for core in &by_load {
        let pmd = &model.pmds[core];
        if pmd.pmd_load > threshold {
            busy.push(*core);
        } else if pmd.count_rxq() == 1 && pmd.pmd_load >= threshold {
            // A lone already-saturating rxq: neither donor nor receiver.
        } else {
            idle.push(*core);
        }
    }

    let numa_of: BTreeMap<CoreId, NumaId> = model
        .pmds
        .values()
        .map(|pmd| (pmd.id, pmd.numa_id))
        .collect();
    let mut cursor = CandidateCursor {
        candidates: idle,
        numa_of,
        pos: 0,
    };
    let mut current: Option<CoreId> = None;
    let mut moved = 0;

    for busy_core in busy {
        // Relieve the port holding this pmd's least-loaded rxq first.
        let mut port_names: Vec<String> = model.pmds[&busy_core].port_map.keys().cloned().collect();
        port_names.sort_by(|a, b| {
            let pmd = &model.pmds[&busy_core];
            let proc_total = pmd.proc_cpu_cyc.total();
            let min_share = |name: &String| {
                pmd.port_map[name]
                    .rxq_map
                    .values()
                    .map(|r| rxq_share(r.cpu_cyc.total(), proc_total))
                    .fold(f64::INFINITY, f64::min)
            };
            min_share(a)
                .partial_cmp(&min_share(b))
                .expect("shares are finite")
        });

        for port_name in port_names {
            let (port_numa, port_empty, rxq_count) = {
                let pmd = &model.pmds[&busy_core];
                let port = &pmd.port_map[&port_name];
                (port.numa_id, port.rxq_map.is_empty(), pmd.count_rxq())
            };
            if port_empty {
                continue;
            }
            // Leave at least one rxq, or the busy pmd turns idle itself.
            if rxq_count <= 1 {
                continue;
            }

            if current.map_or(true, |core| model.pmds[&core].numa_id != port_numa) {
                current = cursor.next_for_numa(port_numa);
            }
            let receiver = match current {
                Some(core) => core,
                None => {
                    debug!("no rebalancing pmd on numa {} ..", port_numa);
                    continue;
                }
            };

            let queue_id = {
                let pmd = &model.pmds[&busy_core];
                let proc_total = pmd.proc_cpu_cyc.total();
                let mut rxqs: Vec<(f64, QueueId)> = pmd.port_map[&port_name]
                    .rxq_map
                    .values()
                    .map(|r| (rxq_share(r.cpu_cyc.total(), proc_total), r.id))
                    .collect();
                rxqs.sort_by(|a, b| a.0.partial_cmp(&b.0).expect("shares are finite"));
                rxqs.first()
                    .map(|(_, id)| *id)
                    .ok_or_else(|| NcdError::Inconsistency("rxq found empty ..".into()))?
            };

            info!(
                "moving rxq {} (port {}) from pmd {} into idle pmd {} ..",
                queue_id, port_name, busy_core, receiver
            );
            move_rxq(model, busy_core, receiver, &port_name, queue_id)?;
            moved += 1;

            update_pmd_load(model);
            if model.pmds[&receiver].pmd_load >= threshold {
                info!("removing pmd {} from idle pmd list", receiver);
                cursor.remove(receiver);
                current = None;
            }
        }
    }
    Ok(moved)
}
