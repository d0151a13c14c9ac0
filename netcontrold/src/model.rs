//! In-memory view of the switch datapath: pmds, ports and their rx queues.
//!
//! Cyclic references from the switch's world (rxq ↔ port ↔ pmd) become plain
//! ids here: queues live in a per-port map keyed by queue id, port placements
//! live in a per-pmd map keyed by name, and parents are resolved through the
//! model rather than through pointers.
//!
//! Per-port counter history must survive a queue being re-pinned to another
//! pmd, so it is split off the placement: [`PortStats`] (one per port name,
//! held by the model) carries the sample rings, while [`Port`] (one per pmd
//! holding any of that port's queues) carries the queue maps.

use std::collections::BTreeMap;
use std::fmt;

use crate::error::{NcdError, Result};
use crate::ring::CounterRing;

pub type CoreId = u32;
pub type NumaId = u32;
pub type QueueId = u32;
pub type PortId = u32;

/// One receive queue of a port, pinned to exactly one pmd at a time.
#[derive(Debug, Clone)]
pub struct Rxq {
    pub id: QueueId,
    /// Name of the port this queue belongs to.
    pub port: String,
    /// Pmd this queue is pinned to. On a dry-run clone this keeps the donor
    /// pmd, recording where the queue came from.
    pub pmd: Option<CoreId>,
    /// Simulated processing cycles attributed to this queue per sample.
    pub cpu_cyc: CounterRing,
    /// Simulated packets attributed to this queue per sample.
    pub rx_cyc: CounterRing,
}

impl Rxq {
    fn new(id: QueueId, port: &str, samples: usize) -> Self {
        Rxq {
            id,
            port: port.to_string(),
            pmd: None,
            cpu_cyc: CounterRing::new(samples),
            rx_cyc: CounterRing::new(samples),
        }
    }
}

/// A port placement on one pmd: the queues of this port the pmd polls.
#[derive(Debug, Clone)]
pub struct Port {
    pub name: String,
    /// Switch-assigned port id, refreshed on every sample.
    pub id: Option<PortId>,
    pub numa_id: NumaId,
    pub rxq_map: BTreeMap<QueueId, Rxq>,
    /// Queues the dry-run moved away from here, and the pmd they went to.
    /// A queue id is either in `rxq_map` or in here, never both.
    pub rxq_rebalanced: BTreeMap<QueueId, CoreId>,
    samples: usize,
}

impl Port {
    fn new(name: &str, id: Option<PortId>, numa_id: NumaId, samples: usize) -> Result<Self> {
        if name.is_empty() {
            return Err(NcdError::ObjCreate("port name can not be empty".into()));
        }
        Ok(Port {
            name: name.to_string(),
            id,
            numa_id,
            rxq_map: BTreeMap::new(),
            rxq_rebalanced: BTreeMap::new(),
            samples,
        })
    }

    pub fn find_rxq_by_id(&self, id: QueueId) -> Option<&Rxq> {
        self.rxq_map.get(&id)
    }

    pub fn find_rxq_by_id_mut(&mut self, id: QueueId) -> Option<&mut Rxq> {
        self.rxq_map.get_mut(&id)
    }

    /// Add a new rxq of this id.
    pub fn add_rxq(&mut self, id: QueueId) -> Result<&mut Rxq> {
        if self.rxq_map.contains_key(&id) {
            return Err(NcdError::Inconsistency(format!(
                "rxq {} already exists in {}",
                id, self.name
            )));
        }
        let rxq = Rxq::new(id, &self.name, self.samples);
        Ok(self.rxq_map.entry(id).or_insert(rxq))
    }

    /// Remove the rxq of this id, returning it.
    pub fn del_rxq(&mut self, id: QueueId) -> Result<Rxq> {
        self.rxq_map
            .remove(&id)
            .ok_or_else(|| NcdError::Inconsistency(format!("rxq {} not found", id)))
    }
}

impl PartialEq for Port {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.numa_id == other.numa_id
            && self.rxq_rebalanced == other.rxq_rebalanced
            && self.rxq_map.keys().eq(other.rxq_map.keys())
    }
}

/// Placement-independent state of a port: its stat rings and flags. Survives
/// the port's queues moving between pmds.
#[derive(Debug, Clone)]
pub struct PortStats {
    pub name: String,
    pub id: Option<PortId>,
    pub port_type: Option<String>,
    pub rx_cyc: CounterRing,
    pub rx_drop_cyc: CounterRing,
    pub tx_cyc: CounterRing,
    pub tx_drop_cyc: CounterRing,
    pub tx_retry_cyc: CounterRing,
    /// Set once the rxq collector has seen this port; shutdown clears the
    /// affinity of every flagged port.
    pub rebalance: bool,
}

impl PortStats {
    fn new(name: &str, samples: usize) -> Self {
        PortStats {
            name: name.to_string(),
            id: None,
            port_type: None,
            rx_cyc: CounterRing::new(samples),
            rx_drop_cyc: CounterRing::new(samples),
            tx_cyc: CounterRing::new(samples),
            tx_drop_cyc: CounterRing::new(samples),
            tx_retry_cyc: CounterRing::new(samples),
            rebalance: false,
        }
    }

    /// All five rings advance in lockstep, once per sample tick.
    pub fn advance_sample(&mut self) {
        self.rx_cyc.advance();
        self.rx_drop_cyc.advance();
        self.tx_cyc.advance();
        self.tx_drop_cyc.advance();
        self.tx_retry_cyc.advance();
    }

    pub fn cyc_idx(&self) -> usize {
        self.rx_cyc.cursor()
    }
}

impl fmt::Display for PortStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "port {}", self.name)?;
        writeln!(f, "port {} cyc_idx {}", self.name, self.cyc_idx())?;
        for i in 0..self.rx_cyc.len() {
            writeln!(
                f,
                "port {} rx_cyc[{}] {} rx_drop_cyc[{}] {}",
                self.name,
                i,
                self.rx_cyc.get(i),
                i,
                self.rx_drop_cyc.get(i)
            )?;
        }
        for i in 0..self.tx_cyc.len() {
            writeln!(
                f,
                "port {} tx_cyc[{}] {} tx_drop_cyc[{}] {}",
                self.name,
                i,
                self.tx_cyc.get(i),
                i,
                self.tx_drop_cyc.get(i)
            )?;
        }
        for i in 0..self.tx_retry_cyc.len() {
            writeln!(f, "port {} tx_retry_cyc[{}] {}", self.name, i, self.tx_retry_cyc.get(i))?;
        }
        Ok(())
    }
}

/// One polling thread, identified by the cpu core it is pinned to.
#[derive(Debug, Clone)]
pub struct Pmd {
    pub id: CoreId,
    pub numa_id: NumaId,
    /// Packets received per sample.
    pub rx_cyc: CounterRing,
    pub idle_cpu_cyc: CounterRing,
    pub proc_cpu_cyc: CounterRing,
    /// The switch's own balancer leaves this pmd alone.
    pub isolated: bool,
    /// Load estimate in [0, 100], refreshed by the estimator.
    pub pmd_load: f64,
    pub port_map: BTreeMap<String, Port>,
    samples: usize,
}

impl Pmd {
    pub fn new(id: CoreId, numa_id: NumaId, samples: usize) -> Self {
        Pmd {
            id,
            numa_id,
            rx_cyc: CounterRing::new(samples),
            idle_cpu_cyc: CounterRing::new(samples),
            proc_cpu_cyc: CounterRing::new(samples),
            isolated: false,
            pmd_load: 0.0,
            port_map: BTreeMap::new(),
            samples,
        }
    }

    /// The three stat rings advance in lockstep, once per sample tick.
    pub fn advance_sample(&mut self) {
        self.rx_cyc.advance();
        self.idle_cpu_cyc.advance();
        self.proc_cpu_cyc.advance();
    }

    pub fn cyc_idx(&self) -> usize {
        self.rx_cyc.cursor()
    }

    pub fn find_port_by_name(&self, name: &str) -> Option<&Port> {
        self.port_map.get(name)
    }

    pub fn find_port_by_name_mut(&mut self, name: &str) -> Option<&mut Port> {
        self.port_map.get_mut(name)
    }

    pub fn find_port_by_id(&self, id: PortId) -> Option<&Port> {
        self.port_map.values().find(|p| p.id == Some(id))
    }

    /// Add a placement for this port name. The placement inherits the pmd's
    /// numa, keeping every contained port local to this pmd.
    pub fn add_port(&mut self, name: &str, id: Option<PortId>) -> Result<&mut Port> {
        if self.port_map.contains_key(name) {
            return Err(NcdError::Inconsistency(format!(
                "port {} already exists in pmd {}",
                name, self.id
            )));
        }
        let port = Port::new(name, id, self.numa_id, self.samples)?;
        Ok(self.port_map.entry(name.to_string()).or_insert(port))
    }

    pub fn del_port(&mut self, name: &str) -> Result<Port> {
        self.port_map
            .remove(name)
            .ok_or_else(|| NcdError::Inconsistency(format!("port {} not found", name)))
    }

    /// Number of rxqs, over all ports, pinned to this pmd.
    pub fn count_rxq(&self) -> usize {
        self.port_map.values().map(|p| p.rxq_map.len()).sum()
    }
}

impl PartialEq for Pmd {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.numa_id == other.numa_id
            && self.rx_cyc.same_samples(&other.rx_cyc)
            && self.idle_cpu_cyc.same_samples(&other.idle_cpu_cyc)
            && self.proc_cpu_cyc.same_samples(&other.proc_cpu_cyc)
            && self.isolated == other.isolated
            && self.pmd_load == other.pmd_load
            && self.port_map == other.port_map
    }
}

impl fmt::Display for Pmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "pmd {}", self.id)?;
        writeln!(f, "pmd {} numa_id {}", self.id, self.numa_id)?;
        for i in 0..self.rx_cyc.len() {
            writeln!(f, "pmd {} rx_cyc[{}] {}", self.id, i, self.rx_cyc.get(i))?;
        }
        for i in 0..self.idle_cpu_cyc.len() {
            writeln!(f, "pmd {} idle_cpu_cyc[{}] {}", self.id, i, self.idle_cpu_cyc.get(i))?;
        }
        for i in 0..self.proc_cpu_cyc.len() {
            writeln!(f, "pmd {} proc_cpu_cyc[{}] {}", self.id, i, self.proc_cpu_cyc.get(i))?;
        }
        writeln!(f, "pmd {} cyc_idx {}", self.id, self.cyc_idx())?;
        writeln!(f, "pmd {} isolated {}", self.id, self.isolated)?;
        writeln!(f, "pmd {} pmd_load {}", self.id, self.pmd_load.round() as i64)?;
        for (port_name, port) in &self.port_map {
            writeln!(f, "  port {}", port_name)?;
            writeln!(f, "  port {} numa_id {}", port_name, port.numa_id)?;
            for (rxq_id, rxq) in &port.rxq_map {
                writeln!(f, "    rxq {}", rxq_id)?;
                for i in 0..rxq.cpu_cyc.len() {
                    writeln!(f, "    rxq {} rx_cyc[{}] {}", rxq_id, i, rxq.rx_cyc.get(i))?;
                    writeln!(f, "    rxq {} cpu_cyc[{}] {}", rxq_id, i, rxq.cpu_cyc.get(i))?;
                }
            }
        }
        Ok(())
    }
}

/// The whole collected state: every pmd, every port's stat history, and the
/// switch's current name → id mapping.
#[derive(Debug, Clone)]
pub struct Model {
    samples_max: usize,
    pub pmds: BTreeMap<CoreId, Pmd>,
    pub port_stats: BTreeMap<String, PortStats>,
    pub port_ids: BTreeMap<String, PortId>,
}

impl Model {
    pub fn new(samples_max: usize) -> Self {
        Model {
            samples_max,
            pmds: BTreeMap::new(),
            port_stats: BTreeMap::new(),
            port_ids: BTreeMap::new(),
        }
    }

    pub fn samples_max(&self) -> usize {
        self.samples_max
    }

    pub fn add_pmd(&mut self, id: CoreId, numa_id: NumaId) -> &mut Pmd {
        let samples = self.samples_max;
        self.pmds
            .entry(id)
            .or_insert_with(|| Pmd::new(id, numa_id, samples))
    }

    pub fn pmd(&self, id: CoreId) -> Option<&Pmd> {
        self.pmds.get(&id)
    }

    pub fn pmd_mut(&mut self, id: CoreId) -> Option<&mut Pmd> {
        self.pmds.get_mut(&id)
    }

    /// Per-name stat record, created zero-filled on first sight of the port.
    pub fn port_stats_entry(&mut self, name: &str) -> &mut PortStats {
        let samples = self.samples_max;
        self.port_stats
            .entry(name.to_string())
            .or_insert_with(|| PortStats::new(name, samples))
    }

    /// Forget everything collected; the next sample window starts cold.
    pub fn clear(&mut self) {
        self.pmds.clear();
        self.port_stats.clear();
        self.port_ids.clear();
    }

    /// Current (port, queue) → pmd pinning, as the model sees it.
    pub fn rxq_pinning(&self) -> BTreeMap<(String, QueueId), CoreId> {
        let mut pinning = BTreeMap::new();
        for (core, pmd) in &self.pmds {
            for port in pmd.port_map.values() {
                for qid in port.rxq_map.keys() {
                    pinning.insert((port.name.clone(), *qid), *core);
                }
            }
        }
        pinning
    }
}

impl fmt::Display for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for pmd in self.pmds.values() {
            write!(f, "{}", pmd)?;
        }
        for stats in self.port_stats.values() {
            write!(f, "{}", stats)?;
        }
        Ok(())
    }
}
