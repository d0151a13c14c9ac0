//! Collectors: turn the switch's textual reports into model updates.
//!
//! Each report is parsed line by line into a typed record first, then the
//! record drives the model. Keeping the classifiers separate from the model
//! walk lets a structured switch interface replace them without touching the
//! collection logic.

use log::debug;

use crate::config::Config;
use crate::error::{NcdError, Result};
use crate::model::{CoreId, Model, NumaId, PortId, QueueId};
use crate::shell::Shell;

/// Lines of the `pmd-stats-show` and `pmd-rxq-show` reports.
#[derive(Debug, PartialEq)]
enum PmdLine<'a> {
    /// `pmd thread numa_id N core_id C:`
    PmdHeader { numa_id: NumaId, core_id: CoreId },
    /// `main thread:` ends the per-pmd blocks.
    MainHeader,
    /// `  isolated : true`
    Isolated(bool),
    /// `  port: p1  queue-id: 0  pmd usage: 10 %`; usage is None for `NOT AVAIL`.
    Rxq {
        port: &'a str,
        queue_id: QueueId,
        usage: Option<i64>,
    },
    /// `  packets received: 1000` and friends; only integer-valued lines.
    Stat { name: &'a str, value: i64 },
    Other,
}

fn classify_pmd_line(line: &str) -> Result<PmdLine<'_>> {
    let trimmed = line.trim_start();
    if trimmed.starts_with("pmd thread ") {
        let mut numa_id = None;
        let mut core_id = None;
        let mut tokens = trimmed.split_whitespace();
        while let Some(tok) = tokens.next() {
            match tok {
                "numa_id" => numa_id = tokens.next().and_then(|v| v.parse().ok()),
                "core_id" => {
                    core_id = tokens
                        .next()
                        .and_then(|v| v.trim_end_matches(':').parse().ok())
                }
                _ => {}
            }
        }
        return match (numa_id, core_id) {
            (Some(numa_id), Some(core_id)) => Ok(PmdLine::PmdHeader { numa_id, core_id }),
            _ => Err(NcdError::Parse(format!("bad pmd thread line: {}", line))),
        };
    }
    if trimmed.starts_with("main thread") {
        return Ok(PmdLine::MainHeader);
    }
    if trimmed.starts_with("port:") {
        let mut port = None;
        let mut queue_id = None;
        let mut usage = None;
        let mut not_avail = false;
        let mut tokens = trimmed.split_whitespace().peekable();
        while let Some(tok) = tokens.next() {
            match tok {
                "port:" => port = tokens.next(),
                "queue-id:" => queue_id = tokens.next().and_then(|v| v.parse().ok()),
                "usage:" => match tokens.peek() {
                    Some(&"NOT") => not_avail = true,
                    Some(v) => usage = v.trim_end_matches('%').parse().ok(),
                    None => {}
                },
                _ => {}
            }
        }
        return match (port, queue_id) {
            (Some(port), Some(queue_id)) if not_avail || usage.is_some() => Ok(PmdLine::Rxq {
                port,
                queue_id,
                usage,
            }),
            _ => Err(NcdError::Parse(format!("bad rxq line: {}", line))),
        };
    }
    if trimmed.starts_with("isolated") {
        let value = trimmed.splitn(2, ':').nth(1).map(str::trim);
        return match value {
            Some("true") => Ok(PmdLine::Isolated(true)),
            Some("false") => Ok(PmdLine::Isolated(false)),
            _ => Err(NcdError::Parse(format!("bad isolated line: {}", line))),
        };
    }
    let mut split = trimmed.splitn(2, ':');
    if let (Some(name), Some(rest)) = (split.next(), split.next()) {
        if let Some(value) = rest.split_whitespace().next().and_then(|v| v.parse().ok()) {
            return Ok(PmdLine::Stat {
                name: name.trim_end(),
                value,
            });
        }
    }
    Ok(PmdLine::Other)
}

/// Lines of the `dpctl/show -s` report.
#[derive(Debug, PartialEq)]
enum PortLine<'a> {
    /// `  port 1: port1 (tap)`
    Port { id: PortId, name: &'a str },
    /// `    RX packets:5 errors:0 dropped:2 ...`
    RxStats { packets: i64, dropped: i64 },
    /// `    TX packets:5 errors:0 dropped:3 ...`
    TxStats { packets: i64, dropped: i64 },
    Other,
}

fn stat_field(token: &str, key: &str) -> Option<i64> {
    let mut split = token.splitn(2, ':');
    if split.next() != Some(key) {
        return None;
    }
    split.next().and_then(|v| v.parse().ok())
}

fn classify_port_line(line: &str) -> Result<PortLine<'_>> {
    let trimmed = line.trim_start();
    if trimmed.starts_with("port ") && trimmed.contains(':') {
        let mut split = trimmed["port ".len()..].splitn(2, ':');
        let id = split.next().and_then(|v| v.trim().parse().ok());
        let name = split.next().and_then(|v| v.split_whitespace().next());
        return match (id, name) {
            (Some(id), Some(name)) => Ok(PortLine::Port { id, name }),
            _ => Err(NcdError::Parse(format!("bad port line: {}", line))),
        };
    }
    for (prefix, rx) in &[("RX packets:", true), ("TX packets:", false)] {
        if !trimmed.starts_with(prefix) {
            continue;
        }
        let mut packets = None;
        let mut dropped = None;
        // First token pair is "RX packets:N"; skip the direction word.
        for token in trimmed["RX ".len()..].split_whitespace() {
            packets = packets.or_else(|| stat_field(token, "packets"));
            dropped = dropped.or_else(|| stat_field(token, "dropped"));
        }
        return match (packets, dropped) {
            (Some(packets), Some(dropped)) if *rx => Ok(PortLine::RxStats { packets, dropped }),
            (Some(packets), Some(dropped)) => Ok(PortLine::TxStats { packets, dropped }),
            _ => Err(NcdError::Parse(format!("bad port stats line: {}", line))),
        };
    }
    Ok(PortLine::Other)
}

/// Lines of the `list interface` report.
#[derive(Debug, PartialEq)]
enum IfaceLine<'a> {
    Name(&'a str),
    Type(&'a str),
    /// The `k=v, ...` body of the statistics map.
    Statistics(&'a str),
    Other,
}

fn classify_iface_line(line: &str) -> IfaceLine<'_> {
    let mut split = line.splitn(2, ':');
    let key = match split.next() {
        Some(k) => k.trim(),
        None => return IfaceLine::Other,
    };
    let value = match split.next() {
        Some(v) => v.trim(),
        None => return IfaceLine::Other,
    };
    match key {
        "name" => IfaceLine::Name(value.trim_matches('"')),
        "type" => IfaceLine::Type(value),
        "statistics" => {
            IfaceLine::Statistics(value.trim_start_matches('{').trim_end_matches('}'))
        }
        _ => IfaceLine::Other,
    }
}

fn statistics_value(body: &str, key: &str) -> Option<i64> {
    for item in body.split(", ") {
        let mut split = item.splitn(2, '=');
        let k = split.next()?.trim().trim_matches('"');
        if k == key {
            return split.next().and_then(|v| v.trim().parse().ok());
        }
    }
    None
}

/// Populate per-port packet and drop counters from `dpctl/show -s` output,
/// advancing each known port's sample cursor. New ports get a zero-filled
/// history; a changed port set invalidates the window.
pub fn parse_port_stats(model: &mut Model, data: &str) -> Result<()> {
    let cur: Vec<String> = model.port_stats.keys().cloned().collect();
    let mut current: Option<String> = None;

    for line in data.lines() {
        match classify_port_line(line)? {
            PortLine::Port { id, name } => {
                model.port_ids.insert(name.to_string(), id);
                let known = model.port_stats.contains_key(name);
                let stats = model.port_stats_entry(name);
                stats.id = Some(id);
                if known {
                    stats.advance_sample();
                    debug!("port {} in iteration {}", name, stats.cyc_idx());
                } else {
                    debug!("added port {} stats ..", name);
                }
                current = Some(name.to_string());
            }
            PortLine::RxStats { packets, dropped } => {
                if let Some(stats) = current.as_ref().and_then(|n| model.port_stats.get_mut(n)) {
                    stats.rx_cyc.set_latest(packets);
                    stats.rx_drop_cyc.set_latest(dropped);
                }
            }
            PortLine::TxStats { packets, dropped } => {
                if let Some(stats) = current.as_ref().and_then(|n| model.port_stats.get_mut(n)) {
                    stats.tx_cyc.set_latest(packets);
                    stats.tx_drop_cyc.set_latest(dropped);
                }
            }
            PortLine::Other => {}
        }
    }

    let new: Vec<String> = model.port_stats.keys().cloned().collect();
    if !cur.is_empty() && cur != new {
        return Err(NcdError::ModelChanged("ports count differ".into()));
    }
    Ok(())
}

/// Pick up port type and tx retry counters from `list interface` output.
/// Ports unknown to the model are skipped.
pub fn parse_interface_stats(model: &mut Model, data: &str) -> Result<()> {
    let mut current: Option<String> = None;

    for line in data.lines() {
        match classify_iface_line(line) {
            IfaceLine::Name(name) => {
                current = if model.port_stats.contains_key(name) {
                    debug!("port {} interface details ..", name);
                    Some(name.to_string())
                } else {
                    None
                };
            }
            IfaceLine::Statistics(body) => {
                if let Some(stats) = current.as_ref().and_then(|n| model.port_stats.get_mut(n)) {
                    if let Some(retries) = statistics_value(body, "tx_retries") {
                        stats.tx_retry_cyc.set_latest(retries);
                    }
                }
            }
            IfaceLine::Type(port_type) => {
                // type is the last keyed line we care about in a block.
                if let Some(name) = current.take() {
                    if let Some(stats) = model.port_stats.get_mut(&name) {
                        stats.port_type = Some(port_type.to_string());
                    }
                }
            }
            IfaceLine::Other => {}
        }
    }
    Ok(())
}

/// Populate per-pmd counters from `pmd-stats-show` output, advancing each
/// known pmd's sample cursor. A pmd seen for the first time creates a model
/// entry; a pmd whose numa moved, or a changed pmd set, fails the window.
pub fn parse_pmd_stats(model: &mut Model, data: &str) -> Result<()> {
    let cur: Vec<CoreId> = model.pmds.keys().copied().collect();
    let mut current: Option<CoreId> = None;

    for line in data.lines() {
        match classify_pmd_line(line)? {
            PmdLine::PmdHeader { numa_id, core_id } => {
                if let Some(pmd) = model.pmds.get_mut(&core_id) {
                    if pmd.numa_id != numa_id {
                        return Err(NcdError::Inconsistency(format!(
                            "pmd {} numa moved from {} to {}",
                            core_id, pmd.numa_id, numa_id
                        )));
                    }
                    pmd.advance_sample();
                    debug!("pmd {} in iteration {}", core_id, pmd.cyc_idx());
                } else {
                    if !model.pmds.is_empty() && current.is_none() {
                        return Err(NcdError::Inconsistency(format!(
                            "trying to add new pmd {} in mid of sampling",
                            core_id
                        )));
                    }
                    model.add_pmd(core_id, numa_id);
                    debug!("added pmd {} stats ..", core_id);
                }
                current = Some(core_id);
            }
            PmdLine::MainHeader => break,
            PmdLine::Stat { name, value } => {
                if let Some(pmd) = current.and_then(|c| model.pmds.get_mut(&c)) {
                    match name {
                        "packets received" => pmd.rx_cyc.set_latest(value),
                        "idle cycles" => pmd.idle_cpu_cyc.set_latest(value),
                        "processing cycles" => pmd.proc_cpu_cyc.set_latest(value),
                        _ => {}
                    }
                }
            }
            _ => {}
        }
    }

    let new: Vec<CoreId> = model.pmds.keys().copied().collect();
    if !cur.is_empty() && cur != new {
        return Err(NcdError::ModelChanged("pmds count differ".into()));
    }
    Ok(())
}

/// Read the rxq → pmd pinning from `pmd-rxq-show` output and attribute
/// simulated cycles to each rxq from its share of the owning pmd's last
/// sample delta.
pub fn parse_pmd_rxqs(model: &mut Model, data: &str) -> Result<()> {
    let mut current: Option<CoreId> = None;

    for line in data.lines() {
        match classify_pmd_line(line)? {
            PmdLine::PmdHeader { numa_id, core_id } => {
                let pmd = model.pmds.get_mut(&core_id).ok_or_else(|| {
                    NcdError::Inconsistency(format!(
                        "trying to add new pmd {} in mid of sampling",
                        core_id
                    ))
                })?;
                if pmd.numa_id != numa_id {
                    return Err(NcdError::Inconsistency(format!(
                        "pmd {} numa moved from {} to {}",
                        core_id, pmd.numa_id, numa_id
                    )));
                }
                debug!("pmd {} in iteration {}", core_id, pmd.cyc_idx());
                current = Some(core_id);
            }
            PmdLine::MainHeader => break,
            PmdLine::Isolated(value) => {
                if let Some(pmd) = current.and_then(|c| model.pmds.get_mut(&c)) {
                    pmd.isolated = value;
                }
            }
            PmdLine::Rxq {
                port,
                queue_id,
                usage,
            } => {
                let usage =
                    usage.ok_or_else(|| NcdError::Parse("pmd usage unavailable for now".into()))?;
                let core = current
                    .ok_or_else(|| NcdError::Parse(format!("rxq line outside a pmd block: {}", line)))?;

                let port_id = *model.port_ids.get(port).ok_or_else(|| {
                    NcdError::Inconsistency(format!("port {} missing in the id map", port))
                })?;
                let stats = model.port_stats.get_mut(port).ok_or_else(|| {
                    NcdError::Inconsistency(format!("port {} has no stats record", port))
                })?;
                stats.rebalance = true;

                let pmd = model
                    .pmds
                    .get_mut(&core)
                    .expect("current pmd block exists in the model");
                let cyc_idx = pmd.cyc_idx();
                let rx_diff = pmd.rx_cyc.latest() - pmd.rx_cyc.previous();
                let cpu_diff = pmd.proc_cpu_cyc.latest() - pmd.proc_cpu_cyc.previous();

                if pmd.find_port_by_name(port).is_none() {
                    pmd.add_port(port, Some(port_id))?;
                }
                let placement = pmd
                    .find_port_by_name_mut(port)
                    .expect("placement was just ensured");
                placement.id = Some(port_id);

                if placement.rxq_rebalanced.contains_key(&queue_id) {
                    return Err(NcdError::Inconsistency(format!(
                        "stale rxq {} found while parsing port {}",
                        queue_id, port
                    )));
                }
                if placement.find_rxq_by_id(queue_id).is_none() {
                    placement.add_rxq(queue_id)?;
                }
                let rxq = placement
                    .find_rxq_by_id_mut(queue_id)
                    .expect("rxq was just ensured");
                rxq.pmd = Some(core);
                rxq.cpu_cyc.set(cyc_idx, usage * cpu_diff / 100);
                rxq.rx_cyc.set(cyc_idx, usage * rx_diff / 100);
            }
            PmdLine::Stat { .. } | PmdLine::Other => {}
        }
    }
    Ok(())
}

fn exec_nonempty(shell: &dyn Shell, cmd: &str) -> Result<String> {
    let data = shell.exec(cmd)?;
    if data.trim().is_empty() {
        return Err(NcdError::OsCommand(format!(
            "{}: unable to collect data",
            cmd
        )));
    }
    Ok(data)
}

/// One sample tick: run and parse all four reports in their required order.
pub fn collect_tick(model: &mut Model, shell: &dyn Shell, cfg: &Config) -> Result<()> {
    let data = exec_nonempty(shell, &cfg.port_stats_cmd())?;
    parse_port_stats(model, &data)?;

    let data = exec_nonempty(shell, &cfg.iface_stats_cmd())?;
    parse_interface_stats(model, &data)?;

    let data = exec_nonempty(shell, &cfg.pmd_stats_cmd())?;
    parse_pmd_stats(model, &data)?;

    let data = exec_nonempty(shell, &cfg.pmd_rxq_cmd())?;
    parse_pmd_rxqs(model, &data)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shell::testing::ScriptedShell;

    const PMD_STATS: &str = "\
pmd thread numa_id 0 core_id 1:
  packets received: 1000
  packet recirculations: 0
  avg. datapath passes per packet: 1.00
  emc hits: 12768883657
  megaflow hits: 49909
  avg. subtable lookups per megaflow hit: 1.28
  miss with success upcall: 3911
  miss with failed upcall: 0
  idle cycles: 1100 (93.95%)
  processing cycles: 1200 (6.05%)
pmd thread numa_id 0 core_id 13:
  packets received: 3000
  idle cycles: 3100 (87.83%)
  processing cycles: 3200 (12.17%)
main thread:
  packets received: 108
  idle cycles: 6
";

    const PMD_RXQS: &str = "\
pmd thread numa_id 0 core_id 1:
  isolated : false
  port: port1   queue-id:  0  pmd usage:  50 %
pmd thread numa_id 0 core_id 13:
  isolated : true
  port: port2   queue-id:  0  pmd usage:  20 %
";

    const PORT_STATS: &str = "\
netdev@ovs-netdev:
  lookups: hit:0 missed:0 lost:0
  flows: 0
  port 1: port1 (tap)
    RX packets:5 errors:0 dropped:2 overruns:0 frame:0
    TX packets:5 errors:0 dropped:3 aborted:0 carrier:0
    collisions:0
    RX bytes:0  TX bytes:0
  port 2: port2 (tap)
    RX packets:8 errors:0 dropped:1 overruns:0 frame:0
    TX packets:9 errors:0 dropped:4 aborted:0 carrier:0
    collisions:0
    RX bytes:0  TX bytes:0
";

    const IFACE_STATS: &str = "\
_uuid               : 583d9020-a49a-4c5d-902d-dfcaa41e2911
admin_state         : up
mtu                 : 1500
name                : \"port1\"
options             : {n_rxq=\"1\", n_txq=\"1\"}
statistics          : {rx_bytes=0, rx_dropped=0, tx_dropped=0, tx_packets=0, tx_retries=7}
status              : {mode=client, status=disconnected}
type                : dpdkvhostuserclient

_uuid               : 3f97b403-2fe3-490f-8b24-8f9b80eb7aed
admin_state         : up
name                : \"port2\"
statistics          : {rx_bytes=0, rx_dropped=0, tx_packets=0}
type                : dpdk
";

    fn model_with_ports() -> Model {
        let mut model = Model::new(6);
        model.port_stats_entry("port1");
        model.port_stats_entry("port2");
        model
    }

    #[test]
    fn pmd_stats_populate_rings() {
        let mut model = Model::new(6);
        parse_pmd_stats(&mut model, PMD_STATS).unwrap();

        let pmd1 = model.pmd(1).unwrap();
        assert_eq!(pmd1.numa_id, 0);
        assert_eq!(pmd1.rx_cyc.latest(), 1000);
        assert_eq!(pmd1.idle_cpu_cyc.latest(), 1100);
        assert_eq!(pmd1.proc_cpu_cyc.latest(), 1200);

        let pmd13 = model.pmd(13).unwrap();
        assert_eq!(pmd13.rx_cyc.latest(), 3000);
        assert_eq!(pmd13.idle_cpu_cyc.latest(), 3100);
        assert_eq!(pmd13.proc_cpu_cyc.latest(), 3200);
        // main thread block is not a pmd.
        assert_eq!(model.pmds.len(), 2);
    }

    #[test]
    fn known_pmd_advances_cursor() {
        let mut model = Model::new(6);
        parse_pmd_stats(&mut model, PMD_STATS).unwrap();
        assert_eq!(model.pmd(1).unwrap().cyc_idx(), 0);
        parse_pmd_stats(&mut model, PMD_STATS).unwrap();
        assert_eq!(model.pmd(1).unwrap().cyc_idx(), 1);
    }

    #[test]
    fn pmd_numa_move_is_inconsistency() {
        let mut model = Model::new(6);
        parse_pmd_stats(&mut model, PMD_STATS).unwrap();
        let moved = PMD_STATS.replace("numa_id 0 core_id 1:", "numa_id 1 core_id 1:");
        assert!(matches!(
            parse_pmd_stats(&mut model, &moved),
            Err(NcdError::Inconsistency(_))
        ));
    }

    #[test]
    fn pmd_set_change_is_model_change() {
        let mut model = Model::new(6);
        parse_pmd_stats(&mut model, PMD_STATS).unwrap();
        let grown = PMD_STATS.replace(
            "main thread:",
            "pmd thread numa_id 0 core_id 14:\n  packets received: 1\nmain thread:",
        );
        assert!(matches!(
            parse_pmd_stats(&mut model, &grown),
            Err(NcdError::ModelChanged(_))
        ));
    }

    #[test]
    fn port_stats_populate_ids_and_rings() {
        let mut model = model_with_ports();
        parse_port_stats(&mut model, PORT_STATS).unwrap();
        assert_eq!(model.port_ids["port1"], 1);
        assert_eq!(model.port_ids["port2"], 2);

        let port1 = &model.port_stats["port1"];
        assert_eq!(port1.rx_cyc.latest(), 5);
        assert_eq!(port1.rx_drop_cyc.latest(), 2);
        assert_eq!(port1.tx_cyc.latest(), 5);
        assert_eq!(port1.tx_drop_cyc.latest(), 3);
        // The ports were already known, so the cursor advanced.
        assert_eq!(port1.cyc_idx(), 1);
    }

    #[test]
    fn new_port_set_is_model_change() {
        let mut model = model_with_ports();
        parse_port_stats(&mut model, PORT_STATS).unwrap();
        let grown = format!(
            "{}  port 3: port3 (tap)\n    RX packets:1 errors:0 dropped:0 overruns:0 frame:0\n",
            PORT_STATS
        );
        assert!(matches!(
            parse_port_stats(&mut model, &grown),
            Err(NcdError::ModelChanged(_))
        ));
    }

    #[test]
    fn interface_stats_populate_type_and_retries() {
        let mut model = model_with_ports();
        parse_interface_stats(&mut model, IFACE_STATS).unwrap();
        let port1 = &model.port_stats["port1"];
        assert_eq!(port1.port_type.as_deref(), Some("dpdkvhostuserclient"));
        assert_eq!(port1.tx_retry_cyc.latest(), 7);
        let port2 = &model.port_stats["port2"];
        assert_eq!(port2.port_type.as_deref(), Some("dpdk"));
        assert_eq!(port2.tx_retry_cyc.latest(), 0);
    }

    #[test]
    fn interface_stats_skip_unknown_ports() {
        let mut model = Model::new(6);
        model.port_stats_entry("port2");
        parse_interface_stats(&mut model, IFACE_STATS).unwrap();
        assert!(!model.port_stats.contains_key("port1"));
        assert_eq!(
            model.port_stats["port2"].port_type.as_deref(),
            Some("dpdk")
        );
    }

    #[test]
    fn rxq_usage_becomes_cycle_share() {
        let mut model = model_with_ports();
        parse_port_stats(&mut model, PORT_STATS).unwrap();
        // Two stat samples so the rxq parse sees a delta of 2000 processing
        // cycles and 1000 packets on pmd 1.
        parse_pmd_stats(&mut model, PMD_STATS).unwrap();
        let second = PMD_STATS
            .replace("packets received: 1000", "packets received: 2000")
            .replace("processing cycles: 1200 (6.05%)", "processing cycles: 3200 (6.05%)");
        parse_pmd_stats(&mut model, &second).unwrap();
        parse_pmd_rxqs(&mut model, PMD_RXQS).unwrap();

        let pmd1 = model.pmd(1).unwrap();
        assert!(!pmd1.isolated);
        let rxq = pmd1
            .find_port_by_name("port1")
            .and_then(|p| p.find_rxq_by_id(0))
            .unwrap();
        assert_eq!(rxq.pmd, Some(1));
        // 50% of the 2000-cycle delta, 50% of the 1000-packet delta.
        assert_eq!(rxq.cpu_cyc.get(pmd1.cyc_idx()), 1000);
        assert_eq!(rxq.rx_cyc.get(pmd1.cyc_idx()), 500);

        assert!(model.pmd(13).unwrap().isolated);
        assert!(model.port_stats["port1"].rebalance);
        assert_eq!(
            model
                .pmd(1)
                .unwrap()
                .find_port_by_name("port1")
                .unwrap()
                .id,
            Some(1)
        );
    }

    #[test]
    fn not_avail_usage_is_parse_error() {
        let mut model = model_with_ports();
        parse_port_stats(&mut model, PORT_STATS).unwrap();
        parse_pmd_stats(&mut model, PMD_STATS).unwrap();
        let broken = PMD_RXQS.replace("pmd usage:  50 %", "pmd usage: NOT AVAIL");
        assert!(matches!(
            parse_pmd_rxqs(&mut model, &broken),
            Err(NcdError::Parse(_))
        ));
    }

    #[test]
    fn rebalanced_queue_reappearing_is_inconsistency() {
        let mut model = model_with_ports();
        parse_port_stats(&mut model, PORT_STATS).unwrap();
        parse_pmd_stats(&mut model, PMD_STATS).unwrap();
        model
            .pmd_mut(1)
            .unwrap()
            .add_port("port1", Some(1))
            .unwrap()
            .rxq_rebalanced
            .insert(0, 13);
        assert!(matches!(
            parse_pmd_rxqs(&mut model, PMD_RXQS),
            Err(NcdError::Inconsistency(_))
        ));
    }

    #[test]
    fn unknown_pmd_in_rxq_show_is_inconsistency() {
        let mut model = model_with_ports();
        parse_port_stats(&mut model, PORT_STATS).unwrap();
        // No pmd stats collected at all: core 1 is unknown.
        assert!(matches!(
            parse_pmd_rxqs(&mut model, PMD_RXQS),
            Err(NcdError::Inconsistency(_))
        ));
    }

    #[test]
    fn collect_tick_runs_reports_in_order() {
        let mut model = Model::new(6);
        let shell = ScriptedShell::new(&[PORT_STATS, IFACE_STATS, PMD_STATS, PMD_RXQS]);
        let cfg = Config::default();
        collect_tick(&mut model, &shell, &cfg).unwrap();

        let executed = shell.executed.lock().unwrap();
        assert_eq!(
            executed.as_slice(),
            &[
                "ovs-appctl dpctl/show -s".to_string(),
                "ovs-vsctl list interface".to_string(),
                "ovs-appctl dpif-netdev/pmd-stats-show".to_string(),
                "ovs-appctl dpif-netdev/pmd-rxq-show".to_string(),
            ]
        );
        assert_eq!(model.pmds.len(), 2);
        assert_eq!(model.port_stats.len(), 2);
    }

    #[test]
    fn empty_report_is_fatal_os_error() {
        let mut model = Model::new(6);
        let shell = ScriptedShell::new(&["", IFACE_STATS, PMD_STATS, PMD_RXQS]);
        let cfg = Config::default();
        assert!(matches!(
            collect_tick(&mut model, &shell, &cfg),
            Err(NcdError::OsCommand(_))
        ));
    }
}
