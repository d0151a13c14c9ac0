//! Numa and core layout of the host, read from procfs.
//!
//! The cycle-ordered rebalancer wants a stable "round-robin by numa, then by
//! core" traversal of cpu ids; this module derives it from `/proc/cpuinfo`
//! (fields `processor`, `core id` and `physical id`).

use std::collections::BTreeMap;
use std::fs;

use crate::error::{NcdError, Result};
use crate::model::{CoreId, NumaId};

const CPUINFO_PATH: &str = "/proc/cpuinfo";

/// One logical cpu as listed in /proc/cpuinfo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuRecord {
    pub processor: CoreId,
    pub core_id: u32,
    pub physical_id: NumaId,
}

fn field<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    let mut split = line.splitn(2, ':');
    let name = split.next()?.trim();
    if name != key {
        return None;
    }
    Some(split.next().unwrap_or("").trim())
}

/// Parse /proc/cpuinfo text into per-cpu records. Blocks are separated by
/// blank lines; a block missing any of the three fields, or carrying a
/// non-numeric value, fails the whole parse.
pub fn parse_cpuinfo(data: &str) -> Result<Vec<CpuRecord>> {
    let mut records = Vec::new();
    let mut processor: Option<u32> = None;
    let mut core_id: Option<u32> = None;
    let mut physical_id: Option<u32> = None;

    let mut flush = |processor: &mut Option<u32>,
                     core_id: &mut Option<u32>,
                     physical_id: &mut Option<u32>|
     -> Result<()> {
        if processor.is_none() && core_id.is_none() && physical_id.is_none() {
            return Ok(());
        }
        match (processor.take(), core_id.take(), physical_id.take()) {
            (Some(p), Some(c), Some(n)) => {
                records.push(CpuRecord {
                    processor: p,
                    core_id: c,
                    physical_id: n,
                });
                Ok(())
            }
            _ => Err(NcdError::Parse("incomplete cpu block in cpuinfo".into())),
        }
    };

    for line in data.lines() {
        if line.trim().is_empty() {
            flush(&mut processor, &mut core_id, &mut physical_id)?;
            continue;
        }
        let parse_num = |v: &str, key: &str| -> Result<u32> {
            v.parse().map_err(|_| {
                NcdError::Parse(format!("bad {} value {:?} in cpuinfo", key, v))
            })
        };
        if let Some(v) = field(line, "processor") {
            // A new processor line without a preceding blank separator starts
            // the next block.
            if processor.is_some() {
                flush(&mut processor, &mut core_id, &mut physical_id)?;
            }
            processor = Some(parse_num(v, "processor")?);
        } else if let Some(v) = field(line, "core id") {
            core_id = Some(parse_num(v, "core id")?);
        } else if let Some(v) = field(line, "physical id") {
            physical_id = Some(parse_num(v, "physical id")?);
        }
    }
    flush(&mut processor, &mut core_id, &mut physical_id)?;
    Ok(records)
}

/// numa id → core id → cpus sharing that core (hyperthread siblings).
pub fn numa_cpu_map(records: &[CpuRecord]) -> BTreeMap<NumaId, BTreeMap<u32, Vec<CoreId>>> {
    let mut map: BTreeMap<NumaId, BTreeMap<u32, Vec<CoreId>>> = BTreeMap::new();
    for rec in records {
        map.entry(rec.physical_id)
            .or_default()
            .entry(rec.core_id)
            .or_default()
            .push(rec.processor);
    }
    map
}

/// Flatten the numa map into a traversal order: numa by numa, one sibling of
/// every core before the next sibling round.
pub fn rr_cpu_order(records: &[CpuRecord]) -> Vec<CoreId> {
    let map = numa_cpu_map(records);
    let mut order = Vec::with_capacity(records.len());
    for cores in map.values() {
        let mut round = 0;
        loop {
            let mut any = false;
            for cpus in cores.values() {
                if let Some(cpu) = cpus.get(round) {
                    order.push(*cpu);
                    any = true;
                }
            }
            if !any {
                break;
            }
            round += 1;
        }
    }
    order
}

/// Round-robin cpu order of this host.
pub fn rr_cpu_in_numa() -> Result<Vec<CoreId>> {
    let data = fs::read_to_string(CPUINFO_PATH)
        .map_err(|e| NcdError::OsCommand(format!("reading {}: {}", CPUINFO_PATH, e)))?;
    Ok(rr_cpu_order(&parse_cpuinfo(&data)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASIC_CPU_INFO: &str = "\
processor\t: 0
core id\t\t: 0
physical id\t: 0

processor\t: 1
core id\t\t: 1
physical id\t: 0

processor\t: 2
core id\t\t: 0
physical id\t: 0

processor\t: 3
core id\t\t: 1
physical id\t: 0
";

    const BROKEN_CPU_INFO: &str = "\
core id\t\t: 0
processor\t: 5
processor\t: 0
core id\t\t: 0
processor\t: 1
physical id\t:
core id\t\t: xyz
processor\t: 2
";

    const TWO_NUMA_CPU_INFO: &str = "\
processor\t: 0
core id\t\t: 0
physical id\t: 0

processor\t: 1
core id\t\t: 0
physical id\t: 8

processor\t: 2
core id\t\t: 1
physical id\t: 0

processor\t: 3
core id\t\t: 1
physical id\t: 8
";

    #[test]
    fn parses_well_formed_blocks() {
        let records = parse_cpuinfo(BASIC_CPU_INFO).unwrap();
        assert_eq!(records.len(), 4);
        assert_eq!(
            records[2],
            CpuRecord {
                processor: 2,
                core_id: 0,
                physical_id: 0
            }
        );
    }

    #[test]
    fn rejects_malformed_blocks() {
        assert!(parse_cpuinfo(BROKEN_CPU_INFO).is_err());
    }

    #[test]
    fn empty_input_is_empty() {
        assert_eq!(parse_cpuinfo("").unwrap(), vec![]);
    }

    #[test]
    fn numa_map_groups_siblings() {
        let records = parse_cpuinfo(BASIC_CPU_INFO).unwrap();
        let map = numa_cpu_map(&records);
        assert_eq!(map.len(), 1);
        assert_eq!(map[&0][&0], vec![0, 2]);
        assert_eq!(map[&0][&1], vec![1, 3]);
    }

    #[test]
    fn rr_order_interleaves_cores_before_siblings() {
        let records = parse_cpuinfo(BASIC_CPU_INFO).unwrap();
        assert_eq!(rr_cpu_order(&records), vec![0, 1, 2, 3]);
    }

    #[test]
    fn rr_order_keeps_numas_apart() {
        let records = parse_cpuinfo(TWO_NUMA_CPU_INFO).unwrap();
        // numa 0 first (cpus 0 and 2), then the sparse-numbered numa 8.
        assert_eq!(rr_cpu_order(&records), vec![0, 2, 1, 3]);
    }
}
