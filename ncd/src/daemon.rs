//! The decision loop: sample, evaluate, dry-run, commit, recover.

use std::collections::BTreeSet;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::{Duration, Instant};

use log::{info, warn};

use netcontrold::collect::collect_tick;
use netcontrold::config::Config;
use netcontrold::cpu;
use netcontrold::emit;
use netcontrold::error::{NcdError, Result};
use netcontrold::event::{now_ts, EventLog, RuntimeFlags};
use netcontrold::load::{load_variance, update_pmd_load};
use netcontrold::model::{CoreId, Model};
use netcontrold::rebalance::{dryrun_by_cyc, dryrun_by_iq};
use netcontrold::shell::Shell;

const SHUTDOWN_POLL: Duration = Duration::from_millis(200);

/// Loop parameters resolved from the command line.
#[derive(Debug, Clone)]
pub struct Params {
    pub sample_interval: u64,
    pub rebalance_interval: u64,
    pub rebalance_n: u32,
    pub iterative: bool,
    pub trace_cb: String,
}

struct Daemon<'a> {
    cfg: &'a Config,
    params: &'a Params,
    flags: &'a RuntimeFlags,
    events: &'a EventLog,
    shell: &'a dyn Shell,
    model: Model,
    /// Sample ticks since the last commit.
    rebal_tick: u64,
    /// Minimum ticks between commits.
    rebal_tick_n: u64,
    apply_rebal: bool,
    last_ts: String,
}

impl<'a> Daemon<'a> {
    fn new(
        cfg: &'a Config,
        params: &'a Params,
        flags: &'a RuntimeFlags,
        events: &'a EventLog,
        shell: &'a dyn Shell,
    ) -> Self {
        let rebal_tick_n = params.rebalance_interval / params.sample_interval.max(1);
        Daemon {
            cfg,
            params,
            flags,
            events,
            shell,
            model: Model::new(cfg.samples_max),
            rebal_tick: 0,
            rebal_tick_n,
            apply_rebal: false,
            last_ts: now_ts(),
        }
    }

    /// Sleep that gives up as soon as the shutdown flag is raised.
    fn sleep_interruptible(&self, secs: u64) -> Result<()> {
        if self.flags.shutdown_requested() {
            return Err(NcdError::Shutdown);
        }
        let deadline = Instant::now() + Duration::from_secs(secs);
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            thread::sleep(SHUTDOWN_POLL.min(deadline - now));
            if self.flags.shutdown_requested() {
                return Err(NcdError::Shutdown);
            }
        }
    }

    /// Collect `n_samples` ticks, sleeping the sample interval after each.
    /// Recoverable trouble (a parse glitch, a changed topology) resets the
    /// model and restarts the window from scratch; the rest propagates.
    fn collect_window(&mut self, n_samples: usize) -> Result<()> {
        let mut remaining = n_samples;
        while remaining > 0 {
            if self.flags.shutdown_requested() {
                return Err(NcdError::Shutdown);
            }
            self.rebal_tick += 1;
            match collect_tick(&mut self.model, self.shell, self.cfg) {
                Ok(()) => {
                    self.sleep_interruptible(self.params.sample_interval)?;
                    remaining -= 1;
                }
                Err(e @ NcdError::OsCommand(_)) => {
                    warn!("unable to collect data: {}", e);
                    self.events.append("switch", "error");
                    return Err(e);
                }
                Err(e @ NcdError::ObjCreate(_)) | Err(e @ NcdError::Inconsistency(_)) => {
                    warn!("inconsistency in collected data: {}", e);
                    self.events.append("ncd", "error");
                    return Err(e);
                }
                Err(NcdError::ModelChanged(msg)) => {
                    warn!("switch states changed: {}", msg);
                    self.events.append("ncd", "retry_model");
                    self.model.clear();
                    remaining = self.cfg.samples_max;
                }
                Err(NcdError::Parse(msg)) => {
                    warn!("unable to parse info: {}", msg);
                    self.events.append("ncd", "retry_parse");
                    self.model.clear();
                    remaining = self.cfg.samples_max;
                    self.sleep_interruptible(self.params.sample_interval)?;
                }
                Err(e) => return Err(e),
            }
        }
        self.last_ts = now_ts();
        update_pmd_load(&mut self.model);
        Ok(())
    }

    /// Check every port's drop and retry counters against the configured
    /// thresholds and run the callback program over the pmds polling the
    /// offending ports.
    fn trace_ports(&self) {
        let mut cb_cores: BTreeSet<CoreId> = BTreeSet::new();
        for (name, stats) in &self.model.port_stats {
            let (rx_ppm, tx_ppm) = emit::port_drop_ppm(stats);
            let tx_retry = emit::port_tx_retry(stats);
            let drop_min = self.cfg.cb_pktdrop_min;
            let mut do_cb = false;

            if rx_ppm > drop_min {
                info!("port {} drop_rx {} ppm above {} ppm", name, rx_ppm, drop_min);
                self.events.append_at(name, "rx_drop", self.last_ts.clone());
                do_cb = true;
            }
            if tx_ppm > drop_min {
                info!("port {} drop_tx {} ppm above {} ppm", name, tx_ppm, drop_min);
                self.events.append_at(name, "tx_drop", self.last_ts.clone());
                do_cb = true;
            }
            if tx_retry > self.cfg.samples_max as i64 {
                info!(
                    "port {} tx_retry {} above {}",
                    name, tx_retry, self.cfg.samples_max
                );
                self.events.append_at(name, "tx_retry", self.last_ts.clone());
                do_cb = true;
            }
            if !do_cb {
                continue;
            }
            for (core, pmd) in &self.model.pmds {
                if pmd.find_port_by_name(name).is_some() {
                    cb_cores.insert(*core);
                }
            }
        }

        if cb_cores.is_empty() {
            return;
        }
        let cores = cb_cores
            .iter()
            .map(|c| c.to_string())
            .collect::<Vec<_>>()
            .join(" ");
        let cmd = format!("{} {}", self.params.trace_cb, cores);
        info!("executing callback {}", cmd);
        match self.shell.exec(&cmd) {
            Ok(out) => info!("{}", out),
            Err(e) => warn!("callback failed: {}", e),
        }
    }

    fn dryrun(&mut self) -> Result<i64> {
        if self.params.iterative {
            dryrun_by_iq(&mut self.model, self.cfg.pmd_core_threshold)
        } else {
            let rr_order = cpu::rr_cpu_in_numa()?;
            dryrun_by_cyc(&mut self.model, &rr_order, self.cfg.pmd_core_threshold)
        }
    }

    fn log_loads(&self, heading: &str) {
        info!("{}", heading);
        for (id, pmd) in &self.model.pmds {
            info!("pmd id {} load {}", id, pmd.pmd_load.round() as i64);
        }
    }

    /// Render the assignment, hand it to the switch, and give the switch a
    /// moment to settle. Executor failure is recorded, not fatal.
    fn commit(&mut self) -> Result<()> {
        self.rebal_tick = 0;
        let cmd = emit::rebalance_switch_cmd(&mut self.model, self.shell, self.cfg, self.events)?;
        self.events.append_at("pmd", "rebalance", self.last_ts.clone());
        info!("vswitch command for current optimization is: {}", cmd);
        self.apply_rebal = false;

        match self.shell.exec(&cmd) {
            Ok(_) => {
                self.flags.rebal_count.fetch_add(1, Ordering::SeqCst);
            }
            Err(e) => {
                info!("problem running this command.. check vswitch! ({})", e);
                self.events.append("switch", "error");
            }
        }

        info!(
            "waiting for {} seconds before new dry runs begin..",
            self.cfg.vsw_wait_min
        );
        self.sleep_interruptible(self.cfg.vsw_wait_min)
    }

    fn main_loop(&mut self) -> Result<()> {
        let mut samples = self.cfg.samples_max;
        let mut min_sample_i = 0usize;

        loop {
            if self.flags.shutdown_requested() {
                return Err(NcdError::Shutdown);
            }
            self.collect_window(samples)?;
            min_sample_i += samples;

            self.log_loads("current pmd load:");
            let mut cur_var = load_variance(&self.model);
            info!("current pmd load variance: {}", cur_var.round() as i64);

            if self.flags.trace_mode.load(Ordering::SeqCst) {
                self.trace_ports();
            }

            if !self.flags.rebal_mode.load(Ordering::SeqCst) {
                continue;
            }

            // A cold start needs the whole window sampled before any
            // evaluation. In quick mode, later windows roll a single fresh
            // sample over the aged ones instead of resampling everything.
            if self.flags.rebal_quick.load(Ordering::SeqCst) && min_sample_i >= self.cfg.samples_max
            {
                samples = 1;
                min_sample_i = self.cfg.samples_max - 1;
            } else {
                samples = self.cfg.samples_max;
            }

            let mut moved = 0i64;
            if !self.model.pmds.is_empty() {
                for _ in 0..self.params.rebalance_n {
                    let n = self.dryrun()?;
                    if n > 0 {
                        moved += n;
                    }
                }
            }

            if moved == 0 {
                info!("no dryrun performed.");
                continue;
            }

            let prev_var = cur_var;
            cur_var = load_variance(&self.model);
            self.log_loads("pmd load after dry run:");
            info!(
                "pmd load variance: previous {}, after dry run {}",
                prev_var.round() as i64,
                cur_var.round() as i64
            );

            if cur_var < prev_var {
                let diff = (prev_var - cur_var) * 100.0 / prev_var;
                if diff > self.cfg.load_improve_min {
                    self.apply_rebal = true;
                }
            }

            if self.apply_rebal {
                if self.rebal_tick >= self.rebal_tick_n {
                    match self.commit() {
                        Ok(()) => {}
                        Err(e) if e.is_recoverable() => {
                            warn!("commit skipped: {}", e);
                            self.events.append("ncd", "retry_model");
                        }
                        Err(e) => return Err(e),
                    }
                } else {
                    info!(
                        "minimum rebalance interval not met! now at {} sec",
                        self.rebal_tick * self.params.sample_interval
                    );
                }
            } else {
                info!("no new optimization found ..");
            }

            self.model.clear();
            samples = self.cfg.samples_max;
            min_sample_i = 0;
            info!("dry-run reset.");
        }
    }

    /// Remove the affinity of every port the daemon touched. Runs on every
    /// exit path, clean or fatal.
    fn shutdown_cleanup(&self) {
        info!("doing required clean up ..");
        let cmd = match emit::clear_affinity_cmd(&self.model, self.cfg) {
            Some(cmd) => cmd,
            None => return,
        };
        match self.shell.exec(&cmd) {
            Ok(_) => info!("removed pmd-rxq-affinity in rebalanced ports."),
            Err(_) => {
                warn!("removing pmd-rxq-affinity failed for some ports.");
                warn!("you may check {}", cmd);
            }
        }
    }
}

/// Run the decision loop until shutdown or a fatal error. The affinity
/// cleanup runs in both cases.
pub fn run(
    cfg: &Config,
    params: &Params,
    flags: &RuntimeFlags,
    events: &EventLog,
    shell: &dyn Shell,
) -> Result<()> {
    let mut daemon = Daemon::new(cfg, params, flags, events, shell);
    let result = daemon.main_loop();
    daemon.shutdown_cleanup();
    match result {
        Err(NcdError::Shutdown) => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netcontrold::error::Result as NcdResult;
    use std::sync::Mutex;

    /// Replays scripted replies; records every command. Runs dry, it fails
    /// like a dead switch.
    struct ScriptShell {
        replies: Mutex<Vec<String>>,
        executed: Mutex<Vec<String>>,
    }

    impl ScriptShell {
        fn new(replies: &[&str]) -> Self {
            ScriptShell {
                replies: Mutex::new(replies.iter().rev().map(|s| s.to_string()).collect()),
                executed: Mutex::new(Vec::new()),
            }
        }

        fn executed(&self) -> Vec<String> {
            self.executed.lock().unwrap().clone()
        }
    }

    impl Shell for ScriptShell {
        fn exec(&self, cmd: &str) -> NcdResult<String> {
            self.executed.lock().unwrap().push(cmd.to_string());
            self.replies
                .lock()
                .unwrap()
                .pop()
                .filter(|r| !r.is_empty())
                .ok_or_else(|| NcdError::OsCommand(format!("{}: unable to collect data", cmd)))
        }
    }

    const PORT_STATS: &str = "\
netdev@ovs-netdev:
  port 1: port1 (dpdk)
    RX packets:100 errors:0 dropped:0 overruns:0 frame:0
    TX packets:100 errors:0 dropped:0 aborted:0 carrier:0
";

    const IFACE_STATS: &str = "\
name                : \"port1\"
statistics          : {tx_retries=0}
type                : dpdk
";

    const PMD_STATS: &str = "\
pmd thread numa_id 0 core_id 0:
  packets received: 1000
  idle cycles: 1000
  processing cycles: 5000
pmd thread numa_id 0 core_id 1:
  packets received: 1000
  idle cycles: 5000
  processing cycles: 1000
main thread:
  packets received: 0
";

    const PMD_RXQS: &str = "\
pmd thread numa_id 0 core_id 0:
  isolated : false
  port: port1   queue-id:  0  pmd usage:  50 %
pmd thread numa_id 0 core_id 1:
  isolated : false
  port: port1   queue-id:  1  pmd usage:  10 %
";

    fn quick_params() -> Params {
        Params {
            sample_interval: 0,
            rebalance_interval: 0,
            rebalance_n: 1,
            iterative: true,
            trace_cb: "ncd_cb_pktdrop".into(),
        }
    }

    fn small_cfg() -> Config {
        let mut cfg = Config::default();
        cfg.samples_max = 2;
        cfg
    }

    fn tick() -> Vec<&'static str> {
        vec![PORT_STATS, IFACE_STATS, PMD_STATS, PMD_RXQS]
    }

    #[test]
    fn window_collects_the_requested_ticks() {
        let cfg = small_cfg();
        let params = quick_params();
        let flags = RuntimeFlags::default();
        let events = EventLog::default();
        let mut script = Vec::new();
        script.extend(tick());
        script.extend(tick());
        let shell = ScriptShell::new(&script);

        let mut daemon = Daemon::new(&cfg, &params, &flags, &events, &shell);
        daemon.collect_window(2).unwrap();

        assert_eq!(daemon.rebal_tick, 2);
        assert_eq!(daemon.model.pmds.len(), 2);
        assert_eq!(shell.executed().len(), 8);
        assert!(events.is_empty());
    }

    #[test]
    fn parse_glitch_discards_window_and_resamples() {
        let cfg = small_cfg();
        let params = quick_params();
        let flags = RuntimeFlags::default();
        let events = EventLog::default();

        let broken = PMD_RXQS.replace("pmd usage:  50 %", "pmd usage: NOT AVAIL");
        let mut script: Vec<&str> = Vec::new();
        script.extend(tick());
        // Second tick fails on the rxq report; the window restarts.
        script.extend(vec![PORT_STATS, IFACE_STATS, PMD_STATS, broken.as_str()]);
        script.extend(tick());
        script.extend(tick());
        let shell = ScriptShell::new(&script);

        let mut daemon = Daemon::new(&cfg, &params, &flags, &events, &shell);
        daemon.collect_window(2).unwrap();

        let snapshot = events.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].subject, "ncd");
        assert_eq!(snapshot[0].kind, "retry_parse");
        // The restarted window filled the model afresh.
        assert_eq!(daemon.model.pmds.len(), 2);
    }

    #[test]
    fn consecutive_parse_errors_leave_the_model_empty() {
        let cfg = small_cfg();
        let params = quick_params();
        let flags = RuntimeFlags::default();
        let events = EventLog::default();

        let broken = PMD_RXQS.replace("pmd usage:  50 %", "pmd usage: NOT AVAIL");
        let mut script: Vec<&str> = Vec::new();
        script.extend(vec![PORT_STATS, IFACE_STATS, PMD_STATS, broken.as_str()]);
        script.extend(vec![PORT_STATS, IFACE_STATS, PMD_STATS, broken.as_str()]);
        let shell = ScriptShell::new(&script);

        let mut daemon = Daemon::new(&cfg, &params, &flags, &events, &shell);
        let result = daemon.collect_window(2);

        // The dry script fails the third attempt like a dead switch.
        assert!(matches!(result, Err(NcdError::OsCommand(_))));
        assert!(daemon.model.pmds.is_empty());
        assert!(daemon.model.port_stats.is_empty());
        let kinds: Vec<_> = events.snapshot().iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec!["retry_parse", "retry_parse", "error"]);
    }

    #[test]
    fn balanced_fleet_never_commits() {
        let cfg = small_cfg();
        let params = quick_params();
        let flags = RuntimeFlags::default();
        flags.rebal_mode.store(true, Ordering::SeqCst);
        flags.rebal_quick.store(true, Ordering::SeqCst);
        let events = EventLog::default();

        // One full window, then the script runs dry and the loop dies on the
        // next sample; no commit may have happened in between.
        let mut script = Vec::new();
        script.extend(tick());
        script.extend(tick());
        let shell = ScriptShell::new(&script);

        let result = run(&cfg, &params, &flags, &events, &shell);
        assert!(matches!(result, Err(NcdError::OsCommand(_))));
        assert_eq!(flags.rebal_count.load(Ordering::SeqCst), 0);
        assert!(events.snapshot().iter().all(|e| e.kind != "rebalance"));
        // The cleanup may emit removals, but nothing ever set an affinity.
        let executed = shell.executed();
        assert!(executed
            .iter()
            .all(|cmd| !cmd.contains("other_config:pmd-rxq-affinity=")));
    }

    #[test]
    fn commit_renders_and_counts() {
        let cfg = small_cfg();
        let params = quick_params();
        let flags = RuntimeFlags::default();
        let events = EventLog::default();
        // One reply for the id refresh, one for the commit itself.
        let shell = ScriptShell::new(&[PORT_STATS, "ok"]);

        let mut daemon = Daemon::new(&cfg, &params, &flags, &events, &shell);
        let pmd0 = daemon.model.add_pmd(0, 0);
        pmd0.add_port("port1", Some(1)).unwrap();
        let pmd1 = daemon.model.add_pmd(1, 0);
        pmd1.add_port("port1", Some(1)).unwrap().add_rxq(1).unwrap();
        daemon.apply_rebal = true;

        daemon.commit().unwrap();

        assert_eq!(flags.rebal_count.load(Ordering::SeqCst), 1);
        assert!(!daemon.apply_rebal);
        assert_eq!(daemon.rebal_tick, 0);
        let executed = shell.executed();
        assert!(executed[1].starts_with("ovs-vsctl --no-wait "));
        assert!(executed[1].contains("-- set Interface port1 other_config:pmd-rxq-affinity=1:1, "));
        assert!(events
            .snapshot()
            .iter()
            .any(|e| e.subject == "pmd" && e.kind == "rebalance"));
    }

    #[test]
    fn failed_commit_records_switch_error_but_continues() {
        let cfg = small_cfg();
        let params = quick_params();
        let flags = RuntimeFlags::default();
        let events = EventLog::default();
        // The id refresh succeeds; the vsctl call fails.
        let shell = ScriptShell::new(&[PORT_STATS, ""]);

        let mut daemon = Daemon::new(&cfg, &params, &flags, &events, &shell);
        let pmd1 = daemon.model.add_pmd(1, 0);
        pmd1.add_port("port1", Some(1)).unwrap().add_rxq(1).unwrap();
        daemon.model.add_pmd(0, 0);
        daemon.apply_rebal = true;

        daemon.commit().unwrap();

        assert_eq!(flags.rebal_count.load(Ordering::SeqCst), 0);
        assert!(events
            .snapshot()
            .iter()
            .any(|e| e.subject == "switch" && e.kind == "error"));
    }

    #[test]
    fn shutdown_cleanup_clears_touched_ports_only() {
        let cfg = small_cfg();
        let params = quick_params();
        let flags = RuntimeFlags::default();
        let events = EventLog::default();
        let shell = ScriptShell::new(&["ok"]);

        let mut daemon = Daemon::new(&cfg, &params, &flags, &events, &shell);
        daemon.model.port_stats_entry("port1").rebalance = true;
        daemon.model.port_stats_entry("port2").rebalance = true;
        daemon.model.port_stats_entry("port3");

        daemon.shutdown_cleanup();

        let executed = shell.executed();
        assert_eq!(executed.len(), 1);
        assert!(executed[0].contains("-- remove Interface port1 other_config pmd-rxq-affinity "));
        assert!(executed[0].contains("-- remove Interface port2 other_config pmd-rxq-affinity "));
        assert!(!executed[0].contains("port3"));
    }

    #[test]
    fn tracer_flags_dropping_ports_and_calls_back() {
        let cfg = small_cfg();
        let params = quick_params();
        let flags = RuntimeFlags::default();
        let events = EventLog::default();
        let shell = ScriptShell::new(&["traced"]);

        let mut daemon = Daemon::new(&cfg, &params, &flags, &events, &shell);
        {
            let stats = daemon.model.port_stats_entry("port1");
            stats.rx_cyc.set(0, 0);
            stats.rx_cyc.set(1, 1000);
            stats.rx_drop_cyc.set(0, 0);
            stats.rx_drop_cyc.set(1, 100);
        }
        let pmd = daemon.model.add_pmd(3, 0);
        pmd.add_port("port1", Some(1)).unwrap();

        daemon.trace_ports();

        // 100 drops over 1000 packets is 100000 ppm, over the threshold.
        assert!(events
            .snapshot()
            .iter()
            .any(|e| e.subject == "port1" && e.kind == "rx_drop"));
        let executed = shell.executed();
        assert_eq!(executed.len(), 1);
        assert_eq!(executed[0], "ncd_cb_pktdrop 3");
    }

    #[test]
    fn quiet_ports_trigger_no_callback() {
        let cfg = small_cfg();
        let params = quick_params();
        let flags = RuntimeFlags::default();
        let events = EventLog::default();
        let shell = ScriptShell::new(&[]);

        let mut daemon = Daemon::new(&cfg, &params, &flags, &events, &shell);
        daemon.model.port_stats_entry("port1");
        daemon.trace_ports();

        assert!(events.is_empty());
        assert!(shell.executed().is_empty());
    }
}
