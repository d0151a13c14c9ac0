use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use anyhow::Context;
use log::{info, warn};
use structopt::StructOpt;

use netcontrold::config::Config;
use netcontrold::event::{EventLog, RuntimeFlags};
use netcontrold::shell::HostShell;

mod ctl;
mod daemon;
mod logger;

#[derive(Debug, StructOpt)]
#[structopt(name = "ncd", about = "control network load on pmd")]
struct Opt {
    /// seconds between each sampling
    #[structopt(short, long, default_value = "10")]
    sample_interval: u64,

    /// operate in trace mode
    #[structopt(short, long)]
    trace: bool,

    /// trace mode callback
    #[structopt(long, default_value = "ncd_cb_pktdrop")]
    trace_cb: String,

    /// operate in rebalance mode (on by default; turn off over the control socket)
    #[structopt(short, long)]
    rebalance: bool,

    /// seconds between each re-balance
    #[structopt(long, default_value = "60")]
    rebalance_interval: u64,

    /// rebalance dry-runs at the max
    #[structopt(long, default_value = "1")]
    rebalance_n: u32,

    /// rebalance by iterative queues logic
    #[structopt(long)]
    rebalance_iq: bool,

    /// no logging in terminal
    #[structopt(short, long)]
    quiet: bool,

    /// verbose logging in the log file
    #[structopt(short, long)]
    verbose: bool,
}

/// Look a program up on PATH, the way the shell would.
fn on_path(program: &str) -> bool {
    let probe = |path: &Path| {
        fs::metadata(path)
            .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    };
    if program.contains('/') {
        return probe(Path::new(program));
    }
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| probe(&dir.join(program))))
        .unwrap_or(false)
}

/// Removes the held path when dropped, so sockets and pid files never outlive
/// the daemon.
struct PathGuard(PathBuf);

impl Drop for PathGuard {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.0) {
            if self.0.exists() {
                warn!("unable to remove {}: {}", self.0.display(), e);
            }
        }
    }
}

fn write_pid_file(path: &Path) -> anyhow::Result<PathGuard> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    fs::write(path, format!("{}", process::id()))
        .with_context(|| format!("writing pid file {}", path.display()))?;
    Ok(PathGuard(path.to_path_buf()))
}

fn bind_control_socket(path: &Path) -> anyhow::Result<(UnixListener, PathGuard)> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    // A socket left behind by a previous run would fail the bind.
    if path.exists() {
        fs::remove_file(path)
            .with_context(|| format!("removing stale socket {}", path.display()))?;
    }
    let listener = UnixListener::bind(path)
        .with_context(|| format!("binding control socket {}", path.display()))?;
    Ok((listener, PathGuard(path.to_path_buf())))
}

fn main() -> anyhow::Result<()> {
    let opt = Opt::from_args();
    let mut cfg = Config::default();

    if opt.trace && !on_path(&opt.trace_cb) {
        eprintln!("no such program {} exists!", opt.trace_cb);
        process::exit(1);
    }

    // The window must fill inside one rebalance interval.
    if opt.sample_interval > 0 {
        let ticks = (opt.rebalance_interval / opt.sample_interval) as usize;
        if ticks > 0 {
            cfg.samples_max = cfg.samples_max.min(ticks);
        }
    }

    let flags = Arc::new(RuntimeFlags::default());
    let events = Arc::new(EventLog::default());

    if opt.trace {
        flags.trace_mode.store(true, std::sync::atomic::Ordering::SeqCst);
    }
    // Rebalance mode starts on, with quick sampling; `-r` is accepted for
    // compatibility and the off switch is CTLD_REBAL_OFF.
    let _ = opt.rebalance;
    flags.rebal_mode.store(true, std::sync::atomic::Ordering::SeqCst);
    flags.rebal_quick.store(true, std::sync::atomic::Ordering::SeqCst);
    flags.verbose.store(opt.verbose, std::sync::atomic::Ordering::SeqCst);

    logger::init(&cfg, opt.quiet, Arc::clone(&flags)).context("initializing logging")?;

    {
        let flags = Arc::clone(&flags);
        ctrlc::set_handler(move || {
            flags.request_shutdown();
        })
        .context("installing signal handler")?;
    }

    let _pid_guard = write_pid_file(&cfg.pid_file)?;
    let (listener, _socket_guard) = bind_control_socket(&cfg.socket_path)?;
    info!("starting ctld on {}", cfg.socket_path.display());

    let shell = HostShell;
    let params = daemon::Params {
        sample_interval: opt.sample_interval,
        rebalance_interval: opt.rebalance_interval,
        rebalance_n: if opt.rebalance_iq { opt.rebalance_n } else { 1 },
        iterative: opt.rebalance_iq,
        trace_cb: opt.trace_cb.clone(),
    };

    let outcome = netcontrold::thread::scope(|scope| {
        scope.spawn(|_| ctl::run_listener(listener, &flags, &events, &cfg, &shell));
        let result = daemon::run(&cfg, &params, &flags, &events, &shell);
        // The listener polls the same flag; wake it for the join below.
        flags.request_shutdown();
        result
    })
    .map_err(|err| anyhow::anyhow!("thread panicked: {:?}", err))?;

    match outcome {
        Ok(()) => {
            info!("Exiting NCD ..");
            Ok(())
        }
        Err(e) => {
            warn!("fatal: {}", e);
            Err(e.into())
        }
    }
}
