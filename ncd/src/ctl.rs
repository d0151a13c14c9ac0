//! Control-socket listener: fixed-width ASCII commands over a Unix stream
//! socket. State changes are acknowledged with `CTLD_ACK`; queries reply
//! `CTLD_DATA_ACK <len>` followed by that many payload bytes.

use std::io::{self, Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use log::{info, warn};

use netcontrold::config::Config;
use netcontrold::event::{EventLog, RuntimeFlags};
use netcontrold::shell::Shell;

const CMD_LEN: usize = 24;
const ACCEPT_POLL: Duration = Duration::from_millis(200);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(2);

/// Accept loop. Polls the shutdown flag between accepts so the daemon can
/// join this thread on exit.
pub fn run_listener(
    listener: UnixListener,
    flags: &RuntimeFlags,
    events: &EventLog,
    cfg: &Config,
    shell: &dyn Shell,
) {
    if let Err(e) = listener.set_nonblocking(true) {
        warn!("ctld cannot poll its socket: {}", e);
        return;
    }
    while !flags.shutdown_requested() {
        match listener.accept() {
            Ok((stream, _)) => {
                if let Err(e) = handle_client(stream, flags, events, cfg, shell) {
                    info!("ctld client error: {}", e);
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
            Err(e) => {
                warn!("ctld accept failed: {}", e);
                thread::sleep(ACCEPT_POLL);
            }
        }
    }
}

fn send_ack(stream: &mut UnixStream) -> io::Result<()> {
    stream.write_all(b"CTLD_ACK")
}

fn send_data(stream: &mut UnixStream, payload: &str) -> io::Result<()> {
    stream.write_all(format!("CTLD_DATA_ACK {:6}", payload.len()).as_bytes())?;
    stream.write_all(payload.as_bytes())
}

fn toggle(flag: &AtomicBool, on: bool, what: &str) {
    let state = if on { "on" } else { "off" };
    if flag.swap(on, Ordering::SeqCst) == on {
        info!("{} already {} ..!", what, state);
    } else {
        info!("turning {} {} mode ..", state, what);
    }
}

fn on_off(value: bool) -> &'static str {
    if value {
        " on\n"
    } else {
        " off\n"
    }
}

fn config_text(flags: &RuntimeFlags) -> String {
    let mut text = String::from("trace mode:");
    text.push_str(on_off(flags.trace_mode.load(Ordering::SeqCst)));
    text.push_str("rebalance mode:");
    text.push_str(on_off(flags.rebal_mode.load(Ordering::SeqCst)));
    text.push_str("rebalance quick:");
    text.push_str(on_off(flags.rebal_quick.load(Ordering::SeqCst)));
    text.push_str("verbose log:");
    text.push_str(on_off(flags.verbose.load(Ordering::SeqCst)));
    text
}

fn status_text(events: &EventLog) -> String {
    let mut text = format!("{:<16} | {:<12} | {}\n", "Interface", "Event", "Time stamp");
    text.push_str(&"-".repeat(17));
    text.push('+');
    text.push_str(&"-".repeat(14));
    text.push('+');
    text.push_str(&"-".repeat(28));
    text.push('\n');
    for event in events.snapshot() {
        text.push_str(&format!(
            "{:<16} | {:<12} | {}\n",
            event.subject, event.kind, event.timestamp
        ));
    }
    text
}

fn version_text(shell: &dyn Shell, cfg: &Config) -> String {
    let mut text = format!("netcontrold v{}\n", env!("CARGO_PKG_VERSION"));
    let switch = shell
        .exec(&cfg.switch_version_cmd())
        .ok()
        .and_then(|out| {
            out.lines()
                .next()
                .and_then(|l| l.rsplit(' ').next().map(str::to_string))
        })
        .filter(|v| !v.is_empty());
    match switch {
        Some(version) => text.push_str(&format!("openvswitch v{}\n", version)),
        None => text.push_str("openvswitch (unknown)\n"),
    }
    text
}

fn handle_client(
    mut stream: UnixStream,
    flags: &RuntimeFlags,
    events: &EventLog,
    cfg: &Config,
    shell: &dyn Shell,
) -> io::Result<()> {
    stream.set_read_timeout(Some(CLIENT_TIMEOUT))?;
    stream.set_nonblocking(false)?;
    let mut buf = [0u8; CMD_LEN];
    let n = stream.read(&mut buf)?;
    let cmd = String::from_utf8_lossy(&buf[..n]);
    let cmd = cmd.trim_matches(|c: char| c == '\0' || c.is_whitespace());

    match cmd {
        "CTLD_TRACE_ON" => {
            toggle(&flags.trace_mode, true, "trace");
            send_ack(&mut stream)
        }
        "CTLD_TRACE_OFF" => {
            toggle(&flags.trace_mode, false, "trace");
            send_ack(&mut stream)
        }
        "CTLD_REBAL_ON" => {
            toggle(&flags.rebal_mode, true, "rebalance");
            send_ack(&mut stream)
        }
        "CTLD_REBAL_OFF" => {
            toggle(&flags.rebal_mode, false, "rebalance");
            send_ack(&mut stream)
        }
        "CTLD_REBAL_QUICK_ON" => {
            toggle(&flags.rebal_quick, true, "rebalance quick");
            send_ack(&mut stream)
        }
        "CTLD_REBAL_QUICK_OFF" => {
            toggle(&flags.rebal_quick, false, "rebalance quick");
            send_ack(&mut stream)
        }
        "CTLD_VERBOSE_ON" => {
            toggle(&flags.verbose, true, "verbose");
            send_ack(&mut stream)
        }
        "CTLD_VERBOSE_OFF" => {
            toggle(&flags.verbose, false, "verbose");
            send_ack(&mut stream)
        }
        "CTLD_REBAL_CNT" => {
            let count = if flags.rebal_mode.load(Ordering::SeqCst) {
                flags.rebal_count.load(Ordering::SeqCst)
            } else {
                0
            };
            send_data(&mut stream, &count.to_string())
        }
        "CTLD_CONFIG" => send_data(&mut stream, &config_text(flags)),
        "CTLD_STATUS" => send_data(&mut stream, &status_text(events)),
        "CTLD_VERSION" => send_data(&mut stream, &version_text(shell, cfg)),
        other => {
            info!("unknown control command {}", other);
            Ok(())
        }
    }
}
