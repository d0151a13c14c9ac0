//! Logging sinks behind the `log` facade: a size-capped rotating file, whose
//! threshold follows the runtime verbose flag, and the terminal unless the
//! daemon runs quiet.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use chrono::Local;
use log::{Level, LevelFilter, Log, Metadata, Record};

use netcontrold::config::Config;
use netcontrold::event::RuntimeFlags;

struct FileSink {
    file: File,
    written: u64,
}

struct NcdLogger {
    path: PathBuf,
    max_bytes: u64,
    backups: u32,
    quiet: bool,
    flags: Arc<RuntimeFlags>,
    sink: Mutex<FileSink>,
}

fn with_suffix(path: &Path, n: u32) -> PathBuf {
    let mut os = path.to_path_buf().into_os_string();
    os.push(format!(".{}", n));
    PathBuf::from(os)
}

fn open_sink(path: &Path) -> std::io::Result<FileSink> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let written = file.metadata()?.len();
    Ok(FileSink { file, written })
}

impl NcdLogger {
    fn rotate(&self, sink: &mut FileSink) {
        if self.backups == 0 {
            if let Ok(file) = File::create(&self.path) {
                *sink = FileSink { file, written: 0 };
            }
            return;
        }
        // ncd.log -> ncd.log.1 -> ... up to the backup count.
        for n in (1..=self.backups).rev() {
            let from = if n == 1 {
                self.path.clone()
            } else {
                with_suffix(&self.path, n - 1)
            };
            let _ = fs::rename(&from, with_suffix(&self.path, n));
        }
        if let Ok(fresh) = open_sink(&self.path) {
            *sink = fresh;
        }
    }
}

impl Log for NcdLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Debug
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = format!(
            "{}|ncd|{}|{}\n",
            Local::now().format("%Y-%m-%d %H:%M:%S"),
            record.level(),
            record.args()
        );

        let file_level = if self.flags.verbose.load(Ordering::SeqCst) {
            Level::Debug
        } else {
            Level::Info
        };
        if record.level() <= file_level {
            if let Ok(mut sink) = self.sink.lock() {
                if sink.written + line.len() as u64 > self.max_bytes {
                    self.rotate(&mut sink);
                }
                if sink.file.write_all(line.as_bytes()).is_ok() {
                    sink.written += line.len() as u64;
                }
            }
        }

        if !self.quiet && record.level() <= Level::Info {
            println!("{}", record.args());
        }
    }

    fn flush(&self) {
        if let Ok(mut sink) = self.sink.lock() {
            let _ = sink.file.flush();
        }
    }
}

pub fn init(cfg: &Config, quiet: bool, flags: Arc<RuntimeFlags>) -> anyhow::Result<()> {
    if let Some(dir) = cfg.log_file.parent() {
        fs::create_dir_all(dir)?;
    }
    let sink = open_sink(&cfg.log_file)?;
    let logger = NcdLogger {
        path: cfg.log_file.clone(),
        max_bytes: cfg.log_max_kb * 1024,
        backups: cfg.log_max_backup_n,
        quiet,
        flags,
        sink: Mutex::new(sink),
    };
    log::set_boxed_logger(Box::new(logger))?;
    log::set_max_level(LevelFilter::Debug);
    Ok(())
}
