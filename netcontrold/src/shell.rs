//! Seam to the host: the switch's commands are opaque text producers.

use std::process::Command;

use crate::error::{NcdError, Result};

/// Executes a switch introspection or configuration command and hands back
/// its textual output. Tests inject a scripted implementation. The listener
/// thread shares the implementation with the main loop, hence the bounds.
pub trait Shell: Send + Sync {
    fn exec(&self, cmd: &str) -> Result<String>;
}

/// Runs commands on the host, the way the daemon does in production.
#[derive(Debug, Default)]
pub struct HostShell;

impl Shell for HostShell {
    fn exec(&self, cmd: &str) -> Result<String> {
        let mut parts = cmd.split_whitespace();
        let prog = parts
            .next()
            .ok_or_else(|| NcdError::OsCommand("empty command".into()))?;
        let output = Command::new(prog)
            .args(parts)
            .output()
            .map_err(|e| NcdError::OsCommand(format!("{}: {}", cmd, e)))?;
        if !output.status.success() {
            return Err(NcdError::OsCommand(format!(
                "{}: exited with {}",
                cmd, output.status
            )));
        }
        String::from_utf8(output.stdout)
            .map_err(|e| NcdError::OsCommand(format!("{}: non-utf8 output: {}", cmd, e)))
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_shell_captures_stdout() {
        let shell = HostShell;
        let out = shell.exec("echo hello world").unwrap();
        assert_eq!(out.trim(), "hello world");
    }

    #[test]
    fn host_shell_fails_on_missing_program() {
        let shell = HostShell;
        assert!(matches!(
            shell.exec("ncd-no-such-program-anywhere"),
            Err(NcdError::OsCommand(_))
        ));
    }
}
