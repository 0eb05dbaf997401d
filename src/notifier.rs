//! Reload triggers for the downstream load balancer.
//!
//! A notifier is declared on the command line as `kind:payload` and fired
//! after every configuration render. The receiving process is in charge of
//! making the reload idempotent; failures here are transient and the update
//! cycle goes on.

use std::path::PathBuf;
use std::process::Stdio;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::Kube2lbError;
use crate::signals::signal_from_name;

/// A parsed notifier definition.
#[derive(Debug, Clone)]
pub enum Notifier {
    /// `pid:SIGNAL:PID` — deliver SIGNAL to PID.
    Pid { pid: i32, signal: Signal },
    /// `pidfile:SIGNAL:PATH` — read the pid from PATH, deliver SIGNAL to it.
    Pidfile { path: PathBuf, signal: Signal },
    /// `command:COMMAND` — run COMMAND through `/bin/sh -c`.
    Command { command: String },
    /// `debug:` — just log.
    Debug,
}

impl Notifier {
    /// Parse a `kind:payload` notifier definition.
    pub fn parse(definition: &str) -> Result<Self, Kube2lbError> {
        let invalid = |message: &str| {
            Kube2lbError::NotifierDefinition(definition.to_string(), message.to_string())
        };
        let (kind, payload) = definition
            .split_once(':')
            .ok_or_else(|| invalid("notifier definition expected"))?;
        match kind {
            "command" => Ok(Notifier::Command {
                command: payload.to_string(),
            }),
            "pid" => {
                let (signal, pid) = payload
                    .split_once(':')
                    .ok_or_else(|| invalid("expected pid:SIGNAL:PID"))?;
                let signal = signal_from_name(signal)?;
                let pid = pid
                    .parse()
                    .map_err(|_| invalid("PID is not an integer"))?;
                Ok(Notifier::Pid { pid, signal })
            }
            "pidfile" => {
                let (signal, path) = payload
                    .split_once(':')
                    .ok_or_else(|| invalid("expected pidfile:SIGNAL:PIDFILE"))?;
                let signal = signal_from_name(signal)?;
                Ok(Notifier::Pidfile {
                    path: PathBuf::from(path),
                    signal,
                })
            }
            "debug" => Ok(Notifier::Debug),
            _ => Err(invalid("unknown notifier kind")),
        }
    }

    /// Trigger the reload. The token bounds the command variant; signal
    /// delivery is instantaneous.
    pub async fn notify(&self, token: &CancellationToken) -> Result<(), Kube2lbError> {
        match self {
            Notifier::Pid { pid, signal } => send_signal(*pid, *signal),
            Notifier::Pidfile { path, signal } => {
                let contents = tokio::fs::read_to_string(path).await?;
                let pid = contents
                    .trim_matches(['\n', '\t', ' '])
                    .parse()
                    .map_err(|_| {
                        Kube2lbError::Notify(format!(
                            "pidfile {} doesn't contain a pid",
                            path.display()
                        ))
                    })?;
                send_signal(pid, *signal)
            }
            Notifier::Command { command } => run_command(command, token).await,
            Notifier::Debug => {
                info!("Notify");
                Ok(())
            }
        }
    }
}

fn send_signal(pid: i32, signal: Signal) -> Result<(), Kube2lbError> {
    debug!(pid, signal = %signal, "signaling process");
    kill(Pid::from_raw(pid), signal)
        .map_err(|e| Kube2lbError::Notify(format!("couldn't signal pid {pid}: {e}")))
}

async fn run_command(command: &str, token: &CancellationToken) -> Result<(), Kube2lbError> {
    let child = Command::new("/bin/sh")
        .arg("-c")
        .arg(command)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let output = tokio::select! {
        output = child.wait_with_output() => output?,
        () = token.cancelled() => {
            return Err(Kube2lbError::Notify(format!(
                "notify command '{command}' cancelled"
            )));
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    info!(%stdout, %stderr, "notify command output");

    if output.status.success() {
        Ok(())
    } else {
        Err(Kube2lbError::Notify(format!(
            "notify command '{command}' exited with {}",
            output.status
        )))
    }
}
