//! Symbolic signal name resolution.

use std::str::FromStr;

use nix::sys::signal::Signal;

use crate::error::Kube2lbError;

/// Resolve a POSIX signal name (`SIGHUP`, `SIGUSR1`, ...) to the host signal.
pub fn signal_from_name(name: &str) -> Result<Signal, Kube2lbError> {
    Signal::from_str(name).map_err(|_| Kube2lbError::UnknownSignal(name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_signal_names_resolve() {
        assert_eq!(signal_from_name("SIGTERM").unwrap(), Signal::SIGTERM);
        assert_eq!(signal_from_name("SIGHUP").unwrap(), Signal::SIGHUP);
        assert_eq!(signal_from_name("SIGUSR1").unwrap(), Signal::SIGUSR1);
    }

    #[test]
    fn unknown_signal_names_fail() {
        for name in ["SIGNOPE", "TERM", "", "sigterm"] {
            match signal_from_name(name) {
                Err(Kube2lbError::UnknownSignal(n)) => assert_eq!(n, name),
                other => panic!("expected UnknownSignal for {name:?}, got {other:?}"),
            }
        }
    }
}
