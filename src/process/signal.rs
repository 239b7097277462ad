//! Signals and liveness probes for tracked children.
//!
//! Children are spawned as process-group leaders, so their pid doubles as the
//! group id and a signal reaches every helper they forked (mpv, sox, the TTS
//! pipeline).

use std::fmt;

/// Signals an operator may request through `audio.stop`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    Term,
    Int,
    Hup,
    Kill,
}

impl StopSignal {
    /// Parse `TERM`, `SIGTERM`, `term`, and the same forms of the others.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        let upper = raw.trim().to_ascii_uppercase();
        match upper.strip_prefix("SIG").unwrap_or(&upper) {
            "TERM" => Some(Self::Term),
            "INT" => Some(Self::Int),
            "HUP" => Some(Self::Hup),
            "KILL" => Some(Self::Kill),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_raw(self) -> libc::c_int {
        match self {
            Self::Term => libc::SIGTERM,
            Self::Int => libc::SIGINT,
            Self::Hup => libc::SIGHUP,
            Self::Kill => libc::SIGKILL,
        }
    }
}

impl fmt::Display for StopSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Term => "TERM",
            Self::Int => "INT",
            Self::Hup => "HUP",
            Self::Kill => "KILL",
        };
        f.write_str(label)
    }
}

/// Send `signal` to the process group led by `pid`, falling back to the pid
/// alone when no such group exists.
///
/// Returns `false` when neither target exists any more.
pub fn send(pid: u32, signal: StopSignal) -> std::io::Result<bool> {
    let Ok(raw_pid) = libc::pid_t::try_from(pid) else {
        return Ok(false);
    };
    if raw_pid <= 1 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("refusing to signal pid {pid}"),
        ));
    }

    // SAFETY: killpg/kill have no memory-safety preconditions.
    if unsafe { libc::killpg(raw_pid, signal.as_raw()) } == 0 {
        return Ok(true);
    }
    // SAFETY: as above.
    if unsafe { libc::kill(raw_pid, signal.as_raw()) } == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(false)
    } else {
        Err(err)
    }
}

/// Returns `true` while `pid` exists and is not a zombie.
#[must_use]
pub fn is_alive(pid: u32) -> bool {
    let Ok(raw_pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if raw_pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 only probes for existence.
    let exists = unsafe { libc::kill(raw_pid, 0) } == 0
        || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM);
    exists && !is_zombie(pid)
}

/// Zombie check via `/proc/<pid>/stat`. Unknown counts as not a zombie.
fn is_zombie(pid: u32) -> bool {
    let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
        return false;
    };
    // The command name may contain spaces or parens; the state follows the last ')'.
    stat.rfind(')')
        .and_then(|idx| stat[idx + 1..].split_whitespace().next())
        .is_some_and(|state| state == "Z")
}
