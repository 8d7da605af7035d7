//! Child processes run as leaders of their own process group so a timeout
//! can kill everything they started, not only the direct child.

use std::io;

/// Sends `SIGKILL` to the process group led by `pid`.
#[cfg(unix)]
pub(crate) fn kill_group(pid: u32) -> io::Result<()> {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    killpg(Pid::from_raw(pid as i32), Signal::SIGKILL).map_err(io::Error::from)
}

#[cfg(not(unix))]
pub(crate) fn kill_group(_pid: u32) -> io::Result<()> {
    Ok(())
}
