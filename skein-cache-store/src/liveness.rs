use libc::pid_t;
use nix::sys::signal::kill;
use nix::unistd::Pid;

/// PID of this worker process, as stored in the owner/worker columns.
pub fn current_pid() -> pid_t {
    nix::unistd::getpid().as_raw()
}

/// Test whether a process with the given PID is alive on this node.
///
/// Signal 0 probes for existence without touching the target; EPERM means
/// the process exists but belongs to another user. PID reuse on long-lived
/// nodes can make a dead owner look alive again - accepted hazard.
pub fn pid_is_alive(pid: pid_t) -> bool {
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(nix::errno::Errno::EPERM) => true,
        Err(_) => false,
    }
}
