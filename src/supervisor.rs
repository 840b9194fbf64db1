use crate::{error::OperationError, stack::CloneStack};
use anyhow::{Context, Result, bail};
use nix::{
    errno::Errno,
    sched::{CloneFlags, clone},
    sys::{
        signal::{Signal, kill},
        wait::{WaitPidFlag, WaitStatus, wait, waitpid},
    },
    unistd::{ForkResult, Pid, fork},
};
use std::{cell::Cell, process};
use tracing::{debug, warn};

const DEFAULT_STACK_SIZE: usize = 1024 * 1024;
const MIN_STACK_SIZE: usize = 64 * 1024;

pub struct SupervisorBuilder {
    stack_bytes: usize,
}

impl SupervisorBuilder {
    pub fn new() -> Self {
        Self {
            stack_bytes: DEFAULT_STACK_SIZE,
        }
    }

    pub fn with_stack_size(mut self, stack_size: usize) -> Self {
        self.stack_bytes = stack_size;
        self
    }

    pub fn build(self) -> Result<Supervisor> {
        if self.stack_bytes < MIN_STACK_SIZE {
            bail!(
                "stack size {} is below the minimum of {} bytes",
                self.stack_bytes,
                MIN_STACK_SIZE
            );
        }

        Ok(Supervisor {
            stack_bytes: self.stack_bytes,
        })
    }
}

impl Default for SupervisorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Starts the sandboxed child and relays its exit status.
///
/// Namespaces are unshared by the caller before [`Supervisor::spawn`], so
/// the child is the first process of the new pid namespace.
pub struct Supervisor {
    stack_bytes: usize,
}

impl Supervisor {
    /// Runs `child` in a new process and returns a handle to it. The value
    /// `child` returns becomes the exit status of that process.
    pub fn spawn<F>(&self, child: F) -> Result<SandboxProcess>
    where
        F: FnOnce() -> i32,
    {
        let mut stack = CloneStack::new(self.stack_bytes)?;

        let mut child = Some(child);
        let callback = Box::new(move || child.take().map_or(1, |child| child()) as isize);

        // SAFETY:
        // - No CLONE_VM: the child runs on its own copy of the address space,
        //   stack included, so unmapping `stack` here after the call is fine.
        // - rootbox is single threaded at this point, so no lock can be held
        //   by a thread that does not exist in the child.
        let pid = unsafe {
            clone(
                callback,
                stack.as_mut_slice(),
                CloneFlags::empty(),
                Some(Signal::SIGCHLD as i32),
            )
        }
        .context("Failed to clone sandbox process")?;

        debug!(%pid, "spawned sandbox process");
        Ok(SandboxProcess::new(pid))
    }
}

pub struct SandboxProcess {
    pid: Pid,
    waited: Cell<bool>,
}

impl SandboxProcess {
    #[inline]
    fn new(pid: Pid) -> Self {
        Self {
            pid,
            waited: Cell::new(false),
        }
    }

    #[inline]
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Blocks until the process terminates and returns its status as an
    /// exit code: the code it exited with, or 128 + signal number.
    pub fn wait(&self) -> Result<i32> {
        loop {
            match waitpid(self.pid, None) {
                Err(Errno::EINTR) => continue,
                Err(errno) => {
                    return Err(errno)
                        .with_context(|| format!("Failed to wait for process {}", self.pid));
                }
                Ok(status) => {
                    if let Some(code) = exit_code_of(status) {
                        self.waited.set(true);
                        debug!(pid = %self.pid, code, "sandbox process finished");
                        return Ok(code);
                    }
                }
            }
        }
    }

    fn try_wait(&self) -> Result<Option<i32>> {
        let status = waitpid(self.pid, Some(WaitPidFlag::WNOHANG))
            .with_context(|| format!("Failed to check status of process {}", self.pid))?;

        let code = exit_code_of(status);
        if code.is_some() {
            self.waited.set(true);
        }
        Ok(code)
    }
}

impl Drop for SandboxProcess {
    fn drop(&mut self) {
        if self.waited.get() {
            return;
        }

        match self.try_wait() {
            Ok(Some(code)) => debug!(pid = %self.pid, code, "reaped sandbox process on drop"),
            Ok(None) => {
                warn!(pid = %self.pid, "sandbox process still running on drop, killing it");
                if kill(self.pid, Signal::SIGKILL).is_ok() {
                    let _ = waitpid(self.pid, None);
                }
            }
            Err(error) => warn!(pid = %self.pid, "{error:#}"),
        }
    }
}

/// Exit code for a terminal wait status, `None` for anything else.
pub fn exit_code_of(status: WaitStatus) -> Option<i32> {
    match status {
        WaitStatus::Exited(_, code) => Some(code),
        WaitStatus::Signaled(_, signal, _) => Some(128 + signal as i32),
        _ => None,
    }
}

/// Acts as init for `worker`: forks it, then reaps every child until the
/// worker itself is gone, and returns the worker's exit code.
///
/// Orphans of the pid namespace are reparented to its first process, which
/// is the caller here.
pub fn run_as_init<F>(worker: F) -> i32
where
    F: FnOnce() -> i32,
{
    // SAFETY: called in the freshly cloned, single threaded sandbox process.
    match unsafe { fork() } {
        Ok(ForkResult::Child) => process::exit(worker()),
        Ok(ForkResult::Parent { child }) => reap_until(child),
        Err(errno) => {
            eprintln!("rootbox: {}", OperationError::new("fork", errno));
            errno as i32
        }
    }
}

fn reap_until(worker: Pid) -> i32 {
    loop {
        match wait() {
            Ok(status) if status.pid() == Some(worker) => {
                if let Some(code) = exit_code_of(status) {
                    return code;
                }
            }
            Ok(status) => debug!(?status, "reaped orphan"),
            Err(Errno::EINTR) => continue,
            Err(errno) => {
                eprintln!("rootbox: {}", OperationError::new("wait", errno));
                return errno as i32;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::in_child;
    use nix::unistd::getpid;

    fn supervisor() -> Supervisor {
        SupervisorBuilder::new().build().unwrap()
    }

    #[test]
    fn test_exit_code_is_relayed() {
        let process = supervisor().spawn(|| 7).unwrap();
        assert_eq!(process.wait().unwrap(), 7);
    }

    #[test]
    fn test_signal_death_is_relayed() {
        let process = supervisor()
            .spawn(|| {
                let _ = kill(getpid(), Signal::SIGKILL);
                0
            })
            .unwrap();

        assert_eq!(process.wait().unwrap(), 128 + Signal::SIGKILL as i32);
    }

    #[test]
    fn test_child_sees_captured_state() {
        let expected = String::from("sandbox");
        let process = supervisor()
            .spawn(|| if expected == "sandbox" { 0 } else { 1 })
            .unwrap();

        assert_eq!(process.wait().unwrap(), 0);
    }

    #[test]
    fn test_stack_size_minimum() {
        assert!(SupervisorBuilder::new().with_stack_size(4096).build().is_err());
    }

    #[test]
    fn test_init_returns_worker_status_and_reaps_orphans() {
        let code = in_child(|| {
            run_as_init(|| {
                match unsafe { fork() } {
                    Ok(ForkResult::Child) => unsafe { nix::libc::_exit(9) },
                    Ok(ForkResult::Parent { .. }) => 3,
                    Err(_) => 1,
                }
            })
        });
        assert_eq!(code, 3);
    }
}
