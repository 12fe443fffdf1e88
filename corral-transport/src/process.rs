//! Process utilities: advisory file locking and child-process spawning
//! with piped stdin/stdout.
//!
//! Grounded on `flock.c`'s `flock_open`/`flock_close` (translated onto
//! `nix::fcntl::flock`) and `spawn.c`'s `spawn_t` (`posix_spawn` plus a
//! stdin and a stdout pipe, `spawn_wait`'s drain-then-waitpid sequence,
//! `spawn_running`'s `waitid(..., WNOHANG | WNOWAIT)` peek, and
//! `spawn_gc`'s SIGTERM-then-wait finalizer).

use std::ffi::CString;
use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::os::fd::IntoRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;

use nix::fcntl::{flock, FlockArg};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitid, waitpid, Id, WaitPidFlag, WaitStatus};
use nix::unistd::{close, pipe, Pid};
use tracing::warn;

use crate::error::{Result, TransportError};

/// Current process id, mirroring `parallel_getpid`/`ipc_getpid`.
#[must_use]
pub fn getpid() -> i32 {
    nix::unistd::getpid().as_raw()
}

/// Parent process id, mirroring `parallel_getppid`/`ipc_getppid`.
#[must_use]
pub fn getppid() -> i32 {
    nix::unistd::getppid().as_raw()
}

/// Calling thread id, mirroring `parallel_gettid`'s `(intptr_t)pthread_self()`
/// — there is no portable `pthread_self` equivalent in `std`, so the raw
/// Linux `gettid()` syscall is used directly.
#[must_use]
pub fn gettid() -> i64 {
    unsafe { libc::syscall(libc::SYS_gettid) }
}

/// Forks the calling process, mirroring `parallel_fork`/`ipc_fork`'s bare
/// `fork()` call. `unsafe`: per `nix::unistd::fork`'s own contract, the
/// child process may only call async-signal-safe functions until it
/// `exec`s or exits — anything allocating (including most of `std`) is
/// unsound to run there.
#[allow(unsafe_code)]
pub unsafe fn fork_process() -> Result<nix::unistd::ForkResult> {
    nix::unistd::fork().map_err(|e| TransportError::io(std::io::Error::from(e)))
}

/// Blocks until `pid` exits, mirroring `parallel_waitpid`/`ipc_waitpid`'s
/// loop: keep waiting through stop/continue notifications until the child
/// has actually terminated, then return its exit code (a signal death is
/// reported as `128 + signal number`, matching shell convention and this
/// crate's own [`Spawn::wait`]).
pub fn wait_pid(pid: i32) -> Result<i32> {
    let target = Pid::from_raw(pid);
    loop {
        match waitpid(target, Some(WaitPidFlag::WUNTRACED | WaitPidFlag::WCONTINUED)) {
            Ok(WaitStatus::Exited(_, code)) => return Ok(code),
            Ok(WaitStatus::Signaled(_, sig, _)) => return Ok(128 + sig as i32),
            Ok(_) => continue,
            Err(e) => return Err(TransportError::io(std::io::Error::from(e))),
        }
    }
}

/// An exclusively held advisory lock on a file, held for the life of the
/// value. `flock_open(path, no_block = true)` returns `Ok(None)` rather
/// than blocking when the lock is already held, mirroring the original's
/// "return 0" on `EWOULDBLOCK` (and on `ENOENT`/`EACCES` when blocking).
pub struct FileLock {
    file: std::fs::File,
}

impl FileLock {
    pub fn open(path: impl AsRef<Path>, no_block: bool) -> Result<Option<Self>> {
        let mut options = OpenOptions::new();
        options.read(true).write(true).custom_flags(libc::O_CLOEXEC);
        if !no_block {
            options.create(true);
        }
        let file = match options.mode(0o600).open(path.as_ref()) {
            Ok(file) => file,
            Err(e) if matches!(e.kind(), std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied) => {
                return Ok(None)
            }
            Err(e) => return Err(TransportError::io(e)),
        };

        let lock_flags = if no_block {
            FlockArg::LockExclusiveNonblock
        } else {
            FlockArg::LockExclusive
        };
        if let Err(e) = flock(file.as_raw_fd(), lock_flags) {
            if no_block && e == nix::errno::Errno::EWOULDBLOCK {
                return Ok(None);
            }
            return Err(TransportError::io(std::io::Error::from(e)));
        }
        Ok(Some(Self { file }))
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = flock(self.file.as_raw_fd(), FlockArg::Unlock);
    }
}

/// A `*l`/`*a`/byte-count read mode for [`Spawn::read_stdout`], mirroring
/// `spawn_stdout`'s three argument shapes.
pub enum StdoutRead {
    /// Read one newline-terminated line (newline stripped), or everything
    /// remaining if EOF arrives first.
    Line,
    /// Read until EOF.
    All,
    /// Read up to `n` bytes.
    Bytes(usize),
}

/// A child process launched with its stdin and stdout captured as pipes.
pub struct Spawn {
    pid: Pid,
    stdin_fd: Option<RawFd>,
    stdout_fd: Option<RawFd>,
    waited: bool,
}

impl Spawn {
    /// Spawns `file` with `args` (argv[0] is `file` itself, matching the
    /// original) and `env` (inherits the parent's environment when empty,
    /// matching `spawn_open`'s `envp = environ` fallback).
    pub fn open(file: &str, args: &[String], env: &[String]) -> Result<Self> {
        let (stdin_read, stdin_write) = pipe().map_err(|e| TransportError::io(std::io::Error::from(e)))?;
        let (stdout_read, stdout_write) = pipe().map_err(|e| TransportError::io(std::io::Error::from(e)))?;
        let stdin_read = stdin_read.into_raw_fd();
        let stdin_write = stdin_write.into_raw_fd();
        let stdout_read = stdout_read.into_raw_fd();
        let stdout_write = stdout_write.into_raw_fd();

        let pid = spawn_with_file_actions(file, args, env, stdin_read, stdout_write)?;

        let _ = close(stdin_read);
        let _ = close(stdout_write);

        Ok(Self {
            pid,
            stdin_fd: Some(stdin_write),
            stdout_fd: Some(stdout_read),
            waited: false,
        })
    }

    #[must_use]
    pub fn pid(&self) -> i32 {
        self.pid.as_raw()
    }

    /// Raw fd of the child's stdout pipe's read end, mirroring
    /// `spawn_stdout_file_id` (for an external event loop to `select` on).
    #[must_use]
    pub fn stdout_file_id(&self) -> Option<RawFd> {
        self.stdout_fd
    }

    /// Writes to the child's stdin. Returns an error once stdin has been
    /// closed.
    pub fn write_stdin(&mut self, data: &[u8]) -> Result<()> {
        let fd = self.stdin_fd.ok_or_else(|| TransportError::Other("stdin already closed".into()))?;
        let mut file = fd_as_file(fd);
        let result = file.write_all(data).map_err(TransportError::io);
        std::mem::forget(file);
        result
    }

    /// Closes the child's stdin, signalling EOF to it.
    pub fn close_stdin(&mut self) -> Result<()> {
        if let Some(fd) = self.stdin_fd.take() {
            close(fd).map_err(|e| TransportError::io(std::io::Error::from(e)))?;
        }
        Ok(())
    }

    /// Reads from the child's stdout per `mode`, mirroring `spawn_stdout`.
    /// Returns `Ok(None)` at EOF with nothing left to return.
    pub fn read_stdout(&mut self, mode: StdoutRead) -> Result<Option<Vec<u8>>> {
        let fd = self.stdout_fd.ok_or_else(|| TransportError::Other("stdout already closed".into()))?;
        let mut file = fd_as_file(fd);
        let result = (|| -> Result<Option<Vec<u8>>> {
            match mode {
                StdoutRead::Bytes(n) => {
                    let mut buf = vec![0u8; n];
                    let read = file.read(&mut buf).map_err(TransportError::io)?;
                    if read == 0 {
                        Ok(None)
                    } else {
                        buf.truncate(read);
                        Ok(Some(buf))
                    }
                }
                StdoutRead::Line => {
                    let mut buf = Vec::new();
                    let mut byte = [0u8; 1];
                    loop {
                        let read = file.read(&mut byte).map_err(TransportError::io)?;
                        if read == 0 {
                            return Ok(if buf.is_empty() { None } else { Some(buf) });
                        }
                        if byte[0] == b'\n' {
                            return Ok(Some(buf));
                        }
                        buf.push(byte[0]);
                    }
                }
                StdoutRead::All => {
                    let mut buf = Vec::new();
                    file.read_to_end(&mut buf).map_err(TransportError::io)?;
                    if buf.is_empty() {
                        Ok(None)
                    } else {
                        Ok(Some(buf))
                    }
                }
            }
        })();
        std::mem::forget(file);
        result
    }

    /// Non-blocking liveness check, mirroring `spawn_running`'s
    /// `waitid(..., WNOHANG | WNOWAIT)`: `true` while the child has not yet
    /// exited.
    pub fn running(&self) -> Result<bool> {
        match waitid(Id::Pid(self.pid), WaitPidFlag::WEXITED | WaitPidFlag::WNOHANG | WaitPidFlag::WNOWAIT) {
            Ok(WaitStatus::StillAlive) => Ok(true),
            Ok(_) => Ok(false),
            Err(e) => Err(TransportError::io(std::io::Error::from(e))),
        }
    }

    /// Optionally signals the child, closes its stdin, drains (or
    /// discards, if a signal was sent) its stdout, then blocks until exit,
    /// returning its exit code. Mirrors `spawn_wait` exactly.
    pub fn wait(&mut self, signal: Option<Signal>) -> Result<i32> {
        if let Some(sig) = signal {
            kill(self.pid, sig).map_err(|e| TransportError::io(std::io::Error::from(e)))?;
        }
        self.close_stdin()?;

        if let Some(fd) = self.stdout_fd.take() {
            if signal.is_some() {
                let _ = close(fd);
            } else {
                let mut file = fd_as_file(fd);
                let mut sink = Vec::new();
                let drain = file.read_to_end(&mut sink).map_err(TransportError::io);
                std::mem::forget(file);
                let _ = close(fd);
                drain?;
            }
        }

        loop {
            match waitpid(self.pid, Some(WaitPidFlag::WUNTRACED | WaitPidFlag::WCONTINUED)) {
                Ok(WaitStatus::Exited(_, code)) => {
                    self.waited = true;
                    return Ok(code);
                }
                Ok(WaitStatus::Signaled(_, sig, _)) => {
                    self.waited = true;
                    return Ok(128 + sig as i32);
                }
                Ok(_) => continue,
                Err(e) => return Err(TransportError::io(std::io::Error::from(e))),
            }
        }
    }
}

impl Drop for Spawn {
    fn drop(&mut self) {
        if !self.waited {
            warn!(pid = self.pid(), "spawn dropped before wait was called, sending SIGTERM");
            let _ = self.wait(Some(Signal::SIGTERM));
        }
    }
}

fn fd_as_file(fd: RawFd) -> std::fs::File {
    use std::os::unix::io::FromRawFd;
    unsafe { std::fs::File::from_raw_fd(fd) }
}

/// Isolated `posix_spawn` call: builds the file-actions list (dup the
/// pipe ends onto fds 0/1, close the unused ends) and argv/envp arrays,
/// then spawns. Mirrors `spawn_open`'s `posix_spawn_file_actions_adddup2`/
/// `addclose` sequence and `posix_spawnp` call exactly.
#[allow(unsafe_code)]
fn spawn_with_file_actions(
    file: &str,
    args: &[String],
    env: &[String],
    stdin_read: RawFd,
    stdout_write: RawFd,
) -> Result<Pid> {
    let file_c = CString::new(file).map_err(|e| TransportError::Other(e.to_string()))?;
    let mut argv_c: Vec<CString> = Vec::with_capacity(args.len() + 1);
    argv_c.push(file_c.clone());
    for a in args {
        argv_c.push(CString::new(a.as_str()).map_err(|e| TransportError::Other(e.to_string()))?);
    }
    let mut argv_ptrs: Vec<*mut libc::c_char> = argv_c.iter().map(|s| s.as_ptr() as *mut libc::c_char).collect();
    argv_ptrs.push(std::ptr::null_mut());

    let envp_c: Vec<CString> = env
        .iter()
        .map(|e| CString::new(e.as_str()).map_err(|e| TransportError::Other(e.to_string())))
        .collect::<Result<_>>()?;
    let mut envp_ptrs: Vec<*mut libc::c_char>;
    let use_parent_environ = envp_c.is_empty();
    if use_parent_environ {
        envp_ptrs = Vec::new();
    } else {
        envp_ptrs = envp_c.iter().map(|s| s.as_ptr() as *mut libc::c_char).collect();
        envp_ptrs.push(std::ptr::null_mut());
    }

    unsafe {
        let mut file_actions: libc::posix_spawn_file_actions_t = std::mem::zeroed();
        if libc::posix_spawn_file_actions_init(&mut file_actions) != 0 {
            return Err(TransportError::io(std::io::Error::last_os_error()));
        }
        // Actions apply strictly in order: both pipe ends must be dup2'd
        // onto their target fd *before* the original fd is closed, or the
        // second dup2 would operate on an already-closed descriptor.
        libc::posix_spawn_file_actions_adddup2(&mut file_actions, stdin_read, 0);
        libc::posix_spawn_file_actions_adddup2(&mut file_actions, stdout_write, 1);
        libc::posix_spawn_file_actions_addclose(&mut file_actions, stdin_read);
        libc::posix_spawn_file_actions_addclose(&mut file_actions, stdout_write);

        let mut attr: libc::posix_spawnattr_t = std::mem::zeroed();
        libc::posix_spawnattr_init(&mut attr);

        let mut pid: libc::pid_t = 0;
        let envp_arg = if use_parent_environ {
            libc::environ
        } else {
            envp_ptrs.as_mut_ptr()
        };
        let ret = libc::posix_spawnp(
            &mut pid,
            file_c.as_ptr(),
            &file_actions,
            &attr,
            argv_ptrs.as_mut_ptr(),
            envp_arg,
        );

        libc::posix_spawn_file_actions_destroy(&mut file_actions);
        libc::posix_spawnattr_destroy(&mut attr);

        if ret != 0 {
            return Err(TransportError::io(std::io::Error::from_raw_os_error(ret)));
        }
        Ok(Pid::from_raw(pid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn getpid_matches_std_process_id() {
        assert_eq!(getpid() as u32, std::process::id());
    }

    #[test]
    fn getppid_is_nonzero() {
        assert!(getppid() > 0);
    }

        #[test]
    fn spawns_true_and_waits_for_zero_exit() {
        let mut spawn = Spawn::open("true", &[], &[]).unwrap();
        let code = spawn.wait(None).unwrap();
        assert_eq!(code, 0);
    }

    #[test]
    fn captures_stdout_line() {
        let mut spawn = Spawn::open("echo", &["hello".to_string()], &[]).unwrap();
        let line = spawn.read_stdout(StdoutRead::Line).unwrap();
        assert_eq!(line, Some(b"hello".to_vec()));
        spawn.wait(None).unwrap();
    }

    #[test]
    fn flock_open_nonblock_returns_none_on_contention() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("corral-transport-flock-test-{}", std::process::id()));
        let _first = FileLock::open(&path, false).unwrap().expect("first lock succeeds");
        let second = FileLock::open(&path, true).unwrap();
        assert!(second.is_none());
        let _ = std::fs::remove_file(&path);
    }
}
