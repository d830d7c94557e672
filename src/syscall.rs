// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

/*! The capability surface the attachers need from the host OS.

Everything that touches another process or a shared kernel object goes
through the [`Syscalls`] trait so that tests can substitute a mock and
drive the handshakes hermetically. Plain file and socket I/O stays on
std; only the operations with cross-process side effects live here.
*/

use std::{
    ffi::CString,
    io,
    os::unix::ffi::OsStrExt as _,
    path::Path,
};

use nix::{
    errno::Errno,
    sys::{signal, stat},
    unistd::{self, Pid},
};
use tracing::debug;

pub trait Syscalls: Send + Sync {
    fn getpid(&self) -> u64;

    fn getuid(&self) -> u64;

    /// Deliver `sig` to `pid`. Passing `None` performs the classic
    /// existence probe (signal 0).
    fn kill(&self, pid: i64, sig: Option<signal::Signal>) -> Result<(), Errno>;

    /// An ESRCH from the probe is the one definitive "that process is
    /// gone" answer; every other outcome (including EPERM) means the
    /// pid is still in use.
    fn process_exists(&self, pid: i64) -> bool {
        !matches!(self.kill(pid, None), Err(Errno::ESRCH))
    }

    fn chmod(&self, path: &Path, mode: u32) -> io::Result<()>;

    /// The uid owning `path`, from stat.
    fn file_owner(&self, path: &Path) -> io::Result<u64>;

    /// Post `count` times on the named semaphore peers wait on, waking
    /// every advertised VM so it can check for a fresh replyInfo.
    fn notify_vm(&self, dir: &Path, name: &str, count: usize) -> io::Result<()>;

    /// Undo up to `count` posts that nobody consumed.
    fn cancel_notify(&self, dir: &Path, name: &str, count: usize) -> io::Result<()>;
}

/// The live implementation, bound to the host C library.
#[derive(Debug, Default, Clone, Copy)]
pub struct LibcSyscalls;

impl Syscalls for LibcSyscalls {
    fn getpid(&self) -> u64 {
        unistd::getpid().as_raw() as u64
    }

    fn getuid(&self) -> u64 {
        unistd::getuid().as_raw() as u64
    }

    fn kill(&self, pid: i64, sig: Option<signal::Signal>) -> Result<(), Errno> {
        signal::kill(Pid::from_raw(pid as libc::pid_t), sig)
    }

    fn chmod(&self, path: &Path, mode: u32) -> io::Result<()> {
        let cpath = cstring_path(path)?;
        // Safety: pure ffi, cpath is a valid NUL terminated string.
        let rc = unsafe { libc::chmod(cpath.as_ptr(), mode as libc::mode_t) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn file_owner(&self, path: &Path) -> io::Result<u64> {
        let st = stat::stat(path).map_err(io::Error::from)?;
        Ok(st.st_uid as u64)
    }

    fn notify_vm(&self, dir: &Path, name: &str, count: usize) -> io::Result<()> {
        let sem = NamedSemaphore::open(dir, name)?;
        for _ in 0..count {
            sem.post()?;
        }
        debug!("posted {} times on {}", count, name);
        Ok(())
    }

    fn cancel_notify(&self, dir: &Path, name: &str, count: usize) -> io::Result<()> {
        let sem = NamedSemaphore::open(dir, name)?;
        let mut undone = 0;
        for _ in 0..count {
            // Stop early once the count drains; a peer that woke up and
            // consumed its post is not an error.
            if !sem.try_wait()? {
                break;
            }
            undone += 1;
        }
        debug!("cancelled {} of {} posts on {}", undone, count, name);
        Ok(())
    }
}

/// A POSIX named semaphore handle. Named semaphores share a single flat
/// kernel namespace, so the name is derived from the advertisement
/// directory path to keep independent directories independent.
struct NamedSemaphore {
    sem: *mut libc::sem_t,
}

impl NamedSemaphore {
    fn open(dir: &Path, name: &str) -> io::Result<NamedSemaphore> {
        let sem_name = semaphore_name(dir, name);
        let csem_name = CString::new(sem_name)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        // Safety: pure ffi, csem_name is a valid NUL terminated string
        //         and the varargs match the O_CREAT contract.
        let sem = unsafe {
            libc::sem_open(
                csem_name.as_ptr(),
                libc::O_CREAT,
                0o666 as libc::c_uint,
                0 as libc::c_uint,
            )
        };
        if sem == libc::SEM_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(NamedSemaphore { sem })
    }

    fn post(&self) -> io::Result<()> {
        // Safety: self.sem was returned by a successful sem_open.
        let rc = unsafe { libc::sem_post(self.sem) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Returns false if the semaphore count was already zero.
    fn try_wait(&self) -> io::Result<bool> {
        // Safety: self.sem was returned by a successful sem_open.
        let rc = unsafe { libc::sem_trywait(self.sem) };
        if rc == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EAGAIN) {
            return Ok(false);
        }
        Err(err)
    }
}

impl Drop for NamedSemaphore {
    fn drop(&mut self) {
        // Safety: self.sem was returned by a successful sem_open and is
        //         closed exactly once.
        unsafe {
            libc::sem_close(self.sem);
        }
    }
}

/// Project `<dir>/<name>` into the global semaphore namespace: one
/// leading slash, every other non-alphanumeric byte folded to '_'.
fn semaphore_name(dir: &Path, name: &str) -> String {
    let mut out = String::with_capacity(dir.as_os_str().len() + name.len() + 2);
    out.push('/');
    for b in dir.as_os_str().as_bytes().iter().chain(name.as_bytes()) {
        if b.is_ascii_alphanumeric() {
            out.push(*b as char);
        } else {
            out.push('_');
        }
    }
    out
}

fn cstring_path(path: &Path) -> io::Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}
