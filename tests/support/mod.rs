// This module is used from multiple different test files, each of which
// gets compiled into its own binary. Not all the binaries use all the
// stuff here.
#![allow(dead_code)]

use std::{
    fs, io,
    os::unix::fs::{MetadataExt as _, PermissionsExt as _},
    path::{Path, PathBuf},
    sync::Mutex,
    time,
};

use anyhow::anyhow;
use nix::{errno::Errno, sys::signal::Signal};

use vm_attach::syscall::Syscalls;

/// Spin with exponential backoff until `pred` says yes.
pub fn wait_until<P>(mut pred: P) -> anyhow::Result<()>
where
    P: FnMut() -> anyhow::Result<bool>,
{
    let mut sleep_dur = time::Duration::from_millis(5);
    for _ in 0..12 {
        if pred()? {
            return Ok(());
        } else {
            std::thread::sleep(sleep_dur);
            sleep_dur *= 2;
        }
    }

    Err(anyhow!("pred never became true"))
}

type SigquitHook = Box<dyn FnMut(i64) + Send>;

/// A syscall surface that keeps signals and semaphores away from the
/// host. File permission and ownership calls hit the real filesystem
/// so the tests can observe their effects.
pub struct MockSyscalls {
    pub pid: u64,
    pub uid: u64,
    /// Pids the existence probe reports as gone.
    pub dead_pids: Vec<i64>,
    /// Invoked whenever a SIGQUIT gets "delivered".
    pub sigquit_hook: Mutex<Option<SigquitHook>>,
    pub kills: Mutex<Vec<(i64, Option<Signal>)>>,
    pub chmods: Mutex<Vec<(PathBuf, u32)>>,
    pub posts: Mutex<Vec<usize>>,
    pub cancels: Mutex<Vec<usize>>,
}

impl MockSyscalls {
    pub fn new(pid: u64, uid: u64) -> Self {
        MockSyscalls {
            pid,
            uid,
            dead_pids: vec![],
            sigquit_hook: Mutex::new(None),
            kills: Mutex::new(vec![]),
            chmods: Mutex::new(vec![]),
            posts: Mutex::new(vec![]),
            cancels: Mutex::new(vec![]),
        }
    }

    /// A mock whose uid matches whoever owns `dir`, which is what the
    /// advertisement scan filters on.
    pub fn for_dir(pid: u64, dir: &Path) -> anyhow::Result<Self> {
        let uid = fs::metadata(dir)?.uid() as u64;
        Ok(MockSyscalls::new(pid, uid))
    }

    pub fn with_dead_pids(mut self, pids: Vec<i64>) -> Self {
        self.dead_pids = pids;
        self
    }

    pub fn on_sigquit<F>(self, hook: F) -> Self
    where
        F: FnMut(i64) + Send + 'static,
    {
        *self.sigquit_hook.lock().unwrap() = Some(Box::new(hook));
        self
    }
}

impl Syscalls for MockSyscalls {
    fn getpid(&self) -> u64 {
        self.pid
    }

    fn getuid(&self) -> u64 {
        self.uid
    }

    fn kill(&self, pid: i64, sig: Option<Signal>) -> Result<(), Errno> {
        self.kills.lock().unwrap().push((pid, sig));
        if self.dead_pids.contains(&pid) {
            return Err(Errno::ESRCH);
        }
        if sig == Some(Signal::SIGQUIT) {
            if let Some(hook) = self.sigquit_hook.lock().unwrap().as_mut() {
                hook(pid);
            }
        }
        Ok(())
    }

    fn chmod(&self, path: &Path, mode: u32) -> io::Result<()> {
        self.chmods.lock().unwrap().push((path.to_path_buf(), mode));
        fs::set_permissions(path, fs::Permissions::from_mode(mode))
    }

    fn file_owner(&self, path: &Path) -> io::Result<u64> {
        Ok(fs::metadata(path)?.uid() as u64)
    }

    fn notify_vm(&self, _dir: &Path, _name: &str, count: usize) -> io::Result<()> {
        self.posts.lock().unwrap().push(count);
        Ok(())
    }

    fn cancel_notify(&self, _dir: &Path, _name: &str, count: usize) -> io::Result<()> {
        self.cancels.lock().unwrap().push(count);
        Ok(())
    }
}
