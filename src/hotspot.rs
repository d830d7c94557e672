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

/*! The HotSpot attach handshake.

HotSpot VMs open a unix domain socket at `<tmp>/.java_pid<pid>`, but
only after seeing both a sentinel file and a SIGQUIT. The dance is:
drop the sentinel, poke the VM, poll for the socket, connect, and
always clean the sentinel back up.
*/

use std::{
    fs::{self, OpenOptions},
    io::{Read, Write},
    os::unix::net::UnixStream,
    path::{Path, PathBuf},
    sync::Arc,
    thread,
};

use nix::sys::signal::Signal;
use tracing::{debug, info, warn};

use crate::{
    cleanup,
    config::RetryPolicy,
    conn::{self, Connection},
    consts,
    error::{AttachError, Result},
    syscall::Syscalls,
    vm::AttachTarget,
};

pub struct HotSpotAttacher {
    target: AttachTarget,
    tmp_dir: PathBuf,
    retry: RetryPolicy,
    syscalls: Arc<dyn Syscalls>,
}

impl HotSpotAttacher {
    pub fn new(
        target: AttachTarget,
        tmp_dir: PathBuf,
        retry: RetryPolicy,
        syscalls: Arc<dyn Syscalls>,
    ) -> Self {
        HotSpotAttacher { target, tmp_dir, retry, syscalls }
    }

    /// Run the handshake and hand back the connected socket.
    pub fn attach(&self) -> Result<Connection> {
        let socket_path =
            self.tmp_dir.join(format!("{}{}", consts::HOTSPOT_SOCKET_PREFIX, self.target));
        info!("attaching to hotspot vm {} via {:?}", self.target, socket_path);

        if !socket_path.exists() {
            let sentinel = self.create_sentinel()?;
            let result = self.signal_and_wait(&socket_path);
            // The sentinel has served its purpose the moment the socket
            // exists (or the attempt is dead); it must never outlive
            // this call.
            if let Err(e) = fs::remove_file(&sentinel) {
                warn!("could not remove sentinel {:?}: {}", sentinel, e);
                cleanup::schedule_delete(&sentinel);
            }
            result?;
        } else {
            debug!("attach socket already present, skipping signal");
        }

        let stream = UnixStream::connect(&socket_path).map_err(AttachError::ConnectFailed)?;
        info!("connected to hotspot vm {}", self.target);
        Ok(Connection::Unix(stream))
    }

    /// Drop a zero length sentinel file where the VM will look for it:
    /// its own working directory if we can write there, the shared tmp
    /// directory otherwise.
    fn create_sentinel(&self) -> Result<PathBuf> {
        let name = format!("{}{}", consts::HOTSPOT_SENTINEL_PREFIX, self.target);
        let cwd_path = PathBuf::from(format!("/proc/{}/cwd", self.target)).join(&name);
        match touch(&cwd_path) {
            Ok(()) => {
                debug!("created sentinel {:?}", cwd_path);
                return Ok(cwd_path);
            }
            Err(e) => {
                debug!("no sentinel in target cwd ({}), falling back to tmp", e);
            }
        }

        let tmp_path = self.tmp_dir.join(&name);
        match touch(&tmp_path) {
            Ok(()) => {
                debug!("created sentinel {:?}", tmp_path);
                Ok(tmp_path)
            }
            Err(e) => Err(AttachError::SentinelCreate(e)),
        }
    }

    fn signal_and_wait(&self, socket_path: &Path) -> Result<()> {
        let pid = self.target.pid();
        self.syscalls
            .kill(pid, Some(Signal::SIGQUIT))
            .map_err(|errno| AttachError::SignalFailed { pid, errno })?;
        debug!("sent SIGQUIT to {}", pid);

        for attempt in 0..self.retry.attempts {
            if socket_path.exists() {
                debug!("attach socket appeared after {} polls", attempt);
                return Ok(());
            }
            thread::sleep(self.retry.pause);
        }

        if socket_path.exists() {
            return Ok(());
        }
        Err(AttachError::TargetUnresponsive { waited: self.retry.budget() })
    }
}

/// Create `path` as an empty regular file. Losing the creation race to
/// another attacher is fine; the sentinel just has to exist.
fn touch(path: &Path) -> std::io::Result<()> {
    match OpenOptions::new().write(true).create(true).open(path) {
        Ok(_) => Ok(()),
        Err(e) => {
            if path.is_file() {
                return Ok(());
            }
            Err(e)
        }
    }
}

/// Write one load command: five NUL terminated utf-8 fields.
pub fn write_load_command<W: Write>(
    w: &mut W,
    path: &str,
    arg: Option<&str>,
    native: bool,
) -> Result<()> {
    let payload = match arg {
        Some(arg) => format!("{}={}", path, arg),
        None => String::from(path),
    };
    conn::write_nul_terminated(w, consts::HOTSPOT_PROTOCOL_VERSION)?;
    conn::write_nul_terminated(w, consts::HOTSPOT_LOAD_COMMAND)?;
    conn::write_nul_terminated(w, consts::HOTSPOT_INSTRUMENT_MODULE)?;
    conn::write_nul_terminated(w, if native { "true" } else { "false" })?;
    conn::write_nul_terminated(w, &payload)?;
    w.flush().map_err(|e| AttachError::io("flushing load command", e))?;
    Ok(())
}

/// Parse the decimal status line the VM answers with, slurping the
/// trailing explanation on errors.
pub fn read_load_reply<R: Read>(r: &mut R) -> Result<()> {
    let status_line = conn::read_line(r)?;
    let code: i32 = match status_line.trim().parse() {
        Ok(code) => code,
        Err(_) => {
            return Err(AttachError::UnexpectedResponse { payload: status_line });
        }
    };

    match code {
        0 => Ok(()),
        consts::HOTSPOT_BAD_VERSION => Err(AttachError::ProtocolMismatch),
        _ => {
            let message = conn::read_remainder(r)?;
            Err(AttachError::AgentRejected { message: message.trim_end().to_string() })
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn load_command_framing() {
        let cases = vec![
            (
                "/a.jar",
                Some("opt=1"),
                false,
                "1\0load\0instrument\0false\0/a.jar=opt=1\0",
            ),
            ("/a.jar", None, false, "1\0load\0instrument\0false\0/a.jar\0"),
            ("/lib/agent.so", None, true, "1\0load\0instrument\0true\0/lib/agent.so\0"),
            (
                "/lib/agent.so",
                Some("verbose"),
                true,
                "1\0load\0instrument\0true\0/lib/agent.so=verbose\0",
            ),
        ];

        for (path, arg, native, want) in cases {
            let mut buf = Vec::new();
            write_load_command(&mut buf, path, arg, native).expect("write to succeed");
            assert_eq!(buf, want.as_bytes(), "path={} arg={:?}", path, arg);
        }
    }

    #[test]
    fn reply_success() {
        let mut cursor = Cursor::new(b"0\n".to_vec());
        read_load_reply(&mut cursor).expect("0 to mean success");
    }

    #[test]
    fn reply_protocol_mismatch() {
        let mut cursor = Cursor::new(b"101\n".to_vec());
        match read_load_reply(&mut cursor) {
            Err(AttachError::ProtocolMismatch) => {}
            other => panic!("expected ProtocolMismatch, got {:?}", other),
        }
    }

    #[test]
    fn reply_agent_rejected_carries_message() {
        let mut cursor = Cursor::new(b"102\nagent failed to start\n".to_vec());
        match read_load_reply(&mut cursor) {
            Err(AttachError::AgentRejected { message }) => {
                assert_eq!(message, "agent failed to start");
            }
            other => panic!("expected AgentRejected, got {:?}", other),
        }
    }

    #[test]
    fn reply_garbage_is_unexpected_response() {
        let mut cursor = Cursor::new(b"who knows\n".to_vec());
        match read_load_reply(&mut cursor) {
            Err(AttachError::UnexpectedResponse { payload }) => {
                assert_eq!(payload, "who knows");
            }
            other => panic!("expected UnexpectedResponse, got {:?}", other),
        }
    }

    #[test]
    fn touch_tolerates_existing_file() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("sentinel");
        touch(&path).expect("first touch");
        touch(&path).expect("second touch");
        assert!(path.is_file());
    }
}
