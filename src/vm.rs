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

/*! The client facing facade.

A [`VirtualMachine`] is one attached session. It dispatches the three
operations onto whichever handshake produced the session and otherwise
adds no logic of its own. Sessions are strictly request/response: one
command, one reply, no pipelining, and no sharing across threads
without external locking.
*/

use std::{fmt, num::ParseIntError, str::FromStr, sync::Arc};

use tracing::info;

use crate::{
    config::Config,
    conn::Connection,
    error::{AttachError, Result},
    hotspot::{self, HotSpotAttacher},
    openj9::{self, OpenJ9Attacher},
    syscall::{LibcSyscalls, Syscalls},
};

/// The pid of the VM to attach to, kept as the decimal string it gets
/// used as on the filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachTarget(String);

impl AttachTarget {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn pid(&self) -> i64 {
        // construction guarantees a valid decimal
        self.0.parse().unwrap_or(0)
    }
}

impl From<u32> for AttachTarget {
    fn from(pid: u32) -> Self {
        AttachTarget(pid.to_string())
    }
}

impl FromStr for AttachTarget {
    type Err = ParseIntError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim();
        s.parse::<u32>()?;
        Ok(AttachTarget(String::from(s)))
    }
}

impl fmt::Display for AttachTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which attach handshake the target VM speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmFamily {
    HotSpot,
    OpenJ9,
}

/// One attached session, tagged with the protocol its connection
/// speaks.
enum Session {
    HotSpot(Connection),
    OpenJ9(Connection),
}

pub struct VirtualMachine {
    // None once detached
    session: Option<Session>,
}

impl VirtualMachine {
    /// Attach using the live syscall surface.
    pub fn attach(family: VmFamily, target: AttachTarget, config: &Config) -> Result<Self> {
        Self::attach_with(family, target, config, Arc::new(LibcSyscalls))
    }

    /// Attach with an injected syscall surface. This is the seam tests
    /// use to keep signals and semaphores away from the host.
    pub fn attach_with(
        family: VmFamily,
        target: AttachTarget,
        config: &Config,
        syscalls: Arc<dyn Syscalls>,
    ) -> Result<Self> {
        let session = match family {
            VmFamily::HotSpot => {
                let attacher =
                    HotSpotAttacher::new(target, config.tmp_dir(), config.retry(), syscalls);
                Session::HotSpot(attacher.attach()?)
            }
            VmFamily::OpenJ9 => {
                let attacher = OpenJ9Attacher::new(
                    target,
                    config.advertisement_dir(),
                    config.accept_timeout(),
                    syscalls,
                );
                Session::OpenJ9(attacher.attach()?)
            }
        };

        Ok(VirtualMachine { session: Some(session) })
    }

    /// Ask the target to load a bytecode instrumentation agent from a
    /// jar file.
    pub fn load_agent(&mut self, jar_path: &str, arg: Option<&str>) -> Result<()> {
        info!("loading agent {} (arg: {:?})", jar_path, arg);
        match self.session_mut()? {
            Session::HotSpot(conn) => {
                hotspot::write_load_command(conn, jar_path, arg, false)?;
                hotspot::read_load_reply(conn)
            }
            Session::OpenJ9(conn) => {
                openj9::write_load_agent(conn, jar_path, arg)?;
                openj9::read_command_reply(conn)
            }
        }
    }

    /// Ask the target to load a native agent library.
    pub fn load_agent_path(&mut self, library_path: &str, arg: Option<&str>) -> Result<()> {
        info!("loading native agent {} (arg: {:?})", library_path, arg);
        match self.session_mut()? {
            Session::HotSpot(conn) => {
                hotspot::write_load_command(conn, library_path, arg, true)?;
                hotspot::read_load_reply(conn)
            }
            Session::OpenJ9(conn) => {
                openj9::write_load_agent_path(conn, library_path, arg)?;
                openj9::read_command_reply(conn)
            }
        }
    }

    /// End the session. Calling detach twice is fine; calling anything
    /// else afterwards reports `AlreadyDetached`.
    pub fn detach(&mut self) -> Result<()> {
        let session = match self.session.take() {
            Some(session) => session,
            None => return Ok(()),
        };

        match session {
            Session::HotSpot(conn) => {
                conn.shutdown();
            }
            Session::OpenJ9(mut conn) => {
                // Best effort goodbye; the socket closes regardless.
                if let Err(e) = openj9::write_detach(&mut conn) {
                    info!("detach handshake failed: {}", e);
                }
                conn.shutdown();
            }
        }
        info!("detached");
        Ok(())
    }

    fn session_mut(&mut self) -> Result<&mut Session> {
        self.session.as_mut().ok_or(AttachError::AlreadyDetached)
    }

    /// Wrap an already connected endpoint. Used by tests to drive the
    /// command protocol over a socketpair.
    #[cfg(test)]
    fn from_parts(family: VmFamily, conn: Connection) -> Self {
        let session = match family {
            VmFamily::HotSpot => Session::HotSpot(conn),
            VmFamily::OpenJ9 => Session::OpenJ9(conn),
        };
        VirtualMachine { session: Some(session) }
    }
}

impl Drop for VirtualMachine {
    fn drop(&mut self) {
        // A dropped session still closes its socket; the explicit
        // detach path just adds the protocol goodbye.
        if let Some(Session::HotSpot(conn) | Session::OpenJ9(conn)) = &self.session {
            conn.shutdown();
        }
    }
}
