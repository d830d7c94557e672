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

/*! The error surface of the attach client.

Every variant is fatal to the operation that produced it. The attachers
never retry internally beyond the explicit retry policy, and they never
swallow an error except during best-effort cleanup, which is logged and
ignored.
*/

use std::{io, time};

use thiserror::Error;

pub type Result<T> = std::result::Result<T, AttachError>;

#[derive(Debug, Error)]
pub enum AttachError {
    /// Attach only works on POSIX hosts. This variant is never produced
    /// by this build of the crate, but hosts embedding the taxonomy on
    /// other platforms report it.
    #[error("attaching to a virtual machine is not supported on this platform")]
    UnsupportedPlatform,

    #[error("could not create a sentinel file in either location")]
    SentinelCreate(#[source] io::Error),

    #[error("could not deliver SIGQUIT to process {pid}: {errno}")]
    SignalFailed { pid: i64, errno: nix::errno::Errno },

    /// The wait budget ran out before the target VM produced its side
    /// of the rendezvous (the HotSpot attach socket, or the OpenJ9
    /// inbound connection).
    #[error("target process did not respond within {waited:?}")]
    TargetUnresponsive { waited: time::Duration },

    #[error("could not connect to the attach endpoint")]
    ConnectFailed(#[source] io::Error),

    /// HotSpot replied with code 101: it does not speak our protocol
    /// version.
    #[error("target speaks an incompatible attach protocol version")]
    ProtocolMismatch,

    /// The target accepted the connection but refused to load the agent.
    #[error("target rejected the agent: {message}")]
    AgentRejected { message: String },

    #[error("unexpected reply from target: {payload:?}")]
    UnexpectedResponse { payload: String },

    /// No attachInfo advertisement exists for the requested pid.
    #[error("process {pid} is not advertised in the attach directory")]
    TargetNotAdvertised { pid: String },

    /// A peer dialed our rendezvous port without presenting the nonce
    /// we published, so it cannot be the target VM.
    #[error("rendezvous peer did not present the expected nonce")]
    NonceMismatch,

    #[error("session is already detached")]
    AlreadyDetached,

    /// A write to the attach connection could not be completed.
    #[error("short write on attach connection")]
    IoShort,

    #[error("i/o error: {context}")]
    Io {
        context: String,
        #[source]
        cause: io::Error,
    },
}

impl AttachError {
    /// Wrap an io::Error the way the rest of the crate reports syscall
    /// level failures, tagging it with what we were doing at the time.
    pub(crate) fn io(context: impl Into<String>, cause: io::Error) -> Self {
        AttachError::Io { context: context.into(), cause }
    }
}
