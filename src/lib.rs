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

/*! vm-attach attaches to a running JVM and asks it to load an
instrumentation agent.

Two handshakes are supported: the HotSpot flavor (sentinel file plus
SIGQUIT plus a unix domain socket) and the OpenJ9 flavor (a shared
advertisement directory, file locks, a semaphore, and a tcp loopback
rendezvous). Both produce a [`VirtualMachine`] session exposing
`load_agent`, `load_agent_path`, and `detach`.

```no_run
use vm_attach::{AttachTarget, Config, VirtualMachine, VmFamily};

let target: AttachTarget = "1234".parse()?;
let mut vm = VirtualMachine::attach(VmFamily::HotSpot, target, &Config::default())?;
vm.load_agent("/opt/agents/profiler.jar", Some("sample-rate=100"))?;
vm.detach()?;
# Ok::<(), Box<dyn std::error::Error>>(())
```

This crate is POSIX only and never starts, discovers, or validates
anything; the caller brings a pid and an agent path, and the host OS
brings the access control.
*/

mod cleanup;
mod config;
mod conn;
mod consts;
mod error;
mod hotspot;
mod openj9;
pub mod syscall;
mod vm;

pub use config::{read_config, Config, RetryPolicy};
pub use consts::ADVERTISEMENT_DIR_VAR;
pub use error::{AttachError, Result};
pub use vm::{AttachTarget, VirtualMachine, VmFamily};
