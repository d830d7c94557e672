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

use std::time;

// HotSpot creates its attach socket at <tmp>/.java_pid<pid> once it has
// seen the sentinel file and a SIGQUIT.
pub const HOTSPOT_SOCKET_PREFIX: &str = ".java_pid";
pub const HOTSPOT_SENTINEL_PREFIX: &str = ".attach_pid";

// The HotSpot attach protocol speaks this version only.
pub const HOTSPOT_PROTOCOL_VERSION: &str = "1";
pub const HOTSPOT_LOAD_COMMAND: &str = "load";
pub const HOTSPOT_INSTRUMENT_MODULE: &str = "instrument";

// Reply code HotSpot sends when it does not understand our protocol version.
pub const HOTSPOT_BAD_VERSION: i32 = 101;

// Environment variable overriding the OpenJ9 advertisement directory.
// The dotted name mirrors the system property the VM itself reads.
pub const ADVERTISEMENT_DIR_VAR: &str = "com.ibm.tools.attach.directory";
pub const DEFAULT_ADVERTISEMENT_DIR: &str = "/tmp/.com_ibm_tools_attach";
pub const DEFAULT_TMP_DIR: &str = "/tmp";

// Coordination files at the top of the advertisement directory.
pub const ATTACH_LOCK_FILE: &str = "_attachlock";
pub const MASTER_LOCK_FILE: &str = "_master";
pub const NOTIFIER_NAME: &str = "_notifier";
pub const SYNC_FILE_NAME: &str = "attachNotificationSync";

// Files inside a single VM's advertisement subdirectory.
pub const ATTACH_INFO_FILE: &str = "attachInfo";
pub const REPLY_INFO_FILE: &str = "replyInfo";

// Subdirectories mid-deletion are renamed with this prefix by the VMs
// themselves; they do not count as notifiable peers.
pub const TRASH_PREFIX: &str = ".trash_";

pub const OPENJ9_LOADAGENT_PREFIX: &str = "ATTACH_LOADAGENT(instrument,";
pub const OPENJ9_LOADAGENTPATH_PREFIX: &str = "ATTACH_LOADAGENTPATH(";
pub const OPENJ9_DETACH: &str = "ATTACH_DETACH";
pub const OPENJ9_ERR_PREFIX: &str = "ATTACH_ERR";
pub const OPENJ9_ACK_PREFIX: &str = "ATTACH_ACK";
pub const OPENJ9_RESULT_PREFIX: &str = "ATTACH_RESULT=";

pub const DEFAULT_ATTACH_ATTEMPTS: u32 = 10;
pub const DEFAULT_ATTACH_PAUSE: time::Duration = time::Duration::from_millis(200);
pub const DEFAULT_ACCEPT_TIMEOUT: time::Duration = time::Duration::from_millis(5000);

// Granularity of the accept polling loop for the OpenJ9 rendezvous.
pub const ACCEPT_POLL_DURATION: time::Duration = time::Duration::from_millis(10);
