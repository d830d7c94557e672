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

use std::{env, fs, path::PathBuf, time};

use serde_derive::Deserialize;
use tracing::info;

use crate::{
    consts,
    error::{AttachError, Result},
};

/// Read a config file if one was passed in, otherwise fall back on
/// defaults for everything.
pub fn read_config(config_file: &Option<String>) -> Result<Config> {
    let mut config = Config::default();
    if let Some(config_path) = config_file {
        info!("parsing explicitly passed in config ({})", config_path);
        let config_str = fs::read_to_string(config_path)
            .map_err(|e| AttachError::io(format!("reading config toml ({})", config_path), e))?;
        config = toml::from_str(&config_str).map_err(|e| {
            AttachError::io(
                format!("parsing config file ({})", config_path),
                std::io::Error::new(std::io::ErrorKind::InvalidData, e),
            )
        })?;
    }

    Ok(config)
}

#[derive(Deserialize, Default, Debug, Clone)]
pub struct Config {
    /// The directory where HotSpot VMs create their attach sockets and
    /// where the fallback sentinel file goes. You almost certainly want
    /// to leave this alone; the VM hardcodes /tmp.
    pub tmp_dir: Option<PathBuf>,

    /// The shared advertisement directory OpenJ9 VMs publish themselves
    /// in. When unset, the `com.ibm.tools.attach.directory` environment
    /// variable is consulted before falling back on the default.
    pub advertisement_dir: Option<PathBuf>,

    /// How many times to poll for the HotSpot attach socket before
    /// giving up.
    pub attempts: Option<u32>,

    /// How long to sleep between polls, in milliseconds.
    pub pause_ms: Option<u64>,

    /// How long to wait for the target OpenJ9 VM to dial back on our
    /// rendezvous port, in milliseconds.
    pub accept_timeout_ms: Option<u64>,
}

impl Config {
    pub fn tmp_dir(&self) -> PathBuf {
        self.tmp_dir.clone().unwrap_or_else(|| PathBuf::from(consts::DEFAULT_TMP_DIR))
    }

    /// Resolution order: explicit config, then the environment variable
    /// the VM itself honors, then the compiled-in default.
    pub fn advertisement_dir(&self) -> PathBuf {
        if let Some(dir) = &self.advertisement_dir {
            return dir.clone();
        }
        match env::var(consts::ADVERTISEMENT_DIR_VAR) {
            Ok(dir) => PathBuf::from(dir),
            Err(_) => PathBuf::from(consts::DEFAULT_ADVERTISEMENT_DIR),
        }
    }

    pub fn retry(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.attempts.unwrap_or(consts::DEFAULT_ATTACH_ATTEMPTS),
            pause: self
                .pause_ms
                .map(time::Duration::from_millis)
                .unwrap_or(consts::DEFAULT_ATTACH_PAUSE),
        }
    }

    pub fn accept_timeout(&self) -> time::Duration {
        self.accept_timeout_ms
            .map(time::Duration::from_millis)
            .unwrap_or(consts::DEFAULT_ACCEPT_TIMEOUT)
    }
}

/// How stubbornly to wait for the target VM during the HotSpot
/// signal-and-poll phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub pause: time::Duration,
}

impl RetryPolicy {
    /// The total time the policy is willing to wait, used to report
    /// how long we blocked when the budget runs out.
    pub fn budget(&self) -> time::Duration {
        self.pause * self.attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy { attempts: consts::DEFAULT_ATTACH_ATTEMPTS, pause: consts::DEFAULT_ATTACH_PAUSE }
    }
}
