// Copyright 2024 Google LLC
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

/*! Files we could not delete right away.

The target VM sometimes still holds a sentinel or replyInfo open at the
moment we want it gone. Rather than fail the attach over cleanup, such
paths land in a process-wide registry that gets drained at orderly
shutdown.
*/

use std::{
    fs,
    path::{Path, PathBuf},
    sync::{Mutex, Once},
};

use tracing::{info, warn};

lazy_static::lazy_static! {
    static ref DELETE_ON_EXIT: Mutex<Vec<PathBuf>> = Mutex::new(vec![]);
}

static INSTALL_HOOK: Once = Once::new();

/// Register `path` for deletion when the process exits.
pub fn schedule_delete<P: AsRef<Path>>(path: P) {
    INSTALL_HOOK.call_once(|| {
        // Safety: pure ffi, drain_at_exit is a plain extern "C" fn with
        //         no unwinding.
        unsafe {
            libc::atexit(drain_at_exit);
        }
    });

    let path = path.as_ref().to_path_buf();
    info!("scheduling {:?} for deletion at exit", path);
    let mut registry = DELETE_ON_EXIT.lock().unwrap();
    registry.push(path);
}

/// Attempt every pending deletion now. Failures stay failed; by the
/// time this runs there is nobody left to report them to.
pub fn drain() {
    let mut registry = DELETE_ON_EXIT.lock().unwrap();
    for path in registry.drain(..) {
        if let Err(e) = fs::remove_file(&path) {
            warn!("could not remove {:?} at exit: {}", path, e);
        }
    }
}

extern "C" fn drain_at_exit() {
    drain();
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn drain_removes_scheduled_files() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("leftover");
        fs::write(&path, b"").expect("creating file");

        schedule_delete(&path);
        drain();

        assert!(!path.exists());
    }

    #[test]
    fn drain_tolerates_missing_files() {
        schedule_delete("/definitely/not/a/real/path");
        // must not panic
        drain();
    }
}
