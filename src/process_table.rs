//! pid → job handle, for SIGCHLD-driven lookup.

use std::collections::HashMap;

use crate::job::JobId;

pub struct ProcessTable {
    map: HashMap<libc::pid_t, JobId>,
}

impl ProcessTable {
    pub fn new() -> Self {
        ProcessTable {
            map: HashMap::with_capacity(crate::config::PROCESS_TABLE_CAPACITY),
        }
    }

    pub fn insert(&mut self, pid: libc::pid_t, job_id: JobId) {
        self.map.insert(pid, job_id);
    }

    /// A reap that finds no mapping (an orphaned grandchild reparented to the
    /// worker) is silently dropped by the caller; this just returns `None`.
    pub fn get(&self, pid: libc::pid_t) -> Option<JobId> {
        self.map.get(&pid).copied()
    }

    pub fn remove(&mut self, pid: libc::pid_t) -> Option<JobId> {
        self.map.remove(&pid)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}
