//! C3: task supervisor (spec.md §4.3). Races newly spawned threads against
//! enumeration, grounded on the original's `process_info::attach_all` /
//! `stop_all` / `resume_all` / `sync_thread_status` (process_info.cc).

use std::collections::HashMap;

use nix::unistd::Pid;

use crate::debug;
use crate::error::{DynhookError, Result};
use crate::proc::snapshot_tasks;

/// `{tid, state}` — spec.md §3.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadState {
    Running,
    Stopped,
}

#[derive(Clone, Copy, Debug)]
pub struct ThreadDescriptor {
    pub tid: Pid,
    pub state: ThreadState,
}

/// All managed tids for one target process group.
#[derive(Default)]
pub struct TaskSupervisor {
    threads: HashMap<Pid, ThreadDescriptor>,
}

impl TaskSupervisor {
    pub fn new() -> Self {
        TaskSupervisor::default()
    }

    pub fn get(&self, tid: Pid) -> Option<&ThreadDescriptor> {
        self.threads.get(&tid)
    }

    pub fn attached(&self) -> impl Iterator<Item = &ThreadDescriptor> {
        self.threads.values()
    }

    /// Any currently Stopped tid — used by the remote invoker (spec.md §4.5),
    /// which is content to hijack whichever stopped thread it is handed.
    pub fn any_stopped(&self) -> Option<Pid> {
        self.threads
            .values()
            .find(|t| t.state == ThreadState::Stopped)
            .map(|t| t.tid)
    }

    /// Attach to every tid in the target's task group, racing newly spawned
    /// threads until two consecutive snapshots add nothing new (spec.md
    /// §4.3 steps 1-5).
    pub fn attach_all(&mut self, pid: Pid) -> Result<()> {
        loop {
            let snapshot = snapshot_tasks(pid)?;
            let new: Vec<Pid> = snapshot
                .iter()
                .copied()
                .filter(|tid| !self.threads.contains_key(tid))
                .collect();

            if new.is_empty() {
                self.reconcile(&snapshot);
                return Ok(());
            }

            for tid in new {
                debug::attach_and_wait(tid)?;
                self.threads.insert(
                    tid,
                    ThreadDescriptor {
                        tid,
                        state: ThreadState::Stopped,
                    },
                );
            }
        }
    }

    /// Drop any attached tid no longer present in `snapshot` — a thread may
    /// have exited between our attach and this reconciliation.
    fn reconcile(&mut self, snapshot: &[Pid]) {
        self.threads.retain(|tid, _| snapshot.contains(tid));
    }

    /// Stop every Running tid, then re-run the attach loop to pick up races
    /// (spec.md §4.3 `stop_all`).
    pub fn stop_all(&mut self, pid: Pid) -> Result<()> {
        let running: Vec<Pid> = self
            .threads
            .values()
            .filter(|t| t.state == ThreadState::Running)
            .map(|t| t.tid)
            .collect();
        for tid in running {
            self.stop_one(tid)?;
        }
        self.attach_all(pid)
    }

    fn stop_one(&mut self, tid: Pid) -> Result<()> {
        debug::stop(tid)?;
        debug::wait_for(tid)?;
        if let Some(t) = self.threads.get_mut(&tid) {
            t.state = ThreadState::Stopped;
        }
        Ok(())
    }

    /// Transition every Stopped descriptor to Running (spec.md §4.3
    /// `resume_all`).
    pub fn resume_all(&mut self) -> Result<()> {
        let stopped: Vec<Pid> = self
            .threads
            .values()
            .filter(|t| t.state == ThreadState::Stopped)
            .map(|t| t.tid)
            .collect();
        for tid in stopped {
            debug::cont(tid)?;
            if let Some(t) = self.threads.get_mut(&tid) {
                t.state = ThreadState::Running;
            }
        }
        Ok(())
    }

    /// Continue one Stopped tid and wait for its next stop.
    pub fn resume_and_wait(&mut self, tid: Pid) -> Result<()> {
        match self.threads.get(&tid) {
            None => Err(DynhookError::DebugIo { errno: libc::ESRCH }),
            Some(t) if t.state == ThreadState::Running => {
                Err(DynhookError::DebugIo { errno: libc::EINVAL })
            }
            Some(_) => {
                debug::cont_and_wait(tid)?;
                Ok(())
            }
        }
    }

    /// Stop a single descriptor, failing if absent or already Stopped
    /// (spec.md §4.3 `stop_thread`: "operate on one descriptor, failing if
    /// it is absent or already in the requested state" — symmetric with
    /// `resume_and_wait`'s already-Running check below).
    pub fn stop_thread(&mut self, tid: Pid) -> Result<()> {
        match self.threads.get(&tid).map(|t| t.state) {
            None => Err(DynhookError::DebugIo { errno: libc::ESRCH }),
            Some(ThreadState::Stopped) => Err(DynhookError::DebugIo { errno: libc::EINVAL }),
            Some(ThreadState::Running) => self.stop_one(tid),
        }
    }
}
