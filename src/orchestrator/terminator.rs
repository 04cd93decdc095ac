//! Process tree terminator.
//!
//! Stops a process and every descendant it had when termination started.
//! Descendants are signalled first, all at once, and given one shared grace
//! period; survivors are killed. Only then is the root signalled, given its
//! own grace period, and killed if needed. A descendant is therefore never
//! orphaned by its parent dying mid-teardown.
//!
//! The descendant list is a single snapshot: processes spawned after it is
//! taken are not tracked. On unix, [`terminate_group`] sweeps up processes
//! left in the dev server's process group after its root has exited, since
//! by then they are no longer reachable through the parent map.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, System};
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::{AppError, Result};

/// How often outstanding processes are re-checked while waiting.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How long a forcefully killed process may take to disappear before the
/// kill is reported as failed.
pub const KILL_CONFIRM_TIMEOUT: Duration = Duration::from_secs(2);

/// Signal sent to a process during teardown.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum TeardownSignal {
    Terminate,
    Kill,
}

/// A process identified by pid and start time, so a recycled pid is never
/// mistaken for the original.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct TrackedProcess {
    pid: Pid,
    start_time: u64,
}

impl TrackedProcess {
    /// Process id.
    #[must_use]
    pub fn pid(&self) -> u32 {
        self.pid.as_u32()
    }
}

/// Point-in-time view of a root process and its recursive descendants.
#[derive(Debug, Clone)]
pub struct ProcessSnapshot {
    root: TrackedProcess,
    descendants: Vec<TrackedProcess>,
}

impl ProcessSnapshot {
    /// Capture `pid` and its live descendants.
    ///
    /// Returns `None` if `pid` is not a running process.
    #[must_use]
    pub fn capture(pid: u32) -> Option<Self> {
        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::All, true);
        Self::from_system(&system, Pid::from_u32(pid))
    }

    fn from_system(system: &System, root_pid: Pid) -> Option<Self> {
        let root = system.process(root_pid).filter(|p| is_live(p))?;
        let root = TrackedProcess {
            pid: root_pid,
            start_time: root.start_time(),
        };

        let mut children: HashMap<Pid, Vec<Pid>> = HashMap::new();
        for (pid, process) in system.processes() {
            if process.thread_kind().is_some() {
                continue;
            }
            if let Some(parent) = process.parent() {
                children.entry(parent).or_default().push(*pid);
            }
        }

        let mut descendants = Vec::new();
        let mut seen = HashSet::from([root_pid]);
        let mut queue = VecDeque::from([root_pid]);
        while let Some(current) = queue.pop_front() {
            for child in children.get(&current).into_iter().flatten() {
                if !seen.insert(*child) {
                    continue;
                }
                queue.push_back(*child);
                if let Some(process) = system.process(*child).filter(|p| is_live(p)) {
                    descendants.push(TrackedProcess {
                        pid: *child,
                        start_time: process.start_time(),
                    });
                }
            }
        }

        Some(Self { root, descendants })
    }

    /// Root process of the tree.
    #[must_use]
    pub fn root(&self) -> TrackedProcess {
        self.root
    }

    /// Descendants captured at snapshot time, breadth-first.
    #[must_use]
    pub fn descendants(&self) -> &[TrackedProcess] {
        &self.descendants
    }
}

/// Whether `pid` is currently a running (non-zombie) process.
#[must_use]
pub fn is_running(pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    system.process(pid).is_some_and(is_live)
}

/// Terminate `pid` and all of its descendants, escalating to a forceful
/// kill after each grace period.
///
/// Returns `Ok(false)` without doing anything if `pid` is not running, so
/// the call is idempotent. Returns `Ok(true)` if any process had to be
/// forcefully killed. Worst case wall-clock time is
/// `children_grace + process_grace`, plus [`KILL_CONFIRM_TIMEOUT`] per
/// escalation phase.
///
/// # Errors
///
/// Returns `AppError::Termination` if a signal cannot be delivered for a
/// reason other than the process being gone, or if a process is still
/// alive after being killed.
pub async fn terminate_tree(
    pid: u32,
    children_grace: Duration,
    process_grace: Duration,
) -> Result<bool> {
    let span = info_span!("terminate_tree", pid);
    terminate(pid, children_grace, process_grace)
        .instrument(span)
        .await
}

async fn terminate(pid: u32, children_grace: Duration, process_grace: Duration) -> Result<bool> {
    let mut table = ProcessTable::new();
    let Some(snapshot) = ProcessSnapshot::capture(pid) else {
        debug!("process is not running; nothing to terminate");
        return Ok(false);
    };

    let mut killed = false;

    if !snapshot.descendants.is_empty() {
        info!(
            descendants = snapshot.descendants.len(),
            "terminating descendant processes"
        );
        killed |= stop_group(&mut table, &snapshot.descendants, children_grace).await?;
    }

    info!("terminating root process");
    killed |= stop_group(&mut table, &[snapshot.root], process_grace).await?;

    info!(killed, "process tree terminated");
    Ok(killed)
}

/// Gracefully signal every live member of `group`, wait up to `grace` for
/// all of them together, then kill whatever is left.
async fn stop_group(
    table: &mut ProcessTable,
    group: &[TrackedProcess],
    grace: Duration,
) -> Result<bool> {
    let live = table.alive(group);
    for process in &live {
        table.signal(*process, TeardownSignal::Terminate)?;
    }

    let survivors = wait_for_exit(table, live, grace).await;
    if survivors.is_empty() {
        return Ok(false);
    }

    for process in &survivors {
        warn!(
            pid = process.pid(),
            grace_ms = grace.as_millis(),
            "process ignored graceful termination; killing"
        );
        table.signal(*process, TeardownSignal::Kill)?;
    }

    let stubborn = wait_for_exit(table, survivors, KILL_CONFIRM_TIMEOUT).await;
    if let Some(process) = stubborn.first() {
        return Err(AppError::Termination(format!(
            "pid {} is still alive after SIGKILL",
            process.pid()
        )));
    }

    Ok(true)
}

/// Poll `pending` until every process is gone or `grace` elapses, returning
/// the ones still alive.
async fn wait_for_exit(
    table: &mut ProcessTable,
    mut pending: Vec<TrackedProcess>,
    grace: Duration,
) -> Vec<TrackedProcess> {
    // A grace period too large to represent as an instant never expires.
    let deadline = Instant::now().checked_add(grace);
    loop {
        pending = table.alive(&pending);
        if pending.is_empty() {
            return pending;
        }
        let remaining = deadline.map_or(EXIT_POLL_INTERVAL, |deadline| {
            deadline.saturating_duration_since(Instant::now())
        });
        if remaining.is_zero() {
            return pending;
        }
        tokio::time::sleep(EXIT_POLL_INTERVAL.min(remaining)).await;
    }
}

/// Terminate every live process whose process group is `pgid`.
///
/// Used once the group leader has exited: its descendants were reparented
/// and can only be found by group. Members get SIGTERM, share one `grace`
/// period, and are killed if they outlive it. Returns `Ok(true)` if any had
/// to be killed, and `Ok(false)` if the group was already empty.
///
/// # Errors
///
/// Returns `AppError::Termination` if a member survives SIGKILL.
#[cfg(unix)]
pub async fn terminate_group(pgid: u32, grace: Duration) -> Result<bool> {
    let span = info_span!("terminate_group", pgid);
    async {
        let members = group_members(pgid);
        if members.is_empty() {
            debug!("process group is empty");
            return Ok(false);
        }

        info!(members = members.len(), "terminating leftover process group members");
        let mut table = ProcessTable::new();
        stop_group(&mut table, &members, grace).await
    }
    .instrument(span)
    .await
}

/// Live, non-thread processes currently in process group `pgid`.
#[cfg(unix)]
fn group_members(pgid: u32) -> Vec<TrackedProcess> {
    use nix::unistd::{getpgid, Pid as RawPid};

    let Ok(pgid) = i32::try_from(pgid) else {
        return Vec::new();
    };

    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);
    system
        .processes()
        .iter()
        .filter(|(_, process)| process.thread_kind().is_none() && is_live(process))
        .filter_map(|(pid, process)| {
            let raw = i32::try_from(pid.as_u32()).ok()?;
            let group = getpgid(Some(RawPid::from_raw(raw))).ok()?;
            (group.as_raw() == pgid).then(|| TrackedProcess {
                pid: *pid,
                start_time: process.start_time(),
            })
        })
        .collect()
}

fn is_live(process: &sysinfo::Process) -> bool {
    !matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead)
}

/// Reusable process table used to re-check liveness and deliver signals.
struct ProcessTable {
    system: System,
}

impl ProcessTable {
    fn new() -> Self {
        Self {
            system: System::new(),
        }
    }

    /// Members of `group` that are still the same live process.
    fn alive(&mut self, group: &[TrackedProcess]) -> Vec<TrackedProcess> {
        if group.is_empty() {
            return Vec::new();
        }
        let pids: Vec<Pid> = group.iter().map(|p| p.pid).collect();
        self.system
            .refresh_processes(ProcessesToUpdate::Some(&pids), true);
        group
            .iter()
            .copied()
            .filter(|tracked| {
                self.system
                    .process(tracked.pid)
                    .is_some_and(|p| is_live(p) && p.start_time() == tracked.start_time)
            })
            .collect()
    }

    #[cfg(unix)]
    #[allow(clippy::unused_self)]
    fn signal(&self, target: TrackedProcess, signal: TeardownSignal) -> Result<()> {
        use nix::errno::Errno;
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid as RawPid;

        let raw = i32::try_from(target.pid()).map_err(|_| {
            AppError::Termination(format!("pid {} does not fit a signal target", target.pid()))
        })?;
        let signal = match signal {
            TeardownSignal::Terminate => Signal::SIGTERM,
            TeardownSignal::Kill => Signal::SIGKILL,
        };

        match kill(RawPid::from_raw(raw), signal) {
            Ok(()) => {
                debug!(pid = raw, %signal, "signal sent");
                Ok(())
            }
            Err(Errno::ESRCH) => {
                debug!(pid = raw, %signal, "process already gone");
                Ok(())
            }
            Err(err) => Err(AppError::Termination(format!(
                "failed to send {signal} to pid {raw}: {err}"
            ))),
        }
    }

    #[cfg(not(unix))]
    fn signal(&self, target: TrackedProcess, signal: TeardownSignal) -> Result<()> {
        let Some(process) = self.system.process(target.pid) else {
            return Ok(());
        };
        let delivered = match signal {
            TeardownSignal::Terminate => process
                .kill_with(sysinfo::Signal::Term)
                .unwrap_or_else(|| process.kill()),
            TeardownSignal::Kill => process.kill(),
        };
        if delivered {
            debug!(pid = target.pid(), ?signal, "signal sent");
            Ok(())
        } else {
            Err(AppError::Termination(format!(
                "failed to deliver {signal:?} to pid {}",
                target.pid()
            )))
        }
    }
}
