use std::thread::JoinHandle;

#[cfg(target_os = "linux")]
use libc::{SCHED_FIFO, sched_param, sched_setscheduler};
use tracing::warn;

/// Any variant other than `OsDefault` requests `SCHED_FIFO` realtime
/// scheduling if the process has permission (CAP_SYS_NICE).
/// If setting the policy fails, execution continues under the OS default.
#[derive(Clone, Copy, Debug)]
pub enum ThreadPriority {
    OsDefault,
    Low,
    Medium,
    High,
}

#[cfg(target_os = "linux")]
impl ThreadPriority {
    fn to_sched_param(self) -> Option<sched_param> {
        let prio = match self {
            ThreadPriority::OsDefault => return None,
            ThreadPriority::Low => 40,
            ThreadPriority::Medium => 60,
            ThreadPriority::High => 75,
        };
        Some(sched_param { sched_priority: prio })
    }
}

#[cfg(target_os = "linux")]
fn set_thread_prio(prio: ThreadPriority) {
    if let Some(param) = prio.to_sched_param() {
        unsafe {
            let code = sched_setscheduler(0, SCHED_FIFO, &param);
            if code != 0 {
                warn!(%code, ?param, "couldn't set thread priority");
            }
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn set_thread_prio(prio: ThreadPriority) {
    if !matches!(prio, ThreadPriority::OsDefault) {
        warn!(?prio, "thread priority setting only supported on linux");
    }
}

/// Spawns a named worker thread, applying the priority hint before `f` runs.
pub fn spawn_named<F, T>(name: &str, prio: ThreadPriority, f: F) -> std::io::Result<JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    std::thread::Builder::new().name(name.to_owned()).spawn(move || {
        set_thread_prio(prio);
        f()
    })
}
