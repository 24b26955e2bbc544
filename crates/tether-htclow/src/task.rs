use std::sync::Arc;

use slab::Slab;
use tether_utils::{ClearMode, Event};
use tether_wire::ChannelId;

use crate::error::ChannelError;

/// Bound on concurrently tracked operations across all channels.
const MAX_TASKS: usize = 0x80;

#[derive(Clone, Copy, Debug)]
pub(crate) enum TaskKind {
    Connect,
    /// Completes when the channel has handed `watermark` queued bytes to the
    /// carrier.
    Send { watermark: u64 },
    Flush { watermark: u64 },
    /// Completes when at least `min` bytes are buffered (0 = immediately).
    Receive { min: usize },
    WaitReceive { target: usize },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum TaskState {
    InProgress,
    Complete(Result<(), ChannelError>),
    Canceled,
}

pub(crate) struct Task {
    pub channel: ChannelId,
    pub kind: TaskKind,
    pub state: TaskState,
    #[allow(dead_code)]
    pub priority: u8,
    pub event: Arc<Event>,
}

#[derive(Default)]
pub(crate) struct TaskTable {
    slab: Slab<Task>,
}

impl TaskTable {
    pub fn begin(
        &mut self,
        channel: ChannelId,
        kind: TaskKind,
        priority: u8,
    ) -> Result<u32, ChannelError> {
        if self.slab.len() >= MAX_TASKS {
            return Err(ChannelError::TaskQueueNotAvailable);
        }
        let id = self.slab.insert(Task {
            channel,
            kind,
            state: TaskState::InProgress,
            priority,
            event: Arc::new(Event::new(ClearMode::Manual)),
        });
        Ok(id as u32)
    }

    pub fn get(&self, id: u32) -> Option<&Task> {
        self.slab.get(id as usize)
    }

    pub fn event(&self, id: u32) -> Option<Arc<Event>> {
        self.slab.get(id as usize).map(|t| t.event.clone())
    }

    pub fn complete(&mut self, id: u32, result: Result<(), ChannelError>) {
        if let Some(task) = self.slab.get_mut(id as usize) {
            if task.state == TaskState::InProgress {
                task.state = TaskState::Complete(result);
                task.event.signal();
            }
        }
    }

    pub fn cancel(&mut self, id: u32) {
        if let Some(task) = self.slab.get_mut(id as usize) {
            if task.state == TaskState::InProgress {
                task.state = TaskState::Canceled;
                task.event.signal();
            }
        }
    }

    /// Consumes a finished task. Ending a task that is still in progress
    /// cancels it (the waiter gave up).
    pub fn end(&mut self, id: u32) -> Result<(ChannelId, Result<(), ChannelError>), ChannelError> {
        if !self.slab.contains(id as usize) {
            return Err(ChannelError::InvalidArgument);
        }
        let task = self.slab.remove(id as usize);
        let result = match task.state {
            TaskState::Complete(r) => r,
            TaskState::InProgress | TaskState::Canceled => Err(ChannelError::ChannelWaitCancelled),
        };
        Ok((task.channel, result))
    }

    pub fn ids_for_channel(&self, channel: ChannelId) -> Vec<u32> {
        self.slab
            .iter()
            .filter(|(_, t)| t.channel == channel && t.state == TaskState::InProgress)
            .map(|(id, _)| id as u32)
            .collect()
    }

    pub fn in_progress_ids(&self) -> Vec<u32> {
        self.slab
            .iter()
            .filter(|(_, t)| t.state == TaskState::InProgress)
            .map(|(id, _)| id as u32)
            .collect()
    }
}

#[cfg(test)]
mod test {
    use tether_wire::ModuleId;

    use super::*;

    #[test]
    fn lifecycle() {
        let mut table = TaskTable::default();
        let ch = ChannelId::new(ModuleId::Htcfs, 0);
        let id = table.begin(ch, TaskKind::Connect, 0).unwrap();
        assert!(!table.event(id).unwrap().try_wait());

        table.complete(id, Ok(()));
        assert!(table.event(id).unwrap().try_wait());
        assert_eq!(table.end(id).unwrap(), (ch, Ok(())));
        assert!(table.end(id).is_err());
    }

    #[test]
    fn ending_in_progress_counts_as_cancelled() {
        let mut table = TaskTable::default();
        let ch = ChannelId::new(ModuleId::Htcs, 1);
        let id = table.begin(ch, TaskKind::Receive { min: 1 }, 0).unwrap();
        assert_eq!(table.end(id).unwrap().1, Err(ChannelError::ChannelWaitCancelled));
    }

    #[test]
    fn table_bound() {
        let mut table = TaskTable::default();
        let ch = ChannelId::new(ModuleId::Htcfs, 0);
        for _ in 0..MAX_TASKS {
            table.begin(ch, TaskKind::Connect, 0).unwrap();
        }
        assert_eq!(
            table.begin(ch, TaskKind::Connect, 0),
            Err(ChannelError::TaskQueueNotAvailable)
        );
    }
}
