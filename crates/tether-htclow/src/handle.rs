use std::sync::Arc;

use tether_utils::Event;
use tether_wire::ChannelId;

use crate::{
    channel::{ChannelConfig, ChannelState, ReceiveOption},
    error::ChannelError,
    manager::HtclowManager,
};

/// Blocking consumer facade over a manager channel. Each operation runs the
/// begin/wait/end dance against the manager's task table.
pub struct Channel {
    manager: Arc<HtclowManager>,
    id: ChannelId,
}

impl Channel {
    pub fn new(manager: Arc<HtclowManager>, id: ChannelId) -> Self {
        Self { manager, id }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn open(&self) -> Result<(), ChannelError> {
        self.manager.open(self.id)
    }

    pub fn close(&self) {
        let _ = self.manager.close(self.id);
    }

    pub fn set_config(&self, config: ChannelConfig) -> Result<(), ChannelError> {
        self.manager.set_config(self.id, config)
    }

    pub fn set_send_buffer_size(&self, size: usize) -> Result<(), ChannelError> {
        self.manager.set_send_buffer_size(self.id, size)
    }

    pub fn set_receive_buffer_size(&self, size: usize) -> Result<(), ChannelError> {
        self.manager.set_receive_buffer_size(self.id, size)
    }

    pub fn set_send_buffer_with_data(&self, data: &[u8]) -> Result<(), ChannelError> {
        self.manager.set_send_buffer_with_data(self.id, data)
    }

    pub fn state(&self) -> Result<ChannelState, ChannelError> {
        self.manager.get_channel_state(self.id)
    }

    pub fn state_event(&self) -> Result<Arc<Event>, ChannelError> {
        self.manager.get_channel_state_event(self.id)
    }

    fn wait_task(&self, task_id: u32) -> Result<(), ChannelError> {
        self.manager.get_task_event(task_id)?.wait();
        Ok(())
    }

    pub fn connect(&self) -> Result<(), ChannelError> {
        let task_id = self.manager.connect_begin(self.id)?;
        self.wait_task(task_id)?;
        self.manager.connect_end(self.id, task_id)
    }

    pub fn shutdown(&self) {
        let _ = self.manager.shutdown(self.id);
    }

    pub fn flush(&self) -> Result<(), ChannelError> {
        let task_id = self.manager.flush_begin(self.id)?;
        self.wait_task(task_id)?;
        self.manager.flush_end(task_id)
    }

    /// Sends the whole buffer, looping over ring capacity. Returns the byte
    /// count actually delivered; an error on the very first round surfaces,
    /// later errors truncate.
    pub fn send(&self, src: &[u8]) -> Result<usize, ChannelError> {
        let mut total = 0;
        while total < src.len() {
            let (task_id, accepted) = match self.manager.send_begin(self.id, &src[total..]) {
                Ok(begun) => begun,
                Err(e) if total == 0 => return Err(e),
                Err(_) => break,
            };
            self.wait_task(task_id)?;
            self.manager.send_end(task_id)?;
            total += accepted;
        }
        Ok(total)
    }

    /// Receives according to `option`: `NonBlocking` fails on an empty
    /// buffer, `Any` blocks for at least one byte, `All` blocks for the
    /// whole of `dst`.
    pub fn receive(&self, dst: &mut [u8], option: ReceiveOption) -> Result<usize, ChannelError> {
        let min = match option {
            ReceiveOption::NonBlocking => 0,
            ReceiveOption::Any => 1,
            ReceiveOption::All => dst.len(),
        };
        let blocking = option != ReceiveOption::NonBlocking;

        let mut received = 0;
        loop {
            let task_id = self.manager.receive_begin(self.id, blocking)?;
            self.wait_task(task_id)?;
            received += self.manager.receive_end(task_id, &mut dst[received..])?;
            if received >= min {
                break;
            }
        }
        Ok(received)
    }

    /// Blocks until `size` bytes are buffered for this channel.
    pub fn wait_receive(&self, size: usize) -> Result<(), ChannelError> {
        let task_id = self.manager.wait_receive_begin(self.id, size)?;
        self.wait_task(task_id)?;
        self.manager.wait_receive_end(task_id)
    }
}
