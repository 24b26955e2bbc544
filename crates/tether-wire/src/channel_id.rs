use strum::FromRepr;

/// Consumer module owning a group of channels. Channel 0 of each module is
/// the control/RPC channel; higher ids carry bulk data for in-flight tasks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, FromRepr)]
#[repr(u8)]
pub enum ModuleId {
    Htcmisc = 0,
    Htcfs = 1,
    Htcs = 2,
}

impl ModuleId {
    pub fn name(self) -> &'static str {
        match self {
            ModuleId::Htcmisc => "htcmisc",
            ModuleId::Htcfs => "htcfs",
            ModuleId::Htcs => "htcs",
        }
    }
}

/// Identity of a transport channel: `(module, channel, reserved = 0)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId {
    pub module: ModuleId,
    pub channel: u16,
}

impl ChannelId {
    pub const fn new(module: ModuleId, channel: u16) -> Self {
        Self { module, channel }
    }

    /// The control channel of `module`, carrying RPC traffic and window
    /// updates for the module's other channels.
    pub const fn control(module: ModuleId) -> Self {
        Self { module, channel: 0 }
    }

    pub const fn is_control(self) -> bool {
        self.channel == 0
    }

    /// Wire identity: hash of the channel's service name. 0 is reserved on
    /// the wire, and no service name hashes to it.
    pub fn service_id(self) -> u32 {
        let id = crc32fast::hash(format!("{}:{}", self.module.name(), self.channel).as_bytes());
        debug_assert_ne!(id, 0);
        id
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.module.name(), self.channel)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn service_ids_are_distinct_and_stable() {
        let a = ChannelId::new(ModuleId::Htcfs, 0);
        let b = ChannelId::new(ModuleId::Htcfs, 1);
        let c = ChannelId::new(ModuleId::Htcs, 0);

        assert_ne!(a.service_id(), b.service_id());
        assert_ne!(a.service_id(), c.service_id());
        assert_eq!(a.service_id(), ChannelId::control(ModuleId::Htcfs).service_id());
    }

    #[test]
    fn control_channel_is_zero() {
        assert!(ChannelId::control(ModuleId::Htcs).is_control());
        assert!(!ChannelId::new(ModuleId::Htcs, 1).is_control());
    }
}
