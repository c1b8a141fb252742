//! The command registry: 16 builder slots keyed by the 4-bit command
//! id carried in the initial stream sub-header.

use std::sync::Arc;
use std::time::Duration;

use crate::{
    config::Preset,
    dial::Dialer,
    fsm::Machine,
    frame::StreamError,
    hook::HookRunner,
    sender::StreamResponder,
    spec::{COMMAND_COUNT, COMMAND_ID_MAX},
    ssh::SshCommand,
    telnet::TelnetCommand,
};

/// Everything a command machine needs to reach the outside world.
#[derive(Clone)]
pub struct CommandConfig {
    /// The backend dialer, already carrying SOCKS5 and allow-list
    /// policy.
    pub dialer: Dialer,

    /// Timeout for one backend dial attempt.
    pub dial_timeout: Duration,

    /// The before-connecting hook runner.
    pub hooks: Arc<HookRunner>,

    /// Configured remote presets.
    pub presets: Arc<Vec<Preset>>,
}

/// Builds a command machine for one freshly opened stream.
pub type MachineBuilder =
    Box<dyn Fn(StreamResponder, &CommandConfig) -> Box<dyn Machine> + Send + Sync>;

struct CommandSpec {
    name: &'static str,
    build: MachineBuilder,
}

/// The fixed 16-slot command table.
pub struct CommandSet {
    slots: [Option<CommandSpec>; COMMAND_COUNT],
}

impl CommandSet {
    /// An empty table.
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| None),
        }
    }

    /// The table with the built-in commands: SSH at id 0, Telnet at
    /// id 1.
    pub fn standard() -> Self {
        let mut set = Self::new();
        set.register(0, "SSH", Box::new(|w, cfg| Box::new(SshCommand::new(w, cfg))));
        set.register(1, "Telnet", Box::new(|w, cfg| Box::new(TelnetCommand::new(w, cfg))));
        set
    }

    /// Registers a command builder under `id`.
    ///
    /// # Panics
    ///
    /// Panics when `id` exceeds 15 or the slot is already taken; both
    /// are registration-time programming errors.
    pub fn register(&mut self, id: u8, name: &'static str, build: MachineBuilder) {
        assert!(id <= COMMAND_ID_MAX, "command id must not be greater than 15");
        assert!(
            self.slots[usize::from(id)].is_none(),
            "command {} already registered",
            id
        );
        self.slots[usize::from(id)] = Some(CommandSpec { name, build });
    }

    /// The registered name of `id`, if any.
    pub fn name(&self, id: u8) -> Option<&'static str> {
        self.slots
            .get(usize::from(id))
            .and_then(|s| s.as_ref())
            .map(|s| s.name)
    }

    /// Builds the machine for `id`.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::COMMAND_UNDEFINED`] for empty slots.
    pub(crate) fn build(
        &self,
        id: u8,
        responder: StreamResponder,
        cfg: &CommandConfig,
    ) -> Result<Box<dyn Machine>, StreamError> {
        self.slots
            .get(usize::from(id))
            .and_then(|s| s.as_ref())
            .map(|s| (s.build)(responder, cfg))
            .ok_or(StreamError::COMMAND_UNDEFINED)
    }
}

impl Default for CommandSet {
    fn default() -> Self {
        Self::standard()
    }
}

impl core::fmt::Debug for CommandSet {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let names: Vec<_> = (0..COMMAND_COUNT)
            .map(|i| self.name(i as u8).unwrap_or("-"))
            .collect();
        f.debug_struct("CommandSet").field("slots", &names).finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_standard_registrations() {
        let set = CommandSet::standard();
        assert_eq!(set.name(0), Some("SSH"));
        assert_eq!(set.name(1), Some("Telnet"));
        assert_eq!(set.name(15), None);
    }

    #[test]
    #[should_panic]
    fn test_duplicate_registration_panics() {
        let mut set = CommandSet::standard();
        set.register(0, "SSH again", Box::new(|w, cfg| Box::new(SshCommand::new(w, cfg))));
    }
}
