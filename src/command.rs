//! # Command model
//!
//! Defines the closed set of outbound verbs and inbound responses, the
//! immutable [`Command`] record queued and sent by the [`crate::engine`],
//! and the compatibility/merge relation used to coalesce pending commands
//! in the [`crate::queue`].
//!
//! ## Available Methods
//! - [`Command::new`] - build a command record
//! - [`Command::is_compatible`] - check whether two commands may be merged
//! - [`Command::merge`] - combine a later command into an earlier one
//! - [`CommandId::wire_code`], [`CommandId::default_priority`] - wire encoding table

use crate::relay::RelaySet;

/// The closed set of outbound command verbs, plus the `None` sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandId {
    RelayOn,
    RelayOff,
    ToggleRelay,
    QueryRelay,
    SetButtonMode,
    QueryButtonMode,
    StartTimer,
    SetTimer,
    QueryTimer,
    ResetFactoryDefaults,
    QueryJumperStatus,
    QueryFirmwareVersion,
    None,
}

impl CommandId {
    /// Outbound wire `CMD` byte for this command, or `None` for the sentinel.
    pub const fn wire_code(self) -> Option<u8> {
        use CommandId::*;
        match self {
            RelayOn => Some(0x11),
            RelayOff => Some(0x12),
            ToggleRelay => Some(0x14),
            QueryRelay => Some(0x18),
            SetButtonMode => Some(0x21),
            QueryButtonMode => Some(0x22),
            StartTimer => Some(0x41),
            SetTimer => Some(0x42),
            QueryTimer => Some(0x44),
            ResetFactoryDefaults => Some(0x66),
            QueryJumperStatus => Some(0x70),
            QueryFirmwareVersion => Some(0x71),
            CommandId::None => Option::None,
        }
    }

    /// Default priority assigned at enqueue time: 1 for mutations, 2 for
    /// queries that elicit a data response. Higher value is served first.
    pub const fn default_priority(self) -> i32 {
        use CommandId::*;
        match self {
            RelayOn | RelayOff | ToggleRelay | SetButtonMode | StartTimer | SetTimer
            | ResetFactoryDefaults => 1,
            QueryRelay | QueryButtonMode | QueryTimer | QueryJumperStatus
            | QueryFirmwareVersion => 2,
            CommandId::None => 0,
        }
    }

    /// Recovers a [`CommandId`] from its outbound wire `CMD` byte, if any
    /// known command encodes to it.
    pub const fn from_wire_code(byte: u8) -> Option<CommandId> {
        use CommandId::*;
        match byte {
            0x11 => Some(RelayOn),
            0x12 => Some(RelayOff),
            0x14 => Some(ToggleRelay),
            0x18 => Some(QueryRelay),
            0x21 => Some(SetButtonMode),
            0x22 => Some(QueryButtonMode),
            0x41 => Some(StartTimer),
            0x42 => Some(SetTimer),
            0x44 => Some(QueryTimer),
            0x66 => Some(ResetFactoryDefaults),
            0x70 => Some(QueryJumperStatus),
            0x71 => Some(QueryFirmwareVersion),
            _ => Option::None,
        }
    }

    /// The [`ResponseId`] this command elicits when it succeeds, if any.
    /// `RelayOn`/`RelayOff`/`ToggleRelay`/`StartTimer` are conditional:
    /// they elicit [`ResponseId::RelayStatus`] only if the relay set
    /// actually changed, which the engine decides at response time, not here.
    pub const fn response_id(self) -> Option<ResponseId> {
        use CommandId::*;
        match self {
            QueryRelay | RelayOn | RelayOff | ToggleRelay | StartTimer => {
                Some(ResponseId::RelayStatus)
            }
            QueryButtonMode => Some(ResponseId::ButtonMode),
            QueryTimer => Some(ResponseId::Timer),
            QueryJumperStatus => Some(ResponseId::JumperStatus),
            QueryFirmwareVersion => Some(ResponseId::FirmwareVersion),
            SetButtonMode | SetTimer | ResetFactoryDefaults | CommandId::None => Option::None,
        }
    }
}

/// The closed set of inbound response verbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseId {
    ButtonMode,
    Timer,
    ButtonStatus,
    RelayStatus,
    JumperStatus,
    FirmwareVersion,
}

impl ResponseId {
    /// Inbound wire `CMD` byte this response is decoded from, or `None` if
    /// `byte` does not correspond to a known response.
    pub const fn from_wire_code(byte: u8) -> Option<ResponseId> {
        match byte {
            0x22 => Some(ResponseId::ButtonMode),
            0x44 => Some(ResponseId::Timer),
            0x50 => Some(ResponseId::ButtonStatus),
            0x51 => Some(ResponseId::RelayStatus),
            0x70 => Some(ResponseId::JumperStatus),
            0x71 => Some(ResponseId::FirmwareVersion),
            _ => Option::None,
        }
    }
}

/// An immutable command record: verb, priority, and the three parameter
/// bytes, whose meaning depends on `id` (see module docs in `crate::command`
/// and spec section on the data model).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command {
    pub id: CommandId,
    pub priority: i32,
    pub mask: u8,
    pub param1: u8,
    pub param2: u8,
}

impl Command {
    /// Build a command with the given id's default priority.
    pub fn new(id: CommandId, mask: u8, param1: u8, param2: u8) -> Self {
        Command {
            id,
            priority: id.default_priority(),
            mask,
            param1,
            param2,
        }
    }

    /// Build a command with an explicit priority override.
    pub fn with_priority(id: CommandId, priority: i32, mask: u8, param1: u8, param2: u8) -> Self {
        Command {
            id,
            priority,
            mask,
            param1,
            param2,
        }
    }

    /// Relay-set view of `mask`, for commands where it represents relays.
    pub fn relay_set(&self) -> RelaySet {
        RelaySet::from_bits(self.mask)
    }

    /// Tests whether `self` and `other` may be merged by [`Command::merge`].
    ///
    /// See the compatibility table in the command model spec: `RelayOn` and
    /// `RelayOff` are mutually compatible (opposite cancellation handles
    /// their actual interaction in the queue); same-id commands are
    /// compatible except where noted (`StartTimer`/`SetTimer` require equal
    /// delay parameters, `QueryTimer` requires the same delay-type bit).
    pub fn is_compatible(&self, other: &Command) -> bool {
        use CommandId::*;
        if self.id != other.id {
            return matches!(
                (self.id, other.id),
                (RelayOn, RelayOff) | (RelayOff, RelayOn)
            );
        }
        match self.id {
            StartTimer | SetTimer => self.param1 == other.param1 && self.param2 == other.param2,
            QueryTimer => (self.param1 & 1) == (other.param1 & 1),
            CommandId::None => false,
            _ => true,
        }
    }

    /// Merges `other`, a later compatible command, into `self`.
    ///
    /// The result's priority is the max of the two. Callers should check
    /// [`Command::is_compatible`] first; an incompatible pair is merged
    /// as a no-op on the mismatched fields, same as the upstream
    /// implementation this is ported from.
    pub fn merge(&mut self, other: &Command) {
        self.priority = self.priority.max(other.priority);
        use CommandId::*;
        match self.id {
            RelayOn => {
                if other.id == RelayOff {
                    self.mask &= !other.mask;
                } else {
                    self.mask |= other.mask;
                }
            }
            RelayOff => {
                if other.id == RelayOn {
                    self.mask &= !other.mask;
                } else {
                    self.mask |= other.mask;
                }
            }
            ToggleRelay => self.mask ^= other.mask,
            SetButtonMode => {
                let momentary = self.mask | other.mask;
                let toggle = (self.param1 | other.param1) & !momentary;
                let timed = (self.param2 | other.param2) & !toggle & !momentary;
                self.mask = momentary;
                self.param1 = toggle;
                self.param2 = timed;
            }
            StartTimer | SetTimer | QueryTimer => self.mask |= other.mask,
            // QueryRelay, QueryButtonMode, ResetFactoryDefaults, QueryJumperStatus,
            // QueryFirmwareVersion, None: parameterless, merge is a no-op.
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use CommandId::*;

    #[test]
    fn relay_on_off_merge_cancels_overlap() {
        let mut on = Command::new(RelayOn, RelaySet::relay(1).bits() | RelaySet::relay(2).bits(), 0, 0);
        let off = Command::new(RelayOff, RelaySet::relay(2).bits() | RelaySet::relay(3).bits(), 0, 0);
        on.merge(&off);
        assert_eq!(on.relay_set(), RelaySet::relay(1));
    }

    #[test]
    fn toggle_merge_is_xor() {
        let mut a = Command::new(ToggleRelay, RelaySet::relay(1).bits() | RelaySet::relay(2).bits(), 0, 0);
        let b = Command::new(ToggleRelay, RelaySet::relay(2).bits() | RelaySet::relay(3).bits(), 0, 0);
        a.merge(&b);
        assert_eq!(a.relay_set(), RelaySet::relay(1) | RelaySet::relay(3));
    }

    #[test]
    fn set_button_mode_merge_applies_precedence() {
        let mom_a = RelaySet::relay(1) | RelaySet::relay(2) | RelaySet::relay(3);
        let tog_a = RelaySet::relay(4) | RelaySet::relay(5) | RelaySet::relay(6);
        let timed_a = RelaySet::relay(7) | RelaySet::relay(8);
        let mut a = Command::new(SetButtonMode, mom_a.bits(), tog_a.bits(), timed_a.bits());

        let mom_b = RelaySet::relay(4) | RelaySet::relay(7);
        let tog_b = RelaySet::relay(1) | RelaySet::relay(3) | RelaySet::relay(5);
        let timed_b = RelaySet::relay(2) | RelaySet::relay(6) | RelaySet::relay(8);
        let b = Command::new(SetButtonMode, mom_b.bits(), tog_b.bits(), timed_b.bits());

        a.merge(&b);
        let momentary = RelaySet::relay(1) | RelaySet::relay(2) | RelaySet::relay(3) | RelaySet::relay(4) | RelaySet::relay(7);
        let toggle = RelaySet::relay(5) | RelaySet::relay(6);
        let timed = RelaySet::relay(8);
        assert_eq!(a.relay_set(), momentary);
        assert_eq!(RelaySet::from_bits(a.param1), toggle);
        assert_eq!(RelaySet::from_bits(a.param2), timed);
    }

    #[test]
    fn start_timer_compatibility_requires_equal_delay() {
        let a = Command::new(StartTimer, RelaySet::relay(1).bits(), 0, 5);
        let b = Command::new(StartTimer, RelaySet::relay(2).bits(), 0, 5);
        assert!(a.is_compatible(&b));
        let c = Command::new(StartTimer, RelaySet::relay(2).bits(), 0, 6);
        assert!(!a.is_compatible(&c));
    }

    #[test]
    fn query_timer_compatibility_checks_delay_type_bit() {
        let remaining = Command::new(QueryTimer, RelaySet::relay(1).bits(), 1, 0);
        let total = Command::new(QueryTimer, RelaySet::relay(1).bits(), 0, 0);
        assert!(!remaining.is_compatible(&total));
    }

    #[test]
    fn wire_code_round_trips_through_command_id() {
        for id in [RelayOn, RelayOff, ToggleRelay, QueryRelay, SetButtonMode,
                   QueryButtonMode, StartTimer, SetTimer, QueryTimer,
                   ResetFactoryDefaults, QueryJumperStatus, QueryFirmwareVersion]
        {
            let code = id.wire_code().expect("has a wire code");
            assert_eq!(CommandId::from_wire_code(code), Some(id));
        }
    }

    #[test]
    fn toggle_incompatible_with_relay_on_off() {
        let toggle = Command::new(ToggleRelay, RelaySet::relay(1).bits(), 0, 0);
        let on = Command::new(RelayOn, RelaySet::relay(1).bits(), 0, 0);
        assert!(!toggle.is_compatible(&on));
    }
}
