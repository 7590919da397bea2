//! Transport layer state machine (RFC 4253).
//!
//! The transport owns exactly one byte stream and progresses through
//! these states:
//!
//! 1. **Preamble** - identification line exchange
//! 2. **KexInit** - KEXINIT sent/received
//! 3. **KexRun** - DH/ECDH messages in flight
//! 4. **NewKeys** - NEWKEYS exchange, key installation
//! 5. **Running** - encrypted operation; user data may flow
//! 6. **RekeyRequested** / **RekeyRunning** - a repeat exchange over the
//!    encrypted channel
//! 7. **Closed** - terminal
//!
//! The invariant enforced here: no user data may be sent between
//! `KexInit` and `NewKeys` (initial or rekey). The session driver
//! mirrors [`TransportState::may_send_user_data`] into its writer's
//! data-lane gate on every state change, so the writer never dequeues
//! channel traffic while an exchange is in flight.

use keel_platform::{KeelError, KeelResult};

/// Transport state (see module docs for the lifecycle).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Identification line exchange in progress.
    Preamble,
    /// KEXINIT messages being exchanged.
    KexInit,
    /// Key exchange method messages in flight.
    KexRun,
    /// NEWKEYS being exchanged, keys installing.
    NewKeys,
    /// Encrypted steady state; user traffic flows.
    Running,
    /// A rekey was requested (threshold hit or peer KEXINIT seen).
    RekeyRequested,
    /// Rekey exchange in flight over the encrypted channel.
    RekeyRunning,
    /// Terminal state.
    Closed,
}

/// Rekey thresholds (bytes and packets per direction).
#[derive(Debug, Clone, Copy)]
pub struct RekeyLimits {
    /// Bytes in either direction before a rekey is forced.
    pub bytes: u64,
    /// Packets in either direction before a rekey is forced.
    pub packets: u64,
}

impl Default for RekeyLimits {
    fn default() -> Self {
        Self {
            bytes: crate::ssh::packet::REKEY_BYTES_DEFAULT,
            packets: crate::ssh::packet::REKEY_PACKETS_DEFAULT,
        }
    }
}

/// Transport state machine.
///
/// Owned and mutated only by the transport task; the rest of the
/// engine observes it through the session's command interface.
#[derive(Debug)]
pub struct TransportState {
    state: State,
    /// Exchange hash of the first KEX; never changes on rekey.
    session_id: Option<Vec<u8>>,
    /// True while the peer's NEWKEYS is still outstanding.
    awaiting_peer_newkeys: bool,
}

impl TransportState {
    /// Creates a state machine in `Preamble`.
    pub fn new() -> Self {
        Self {
            state: State::Preamble,
            session_id: None,
            awaiting_peer_newkeys: false,
        }
    }

    /// Returns the current state.
    pub fn current(&self) -> State {
        self.state
    }

    /// Returns the session id (exchange hash of the first KEX).
    pub fn session_id(&self) -> Option<&[u8]> {
        self.session_id.as_deref()
    }

    /// Returns whether user data may currently be sent.
    ///
    /// False from `KexInit` through `NewKeys` and during rekey runs.
    pub fn may_send_user_data(&self) -> bool {
        matches!(self.state, State::Running | State::RekeyRequested)
    }

    /// Returns whether the session is closed.
    pub fn is_closed(&self) -> bool {
        self.state == State::Closed
    }

    /// Pins the session id after the first exchange. Later exchanges
    /// leave it untouched.
    pub fn record_exchange_hash(&mut self, exchange_hash: &[u8]) {
        if self.session_id.is_none() {
            self.session_id = Some(exchange_hash.to_vec());
        }
    }

    /// Validates and applies a state transition.
    ///
    /// # Errors
    ///
    /// Returns [`KeelError::Protocol`] on an illegal transition, which
    /// the session treats as fatal.
    pub fn transition(&mut self, next: State) -> KeelResult<()> {
        let valid = matches!(
            (self.state, next),
            (State::Preamble, State::KexInit)
                | (State::KexInit, State::KexRun)
                | (State::KexRun, State::NewKeys)
                | (State::NewKeys, State::Running)
                | (State::Running, State::RekeyRequested)
                | (State::Running, State::RekeyRunning)
                | (State::RekeyRequested, State::RekeyRunning)
                | (State::RekeyRunning, State::NewKeys)
                | (_, State::Closed)
        ) || self.state == next;

        if !valid {
            return Err(KeelError::Protocol(format!(
                "Invalid state transition: {:?} -> {:?}",
                self.state, next
            )));
        }
        self.state = next;
        Ok(())
    }

    /// Marks that our NEWKEYS went out and the peer's is awaited.
    pub fn set_awaiting_peer_newkeys(&mut self, awaiting: bool) {
        self.awaiting_peer_newkeys = awaiting;
    }

    /// Returns whether the peer's NEWKEYS is outstanding.
    pub fn awaiting_peer_newkeys(&self) -> bool {
        self.awaiting_peer_newkeys
    }
}

impl Default for TransportState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drive_to_running(state: &mut TransportState) {
        state.transition(State::KexInit).unwrap();
        state.transition(State::KexRun).unwrap();
        state.transition(State::NewKeys).unwrap();
        state.transition(State::Running).unwrap();
    }

    #[test]
    fn test_initial_state() {
        let state = TransportState::new();
        assert_eq!(state.current(), State::Preamble);
        assert!(!state.may_send_user_data());
        assert!(state.session_id().is_none());
    }

    #[test]
    fn test_normal_progression() {
        let mut state = TransportState::new();
        drive_to_running(&mut state);
        assert_eq!(state.current(), State::Running);
        assert!(state.may_send_user_data());
    }

    #[test]
    fn test_no_user_data_during_kex() {
        let mut state = TransportState::new();
        state.transition(State::KexInit).unwrap();
        assert!(!state.may_send_user_data());
        state.transition(State::KexRun).unwrap();
        assert!(!state.may_send_user_data());
        state.transition(State::NewKeys).unwrap();
        assert!(!state.may_send_user_data());
        state.transition(State::Running).unwrap();
        assert!(state.may_send_user_data());
    }

    #[test]
    fn test_rekey_cycle() {
        let mut state = TransportState::new();
        drive_to_running(&mut state);

        state.transition(State::RekeyRequested).unwrap();
        // Data may still flow until the exchange actually starts.
        assert!(state.may_send_user_data());

        state.transition(State::RekeyRunning).unwrap();
        assert!(!state.may_send_user_data());

        state.transition(State::NewKeys).unwrap();
        state.transition(State::Running).unwrap();
        assert!(state.may_send_user_data());
    }

    #[test]
    fn test_peer_initiated_rekey_skips_requested() {
        let mut state = TransportState::new();
        drive_to_running(&mut state);
        // Peer KEXINIT arrives unprompted.
        state.transition(State::RekeyRunning).unwrap();
        assert_eq!(state.current(), State::RekeyRunning);
    }

    #[test]
    fn test_invalid_transitions() {
        let mut state = TransportState::new();
        assert!(state.transition(State::Running).is_err());
        assert!(state.transition(State::NewKeys).is_err());

        let mut state = TransportState::new();
        drive_to_running(&mut state);
        assert!(state.transition(State::KexRun).is_err());
        assert!(state.transition(State::Preamble).is_err());
    }

    #[test]
    fn test_any_state_may_close() {
        for setup in 0..3 {
            let mut state = TransportState::new();
            match setup {
                0 => {}
                1 => {
                    state.transition(State::KexInit).unwrap();
                }
                _ => drive_to_running(&mut state),
            }
            state.transition(State::Closed).unwrap();
            assert!(state.is_closed());
            assert!(!state.may_send_user_data());
        }
    }

    #[test]
    fn test_session_id_immutable_across_rekey() {
        let mut state = TransportState::new();
        drive_to_running(&mut state);
        state.record_exchange_hash(b"first-hash");
        assert_eq!(state.session_id(), Some(&b"first-hash"[..]));

        // A rekey computes a new exchange hash; the session id stays.
        state.record_exchange_hash(b"second-hash");
        assert_eq!(state.session_id(), Some(&b"first-hash"[..]));
    }

    #[test]
    fn test_rekey_limits_default() {
        let limits = RekeyLimits::default();
        assert_eq!(limits.bytes, 1 << 30);
        assert_eq!(limits.packets, (1u64 << 32) - 1024);
    }
}
