//! Channel state and flow control (RFC 4254 Section 5).
//!
//! A channel is `(local-id, remote-id, windows, max-packets, state)`.
//! Data flow is credit based: each side may send at most the peer's
//! current window; credit is returned with
//! `SSH_MSG_CHANNEL_WINDOW_ADJUST`. A peer that overruns the window we
//! granted commits a protocol violation and the session terminates.
//!
//! Lifecycle: `Opening` → `Open` → (`EofSent`/`EofRcvd`) →
//! `ClosePending` → `Closed`. A local id is reusable only after
//! `Closed`, i.e. after CLOSE has been both sent and received.

use keel_platform::{KeelError, KeelResult};

/// Default initial window (2 MiB).
pub const DEFAULT_WINDOW_SIZE: u32 = 2 * 1024 * 1024;

/// Default maximum packet (32 KiB).
pub const DEFAULT_MAX_PACKET: u32 = 32 * 1024;

/// Channel lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// CHANNEL_OPEN sent, confirmation pending.
    Opening,
    /// Confirmed; data flows both ways.
    Open,
    /// We sent EOF; we still receive.
    EofSent,
    /// Peer sent EOF; we may still send.
    EofRcvd,
    /// One side has sent CLOSE; the other is pending.
    ClosePending,
    /// CLOSE sent and received; the local id is free.
    Closed,
}

/// Per-channel bookkeeping.
///
/// Owned by the transport task's channel table; mutated only there.
#[derive(Debug)]
pub struct Channel {
    local_id: u32,
    remote_id: Option<u32>,
    state: ChannelState,
    /// Credit the peer may still consume (our receive window).
    local_window: u64,
    /// Initial receive window, used to decide replenishment.
    local_window_initial: u64,
    /// Credit we may still consume (peer's receive window).
    remote_window: u64,
    local_max_packet: u32,
    remote_max_packet: u32,
    close_sent: bool,
    close_received: bool,
}

impl Channel {
    /// Creates a channel in `Opening` with our window parameters.
    pub fn new(local_id: u32, initial_window: u32, max_packet: u32) -> Self {
        Self {
            local_id,
            remote_id: None,
            state: ChannelState::Opening,
            local_window: u64::from(initial_window),
            local_window_initial: u64::from(initial_window),
            remote_window: 0,
            local_max_packet: max_packet,
            remote_max_packet: 0,
            close_sent: false,
            close_received: false,
        }
    }

    /// Returns the local channel id.
    pub fn local_id(&self) -> u32 {
        self.local_id
    }

    /// Returns the remote channel id (set on confirmation).
    pub fn remote_id(&self) -> Option<u32> {
        self.remote_id
    }

    /// Returns the current state.
    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Returns the credit we may still send.
    pub fn send_window(&self) -> u64 {
        self.remote_window
    }

    /// Returns the largest packet the peer accepts.
    pub fn remote_max_packet(&self) -> u32 {
        self.remote_max_packet
    }

    /// Returns our maximum packet size.
    pub fn local_max_packet(&self) -> u32 {
        self.local_max_packet
    }

    /// Applies CHANNEL_OPEN_CONFIRMATION.
    pub fn on_confirmation(&mut self, remote_id: u32, window: u32, max_packet: u32) -> KeelResult<()> {
        if self.state != ChannelState::Opening {
            return Err(KeelError::Protocol(format!(
                "CHANNEL_OPEN_CONFIRMATION for channel {} in state {:?}",
                self.local_id, self.state
            )));
        }
        self.remote_id = Some(remote_id);
        self.remote_window = u64::from(window);
        self.remote_max_packet = max_packet;
        self.state = ChannelState::Open;
        Ok(())
    }

    /// Returns whether the channel carries data in its current state.
    pub fn is_usable(&self) -> bool {
        matches!(
            self.state,
            ChannelState::Open | ChannelState::EofSent | ChannelState::EofRcvd
        )
    }

    /// Consumes send credit for an outbound DATA message.
    ///
    /// Callers must have awaited sufficient window; this is the final
    /// authoritative check.
    pub fn consume_send_window(&mut self, len: usize) -> KeelResult<()> {
        let len = len as u64;
        if len > self.remote_window {
            return Err(KeelError::Channel(format!(
                "Send of {} bytes exceeds window of {} on channel {}",
                len, self.remote_window, self.local_id
            )));
        }
        self.remote_window -= len;
        Ok(())
    }

    /// Applies CHANNEL_WINDOW_ADJUST from the peer.
    pub fn add_send_window(&mut self, bytes: u32) {
        self.remote_window = self.remote_window.saturating_add(u64::from(bytes));
    }

    /// Accounts for inbound DATA against the window we granted.
    ///
    /// # Errors
    ///
    /// [`KeelError::Protocol`] when the peer overruns its credit; this
    /// is session-fatal (the session emits DISCONNECT).
    pub fn on_data_received(&mut self, len: usize) -> KeelResult<()> {
        let len = len as u64;
        if len > self.local_window {
            return Err(KeelError::Protocol(format!(
                "Peer overran the receive window on channel {} ({} > {})",
                self.local_id, len, self.local_window
            )));
        }
        self.local_window -= len;
        Ok(())
    }

    /// Returns the credit to hand back once the consumed half of our
    /// window has been processed, or `None` while plenty remains.
    pub fn replenish_window(&mut self) -> Option<u32> {
        if self.local_window <= self.local_window_initial / 2 {
            let grant = self.local_window_initial - self.local_window;
            self.local_window = self.local_window_initial;
            Some(grant as u32)
        } else {
            None
        }
    }

    /// Records that we sent EOF.
    pub fn on_eof_sent(&mut self) {
        if self.state == ChannelState::Open {
            self.state = ChannelState::EofSent;
        }
    }

    /// Records the peer's EOF.
    pub fn on_eof_received(&mut self) {
        if self.state == ChannelState::Open {
            self.state = ChannelState::EofRcvd;
        }
    }

    /// Records that we sent CLOSE. Returns true when the channel is
    /// now fully closed.
    pub fn on_close_sent(&mut self) -> bool {
        self.close_sent = true;
        self.update_close_state()
    }

    /// Records the peer's CLOSE. Returns true when the channel is now
    /// fully closed.
    pub fn on_close_received(&mut self) -> bool {
        self.close_received = true;
        self.update_close_state()
    }

    fn update_close_state(&mut self) -> bool {
        if self.close_sent && self.close_received {
            self.state = ChannelState::Closed;
            true
        } else {
            self.state = ChannelState::ClosePending;
            false
        }
    }
}

/// Allocates local channel ids, reusing them only after `Closed`.
#[derive(Debug, Default)]
pub struct ChannelIdAllocator {
    in_use: std::collections::BTreeSet<u32>,
}

impl ChannelIdAllocator {
    /// Creates an empty allocator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates the lowest free id.
    pub fn allocate(&mut self) -> u32 {
        let mut id = 0u32;
        while self.in_use.contains(&id) {
            id += 1;
        }
        self.in_use.insert(id);
        id
    }

    /// Releases an id after its channel reached `Closed`.
    pub fn release(&mut self, id: u32) {
        self.in_use.remove(&id);
    }

    /// Returns the number of live ids.
    pub fn live(&self) -> usize {
        self.in_use.len()
    }
}
