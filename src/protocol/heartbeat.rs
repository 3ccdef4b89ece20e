//! Heartbeat liveness detector.
//!
//! Each timer tick performs the action the state designates and advances it.
//! An acknowledgement at any time resets the cycle, so a missed ack is noticed on
//! the tick after the unacknowledged beat: up to one extra interval of latency is
//! tolerated before recovery starts.

/// What the next heartbeat tick should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HeartbeatAction {
    /// Previous beat (if any) was acknowledged; send a new one.
    #[default]
    SendBeat,
    /// A beat is outstanding. Reaching a tick in this state means the ack was missed.
    ExpectAck,
    /// Liveness failed; the connection must be closed and resumed.
    ForceResume,
}

/// Side effect a tick asks the connection to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickStep {
    /// Send `{op: 1, d: last_sequence}`.
    Beat,
    /// Close the transport, reconnect and resume.
    ForceResume,
}

impl HeartbeatAction {
    /// Transition for one timer tick.
    pub fn on_tick(self) -> (TickStep, Self) {
        match self {
            Self::SendBeat => (TickStep::Beat, Self::ExpectAck),
            Self::ExpectAck | Self::ForceResume => (TickStep::ForceResume, Self::ForceResume),
        }
    }

    /// Transition on a heartbeat acknowledgement, regardless of the pending action.
    pub fn on_ack(self) -> Self {
        Self::SendBeat
    }
}
