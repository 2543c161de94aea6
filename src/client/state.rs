//! Broker connection state machine.
//!
//! The machine is pure: [`ConnectionMachine::apply`] takes one completion
//! [`Event`], updates the state and returns the [`Action`]s the driver must
//! perform next. No I/O happens here, so every path (including declarations
//! completing out of order and failures at each stage) is testable without a
//! broker.
//!
//! ```text
//! Disconnected -Start-> Connecting -ConnectionOpened-> Connected
//!   -ChannelOpened-> ChannelOpen -(InboundDeclared, ConsumerStarted)-> Subscribed
//! ```
//!
//! The outbound and inbound declarations are tracked as two independent
//! facts; either may complete first, and the outbound one may even complete
//! after `Subscribed` is reached. Any failure before `Closed` moves the
//! machine to the terminal `Failed` state. There are no backward transitions.

use std::fmt;

use crate::{Result, RpcError};

/// Lifecycle state of the broker connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Parameters set, no network activity yet.
    Disconnected,
    /// Connection attempt issued.
    Connecting,
    /// Transport established; channel being opened.
    Connected,
    /// Channel open; queue declarations in flight.
    ChannelOpen,
    /// Consumer registered on the inbound queue.
    Subscribed,
    /// Terminal: the connection failed with the given reason.
    Failed(String),
    /// Terminal: the client was closed.
    Closed,
}

impl ConnectionState {
    /// True for `Failed` and `Closed`, where no request can be published.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Failed(_) | ConnectionState::Closed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => f.write_str("Disconnected"),
            ConnectionState::Connecting => f.write_str("Connecting"),
            ConnectionState::Connected => f.write_str("Connected"),
            ConnectionState::ChannelOpen => f.write_str("ChannelOpen"),
            ConnectionState::Subscribed => f.write_str("Subscribed"),
            ConnectionState::Failed(reason) => write!(f, "Failed({reason})"),
            ConnectionState::Closed => f.write_str("Closed"),
        }
    }
}

/// Completion of a broker step, fed into the machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Start,
    ConnectionOpened,
    ConnectionFailed(String),
    ChannelOpened,
    ChannelFailed(String),
    /// Carries the queue name acknowledged by the broker.
    OutboundDeclared(String),
    /// Carries the queue name acknowledged by the broker.
    InboundDeclared(String),
    DeclareFailed(String),
    ConsumerStarted,
    /// Consumer could not be registered, or its stream ended.
    ConsumerFailed(String),
    Close,
}

/// Side effect requested by a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    OpenConnection,
    OpenChannel,
    DeclareOutbound(String),
    DeclareInbound(String),
    StartConsumer(String),
    /// Publish every call held back while the outbound queue was unknown.
    FlushPublishes(String),
    /// Resolve every pending and queued call with "broker unavailable".
    FailAll(String),
    /// Resolve every pending call with "closed" and release the transport.
    Shutdown,
}

/// Connection state plus the two independent declaration facts.
#[derive(Debug, Clone)]
pub struct ConnectionMachine {
    // ---
    state: ConnectionState,
    outbound_name: String,
    inbound_name: String,
    outbound_queue: Option<String>,
    inbound_queue: Option<String>,
}

impl ConnectionMachine {
    /// New machine in `Disconnected`, declaring the given queue names.
    pub fn new(outbound_name: impl Into<String>, inbound_name: impl Into<String>) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            outbound_name: outbound_name.into(),
            inbound_name: inbound_name.into(),
            outbound_queue: None,
            inbound_queue: None,
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    /// Broker-acknowledged outbound queue, once declared and while usable.
    pub fn outbound_queue(&self) -> Option<&str> {
        // ---
        if self.state.is_terminal() {
            return None;
        }
        self.outbound_queue.as_deref()
    }

    /// Broker-acknowledged inbound queue, once declared.
    pub fn inbound_queue(&self) -> Option<&str> {
        self.inbound_queue.as_deref()
    }

    /// Failure reason when in `Failed`.
    pub fn failure(&self) -> Option<&str> {
        match &self.state {
            ConnectionState::Failed(reason) => Some(reason),
            _ => None,
        }
    }

    /// Apply one event.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::InvalidTransition`] when `event` is not accepted in
    /// the current state. The machine is left unchanged in that case.
    pub fn apply(&mut self, event: Event) -> Result<Vec<Action>> {
        // ---
        use ConnectionState as S;
        use Event as E;

        match (self.state.clone(), event) {
            (S::Disconnected, E::Start) => {
                self.state = S::Connecting;
                Ok(vec![Action::OpenConnection])
            }

            (S::Connecting, E::ConnectionOpened) => {
                self.state = S::Connected;
                Ok(vec![Action::OpenChannel])
            }

            (S::Connected, E::ChannelOpened) => {
                self.state = S::ChannelOpen;
                Ok(vec![
                    Action::DeclareOutbound(self.outbound_name.clone()),
                    Action::DeclareInbound(self.inbound_name.clone()),
                ])
            }

            (S::ChannelOpen | S::Subscribed, E::OutboundDeclared(name))
                if self.outbound_queue.is_none() =>
            {
                self.outbound_queue = Some(name.clone());
                Ok(vec![Action::FlushPublishes(name)])
            }

            (S::ChannelOpen, E::InboundDeclared(name)) if self.inbound_queue.is_none() => {
                self.inbound_queue = Some(name.clone());
                Ok(vec![Action::StartConsumer(name)])
            }

            (S::ChannelOpen, E::ConsumerStarted) if self.inbound_queue.is_some() => {
                self.state = S::Subscribed;
                Ok(Vec::new())
            }

            (S::Connecting, E::ConnectionFailed(reason))
            | (S::Connected, E::ChannelFailed(reason))
            | (S::ChannelOpen | S::Subscribed, E::DeclareFailed(reason))
            | (S::ChannelOpen | S::Subscribed, E::ConsumerFailed(reason)) => {
                self.state = S::Failed(reason.clone());
                Ok(vec![Action::FailAll(reason)])
            }

            (S::Closed, E::Close) => Ok(Vec::new()),

            (_, E::Close) => {
                self.state = S::Closed;
                Ok(vec![Action::Shutdown])
            }

            (state, event) => Err(RpcError::InvalidTransition {
                state: state.to_string(),
                event: format!("{event:?}"),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    fn machine() -> ConnectionMachine {
        ConnectionMachine::new("client_queue", "server_queue")
    }

    fn channel_open() -> ConnectionMachine {
        // ---
        let mut m = machine();
        m.apply(Event::Start).unwrap();
        m.apply(Event::ConnectionOpened).unwrap();
        let actions = m.apply(Event::ChannelOpened).unwrap();
        assert_eq!(
            actions,
            vec![
                Action::DeclareOutbound("client_queue".into()),
                Action::DeclareInbound("server_queue".into()),
            ]
        );
        m
    }

    #[test]
    fn happy_path_outbound_first() {
        // ---
        let mut m = machine();
        assert_eq!(m.apply(Event::Start).unwrap(), vec![Action::OpenConnection]);
        assert_eq!(m.state(), &ConnectionState::Connecting);

        assert_eq!(m.apply(Event::ConnectionOpened).unwrap(), vec![Action::OpenChannel]);
        assert_eq!(m.state(), &ConnectionState::Connected);

        m.apply(Event::ChannelOpened).unwrap();
        assert_eq!(m.outbound_queue(), None);

        assert_eq!(
            m.apply(Event::OutboundDeclared("client_queue".into())).unwrap(),
            vec![Action::FlushPublishes("client_queue".into())]
        );
        assert_eq!(m.outbound_queue(), Some("client_queue"));
        assert_eq!(
            m.apply(Event::InboundDeclared("server_queue".into())).unwrap(),
            vec![Action::StartConsumer("server_queue".into())]
        );
        assert_eq!(m.state(), &ConnectionState::ChannelOpen);

        assert!(m.apply(Event::ConsumerStarted).unwrap().is_empty());
        assert_eq!(m.state(), &ConnectionState::Subscribed);
    }

    #[test]
    fn inbound_declared_first_still_flushes_outbound_later() {
        // ---
        let mut m = channel_open();

        m.apply(Event::InboundDeclared("server_queue".into())).unwrap();
        m.apply(Event::ConsumerStarted).unwrap();
        assert_eq!(m.state(), &ConnectionState::Subscribed);
        assert_eq!(m.outbound_queue(), None);

        let actions = m.apply(Event::OutboundDeclared("client_queue".into())).unwrap();
        assert_eq!(actions, vec![Action::FlushPublishes("client_queue".into())]);
        assert_eq!(m.outbound_queue(), Some("client_queue"));
        assert_eq!(m.state(), &ConnectionState::Subscribed);
    }

    #[test]
    fn declaration_is_accepted_only_once() {
        // ---
        let mut m = channel_open();
        m.apply(Event::OutboundDeclared("client_queue".into())).unwrap();

        let err = m
            .apply(Event::OutboundDeclared("client_queue".into()))
            .unwrap_err();
        assert!(matches!(err, RpcError::InvalidTransition { .. }));
        assert_eq!(m.state(), &ConnectionState::ChannelOpen);
    }

    #[test]
    fn consumer_needs_inbound_queue() {
        // ---
        let mut m = channel_open();
        assert!(m.apply(Event::ConsumerStarted).is_err());
        assert_eq!(m.state(), &ConnectionState::ChannelOpen);
    }

    #[test]
    fn connection_failure_is_terminal() {
        // ---
        let mut m = machine();
        m.apply(Event::Start).unwrap();

        let actions = m.apply(Event::ConnectionFailed("ACCESS_REFUSED".into())).unwrap();
        assert_eq!(actions, vec![Action::FailAll("ACCESS_REFUSED".into())]);
        assert_eq!(m.failure(), Some("ACCESS_REFUSED"));
        assert!(m.state().is_terminal());
        assert!(!ConnectionState::Subscribed.is_terminal());

        // no re-entry
        assert!(m.apply(Event::Start).is_err());
        assert!(m.apply(Event::ConnectionOpened).is_err());
        assert_eq!(m.failure(), Some("ACCESS_REFUSED"));
    }

    #[test]
    fn failure_at_every_stage_fails_all() {
        // ---
        let mut m = machine();
        m.apply(Event::Start).unwrap();
        m.apply(Event::ConnectionOpened).unwrap();
        assert_eq!(
            m.apply(Event::ChannelFailed("channel limit".into())).unwrap(),
            vec![Action::FailAll("channel limit".into())]
        );

        let mut m = channel_open();
        assert_eq!(
            m.apply(Event::DeclareFailed("PRECONDITION_FAILED".into())).unwrap(),
            vec![Action::FailAll("PRECONDITION_FAILED".into())]
        );

        let mut m = channel_open();
        m.apply(Event::OutboundDeclared("client_queue".into())).unwrap();
        m.apply(Event::InboundDeclared("server_queue".into())).unwrap();
        m.apply(Event::ConsumerStarted).unwrap();
        m.apply(Event::ConsumerFailed("connection reset".into())).unwrap();
        assert_eq!(m.failure(), Some("connection reset"));
        assert_eq!(m.outbound_queue(), None);
    }

    #[test]
    fn late_completion_after_failure_is_rejected() {
        // ---
        let mut m = channel_open();
        m.apply(Event::DeclareFailed("boom".into())).unwrap();
        assert!(m.apply(Event::InboundDeclared("server_queue".into())).is_err());
        assert!(m.apply(Event::OutboundDeclared("client_queue".into())).is_err());
    }

    #[test]
    fn steps_cannot_be_skipped() {
        // ---
        let mut m = machine();
        assert!(m.apply(Event::ConnectionOpened).is_err());
        assert!(m.apply(Event::ChannelOpened).is_err());
        assert!(m.apply(Event::OutboundDeclared("client_queue".into())).is_err());
        assert_eq!(m.state(), &ConnectionState::Disconnected);
    }

    #[test]
    fn close_from_any_state() {
        // ---
        let mut m = channel_open();
        assert_eq!(m.apply(Event::Close).unwrap(), vec![Action::Shutdown]);
        assert_eq!(m.state(), &ConnectionState::Closed);
        assert!(m.apply(Event::Close).unwrap().is_empty());

        let mut m = machine();
        m.apply(Event::Start).unwrap();
        m.apply(Event::ConnectionFailed("down".into())).unwrap();
        assert_eq!(m.apply(Event::Close).unwrap(), vec![Action::Shutdown]);
    }
}
