//! Configuration and events for communication logging.

use serde::{Deserialize, Serialize};

/// Configuration information about a communication thread.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub struct CommunicationSetup {
    /// True when this is a send thread (or the receive thread).
    pub sender: bool,
    /// The host id of the thread.
    pub process: usize,
    /// The remote host id.
    pub remote: Option<usize>,
}

/// Various communication events.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone)]
pub enum CommunicationEvent {
    /// An observed message.
    Message(MessageEvent),
    /// A state transition.
    State(StateEvent),
}

/// An observed message crossing a link.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub struct MessageEvent {
    /// true for send event, false for receive event
    pub is_send: bool,
    /// payload length in bytes.
    pub length: usize,
}

/// Starting or stopping communication threads.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub struct StateEvent {
    /// Is the thread a send (vs a recv) thread.
    pub send: bool,
    /// The host id of the thread.
    pub process: usize,
    /// The remote host id.
    pub remote: usize,
    /// Is the thread starting or stopping.
    pub start: bool,
}

/// The kinds of flow control collectives.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum CollectiveKind {
    /// Inclusive or exclusive prefix sum.
    PrefixSum,
    /// One value to everyone.
    Broadcast,
    /// Everyone's values to everyone.
    AllGather,
    /// Combined value to one worker.
    Reduce,
    /// Combined value to everyone.
    AllReduce,
    /// Synchronization only.
    Barrier,
    /// Neighbor exchange towards higher ranks.
    Predecessor,
    /// Neighbor exchange towards lower ranks.
    Successor,
}

/// A worker entering or leaving a collective.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub struct CollectiveEvent {
    /// Which collective.
    pub kind: CollectiveKind,
    /// Global rank of the worker.
    pub worker: usize,
    /// Entering (true) or leaving (false).
    pub start: bool,
}

impl From<MessageEvent> for CommunicationEvent {
    fn from(v: MessageEvent) -> CommunicationEvent { CommunicationEvent::Message(v) }
}

impl From<StateEvent> for CommunicationEvent {
    fn from(v: StateEvent) -> CommunicationEvent { CommunicationEvent::State(v) }
}

/// Logger for communication events, tagged with the thread's setup.
pub type CommunicationLogger = sluice_logging::Logger<CommunicationEvent, CommunicationSetup>;

/// Produces a logger for a communication thread, if logging is enabled.
pub type LogFn = std::sync::Arc<dyn Fn(CommunicationSetup) -> Option<CommunicationLogger> + Send + Sync>;

/// Logger for collectives, tagged with the global rank of the worker.
pub type FlowLogger = sluice_logging::Logger<CollectiveEvent, usize>;
