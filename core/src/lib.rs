//! Yogi core: LAN-local peer-to-peer messaging built around the branch — a
//! named, uniquely identified endpoint that discovers peers via UDP
//! multicast, establishes authenticated TCP sessions with every other branch
//! in the same network and exchanges user broadcasts over them.
//!
//! All asynchronous completions run on a [`context::Context`], a
//! single-threaded cooperative reactor; handlers fire inside its
//! `run*`/`poll*` calls and never on the thread that initiated an operation.

pub mod branch;
pub mod constants;
pub mod context;
pub mod errors;
pub mod network;
pub mod objects;
pub mod payload;
pub mod signals;
pub mod timer;

pub use branch::broadcast::{ReceiveBroadcastHandler, SendBroadcastHandler};
pub use branch::connection_manager::{
    BranchEventHandler, BranchEventInfo, BranchEvents, OperationId,
};
pub use branch::{Branch, BranchPtr};
pub use context::{Context, ContextPtr};
pub use errors::{Error, ErrorKind, Result};
pub use objects::{Handle, ObjectKind, ObjectRegistry};
pub use payload::{Encoding, Payload};
pub use signals::{raise_signal, SignalSet, SignalSetPtr, Signals};
pub use timer::{Timer, TimerPtr};

pub use yogi_primitives::{Duration, Timestamp};
