mod binder;
mod broker;
mod path_selection;
mod rendezvous;

pub use binder::{BindResult, StreamBinder};
pub use broker::{Acquisition, CircuitBroker, SkipReason};
pub use path_selection::{GuardPicker, NodeSelection, NodeSelector, PathSelectionError};
pub use rendezvous::{AttachOutcome, PendingCircuit, Rendezvous, RendezvousError, StreamOwner};
