/// Control-port protocol client
///
/// `TorControlLink` implements the core `ControlLink` capability over the
/// line-based control protocol, reached through TCP or a unix socket.

pub mod protocol;
mod tor;

pub use tor::TorControlLink;
