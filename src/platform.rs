//! Platform seams the agent consumes but does not implement
//!
//! The network link and the restart primitive belong to the surrounding
//! system. The agent only needs a reachability bit and a way to pull the
//! plug when it decides the device is unrecoverable.

use tracing::error;

/// Reachability signal of the underlying network link.
///
/// Join/association is outside the agent; a link that reports down at
/// `begin()` time is unrecoverable in-core.
pub trait NetworkLink {
    fn is_up(&self) -> bool;
}

/// Link that is always reachable. Appropriate on hosts where the OS owns
/// connectivity and the agent should simply try the broker.
pub struct AlwaysUpLink;

impl NetworkLink for AlwaysUpLink {
    fn is_up(&self) -> bool {
        true
    }
}

/// Irrecoverable-fault exit. Invoked on link loss at boot and on connect
/// retry exhaustion.
pub trait RestartHandle {
    fn restart(&mut self);
}

/// Terminates the process; on a supervised device the init system brings it
/// back up, which is the closest host equivalent of a firmware reset.
pub struct ProcessRestart;

impl RestartHandle for ProcessRestart {
    fn restart(&mut self) {
        error!("unrecoverable fault, restarting device");
        std::process::exit(1);
    }
}
