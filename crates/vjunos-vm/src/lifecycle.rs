use crate::VmError;
use std::future::Future;

/// Power control for the virtual appliance. Used by the launcher to boot the
/// VM and by the boot poller to restart a stalled one.
pub trait ApplianceLifecycle {
    fn start(&mut self) -> impl Future<Output = Result<(), VmError>> + Send;

    fn stop(&mut self) -> impl Future<Output = Result<(), VmError>> + Send;
}
