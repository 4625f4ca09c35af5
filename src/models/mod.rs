mod entitlement;
mod reconciliation;
mod status;
mod subscription_event;
mod transaction;

pub use entitlement::*;
pub use reconciliation::*;
pub use status::*;
pub use subscription_event::*;
pub use transaction::*;
