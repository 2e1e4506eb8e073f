//! The message broker: session registry, router, heartbeat monitor,
//! and the TCP server that wires them together.

pub mod monitor;
pub mod registry;
pub mod router;
pub mod server;
pub mod session;
pub mod supervisor;

pub use registry::{RegisterError, Registry};
pub use router::{Delivery, RouteError, Router, RouterConfig};
pub use server::{BrokerError, BrokerHandle, run, start};
pub use session::{ConnId, Session};
pub use supervisor::{BrokerAccess, Ownership, acquire};
