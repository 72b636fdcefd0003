//! The burrow broker: public host of the reverse-tunnel service.
//!
//! Three cooperating pieces share one [`TunnelRegistry`](burrow_registry::TunnelRegistry):
//!
//! - the **control plane** ([`ControlPlane`]) accepts agent connections on
//!   `:4443`, runs the handshake, and binds hostnames;
//! - the **ingress dispatcher** ([`Ingress`]) accepts public HTTP(S)
//!   traffic and proxies each request over a fresh stream of the session
//!   that owns the target hostname;
//! - the **bandwidth ledger** ([`BandwidthLedger`]) meters every proxied
//!   exchange and refuses new streams once a user's daily allowance is
//!   spent.
//!
//! [`Broker`] wires them together behind a builder and runs them until a
//! shutdown signal.

pub mod bandwidth;
pub mod broker;
pub mod config;
pub mod control;
pub mod ingress;
pub mod site;

pub use bandwidth::BandwidthLedger;
pub use broker::{Broker, BrokerBuilder, BrokerError};
pub use config::BrokerConfig;
pub use control::ControlPlane;
pub use ingress::Ingress;
pub use site::{DashboardStub, LandingPage, RequestHead, SiteHandler};
