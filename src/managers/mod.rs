// # Domain Managers
//
// Each manager owns one slice of desired state and the writer
// handles for the dataplane it programs. Updates are absorbed
// synchronously in `on_update` with no kernel writes; the driver's
// apply phases then run `resolve_update_batch` (which may publish
// new messages for other managers) and `complete_deferred_work`
// (which queues writer operations). Managers never hold another
// manager's writer handles; coordination flows through the driver.

pub mod endpoint;
pub mod failsafe;
pub mod floating_ip;
pub mod host_ips;
pub mod ipsets;
pub mod nat;
pub mod overlay;
pub mod policy;
pub mod program_attach;
pub mod service_loop;
pub mod wireguard;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::proto::{DesiredStateUpdate, StatusUpdate};

pub use endpoint::EndpointManager;
pub use failsafe::FailsafeManager;
pub use floating_ip::FloatingIpManager;
pub use host_ips::HostIpManager;
pub use ipsets::IpSetsManager;
pub use nat::NatManager;
pub use overlay::OverlayManager;
pub use policy::{compile_policy_program, PolicyManager, PolicyRepo};
pub use program_attach::ProgramAttachManager;
pub use service_loop::ServiceLoopManager;
pub use wireguard::WireguardManager;

/// Writer handles shared between a manager and the driver's parallel
/// apply phase.
pub type SharedTableWriter = Arc<tokio::sync::Mutex<crate::tables::TableWriter>>;
pub type SharedRouteWriter = Arc<tokio::sync::Mutex<crate::routes::RouteTableWriter>>;
pub type SharedIpSetsWriter = Arc<tokio::sync::Mutex<crate::ipsets::IpSetsWriter>>;

/// The two-phase manager contract.
#[async_trait]
pub trait Manager: Send {
    /// Absorb one desired-state message. Pure state update; no
    /// kernel writes happen here.
    fn on_update(&mut self, msg: &DesiredStateUpdate);

    /// Pre-programming step; may publish messages for other managers,
    /// which the driver fans back out before programming.
    fn resolve_update_batch(&mut self) -> Vec<DesiredStateUpdate> {
        Vec::new()
    }

    /// Turn absorbed state into queued writer operations. Errors mark
    /// the driver dirty; the affected resource is retried next tick.
    async fn complete_deferred_work(&mut self) -> Result<()>;

    /// Route tables this manager owns; the driver applies and
    /// resyncs them at the defined points.
    fn route_table_syncers(&self) -> Vec<SharedRouteWriter> {
        Vec::new()
    }

    /// Pending endpoint-status reports, drained after each apply.
    fn take_status_updates(&mut self) -> Vec<StatusUpdate> {
        Vec::new()
    }
}

/// Tagged dispatch over the concrete managers, so the driver's loop
/// is static over a known set rather than trait objects.
pub enum ManagerKind {
    Endpoint(EndpointManager),
    Policy(PolicyManager),
    IpSets(IpSetsManager),
    Nat(NatManager),
    FloatingIp(FloatingIpManager),
    Overlay(OverlayManager),
    HostIps(HostIpManager),
    ServiceLoop(ServiceLoopManager),
    Wireguard(WireguardManager),
    ProgramAttach(ProgramAttachManager),
    Failsafe(FailsafeManager),
}

impl ManagerKind {
    pub fn name(&self) -> &'static str {
        match self {
            ManagerKind::Endpoint(_) => "endpoint",
            ManagerKind::Policy(_) => "policy",
            ManagerKind::IpSets(_) => "ipsets",
            ManagerKind::Nat(_) => "nat",
            ManagerKind::FloatingIp(_) => "floating-ip",
            ManagerKind::Overlay(_) => "overlay",
            ManagerKind::HostIps(_) => "host-ips",
            ManagerKind::ServiceLoop(_) => "service-loop",
            ManagerKind::Wireguard(_) => "wireguard",
            ManagerKind::ProgramAttach(_) => "program-attach",
            ManagerKind::Failsafe(_) => "failsafe",
        }
    }

    fn as_manager(&mut self) -> &mut dyn Manager {
        match self {
            ManagerKind::Endpoint(m) => m,
            ManagerKind::Policy(m) => m,
            ManagerKind::IpSets(m) => m,
            ManagerKind::Nat(m) => m,
            ManagerKind::FloatingIp(m) => m,
            ManagerKind::Overlay(m) => m,
            ManagerKind::HostIps(m) => m,
            ManagerKind::ServiceLoop(m) => m,
            ManagerKind::Wireguard(m) => m,
            ManagerKind::ProgramAttach(m) => m,
            ManagerKind::Failsafe(m) => m,
        }
    }

    pub fn on_update(&mut self, msg: &DesiredStateUpdate) {
        self.as_manager().on_update(msg)
    }

    pub fn resolve_update_batch(&mut self) -> Vec<DesiredStateUpdate> {
        self.as_manager().resolve_update_batch()
    }

    pub async fn complete_deferred_work(&mut self) -> Result<()> {
        self.as_manager().complete_deferred_work().await
    }

    pub fn route_table_syncers(&self) -> Vec<SharedRouteWriter> {
        match self {
            ManagerKind::Endpoint(m) => m.route_table_syncers(),
            ManagerKind::Overlay(m) => m.route_table_syncers(),
            _ => Vec::new(),
        }
    }

    pub fn take_status_updates(&mut self) -> Vec<StatusUpdate> {
        self.as_manager().take_status_updates()
    }
}
