use std::sync::Arc;

use tracing::{debug, warn};

use queueforge_core::{
    Clock, GatewayError, Lease, Message, OwnerToken, QueueError, Result, StorageGateway,
};

/// Result of a lease renewal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewOutcome {
    Renewed,
    /// The lease was reclaimed or taken over; in-flight work must stop.
    Lost,
}

/// Claims, renews and settles messages on behalf of one process.
///
/// Every claim is made with a fresh lease token derived from the process
/// owner token, so a message re-claimed inside the same process is a
/// different lease from the one it replaced.
pub struct LeaseCoordinator {
    gateway: Arc<dyn StorageGateway>,
    clock: Arc<dyn Clock>,
    owner: OwnerToken,
}

impl LeaseCoordinator {
    pub fn new(gateway: Arc<dyn StorageGateway>, clock: Arc<dyn Clock>) -> Self {
        Self::with_owner(gateway, clock, OwnerToken::generate())
    }

    pub fn with_owner(gateway: Arc<dyn StorageGateway>, clock: Arc<dyn Clock>, owner: OwnerToken) -> Self {
        Self {
            gateway,
            clock,
            owner,
        }
    }

    pub fn owner(&self) -> &OwnerToken {
        &self.owner
    }

    pub fn gateway(&self) -> &Arc<dyn StorageGateway> {
        &self.gateway
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Claim the next eligible message. `None` means the queue is empty for
    /// these routes; it never waits for work. The returned snapshot carries
    /// its lease (`Message::lease`).
    pub async fn claim(&self, routes: &[String]) -> Result<Option<Message>> {
        let token = self.owner.lease();
        let claimed = self
            .gateway
            .try_claim_next(routes, &token, self.clock.now())
            .await?;
        if let Some(msg) = &claimed {
            debug!(
                message_id = %msg.id,
                lease = %token,
                priority = msg.priority.unwrap_or(0),
                retry_count = msg.retry_count,
                "Claimed message"
            );
        }
        Ok(claimed)
    }

    pub async fn renew(&self, lease: &Lease) -> Result<RenewOutcome> {
        match self
            .gateway
            .heartbeat(lease.id, &lease.token, self.clock.now())
            .await
        {
            Ok(()) => Ok(RenewOutcome::Renewed),
            Err(e) if e.is_conflict() => {
                warn!(message_id = %lease.id, lease = %lease.token, "Lease lost during renewal");
                Ok(RenewOutcome::Lost)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Mark the message `Complete`. Repeating a commit is harmless.
    pub async fn commit(&self, lease: &Lease) -> Result<()> {
        match self.gateway.complete(lease.id, &lease.token).await {
            Ok(()) => {
                debug!(message_id = %lease.id, "Message completed");
                Ok(())
            }
            Err(GatewayError::NotOwned(id)) => Err(QueueError::NotOwned(id)),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn fail(&self, lease: &Lease, reason: &str) -> Result<()> {
        match self.gateway.fail(lease.id, &lease.token, reason).await {
            Ok(()) => {
                warn!(message_id = %lease.id, reason = %reason, "Message failed");
                Ok(())
            }
            Err(GatewayError::NotOwned(id)) => Err(QueueError::NotOwned(id)),
            Err(e) => Err(e.into()),
        }
    }
}
