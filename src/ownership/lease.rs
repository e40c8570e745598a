//! Partition and node leases
//!
//! A [`PartitionLease`] is the local proof that this node may consume a
//! partition. It can be:
//! - revoked: the partition moves away; the message in progress finishes,
//!   nothing new starts
//! - fenced: ownership is gone; in-flight work is aborted immediately
//!
//! Each consumer restart opens a new round so that contexts dispatched by a
//! previous round are skipped if they were not started yet.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::domain::{
    assignment::{Epoch, FencingToken},
    error::PipelineError,
    record::PartitionId
};

#[derive(Debug, Clone)]
pub struct PartitionLease {
    token:   FencingToken,
    revoked: CancellationToken,
    fence:   CancellationToken,
    round:   CancellationToken
}

impl PartitionLease {
    pub fn new(token: FencingToken) -> Self {
        let revoked = CancellationToken::new();
        let round = revoked.child_token();
        Self { token, revoked, fence: CancellationToken::new(), round }
    }

    pub fn token(&self) -> &FencingToken {
        &self.token
    }

    pub fn partition(&self) -> PartitionId {
        self.token.partition
    }

    pub fn epoch(&self) -> Epoch {
        self.token.epoch
    }

    pub fn revoke(&self) {
        self.revoked.cancel();
    }

    pub fn is_revoked(&self) -> bool {
        self.revoked.is_cancelled()
    }

    pub async fn revoked(&self) {
        self.revoked.cancelled().await
    }

    pub fn fence(&self) {
        self.fence.cancel();
    }

    pub fn is_fenced(&self) -> bool {
        self.fence.is_cancelled()
    }

    /// Completes once the lease is fenced
    pub async fn fenced(&self) {
        self.fence.cancelled().await
    }

    /// Close the current round and return a lease for the next one
    pub fn next_round(&self) -> PartitionLease {
        self.round.cancel();
        PartitionLease {
            token:   self.token.clone(),
            revoked: self.revoked.clone(),
            fence:   self.fence.clone(),
            round:   self.revoked.child_token()
        }
    }

    /// Whether new work for this partition may start
    pub fn check(&self) -> Result<(), PipelineError> {
        if self.fence.is_cancelled() {
            Err(PipelineError::fenced(self.partition(), "lease fenced"))
        } else if self.revoked.is_cancelled() {
            Err(PipelineError::fenced(self.partition(), "lease revoked"))
        } else if self.round.is_cancelled() {
            Err(PipelineError::fenced(self.partition(), "consumer restarted"))
        } else {
            Ok(())
        }
    }
}

/// Tracks when this node last reached the assignment store
#[derive(Debug)]
pub struct NodeLease {
    renewed_at: Instant,
    timeout:    Duration
}

impl NodeLease {
    pub fn new(timeout: Duration) -> Self {
        Self { renewed_at: Instant::now(), timeout }
    }

    pub fn renew(&mut self) {
        self.renewed_at = Instant::now();
    }

    /// True once the store was unreachable for longer than the lease timeout
    pub fn expired(&self) -> bool {
        self.renewed_at.elapsed() > self.timeout
    }
}
