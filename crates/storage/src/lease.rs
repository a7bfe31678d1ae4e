//! Per-entity lease stored next to the archive.
//!
//! A worker creates `{logical}/.lease` with create-if-absent semantics before
//! mirroring and deletes it after the local mirror is discarded. A lease whose
//! `expires_at` has passed belongs to a worker that died mid-cycle and may be
//! taken over, so a holder working longer than one TTL must [`LeaseManager::renew`]
//! as it goes. Renewal is a conditional update on the version the holder last
//! wrote; a takeover changes that version and the renewal fails.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use object_store::{ObjectStore, PutMode, UpdateVersion};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use vault_core::LogicalPath;

use crate::backend::object_key;
use crate::error::StorageError;

const LEASE_FILE: &str = ".lease";

/// Create attempts before giving up on a lease that keeps changing hands.
const MAX_ACQUIRE_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub owner: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Proof of a held lease; hand it back to [`LeaseManager::release`].
#[derive(Debug)]
pub struct Lease {
    key: object_store::path::Path,
    /// Version of the lease object as last written by this holder.
    version: UpdateVersion,
    pub logical_path: LogicalPath,
    pub record: LeaseRecord,
}

enum LeaseState {
    Free,
    Held(LeaseRecord),
    Unreadable,
}

pub struct LeaseManager {
    store: Arc<dyn ObjectStore>,
    prefix: String,
    owner: String,
    ttl: Duration,
}

impl LeaseManager {
    /// Manager with a fresh random owner id for this process.
    pub fn new(store: Arc<dyn ObjectStore>, prefix: impl Into<String>, ttl: Duration) -> Self {
        Self::with_owner(store, prefix, format!("worker-{}", Uuid::new_v4()), ttl)
    }

    pub fn with_owner(
        store: Arc<dyn ObjectStore>,
        prefix: impl Into<String>,
        owner: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        Self {
            store,
            prefix: prefix.into().trim_matches('/').to_string(),
            owner: owner.into(),
            ttl,
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    fn key(&self, logical: &LogicalPath) -> object_store::path::Path {
        object_key(&self.prefix, &logical.join(LEASE_FILE))
    }

    fn new_record(&self) -> LeaseRecord {
        let now = Utc::now();
        LeaseRecord {
            owner: self.owner.clone(),
            acquired_at: now,
            expires_at: self.expiry_from(now),
        }
    }

    fn expiry_from(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::MAX);
        now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Claim the lease for `logical`, taking over expired or unreadable ones.
    pub async fn acquire(&self, logical: &LogicalPath) -> Result<Lease, StorageError> {
        let key = self.key(logical);

        for _ in 0..MAX_ACQUIRE_ATTEMPTS {
            let record = self.new_record();
            let body = serde_json::to_vec(&record).map_err(|e| StorageError::Serialize(e.to_string()))?;

            match self
                .store
                .put_opts(&key, bytes::Bytes::from(body).into(), PutMode::Create.into())
                .await
            {
                Ok(put) => {
                    debug!(logical_path = %logical, owner = %self.owner, "Lease acquired");
                    return Ok(Lease {
                        key,
                        version: put.into(),
                        logical_path: logical.clone(),
                        record,
                    });
                }
                Err(object_store::Error::AlreadyExists { .. }) => {}
                Err(e) => return Err(e.into()),
            }

            match self.read(&key).await? {
                // released between our create and read; try again
                LeaseState::Free => continue,
                LeaseState::Held(held) if held.owner != self.owner && held.expires_at > Utc::now() => {
                    return Err(StorageError::LeaseHeld {
                        logical_path: logical.to_string(),
                        owner: held.owner,
                        expires_at: held.expires_at,
                    });
                }
                LeaseState::Held(held) => {
                    info!(
                        logical_path = %logical,
                        previous_owner = %held.owner,
                        expired_at = %held.expires_at,
                        "Taking over stale lease"
                    );
                    self.delete(&key).await?;
                }
                LeaseState::Unreadable => {
                    warn!(logical_path = %logical, "Lease object unreadable, taking it over");
                    self.delete(&key).await?;
                }
            }
        }

        Err(StorageError::Other(format!(
            "lease on {logical} kept changing hands after {MAX_ACQUIRE_ATTEMPTS} attempts"
        )))
    }

    /// Push the lease's expiry one TTL past now.
    ///
    /// Fails with [`StorageError::LeaseLost`] once another worker has taken
    /// the lease over; the caller must stop mutating the entity.
    pub async fn renew(&self, lease: &mut Lease) -> Result<(), StorageError> {
        match self.read(&lease.key).await? {
            LeaseState::Held(current) if current.owner == lease.record.owner => {}
            LeaseState::Held(current) => {
                return Err(lost(lease, format!("taken over by {}", current.owner)));
            }
            LeaseState::Free => return Err(lost(lease, "lease object is gone".into())),
            LeaseState::Unreadable => return Err(lost(lease, "lease object is unreadable".into())),
        }

        let record = LeaseRecord {
            owner: lease.record.owner.clone(),
            acquired_at: lease.record.acquired_at,
            expires_at: self.expiry_from(Utc::now()),
        };
        let body = bytes::Bytes::from(
            serde_json::to_vec(&record).map_err(|e| StorageError::Serialize(e.to_string()))?,
        );

        let put = match self
            .store
            .put_opts(&lease.key, body.clone().into(), PutMode::Update(lease.version.clone()).into())
            .await
        {
            Ok(put) => put,
            // local filesystem: no conditional update, the owner check above is all we get
            Err(object_store::Error::NotImplemented) => self.store.put(&lease.key, body.into()).await?,
            Err(object_store::Error::Precondition { .. } | object_store::Error::NotFound { .. }) => {
                return Err(lost(lease, "lease object changed since last write".into()));
            }
            Err(e) => return Err(e.into()),
        };

        lease.version = put.into();
        lease.record = record;
        debug!(logical_path = %lease.logical_path, expires_at = %lease.record.expires_at, "Lease renewed");
        Ok(())
    }

    /// Give the lease back. A lease that has since been taken over by another
    /// worker is left alone.
    pub async fn release(&self, lease: Lease) -> Result<(), StorageError> {
        match self.read(&lease.key).await? {
            LeaseState::Held(current) if current.owner == lease.record.owner => {
                self.delete(&lease.key).await?;
                debug!(logical_path = %lease.logical_path, "Lease released");
            }
            LeaseState::Held(current) => {
                warn!(
                    logical_path = %lease.logical_path,
                    current_owner = %current.owner,
                    "Lease was taken over before release"
                );
            }
            LeaseState::Free | LeaseState::Unreadable => {
                warn!(logical_path = %lease.logical_path, "Lease vanished before release");
            }
        }
        Ok(())
    }

    async fn read(&self, key: &object_store::path::Path) -> Result<LeaseState, StorageError> {
        match self.store.get(key).await {
            Ok(result) => {
                let bytes = result.bytes().await?;
                Ok(serde_json::from_slice(&bytes)
                    .map(LeaseState::Held)
                    .unwrap_or(LeaseState::Unreadable))
            }
            Err(object_store::Error::NotFound { .. }) => Ok(LeaseState::Free),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, key: &object_store::path::Path) -> Result<(), StorageError> {
        match self.store.delete(key).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn lost(lease: &Lease, reason: String) -> StorageError {
    StorageError::LeaseLost {
        logical_path: lease.logical_path.to_string(),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;
    use vault_core::{Classify, FailureKind};

    fn managers(ttl_a: Duration) -> (LeaseManager, LeaseManager, Arc<InMemory>) {
        let memory = Arc::new(InMemory::new());
        let a = LeaseManager::with_owner(memory.clone(), "", "worker-a", ttl_a);
        let b = LeaseManager::with_owner(memory.clone(), "", "worker-b", Duration::from_secs(600));
        (a, b, memory)
    }

    #[tokio::test]
    async fn second_worker_is_turned_away() {
        let (a, b, _) = managers(Duration::from_secs(600));
        let logical = LogicalPath::new("edgar/data/1001");

        let lease = a.acquire(&logical).await.unwrap();
        assert_eq!(lease.record.owner, "worker-a");

        let err = b.acquire(&logical).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::Contended);
        assert!(matches!(err, StorageError::LeaseHeld { ref owner, .. } if owner == "worker-a"));

        a.release(lease).await.unwrap();
        let lease_b = b.acquire(&logical).await.unwrap();
        assert_eq!(lease_b.record.owner, "worker-b");
    }

    #[tokio::test]
    async fn expired_lease_is_taken_over() {
        let (a, b, _) = managers(Duration::ZERO);
        let logical = LogicalPath::new("edgar/data/1001");

        let stale = a.acquire(&logical).await.unwrap();
        let fresh = b.acquire(&logical).await.unwrap();
        assert_eq!(fresh.record.owner, "worker-b");

        // the previous holder's release must not drop the new lease
        a.release(stale).await.unwrap();
        let err = a.acquire(&logical).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn garbage_lease_is_replaced() {
        let (a, _, memory) = managers(Duration::from_secs(600));
        let logical = LogicalPath::new("edgar/data/77");
        let key = object_store::path::Path::from("edgar/data/77/.lease");
        memory
            .put(&key, bytes::Bytes::from_static(b"{oops").into())
            .await
            .unwrap();

        assert!(a.acquire(&logical).await.is_ok());
    }

    #[tokio::test]
    async fn renewal_keeps_a_long_holder_in_place() {
        let (a, b, _) = managers(Duration::from_millis(200));
        let logical = LogicalPath::new("edgar/data/1001");

        let mut lease = a.acquire(&logical).await.unwrap();
        let first_expiry = lease.record.expires_at;
        for _ in 0..3 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            a.renew(&mut lease).await.unwrap();
        }
        // 300 ms in: past the original expiry, still held
        assert!(lease.record.expires_at > first_expiry);
        let err = b.acquire(&logical).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::Contended);

        a.release(lease).await.unwrap();
    }

    #[tokio::test]
    async fn renewal_after_takeover_is_refused() {
        let (a, b, _) = managers(Duration::from_millis(50));
        let logical = LogicalPath::new("edgar/data/1001");

        let mut stale = a.acquire(&logical).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let taken = b.acquire(&logical).await.unwrap();
        assert_eq!(taken.record.owner, "worker-b");

        let err = a.renew(&mut stale).await.unwrap_err();
        assert!(matches!(err, StorageError::LeaseLost { .. }));
        assert_eq!(err.kind(), FailureKind::Contended);
    }

    #[tokio::test]
    async fn renewal_of_a_released_lease_is_refused() {
        let (a, _, memory) = managers(Duration::from_secs(600));
        let logical = LogicalPath::new("edgar/data/1001");

        let mut lease = a.acquire(&logical).await.unwrap();
        memory
            .delete(&object_store::path::Path::from("edgar/data/1001/.lease"))
            .await
            .unwrap();
        assert!(matches!(a.renew(&mut lease).await, Err(StorageError::LeaseLost { .. })));
    }

    #[tokio::test]
    async fn leases_are_per_logical_path() {
        let (a, b, _) = managers(Duration::from_secs(600));
        let _one = a.acquire(&LogicalPath::new("edgar/data/1")).await.unwrap();
        assert!(b.acquire(&LogicalPath::new("edgar/data/2")).await.is_ok());
    }
}
