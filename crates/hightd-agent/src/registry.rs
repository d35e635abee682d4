use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use hightd_store::Record as _;
use sqlx::SqlitePool;
use tokio::sync::RwLock;

use crate::docker::ContainerDriver;
use crate::instance::{self, ServerInstance};
use crate::sandbox;

/// Process-wide index of managed servers. Lookups across different ids are
/// lock-free of each other; operations on one instance are serialized by
/// that instance.
pub struct ServerRegistry {
    base: PathBuf,
    docker: ContainerDriver,
    pool: SqlitePool,
    servers: RwLock<HashMap<String, Arc<ServerInstance>>>,
}

fn valid_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

impl ServerRegistry {
    pub async fn open(
        base: PathBuf,
        docker: ContainerDriver,
        pool: SqlitePool,
    ) -> anyhow::Result<Arc<Self>> {
        tokio::fs::create_dir_all(&base)
            .await
            .with_context(|| format!("create server base directory {}", base.display()))?;
        hightd_store::ensure_table(&pool, hightd_store::ServerRecord::table()).await?;
        Ok(Arc::new(Self {
            base,
            docker,
            pool,
            servers: RwLock::new(HashMap::new()),
        }))
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Re-bind in-memory instances to whatever the runtime already holds.
    /// A container that survived an agent restart is adopted with its
    /// original start time; everything else comes up stopped.
    pub async fn reconcile(&self) -> anyhow::Result<()> {
        let records: Vec<hightd_store::ServerRecord> = hightd_store::get_all(&self.pool).await?;

        for record in records {
            let id = record.server_id;
            let dir = sandbox::server_root(&self.base, &id);
            if let Err(err) = tokio::fs::create_dir_all(&dir).await {
                tracing::warn!(server = %id, %err, "could not ensure server directory");
            }

            let instance = ServerInstance::new(id.clone(), dir, self.docker.clone());

            match self.docker.inspect(&instance.container_name()).await {
                Ok(snap) if snap.running => {
                    let started_at = instance::parse_runtime_time(snap.started_at.as_deref());
                    instance.adopt(started_at).await;
                    tracing::info!(server = %id, "adopted running container");
                }
                Ok(_) => {
                    tracing::info!(server = %id, "container present but stopped");
                }
                Err(_) => {}
            }

            self.servers.write().await.insert(id, instance);
        }
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Option<Arc<ServerInstance>> {
        self.servers.read().await.get(id).cloned()
    }

    /// Exact id first, then a unique prefix across the registry; an
    /// ambiguous prefix resolves to nothing.
    pub async fn find(&self, id_or_prefix: &str) -> Option<Arc<ServerInstance>> {
        let servers = self.servers.read().await;
        if let Some(found) = servers.get(id_or_prefix) {
            return Some(found.clone());
        }

        let mut matches = servers
            .iter()
            .filter(|(id, _)| id.starts_with(id_or_prefix))
            .map(|(_, inst)| inst.clone());
        match (matches.next(), matches.next()) {
            (Some(only), None) => Some(only),
            _ => None,
        }
    }

    pub async fn ids(&self) -> Vec<String> {
        self.servers.read().await.keys().cloned().collect()
    }

    /// Allocate the sandbox directory, persist the id and register the
    /// instance.
    pub async fn create(&self, id: &str) -> anyhow::Result<Arc<ServerInstance>> {
        if !valid_id(id) {
            anyhow::bail!("invalid server id: {id:?}");
        }
        if self.servers.read().await.contains_key(id) {
            anyhow::bail!("server already exists: {id}");
        }

        let dir = sandbox::server_root(&self.base, id);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("create server directory {}", dir.display()))?;

        hightd_store::insert(&self.pool, &hightd_store::ServerRecord::new(id)).await?;

        let instance = ServerInstance::new(id, dir, self.docker.clone());
        self.servers
            .write()
            .await
            .insert(id.to_string(), instance.clone());
        Ok(instance)
    }

    /// Destroy the instance (container, state, sandbox directory) and drop
    /// it from the index and the store.
    pub async fn remove(&self, id: &str) -> anyhow::Result<()> {
        let Some(instance) = self.get(id).await else {
            anyhow::bail!("unknown server: {id}");
        };

        instance.delete().await?;
        self.servers.write().await.remove(id);
        hightd_store::delete_by(&self.pool, hightd_store::ServerRecord::table(), "server_id", id)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_validation_rejects_path_material() {
        assert!(valid_id("s1"));
        assert!(valid_id("abc-123_X"));
        assert!(!valid_id(""));
        assert!(!valid_id("../x"));
        assert!(!valid_id("a/b"));
        assert!(!valid_id("a b"));
    }

    async fn registry_with(ids: &[&str]) -> Option<Arc<ServerRegistry>> {
        // Prefix lookup is pure registry logic; skip when no runtime socket
        // exists to build a driver from.
        let docker = ContainerDriver::connect().ok()?;
        let pool = hightd_store::open("sqlite::memory:").await.ok()?;
        let tmp = std::env::temp_dir().join("hightd-registry-test");
        let registry = ServerRegistry::open(tmp, docker, pool).await.ok()?;
        for id in ids {
            registry.create(id).await.ok()?;
        }
        Some(registry)
    }

    #[tokio::test]
    async fn unique_prefix_resolves_ambiguous_does_not() {
        let Some(registry) = registry_with(&["alpha1", "alpha2", "beta"]).await else {
            return;
        };

        assert!(registry.find("alpha1").await.is_some());
        assert_eq!(
            registry.find("bet").await.map(|i| i.id().to_string()),
            Some("beta".to_string())
        );
        assert!(registry.find("alpha").await.is_none());
        assert!(registry.find("gamma").await.is_none());

        for id in ["alpha1", "alpha2", "beta"] {
            let _ = registry.remove(id).await;
        }
    }

    #[tokio::test]
    async fn create_rejects_duplicates() {
        let Some(registry) = registry_with(&["dup1"]).await else {
            return;
        };
        assert!(registry.create("dup1").await.is_err());
        let _ = registry.remove("dup1").await;
    }
}
