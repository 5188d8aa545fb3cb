// src/core/registry.rs

//! The server registry: tracks every managed database server, hands out
//! pooled connections, and reports lost servers to the event bus.

use crate::core::conn::{ConnectionPool, Connector, PooledConn};
use crate::core::errors::FabricError;
use crate::core::events::{EventBus, SERVER_LOST};
use crate::core::store::entities::{self, Server, ServerStatus};
use crate::core::store::{MetadataStore, read_entity, scan_entities, write_entity};
use dashmap::DashMap;
use serde_json::json;
use std::sync::{Arc, OnceLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub struct ServerRegistry {
    store: Arc<dyn MetadataStore>,
    connector: Arc<dyn Connector>,
    pool: ConnectionPool,
    /// Write-through cache of the `servers` table.
    cache: DashMap<Uuid, Server>,
    /// Wired after construction; the event bus is initialized last (§5
    /// singleton order), so the registry receives it once both exist.
    events: OnceLock<Arc<EventBus>>,
}

impl ServerRegistry {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        connector: Arc<dyn Connector>,
        connections_per_server: usize,
    ) -> Self {
        Self {
            store,
            connector,
            pool: ConnectionPool::new(connections_per_server),
            cache: DashMap::new(),
            events: OnceLock::new(),
        }
    }

    pub fn set_event_bus(&self, bus: Arc<EventBus>) {
        let _ = self.events.set(bus);
    }

    /// Warms the cache from the metadata store at startup.
    pub async fn load(&self) -> Result<(), FabricError> {
        let mut txn = self.store.begin().await;
        let servers: Vec<Server> = scan_entities(txn.as_mut(), entities::tables::SERVERS).await?;
        txn.rollback().await?;
        for server in servers {
            self.cache.insert(server.uuid, server);
        }
        info!("server registry loaded {} server(s)", self.cache.len());
        Ok(())
    }

    /// Contacts a server to learn its self-generated uuid.
    pub async fn discover_uuid(
        &self,
        address: &str,
        user: &str,
        passwd: &str,
    ) -> Result<Uuid, FabricError> {
        let conn = self.connector.connect(address, user, passwd).await?;
        conn.server_uuid().await
    }

    /// Registers a server. Re-adding the same uuid under a different address
    /// is rejected outright: two servers claiming one identity is the
    /// signature of a split brain.
    pub async fn add(&self, server: Server) -> Result<(), FabricError> {
        let mut txn = self.store.begin().await;
        let existing: Option<Server> = read_entity(
            txn.as_mut(),
            entities::tables::SERVERS,
            &server.uuid.to_string(),
        )
        .await?;
        if let Some(existing) = existing
            && existing.address != server.address
        {
            txn.rollback().await?;
            return Err(FabricError::Server(format!(
                "uuid {} is already registered at {}, refusing to re-register at {}",
                server.uuid, existing.address, server.address
            )));
        }
        write_entity(
            txn.as_mut(),
            entities::tables::SERVERS,
            &server.uuid.to_string(),
            &server,
        )
        .await?;
        txn.commit().await?;
        self.cache.insert(server.uuid, server);
        Ok(())
    }

    pub async fn remove(&self, uuid: Uuid) -> Result<(), FabricError> {
        let mut txn = self.store.begin().await;
        txn.delete(entities::tables::SERVERS, &uuid.to_string())
            .await?;
        txn.commit().await?;
        self.cache.remove(&uuid);
        self.pool.forget(&uuid);
        Ok(())
    }

    pub fn lookup(&self, uuid: Uuid) -> Result<Server, FabricError> {
        self.cache
            .get(&uuid)
            .map(|s| s.clone())
            .ok_or_else(|| FabricError::Server(format!("no server with uuid {uuid}")))
    }

    /// Persists an updated server record, write-through.
    pub async fn update(&self, server: Server) -> Result<(), FabricError> {
        let mut txn = self.store.begin().await;
        write_entity(
            txn.as_mut(),
            entities::tables::SERVERS,
            &server.uuid.to_string(),
            &server,
        )
        .await?;
        txn.commit().await?;
        self.cache.insert(server.uuid, server);
        Ok(())
    }

    /// Opens a pooled connection to a registered server. A connection
    /// failure marks the server FAULTY and fires SERVER_LOST before the
    /// error is returned.
    pub async fn connect(&self, uuid: Uuid) -> Result<PooledConn, FabricError> {
        let server = self.lookup(uuid)?;
        match self
            .connector
            .connect(&server.address, &server.user, &server.passwd)
            .await
        {
            Ok(conn) => self.pool.check_out(uuid, conn).await,
            Err(e @ FabricError::Connect(_)) => {
                warn!("lost contact with server {uuid} at {}", server.address);
                self.mark_faulty(server).await?;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    async fn mark_faulty(&self, mut server: Server) -> Result<(), FabricError> {
        if server.status == ServerStatus::Faulty {
            return Ok(());
        }
        server.status = ServerStatus::Faulty;
        let uuid = server.uuid;
        let address = server.address.clone();
        self.update(server).await?;
        if let Some(bus) = self.events.get() {
            match bus.trigger(&SERVER_LOST, vec![json!(uuid.to_string()), json!(address)]) {
                Ok(jobs) => debug!("SERVER_LOST scheduled {} job(s)", jobs.len()),
                Err(e) => warn!("failed to trigger SERVER_LOST: {e}"),
            }
        }
        Ok(())
    }
}
