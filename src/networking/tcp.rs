//! Network-backed rendezvous with the same semantics as the in-memory
//! channel manager: length-prefixed bincode frames over TCP.

use super::{cell_for, AsyncNetworking, ChannelKey, ChannelStores};
use crate::computation::{RendezvousKey, SessionId};
use crate::error::{Error, Result};
use crate::execution::Identity;
use crate::values::Value;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Host identities and their endpoints, typically loaded from a
/// cluster spec file.
#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct ClusterConfig {
    pub hosts: HashMap<String, SocketAddr>,
}

impl ClusterConfig {
    pub fn from_toml(source: &str) -> Result<ClusterConfig> {
        toml::from_str(source).map_err(|e| Error::Networking(e.to_string()))
    }
}

#[derive(Serialize, Deserialize, Debug)]
struct Frame {
    session_id: SessionId,
    sender: String,
    receiver: String,
    rendezvous_key: RendezvousKey,
    value: Value,
}

pub struct TcpNetworking {
    own_identity: Identity,
    hosts: HashMap<String, SocketAddr>,
    stores: Arc<ChannelStores>,
}

impl TcpNetworking {
    /// Bind the listener for the own endpoint and start accepting
    /// frames from peers.
    pub async fn start(own_identity: Identity, config: ClusterConfig) -> Result<Arc<TcpNetworking>> {
        let addr = *config.hosts.get(own_identity.as_str()).ok_or_else(|| {
            Error::Networking(format!("no endpoint configured for '{}'", own_identity))
        })?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Networking(format!("failed to bind {}: {}", addr, e)))?;

        let networking = Arc::new(TcpNetworking {
            own_identity,
            hosts: config.hosts,
            stores: Arc::new(ChannelStores::default()),
        });

        let stores = Arc::clone(&networking.stores);
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        tracing::debug!("Accepted connection from {}", peer);
                        let stores = Arc::clone(&stores);
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, stores).await {
                                tracing::warn!("Connection from {} failed: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::warn!("Failed to accept connection: {}", e);
                    }
                }
            }
        });

        Ok(networking)
    }

    pub fn release_session(&self, session_id: SessionId) {
        self.stores.retain(|key, _| key.session_id != session_id);
    }

    async fn connect(&self, receiver: &Identity) -> Result<TcpStream> {
        let addr = *self.hosts.get(receiver.as_str()).ok_or_else(|| {
            Error::Networking(format!("no endpoint configured for '{}'", receiver))
        })?;
        // The receiver may still be coming up; retry with backoff.
        backoff::future::retry(backoff::ExponentialBackoff::default(), || async {
            TcpStream::connect(addr)
                .await
                .map_err(backoff::Error::transient)
        })
        .await
        .map_err(|e| Error::Networking(format!("failed to connect to {}: {}", addr, e)))
    }
}

async fn handle_connection(mut stream: TcpStream, stores: Arc<ChannelStores>) -> Result<()> {
    loop {
        let length = match stream.read_u32().await {
            Ok(length) => length as usize,
            // Peer closed the connection.
            Err(_) => return Ok(()),
        };
        let mut buffer = vec![0u8; length];
        stream
            .read_exact(&mut buffer)
            .await
            .map_err(|e| Error::Networking(e.to_string()))?;
        let frame: Frame =
            bincode::deserialize(&buffer).map_err(|e| Error::Networking(e.to_string()))?;
        let cell = cell_for(
            &stores,
            ChannelKey {
                session_id: frame.session_id,
                sender: Identity::from(frame.sender),
                receiver: Identity::from(frame.receiver),
                rendezvous_key: frame.rendezvous_key,
            },
        );
        cell.set(frame.value);
    }
}

#[async_trait]
impl AsyncNetworking for TcpNetworking {
    async fn send(
        &self,
        value: &Value,
        sender: &Identity,
        receiver: &Identity,
        rendezvous_key: &RendezvousKey,
        session_id: SessionId,
    ) -> Result<()> {
        let frame = Frame {
            session_id,
            sender: sender.to_string(),
            receiver: receiver.to_string(),
            rendezvous_key: rendezvous_key.clone(),
            value: value.clone(),
        };
        let payload =
            bincode::serialize(&frame).map_err(|e| Error::Networking(e.to_string()))?;
        let mut stream = self.connect(receiver).await?;
        stream
            .write_u32(payload.len() as u32)
            .await
            .map_err(|e| Error::Networking(e.to_string()))?;
        stream
            .write_all(&payload)
            .await
            .map_err(|e| Error::Networking(e.to_string()))?;
        stream
            .flush()
            .await
            .map_err(|e| Error::Networking(e.to_string()))?;
        Ok(())
    }

    async fn receive(
        &self,
        sender: &Identity,
        _receiver: &Identity,
        rendezvous_key: &RendezvousKey,
        session_id: SessionId,
    ) -> Result<Value> {
        let cell = cell_for(
            &self.stores,
            ChannelKey {
                session_id,
                sender: sender.clone(),
                receiver: self.own_identity.clone(),
                rendezvous_key: rendezvous_key.clone(),
            },
        );
        Ok(cell.get().await)
    }
}
