//! Rendezvous of values between parties.
//!
//! Channels are keyed by (session, sender, receiver, rendezvous key);
//! exactly one value is transferred per key. Receivers suspend until
//! the matching send arrives; values from sends without a receiver are
//! retained until the session is released.

use crate::computation::{RendezvousKey, SessionId};
use crate::error::{Error, Result};
use crate::execution::Identity;
use crate::values::Value;
use async_cell::sync::AsyncCell;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;

pub mod tcp;

#[async_trait]
pub trait AsyncNetworking: Send + Sync {
    async fn send(
        &self,
        value: &Value,
        sender: &Identity,
        receiver: &Identity,
        rendezvous_key: &RendezvousKey,
        session_id: SessionId,
    ) -> Result<()>;

    async fn receive(
        &self,
        sender: &Identity,
        receiver: &Identity,
        rendezvous_key: &RendezvousKey,
        session_id: SessionId,
    ) -> Result<Value>;
}

#[derive(PartialEq, Eq, Hash, Clone, Debug)]
pub(crate) struct ChannelKey {
    pub session_id: SessionId,
    pub sender: Identity,
    pub receiver: Identity,
    pub rendezvous_key: RendezvousKey,
}

pub(crate) type ChannelStores = DashMap<ChannelKey, Arc<AsyncCell<Value>>>;

pub(crate) fn cell_for(stores: &ChannelStores, key: ChannelKey) -> Arc<AsyncCell<Value>> {
    stores
        .entry(key)
        .or_insert_with(AsyncCell::shared)
        .value()
        .clone()
}

/// In-process rendezvous used by tests and the local runtime; all
/// parties share one instance.
#[derive(Default)]
pub struct LocalNetworking {
    stores: ChannelStores,
    timeout: Option<Duration>,
}

impl LocalNetworking {
    pub fn new() -> LocalNetworking {
        LocalNetworking::default()
    }

    pub fn with_timeout(timeout: Duration) -> LocalNetworking {
        LocalNetworking {
            stores: ChannelStores::default(),
            timeout: Some(timeout),
        }
    }

    /// Reclaim every channel entry of the session, including values
    /// that were sent but never received.
    pub fn release_session(&self, session_id: SessionId) {
        self.stores.retain(|key, _| key.session_id != session_id);
    }
}

#[async_trait]
impl AsyncNetworking for LocalNetworking {
    async fn send(
        &self,
        value: &Value,
        sender: &Identity,
        receiver: &Identity,
        rendezvous_key: &RendezvousKey,
        session_id: SessionId,
    ) -> Result<()> {
        tracing::debug!(
            "Sending '{}' from {} to {} in session {}",
            rendezvous_key,
            sender,
            receiver,
            session_id
        );
        let cell = cell_for(
            &self.stores,
            ChannelKey {
                session_id,
                sender: sender.clone(),
                receiver: receiver.clone(),
                rendezvous_key: rendezvous_key.clone(),
            },
        );
        cell.set(value.clone());
        Ok(())
    }

    async fn receive(
        &self,
        sender: &Identity,
        receiver: &Identity,
        rendezvous_key: &RendezvousKey,
        session_id: SessionId,
    ) -> Result<Value> {
        let cell = cell_for(
            &self.stores,
            ChannelKey {
                session_id,
                sender: sender.clone(),
                receiver: receiver.clone(),
                rendezvous_key: rendezvous_key.clone(),
            },
        );
        match self.timeout {
            None => Ok(cell.get().await),
            Some(timeout) => tokio::time::timeout(timeout, cell.get()).await.map_err(|_| {
                Error::RendezvousTimeout {
                    rendezvous_key: rendezvous_key.to_string(),
                    sender: sender.to_string(),
                }
            }),
        }
    }
}
