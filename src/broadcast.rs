//! # Broadcast
//! Subscription registry plus filtered fan-out.
//!
//! Every connection gets an unbounded channel; the transport task on the
//! other end drains the receiver. A send only fails once that receiver is
//! gone, and such a connection is dropped together with its subscription
//! so nothing further is ever queued for it.
//!
//! All registry state sits behind one mutex. Sends on an unbounded channel
//! never block, so the lock is never held across an await.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use metrics::gauge;
use tokio::sync::mpsc;

use crate::error::DeliveryError;
use crate::model::{OutboundEvent, Subscription, Update};

pub type EventReceiver = mpsc::UnboundedReceiver<OutboundEvent>;

#[derive(Default)]
struct Registry {
    connections: HashMap<String, mpsc::UnboundedSender<OutboundEvent>>,
    subscriptions: HashMap<String, Subscription>,
}

impl Registry {
    fn drop_connection(&mut self, id: &str) {
        self.connections.remove(id);
        self.subscriptions.remove(id);
    }
}

#[derive(Default)]
pub struct Broadcaster {
    inner: Mutex<Registry>,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection. Reconnecting under the same id replaces the
    /// old channel; its subscription is kept.
    pub fn connect(&self, connection_id: &str) -> EventReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().connections.insert(connection_id.to_string(), tx);
        tracing::debug!(connection = connection_id, "connection registered");
        rx
    }

    pub fn disconnect(&self, connection_id: &str) {
        let mut reg = self.lock();
        reg.drop_connection(connection_id);
        publish_gauge(reg.subscriptions.len());
        tracing::debug!(connection = connection_id, "connection dropped");
    }

    /// Register or overwrite the filter for a connected client.
    pub fn subscribe(&self, subscription: Subscription) -> Result<(), DeliveryError> {
        let mut reg = self.lock();
        if !reg.connections.contains_key(&subscription.connection_id) {
            return Err(DeliveryError::UnknownConnection(
                subscription.connection_id,
            ));
        }
        tracing::info!(
            connection = %subscription.connection_id,
            regions = subscription.regions.len(),
            sources = subscription.sources.len(),
            min_change = subscription.min_change_threshold,
            "subscription registered"
        );
        reg.subscriptions
            .insert(subscription.connection_id.clone(), subscription);
        publish_gauge(reg.subscriptions.len());
        Ok(())
    }

    /// Returns whether a subscription existed.
    pub fn unsubscribe(&self, connection_id: &str) -> bool {
        let mut reg = self.lock();
        let existed = reg.subscriptions.remove(connection_id).is_some();
        publish_gauge(reg.subscriptions.len());
        existed
    }

    pub fn subscription(&self, connection_id: &str) -> Option<Subscription> {
        self.lock().subscriptions.get(connection_id).cloned()
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscriptions.len()
    }

    pub fn connection_count(&self) -> usize {
        self.lock().connections.len()
    }

    /// Filter `updates` per subscription and deliver each non-empty subset.
    /// Returns the number of connections that received something.
    pub fn broadcast(&self, updates: &[Update]) -> usize {
        if updates.is_empty() {
            return 0;
        }
        let mut reg = self.lock();
        let mut delivered = 0;
        let mut failed = Vec::new();

        for (id, sub) in &reg.subscriptions {
            let matching: Vec<Update> = updates.iter().filter(|u| sub.matches(u)).cloned().collect();
            if matching.is_empty() {
                continue;
            }
            let sent = reg
                .connections
                .get(id)
                .map(|tx| tx.send(OutboundEvent::FactorUpdates { updates: matching }).is_ok())
                .unwrap_or(false);
            if sent {
                delivered += 1;
            } else {
                failed.push(id.clone());
            }
        }

        prune(&mut reg, failed);
        delivered
    }

    /// Unfiltered notice to every subscriber.
    pub fn broadcast_recalculation(&self, updates: &[Update], timestamp: DateTime<Utc>) -> usize {
        let mut reg = self.lock();
        let event = OutboundEvent::RecalculationRequired {
            updates: updates.to_vec(),
            timestamp,
        };
        let mut delivered = 0;
        let mut failed = Vec::new();
        for id in reg.subscriptions.keys() {
            match reg.connections.get(id) {
                Some(tx) if tx.send(event.clone()).is_ok() => delivered += 1,
                _ => failed.push(id.clone()),
            }
        }
        prune(&mut reg, failed);
        delivered
    }

    /// Direct reply to one connection (e.g. a snapshot dump).
    pub fn send_to(&self, connection_id: &str, event: OutboundEvent) -> Result<(), DeliveryError> {
        let mut reg = self.lock();
        let Some(tx) = reg.connections.get(connection_id) else {
            return Err(DeliveryError::UnknownConnection(connection_id.to_string()));
        };
        if tx.send(event).is_err() {
            prune(&mut reg, vec![connection_id.to_string()]);
            return Err(DeliveryError::ConnectionClosed(connection_id.to_string()));
        }
        Ok(())
    }

    /// Drop every connection; receivers observe end-of-stream.
    pub fn close_all(&self) {
        let mut reg = self.lock();
        reg.connections.clear();
        reg.subscriptions.clear();
        publish_gauge(0);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn prune(reg: &mut Registry, failed: Vec<String>) {
    for id in failed {
        tracing::warn!(connection = %id, "delivery failed, removing subscription");
        reg.drop_connection(&id);
    }
    publish_gauge(reg.subscriptions.len());
}

fn publish_gauge(n: usize) {
    gauge!("factor_subscribers_active").set(n as f64);
}
