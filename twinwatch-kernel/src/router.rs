/**
 * ROUTEUR D'ABONNEMENTS - Fan-out des événements machine vers les connexions autorisées
 *
 * RÔLE :
 * Associe chaque connexion vivante aux machines qu'elle peut observer et lui
 * délivre uniquement les événements de ces machines (admins : toutes).
 *
 * FONCTIONNEMENT :
 * - Clé structurée (machine_id, type) au lieu de noms d'événements dynamiques
 * - Une file bornée PAR connexion : publier ne bloque jamais, une connexion lente
 *   perd ses plus vieux messages (DropOldest) ou est déconnectée (Disconnect)
 * - Les connexions fermées sont retirées au publish suivant ou par prune_closed()
 *   (appelé à chaque balayage d'inactivité du moteur)
 * - Aucun état conservé entre deux connexions : le client se ré-abonne
 *
 * UTILITÉ DANS TWINWATCH :
 * 🎯 Isolation : un abonné non-admin de la machine A ne voit jamais B
 * 🎯 Robustesse : un abonné en échec n'affecte ni les autres ni l'émetteur
 */

use crate::models::{Alert, Role};
use crate::session::{MachineStatusChanged, MachineUpdate};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    MachineUpdate,
    MachineStatus,
    MachineAlert,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventKey {
    pub machine_id: String,
    pub kind: EventKind,
}

/// Événement adressé à une machine
#[derive(Debug, Clone, PartialEq)]
pub enum MachineEvent {
    Update(MachineUpdate),
    Status(MachineStatusChanged),
    /// Alerte complète, à l'ouverture comme à chaque changement de statut
    Alert(Alert),
}

impl MachineEvent {
    pub fn machine_id(&self) -> &str {
        match self {
            MachineEvent::Update(u) => &u.machine_id,
            MachineEvent::Status(s) => &s.machine_id,
            MachineEvent::Alert(a) => &a.machine_id,
        }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            MachineEvent::Update(_) => EventKind::MachineUpdate,
            MachineEvent::Status(_) => EventKind::MachineStatus,
            MachineEvent::Alert(_) => EventKind::MachineAlert,
        }
    }

    pub fn key(&self) -> EventKey {
        EventKey { machine_id: self.machine_id().to_string(), kind: self.kind() }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RouterError {
    #[error("unknown connection: {0}")]
    UnknownConnection(String),
    #[error("connection {connection_id} may not observe machine {machine_id}")]
    Unauthorized { connection_id: String, machine_id: String },
}

/// Échec de livraison vers UN abonné (jamais propagé aux autres)
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("subscriber queue closed")]
    Closed,
    #[error("subscriber queue full")]
    Overflow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    #[default]
    DropOldest,
    Disconnect,
}

/// Identité déclarée à la connexion (déjà authentifiée en amont)
#[derive(Debug, Clone)]
pub struct Identity {
    pub user_id: String,
    pub role: Role,
    /// Machines assignées à l'utilisateur
    pub machine_ids: HashSet<String>,
}

impl Identity {
    pub fn may_observe(&self, machine_id: &str) -> bool {
        self.role.is_admin() || self.machine_ids.contains(machine_id)
    }
}

#[derive(Default)]
struct QueueState {
    items: VecDeque<Arc<MachineEvent>>,
    closed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pushed {
    Queued,
    EvictedOldest,
}

struct DeliveryQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
    policy: OverflowPolicy,
}

impl DeliveryQueue {
    fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            capacity: capacity.max(1),
            policy,
        }
    }

    fn push(&self, event: Arc<MachineEvent>) -> Result<Pushed, DeliveryError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(DeliveryError::Closed);
        }
        let mut pushed = Pushed::Queued;
        if state.items.len() >= self.capacity {
            match self.policy {
                OverflowPolicy::DropOldest => {
                    state.items.pop_front();
                    pushed = Pushed::EvictedOldest;
                }
                OverflowPolicy::Disconnect => {
                    state.closed = true;
                    drop(state);
                    self.notify.notify_one();
                    return Err(DeliveryError::Overflow);
                }
            }
        }
        state.items.push_back(event);
        drop(state);
        self.notify.notify_one();
        Ok(pushed)
    }

    fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_one();
    }

    fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

/// Côté consommateur d'une connexion. Le drop ferme la file ; la connexion est
/// retirée du routeur au publish suivant ou au prochain `prune_closed`.
pub struct DeliveryReceiver {
    queue: Arc<DeliveryQueue>,
}

impl DeliveryReceiver {
    /// Prochain événement ; None une fois la file fermée et vidée
    pub async fn recv(&mut self) -> Option<Arc<MachineEvent>> {
        loop {
            {
                let mut state = self.queue.state.lock();
                if let Some(event) = state.items.pop_front() {
                    return Some(event);
                }
                if state.closed {
                    return None;
                }
            }
            self.queue.notify.notified().await;
        }
    }

    pub fn try_recv(&mut self) -> Option<Arc<MachineEvent>> {
        self.queue.state.lock().items.pop_front()
    }
}

impl Drop for DeliveryReceiver {
    fn drop(&mut self) {
        self.queue.close();
    }
}

struct Connection {
    identity: Identity,
    queue: Arc<DeliveryQueue>,
    machines: HashSet<String>,
}

#[derive(Default)]
struct RouterState {
    connections: HashMap<String, Connection>,
    by_machine: HashMap<String, HashSet<String>>,
    admins: HashSet<String>,
}

impl RouterState {
    fn remove(&mut self, connection_id: &str) -> Option<Connection> {
        let conn = self.connections.remove(connection_id)?;
        for machine_id in &conn.machines {
            if let Some(subs) = self.by_machine.get_mut(machine_id) {
                subs.remove(connection_id);
                if subs.is_empty() {
                    self.by_machine.remove(machine_id);
                }
            }
        }
        self.admins.remove(connection_id);
        conn.queue.close();
        Some(conn)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PublishReport {
    pub delivered: usize,
    /// Livrés en évinçant le plus vieux message de la file
    pub evicted: usize,
    pub failed: usize,
}

pub struct SubscriptionRouter {
    state: RwLock<RouterState>,
    capacity: usize,
    policy: OverflowPolicy,
    dropped: AtomicU64,
}

impl SubscriptionRouter {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            state: RwLock::new(RouterState::default()),
            capacity,
            policy,
            dropped: AtomicU64::new(0),
        }
    }

    /// Enregistre une connexion. Un id déjà connu remplace l'ancienne connexion
    /// (ses abonnements sont perdus, le client les redéclare).
    pub fn connect(&self, connection_id: &str, identity: Identity) -> DeliveryReceiver {
        let queue = Arc::new(DeliveryQueue::new(self.capacity, self.policy));
        let mut state = self.state.write();
        if state.remove(connection_id).is_some() {
            info!(connection_id, "connection replaced, previous subscriptions dropped");
        }
        debug!(connection_id, user_id = %identity.user_id, role = ?identity.role, "connection registered");
        state.connections.insert(connection_id.to_string(), Connection {
            identity,
            queue: queue.clone(),
            machines: HashSet::new(),
        });
        DeliveryReceiver { queue }
    }

    /// Idempotent : renvoie false si l'abonnement existait déjà.
    /// `is_admin` n'est accepté que pour une identité ADMIN et vaut pour toutes les machines.
    pub fn subscribe(&self, connection_id: &str, machine_id: &str, is_admin: bool) -> Result<bool, RouterError> {
        let mut guard = self.state.write();
        let state = &mut *guard;
        let conn = state
            .connections
            .get_mut(connection_id)
            .ok_or_else(|| RouterError::UnknownConnection(connection_id.to_string()))?;

        let unauthorized = || RouterError::Unauthorized {
            connection_id: connection_id.to_string(),
            machine_id: machine_id.to_string(),
        };

        if is_admin {
            if !conn.identity.role.is_admin() {
                return Err(unauthorized());
            }
            return Ok(state.admins.insert(connection_id.to_string()));
        }

        if !conn.identity.may_observe(machine_id) {
            return Err(unauthorized());
        }
        if !conn.machines.insert(machine_id.to_string()) {
            return Ok(false);
        }
        state
            .by_machine
            .entry(machine_id.to_string())
            .or_default()
            .insert(connection_id.to_string());
        Ok(true)
    }

    /// Sans effet si la connexion est inconnue ou déjà retirée
    pub fn unsubscribe_all(&self, connection_id: &str) -> bool {
        let removed = self.state.write().remove(connection_id).is_some();
        if removed {
            debug!(connection_id, "connection removed");
        }
        removed
    }

    /// Livre l'événement aux abonnés de la machine et aux admins, chacun sur sa file
    pub fn publish(&self, event: MachineEvent) -> PublishReport {
        let targets: Vec<(String, Arc<DeliveryQueue>)> = {
            let state = self.state.read();
            let mut ids: HashSet<&String> = state.admins.iter().collect();
            if let Some(subs) = state.by_machine.get(event.machine_id()) {
                ids.extend(subs.iter());
            }
            ids.into_iter()
                .filter_map(|id| state.connections.get(id).map(|c| (id.clone(), c.queue.clone())))
                .collect()
        };

        let event = Arc::new(event);
        let mut report = PublishReport::default();
        let mut stale = Vec::new();
        for (connection_id, queue) in targets {
            match queue.push(event.clone()) {
                Ok(Pushed::Queued) => report.delivered += 1,
                Ok(Pushed::EvictedOldest) => {
                    report.delivered += 1;
                    report.evicted += 1;
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    warn!(connection_id = %connection_id, machine_id = %event.machine_id(), "delivery failed: {e}");
                    report.failed += 1;
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    stale.push(connection_id);
                }
            }
        }

        if !stale.is_empty() {
            let mut state = self.state.write();
            for connection_id in stale {
                // la connexion a pu être remplacée entre-temps
                let closed = state.connections.get(&connection_id).is_some_and(|c| c.queue.is_closed());
                if closed {
                    state.remove(&connection_id);
                }
            }
        }
        report
    }

    /// Retire les connexions dont la file est fermée (récepteur abandonné,
    /// débordement en mode Disconnect). Renvoie le nombre de connexions retirées.
    pub fn prune_closed(&self) -> usize {
        let mut state = self.state.write();
        let closed: Vec<String> = state
            .connections
            .iter()
            .filter(|(_, c)| c.queue.is_closed())
            .map(|(id, _)| id.clone())
            .collect();
        for connection_id in &closed {
            state.remove(connection_id);
            debug!(connection_id = %connection_id, "closed connection pruned");
        }
        closed.len()
    }

    pub fn connection_count(&self) -> usize {
        self.state.read().connections.len()
    }

    pub fn is_connected(&self, connection_id: &str) -> bool {
        self.state.read().connections.contains_key(connection_id)
    }

    /// Machines explicitement suivies par une connexion
    pub fn subscriptions(&self, connection_id: &str) -> Option<HashSet<String>> {
        self.state.read().connections.get(connection_id).map(|c| c.machines.clone())
    }

    pub fn dropped_deliveries(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MachineStatus;

    fn identity(role: Role, machines: &[&str]) -> Identity {
        Identity {
            user_id: "u1".into(),
            role,
            machine_ids: machines.iter().map(|m| m.to_string()).collect(),
        }
    }

    fn status(machine: &str) -> MachineEvent {
        MachineEvent::Status(MachineStatusChanged {
            machine_id: machine.into(),
            status: MachineStatus::Active,
            streaming: true,
        })
    }

    #[test]
    fn test_subscribe_is_idempotent() {
        let router = SubscriptionRouter::new(8, OverflowPolicy::DropOldest);
        let _rx = router.connect("c1", identity(Role::Engineer, &["A"]));
        assert_eq!(router.subscribe("c1", "A", false), Ok(true));
        assert_eq!(router.subscribe("c1", "A", false), Ok(false));
        assert_eq!(router.publish(status("A")).delivered, 1);
    }

    #[test]
    fn test_subscription_isolation() {
        let router = SubscriptionRouter::new(8, OverflowPolicy::DropOldest);
        let mut rx = router.connect("c1", identity(Role::Engineer, &["A", "B"]));
        router.subscribe("c1", "A", false).unwrap();

        let report = router.publish(status("B"));
        assert_eq!(report, PublishReport::default());
        assert!(rx.try_recv().is_none());

        router.publish(status("A"));
        let got = rx.try_recv().unwrap();
        assert_eq!(got.key(), EventKey { machine_id: "A".into(), kind: EventKind::MachineStatus });
    }

    #[test]
    fn test_unauthorized_subscription_keeps_connection() {
        let router = SubscriptionRouter::new(8, OverflowPolicy::DropOldest);
        let _rx = router.connect("c1", identity(Role::Maintenance, &["A"]));
        assert!(matches!(router.subscribe("c1", "B", false), Err(RouterError::Unauthorized { .. })));
        assert!(matches!(router.subscribe("c1", "", true), Err(RouterError::Unauthorized { .. })));
        assert!(router.is_connected("c1"));
        assert_eq!(router.subscribe("c1", "A", false), Ok(true));
        assert_eq!(
            router.subscribe("ghost", "A", false),
            Err(RouterError::UnknownConnection("ghost".into()))
        );
    }

    #[test]
    fn test_admin_receives_every_machine_once() {
        let router = SubscriptionRouter::new(8, OverflowPolicy::DropOldest);
        let mut rx = router.connect("admin", identity(Role::Admin, &[]));
        assert_eq!(router.subscribe("admin", "", true), Ok(true));
        // abonnement explicite en plus : pas de double livraison
        router.subscribe("admin", "A", false).unwrap();

        router.publish(status("Z"));
        router.publish(status("A"));
        assert_eq!(rx.try_recv().unwrap().machine_id(), "Z");
        assert_eq!(rx.try_recv().unwrap().machine_id(), "A");
        assert!(rx.try_recv().is_none());
    }

    #[test]
    fn test_unsubscribe_all_is_idempotent() {
        let router = SubscriptionRouter::new(8, OverflowPolicy::DropOldest);
        assert!(!router.unsubscribe_all("never"));
        let _rx = router.connect("c1", identity(Role::Engineer, &["A"]));
        router.subscribe("c1", "A", false).unwrap();
        assert!(router.unsubscribe_all("c1"));
        assert!(!router.unsubscribe_all("c1"));
        assert_eq!(router.publish(status("A")).delivered, 0);
    }

    #[test]
    fn test_drop_oldest_on_overflow() {
        let router = SubscriptionRouter::new(2, OverflowPolicy::DropOldest);
        let mut slow = router.connect("slow", identity(Role::Engineer, &["A"]));
        router.subscribe("slow", "A", false).unwrap();
        for machine in ["A", "A", "A"] {
            router.publish(MachineEvent::Status(MachineStatusChanged {
                machine_id: machine.into(),
                status: MachineStatus::Idle,
                streaming: false,
            }));
        }
        router.publish(status("A"));
        assert_eq!(router.dropped_deliveries(), 2);
        assert!(matches!(&*slow.try_recv().unwrap(), MachineEvent::Status(s) if s.status == MachineStatus::Idle));
        assert!(matches!(&*slow.try_recv().unwrap(), MachineEvent::Status(s) if s.status == MachineStatus::Active));
    }

    #[test]
    fn test_disconnect_policy_isolates_slow_subscriber() {
        let router = SubscriptionRouter::new(1, OverflowPolicy::Disconnect);
        let _slow = router.connect("slow", identity(Role::Engineer, &["A"]));
        let mut fast = router.connect("fast", identity(Role::Engineer, &["A"]));
        router.subscribe("slow", "A", false).unwrap();
        router.subscribe("fast", "A", false).unwrap();

        router.publish(status("A"));
        fast.try_recv().unwrap();
        let report = router.publish(status("A"));
        assert_eq!(report.delivered, 1);
        assert_eq!(report.failed, 1);
        assert!(!router.is_connected("slow"));
        assert!(fast.try_recv().is_some());
    }

    #[test]
    fn test_dropped_receiver_is_pruned() {
        let router = SubscriptionRouter::new(4, OverflowPolicy::DropOldest);
        let rx = router.connect("c1", identity(Role::Engineer, &["A"]));
        router.subscribe("c1", "A", false).unwrap();
        drop(rx);
        let report = router.publish(status("A"));
        assert_eq!(report.failed, 1);
        assert_eq!(router.connection_count(), 0);
    }

    #[test]
    fn test_prune_closed_without_publish() {
        let router = SubscriptionRouter::new(4, OverflowPolicy::DropOldest);
        let rx = router.connect("gone", identity(Role::Engineer, &["A"]));
        let _live = router.connect("live", identity(Role::Engineer, &["A"]));
        router.subscribe("gone", "A", false).unwrap();
        router.subscribe("live", "A", false).unwrap();
        drop(rx);
        assert_eq!(router.connection_count(), 2);

        assert_eq!(router.prune_closed(), 1);
        assert_eq!(router.connection_count(), 1);
        assert!(!router.is_connected("gone"));
        assert_eq!(router.prune_closed(), 0);
        assert_eq!(router.publish(status("A")), PublishReport { delivered: 1, evicted: 0, failed: 0 });
    }

    #[tokio::test]
    async fn test_recv_wakes_on_publish_and_ends_on_close() {
        let router = Arc::new(SubscriptionRouter::new(4, OverflowPolicy::DropOldest));
        let mut rx = router.connect("c1", identity(Role::Engineer, &["A"]));
        router.subscribe("c1", "A", false).unwrap();

        let publisher = router.clone();
        let handle = tokio::spawn(async move {
            tokio::task::yield_now().await;
            publisher.publish(status("A"));
            publisher.unsubscribe_all("c1");
        });

        let first = rx.recv().await.unwrap();
        assert_eq!(first.kind(), EventKind::MachineStatus);
        assert!(rx.recv().await.is_none());
        handle.await.unwrap();
    }

    #[test]
    fn test_reconnect_starts_clean() {
        let router = SubscriptionRouter::new(4, OverflowPolicy::DropOldest);
        let _old = router.connect("c1", identity(Role::Engineer, &["A"]));
        router.subscribe("c1", "A", false).unwrap();
        let _new = router.connect("c1", identity(Role::Engineer, &["A"]));
        assert_eq!(router.subscriptions("c1"), Some(HashSet::new()));
        assert_eq!(router.subscribe("c1", "A", false), Ok(true));
    }
}
