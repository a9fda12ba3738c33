// Archivo: router.rs
// Propósito: punto de entrada de la red en un nodo. Resuelve cada sobre a
// la instancia de flujo que posee el extremo receptor y lo deja en su buzón;
// los `Open` se derivan al scheduler para crear el responder, y los mensajes
// sin dueño conocido esperan en un buffer acotado con caducidad.
//
// `route` nunca bloquea al transporte: sólo toma el cerrojo del buffer de
// pendientes durante la inserción y notifica al scheduler por un canal.
use crate::domain::{FlowId, NodeId, SessionId};
use crate::session::{Endpoint, Envelope, MessageKind, Role};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub max_pending: usize,
    pub pending_timeout: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self { max_pending: 1024,
               pending_timeout: Duration::from_secs(30) }
    }
}

/// Avisos del router al scheduler.
#[derive(Debug, Clone)]
pub enum RouterEvent {
    /// Hay correo en el buzón del flujo.
    Deliver(FlowId),
    /// Apertura de sesión: hay que crear el responder.
    SessionInit(Envelope),
    /// Mensaje sin dueño residente: buscarlo en el store.
    Hydrate(SessionId, Role),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    Delivered(FlowId),
    Initiating,
    Buffered,
}

#[derive(Debug, Clone)]
pub struct PendingMessage {
    pub envelope: Envelope,
    pub received_at: Instant,
}

#[derive(Default)]
struct Pending {
    queue: VecDeque<PendingMessage>,
    evicted: Vec<Envelope>,
}

pub struct MessageRouter {
    node: NodeId,
    config: RouterConfig,
    endpoints: DashMap<Endpoint, FlowId>,
    mailboxes: DashMap<FlowId, VecDeque<Envelope>>,
    pending: Mutex<Pending>,
    events: mpsc::UnboundedSender<RouterEvent>,
}

impl MessageRouter {
    pub fn new(node: NodeId, config: RouterConfig) -> (Self, mpsc::UnboundedReceiver<RouterEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { node,
                config,
                endpoints: DashMap::new(),
                mailboxes: DashMap::new(),
                pending: Mutex::new(Pending::default()),
                events: tx },
         rx)
    }

    pub fn node(&self) -> &NodeId {
        &self.node
    }

    pub fn route(&self, envelope: Envelope) -> RouteOutcome {
        self.route_at(envelope, Instant::now())
    }

    /// Igual que `route` con el instante de llegada explícito.
    pub fn route_at(&self, envelope: Envelope, now: Instant) -> RouteOutcome {
        if envelope.recipient != self.node {
            log::warn!("router {}: sobre dirigido a {}", self.node, envelope.recipient);
        }
        let endpoint = envelope.endpoint();
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(flow_id) = self.endpoints.get(&endpoint).map(|e| *e.value()) {
            drop(pending);
            self.mailboxes.entry(flow_id).or_default().push_back(envelope);
            self.notify(RouterEvent::Deliver(flow_id));
            return RouteOutcome::Delivered(flow_id);
        }
        if matches!(envelope.message.kind, MessageKind::Open { .. }) {
            drop(pending);
            self.notify(RouterEvent::SessionInit(envelope));
            return RouteOutcome::Initiating;
        }
        pending.queue.push_back(PendingMessage { envelope,
                                                 received_at: now });
        while pending.queue.len() > self.config.max_pending {
            if let Some(oldest) = pending.queue.pop_front() {
                log::warn!("router {}: buffer de pendientes lleno, se descarta {:?}",
                           self.node,
                           oldest.envelope.dedup_key());
                pending.evicted.push(oldest.envelope);
            }
        }
        drop(pending);
        self.notify(RouterEvent::Hydrate(endpoint.0, endpoint.1));
        RouteOutcome::Buffered
    }

    /// Asocia un extremo a su flujo y le entrega lo que esperaba en el
    /// buffer de pendientes.
    pub fn register(&self, flow_id: FlowId, session: SessionId, role: Role) {
        let endpoint = (session, role);
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        if self.endpoints.insert(endpoint, flow_id).is_some() {
            return;
        }
        let mut released = Vec::new();
        pending.queue.retain(|p| {
                         if p.envelope.endpoint() == endpoint {
                             released.push(p.envelope.clone());
                             false
                         } else {
                             true
                         }
                     });
        drop(pending);
        if !released.is_empty() {
            log::debug!("router {}: {} pendientes liberados para {}", self.node, released.len(), flow_id);
            self.mailboxes.entry(flow_id).or_default().extend(released);
            self.notify(RouterEvent::Deliver(flow_id));
        }
    }

    pub fn unregister(&self, session: SessionId, role: Role) {
        self.endpoints.remove(&(session, role));
    }

    pub fn resolve(&self, endpoint: &Endpoint) -> Option<FlowId> {
        self.endpoints.get(endpoint).map(|e| *e.value())
    }

    /// Entrega directa a un buzón, sin resolver el extremo.
    pub fn deliver_to(&self, flow_id: FlowId, envelope: Envelope) {
        self.mailboxes.entry(flow_id).or_default().push_back(envelope);
        self.notify(RouterEvent::Deliver(flow_id));
    }

    pub fn take_mail(&self, flow_id: &FlowId) -> Option<Envelope> {
        self.mailboxes.get_mut(flow_id).and_then(|mut q| q.pop_front())
    }

    pub fn has_mail(&self, flow_id: &FlowId) -> bool {
        self.mailboxes.get(flow_id).map(|q| !q.is_empty()).unwrap_or(false)
    }

    pub fn drop_mailbox(&self, flow_id: &FlowId) {
        self.mailboxes.remove(flow_id);
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).queue.len()
    }

    /// Retira los pendientes que superaron el plazo y los descartados por
    /// desbordamiento. El llamador responde a cada uno con un fallo de
    /// sesión hacia su emisor.
    pub fn expire(&self, now: Instant) -> Vec<Envelope> {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        let mut expired = std::mem::take(&mut pending.evicted);
        while let Some(head) = pending.queue.front() {
            if now.saturating_duration_since(head.received_at) < self.config.pending_timeout {
                break;
            }
            if let Some(p) = pending.queue.pop_front() {
                expired.push(p.envelope);
            }
        }
        expired
    }

    fn notify(&self, event: RouterEvent) {
        if self.events.send(event).is_err() {
            log::debug!("router {}: scheduler detenido, aviso descartado", self.node);
        }
    }
}
