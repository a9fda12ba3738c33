// Archivo: stubs.rs
// Propósito: implementaciones en memoria para pruebas y wiring rápido.
//
// Incluye un `CheckpointStore` en memoria, una red en memoria que conecta
// routers de varios nodos (con entrega duplicada y reordenación opcionales
// para ejercitar la capa de sesión) y servicios triviales de verificación
// y unicidad. Nada de esto es durable.
use crate::domain::{CheckpointRecord, FlowId, FlowStatus, NodeId, PersistResult, StoredCheckpoint};
use crate::errors::{FlowError, Result};
use crate::repository::CheckpointStore;
use crate::router::MessageRouter;
use crate::services::{ContractVerifier, NotarisationOutcome, UniquenessProvider, Verdict};
use crate::session::Envelope;
use crate::transport::Transport;
use chrono::Utc;
use serde_json::Value as JsonValue;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Store de checkpoints en memoria con la misma semántica put-if-version
/// que el de SQLite.
#[derive(Default)]
pub struct InMemoryCheckpointStore {
    rows: Mutex<HashMap<FlowId, StoredCheckpoint>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Helper para mapear `Mutex::lock()` en un `Result` con
    /// `FlowError::Storage`.
    fn lock(&self) -> Result<MutexGuard<'_, HashMap<FlowId, StoredCheckpoint>>> {
        self.rows
            .lock()
            .map_err(|e| FlowError::Storage(format!("mutex poisoned: {:?}", e)))
    }

    pub fn len(&self) -> usize {
        self.rows.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CheckpointStore for InMemoryCheckpointStore {
    fn put(&self, flow_id: &FlowId, record: &CheckpointRecord, expected_version: i64) -> Result<PersistResult> {
        let mut rows = self.lock()?;
        let current = rows.get(flow_id).map(|r| r.version).unwrap_or(0);
        if current != expected_version {
            return Ok(PersistResult::Conflict);
        }
        let new_version = current + 1;
        rows.insert(*flow_id,
                    StoredCheckpoint { flow_id: *flow_id,
                                       record: record.clone(),
                                       version: new_version,
                                       updated_at: Utc::now() });
        Ok(PersistResult::Ok { new_version })
    }

    fn get(&self, flow_id: &FlowId) -> Result<Option<StoredCheckpoint>> {
        Ok(self.lock()?.get(flow_id).cloned())
    }

    fn delete(&self, flow_id: &FlowId) -> Result<()> {
        self.lock()?.remove(flow_id);
        Ok(())
    }

    fn list_non_terminal(&self) -> Result<Vec<FlowId>> {
        let mut ids: Vec<FlowId> = self.lock()?
                                       .values()
                                       .filter(|r| !r.record.status.is_terminal())
                                       .map(|r| r.flow_id)
                                       .collect();
        ids.sort();
        Ok(ids)
    }

    fn list_flows(&self) -> Result<Vec<(FlowId, FlowStatus)>> {
        let mut flows: Vec<(FlowId, FlowStatus)> = self.lock()?
                                                       .values()
                                                       .map(|r| (r.flow_id, r.record.status))
                                                       .collect();
        flows.sort_by_key(|(id, _)| *id);
        Ok(flows)
    }
}

#[derive(Default)]
struct NetworkState {
    routers: HashMap<NodeId, Arc<MessageRouter>>,
    known: HashSet<NodeId>,
    /// Sobres para nodos conocidos pero desconectados.
    queued: HashMap<NodeId, Vec<Envelope>>,
    /// Sobres retenidos mientras la red está en pausa.
    held: Option<Vec<Envelope>>,
}

/// Red en memoria entre los routers de varios nodos.
///
/// Un nodo desconectado (`detach`) sigue siendo resoluble: sus mensajes se
/// encolan y se entregan al reconectarse, como haría un broker durable.
#[derive(Default)]
pub struct InMemoryNetwork {
    state: Mutex<NetworkState>,
    delivered: Mutex<Vec<Envelope>>,
    duplicate: AtomicBool,
}

impl InMemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn state(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Conecta el router de un nodo y le entrega lo que tenía encolado.
    pub fn attach(&self, router: Arc<MessageRouter>) {
        let node = router.node().clone();
        let queued = {
            let mut state = self.state();
            state.known.insert(node.clone());
            state.routers.insert(node.clone(), router.clone());
            state.queued.remove(&node).unwrap_or_default()
        };
        log::debug!("red: {} conectado ({} encolados)", node, queued.len());
        for envelope in queued {
            router.route(envelope);
        }
    }

    /// Desconecta un nodo; sus mensajes quedan encolados.
    pub fn detach(&self, node: &NodeId) {
        let mut state = self.state();
        state.routers.remove(node);
        log::debug!("red: {} desconectado", node);
    }

    pub fn transport(self: &Arc<Self>) -> InMemoryTransport {
        InMemoryTransport { network: Arc::clone(self) }
    }

    /// Entrega cada sobre dos veces.
    pub fn set_duplicate_delivery(&self, on: bool) {
        self.duplicate.store(on, Ordering::SeqCst);
    }

    /// Retiene los sobres hasta `release_reversed`.
    pub fn hold(&self) {
        let mut state = self.state();
        if state.held.is_none() {
            state.held = Some(Vec::new());
        }
    }

    /// Entrega los sobres retenidos en orden inverso.
    pub fn release_reversed(&self) {
        let held = self.state().held.take().unwrap_or_default();
        for envelope in held.into_iter().rev() {
            self.dispatch(envelope);
        }
    }

    /// Saca los sobres retenidos sin entregarlos y reanuda la entrega normal.
    pub fn take_held(&self) -> Vec<Envelope> {
        self.state().held.take().unwrap_or_default()
    }

    /// Copia de todos los sobres aceptados por la red.
    pub fn delivered(&self) -> Vec<Envelope> {
        self.delivered.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn is_known(&self, node: &NodeId) -> bool {
        self.state().known.contains(node)
    }

    pub fn send(&self, envelope: Envelope) -> Result<()> {
        if !self.is_known(&envelope.recipient) {
            return Err(FlowError::CounterpartyUnreachable(envelope.recipient.clone()));
        }
        self.delivered
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(envelope.clone());
        {
            let mut state = self.state();
            if let Some(held) = state.held.as_mut() {
                held.push(envelope);
                return Ok(());
            }
        }
        self.dispatch(envelope);
        Ok(())
    }

    fn dispatch(&self, envelope: Envelope) {
        let router = {
            let mut state = self.state();
            match state.routers.get(&envelope.recipient) {
                Some(r) => r.clone(),
                None => {
                    state.queued
                         .entry(envelope.recipient.clone())
                         .or_default()
                         .push(envelope);
                    return;
                }
            }
        };
        if self.duplicate.load(Ordering::SeqCst) {
            router.route(envelope.clone());
        }
        router.route(envelope);
    }
}

/// Transporte de un nodo sobre la red en memoria.
#[derive(Clone)]
pub struct InMemoryTransport {
    network: Arc<InMemoryNetwork>,
}

impl Transport for InMemoryTransport {
    fn send(&self, envelope: &Envelope) -> Result<()> {
        self.network.send(envelope.clone())
    }

    fn resolves(&self, node: &NodeId) -> bool {
        self.network.is_known(node)
    }
}

/// Verificador que acepta todo.
pub struct AcceptAllVerifier;

impl ContractVerifier for AcceptAllVerifier {
    fn verify(&self, _contract: &str, _inputs: &JsonValue) -> Verdict {
        Verdict::Accepted
    }
}

/// Verificador a partir de una función.
pub struct FnVerifier<F>(pub F);

impl<F> ContractVerifier for FnVerifier<F> where F: Fn(&str, &JsonValue) -> Verdict + Send + Sync
{
    fn verify(&self, contract: &str, inputs: &JsonValue) -> Verdict {
        (self.0)(contract, inputs)
    }
}

/// Proveedor de unicidad en memoria: cada referencia de estado sólo puede
/// consumirse una vez. Reenviar la misma transacción es idempotente.
#[derive(Default)]
pub struct InMemoryUniquenessProvider {
    consumed: Mutex<HashMap<String, String>>,
}

impl InMemoryUniquenessProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

impl UniquenessProvider for InMemoryUniquenessProvider {
    fn commit(&self, tx_id: &str, state_refs: &[String]) -> NotarisationOutcome {
        let mut consumed = self.consumed.lock().unwrap_or_else(|e| e.into_inner());
        let conflicts: Vec<String> = state_refs.iter()
                                               .filter(|r| consumed.get(*r).map(|by| by != tx_id).unwrap_or(false))
                                               .cloned()
                                               .collect();
        if !conflicts.is_empty() {
            return NotarisationOutcome::Conflict(conflicts);
        }
        for r in state_refs {
            consumed.insert(r.clone(), tx_id.to_string());
        }
        NotarisationOutcome::Committed
    }
}
