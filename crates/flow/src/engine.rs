// Archivo: engine.rs
// Propósito: fachada `FlowEngine` de un nodo. Conecta el store de
// checkpoints, el router, el hospital y el scheduler, y expone las
// operaciones públicas: arrancar flujos, esperar resultados, recuperar tras
// un reinicio y las acciones de operador.
use crate::checkpoint::CheckpointStorage;
use crate::config::FlowEngineConfig;
use crate::domain::{FlowId, FlowResult, FlowState, NodeId};
use crate::errors::{FlowFailure, Result};
use crate::hospital::FlowHospital;
use crate::logic::FlowLogic;
use crate::repository::CheckpointStore;
use crate::router::MessageRouter;
use crate::scheduler::Scheduler;
use crate::services::FlowServices;
use crate::transport::Transport;
use serde_json::Value as JsonValue;
use std::sync::Arc;

/// Motor de flujos de un nodo, genérico sobre la lógica que ejecuta.
///
/// Ciclo de vida típico:
/// - `new` dentro de un runtime de tokio.
/// - conectar `router()` al transporte de entrada.
/// - `recover()` para reanudar lo que quedó en el store.
/// - `start`/`wait_for` para ejecutar flujos.
///
/// Si el store falla al confirmar un checkpoint, el flujo pasa por el
/// hospital y no se emite ningún mensaje de ese paso.
pub struct FlowEngine<L: FlowLogic> {
    node: NodeId,
    router: Arc<MessageRouter>,
    hospital: Arc<FlowHospital>,
    scheduler: Scheduler<L>,
}

impl<L: FlowLogic> FlowEngine<L> {
    /// Crea el motor y arranca su bucle de eventos.
    pub fn new(node: NodeId,
               store: Arc<dyn CheckpointStore>,
               transport: Arc<dyn Transport>,
               services: FlowServices,
               config: FlowEngineConfig)
               -> Result<Self> {
        let (router, events) = MessageRouter::new(node.clone(), config.router());
        let router = Arc::new(router);
        let hospital = Arc::new(FlowHospital::new(config.hospital()));
        let scheduler = Scheduler::start(node.clone(),
                                         CheckpointStorage::new(store),
                                         Arc::clone(&router),
                                         events,
                                         transport,
                                         Arc::clone(&hospital),
                                         services,
                                         config)?;
        log::info!("motor de flujos de {} iniciado", node);
        Ok(Self { node,
                  router,
                  hospital,
                  scheduler })
    }

    pub fn node(&self) -> &NodeId {
        &self.node
    }

    /// Router de entrada; el transporte le entrega los sobres recibidos.
    pub fn router(&self) -> Arc<MessageRouter> {
        Arc::clone(&self.router)
    }

    pub fn hospital(&self) -> &FlowHospital {
        &self.hospital
    }

    /// Reanuda todos los flujos no terminales del store. Devuelve cuántos.
    pub fn recover(&self) -> Result<usize> {
        self.scheduler.recover()
    }

    /// Arranca un flujo iniciador con un `FlowId` nuevo.
    pub fn start(&self, logic: L) -> Result<FlowId> {
        self.scheduler.start_flow(logic, None)
    }

    /// Arranca un flujo identificado por `client_id`. Si ya existe uno con
    /// ese client id se devuelve su `FlowId` sin arrancar otro.
    pub fn start_with_client_id(&self, client_id: impl Into<String>, logic: L) -> Result<FlowId> {
        self.scheduler.start_flow(logic, Some(client_id.into()))
    }

    pub async fn wait_for(&self, flow_id: FlowId) -> Result<FlowResult> {
        self.scheduler.wait_for(flow_id).await
    }

    /// Estado del último checkpoint confirmado.
    pub fn state_of(&self, flow_id: &FlowId) -> Result<Option<FlowState>> {
        self.scheduler.state_of(flow_id)
    }

    /// Cancela el flujo: termina en `Failed` con `cancelled` y avisa a sus
    /// pares.
    pub async fn cancel(&self, flow_id: FlowId) -> Result<()> {
        self.scheduler.cancel(flow_id).await
    }

    /// Reanuda un flujo en observación desde su último checkpoint.
    pub async fn retry_from_last_checkpoint(&self, flow_id: FlowId) -> Result<()> {
        self.scheduler.retry(flow_id).await
    }

    /// Termina un flujo en observación con el fallo indicado.
    pub async fn force_fail(&self, flow_id: FlowId, failure: FlowFailure) -> Result<()> {
        self.scheduler.force_fail(flow_id, failure).await
    }

    pub fn inspect(&self, flow_id: &FlowId) -> Result<Option<JsonValue>> {
        self.scheduler.inspect(flow_id)
    }

    pub fn dump_checkpoints(&self) -> Result<Vec<JsonValue>> {
        self.scheduler.dump_checkpoints()
    }

    pub fn collect_garbage(&self) -> Result<usize> {
        self.scheduler.collect_garbage()
    }

    /// Detiene el motor sin tocar el store, como lo haría la caída del
    /// proceso.
    pub fn shutdown(&self) {
        self.scheduler.shutdown();
    }
}
