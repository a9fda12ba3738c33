// Archivo: machine.rs
// Propósito: máquina de estados de un flujo. Avanza un checkpoint de forma
// transaccional: trabaja sobre una copia, ejecuta pasos hasta la siguiente
// suspensión, confirma el checkpoint con put-if-version y sólo entonces
// entrega la bandeja de salida al llamador para que la envíe.
//
// Si algo falla antes de confirmar no queda ningún efecto: ni checkpoint
// nuevo ni mensajes emitidos. Reejecutar el mismo paso desde el mismo
// checkpoint con los mismos mensajes produce los mismos envíos, así que el
// receptor los deduplica por (sesión, secuencia).
use crate::checkpoint::{Checkpoint, CheckpointStorage};
use crate::domain::{FlowId, FlowState, NodeId, SessionId};
use crate::errors::{FlowError, FlowFailure, Result};
use crate::logic::{FlowContext, FlowLogic, Transition};
use crate::services::FlowServices;
use crate::session::{Envelope, Ingest, MessageKind, Role, Session};
use crate::transport::Transport;
use chrono::{DateTime, Utc};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

/// Dependencias que necesita un avance.
pub struct StepEnv<'a> {
    pub storage: &'a CheckpointStorage,
    pub services: &'a FlowServices,
    pub transport: &'a dyn Transport,
    pub max_steps: u32,
}

/// Lo que el hospital necesita saber de un fallo.
#[derive(Debug, Clone)]
pub struct FailureReport {
    pub flow_id: FlowId,
    pub failure: FlowFailure,
    /// Estado del último checkpoint confirmado.
    pub last_state: FlowState,
    pub checkpoint_version: i64,
    pub suspend_count: u64,
    /// Mensaje que disparó el avance fallido, para reentregarlo.
    pub inbound: Option<Envelope>,
}

#[derive(Debug, Clone)]
pub enum AdvanceOutcome {
    /// Se confirmó un checkpoint nuevo; `outbound` ya puede enviarse.
    Progressed { state: FlowState, outbound: Vec<Envelope> },
    /// Nada cambió: duplicado, mensaje ajeno o el flujo sigue esperando.
    Idle,
    /// El avance falló sin confirmar nada.
    Errored(FailureReport),
    /// Otra copia del flujo confirmó una versión más nueva; ésta es obsoleta
    /// y debe recargarse antes de reintentar `inbound`.
    Superseded { inbound: Option<Envelope> },
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "pánico sin mensaje".to_string()
    }
}

fn ingest<L>(checkpoint: &mut Checkpoint<L>, envelope: &Envelope) -> Ingest {
    match checkpoint.sessions.get_mut(&envelope.message.session) {
        Some(session) if session.role == envelope.message.from.opposite() => session.ingest(envelope.message.clone()),
        _ => Ingest::Misrouted,
    }
}

/// Asienta los mensajes de control de todas las sesiones y encola las
/// respuestas automáticas. Devuelve si hubo cambios.
fn settle_sessions<L>(checkpoint: &mut Checkpoint<L>, terminal: bool) -> bool {
    let mut changed = false;
    let Checkpoint { flow_id,
                     our_node,
                     sessions,
                     outbox,
                     .. } = checkpoint;
    for session in sessions.values_mut() {
        let (replies, consumed) = session.settle(terminal);
        changed |= consumed > 0;
        for reply in replies {
            outbox.push(Envelope::new(our_node.clone(), session.peer.clone(), *flow_id, reply));
        }
    }
    changed
}

fn close_all<L>(checkpoint: &mut Checkpoint<L>) {
    let Checkpoint { flow_id,
                     our_node,
                     sessions,
                     outbox,
                     .. } = checkpoint;
    for session in sessions.values_mut() {
        if let Some(close) = session.begin_close() {
            outbox.push(Envelope::new(our_node.clone(), session.peer.clone(), *flow_id, close));
        }
    }
}

/// Instancia residente de un flujo junto a la versión de su checkpoint.
pub struct FlowMachine<L: FlowLogic> {
    checkpoint: Checkpoint<L>,
    version: i64,
    outbox_flushed: bool,
}

impl<L: FlowLogic> FlowMachine<L> {
    /// Crea un flujo iniciador y persiste su checkpoint inicial. Con
    /// `client_id` el `FlowId` es determinista y un segundo arranque
    /// devuelve `FlowError::Conflict`.
    pub fn start(storage: &CheckpointStorage, node: NodeId, logic: L, client_id: Option<String>) -> Result<Self> {
        let flow_id = client_id.as_deref()
                               .map(FlowId::for_client_id)
                               .unwrap_or_else(FlowId::new);
        let kind = logic.kind();
        let checkpoint = Checkpoint::new(flow_id, kind, node, logic, client_id);
        let version = storage.commit(&checkpoint, 0)?;
        log::info!("flujo {} ({}) creado", flow_id, kind);
        Ok(Self { checkpoint,
                  version,
                  outbox_flushed: true })
    }

    /// Crea el responder para un `Open`, con el `Confirm` ya en la bandeja de
    /// salida. Si el responder ya existía (Open duplicado) devuelve
    /// `FlowError::Conflict`.
    pub fn start_responder(storage: &CheckpointStorage, node: NodeId, logic: L, open: &Envelope) -> Result<Self> {
        let MessageKind::Open { initiator_flow, .. } = &open.message.kind else {
            return Err(FlowError::InvalidTransition(format!("se esperaba Open y llegó {}", open.message.kind.name())));
        };
        let session_id = open.message.session;
        let flow_id = FlowId::for_responder(&session_id);
        let (session, confirm) = Session::accept(session_id, open.sender.clone(), *initiator_flow, flow_id);
        let kind = logic.kind();
        let mut checkpoint = Checkpoint::new(flow_id, kind, node.clone(), logic, None);
        checkpoint.outbox
                  .push(Envelope::new(node, open.sender.clone(), flow_id, confirm));
        checkpoint.sessions.insert(session_id, session);
        let version = storage.commit(&checkpoint, 0)?;
        log::info!("responder {} ({}) creado para la sesión {}", flow_id, kind, session_id);
        Ok(Self { checkpoint,
                  version,
                  outbox_flushed: false })
    }

    /// Rehidrata un flujo desde su último checkpoint. La bandeja de salida se
    /// considera pendiente de envío.
    pub fn load(storage: &CheckpointStorage, flow_id: &FlowId) -> Result<Option<Self>> {
        Ok(storage.load::<L>(flow_id)?.map(|(checkpoint, version)| Self { checkpoint,
                                                                          version,
                                                                          outbox_flushed: false }))
    }

    pub fn flow_id(&self) -> FlowId {
        self.checkpoint.flow_id
    }

    pub fn state(&self) -> &FlowState {
        &self.checkpoint.state
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    pub fn checkpoint(&self) -> &Checkpoint<L> {
        &self.checkpoint
    }

    /// Mensajes del último checkpoint que aún no se entregaron al transporte.
    pub fn pending_outbox(&self) -> &[Envelope] {
        if self.outbox_flushed {
            &[]
        } else {
            &self.checkpoint.outbox
        }
    }

    pub fn mark_flushed(&mut self) {
        self.outbox_flushed = true;
    }

    pub fn endpoints(&self) -> Vec<(SessionId, Role, bool)> {
        self.checkpoint.endpoints()
    }

    pub fn holds(&self, session: &SessionId, role: Role) -> bool {
        self.checkpoint.holds(session, role)
    }

    /// Desde cuándo espera un mensaje que aún no llegó. `None` si el flujo no
    /// está esperando o si el mensaje ya está en el buffer de la sesión.
    pub fn waiting_since(&self) -> Option<DateTime<Utc>> {
        match &self.checkpoint.state {
            FlowState::SuspendedReceive { session, .. } | FlowState::SuspendedSendAndReceive { session, .. } => {
                let ready = self.checkpoint
                                .sessions
                                .get(session)
                                .map(|s| s.deliverable())
                                .unwrap_or(false);
                if ready {
                    None
                } else {
                    self.checkpoint.suspended_at
                }
            }
            _ => None,
        }
    }

    /// Avanza un flujo ejecutable sin mensaje nuevo.
    pub fn advance(&mut self, env: &StepEnv<'_>) -> AdvanceOutcome {
        self.run(env, None)
    }

    /// Entrega un mensaje entrante y avanza si eso desbloquea el flujo.
    pub fn resume(&mut self, env: &StepEnv<'_>, inbound: Envelope) -> AdvanceOutcome {
        self.run(env, Some(inbound))
    }

    fn run(&mut self, env: &StepEnv<'_>, inbound: Option<Envelope>) -> AdvanceOutcome {
        let mut next = self.working_copy();
        let mut changed = false;
        if let Some(envelope) = &inbound {
            match ingest(&mut next, envelope) {
                Ingest::Accepted => changed = true,
                Ingest::Duplicate => {
                    log::debug!("flujo {}: duplicado {:?} descartado", next.flow_id, envelope.dedup_key());
                    return AdvanceOutcome::Idle;
                }
                Ingest::Misrouted => {
                    log::warn!("flujo {}: mensaje para la sesión {} que no le pertenece",
                               next.flow_id,
                               envelope.message.session);
                    return AdvanceOutcome::Idle;
                }
            }
        }
        let terminal = next.state.is_terminal();
        changed |= settle_sessions(&mut next, terminal);

        let runnable = match &next.state {
            FlowState::Runnable | FlowState::SuspendedSend { .. } => true,
            FlowState::SuspendedReceive { session, .. } | FlowState::SuspendedSendAndReceive { session, .. } => {
                next.sessions.get(session).map(|s| s.deliverable()).unwrap_or(true)
            }
            FlowState::Completed { .. } | FlowState::Failed { .. } | FlowState::Hospitalized { .. } => false,
        };
        if !runnable {
            if !changed {
                return AdvanceOutcome::Idle;
            }
            return self.commit(env, next, inbound);
        }
        match Self::execute(env, &mut next) {
            Ok(()) => self.commit(env, next, inbound),
            Err(failure) => {
                log::warn!("flujo {} falló en el paso {}: {}", self.flow_id(), self.checkpoint.suspend_count, failure);
                AdvanceOutcome::Errored(self.report(failure, inbound))
            }
        }
    }

    fn working_copy(&self) -> Checkpoint<L> {
        let mut next = self.checkpoint.clone();
        if self.outbox_flushed {
            next.outbox.clear();
        }
        next
    }

    fn execute(env: &StepEnv<'_>, next: &mut Checkpoint<L>) -> std::result::Result<(), FlowFailure> {
        let mut iterations = 0u32;
        loop {
            iterations += 1;
            if iterations > env.max_steps {
                return Err(FlowFailure::internal(format!("el flujo no se suspendió tras {} iteraciones", env.max_steps)));
            }
            let kind = next.logic.kind();
            let transition = {
                let Checkpoint { flow_id,
                                 our_node,
                                 sessions,
                                 logic,
                                 outbox,
                                 nonce,
                                 .. } = &mut *next;
                let mut ctx = FlowContext::new(*flow_id,
                                               kind,
                                               our_node,
                                               sessions,
                                               outbox,
                                               nonce,
                                               env.services,
                                               env.transport);
                match panic::catch_unwind(AssertUnwindSafe(|| logic.step(&mut ctx))) {
                    Ok(result) => result?,
                    Err(payload) => {
                        return Err(FlowFailure::internal(format!("pánico en el paso: {}", panic_message(payload.as_ref()))))
                    }
                }
            };
            match transition {
                Transition::Continue => next.state = FlowState::Runnable,
                Transition::Complete(result) => {
                    close_all(next);
                    next.state = FlowState::Completed { result };
                    return Ok(());
                }
                Transition::Suspend(suspend) => {
                    let Some(session) = next.sessions.get(&suspend.session()) else {
                        return Err(FlowFailure::internal(format!("suspensión sobre la sesión desconocida {}",
                                                                 suspend.session())));
                    };
                    let ready = suspend.awaits_message() && session.deliverable();
                    next.state = suspend.into();
                    if !ready {
                        next.suspend_count += 1;
                        next.suspended_at = suspend.awaits_message().then(Utc::now);
                        return Ok(());
                    }
                }
            }
        }
    }

    fn commit(&mut self, env: &StepEnv<'_>, next: Checkpoint<L>, inbound: Option<Envelope>) -> AdvanceOutcome {
        match env.storage.commit(&next, self.version) {
            Ok(version) => {
                let state = next.state.clone();
                let outbound = next.outbox.clone();
                log::debug!("flujo {} -> {} (v{}, {} salientes)",
                            next.flow_id,
                            state.status(),
                            version,
                            outbound.len());
                self.outbox_flushed = outbound.is_empty();
                self.checkpoint = next;
                self.version = version;
                AdvanceOutcome::Progressed { state, outbound }
            }
            Err(FlowError::Conflict(reason)) => {
                log::info!("flujo {}: copia v{} obsoleta ({})", self.flow_id(), self.version, reason);
                AdvanceOutcome::Superseded { inbound }
            }
            Err(e) => {
                log::warn!("flujo {}: no se pudo confirmar el checkpoint: {}", self.flow_id(), e);
                AdvanceOutcome::Errored(self.report(e.into(), inbound))
            }
        }
    }

    fn persist(&mut self, env: &StepEnv<'_>, next: Checkpoint<L>) -> Result<Vec<Envelope>> {
        let version = env.storage.commit(&next, self.version)?;
        let outbound = next.outbox.clone();
        self.outbox_flushed = outbound.is_empty();
        self.checkpoint = next;
        self.version = version;
        Ok(outbound)
    }

    /// Informe de fallo relativo al último checkpoint confirmado.
    pub fn report(&self, failure: FlowFailure, inbound: Option<Envelope>) -> FailureReport {
        FailureReport { flow_id: self.checkpoint.flow_id,
                        failure,
                        last_state: self.checkpoint.state.clone(),
                        checkpoint_version: self.version,
                        suspend_count: self.checkpoint.suspend_count,
                        inbound }
    }

    /// Aparca el flujo en observación. El mensaje que disparó el fallo queda
    /// en el buffer de su sesión para la reanudación.
    pub fn hospitalize(&mut self, env: &StepEnv<'_>, report: &FailureReport) -> Result<Vec<Envelope>> {
        let mut next = self.working_copy();
        if let Some(envelope) = &report.inbound {
            ingest(&mut next, envelope);
        }
        if next.state.is_terminal() {
            return Err(FlowError::InvalidTransition(format!("el flujo {} ya terminó", next.flow_id)));
        }
        if !matches!(next.state, FlowState::Hospitalized { .. }) {
            next.resume_state = Some(next.state.clone());
        }
        next.state = FlowState::Hospitalized { reason: report.failure.clone() };
        log::warn!("flujo {} hospitalizado: {}", next.flow_id, report.failure);
        self.persist(env, next)
    }

    /// Reanuda un flujo hospitalizado desde el estado previo a su ingreso.
    pub fn retry(&mut self, env: &StepEnv<'_>) -> Result<Vec<Envelope>> {
        if !matches!(self.checkpoint.state, FlowState::Hospitalized { .. }) {
            return Err(FlowError::InvalidTransition(format!("el flujo {} no está hospitalizado ({})",
                                                            self.flow_id(),
                                                            self.checkpoint.state.status())));
        }
        let mut next = self.working_copy();
        next.state = next.resume_state.take().unwrap_or(FlowState::Runnable);
        // la espera vuelve a contar desde la reanudación
        if matches!(next.state,
                    FlowState::SuspendedReceive { .. } | FlowState::SuspendedSendAndReceive { .. })
        {
            next.suspended_at = Some(Utc::now());
        }
        log::info!("flujo {} reanudado desde {}", next.flow_id, next.state.status());
        self.persist(env, next)
    }

    /// Termina el flujo en `Failed` y avisa a cada par con sesión abierta.
    pub fn fail(&mut self, env: &StepEnv<'_>, failure: FlowFailure) -> Result<Vec<Envelope>> {
        if self.checkpoint.state.is_terminal() {
            return Err(FlowError::InvalidTransition(format!("el flujo {} ya terminó", self.flow_id())));
        }
        let mut next = self.working_copy();
        {
            let Checkpoint { flow_id,
                             our_node,
                             sessions,
                             outbox,
                             .. } = &mut next;
            for session in sessions.values_mut() {
                if let Some(error) = session.abandon(&failure) {
                    outbox.push(Envelope::new(our_node.clone(), session.peer.clone(), *flow_id, error));
                }
            }
        }
        next.resume_state = None;
        log::warn!("flujo {} termina con fallo: {}", next.flow_id, failure);
        next.state = FlowState::Failed { error: failure };
        self.persist(env, next)
    }

    /// Cancelación explícita: equivale a fallar con `cancelled`.
    pub fn cancel(&mut self, env: &StepEnv<'_>) -> Result<Vec<Envelope>> {
        self.fail(env, FlowFailure::cancelled(format!("flujo {} cancelado", self.flow_id())))
    }
}
