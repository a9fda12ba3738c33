// Archivo: scheduler.rs
// Propósito: ejecución concurrente de flujos. Un bucle de eventos (tokio)
// atiende los avisos del router y el barrido de pendientes; cada flujo con
// trabajo se reclama en exclusiva y se procesa en un worker bloqueante
// (`spawn_blocking`) limitado por un semáforo. Un mismo flujo nunca se
// ejecuta en dos workers a la vez; flujos distintos avanzan en paralelo.
//
// Tras cada checkpoint confirmado el scheduler sincroniza los extremos del
// router, envía la bandeja de salida y despierta a quien espera el
// resultado. Los fallos pasan por el hospital.
use crate::checkpoint::CheckpointStorage;
use crate::config::FlowEngineConfig;
use crate::domain::{FlowId, FlowResult, FlowState, NodeId, SessionId};
use crate::errors::{FlowError, FlowFailure, Result};
use crate::hospital::{Diagnosis, FlowHospital};
use crate::logic::FlowLogic;
use crate::machine::{AdvanceOutcome, FailureReport, FlowMachine, StepEnv};
use crate::router::{MessageRouter, RouterEvent};
use crate::services::FlowServices;
use crate::session::{Endpoint, Envelope, MessageKind, Role, SessionMessage, HANDSHAKE_SEQ};
use crate::transport::Transport;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use rayon::prelude::*;
use serde_json::Value as JsonValue;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

type Reply = oneshot::Sender<Result<()>>;

/// Trabajo dirigido a un flujo concreto, además de su buzón.
enum Control {
    Advance,
    Redeliver(Envelope),
    Flush,
    Cancel(Reply),
    Retry(Reply),
    ForceFail(FlowFailure, Reply),
    /// Venció el plazo de espera de un `receive`.
    Expire,
}

enum Work {
    Control(Control),
    Deliver(Envelope),
}

struct Inner<L: FlowLogic> {
    node: NodeId,
    storage: CheckpointStorage,
    router: Arc<MessageRouter>,
    transport: Arc<dyn Transport>,
    hospital: Arc<FlowHospital>,
    services: FlowServices,
    config: FlowEngineConfig,
    runtime: Handle,
    permits: Arc<Semaphore>,
    resident: DashMap<FlowId, FlowMachine<L>>,
    claims: DashSet<FlowId>,
    rewake: DashSet<FlowId>,
    controls: DashMap<FlowId, VecDeque<Control>>,
    results: DashMap<FlowId, watch::Sender<Option<FlowResult>>>,
    /// Extremos que ningún flujo del store reclamó, hasta cuándo no se
    /// vuelven a buscar.
    unowned: DashMap<Endpoint, Instant>,
    /// Flujos con un `Expire` ya encolado.
    expiring: DashSet<FlowId>,
    stopped: AtomicBool,
}

pub struct Scheduler<L: FlowLogic> {
    inner: Arc<Inner<L>>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

impl<L: FlowLogic> Scheduler<L> {
    /// Crea el scheduler y arranca su bucle de eventos. Debe llamarse dentro
    /// de un runtime de tokio.
    pub fn start(node: NodeId,
                 storage: CheckpointStorage,
                 router: Arc<MessageRouter>,
                 events: mpsc::UnboundedReceiver<RouterEvent>,
                 transport: Arc<dyn Transport>,
                 hospital: Arc<FlowHospital>,
                 services: FlowServices,
                 config: FlowEngineConfig)
                 -> Result<Self> {
        let runtime = Handle::try_current().map_err(|e| FlowError::Other(format!("sin runtime de tokio: {}", e)))?;
        let inner = Arc::new(Inner { node,
                                     storage,
                                     router,
                                     transport,
                                     hospital,
                                     services,
                                     permits: Arc::new(Semaphore::new(config.workers.max(1))),
                                     config,
                                     runtime: runtime.clone(),
                                     resident: DashMap::new(),
                                     claims: DashSet::new(),
                                     rewake: DashSet::new(),
                                     controls: DashMap::new(),
                                     results: DashMap::new(),
                                     unowned: DashMap::new(),
                                     expiring: DashSet::new(),
                                     stopped: AtomicBool::new(false) });
        let handle = runtime.spawn(event_loop(Arc::clone(&inner), events));
        Ok(Self { inner,
                  event_loop: Mutex::new(Some(handle)) })
    }

    pub fn start_flow(&self, logic: L, client_id: Option<String>) -> Result<FlowId> {
        self.inner.start_flow(logic, client_id)
    }

    pub fn recover(&self) -> Result<usize> {
        self.inner.recover()
    }

    pub fn state_of(&self, flow_id: &FlowId) -> Result<Option<FlowState>> {
        Ok(self.inner.storage.load::<L>(flow_id)?.map(|(cp, _)| cp.state))
    }

    /// Espera al resultado terminal del flujo.
    pub async fn wait_for(&self, flow_id: FlowId) -> Result<FlowResult> {
        let mut rx = self.inner
                         .results
                         .entry(flow_id)
                         .or_insert_with(|| watch::channel(None).0)
                         .subscribe();
        match self.state_of(&flow_id)? {
            Some(state) => {
                if let Some(outcome) = state.outcome() {
                    return Ok(outcome);
                }
            }
            None => return Err(FlowError::NotFound(format!("flujo {}", flow_id))),
        }
        let value = rx.wait_for(|v| v.is_some())
                      .await
                      .map_err(|_| FlowError::Other("scheduler detenido".into()))?;
        (*value).clone()
                .ok_or_else(|| FlowError::Other(format!("flujo {} sin resultado", flow_id)))
    }

    async fn request(&self, flow_id: FlowId, make: impl FnOnce(Reply) -> Control) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.inner.push_control(flow_id, make(tx));
        self.inner.wake(flow_id);
        rx.await
          .map_err(|_| FlowError::Other(format!("el worker del flujo {} no respondió", flow_id)))?
    }

    pub async fn cancel(&self, flow_id: FlowId) -> Result<()> {
        self.request(flow_id, Control::Cancel).await
    }

    pub async fn retry(&self, flow_id: FlowId) -> Result<()> {
        self.request(flow_id, Control::Retry).await
    }

    pub async fn force_fail(&self, flow_id: FlowId, failure: FlowFailure) -> Result<()> {
        self.request(flow_id, |reply| Control::ForceFail(failure, reply)).await
    }

    pub fn inspect(&self, flow_id: &FlowId) -> Result<Option<JsonValue>> {
        self.inner.storage.dump(flow_id)
    }

    pub fn dump_checkpoints(&self) -> Result<Vec<JsonValue>> {
        let mut dumps = Vec::new();
        for (flow_id, _) in self.inner.storage.list_flows()? {
            if let Some(dump) = self.inner.storage.dump(&flow_id)? {
                dumps.push(dump);
            }
        }
        Ok(dumps)
    }

    pub fn collect_garbage(&self) -> Result<usize> {
        self.inner.collect_garbage()
    }

    /// Detiene el bucle de eventos y los workers. Un worker en curso termina
    /// su unidad de trabajo pero no envía nada más.
    pub fn shutdown(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.event_loop.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
        log::info!("scheduler de {} detenido", self.inner.node);
    }
}

impl<L: FlowLogic> Drop for Scheduler<L> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn chrono_span(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

async fn event_loop<L: FlowLogic>(inner: Arc<Inner<L>>, mut events: mpsc::UnboundedReceiver<RouterEvent>) {
    let mut sweep = tokio::time::interval(inner.config.sweep_interval);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(RouterEvent::Deliver(flow_id)) => inner.wake(flow_id),
                Some(RouterEvent::SessionInit(envelope)) => {
                    let inner = Arc::clone(&inner);
                    tokio::task::spawn_blocking(move || inner.on_session_init(envelope));
                }
                Some(RouterEvent::Hydrate(session, role)) => {
                    let inner = Arc::clone(&inner);
                    tokio::task::spawn_blocking(move || inner.hydrate(session, role));
                }
                None => break,
            },
            _ = sweep.tick() => {
                let inner = Arc::clone(&inner);
                tokio::task::spawn_blocking(move || {
                    inner.sweep_pending();
                    inner.sweep_waits();
                });
            }
        }
        if inner.stopped.load(Ordering::SeqCst) {
            break;
        }
    }
    log::debug!("bucle de eventos de {} terminado", inner.node);
}

impl<L: FlowLogic> Inner<L> {
    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn step_env(&self) -> StepEnv<'_> {
        StepEnv { storage: &self.storage,
                  services: &self.services,
                  transport: self.transport.as_ref(),
                  max_steps: self.config.max_steps_per_advance }
    }

    fn push_control(&self, flow_id: FlowId, control: Control) {
        self.controls.entry(flow_id).or_default().push_back(control);
    }

    fn has_work(&self, flow_id: &FlowId) -> bool {
        self.controls.get(flow_id).map(|q| !q.is_empty()).unwrap_or(false) || self.router.has_mail(flow_id)
    }

    fn next_work(&self, flow_id: &FlowId) -> Option<Work> {
        if let Some(control) = self.controls.get_mut(flow_id).and_then(|mut q| q.pop_front()) {
            return Some(Work::Control(control));
        }
        self.router.take_mail(flow_id).map(Work::Deliver)
    }

    /// Reclama el flujo y lo procesa en un worker. Si ya está reclamado se
    /// anota para volver a despertarlo al liberarse.
    fn wake(self: &Arc<Self>, flow_id: FlowId) {
        if self.is_stopped() {
            return;
        }
        if !self.claims.insert(flow_id) {
            self.rewake.insert(flow_id);
            return;
        }
        let inner = Arc::clone(self);
        self.runtime.spawn(async move {
                        let permit = match Arc::clone(&inner.permits).acquire_owned().await {
                            Ok(p) => p,
                            Err(_) => {
                                inner.claims.remove(&flow_id);
                                return;
                            }
                        };
                        let worker = Arc::clone(&inner);
                        if let Err(e) = tokio::task::spawn_blocking(move || worker.run_flow(flow_id)).await {
                            log::error!("el worker del flujo {} terminó de forma anómala: {}", flow_id, e);
                        }
                        drop(permit);
                        inner.claims.remove(&flow_id);
                        let again = inner.rewake.remove(&flow_id).is_some();
                        if again || inner.has_work(&flow_id) {
                            inner.wake(flow_id);
                        }
                    });
    }

    fn delay(self: &Arc<Self>, flow_id: FlowId, after: Duration, control: Control) {
        let inner = Arc::clone(self);
        self.runtime.spawn(async move {
                        tokio::time::sleep(after).await;
                        if inner.is_stopped() {
                            return;
                        }
                        inner.push_control(flow_id, control);
                        inner.wake(flow_id);
                    });
    }

    fn take_machine(&self, flow_id: &FlowId) -> Result<Option<FlowMachine<L>>> {
        if let Some((_, machine)) = self.resident.remove(flow_id) {
            return Ok(Some(machine));
        }
        let machine = FlowMachine::<L>::load(&self.storage, flow_id)?;
        if let Some(m) = &machine {
            self.sync_endpoints(m);
            self.note_patient(m);
        }
        Ok(machine)
    }

    fn run_flow(self: &Arc<Self>, flow_id: FlowId) {
        let mut machine = match self.take_machine(&flow_id) {
            Ok(Some(m)) => m,
            Ok(None) => {
                self.abandon_work(&flow_id, || FlowError::NotFound(format!("flujo {}", flow_id)));
                return;
            }
            Err(e) => {
                log::error!("no se pudo cargar el flujo {}: {}", flow_id, e);
                let message = e.to_string();
                self.abandon_work(&flow_id, || FlowError::Storage(message.clone()));
                return;
            }
        };
        while !self.is_stopped() {
            let Some(work) = self.next_work(&flow_id) else {
                break;
            };
            self.perform(&mut machine, work);
        }
        self.resident.insert(flow_id, machine);
        self.controls.remove_if(&flow_id, |_, queue| queue.is_empty());
    }

    fn abandon_work(&self, flow_id: &FlowId, error: impl Fn() -> FlowError) {
        let Some((_, queue)) = self.controls.remove(flow_id) else {
            return;
        };
        for control in queue {
            match control {
                Control::Cancel(reply) | Control::Retry(reply) | Control::ForceFail(_, reply) => {
                    let _ = reply.send(Err(error()));
                }
                Control::Advance | Control::Redeliver(_) | Control::Flush | Control::Expire => {}
            }
        }
        while self.router.take_mail(flow_id).is_some() {}
    }

    fn perform(self: &Arc<Self>, machine: &mut FlowMachine<L>, work: Work) {
        let env = self.step_env();
        match work {
            Work::Deliver(envelope) | Work::Control(Control::Redeliver(envelope)) => {
                let outcome = machine.resume(&env, envelope);
                self.apply(machine, outcome);
            }
            Work::Control(Control::Advance) => {
                let outcome = machine.advance(&env);
                self.apply(machine, outcome);
            }
            Work::Control(Control::Flush) => self.flush(machine),
            Work::Control(Control::Cancel(reply)) => {
                let result = machine.cancel(&env).map(|_| ());
                self.finish_operator_action(machine, result, reply, Control::Cancel);
            }
            Work::Control(Control::Retry(reply)) => {
                let result = machine.retry(&env).map(|_| ());
                if self.finish_operator_action(machine, result, reply, Control::Retry) {
                    // el mensaje que provocó el ingreso puede estar ya en el buffer
                    self.push_control(machine.flow_id(), Control::Advance);
                }
            }
            Work::Control(Control::ForceFail(failure, reply)) => {
                let result = machine.fail(&env, failure.clone()).map(|_| ());
                self.finish_operator_action(machine, result, reply, move |r| Control::ForceFail(failure, r));
            }
            Work::Control(Control::Expire) => self.expire_wait(machine),
        }
    }

    /// Cierra una acción de operador. Devuelve si se aplicó. Si la copia
    /// residente era obsoleta se recarga y la acción se vuelve a encolar.
    fn finish_operator_action(self: &Arc<Self>,
                              machine: &mut FlowMachine<L>,
                              result: Result<()>,
                              reply: Reply,
                              again: impl FnOnce(Reply) -> Control)
                              -> bool {
        if let Err(FlowError::Conflict(_)) = &result {
            if self.reload(machine) {
                self.push_control(machine.flow_id(), again(reply));
                return false;
            }
        }
        let applied = result.is_ok();
        if applied {
            self.hospital.release(&machine.flow_id());
            self.after_commit(machine);
        }
        let _ = reply.send(result);
        applied
    }

    fn apply(self: &Arc<Self>, machine: &mut FlowMachine<L>, outcome: AdvanceOutcome) {
        match outcome {
            AdvanceOutcome::Progressed { .. } => self.after_commit(machine),
            AdvanceOutcome::Idle => {}
            AdvanceOutcome::Errored(report) => self.treat(machine, report),
            AdvanceOutcome::Superseded { inbound } => {
                self.requeue_after_reload(machine, inbound);
            }
        }
    }

    /// Sustituye la copia residente por la última versión confirmada.
    fn reload(&self, machine: &mut FlowMachine<L>) -> bool {
        let flow_id = machine.flow_id();
        match FlowMachine::<L>::load(&self.storage, &flow_id) {
            Ok(Some(fresh)) => {
                log::info!("flujo {}: se recarga v{} en lugar de v{}", flow_id, fresh.version(), machine.version());
                *machine = fresh;
                self.sync_endpoints(machine);
                self.note_patient(machine);
                true
            }
            Ok(None) => {
                log::warn!("flujo {} ya no está en el store", flow_id);
                false
            }
            Err(e) => {
                log::error!("no se pudo recargar el flujo {}: {}", flow_id, e);
                false
            }
        }
    }

    /// Recarga la copia obsoleta y vuelve a encolar el trabajo que falló.
    fn requeue_after_reload(&self, machine: &mut FlowMachine<L>, inbound: Option<Envelope>) -> bool {
        if !self.reload(machine) {
            return false;
        }
        let flow_id = machine.flow_id();
        self.push_control(flow_id, Control::Flush);
        self.push_control(flow_id, inbound.map(Control::Redeliver).unwrap_or(Control::Advance));
        true
    }

    fn note_patient(&self, machine: &FlowMachine<L>) {
        if let FlowState::Hospitalized { .. } = machine.state() {
            self.hospital.observe(machine.flow_id());
        }
    }

    fn after_commit(self: &Arc<Self>, machine: &mut FlowMachine<L>) {
        self.sync_endpoints(machine);
        self.flush(machine);
        let flow_id = machine.flow_id();
        match machine.state() {
            FlowState::Runnable | FlowState::SuspendedSend { .. } => self.push_control(flow_id, Control::Advance),
            state => {
                if let Some(outcome) = state.outcome() {
                    self.publish(flow_id, outcome);
                }
            }
        }
    }

    fn publish(&self, flow_id: FlowId, outcome: FlowResult) {
        match &outcome {
            Ok(_) => log::info!("flujo {} completado", flow_id),
            Err(failure) => log::info!("flujo {} terminó con fallo: {}", flow_id, failure),
        }
        self.results
            .entry(flow_id)
            .or_insert_with(|| watch::channel(None).0)
            .send_replace(Some(outcome));
    }

    fn sync_endpoints(&self, machine: &FlowMachine<L>) {
        let flow_id = machine.flow_id();
        for (session, role, closed) in machine.endpoints() {
            if closed {
                self.router.unregister(session, role);
            } else {
                self.router.register(flow_id, session, role);
            }
        }
    }

    /// Envía la bandeja de salida confirmada. Sólo se marca como enviada si
    /// el transporte aceptó todos los sobres; si no, se reintenta entera.
    fn flush(self: &Arc<Self>, machine: &mut FlowMachine<L>) {
        if self.is_stopped() {
            return;
        }
        let outbound = machine.pending_outbox().to_vec();
        for envelope in &outbound {
            if let Err(e) = self.transport.send(envelope) {
                log::warn!("flujo {}: envío a {} fallido: {}", machine.flow_id(), envelope.recipient, e);
                let report = machine.report(FlowFailure::from(e), None);
                self.treat_flush_failure(machine, report);
                return;
            }
        }
        machine.mark_flushed();
    }

    fn treat_flush_failure(self: &Arc<Self>, machine: &mut FlowMachine<L>, report: FailureReport) {
        let flow_id = machine.flow_id();
        match self.hospital.admit(&report) {
            Diagnosis::Discharge { backoff, .. } => self.delay(flow_id, backoff, Control::Flush),
            Diagnosis::OvernightObservation | Diagnosis::Terminal => {
                let env = self.step_env();
                if machine.state().is_terminal() {
                    // Un flujo terminado no se hospitaliza: seguimos intentando el envío.
                    self.delay(flow_id, self.config.max_backoff, Control::Flush);
                } else if let Err(e) = machine.hospitalize(&env, &report) {
                    if matches!(e, FlowError::Conflict(_)) && self.reload(machine) {
                        self.push_control(flow_id, Control::Flush);
                    } else {
                        log::error!("flujo {}: no se pudo hospitalizar: {}", flow_id, e);
                    }
                }
            }
        }
    }

    fn treat(self: &Arc<Self>, machine: &mut FlowMachine<L>, report: FailureReport) {
        let flow_id = machine.flow_id();
        let env = self.step_env();
        match self.hospital.admit(&report) {
            Diagnosis::Discharge { backoff, .. } => {
                let control = match report.inbound {
                    Some(envelope) => Control::Redeliver(envelope),
                    None => Control::Advance,
                };
                self.delay(flow_id, backoff, control);
            }
            Diagnosis::OvernightObservation => match machine.hospitalize(&env, &report) {
                Ok(_) => self.after_commit(machine),
                Err(e) => {
                    if matches!(e, FlowError::Conflict(_)) && self.requeue_after_reload(machine, report.inbound.clone()) {
                        return;
                    }
                    log::error!("flujo {}: no se pudo hospitalizar: {}", flow_id, e);
                    let control = report.inbound.map(Control::Redeliver).unwrap_or(Control::Advance);
                    self.delay(flow_id, self.config.max_backoff, control);
                }
            },
            Diagnosis::Terminal => match machine.fail(&env, report.failure.clone()) {
                Ok(_) => self.after_commit(machine),
                Err(e) => {
                    if matches!(e, FlowError::Conflict(_)) && self.requeue_after_reload(machine, report.inbound.clone()) {
                        return;
                    }
                    log::error!("flujo {}: no se pudo marcar como fallido: {}", flow_id, e);
                    let control = report.inbound.map(Control::Redeliver).unwrap_or(Control::Advance);
                    self.delay(flow_id, self.config.max_backoff, control);
                }
            },
        }
    }

    /// Da de alta un flujo residente y lo despierta.
    /// Nunca reemplaza una copia ya residente, que puede ser más nueva.
    fn admit_resident(self: &Arc<Self>, machine: FlowMachine<L>, controls: Vec<Control>) {
        let flow_id = machine.flow_id();
        match self.resident.entry(flow_id) {
            Entry::Occupied(_) => log::debug!("flujo {} ya residente; se descarta la copia cargada", flow_id),
            Entry::Vacant(slot) => {
                self.sync_endpoints(&machine);
                self.note_patient(&machine);
                slot.insert(machine);
            }
        }
        for control in controls {
            self.push_control(flow_id, control);
        }
        self.wake(flow_id);
    }

    fn start_flow(self: &Arc<Self>, logic: L, client_id: Option<String>) -> Result<FlowId> {
        match FlowMachine::start(&self.storage, self.node.clone(), logic, client_id.clone()) {
            Ok(machine) => {
                let flow_id = machine.flow_id();
                self.admit_resident(machine, vec![Control::Advance]);
                Ok(flow_id)
            }
            Err(FlowError::Conflict(_)) if client_id.is_some() => {
                let flow_id = client_id.as_deref()
                                       .map(FlowId::for_client_id)
                                       .ok_or_else(|| FlowError::Other("client id ausente".into()))?;
                log::info!("client id {:?} ya tiene el flujo {}", client_id, flow_id);
                Ok(flow_id)
            }
            Err(e) => Err(e),
        }
    }

    fn on_session_init(self: &Arc<Self>, open: Envelope) {
        let MessageKind::Open { flow_kind, .. } = &open.message.kind else {
            return;
        };
        let session = open.message.session;
        let responder_id = FlowId::for_responder(&session);
        if self.claims.contains(&responder_id) || self.resident.contains_key(&responder_id) {
            // El responder ya existe: el Open es un duplicado y su máquina lo descarta.
            self.router.deliver_to(responder_id, open);
            return;
        }
        let Some(logic) = L::responder(flow_kind, session) else {
            log::warn!("{}: no hay responder para `{}`; se rechaza la sesión {}", self.node, flow_kind, session);
            let reject = SessionMessage { session,
                                          from: Role::Responder,
                                          seq: HANDSHAKE_SEQ,
                                          kind: MessageKind::Reject { reason: format!("no hay responder registrado para `{}`",
                                                                                      flow_kind) } };
            let envelope = Envelope::new(self.node.clone(), open.sender.clone(), responder_id, reject);
            if let Err(e) = self.transport.send(&envelope) {
                log::warn!("no se pudo enviar el rechazo a {}: {}", open.sender, e);
            }
            return;
        };
        match FlowMachine::start_responder(&self.storage, self.node.clone(), logic, &open) {
            Ok(machine) => self.admit_resident(machine, vec![Control::Flush, Control::Advance]),
            Err(FlowError::Conflict(_)) => match FlowMachine::<L>::load(&self.storage, &responder_id) {
                Ok(Some(machine)) => {
                    if self.claims.contains(&responder_id) || self.resident.contains_key(&responder_id) {
                        self.router.deliver_to(responder_id, open);
                    } else {
                        self.admit_resident(machine, vec![Control::Flush, Control::Advance]);
                    }
                }
                Ok(None) => log::warn!("responder {} desapareció durante su creación", responder_id),
                Err(e) => log::error!("no se pudo cargar el responder {}: {}", responder_id, e),
            },
            Err(e) => log::error!("no se pudo crear el responder para la sesión {}: {}", session, e),
        }
    }

    /// Busca en el store el flujo dueño de un extremo sin registrar.
    fn hydrate(self: &Arc<Self>, session: SessionId, role: Role) {
        let endpoint = (session, role);
        if self.router.resolve(&endpoint).is_some() {
            return;
        }
        if self.unowned.get(&endpoint).map(|until| Instant::now() < *until).unwrap_or(false) {
            log::trace!("sesión {} ({:?}) ya buscada sin éxito", session, role);
            return;
        }
        let flows = match self.storage.list_flows() {
            Ok(f) => f,
            Err(e) => {
                log::error!("no se pudieron listar los flujos: {}", e);
                return;
            }
        };
        for (flow_id, _) in flows {
            if self.resident.contains_key(&flow_id) || self.claims.contains(&flow_id) {
                continue;
            }
            match FlowMachine::<L>::load(&self.storage, &flow_id) {
                Ok(Some(machine)) if machine.holds(&session, role) => {
                    log::debug!("sesión {} pertenece al flujo {}; se rehidrata", session, flow_id);
                    self.unowned.remove(&endpoint);
                    self.admit_resident(machine, vec![Control::Flush]);
                    return;
                }
                Ok(_) => {}
                Err(e) => log::warn!("flujo {} ilegible durante la rehidratación: {}", flow_id, e),
            }
        }
        log::debug!("sin dueño para la sesión {} ({:?}); el mensaje queda pendiente", session, role);
        self.unowned.insert(endpoint, Instant::now() + self.config.pending_timeout);
    }

    /// Responde con un fallo de sesión a cada mensaje pendiente caducado.
    fn sweep_pending(&self) {
        if self.is_stopped() {
            return;
        }
        let now = Instant::now();
        self.unowned.retain(|_, until| *until > now);
        for envelope in self.router.expire(now) {
            if matches!(envelope.message.kind, MessageKind::Abort { .. }) {
                continue;
            }
            let failure = FlowFailure::timeout(format!("nadie en {} atendió la sesión {}",
                                                       self.node, envelope.message.session));
            let reply = envelope.abort_reply(&self.node, failure);
            log::warn!("mensaje {:?} caducado; se avisa a {}", envelope.dedup_key(), envelope.sender);
            if let Err(e) = self.transport.send(&reply) {
                log::warn!("no se pudo avisar a {}: {}", envelope.sender, e);
            }
        }
    }

    /// Encola `Expire` para los flujos residentes que esperan un mensaje
    /// desde hace más de `receive_timeout`.
    fn sweep_waits(self: &Arc<Self>) {
        let Some(timeout) = self.config.receive_timeout else {
            return;
        };
        if self.is_stopped() {
            return;
        }
        let limit = chrono_span(timeout);
        let now = Utc::now();
        let overdue: Vec<FlowId> = self.resident
                                       .iter()
                                       .filter(|entry| {
                                           entry.value()
                                                .waiting_since()
                                                .map(|since| now.signed_duration_since(since) > limit)
                                                .unwrap_or(false)
                                       })
                                       .map(|entry| *entry.key())
                                       .collect();
        for flow_id in overdue {
            if self.expiring.insert(flow_id) {
                self.push_control(flow_id, Control::Expire);
                self.wake(flow_id);
            }
        }
    }

    /// Falla con `session-timeout` un flujo cuya espera venció. El hospital
    /// decide si es terminal o reintentable.
    fn expire_wait(self: &Arc<Self>, machine: &mut FlowMachine<L>) {
        let flow_id = machine.flow_id();
        self.expiring.remove(&flow_id);
        let (Some(timeout), Some(since)) = (self.config.receive_timeout, machine.waiting_since()) else {
            return;
        };
        if Utc::now().signed_duration_since(since) <= chrono_span(timeout) {
            return;
        }
        let failure = FlowFailure::timeout(format!("el flujo {} esperó más de {:?} un mensaje", flow_id, timeout));
        log::warn!("{}", failure.message);
        let report = machine.report(failure, None);
        self.treat(machine, report);
    }

    /// Rehidrata todos los flujos no terminales del store, reenvía sus
    /// bandejas de salida y reanuda los que eran ejecutables.
    fn recover(self: &Arc<Self>) -> Result<usize> {
        let ids = self.storage.list_non_terminal()?;
        let loaded: Vec<(FlowId, Result<Option<FlowMachine<L>>>)> =
            ids.par_iter()
               .map(|id| (*id, FlowMachine::<L>::load(&self.storage, id)))
               .collect();
        let mut recovered = 0;
        for (flow_id, result) in loaded {
            match result {
                Ok(Some(machine)) => {
                    if self.resident.contains_key(&flow_id) || self.claims.contains(&flow_id) {
                        continue;
                    }
                    if let FlowState::Hospitalized { .. } = machine.state() {
                        self.admit_resident(machine, vec![Control::Flush]);
                    } else {
                        self.admit_resident(machine, vec![Control::Flush, Control::Advance]);
                    }
                    recovered += 1;
                }
                Ok(None) => {}
                Err(e) => log::error!("no se pudo recuperar el flujo {}: {}", flow_id, e),
            }
        }
        log::info!("{}: {} flujos recuperados", self.node, recovered);
        Ok(recovered)
    }

    /// Purga checkpoints terminales más antiguos que su retención.
    fn collect_garbage(&self) -> Result<usize> {
        let now = chrono::Utc::now();
        let mut purged = 0;
        for (flow_id, status) in self.storage.list_flows()? {
            if !status.is_terminal() || self.claims.contains(&flow_id) {
                continue;
            }
            let retention = match status {
                crate::domain::FlowStatus::Completed => self.config.completed_retention,
                _ => self.config.failed_retention,
            };
            let retention = chrono_span(retention);
            let Some(stored) = self.storage.get(&flow_id)? else {
                continue;
            };
            if now.signed_duration_since(stored.updated_at) <= retention {
                continue;
            }
            if let Some((_, machine)) = self.resident.remove(&flow_id) {
                for (session, role, _) in machine.endpoints() {
                    self.router.unregister(session, role);
                }
            }
            self.storage.remove(&flow_id)?;
            self.router.drop_mailbox(&flow_id);
            self.hospital.forget(&flow_id);
            self.results.remove(&flow_id);
            self.controls.remove(&flow_id);
            self.rewake.remove(&flow_id);
            self.expiring.remove(&flow_id);
            purged += 1;
        }
        if purged > 0 {
            log::info!("{}: {} checkpoints terminales purgados", self.node, purged);
        }
        Ok(purged)
    }
}
