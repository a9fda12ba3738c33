// Archivo: logic.rs
// Propósito: contrato que implementa la lógica de negocio de un flujo
// (`FlowLogic`) y el contexto (`FlowContext`) a través del cual un paso abre
// sesiones, envía, recibe y consulta servicios.
//
// Un paso es una función pura de (variables locales, mensajes entregados) a
// (nuevas variables, mensajes salientes, transición). No toca la red: los
// envíos quedan en la bandeja de salida del checkpoint y sólo se emiten
// después de que el checkpoint se confirme.
use crate::domain::{FlowId, FlowState, NodeId, SessionId};
use crate::errors::{FlowError, FlowFailure};
use crate::services::{FlowServices, Verdict};
use crate::session::{Envelope, MessageKind, Session};
use crate::transport::Transport;
use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::marker::PhantomData;

/// Nombre estable de cada variante de mensaje de aplicación. Se compara con
/// el tipo que espera un `receive`.
pub trait Typed {
    fn type_name(&self) -> &'static str;
}

/// Lógica de un flujo. Las variables locales son el propio valor que
/// implementa el trait: se serializan enteras en cada checkpoint.
pub trait FlowLogic: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    type Message: Serialize + DeserializeOwned + Typed + Send + 'static;

    /// Nombre del tipo de flujo; viaja en el `Open` para elegir responder.
    fn kind(&self) -> &'static str;

    /// Ejecuta el flujo hasta la siguiente suspensión o hasta terminar.
    fn step(&mut self, ctx: &mut FlowContext<'_, Self::Message>) -> Result<Transition, FlowFailure>;

    /// Responder para un `Open` de un flujo `initiator_kind`, o `None` si el
    /// nodo no lo acepta.
    fn responder(initiator_kind: &str, session: SessionId) -> Option<Self>;
}

/// Punto de suspensión declarado por un paso.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Suspend {
    Send { session: SessionId },
    Receive { session: SessionId, expected: &'static str },
    SendAndReceive { session: SessionId, expected: &'static str },
}

impl Suspend {
    pub fn session(&self) -> SessionId {
        match self {
            Suspend::Send { session }
            | Suspend::Receive { session, .. }
            | Suspend::SendAndReceive { session, .. } => *session,
        }
    }

    pub fn awaits_message(&self) -> bool {
        !matches!(self, Suspend::Send { .. })
    }
}

impl From<Suspend> for FlowState {
    fn from(s: Suspend) -> Self {
        match s {
            Suspend::Send { session } => FlowState::SuspendedSend { session },
            Suspend::Receive { session, expected } => FlowState::SuspendedReceive { session,
                                                                                     expected: expected.to_string() },
            Suspend::SendAndReceive { session, expected } => {
                FlowState::SuspendedSendAndReceive { session,
                                                     expected: expected.to_string() }
            }
        }
    }
}

/// Resultado de un paso.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Seguir ejecutando sin suspender.
    Continue,
    Suspend(Suspend),
    Complete(JsonValue),
}

/// Resultado de `FlowContext::receive`.
#[derive(Debug)]
pub enum Received<M> {
    Message(M),
    /// El mensaje aún no llegó: el paso debe devolver esta suspensión.
    Suspend(Suspend),
}

/// Vista mutable del checkpoint en curso que recibe cada paso.
pub struct FlowContext<'a, M> {
    flow_id: FlowId,
    flow_kind: &'static str,
    our_node: &'a NodeId,
    sessions: &'a mut IndexMap<SessionId, Session>,
    outbox: &'a mut Vec<Envelope>,
    nonce: &'a mut u64,
    services: &'a FlowServices,
    transport: &'a dyn Transport,
    _message: PhantomData<fn() -> M>,
}

impl<'a, M> FlowContext<'a, M> where M: Serialize + DeserializeOwned + Typed
{
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(flow_id: FlowId,
                      flow_kind: &'static str,
                      our_node: &'a NodeId,
                      sessions: &'a mut IndexMap<SessionId, Session>,
                      outbox: &'a mut Vec<Envelope>,
                      nonce: &'a mut u64,
                      services: &'a FlowServices,
                      transport: &'a dyn Transport)
                      -> Self {
        Self { flow_id,
               flow_kind,
               our_node,
               sessions,
               outbox,
               nonce,
               services,
               transport,
               _message: PhantomData }
    }

    pub fn flow_id(&self) -> FlowId {
        self.flow_id
    }

    pub fn our_node(&self) -> &NodeId {
        self.our_node
    }

    pub fn services(&self) -> &FlowServices {
        self.services
    }

    /// Nodo al otro lado de la sesión.
    pub fn peer(&self, session: SessionId) -> Option<&NodeId> {
        self.sessions.get(&session).map(|s| &s.peer)
    }

    /// Abre una sesión con `counterparty`. El id se deriva del flujo y de un
    /// contador persistido, así que repetir el paso produce la misma sesión.
    pub fn initiate(&mut self, counterparty: &NodeId) -> Result<SessionId, FlowFailure> {
        if !self.transport.resolves(counterparty) {
            return Err(FlowError::CounterpartyUnreachable(counterparty.clone()).into());
        }
        let id = SessionId::derived(&self.flow_id, *self.nonce);
        *self.nonce += 1;
        let mut session = Session::initiate(id, counterparty.clone());
        let open = session.sequence(MessageKind::Open { initiator_flow: self.flow_id,
                                                        flow_kind: self.flow_kind.to_string() });
        self.outbox
            .push(Envelope::new(self.our_node.clone(), counterparty.clone(), self.flow_id, open));
        self.sessions.insert(id, session);
        log::debug!("flujo {} abre la sesión {} con {}", self.flow_id, id, counterparty);
        Ok(id)
    }

    /// Encola un mensaje para el par. Sale a la red tras el siguiente
    /// checkpoint.
    pub fn send(&mut self, session: SessionId, message: &M) -> Result<(), FlowFailure> {
        let payload = serde_json::to_vec(message).map_err(|e| {
                                                      FlowFailure::internal(format!("no se pudo serializar `{}`: {}",
                                                                                    message.type_name(),
                                                                                    e))
                                                  })?;
        let s = self.sessions
                    .get_mut(&session)
                    .ok_or_else(|| FlowFailure::internal(format!("sesión desconocida {}", session)))?;
        s.check_sendable()?;
        let data = s.sequence(MessageKind::Data { payload });
        let peer = s.peer.clone();
        self.outbox.push(Envelope::new(self.our_node.clone(), peer, self.flow_id, data));
        Ok(())
    }

    /// Entrega el siguiente mensaje de la sesión si ya llegó, comprobando que
    /// sea del tipo esperado. Si no llegó devuelve la suspensión a usar.
    pub fn receive(&mut self, session: SessionId, expected: &'static str) -> Result<Received<M>, FlowFailure> {
        let s = self.sessions
                    .get_mut(&session)
                    .ok_or_else(|| FlowFailure::internal(format!("sesión desconocida {}", session)))?;
        let Some(bytes) = s.take_data()? else {
            return Ok(Received::Suspend(Suspend::Receive { session, expected }));
        };
        let message: M = serde_json::from_slice(&bytes).map_err(|e| {
                                                          FlowFailure::internal(format!("payload ilegible en la sesión {}: {}",
                                                                                        session, e))
                                                      })?;
        if message.type_name() != expected {
            return Err(FlowFailure::internal(format!("se esperaba `{}` en la sesión {} y llegó `{}`",
                                                     expected,
                                                     session,
                                                     message.type_name())));
        }
        Ok(Received::Message(message))
    }

    /// Envía y declara la suspensión hasta la respuesta. El paso siguiente
    /// debe llamar a `receive` sobre la misma sesión.
    pub fn send_and_receive(&mut self, session: SessionId, message: &M, expected: &'static str) -> Result<Transition, FlowFailure> {
        self.send(session, message)?;
        Ok(Transition::Suspend(Suspend::SendAndReceive { session, expected }))
    }

    /// Inicia el cierre de la sesión.
    pub fn close(&mut self, session: SessionId) -> Result<(), FlowFailure> {
        let s = self.sessions
                    .get_mut(&session)
                    .ok_or_else(|| FlowFailure::internal(format!("sesión desconocida {}", session)))?;
        if let Some(close) = s.begin_close() {
            let peer = s.peer.clone();
            self.outbox.push(Envelope::new(self.our_node.clone(), peer, self.flow_id, close));
        }
        Ok(())
    }

    /// Ejecuta la verificación de contrato; un rechazo termina el flujo como
    /// `counterparty-rejected`.
    pub fn verify(&self, contract: &str, inputs: &JsonValue) -> Result<(), FlowFailure> {
        match self.services.verifier.verify(contract, inputs) {
            Verdict::Accepted => Ok(()),
            Verdict::Rejected(reason) => Err(FlowFailure::rejected(reason)),
        }
    }
}
