// Archivo: session.rs
// Propósito: sesiones ordenadas y bidireccionales entre dos instancias de
// flujo. Define el sobre de red (`Envelope`), el mensaje de sesión con su
// número de secuencia por dirección y el estado de cada extremo (`Session`),
// que aporta orden estricto y entrega exactamente-una-vez sobre un
// transporte at-least-once y sin orden.
//
// Numeración: el handshake (`Open`/`Confirm`/`Reject`) ocupa la secuencia 0
// de cada dirección; los datos y el resto de mensajes de control empiezan en
// la 1. `Abort` no lleva secuencia: lo emite el router, no un flujo.
use crate::domain::{FlowId, NodeId, SessionId};
use crate::errors::FlowFailure;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Secuencia del mensaje de apertura/confirmación en cada dirección.
pub const HANDSHAKE_SEQ: u64 = 0;

/// Rol de un extremo dentro de la sesión.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Initiator,
    Responder,
}

impl Role {
    pub fn opposite(self) -> Self {
        match self {
            Role::Initiator => Role::Responder,
            Role::Responder => Role::Initiator,
        }
    }
}

/// Extremo receptor: la sesión y el rol de quien recibe.
pub type Endpoint = (SessionId, Role);

// Los payloads son opacos para esta capa: viajan como base64 dentro del JSON.
mod payload_b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(d)?;
        STANDARD.decode(encoded.as_bytes()).map_err(serde::de::Error::custom)
    }
}

/// Contenido de un mensaje de sesión: payload de aplicación o control.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageKind {
    /// Petición de apertura; crea el flujo responder en el nodo destino.
    Open { initiator_flow: FlowId, flow_kind: String },
    /// Aceptación de la apertura por parte del responder.
    Confirm { responder_flow: FlowId },
    /// El nodo destino no tiene responder para ese tipo de flujo.
    Reject { reason: String },
    /// Payload de aplicación.
    Data {
        #[serde(with = "payload_b64")]
        payload: Vec<u8>,
    },
    /// El flujo par terminó con error.
    Error { failure: FlowFailure },
    Close,
    CloseAck,
    /// Fallo de sesión emitido por el router (fuera de secuencia).
    Abort { failure: FlowFailure },
}

impl MessageKind {
    pub fn is_sequenced(&self) -> bool {
        !matches!(self, MessageKind::Abort { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            MessageKind::Open { .. } => "open",
            MessageKind::Confirm { .. } => "confirm",
            MessageKind::Reject { .. } => "reject",
            MessageKind::Data { .. } => "data",
            MessageKind::Error { .. } => "error",
            MessageKind::Close => "close",
            MessageKind::CloseAck => "close_ack",
            MessageKind::Abort { .. } => "abort",
        }
    }
}

/// Mensaje de sesión: id de sesión, rol del emisor, secuencia de su
/// dirección y contenido.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMessage {
    pub session: SessionId,
    pub from: Role,
    pub seq: u64,
    pub kind: MessageKind,
}

/// Sobre que entrega el transporte entre nodos.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub sender: NodeId,
    pub recipient: NodeId,
    pub sender_flow: FlowId,
    pub message: SessionMessage,
}

impl Envelope {
    pub fn new(sender: NodeId, recipient: NodeId, sender_flow: FlowId, message: SessionMessage) -> Self {
        Self { sender,
               recipient,
               sender_flow,
               message }
    }

    /// Extremo que debe recibir este sobre.
    pub fn endpoint(&self) -> Endpoint {
        (self.message.session, self.message.from.opposite())
    }

    /// Clave de deduplicación del lado receptor.
    pub fn dedup_key(&self) -> (SessionId, Role, u64) {
        (self.message.session, self.message.from, self.message.seq)
    }

    /// Respuesta `Abort` dirigida al emisor de este sobre. La usa el router
    /// cuando un mensaje caduca en el buffer de pendientes.
    pub fn abort_reply(&self, local_node: &NodeId, failure: FlowFailure) -> Envelope {
        let message = SessionMessage { session: self.message.session,
                                       from: self.message.from.opposite(),
                                       seq: HANDSHAKE_SEQ,
                                       kind: MessageKind::Abort { failure } };
        Envelope::new(local_node.clone(), self.sender.clone(), self.sender_flow, message)
    }
}

/// Ciclo de vida de un extremo de sesión.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionLifecycle {
    /// El iniciador envió `Open` y espera `Confirm`.
    Requested,
    /// El responder aceptó la apertura; aún no circulan datos.
    Confirmed,
    Open,
    /// Enviamos `Close` y esperamos el `CloseAck` del par.
    Closing,
    /// Ambos lados intercambiaron cierre y ack, o la sesión terminó con error.
    Closed,
}

/// Resultado de incorporar un mensaje entrante al extremo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ingest {
    Accepted,
    Duplicate,
    Misrouted,
}

/// Extremo de una sesión tal como se guarda en el checkpoint de su flujo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub role: Role,
    pub peer: NodeId,
    pub peer_flow: Option<FlowId>,
    pub lifecycle: SessionLifecycle,
    pub next_send_seq: u64,
    pub next_recv_seq: u64,
    /// Mensajes recibidos y aún no entregados, por secuencia.
    pub inbound: BTreeMap<u64, SessionMessage>,
    pub close_sent: bool,
    pub close_acked: bool,
    pub peer_closed: bool,
    /// Fallo informado por el par o por el router; una vez fijado no cambia.
    pub failure: Option<FlowFailure>,
}

impl Session {
    /// Extremo iniciador recién creado; el primer mensaje que secuencie será
    /// el `Open`.
    pub fn initiate(id: SessionId, peer: NodeId) -> Self {
        Self { id,
               role: Role::Initiator,
               peer,
               peer_flow: None,
               lifecycle: SessionLifecycle::Requested,
               next_send_seq: HANDSHAKE_SEQ,
               next_recv_seq: HANDSHAKE_SEQ,
               inbound: BTreeMap::new(),
               close_sent: false,
               close_acked: false,
               peer_closed: false,
               failure: None }
    }

    /// Extremo responder creado a partir de un `Open`. Devuelve el extremo y
    /// el `Confirm` que hay que enviar.
    pub fn accept(id: SessionId, peer: NodeId, initiator_flow: FlowId, our_flow: FlowId) -> (Self, SessionMessage) {
        let mut session = Self { id,
                                 role: Role::Responder,
                                 peer,
                                 peer_flow: Some(initiator_flow),
                                 lifecycle: SessionLifecycle::Confirmed,
                                 next_send_seq: HANDSHAKE_SEQ,
                                 next_recv_seq: HANDSHAKE_SEQ + 1,
                                 inbound: BTreeMap::new(),
                                 close_sent: false,
                                 close_acked: false,
                                 peer_closed: false,
                                 failure: None };
        let confirm = session.sequence(MessageKind::Confirm { responder_flow: our_flow });
        (session, confirm)
    }

    /// Asigna la siguiente secuencia de nuestra dirección al contenido dado.
    pub fn sequence(&mut self, kind: MessageKind) -> SessionMessage {
        let seq = self.next_send_seq;
        self.next_send_seq += 1;
        if matches!(kind, MessageKind::Data { .. }) && self.lifecycle == SessionLifecycle::Confirmed {
            self.lifecycle = SessionLifecycle::Open;
        }
        SessionMessage { session: self.id,
                         from: self.role,
                         seq,
                         kind }
    }

    /// Incorpora un mensaje entrante. Los duplicados (secuencia ya entregada
    /// o ya en buffer) se descartan; los huecos quedan en buffer hasta que se
    /// rellenan.
    pub fn ingest(&mut self, message: SessionMessage) -> Ingest {
        if message.session != self.id || message.from != self.role.opposite() {
            return Ingest::Misrouted;
        }
        if let MessageKind::Abort { failure } = message.kind {
            if self.failure.is_some() {
                return Ingest::Duplicate;
            }
            log::warn!("sesión {} abortada: {}", self.id, failure);
            self.failure = Some(failure);
            return Ingest::Accepted;
        }
        if self.lifecycle == SessionLifecycle::Closed
           || message.seq < self.next_recv_seq
           || self.inbound.contains_key(&message.seq)
        {
            return Ingest::Duplicate;
        }
        self.inbound.insert(message.seq, message);
        Ingest::Accepted
    }

    /// Procesa los mensajes de control contiguos en cabeza del buffer.
    /// Devuelve las respuestas automáticas (`CloseAck`) y cuántos mensajes
    /// consumió. Con `terminal` los datos que nadie va a leer se descartan
    /// para que el cierre pueda completarse.
    pub fn settle(&mut self, terminal: bool) -> (Vec<SessionMessage>, usize) {
        let mut replies = Vec::new();
        let mut consumed = 0;
        loop {
            let is_data = match self.inbound.get(&self.next_recv_seq) {
                None => break,
                Some(head) => matches!(head.kind, MessageKind::Data { .. }),
            };
            if is_data && !terminal {
                break;
            }
            let Some(message) = self.inbound.remove(&self.next_recv_seq) else {
                break;
            };
            self.next_recv_seq += 1;
            consumed += 1;
            match message.kind {
                MessageKind::Confirm { responder_flow } => {
                    self.peer_flow = Some(responder_flow);
                    if self.lifecycle == SessionLifecycle::Requested {
                        self.lifecycle = SessionLifecycle::Open;
                    }
                }
                MessageKind::Reject { reason } => {
                    self.failure.get_or_insert(FlowFailure::rejected(reason));
                    self.lifecycle = SessionLifecycle::Closed;
                }
                MessageKind::Error { failure } => {
                    self.failure.get_or_insert(FlowFailure::rejected(failure.message));
                    self.lifecycle = SessionLifecycle::Closed;
                }
                MessageKind::Close => {
                    self.peer_closed = true;
                    replies.push(self.sequence(MessageKind::CloseAck));
                    self.refresh_closed();
                }
                MessageKind::CloseAck => {
                    self.close_acked = true;
                    self.refresh_closed();
                }
                MessageKind::Data { .. } => {
                    log::debug!("sesión {}: dato {} descartado, el flujo ya terminó", self.id, self.next_recv_seq - 1);
                }
                MessageKind::Open { .. } | MessageKind::Abort { .. } => {}
            }
        }
        (replies, consumed)
    }

    /// Entrega el siguiente payload en orden, si ya llegó. Un fallo del par
    /// o un cierre remoto se devuelven como fallo tipado una vez agotados
    /// los datos anteriores.
    pub fn take_data(&mut self) -> Result<Option<Vec<u8>>, FlowFailure> {
        if let Some(head) = self.inbound.get(&self.next_recv_seq) {
            if let MessageKind::Data { payload } = &head.kind {
                let payload = payload.clone();
                self.inbound.remove(&self.next_recv_seq);
                self.next_recv_seq += 1;
                if self.lifecycle == SessionLifecycle::Confirmed {
                    self.lifecycle = SessionLifecycle::Open;
                }
                return Ok(Some(payload));
            }
        }
        if let Some(failure) = &self.failure {
            return Err(failure.clone());
        }
        if self.peer_closed {
            return Err(FlowFailure::rejected(format!("la contraparte cerró la sesión {}", self.id)));
        }
        Ok(None)
    }

    /// Hay algo que entregar a un `receive` pendiente.
    pub fn deliverable(&self) -> bool {
        let head_is_data = self.inbound
                               .get(&self.next_recv_seq)
                               .map(|m| matches!(m.kind, MessageKind::Data { .. }))
                               .unwrap_or(false);
        head_is_data || self.failure.is_some() || self.peer_closed
    }

    /// Comprueba que aún se puede enviar por esta sesión.
    pub fn check_sendable(&self) -> Result<(), FlowFailure> {
        if let Some(failure) = &self.failure {
            return Err(failure.clone());
        }
        if self.close_sent || self.lifecycle == SessionLifecycle::Closed {
            return Err(FlowFailure::internal(format!("envío sobre la sesión cerrada {}", self.id)));
        }
        Ok(())
    }

    /// Inicia el handshake de cierre. Devuelve el `Close` a enviar, o `None`
    /// si ya se envió o si el par ya no existe.
    pub fn begin_close(&mut self) -> Option<SessionMessage> {
        if self.close_sent || self.lifecycle == SessionLifecycle::Closed {
            return None;
        }
        if self.failure.is_some() {
            self.lifecycle = SessionLifecycle::Closed;
            return None;
        }
        self.close_sent = true;
        self.lifecycle = SessionLifecycle::Closing;
        let close = self.sequence(MessageKind::Close);
        self.refresh_closed();
        Some(close)
    }

    /// Cierra el extremo tras un fallo local, devolviendo el `Error` que
    /// debe recibir el par si todavía escucha.
    pub fn abandon(&mut self, failure: &FlowFailure) -> Option<SessionMessage> {
        if self.lifecycle == SessionLifecycle::Closed {
            return None;
        }
        let message = if self.failure.is_none() {
            Some(self.sequence(MessageKind::Error { failure: failure.clone() }))
        } else {
            None
        };
        self.lifecycle = SessionLifecycle::Closed;
        message
    }

    pub fn is_closed(&self) -> bool {
        self.lifecycle == SessionLifecycle::Closed
    }

    fn refresh_closed(&mut self) {
        if self.close_sent && self.close_acked && self.peer_closed {
            log::debug!("sesión {} cerrada por ambos lados", self.id);
            self.lifecycle = SessionLifecycle::Closed;
        }
    }
}
