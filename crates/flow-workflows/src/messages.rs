use flow::{NodeId, NotarisationOutcome, Typed};
use serde::{Deserialize, Serialize};

/// Mensajes de aplicación que intercambian los flujos de este crate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AppMessage {
  Ping { n: u32, last: bool },
  Pong { n: u32 },
  PaymentRequest { payer: NodeId, amount: u64, reference: String, notary: Option<NodeId> },
  PaymentAccepted { tx_id: String },
  NotariseRequest { tx_id: String, state_refs: Vec<String> },
  NotariseResponse { verdict: NotaryVerdict },
}

impl Typed for AppMessage {
  fn type_name(&self) -> &'static str {
    match self {
      AppMessage::Ping { .. } => "ping",
      AppMessage::Pong { .. } => "pong",
      AppMessage::PaymentRequest { .. } => "payment_request",
      AppMessage::PaymentAccepted { .. } => "payment_accepted",
      AppMessage::NotariseRequest { .. } => "notarise_request",
      AppMessage::NotariseResponse { .. } => "notarise_response",
    }
  }
}

/// Respuesta del notario tal como viaja por la sesión.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotaryVerdict {
  Committed,
  Conflict(Vec<String>),
}

impl From<NotarisationOutcome> for NotaryVerdict {
  fn from(outcome: NotarisationOutcome) -> Self {
    match outcome {
      NotarisationOutcome::Committed => NotaryVerdict::Committed,
      NotarisationOutcome::Conflict(refs) => NotaryVerdict::Conflict(refs),
    }
  }
}
