//! Flujos de aplicación y su registro de responders.

pub mod notary;
pub mod payment;
pub mod ping;

pub use notary::{NotaryClientFlow, NotaryServiceFlow};
pub use payment::{PaymentFlow, PaymentResponderFlow};
pub use ping::{PingFlow, PongFlow};

use crate::messages::AppMessage;
use flow::{FlowContext, FlowFailure, FlowLogic, SessionId, Transition};
use serde::{Deserialize, Serialize};

/// Todos los flujos que conoce un nodo. El emparejamiento iniciador →
/// responder se resuelve en `responder` con un `match` exhaustivo.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AppFlow {
  Ping(PingFlow),
  Pong(PongFlow),
  Payment(PaymentFlow),
  PaymentResponder(PaymentResponderFlow),
  NotaryClient(NotaryClientFlow),
  NotaryService(NotaryServiceFlow),
}

impl FlowLogic for AppFlow {
  type Message = AppMessage;

  fn kind(&self) -> &'static str {
    match self {
      AppFlow::Ping(_) => "ping",
      AppFlow::Pong(_) => "pong",
      AppFlow::Payment(_) => "payment",
      AppFlow::PaymentResponder(_) => "payment-responder",
      AppFlow::NotaryClient(_) => "notary-client",
      AppFlow::NotaryService(_) => "notary-service",
    }
  }

  fn step(&mut self, ctx: &mut FlowContext<'_, AppMessage>) -> Result<Transition, FlowFailure> {
    match self {
      AppFlow::Ping(f) => f.step(ctx),
      AppFlow::Pong(f) => f.step(ctx),
      AppFlow::Payment(f) => f.step(ctx),
      AppFlow::PaymentResponder(f) => f.step(ctx),
      AppFlow::NotaryClient(f) => f.step(ctx),
      AppFlow::NotaryService(f) => f.step(ctx),
    }
  }

  fn responder(initiator_kind: &str, session: SessionId) -> Option<Self> {
    match initiator_kind {
      "ping" => Some(AppFlow::Pong(PongFlow::new(session))),
      "payment" => Some(AppFlow::PaymentResponder(PaymentResponderFlow::new(session))),
      // el payee notariza antes de aceptar el pago
      "payment-responder" | "notary-client" => Some(AppFlow::NotaryService(NotaryServiceFlow::new(session))),
      _ => None,
    }
  }
}

pub(crate) fn unexpected(message: &AppMessage) -> FlowFailure {
  FlowFailure::internal(format!("mensaje inesperado: {:?}", message))
}
