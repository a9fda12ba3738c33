use super::unexpected;
use crate::messages::{AppMessage, NotaryVerdict};
use flow::{FlowContext, FlowFailure, NodeId, Received, SessionId, Transition};
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Pagador: pide al payee que acepte un pago y espera el `tx_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentFlow {
  pub payee: NodeId,
  pub amount: u64,
  pub reference: String,
  pub notary: Option<NodeId>,
  session: Option<SessionId>,
}

impl PaymentFlow {
  pub fn new(payee: NodeId, amount: u64, reference: impl Into<String>, notary: Option<NodeId>) -> Self {
    PaymentFlow { payee,
                  amount,
                  reference: reference.into(),
                  notary,
                  session: None }
  }

  pub(crate) fn step(&mut self, ctx: &mut FlowContext<'_, AppMessage>) -> Result<Transition, FlowFailure> {
    let Some(s) = self.session else {
      let s = ctx.initiate(&self.payee)?;
      self.session = Some(s);
      let request = AppMessage::PaymentRequest { payer: ctx.our_node().clone(),
                                                 amount: self.amount,
                                                 reference: self.reference.clone(),
                                                 notary: self.notary.clone() };
      return ctx.send_and_receive(s, &request, "payment_accepted");
    };
    match ctx.receive(s, "payment_accepted")? {
      Received::Message(AppMessage::PaymentAccepted { tx_id }) => {
        ctx.close(s)?;
        Ok(Transition::Complete(json!({ "tx_id": tx_id,
                                        "amount": self.amount,
                                        "payee": self.payee.as_str() })))
      }
      Received::Message(other) => Err(unexpected(&other)),
      Received::Suspend(wait) => Ok(Transition::Suspend(wait)),
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum PayeeStage {
  AwaitingRequest,
  Notarising { notary_session: SessionId, tx_id: String, payer: NodeId, amount: u64 },
}

/// Payee: verifica el contrato `payment`, notariza la referencia si el
/// pagador indicó un notario y acepta el pago.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentResponderFlow {
  session: SessionId,
  stage: PayeeStage,
}

impl PaymentResponderFlow {
  pub fn new(session: SessionId) -> Self {
    PaymentResponderFlow { session,
                           stage: PayeeStage::AwaitingRequest }
  }

  fn accept(&self,
            ctx: &mut FlowContext<'_, AppMessage>,
            tx_id: String,
            payer: &NodeId,
            amount: u64)
            -> Result<Transition, FlowFailure> {
    ctx.send(self.session, &AppMessage::PaymentAccepted { tx_id: tx_id.clone() })?;
    log::debug!("pago {} de {} aceptado ({})", tx_id, payer, amount);
    Ok(Transition::Complete(json!({ "tx_id": tx_id,
                                    "amount": amount,
                                    "payer": payer.as_str() })))
  }

  pub(crate) fn step(&mut self, ctx: &mut FlowContext<'_, AppMessage>) -> Result<Transition, FlowFailure> {
    match self.stage.clone() {
      PayeeStage::AwaitingRequest => {
        let (payer, amount, reference, notary) = match ctx.receive(self.session, "payment_request")? {
          Received::Message(AppMessage::PaymentRequest { payer,
                                                         amount,
                                                         reference,
                                                         notary, }) => (payer, amount, reference, notary),
          Received::Message(other) => return Err(unexpected(&other)),
          Received::Suspend(wait) => return Ok(Transition::Suspend(wait)),
        };
        ctx.verify("payment",
                   &json!({ "payer": payer.as_str(),
                            "payee": ctx.our_node().as_str(),
                            "amount": amount,
                            "reference": reference }))?;
        // determinista: una reejecución del paso produce el mismo tx_id
        let tx_id = format!("tx-{}", self.session);
        let Some(notary) = notary else {
          return self.accept(ctx, tx_id, &payer, amount);
        };
        let notary_session = ctx.initiate(&notary)?;
        self.stage = PayeeStage::Notarising { notary_session,
                                              tx_id: tx_id.clone(),
                                              payer,
                                              amount };
        ctx.send_and_receive(notary_session,
                             &AppMessage::NotariseRequest { tx_id,
                                                            state_refs: vec![reference] },
                             "notarise_response")
      }
      PayeeStage::Notarising { notary_session,
                               tx_id,
                               payer,
                               amount, } => match ctx.receive(notary_session, "notarise_response")? {
        Received::Message(AppMessage::NotariseResponse { verdict: NotaryVerdict::Committed }) => {
          ctx.close(notary_session)?;
          self.accept(ctx, tx_id, &payer, amount)
        }
        Received::Message(AppMessage::NotariseResponse { verdict: NotaryVerdict::Conflict(refs) }) => {
          Err(FlowFailure::rejected(format!("doble gasto: {} ya consumido", refs.join(", "))))
        }
        Received::Message(other) => Err(unexpected(&other)),
        Received::Suspend(wait) => Ok(Transition::Suspend(wait)),
      },
    }
  }
}
