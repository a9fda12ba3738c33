use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Tipos de workflow que se pueden arrancar desde la fábrica.
///
/// Los responders (`pong`, `payment-responder`, `notary-service`) no
/// aparecen aquí: sólo los crea el nodo al recibir un `Open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowType {
    Ping,
    Payment,
    Notarise,
    #[default]
    Unknown,
}

impl WorkflowType {
    /// Tipo de workflow de un `flow_kind` guardado en un checkpoint.
    pub fn from_kind(kind: &str) -> Self {
        match kind {
            "ping" => WorkflowType::Ping,
            "payment" => WorkflowType::Payment,
            "notary-client" => WorkflowType::Notarise,
            _ => WorkflowType::Unknown,
        }
    }
}

impl fmt::Display for WorkflowType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkflowType::Ping => "ping",
            WorkflowType::Payment => "payment",
            WorkflowType::Notarise => "notarise",
            WorkflowType::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for WorkflowType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ping" => Ok(WorkflowType::Ping),
            "payment" => Ok(WorkflowType::Payment),
            "notarise" | "notarize" => Ok(WorkflowType::Notarise),
            _ => Ok(WorkflowType::Unknown),
        }
    }
}
