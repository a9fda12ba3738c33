// Archivo: services.rs
// Propósito: colaboradores externos que un flujo invoca de forma síncrona
// dentro de un paso (verificación de contratos, proveedor de unicidad del
// notario) y el contenedor `FlowServices` que los inyecta.
use serde_json::Value as JsonValue;
use std::sync::Arc;

/// Veredicto de la verificación de un contrato.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Accepted,
    Rejected(String),
}

/// Lógica de contrato: función pura de (vista del ledger, entradas del paso)
/// a aceptado/rechazado. El rechazo llega al hospital como
/// `counterparty-rejected`.
pub trait ContractVerifier: Send + Sync {
    fn verify(&self, contract: &str, inputs: &JsonValue) -> Verdict;
}

/// Respuesta del servicio de notario a una petición de finalización.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotarisationOutcome {
    Committed,
    Conflict(Vec<String>),
}

/// Detección de conflictos del notario. El algoritmo concreto queda fuera
/// del framework; sólo importa el contrato petición/respuesta.
pub trait UniquenessProvider: Send + Sync {
    fn commit(&self, tx_id: &str, state_refs: &[String]) -> NotarisationOutcome;
}

/// Handle único de colaboradores inyectado en cada paso.
#[derive(Clone)]
pub struct FlowServices {
    pub verifier: Arc<dyn ContractVerifier>,
    pub uniqueness: Arc<dyn UniquenessProvider>,
}

impl FlowServices {
    pub fn new(verifier: Arc<dyn ContractVerifier>, uniqueness: Arc<dyn UniquenessProvider>) -> Self {
        Self { verifier, uniqueness }
    }

    pub fn with_verifier(mut self, verifier: Arc<dyn ContractVerifier>) -> Self {
        self.verifier = verifier;
        self
    }
}

impl Default for FlowServices {
    fn default() -> Self {
        Self { verifier: Arc::new(crate::stubs::AcceptAllVerifier),
               uniqueness: Arc::new(crate::stubs::InMemoryUniquenessProvider::new()) }
    }
}
