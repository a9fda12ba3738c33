// Archivo: transport.rs
// Propósito: contrato del transporte de red. Se asume at-least-once, sin
// orden y autenticado por sobre; la capa de sesión aporta orden y
// deduplicación encima.
use crate::domain::NodeId;
use crate::errors::Result;
use crate::session::Envelope;

pub trait Transport: Send + Sync {
    /// Envía un sobre al nodo `envelope.recipient`. `Ok` equivale al ack del
    /// transporte.
    fn send(&self, envelope: &Envelope) -> Result<()>;

    /// Indica si el transporte sabe resolver el nodo destino.
    fn resolves(&self, node: &NodeId) -> bool;
}
