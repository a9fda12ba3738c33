//! flow-workflows: flujos de aplicación sobre el crate `flow`.
//!
//! Define los flujos concretos (ping/pong, pago con verificación de
//! contrato, cliente y servicio de notario) como un tipo suma cerrado,
//! `AppFlow`, con su registro de responders, y la fábrica que construye
//! flujos a partir de un `WorkflowType` y argumentos JSON.

pub mod errors;
pub mod factory;
pub mod flows;
pub mod messages;
pub mod workflow_type;

pub use errors::WorkflowError;
pub use factory::WorkflowFactory;
pub use flows::AppFlow;
pub use messages::{AppMessage, NotaryVerdict};
pub use workflow_type::WorkflowType;
