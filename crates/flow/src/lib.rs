//! Crate `flow`: máquinas de estado de flujos durables con mensajería por
//! sesiones entre nodos.
//!
//! Un flujo es un proceso de negocio de larga duración que alterna cómputo
//! local con intercambio de mensajes con flujos de otros nodos. Cada paso
//! confirma un checkpoint antes de emitir nada a la red, de modo que un
//! flujo sobrevive a la caída del proceso y se reanuda desde su última
//! suspensión sin duplicar efectos observables.
//!
//! Piezas:
//! - `session`: sesiones ordenadas y deduplicadas sobre un transporte
//!   at-least-once.
//! - `machine`: avance transaccional de un flujo (`FlowMachine`).
//! - `checkpoint` y `repository`: snapshot durable y contrato del store.
//! - `router`: resolución de sobres entrantes a su flujo.
//! - `scheduler`: ejecución concurrente con exclusión por flujo.
//! - `hospital`: política de reintento, observación y terminación.
//! - `engine`: fachada pública de un nodo.
//!
//! Ejemplo rápido:
//! ```rust
//! use flow::stubs::InMemoryCheckpointStore;
//! use flow::CheckpointStore;
//! use std::sync::Arc;
//! let store: Arc<dyn CheckpointStore> = Arc::new(InMemoryCheckpointStore::new());
//! assert!(store.list_flows().unwrap().is_empty());
//! ```
pub mod checkpoint;
pub mod config;
pub mod domain;
pub mod engine;
pub mod errors;
pub mod hospital;
pub mod logic;
pub mod machine;
pub mod repository;
pub mod router;
pub mod scheduler;
pub mod services;
pub mod session;
pub mod stubs;
pub mod transport;

pub use checkpoint::*;
pub use config::*;
pub use domain::*;
pub use engine::*;
pub use errors::*;
pub use hospital::*;
pub use logic::*;
pub use machine::*;
pub use repository::*;
pub use router::*;
pub use services::*;
pub use session::*;
pub use transport::*;
