use crate::schema;
use crate::schema::checkpoints::dsl as ck;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, CustomizeConnection, Pool, PooledConnection};
use diesel::result::Error as DieselError;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use flow::{CheckpointRecord, CheckpointStore, FlowError, FlowId, FlowStatus, PersistResult, StoredCheckpoint};
use std::sync::Arc;
pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("./migrations");
type DbPool = Pool<ConnectionManager<SqliteConnection>>;
const POOL_SIZE: u32 = 4;
const BUSY_TIMEOUT_MS: u32 = 5000;
/// PRAGMAs que cada conexión del pool necesita: sin `busy_timeout` dos
/// workers que escriben a la vez reciben `SQLITE_BUSY` en lugar de esperar.
#[derive(Debug)]
struct SqlitePragmas;
impl CustomizeConnection<SqliteConnection, diesel::r2d2::Error> for SqlitePragmas {
  fn on_acquire(&self, conn: &mut SqliteConnection) -> Result<(), diesel::r2d2::Error> {
    diesel::sql_query(format!("PRAGMA busy_timeout = {};", BUSY_TIMEOUT_MS)).execute(conn)
                                                                         .map_err(diesel::r2d2::Error::QueryError)?;
    diesel::sql_query("PRAGMA journal_mode = WAL;").execute(conn)
                                                   .map_err(diesel::r2d2::Error::QueryError)?;
    diesel::sql_query("PRAGMA synchronous = NORMAL;").execute(conn)
                                                     .map_err(diesel::r2d2::Error::QueryError)?;
    Ok(())
  }
}
/// Store Diesel que implementa `CheckpointStore`.
pub struct DieselCheckpointStore {
  pool: Arc<DbPool>,
}
#[derive(Debug, Queryable, Selectable, Insertable)]
#[diesel(table_name = schema::checkpoints)]
struct CheckpointRow {
  pub flow_id: String,
  pub status: String,
  pub version: i64,
  pub payload: Vec<u8>,
  pub checksum: String,
  pub client_id: Option<String>,
  pub updated_at_ts: i64,
}
fn map_db_err<T>(res: std::result::Result<T, DieselError>) -> flow::Result<T> {
  res.map_err(|e| FlowError::Storage(format!("db: {}", e)))
}
fn parse_flow_id(raw: &str) -> flow::Result<FlowId> {
  raw.parse::<FlowId>()
     .map_err(|e| FlowError::Corrupt(format!("flow_id inválido `{}`: {}", raw, e)))
}
fn parse_status(raw: &str) -> flow::Result<FlowStatus> {
  raw.parse::<FlowStatus>().map_err(FlowError::Corrupt)
}
impl CheckpointRow {
  fn into_stored(self) -> flow::Result<StoredCheckpoint> {
    let updated_at = DateTime::<Utc>::from_timestamp_micros(self.updated_at_ts).ok_or_else(|| {
                       FlowError::Corrupt(format!("updated_at inválido para {}", self.flow_id))
                     })?;
    Ok(StoredCheckpoint { flow_id: parse_flow_id(&self.flow_id)?,
                          record: CheckpointRecord { status: parse_status(&self.status)?,
                                                     payload: self.payload,
                                                     checksum: self.checksum,
                                                     client_id: self.client_id },
                          version: self.version,
                          updated_at })
  }
}
impl DieselCheckpointStore {
  /// Abre (o crea) la base SQLite en `database_url` y aplica las
  /// migraciones pendientes.
  pub fn new(database_url: &str) -> flow::Result<Self> {
    let manager = ConnectionManager::<SqliteConnection>::new(database_url);
    let pool = Pool::builder().max_size(POOL_SIZE)
                              .connection_customizer(Box::new(SqlitePragmas))
                              .build(manager)
                              .map_err(|e| FlowError::Storage(format!("no se pudo crear el pool de conexiones: {}", e)))?;
    let store = DieselCheckpointStore { pool: Arc::new(pool) };
    {
      let mut conn = store.conn()?;
      let applied = conn.run_pending_migrations(MIGRATIONS)
                        .map_err(|e| FlowError::Storage(format!("migraciones: {}", e)))?;
      if !applied.is_empty() {
        log::info!("checkpoints: {} migraciones aplicadas en {}", applied.len(), database_url);
      }
    }
    Ok(store)
  }
  fn conn(&self) -> flow::Result<PooledConnection<ConnectionManager<SqliteConnection>>> {
    self.pool
        .get()
        .map_err(|e: r2d2::Error| FlowError::Storage(format!("pool: {}", e)))
  }
  /// Número de filas en la tabla (diagnóstico).
  pub fn count(&self) -> flow::Result<i64> {
    let mut conn = self.conn()?;
    map_db_err(ck::checkpoints.count().get_result(&mut conn))
  }
}
impl CheckpointStore for DieselCheckpointStore {
  fn put(&self, flow_id: &FlowId, record: &CheckpointRecord, expected_version: i64) -> flow::Result<PersistResult> {
    let mut conn = self.conn()?;
    let id_s = flow_id.to_string();
    // IMMEDIATE toma el lock de escritura antes de leer la versión, así la
    // comparación y la escritura son atómicas frente a otros procesos.
    let result = conn.immediate_transaction::<_, DieselError, _>(|conn| {
                       let current = ck::checkpoints.filter(ck::flow_id.eq(&id_s))
                                                    .select(ck::version)
                                                    .first::<i64>(conn)
                                                    .optional()?
                                                    .unwrap_or(0);
                       if current != expected_version {
                         return Ok(PersistResult::Conflict);
                       }
                       let new_version = current + 1;
                       let now = Utc::now().timestamp_micros();
                       if current == 0 {
                         let row = CheckpointRow { flow_id: id_s.clone(),
                                                   status: record.status.as_str().to_string(),
                                                   version: new_version,
                                                   payload: record.payload.clone(),
                                                   checksum: record.checksum.clone(),
                                                   client_id: record.client_id.clone(),
                                                   updated_at_ts: now };
                         diesel::insert_into(ck::checkpoints).values(&row).execute(conn)?;
                       } else {
                         diesel::update(ck::checkpoints.filter(ck::flow_id.eq(&id_s)).filter(ck::version.eq(current)))
                           .set((ck::status.eq(record.status.as_str()),
                                 ck::version.eq(new_version),
                                 ck::payload.eq(record.payload.as_slice()),
                                 ck::checksum.eq(&record.checksum),
                                 ck::client_id.eq(record.client_id.as_deref()),
                                 ck::updated_at_ts.eq(now)))
                           .execute(conn)?;
                       }
                       Ok(PersistResult::Ok { new_version })
                     });
    let result = map_db_err(result)?;
    if result == PersistResult::Conflict {
      log::debug!("checkpoint de {}: conflicto de versión (esperada {})", flow_id, expected_version);
    }
    Ok(result)
  }
  fn get(&self, flow_id: &FlowId) -> flow::Result<Option<StoredCheckpoint>> {
    let mut conn = self.conn()?;
    let row = map_db_err(ck::checkpoints.filter(ck::flow_id.eq(flow_id.to_string()))
                                        .select(CheckpointRow::as_select())
                                        .first::<CheckpointRow>(&mut conn)
                                        .optional())?;
    row.map(CheckpointRow::into_stored).transpose()
  }
  fn delete(&self, flow_id: &FlowId) -> flow::Result<()> {
    let mut conn = self.conn()?;
    map_db_err(diesel::delete(ck::checkpoints.filter(ck::flow_id.eq(flow_id.to_string()))).execute(&mut conn))?;
    Ok(())
  }
  fn list_non_terminal(&self) -> flow::Result<Vec<FlowId>> {
    let mut conn = self.conn()?;
    let terminal = [FlowStatus::Completed.as_str(), FlowStatus::Failed.as_str()];
    let ids = map_db_err(ck::checkpoints.filter(ck::status.ne_all(terminal))
                                        .select(ck::flow_id)
                                        .order(ck::flow_id.asc())
                                        .load::<String>(&mut conn))?;
    let mut out = ids.iter().map(|s| parse_flow_id(s)).collect::<flow::Result<Vec<_>>>()?;
    out.sort();
    Ok(out)
  }
  fn list_flows(&self) -> flow::Result<Vec<(FlowId, FlowStatus)>> {
    let mut conn = self.conn()?;
    let rows = map_db_err(ck::checkpoints.select((ck::flow_id, ck::status))
                                         .load::<(String, String)>(&mut conn))?;
    let mut out = Vec::with_capacity(rows.len());
    for (id, status) in rows {
      out.push((parse_flow_id(&id)?, parse_status(&status)?));
    }
    out.sort_by_key(|(id, _)| *id);
    Ok(out)
  }
}
/// Crea el store desde las variables de entorno. Usa `FLOW_DB_URL` y, si no
/// está, `DATABASE_URL`.
pub fn new_from_env() -> flow::Result<DieselCheckpointStore> {
  dotenvy::dotenv().ok();
  let url = std::env::var("FLOW_DB_URL").or_else(|_| std::env::var("DATABASE_URL"))
                                        .map_err(|_| FlowError::Other("FLOW_DB_URL / DATABASE_URL no definido".into()))?;
  let lower = url.to_lowercase();
  if lower.starts_with("postgres") || lower.starts_with("mysql") {
    return Err(FlowError::Other(format!("flow-persistence sólo soporta SQLite; `{}` no es una ruta SQLite", url)));
  }
  DieselCheckpointStore::new(&url)
}
