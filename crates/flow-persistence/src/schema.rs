// Esquema Diesel de la tabla de checkpoints (SQLite).
diesel::table! {
    checkpoints (flow_id) {
        flow_id -> Text,
        status -> Text,
        version -> BigInt,
        payload -> Binary,
        checksum -> Text,
        client_id -> Nullable<Text>,
        updated_at_ts -> BigInt,
    }
}
