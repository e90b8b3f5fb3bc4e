use tracing::info;

use super::core::Database;
use crate::entity::EntityType;
use crate::TARGET_DB;

/// DDL for one entity table, derived from the type's attribute schema
fn entity_table_ddl(entity_type: EntityType) -> String {
    let columns: String = entity_type
        .attributes()
        .iter()
        .map(|field| format!(",\n                {} TEXT", field.column()))
        .collect();

    format!(
        r#"
            CREATE TABLE IF NOT EXISTS {table} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL{columns}
            );
            CREATE INDEX IF NOT EXISTS idx_{table}_name ON {table} (name);
            "#,
        table = entity_type.table(),
        columns = columns,
    )
}

impl Database {
    pub(crate) async fn initialize_schema(&self) -> Result<(), sqlx::Error> {
        let mut conn = self.pool().acquire().await?;

        for entity_type in EntityType::ALL {
            sqlx::raw_sql(&entity_table_ddl(entity_type))
                .execute(&mut *conn)
                .await?;
        }

        sqlx::raw_sql(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                title TEXT NOT NULL
            );

            -- Typed edges between documents and entities
            CREATE TABLE IF NOT EXISTS relationships (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                source_type TEXT NOT NULL,
                source_id INTEGER NOT NULL,
                target_type TEXT NOT NULL,
                target_id INTEGER NOT NULL,
                relationship_type TEXT NOT NULL,
                confidence REAL NOT NULL DEFAULT 1.0,
                metadata TEXT,
                UNIQUE(source_type, source_id, target_type, target_id, relationship_type)
            );
            CREATE INDEX IF NOT EXISTS idx_relationships_source ON relationships (source_type, source_id);
            CREATE INDEX IF NOT EXISTS idx_relationships_target ON relationships (target_type, target_id);

            -- At most one current vector per entity
            CREATE TABLE IF NOT EXISTS embeddings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                entity_type TEXT NOT NULL,
                entity_id INTEGER NOT NULL,
                vector TEXT NOT NULL,
                model_name TEXT NOT NULL,
                UNIQUE(entity_type, entity_id)
            );
            "#,
        )
        .execute(&mut *conn)
        .await?;

        info!(target: TARGET_DB, "Database schema initialized");
        Ok(())
    }
}
