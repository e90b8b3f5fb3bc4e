use sqlx::{Row, SqliteConnection};
use tracing::{instrument, warn};

use crate::db::core::Database;
use crate::entity::{EmbeddingVector, EntityType};
use crate::TARGET_DB;

fn decode_vector(raw: &str) -> Result<Vec<f32>, sqlx::Error> {
    serde_json::from_str(raw)
        .map_err(|e| sqlx::Error::Protocol(format!("Invalid embedding JSON: {}", e)))
}

/// Remove an entity's embedding; returns whether one existed
pub async fn delete_embedding_row(
    conn: &mut SqliteConnection,
    entity_type: EntityType,
    entity_id: i64,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM embeddings WHERE entity_type = ?1 AND entity_id = ?2")
        .bind(entity_type.as_str())
        .bind(entity_id)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() > 0)
}

impl Database {
    /// Store or replace the current embedding of an entity
    #[instrument(target = "db", level = "debug", skip(self, vector))]
    pub async fn upsert_embedding(
        &self,
        entity_type: EntityType,
        entity_id: i64,
        vector: &[f32],
        model_name: &str,
    ) -> Result<(), sqlx::Error> {
        let encoded = serde_json::to_string(vector)
            .map_err(|e| sqlx::Error::Protocol(format!("JSON serialization error: {}", e)))?;

        sqlx::query(
            r#"
            INSERT INTO embeddings (entity_type, entity_id, vector, model_name)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(entity_type, entity_id) DO UPDATE SET
                vector = excluded.vector,
                model_name = excluded.model_name
            "#,
        )
        .bind(entity_type.as_str())
        .bind(entity_id)
        .bind(encoded)
        .bind(model_name)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    pub async fn get_embedding(
        &self,
        entity_type: EntityType,
        entity_id: i64,
    ) -> Result<Option<EmbeddingVector>, sqlx::Error> {
        let row = sqlx::query(
            "SELECT vector, model_name FROM embeddings WHERE entity_type = ?1 AND entity_id = ?2",
        )
        .bind(entity_type.as_str())
        .bind(entity_id)
        .fetch_optional(self.pool())
        .await?;

        match row {
            Some(row) => {
                let raw: String = row.try_get("vector")?;
                Ok(Some(EmbeddingVector {
                    entity_type,
                    entity_id,
                    vector: decode_vector(&raw)?,
                    model_name: row.try_get("model_name")?,
                }))
            }
            None => Ok(None),
        }
    }

    /// Current embeddings of every entity of a type that still exists.
    ///
    /// Rows that fail to decode are skipped with a warning; the entity then
    /// simply takes no part in the vector pass.
    pub async fn get_embeddings_for_type(
        &self,
        entity_type: EntityType,
    ) -> Result<Vec<EmbeddingVector>, sqlx::Error> {
        let query = format!(
            r#"
            SELECT e.entity_id, e.vector, e.model_name
            FROM embeddings e
            JOIN {} t ON t.id = e.entity_id
            WHERE e.entity_type = ?1
            ORDER BY e.entity_id
            "#,
            entity_type.table()
        );
        let rows = sqlx::query(&query)
            .bind(entity_type.as_str())
            .fetch_all(self.pool())
            .await?;

        let mut embeddings = Vec::with_capacity(rows.len());
        for row in rows {
            let entity_id: i64 = row.try_get("entity_id")?;
            let raw: String = row.try_get("vector")?;
            match decode_vector(&raw) {
                Ok(vector) => embeddings.push(EmbeddingVector {
                    entity_type,
                    entity_id,
                    vector,
                    model_name: row.try_get("model_name")?,
                }),
                Err(e) => {
                    warn!(target: TARGET_DB, "Skipping embedding of {} {}: {}", entity_type, entity_id, e);
                }
            }
        }
        Ok(embeddings)
    }

    pub async fn delete_embedding(
        &self,
        entity_type: EntityType,
        entity_id: i64,
    ) -> Result<bool, sqlx::Error> {
        let mut conn = self.pool().acquire().await?;
        delete_embedding_row(&mut conn, entity_type, entity_id).await
    }
}
