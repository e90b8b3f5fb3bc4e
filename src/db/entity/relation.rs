use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use tracing::{info, instrument};

use crate::db::core::Database;
use crate::entity::{EntityType, NodeType, Relationship};
use crate::TARGET_DB;

fn relationship_from_row(row: &SqliteRow) -> Result<Relationship, sqlx::Error> {
    let parse_node = |column: &str| -> Result<NodeType, sqlx::Error> {
        let raw: String = row.try_get(column)?;
        raw.parse::<NodeType>().map_err(|e| sqlx::Error::ColumnDecode {
            index: column.to_string(),
            source: e.into(),
        })
    };

    Ok(Relationship {
        id: row.try_get("id")?,
        source_type: parse_node("source_type")?,
        source_id: row.try_get("source_id")?,
        target_type: parse_node("target_type")?,
        target_id: row.try_get("target_id")?,
        relationship_type: row.try_get("relationship_type")?,
        confidence: row.try_get("confidence")?,
        metadata: row.try_get("metadata")?,
    })
}

/// Relationships where the entity is the target, ordered by row id
pub async fn fetch_relationships_targeting(
    conn: &mut SqliteConnection,
    entity_type: EntityType,
    id: i64,
) -> Result<Vec<Relationship>, sqlx::Error> {
    let rows = sqlx::query(
        r#"
        SELECT * FROM relationships
        WHERE target_type = ?1 AND target_id = ?2
        ORDER BY id
        "#,
    )
    .bind(entity_type.as_str())
    .bind(id)
    .fetch_all(&mut *conn)
    .await?;
    rows.iter().map(relationship_from_row).collect()
}

/// Relationships where the entity is the source, ordered by row id
pub async fn fetch_relationships_from(
    conn: &mut SqliteConnection,
    entity_type: EntityType,
    id: i64,
) -> Result<Vec<Relationship>, sqlx::Error> {
    let rows = sqlx::query(
        r#"
        SELECT * FROM relationships
        WHERE source_type = ?1 AND source_id = ?2
        ORDER BY id
        "#,
    )
    .bind(entity_type.as_str())
    .bind(id)
    .fetch_all(&mut *conn)
    .await?;
    rows.iter().map(relationship_from_row).collect()
}

/// Whether a relationship with exactly this identity tuple exists
pub async fn relationship_exists(
    conn: &mut SqliteConnection,
    source_type: NodeType,
    source_id: i64,
    target_type: NodeType,
    target_id: i64,
    relationship_type: &str,
) -> Result<bool, sqlx::Error> {
    let count: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM relationships
        WHERE source_type = ?1 AND source_id = ?2
          AND target_type = ?3 AND target_id = ?4
          AND relationship_type = ?5
        "#,
    )
    .bind(source_type.as_str())
    .bind(source_id)
    .bind(target_type.as_str())
    .bind(target_id)
    .bind(relationship_type)
    .fetch_one(&mut *conn)
    .await?;
    Ok(count > 0)
}

pub async fn update_relationship_target(
    conn: &mut SqliteConnection,
    relationship_id: i64,
    target_id: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE relationships SET target_id = ?1 WHERE id = ?2")
        .bind(target_id)
        .bind(relationship_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn update_relationship_source(
    conn: &mut SqliteConnection,
    relationship_id: i64,
    source_id: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE relationships SET source_id = ?1 WHERE id = ?2")
        .bind(source_id)
        .bind(relationship_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn delete_relationship(
    conn: &mut SqliteConnection,
    relationship_id: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM relationships WHERE id = ?1")
        .bind(relationship_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

impl Database {
    /// Link two nodes. Re-adding an existing edge keeps the original row.
    #[instrument(target = "db", level = "debug", skip(self, metadata))]
    pub async fn add_relationship(
        &self,
        source_type: NodeType,
        source_id: i64,
        target_type: NodeType,
        target_id: i64,
        relationship_type: &str,
        confidence: f64,
        metadata: Option<&str>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO relationships
                (source_type, source_id, target_type, target_id, relationship_type, confidence, metadata)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(source_type, source_id, target_type, target_id, relationship_type) DO NOTHING
            "#,
        )
        .bind(source_type.as_str())
        .bind(source_id)
        .bind(target_type.as_str())
        .bind(target_id)
        .bind(relationship_type)
        .bind(confidence.clamp(0.0, 1.0))
        .bind(metadata)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    /// Every relationship touching an entity, from either end
    pub async fn get_relationships_of(
        &self,
        entity_type: EntityType,
        id: i64,
    ) -> Result<Vec<Relationship>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM relationships
            WHERE (source_type = ?1 AND source_id = ?2)
               OR (target_type = ?1 AND target_id = ?2)
            ORDER BY id
            "#,
        )
        .bind(entity_type.as_str())
        .bind(id)
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(relationship_from_row).collect()
    }

    /// Titles of documents linked to an entity in either direction
    pub async fn get_related_document_titles(
        &self,
        entity_type: EntityType,
        id: i64,
        limit: usize,
    ) -> Result<Vec<String>, sqlx::Error> {
        sqlx::query_scalar(
            r#"
            SELECT DISTINCT d.title
            FROM relationships r
            JOIN documents d
              ON (r.source_type = 'document' AND r.source_id = d.id
                  AND r.target_type = ?1 AND r.target_id = ?2)
              OR (r.target_type = 'document' AND r.target_id = d.id
                  AND r.source_type = ?1 AND r.source_id = ?2)
            ORDER BY d.id
            LIMIT ?3
            "#,
        )
        .bind(entity_type.as_str())
        .bind(id)
        .bind(limit as i64)
        .fetch_all(self.pool())
        .await
    }

    pub async fn add_document(&self, title: &str) -> Result<i64, sqlx::Error> {
        let row = sqlx::query("INSERT INTO documents (title) VALUES (?1) RETURNING id")
            .bind(title)
            .fetch_one(self.pool())
            .await?;
        let id: i64 = row.get("id");
        info!(target: TARGET_DB, "Added document {} ({})", id, title);
        Ok(id)
    }

    pub async fn count_relationships_total(&self) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar("SELECT COUNT(*) FROM relationships")
            .fetch_one(self.pool())
            .await
    }

    /// Number of relationship rows sharing an identity tuple with another row.
    /// Always zero while the unique constraint holds.
    pub async fn count_duplicate_relationships(&self) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(n - 1), 0) FROM (
                SELECT COUNT(*) AS n FROM relationships
                GROUP BY source_type, source_id, target_type, target_id, relationship_type
            )
            "#,
        )
        .fetch_one(self.pool())
        .await
    }
}
