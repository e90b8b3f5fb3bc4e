use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use std::collections::BTreeMap;
use tracing::{debug, instrument};

use crate::db::core::Database;
use crate::entity::{AttributeField, Entity, EntityType};
use crate::TARGET_DB;

fn select_columns(entity_type: EntityType) -> String {
    let mut columns = vec!["id", "name"];
    columns.extend(entity_type.attributes().iter().map(|f| f.column()));
    columns.join(", ")
}

fn entity_from_row(entity_type: EntityType, row: &SqliteRow) -> Result<Entity, sqlx::Error> {
    let mut entity = Entity::new(row.try_get("id")?, entity_type, "");
    entity.name = row.try_get("name")?;
    for field in entity_type.attributes() {
        let value: Option<String> = row.try_get(field.column())?;
        if let Some(value) = value.filter(|v| !v.trim().is_empty()) {
            entity.attributes.insert(*field, value);
        }
    }
    Ok(entity)
}

/// Load one entity on an existing connection or transaction
pub async fn fetch_entity(
    conn: &mut SqliteConnection,
    entity_type: EntityType,
    id: i64,
) -> Result<Option<Entity>, sqlx::Error> {
    let query = format!(
        "SELECT {} FROM {} WHERE id = ?1",
        select_columns(entity_type),
        entity_type.table()
    );
    let row = sqlx::query(&query).bind(id).fetch_optional(&mut *conn).await?;
    row.map(|row| entity_from_row(entity_type, &row)).transpose()
}

/// Delete an entity row; returns whether a row was removed
pub async fn delete_entity_row(
    conn: &mut SqliteConnection,
    entity_type: EntityType,
    id: i64,
) -> Result<bool, sqlx::Error> {
    let query = format!("DELETE FROM {} WHERE id = ?1", entity_type.table());
    let result = sqlx::query(&query).bind(id).execute(&mut *conn).await?;
    Ok(result.rows_affected() > 0)
}

/// Set a single attribute column on an entity
pub async fn update_entity_attribute(
    conn: &mut SqliteConnection,
    entity_type: EntityType,
    id: i64,
    field: AttributeField,
    value: &str,
) -> Result<(), sqlx::Error> {
    if !entity_type.has_attribute(field) {
        return Err(sqlx::Error::Protocol(format!(
            "{} has no attribute '{}'",
            entity_type, field
        )));
    }
    let query = format!(
        "UPDATE {} SET {} = ?1 WHERE id = ?2",
        entity_type.table(),
        field.column()
    );
    sqlx::query(&query)
        .bind(value)
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Count relationships touching an entity from either end
pub async fn count_relationships(
    conn: &mut SqliteConnection,
    entity_type: EntityType,
    id: i64,
) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM relationships
        WHERE (source_type = ?1 AND source_id = ?2)
           OR (target_type = ?1 AND target_id = ?2)
        "#,
    )
    .bind(entity_type.as_str())
    .bind(id)
    .fetch_one(&mut *conn)
    .await
}

impl Database {
    /// All entities of a type, ordered by id
    #[instrument(target = "db", level = "debug", skip(self))]
    pub async fn get_entities(&self, entity_type: EntityType) -> Result<Vec<Entity>, sqlx::Error> {
        let query = format!(
            "SELECT {} FROM {} ORDER BY id",
            select_columns(entity_type),
            entity_type.table()
        );
        let rows = sqlx::query(&query).fetch_all(self.pool()).await?;
        let entities = rows
            .iter()
            .map(|row| entity_from_row(entity_type, row))
            .collect::<Result<Vec<_>, _>>()?;

        debug!(target: TARGET_DB, "Loaded {} {} entities", entities.len(), entity_type);
        Ok(entities)
    }

    pub async fn get_entity(
        &self,
        entity_type: EntityType,
        id: i64,
    ) -> Result<Option<Entity>, sqlx::Error> {
        let mut conn = self.pool().acquire().await?;
        fetch_entity(&mut conn, entity_type, id).await
    }

    /// Add a new entity to the database or return the id of an entity with
    /// exactly the same name
    #[instrument(target = "db", level = "debug", skip(self, attributes))]
    pub async fn insert_or_get_entity(
        &self,
        entity_type: EntityType,
        name: &str,
        attributes: &BTreeMap<AttributeField, String>,
    ) -> Result<i64, sqlx::Error> {
        let table = entity_type.table();
        let existing: Option<i64> =
            sqlx::query_scalar(&format!("SELECT id FROM {} WHERE name = ?1 LIMIT 1", table))
                .bind(name)
                .fetch_optional(self.pool())
                .await?;
        if let Some(id) = existing {
            return Ok(id);
        }

        let fields: Vec<AttributeField> = entity_type
            .attributes()
            .iter()
            .copied()
            .filter(|f| attributes.get(f).is_some_and(|v| !v.trim().is_empty()))
            .collect();

        let mut columns = vec!["name".to_string()];
        columns.extend(fields.iter().map(|f| f.column().to_string()));
        let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{}", i)).collect();

        let query = format!(
            "INSERT INTO {} ({}) VALUES ({}) RETURNING id",
            table,
            columns.join(", "),
            placeholders.join(", ")
        );

        let mut insert = sqlx::query(&query).bind(name);
        for field in &fields {
            insert = insert.bind(attributes.get(field).cloned());
        }
        let row = insert.fetch_one(self.pool()).await?;

        Ok(row.get("id"))
    }

    pub async fn delete_entity(&self, entity_type: EntityType, id: i64) -> Result<bool, sqlx::Error> {
        let mut conn = self.pool().acquire().await?;
        delete_entity_row(&mut conn, entity_type, id).await
    }

    pub async fn count_entities(&self, entity_type: EntityType) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", entity_type.table()))
            .fetch_one(self.pool())
            .await
    }

    pub async fn relationship_count(
        &self,
        entity_type: EntityType,
        id: i64,
    ) -> Result<i64, sqlx::Error> {
        let mut conn = self.pool().acquire().await?;
        count_relationships(&mut conn, entity_type, id).await
    }
}
