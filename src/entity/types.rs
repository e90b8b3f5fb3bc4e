use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Entity type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Topic,
    Person,
    Project,
    Institution,
    Method,
    Application,
}

impl EntityType {
    pub const ALL: [EntityType; 6] = [
        EntityType::Topic,
        EntityType::Person,
        EntityType::Project,
        EntityType::Institution,
        EntityType::Method,
        EntityType::Application,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Topic => "topic",
            EntityType::Person => "person",
            EntityType::Project => "project",
            EntityType::Institution => "institution",
            EntityType::Method => "method",
            EntityType::Application => "application",
        }
    }

    /// Backing table in the entity store
    pub fn table(&self) -> &'static str {
        match self {
            EntityType::Topic => "topics",
            EntityType::Person => "persons",
            EntityType::Project => "projects",
            EntityType::Institution => "institutions",
            EntityType::Method => "methods",
            EntityType::Application => "applications",
        }
    }

    /// Optional attribute columns carried by this type
    pub fn attributes(&self) -> &'static [AttributeField] {
        use AttributeField::*;
        match self {
            EntityType::Topic => &[Category, Description],
            EntityType::Person => &[Role, Affiliation],
            EntityType::Project => &[Description, Domain],
            EntityType::Institution => &[Type, Location],
            EntityType::Method => &[Category, Description],
            EntityType::Application => &[Description, Domain],
        }
    }

    /// Minimum fuzzy name similarity for a lexical candidate pair
    pub fn lexical_threshold(&self) -> f64 {
        match self {
            EntityType::Person | EntityType::Institution => 0.90,
            EntityType::Topic | EntityType::Method => 0.85,
            EntityType::Project | EntityType::Application => 0.80,
        }
    }

    pub fn has_attribute(&self, field: AttributeField) -> bool {
        self.attributes().contains(&field)
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "topic" | "topics" => Ok(EntityType::Topic),
            "person" | "persons" | "people" => Ok(EntityType::Person),
            "project" | "projects" => Ok(EntityType::Project),
            "institution" | "institutions" => Ok(EntityType::Institution),
            "method" | "methods" => Ok(EntityType::Method),
            "application" | "applications" => Ok(EntityType::Application),
            other => Err(format!(
                "unknown entity type '{}'; expected one of topic, person, project, institution, method, application",
                other
            )),
        }
    }
}

/// Optional attribute fields an entity type may carry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttributeField {
    Description,
    Category,
    Role,
    Affiliation,
    Domain,
    Type,
    Location,
}

impl AttributeField {
    /// Reconciliation order used by the merge engine
    pub const ALL: [AttributeField; 7] = [
        AttributeField::Description,
        AttributeField::Category,
        AttributeField::Role,
        AttributeField::Affiliation,
        AttributeField::Domain,
        AttributeField::Type,
        AttributeField::Location,
    ];

    pub fn column(&self) -> &'static str {
        match self {
            AttributeField::Description => "description",
            AttributeField::Category => "category",
            AttributeField::Role => "role",
            AttributeField::Affiliation => "affiliation",
            AttributeField::Domain => "domain",
            AttributeField::Type => "type",
            AttributeField::Location => "location",
        }
    }
}

impl fmt::Display for AttributeField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.column())
    }
}

/// A typed, named record in the knowledge graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: i64,
    pub entity_type: EntityType,
    pub name: String,
    // Only non-empty values are kept
    #[serde(default)]
    pub attributes: BTreeMap<AttributeField, String>,
}

impl Entity {
    pub fn new(id: i64, entity_type: EntityType, name: &str) -> Self {
        Entity {
            id,
            entity_type,
            name: name.to_string(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, field: AttributeField, value: &str) -> Self {
        if !value.trim().is_empty() {
            self.attributes.insert(field, value.to_string());
        }
        self
    }

    pub fn attribute(&self, field: AttributeField) -> Option<&str> {
        self.attributes
            .get(&field)
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
    }
}

/// Either end of a relationship
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum NodeType {
    Document,
    Entity(EntityType),
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Document => "document",
            NodeType::Entity(entity_type) => entity_type.as_str(),
        }
    }
}

impl From<EntityType> for NodeType {
    fn from(entity_type: EntityType) -> Self {
        NodeType::Entity(entity_type)
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "document" | "documents" => Ok(NodeType::Document),
            other => other.parse::<EntityType>().map(NodeType::Entity),
        }
    }
}

/// A directed, typed edge between two nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    // Store row id, used to address the row during merges
    pub id: i64,
    pub source_type: NodeType,
    pub source_id: i64,
    pub target_type: NodeType,
    pub target_id: i64,
    pub relationship_type: String,
    pub confidence: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<String>,
}

impl fmt::Display for Relationship {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({} {}:{} -> {}:{})",
            self.relationship_type,
            self.source_type,
            self.source_id,
            self.target_type,
            self.target_id
        )
    }
}

/// The stored embedding of one entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingVector {
    pub entity_type: EntityType,
    pub entity_id: i64,
    pub vector: Vec<f32>,
    pub model_name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_type_parsing() {
        assert_eq!("topics".parse::<EntityType>(), Ok(EntityType::Topic));
        assert_eq!("People".parse::<EntityType>(), Ok(EntityType::Person));
        assert_eq!(" method ".parse::<EntityType>(), Ok(EntityType::Method));
        assert!("organization".parse::<EntityType>().is_err());

        for entity_type in EntityType::ALL {
            assert_eq!(entity_type.as_str().parse::<EntityType>(), Ok(entity_type));
            assert_eq!(entity_type.table().parse::<EntityType>(), Ok(entity_type));
        }
    }

    #[test]
    fn test_lexical_thresholds() {
        assert_eq!(EntityType::Person.lexical_threshold(), 0.90);
        assert_eq!(EntityType::Institution.lexical_threshold(), 0.90);
        assert_eq!(EntityType::Topic.lexical_threshold(), 0.85);
        assert_eq!(EntityType::Method.lexical_threshold(), 0.85);
        assert_eq!(EntityType::Project.lexical_threshold(), 0.80);
        assert_eq!(EntityType::Application.lexical_threshold(), 0.80);
    }

    #[test]
    fn test_attribute_schema() {
        assert!(EntityType::Person.has_attribute(AttributeField::Role));
        assert!(!EntityType::Person.has_attribute(AttributeField::Description));
        assert!(EntityType::Institution.has_attribute(AttributeField::Type));
        assert_eq!(AttributeField::Type.column(), "type");
    }

    #[test]
    fn test_blank_attributes_are_dropped() {
        let entity = Entity::new(1, EntityType::Topic, "Optimal Transport")
            .with_attribute(AttributeField::Description, "   ")
            .with_attribute(AttributeField::Category, "mathematics");
        assert_eq!(entity.attribute(AttributeField::Description), None);
        assert_eq!(entity.attribute(AttributeField::Category), Some("mathematics"));
    }

    #[test]
    fn test_node_type_parsing() {
        assert_eq!("document".parse::<NodeType>(), Ok(NodeType::Document));
        assert_eq!(
            "institution".parse::<NodeType>(),
            Ok(NodeType::Entity(EntityType::Institution))
        );
    }
}
