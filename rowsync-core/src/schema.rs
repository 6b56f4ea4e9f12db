use std::collections::{BTreeMap, HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::errors::SyncError;
use crate::models::{Payload, SyncFields};
use crate::SyncResult;

/// Columns the engine manages on every mirrored entity. Writes that touch
/// only these are classified as non-meaningful and never captured.
pub const SYSTEM_COLUMNS: &[&str] = &["id", "updated_at", "version", "deleted_at"];

pub fn is_system_column(name: &str) -> bool {
    SYSTEM_COLUMNS.contains(&name)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Text,
    Integer,
    Real,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub ty: ColumnType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FkEdge {
    pub column: String,
    pub target: String,
}

/// One mirrored entity: its data columns and FK edges to other mirrored
/// entities. System columns are implicit and never declared here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityDef {
    pub name: String,
    pub columns: Vec<ColumnDef>,
    #[serde(default)]
    pub fk_edges: Vec<FkEdge>,
}

impl EntityDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            fk_edges: Vec::new(),
        }
    }

    pub fn column(mut self, name: impl Into<String>, ty: ColumnType) -> Self {
        self.columns.push(ColumnDef {
            name: name.into(),
            ty,
        });
        self
    }

    /// Declares an FK column; FK columns hold the target row's id.
    pub fn fk(mut self, column: impl Into<String>, target: impl Into<String>) -> Self {
        let column = column.into();
        self.columns.push(ColumnDef {
            name: column.clone(),
            ty: ColumnType::Integer,
        });
        self.fk_edges.push(FkEdge {
            column,
            target: target.into(),
        });
        self
    }

    pub fn data_column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }
}

/// The mixin contract: a mirrored entity embeds [`SyncFields`] and knows
/// how to describe itself to the schema and convert its data columns to
/// and from a payload map.
pub trait Mirrored {
    fn table() -> &'static str
    where
        Self: Sized;

    fn entity_def() -> EntityDef
    where
        Self: Sized;

    fn sync(&self) -> &SyncFields;

    fn sync_mut(&mut self) -> &mut SyncFields;

    /// Data columns only; system columns come from [`SyncFields`].
    fn data(&self) -> Payload;

    fn from_row(sync: SyncFields, data: &Payload) -> SyncResult<Self>
    where
        Self: Sized;
}

/// Registered entities plus the topological apply order (FK parents before
/// children) the sync engine uses when applying pulled batches.
#[derive(Debug, Clone)]
pub struct Schema {
    entities: BTreeMap<String, EntityDef>,
    apply_order: Vec<String>,
    order_index: HashMap<String, usize>,
}

impl Schema {
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder {
            entities: Vec::new(),
        }
    }

    pub fn build(entities: Vec<EntityDef>) -> SyncResult<Self> {
        let mut by_name = BTreeMap::new();
        for def in &entities {
            for col in &def.columns {
                if is_system_column(&col.name) {
                    return Err(SyncError::InvalidEntity(format!(
                        "{}.{} shadows a system column",
                        def.name, col.name
                    )));
                }
            }
            for fk in &def.fk_edges {
                if def.data_column(&fk.column).is_none() {
                    return Err(SyncError::InvalidEntity(format!(
                        "{} declares FK on undeclared column {}",
                        def.name, fk.column
                    )));
                }
            }
            if by_name.insert(def.name.clone(), def.clone()).is_some() {
                return Err(SyncError::InvalidEntity(format!(
                    "duplicate entity {}",
                    def.name
                )));
            }
        }
        for def in &entities {
            for fk in &def.fk_edges {
                if !by_name.contains_key(&fk.target) {
                    return Err(SyncError::UnknownEntity(fk.target.clone()));
                }
            }
        }

        let apply_order = topo_sort(&entities)?;
        let order_index = apply_order
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect();

        Ok(Self {
            entities: by_name,
            apply_order,
            order_index,
        })
    }

    pub fn entity(&self, name: &str) -> Option<&EntityDef> {
        self.entities.get(name)
    }

    /// Entities in apply order (parents first).
    pub fn entities(&self) -> impl Iterator<Item = &EntityDef> {
        self.apply_order
            .iter()
            .filter_map(|name| self.entities.get(name))
    }

    pub fn apply_order(&self) -> &[String] {
        &self.apply_order
    }

    pub fn order_index(&self, table: &str) -> Option<usize> {
        self.order_index.get(table).copied()
    }
}

pub struct SchemaBuilder {
    entities: Vec<EntityDef>,
}

impl SchemaBuilder {
    pub fn entity<E: Mirrored>(mut self) -> Self {
        self.entities.push(E::entity_def());
        self
    }

    pub fn entity_def(mut self, def: EntityDef) -> Self {
        self.entities.push(def);
        self
    }

    pub fn build(self) -> SyncResult<Schema> {
        Schema::build(self.entities)
    }
}

/// Kahn's algorithm over the FK graph, parents first. Ties break by
/// registration order so the result is deterministic.
fn topo_sort(entities: &[EntityDef]) -> SyncResult<Vec<String>> {
    let position: HashMap<&str, usize> = entities
        .iter()
        .enumerate()
        .map(|(i, e)| (e.name.as_str(), i))
        .collect();

    let mut in_degree = vec![0usize; entities.len()];
    let mut children: Vec<Vec<usize>> = vec![Vec::new(); entities.len()];
    for (idx, def) in entities.iter().enumerate() {
        for fk in &def.fk_edges {
            let parent = position[fk.target.as_str()];
            in_degree[idx] += 1;
            children[parent].push(idx);
        }
    }

    let mut queue: VecDeque<usize> = (0..entities.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(entities.len());
    while let Some(idx) = queue.pop_front() {
        order.push(entities[idx].name.clone());
        for &child in &children[idx] {
            in_degree[child] -= 1;
            if in_degree[child] == 0 {
                queue.push_back(child);
            }
        }
    }

    if order.len() != entities.len() {
        let stuck: Vec<&str> = entities
            .iter()
            .enumerate()
            .filter(|(i, _)| in_degree[*i] > 0)
            .map(|(_, e)| e.name.as_str())
            .collect();
        return Err(SyncError::SchemaCycle(stuck.join(", ")));
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn customers() -> EntityDef {
        EntityDef::new("customers").column("name", ColumnType::Text)
    }

    fn orders() -> EntityDef {
        EntityDef::new("orders")
            .column("amount", ColumnType::Real)
            .fk("customer_id", "customers")
    }

    #[test]
    fn parents_come_before_children() {
        // registration order deliberately child-first
        let schema = Schema::build(vec![orders(), customers()]).unwrap();
        assert_eq!(schema.apply_order(), &["customers", "orders"]);
        assert!(schema.order_index("customers") < schema.order_index("orders"));
    }

    #[test]
    fn cycles_are_rejected_by_name() {
        let a = EntityDef::new("a").fk("b_id", "b");
        let b = EntityDef::new("b").fk("a_id", "a");
        match Schema::build(vec![a, b]) {
            Err(SyncError::SchemaCycle(names)) => {
                assert!(names.contains('a') && names.contains('b'));
            }
            other => panic!("expected SchemaCycle, got {other:?}"),
        }
    }

    #[test]
    fn self_reference_is_a_cycle() {
        let e = EntityDef::new("folders").fk("parent_id", "folders");
        assert!(matches!(
            Schema::build(vec![e]),
            Err(SyncError::SchemaCycle(_))
        ));
    }

    #[test]
    fn unknown_fk_target_is_rejected() {
        assert!(matches!(
            Schema::build(vec![orders()]),
            Err(SyncError::UnknownEntity(t)) if t == "customers"
        ));
    }

    #[test]
    fn system_column_shadowing_is_rejected() {
        let e = EntityDef::new("customers").column("version", ColumnType::Integer);
        assert!(matches!(
            Schema::build(vec![e]),
            Err(SyncError::InvalidEntity(_))
        ));
    }

    #[test]
    fn diamond_dependencies_order_deterministically() {
        let root = EntityDef::new("accounts").column("name", ColumnType::Text);
        let left = EntityDef::new("projects")
            .column("title", ColumnType::Text)
            .fk("account_id", "accounts");
        let right = EntityDef::new("contacts")
            .column("email", ColumnType::Text)
            .fk("account_id", "accounts");
        let leaf = EntityDef::new("tasks")
            .column("body", ColumnType::Text)
            .fk("project_id", "projects")
            .fk("contact_id", "contacts");

        let schema = Schema::build(vec![leaf, right, left, root]).unwrap();
        assert_eq!(
            schema.apply_order(),
            &["accounts", "contacts", "projects", "tasks"]
        );
    }
}
