#![allow(dead_code)]

use closure_index::closure::{self, ForestNode};
use sea_orm::entity::prelude::*;
use sea_orm::{ConnectOptions, Database, DatabaseConnection, DbBackend, QueryOrder, Statement};

pub mod entity {
    pub mod node {
        use closure_index::ClosureIndexModelDerive as ClosureIndexModel;
        use sea_orm::entity::prelude::*;

        #[derive(Clone, Debug, PartialEq, DeriveEntityModel, ClosureIndexModel)]
        #[sea_orm(table_name = "nodes")]
        #[closure_index(hierarchy_module = "crate::common::entity::node_closure")]
        pub struct Model {
            #[sea_orm(primary_key)]
            pub id: i32,
            pub parent_id: Option<i32>,
            pub name: String,
            pub is_deleted: bool,
        }

        #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
        pub enum Relation {}

        impl ActiveModelBehavior for ActiveModel {}
    }

    pub mod node_closure {
        use sea_orm::entity::prelude::*;

        #[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
        #[sea_orm(table_name = "node_closure")]
        pub struct Model {
            #[sea_orm(primary_key, auto_increment = false)]
            pub ancestor_id: i32,
            #[sea_orm(primary_key, auto_increment = false)]
            pub descendant_id: i32,
            pub depth: i32,
        }

        #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
        pub enum Relation {}

        impl ActiveModelBehavior for ActiveModel {}
    }
}

pub use entity::{node, node_closure};

pub async fn sqlite() -> Result<DatabaseConnection, DbErr> {
    // one pooled connection, otherwise each connection opens its own empty memory db
    let mut options = ConnectOptions::new("sqlite::memory:");
    options
        .max_connections(1)
        .min_connections(1)
        .sqlx_logging(false);
    let db = Database::connect(options).await?;

    db.execute(Statement::from_string(
        DbBackend::Sqlite,
        r#"
        CREATE TABLE nodes (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            parent_id INTEGER REFERENCES nodes(id),
            name TEXT NOT NULL,
            is_deleted BOOLEAN NOT NULL DEFAULT FALSE
        );
        "#,
    ))
    .await?;

    db.execute(Statement::from_string(
        DbBackend::Sqlite,
        r#"
        CREATE TABLE node_closure (
            ancestor_id INTEGER NOT NULL REFERENCES nodes(id),
            descendant_id INTEGER NOT NULL REFERENCES nodes(id),
            depth INTEGER NOT NULL,
            PRIMARY KEY (ancestor_id, descendant_id)
        );
        "#,
    ))
    .await?;

    Ok(db)
}

/// Closure rows as sorted `(ancestor, descendant, depth)` triples.
pub async fn edges(db: &DatabaseConnection) -> Result<Vec<(i32, i32, i32)>, DbErr> {
    let mut rows: Vec<_> = node_closure::Entity::find()
        .all(db)
        .await?
        .into_iter()
        .map(|row| (row.ancestor_id, row.descendant_id, row.depth))
        .collect();
    rows.sort();
    Ok(rows)
}

/// Closure the parent references imply, deleted links severed.
pub async fn expected_edges(db: &DatabaseConnection) -> Result<Vec<(i32, i32, i32)>, DbErr> {
    let nodes: Vec<_> = node::Entity::find()
        .order_by_asc(node::Column::Id)
        .all(db)
        .await?
        .into_iter()
        .map(|model| ForestNode {
            id: model.id,
            parent: model.parent_id,
            deleted: model.is_deleted,
        })
        .collect();
    let mut rows: Vec<_> = closure::compute(&nodes)
        .expect("forest has no parent cycles")
        .into_iter()
        .map(|edge| (edge.ancestor, edge.descendant, edge.depth))
        .collect();
    rows.sort();
    Ok(rows)
}

pub async fn parents(db: &DatabaseConnection) -> Result<Vec<(i32, Option<i32>)>, DbErr> {
    Ok(node::Entity::find()
        .order_by_asc(node::Column::Id)
        .all(db)
        .await?
        .into_iter()
        .map(|model| (model.id, model.parent_id))
        .collect())
}

pub fn names(nodes: &[node::Model]) -> Vec<&str> {
    nodes.iter().map(|node| node.name.as_str()).collect()
}
