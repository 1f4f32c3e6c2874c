use std::collections::{HashMap, HashSet};
use std::marker::PhantomData;

use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, DbBackend, EntityTrait,
    QueryFilter, QueryOrder,
};

use crate::closure::{self, ClosureEdge, ForestNode};
use crate::config::{ClosureIndexConfig, ReparentScope};
use crate::error::ClosureIndexError;
use crate::lock::ScopedTransaction;
use crate::traits::ClosureIndexModel;

// Keeps a batch well under SQLite's bound-parameter limit (3 per row).
const INSERT_BATCH: usize = 1000;
// Ids bound into one IN list. `delete_edges` binds two such lists.
const ID_BATCH: usize = 1000;

/// Repository exposing the closure-index mutations and queries for a given model.
///
/// Every call takes the connection explicitly; each mutation runs in its own
/// transaction and each query reads from one snapshot.
#[derive(Debug)]
pub struct ClosureIndexRepository<M>
where
    M: ClosureIndexModel,
{
    config: Option<ClosureIndexConfig>,
    _marker: PhantomData<M>,
}

impl<M> Default for ClosureIndexRepository<M>
where
    M: ClosureIndexModel,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<M> ClosureIndexRepository<M>
where
    M: ClosureIndexModel,
{
    pub fn new() -> Self {
        Self {
            config: None,
            _marker: PhantomData,
        }
    }

    /// Use `config` instead of the one derived on the model.
    pub fn with_config(config: ClosureIndexConfig) -> Self {
        Self {
            config: Some(config),
            _marker: PhantomData,
        }
    }

    pub fn config(&self) -> &ClosureIndexConfig {
        self.config
            .as_ref()
            .unwrap_or_else(|| M::closure_index_config())
    }

    fn ensure_supported(conn: &impl ConnectionTrait) -> Result<(), ClosureIndexError> {
        match conn.get_database_backend() {
            DbBackend::Postgres | DbBackend::Sqlite => Ok(()),
            _ => Err(ClosureIndexError::UnsupportedBackend),
        }
    }

    fn retry_after(
        &self,
        operation: &'static str,
        attempt: &mut u32,
        err: &ClosureIndexError,
    ) -> bool {
        if !err.is_retryable() || *attempt >= self.config().transient_retries() {
            return false;
        }
        *attempt += 1;
        tracing::warn!(
            operation,
            entity = self.config().entity_name(),
            attempt = *attempt,
            error = %err,
            "retrying mutation"
        );
        true
    }

    /// Insert a node and link it below every ancestor of `parent_id`.
    ///
    /// The parent, when given, must exist and not be deleted.
    pub async fn create_node(
        &self,
        conn: &DatabaseConnection,
        name: &str,
        is_deleted: bool,
        parent_id: Option<&M::Id>,
    ) -> Result<M, ClosureIndexError> {
        const OPERATION: &str = "create_node";
        Self::ensure_supported(conn)?;

        let mut attempt = 0;
        loop {
            let result = match ScopedTransaction::mutation(self.config(), conn).await {
                Ok(guard) => {
                    let result = self
                        .create_node_on(guard.connection(), name, is_deleted, parent_id)
                        .await;
                    guard.finish(result).await
                }
                Err(err) => Err(err),
            }
            .map_err(|err| err.in_operation(OPERATION));

            match result {
                Err(err) if self.retry_after(OPERATION, &mut attempt, &err) => continue,
                other => return other,
            }
        }
    }

    /// Mark a node deleted and sever its subtree from the ancestors above it.
    ///
    /// Calling this on an already deleted node is a no-op.
    pub async fn soft_delete(
        &self,
        conn: &DatabaseConnection,
        id: &M::Id,
    ) -> Result<(), ClosureIndexError> {
        const OPERATION: &str = "soft_delete";
        Self::ensure_supported(conn)?;

        let mut attempt = 0;
        loop {
            let result = match ScopedTransaction::mutation(self.config(), conn).await {
                Ok(guard) => {
                    let result = self.soft_delete_on(guard.connection(), id).await;
                    guard.finish(result).await
                }
                Err(err) => Err(err),
            }
            .map_err(|err| err.in_operation(OPERATION));

            match result {
                Err(err) if self.retry_after(OPERATION, &mut attempt, &err) => continue,
                other => return other,
            }
        }
    }

    /// Move `node_id` (and, under [`ReparentScope::Siblings`], every other
    /// child of its old parent) below `new_parent_id`.
    ///
    /// Fails with [`ClosureIndexError::CycleViolation`] before writing
    /// anything if a moved node would become its own ancestor.
    pub async fn reparent(
        &self,
        conn: &DatabaseConnection,
        node_id: &M::Id,
        new_parent_id: &M::Id,
    ) -> Result<(), ClosureIndexError> {
        const OPERATION: &str = "reparent";
        Self::ensure_supported(conn)?;

        let mut attempt = 0;
        loop {
            let result = match ScopedTransaction::mutation(self.config(), conn).await {
                Ok(guard) => {
                    let result = self
                        .reparent_on(guard.connection(), node_id, new_parent_id)
                        .await;
                    guard.finish(result).await
                }
                Err(err) => Err(err),
            }
            .map_err(|err| err.in_operation(OPERATION));

            match result {
                Err(err) if self.retry_after(OPERATION, &mut attempt, &err) => continue,
                other => return other,
            }
        }
    }

    /// Replace the whole closure table with the closure recomputed from the
    /// parent references. Returns the number of edges written.
    pub async fn rebuild(&self, conn: &DatabaseConnection) -> Result<usize, ClosureIndexError> {
        const OPERATION: &str = "rebuild";
        Self::ensure_supported(conn)?;

        let mut attempt = 0;
        loop {
            let result = match ScopedTransaction::mutation(self.config(), conn).await {
                Ok(guard) => {
                    let result = self.rebuild_on(guard.connection()).await;
                    guard.finish(result).await
                }
                Err(err) => Err(err),
            }
            .map_err(|err| err.in_operation(OPERATION));

            match result {
                Err(err) if self.retry_after(OPERATION, &mut attempt, &err) => continue,
                other => return other,
            }
        }
    }

    /// Live descendants of `id`, nearest first, ties by id.
    pub async fn descendants(
        &self,
        conn: &DatabaseConnection,
        id: &M::Id,
    ) -> Result<Vec<M>, ClosureIndexError> {
        const OPERATION: &str = "descendants";
        Self::ensure_supported(conn)?;
        let guard = ScopedTransaction::snapshot(conn)
            .await
            .map_err(|err| err.in_operation(OPERATION))?;
        let result = self.descendants_on(guard.connection(), id).await;
        guard
            .finish(result)
            .await
            .map_err(|err| err.in_operation(OPERATION))
    }

    /// Live ancestors of `id`, nearest first, ties by id.
    pub async fn ancestors(
        &self,
        conn: &DatabaseConnection,
        id: &M::Id,
    ) -> Result<Vec<M>, ClosureIndexError> {
        const OPERATION: &str = "ancestors";
        Self::ensure_supported(conn)?;
        let guard = ScopedTransaction::snapshot(conn)
            .await
            .map_err(|err| err.in_operation(OPERATION))?;
        let result = self.ancestors_on(guard.connection(), id).await;
        guard
            .finish(result)
            .await
            .map_err(|err| err.in_operation(OPERATION))
    }

    /// Every entity whose parent reference is `id`, deleted or not, by id.
    pub async fn direct_children(
        &self,
        conn: &DatabaseConnection,
        id: &M::Id,
    ) -> Result<Vec<M>, ClosureIndexError> {
        const OPERATION: &str = "direct_children";
        Self::ensure_supported(conn)?;
        let guard = ScopedTransaction::snapshot(conn)
            .await
            .map_err(|err| err.in_operation(OPERATION))?;
        let result = self.direct_children_on(guard.connection(), id).await;
        guard
            .finish(result)
            .await
            .map_err(|err| err.in_operation(OPERATION))
    }

    pub async fn parent(
        &self,
        conn: &DatabaseConnection,
        id: &M::Id,
    ) -> Result<Option<M>, ClosureIndexError> {
        const OPERATION: &str = "parent";
        Self::ensure_supported(conn)?;
        let node = self
            .find_node(conn, OPERATION, id)
            .await
            .map_err(|err| err.in_operation(OPERATION))?;
        match node.parent_id() {
            Some(parent_id) => M::Entity::find()
                .filter(M::id_column().eq(M::id_to_value(&parent_id)))
                .one(conn)
                .await
                .map_err(|err| ClosureIndexError::from(err).in_operation(OPERATION)),
            None => Ok(None),
        }
    }

    /// Live roots of the forest, by id.
    pub async fn roots(&self, conn: &DatabaseConnection) -> Result<Vec<M>, ClosureIndexError> {
        const OPERATION: &str = "roots";
        Self::ensure_supported(conn)?;
        M::Entity::find()
            .filter(M::parent_column().is_null())
            .filter(M::deleted_column().eq(false))
            .order_by_asc(M::id_column())
            .all(conn)
            .await
            .map_err(|err| ClosureIndexError::from(err).in_operation(OPERATION))
    }

    async fn create_node_on<C: ConnectionTrait>(
        &self,
        conn: &C,
        name: &str,
        is_deleted: bool,
        parent_id: Option<&M::Id>,
    ) -> Result<M, ClosureIndexError> {
        // A node born deleted is cut from its parent, like a soft-deleted one.
        let supertree = match parent_id {
            Some(parent_id) => {
                self.live_node(conn, "create_node", parent_id).await?;
                if is_deleted {
                    Vec::new()
                } else {
                    self.ancestry_of(conn, parent_id).await?
                }
            }
            None => Vec::new(),
        };

        let mut active = M::ActiveModel::default();
        M::set_parent(&mut active, parent_id.cloned());
        M::set_name(&mut active, name);
        M::set_deleted(&mut active, is_deleted);
        let model = active.insert(conn).await?;

        let model_id = model.id();
        let mut edges = vec![ClosureEdge::new(model_id.clone(), model_id.clone(), 0)];
        edges.extend(closure::link(&supertree, &[(model_id.clone(), 0)]));
        let linked = self.insert_edges(conn, edges).await?;

        tracing::debug!(id = ?model_id, parent = ?parent_id, edges = linked, "created node");
        Ok(model)
    }

    async fn soft_delete_on<C: ConnectionTrait>(
        &self,
        conn: &C,
        id: &M::Id,
    ) -> Result<(), ClosureIndexError> {
        let node = self.find_node(conn, "soft_delete", id).await?;
        if node.is_deleted() {
            tracing::debug!(id = ?id, "node already deleted");
            return Ok(());
        }

        M::Entity::update_many()
            .col_expr(M::deleted_column(), Expr::value(true))
            .filter(M::id_column().eq(M::id_to_value(id)))
            .exec(conn)
            .await?;

        let Some(parent_id) = node.parent_id() else {
            tracing::debug!(id = ?id, "deleted root");
            return Ok(());
        };

        let above = ids(self.ancestry_of(conn, &parent_id).await?);
        let below = ids(self.subtree_of(conn, id).await?);
        let severed = self.delete_edges(conn, &above, &below).await?;

        tracing::debug!(id = ?id, parent = ?parent_id, severed, "deleted node");
        Ok(())
    }

    async fn reparent_on<C: ConnectionTrait>(
        &self,
        conn: &C,
        node_id: &M::Id,
        new_parent_id: &M::Id,
    ) -> Result<(), ClosureIndexError> {
        let cycle = || ClosureIndexError::CycleViolation {
            node: format!("{node_id:?}"),
            new_parent: format!("{new_parent_id:?}"),
        };

        let node = self.live_node(conn, "reparent", node_id).await?;
        self.live_node(conn, "reparent", new_parent_id).await?;
        if node_id == new_parent_id {
            return Err(cycle());
        }

        let movers = match (self.config().reparent_scope(), node.parent_id()) {
            (ReparentScope::Siblings, Some(old_parent)) => {
                M::Entity::find()
                    .filter(M::parent_column().eq(M::id_to_value(&old_parent)))
                    .filter(M::id_column().ne(M::id_to_value(new_parent_id)))
                    .order_by_asc(M::id_column())
                    .all(conn)
                    .await?
            }
            _ => vec![node],
        };

        let mover_ids: HashSet<M::Id> = movers.iter().map(|mover| mover.id()).collect();
        let chain = self.parent_chain(conn, new_parent_id).await?;
        if chain.iter().any(|id| mover_ids.contains(id)) {
            return Err(cycle());
        }

        let values = mover_ids.iter().map(M::id_to_value).collect::<Vec<_>>();
        for batch in values.chunks(ID_BATCH) {
            M::Entity::update_many()
                .col_expr(M::parent_column(), Expr::value(M::id_to_value(new_parent_id)))
                .filter(M::id_column().is_in(batch.iter().cloned()))
                .exec(conn)
                .await?;
        }

        // The named node relinks first. Deleted siblings hold no edges above
        // themselves and stay detached.
        let mut relink: Vec<M::Id> = vec![node_id.clone()];
        relink.extend(
            movers
                .iter()
                .filter(|mover| !mover.is_deleted())
                .map(|mover| mover.id())
                .filter(|id| id != node_id),
        );

        let supertree = self.ancestry_of(conn, new_parent_id).await?;
        let mut severed = 0;
        let mut linked = 0;
        for mover_id in &relink {
            let subtree = self.subtree_of(conn, mover_id).await?;
            let above: Vec<M::Id> = self
                .ancestry_of(conn, mover_id)
                .await?
                .into_iter()
                .filter(|(_, depth)| *depth > 0)
                .map(|(id, _)| id)
                .collect();
            let below: Vec<M::Id> = subtree.iter().map(|(id, _)| id.clone()).collect();

            severed += self.delete_edges(conn, &above, &below).await?;
            linked += self
                .insert_edges(conn, closure::link(&supertree, &subtree))
                .await?;
        }

        tracing::debug!(
            node = ?node_id,
            new_parent = ?new_parent_id,
            moved = mover_ids.len(),
            severed,
            linked,
            "reparented node"
        );
        Ok(())
    }

    async fn rebuild_on<C: ConnectionTrait>(&self, conn: &C) -> Result<usize, ClosureIndexError> {
        let nodes = M::Entity::find()
            .order_by_asc(M::id_column())
            .all(conn)
            .await?
            .into_iter()
            .map(|model| ForestNode {
                id: model.id(),
                parent: model.parent_id(),
                deleted: model.is_deleted(),
            })
            .collect::<Vec<_>>();

        let edges = closure::compute(&nodes)?;
        M::HierarchyEntity::delete_many().exec(conn).await?;
        let written = self.insert_edges(conn, edges).await?;

        tracing::debug!(nodes = nodes.len(), edges = written, "rebuilt closure index");
        Ok(written)
    }

    async fn descendants_on<C: ConnectionTrait>(
        &self,
        conn: &C,
        id: &M::Id,
    ) -> Result<Vec<M>, ClosureIndexError> {
        self.find_node(conn, "descendants", id).await?;
        let rows = M::HierarchyEntity::find()
            .filter(M::hierarchy_ancestor_column().eq(M::hierarchy_id_to_value(id)))
            .filter(M::hierarchy_depth_column().gt(0))
            .order_by_asc(M::hierarchy_depth_column())
            .order_by_asc(M::hierarchy_descendant_column())
            .all(conn)
            .await?;

        let order = rows
            .iter()
            .map(M::hierarchy_model_descendant)
            .collect::<Vec<_>>();
        self.live_in_order(conn, order).await
    }

    async fn ancestors_on<C: ConnectionTrait>(
        &self,
        conn: &C,
        id: &M::Id,
    ) -> Result<Vec<M>, ClosureIndexError> {
        self.find_node(conn, "ancestors", id).await?;
        let rows = M::HierarchyEntity::find()
            .filter(M::hierarchy_descendant_column().eq(M::hierarchy_id_to_value(id)))
            .filter(M::hierarchy_depth_column().gt(0))
            .order_by_asc(M::hierarchy_depth_column())
            .order_by_asc(M::hierarchy_ancestor_column())
            .all(conn)
            .await?;

        let order = rows
            .iter()
            .map(M::hierarchy_model_ancestor)
            .collect::<Vec<_>>();
        self.live_in_order(conn, order).await
    }

    async fn direct_children_on<C: ConnectionTrait>(
        &self,
        conn: &C,
        id: &M::Id,
    ) -> Result<Vec<M>, ClosureIndexError> {
        self.find_node(conn, "direct_children", id).await?;
        let rows = M::Entity::find()
            .filter(M::parent_column().eq(M::id_to_value(id)))
            .order_by_asc(M::id_column())
            .all(conn)
            .await?;
        Ok(rows)
    }

    /// Load the live entities among `order`, keeping that order.
    async fn live_in_order<C: ConnectionTrait>(
        &self,
        conn: &C,
        order: Vec<M::Id>,
    ) -> Result<Vec<M>, ClosureIndexError> {
        if order.is_empty() {
            return Ok(Vec::new());
        }

        let mut live: HashMap<M::Id, M> = HashMap::with_capacity(order.len());
        for batch in order.chunks(ID_BATCH) {
            let rows = M::Entity::find()
                .filter(M::id_column().is_in(batch.iter().map(M::id_to_value)))
                .filter(M::deleted_column().eq(false))
                .all(conn)
                .await?;
            live.extend(rows.into_iter().map(|model| (model.id(), model)));
        }

        Ok(order.into_iter().filter_map(|id| live.remove(&id)).collect())
    }

    async fn find_node<C: ConnectionTrait>(
        &self,
        conn: &C,
        operation: &'static str,
        id: &M::Id,
    ) -> Result<M, ClosureIndexError> {
        M::Entity::find()
            .filter(M::id_column().eq(M::id_to_value(id)))
            .one(conn)
            .await?
            .ok_or_else(|| ClosureIndexError::not_found(operation, id))
    }

    async fn live_node<C: ConnectionTrait>(
        &self,
        conn: &C,
        operation: &'static str,
        id: &M::Id,
    ) -> Result<M, ClosureIndexError> {
        let node = self.find_node(conn, operation, id).await?;
        if node.is_deleted() {
            return Err(ClosureIndexError::not_found(operation, id));
        }
        Ok(node)
    }

    /// `id` followed by each parent reference up to its root.
    async fn parent_chain<C: ConnectionTrait>(
        &self,
        conn: &C,
        id: &M::Id,
    ) -> Result<Vec<M::Id>, ClosureIndexError> {
        let mut chain = vec![id.clone()];
        let mut seen: HashSet<M::Id> = HashSet::from([id.clone()]);
        let mut current = self.find_node(conn, "reparent", id).await?.parent_id();

        while let Some(parent_id) = current {
            if !seen.insert(parent_id.clone()) {
                return Err(ClosureIndexError::invariant(format!(
                    "parent references above {id:?} loop at {parent_id:?}"
                )));
            }
            chain.push(parent_id.clone());
            current = M::Entity::find()
                .filter(M::id_column().eq(M::id_to_value(&parent_id)))
                .one(conn)
                .await?
                .and_then(|model| model.parent_id());
        }

        Ok(chain)
    }

    /// `(ancestor, depth)` for every closure edge ending at `id`, itself included.
    async fn ancestry_of<C: ConnectionTrait>(
        &self,
        conn: &C,
        id: &M::Id,
    ) -> Result<Vec<(M::Id, i32)>, ClosureIndexError> {
        let rows = M::HierarchyEntity::find()
            .filter(M::hierarchy_descendant_column().eq(M::hierarchy_id_to_value(id)))
            .order_by_asc(M::hierarchy_depth_column())
            .all(conn)
            .await?;
        Ok(rows
            .iter()
            .map(|row| {
                (
                    M::hierarchy_model_ancestor(row),
                    M::hierarchy_model_depth(row),
                )
            })
            .collect())
    }

    /// `(descendant, depth)` for every closure edge starting at `id`, itself included.
    async fn subtree_of<C: ConnectionTrait>(
        &self,
        conn: &C,
        id: &M::Id,
    ) -> Result<Vec<(M::Id, i32)>, ClosureIndexError> {
        let rows = M::HierarchyEntity::find()
            .filter(M::hierarchy_ancestor_column().eq(M::hierarchy_id_to_value(id)))
            .order_by_asc(M::hierarchy_depth_column())
            .all(conn)
            .await?;
        Ok(rows
            .iter()
            .map(|row| {
                (
                    M::hierarchy_model_descendant(row),
                    M::hierarchy_model_depth(row),
                )
            })
            .collect())
    }

    async fn delete_edges<C: ConnectionTrait>(
        &self,
        conn: &C,
        ancestors: &[M::Id],
        descendants: &[M::Id],
    ) -> Result<u64, ClosureIndexError> {
        if ancestors.is_empty() || descendants.is_empty() {
            return Ok(0);
        }

        let mut removed = 0;
        for above in ancestors.chunks(ID_BATCH) {
            for below in descendants.chunks(ID_BATCH) {
                let result = M::HierarchyEntity::delete_many()
                    .filter(
                        M::hierarchy_ancestor_column()
                            .is_in(above.iter().map(M::hierarchy_id_to_value)),
                    )
                    .filter(
                        M::hierarchy_descendant_column()
                            .is_in(below.iter().map(M::hierarchy_id_to_value)),
                    )
                    .exec(conn)
                    .await?;
                removed += result.rows_affected;
            }
        }
        Ok(removed)
    }

    async fn insert_edges<C: ConnectionTrait>(
        &self,
        conn: &C,
        edges: Vec<ClosureEdge<M::Id>>,
    ) -> Result<usize, ClosureIndexError> {
        let total = edges.len();
        let mut rows = edges.into_iter().map(|edge| {
            M::hierarchy_build_row(edge.ancestor, edge.descendant, edge.depth)
        });

        loop {
            let batch = rows.by_ref().take(INSERT_BATCH).collect::<Vec<_>>();
            if batch.is_empty() {
                break;
            }
            M::HierarchyEntity::insert_many(batch)
                .exec_without_returning(conn)
                .await?;
        }

        Ok(total)
    }
}

fn ids<Id>(rows: Vec<(Id, i32)>) -> Vec<Id> {
    rows.into_iter().map(|(id, _)| id).collect()
}
