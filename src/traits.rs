use std::fmt::Debug;
use std::hash::Hash;

use sea_orm::{
    ActiveModelBehavior, ActiveModelTrait, EntityTrait, FromQueryResult, IntoActiveModel, Value,
};

use crate::config::ClosureIndexConfig;

/// Trait implemented by SeaORM `Model` types whose rows form a forest indexed
/// by a closure table.
///
/// Implementations are normally provided by the `#[derive(ClosureIndexModel)]` macro.
pub trait ClosureIndexModel:
    Clone + Send + Sync + 'static + IntoActiveModel<Self::ActiveModel> + FromQueryResult
{
    type Entity: EntityTrait<Model = Self>;
    type ActiveModel: ActiveModelTrait<Entity = Self::Entity> + ActiveModelBehavior + Send;
    type Id: Clone + Eq + Hash + Debug + Send + Sync + 'static;

    type HierarchyEntity: EntityTrait<Model = Self::HierarchyModel>;
    type HierarchyModel: Clone
        + Send
        + Sync
        + 'static
        + FromQueryResult
        + IntoActiveModel<Self::HierarchyActiveModel>;
    type HierarchyActiveModel: ActiveModelTrait<Entity = Self::HierarchyEntity>
        + ActiveModelBehavior
        + Send;

    fn closure_index_config() -> &'static ClosureIndexConfig;

    fn id(&self) -> Self::Id;
    fn parent_id(&self) -> Option<Self::Id>;
    fn set_parent(active: &mut Self::ActiveModel, parent: Option<Self::Id>);
    fn id_to_value(id: &Self::Id) -> Value;

    fn set_name(active: &mut Self::ActiveModel, name: &str);

    fn is_deleted(&self) -> bool;
    fn set_deleted(active: &mut Self::ActiveModel, deleted: bool);

    fn parent_column() -> <Self::Entity as EntityTrait>::Column;
    fn id_column() -> <Self::Entity as EntityTrait>::Column;
    fn deleted_column() -> <Self::Entity as EntityTrait>::Column;

    fn hierarchy_ancestor_column() -> <Self::HierarchyEntity as EntityTrait>::Column;
    fn hierarchy_descendant_column() -> <Self::HierarchyEntity as EntityTrait>::Column;
    fn hierarchy_depth_column() -> <Self::HierarchyEntity as EntityTrait>::Column;

    fn hierarchy_id_to_value(id: &Self::Id) -> Value;
    fn hierarchy_model_ancestor(model: &Self::HierarchyModel) -> Self::Id;
    fn hierarchy_model_descendant(model: &Self::HierarchyModel) -> Self::Id;
    fn hierarchy_model_depth(model: &Self::HierarchyModel) -> i32;
    fn hierarchy_build_row(
        ancestor: Self::Id,
        descendant: Self::Id,
        depth: i32,
    ) -> Self::HierarchyActiveModel;
}
