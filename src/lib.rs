pub mod guid;
pub mod handle;
pub mod resource_pool;
pub mod resource_registry;
pub mod slab_pool;
pub mod vec_forest;
