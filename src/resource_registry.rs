use std::{
    any::{Any, TypeId},
    collections::HashMap,
    sync::{Arc, RwLock},
};

use once_cell::sync::Lazy;

use crate::{guid::Guid, handle::Handle, resource_pool, resource_pool::ResourcePool};

/// Errors that may occur when routing through a [`ResourceRegistry`].
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// No pool exists for the requested type; pools are created by the
    /// first `add` for that type.
    #[error("no resource pool registered for {type_name}")]
    TypeNotRegistered { type_name: &'static str },
    #[error(transparent)]
    Pool(#[from] resource_pool::Error),
}

impl From<crate::slab_pool::Error> for Error {
    fn from(error: crate::slab_pool::Error) -> Self {
        Self::Pool(error.into())
    }
}

static GLOBAL: Lazy<ResourceRegistry> = Lazy::new(ResourceRegistry::new);

/// Routes resource operations to the [`ResourcePool`] for the runtime type
/// of each call. A pool is created on demand by the first `add` for its
/// type; every other operation on a type never added fails with
/// [`Error::TypeNotRegistered`].
///
/// The registry itself only guards the type→pool map (read-mostly; written
/// once per type). All per-entry work serializes on the individual pool's
/// lock, so operations on different types proceed independently.
pub struct ResourceRegistry {
    pools: RwLock<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self {
            pools: RwLock::new(HashMap::new()),
        }
    }

    /// The process-wide registry.
    pub fn global() -> &'static ResourceRegistry {
        &GLOBAL
    }

    /// The pool for `T`, for callers that resolve many handles and want to
    /// skip the per-call map lookup (a renderer resolving every frame).
    pub fn pool<T: Send + 'static>(&self) -> Result<Arc<ResourcePool<T>>, Error> {
        let pools = self.pools.read().expect("registry lock poisoned");
        let pool = pools
            .get(&TypeId::of::<T>())
            .ok_or(Error::TypeNotRegistered {
                type_name: std::any::type_name::<T>(),
            })?;
        Ok(downcast_pool(pool.clone()))
    }

    fn pool_or_create<T: Send + 'static>(&self) -> Result<Arc<ResourcePool<T>>, Error> {
        if let Ok(pool) = self.pool::<T>() {
            return Ok(pool);
        }

        let mut pools = self.pools.write().expect("registry lock poisoned");
        // Another thread may have created the pool between the two locks.
        let pool = match pools.entry(TypeId::of::<T>()) {
            std::collections::hash_map::Entry::Occupied(entry) => entry.get().clone(),
            std::collections::hash_map::Entry::Vacant(entry) => {
                let pool: Arc<dyn Any + Send + Sync> = Arc::new(ResourcePool::<T>::new()?);
                entry.insert(pool).clone()
            }
        };
        Ok(downcast_pool(pool))
    }

    /// Adds an unbound entry, creating the pool for `T` on first use.
    pub fn add<T: Send + 'static>(&self, value: T) -> Result<Handle<T>, Error> {
        Ok(self.pool_or_create()?.add(value)?)
    }

    /// Adds a guid-bound entry, creating the pool for `T` on first use.
    pub fn add_with_guid<T: Send + 'static>(
        &self,
        guid: Guid,
        value: T,
    ) -> Result<Handle<T>, Error> {
        Ok(self.pool_or_create()?.add_with_guid(guid, value)?)
    }

    /// Calls `f` with the entry at `handle`. The pool stays locked for the
    /// duration of `f`; do not call back into the same pool from it.
    pub fn with<T: Send + 'static, R>(
        &self,
        handle: Handle<T>,
        f: impl FnOnce(&T) -> R,
    ) -> Result<R, Error> {
        let pool = self.pool::<T>()?;
        let entry = pool.get(handle)?;
        Ok(f(&entry))
    }

    /// Mutable form of [`with`](Self::with).
    pub fn with_mut<T: Send + 'static, R>(
        &self,
        handle: Handle<T>,
        f: impl FnOnce(&mut T) -> R,
    ) -> Result<R, Error> {
        let pool = self.pool::<T>()?;
        let mut entry = pool.get_mut(handle)?;
        Ok(f(&mut entry))
    }

    pub fn remove<T: Send + 'static>(&self, handle: Handle<T>) -> Result<(), Error> {
        self.pool::<T>()?.remove(handle);
        Ok(())
    }

    pub fn retain<T: Send + 'static>(&self, handle: Handle<T>) -> Result<(), Error> {
        self.pool::<T>()?.retain(handle);
        Ok(())
    }

    pub fn release<T: Send + 'static>(&self, handle: Handle<T>) -> Result<(), Error> {
        self.pool::<T>()?.release(handle);
        Ok(())
    }

    pub fn valid<T: Send + 'static>(&self, handle: Handle<T>) -> Result<bool, Error> {
        Ok(self.pool::<T>()?.valid(handle))
    }

    pub fn use_count<T: Send + 'static>(&self, handle: Handle<T>) -> Result<u32, Error> {
        Ok(self.pool::<T>()?.use_count(handle))
    }

    pub fn guid_of<T: Send + 'static>(&self, handle: Handle<T>) -> Result<Guid, Error> {
        Ok(self.pool::<T>()?.guid_of(handle))
    }

    pub fn find_by_guid<T: Send + 'static>(&self, guid: Guid) -> Result<Handle<T>, Error> {
        Ok(self.pool::<T>()?.find_by_guid(guid))
    }

    /// Visits every live entry of type `T` with the pool lock held; `f`
    /// must not call back into the same pool.
    pub fn for_all<T: Send + 'static>(
        &self,
        f: impl FnMut(Handle<T>, &T),
    ) -> Result<(), Error> {
        self.pool::<T>()?.for_each(f);
        Ok(())
    }

    /// Mutable form of [`for_all`](Self::for_all).
    pub fn for_all_mut<T: Send + 'static>(
        &self,
        f: impl FnMut(Handle<T>, &mut T),
    ) -> Result<(), Error> {
        self.pool::<T>()?.for_each_mut(f);
        Ok(())
    }
}

impl Default for ResourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn downcast_pool<T: Send + 'static>(pool: Arc<dyn Any + Send + Sync>) -> Arc<ResourcePool<T>> {
    pool.downcast()
        .unwrap_or_else(|_| unreachable!("pools are keyed by their own TypeId"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Mesh {
        vertices: u64,
    }

    #[derive(Debug, PartialEq)]
    struct Texture {
        side: u32,
        levels: u32,
    }

    #[test]
    fn routes_by_type() {
        let registry = ResourceRegistry::new();

        let mesh = registry.add(Mesh { vertices: 36 }).unwrap();
        let texture = registry
            .add(Texture {
                side: 256,
                levels: 9,
            })
            .unwrap();

        assert_eq!(
            registry.with(mesh, |m| m.vertices).unwrap(),
            36
        );
        assert_eq!(registry.with(texture, |t| t.side).unwrap(), 256);

        // Pools are independent; both types share slot 0 of their own slab.
        assert_eq!(mesh.offset(), 0);
        assert_eq!(texture.offset(), 0);
    }

    #[test]
    fn unregistered_type_is_reported() {
        let registry = ResourceRegistry::new();
        let stray = Handle::<Mesh>::null();

        assert!(matches!(
            registry.valid(stray),
            Err(Error::TypeNotRegistered { .. })
        ));
        assert!(matches!(
            registry.find_by_guid::<Mesh>(Guid::from_u128(1)),
            Err(Error::TypeNotRegistered { .. })
        ));
        assert!(matches!(
            registry.pool::<Mesh>(),
            Err(Error::TypeNotRegistered { .. })
        ));
    }

    #[test]
    fn lifetime_operations_route_through() {
        let registry = ResourceRegistry::new();
        let guid = Guid::from_u128(7);

        let h = registry
            .add_with_guid(guid, Mesh { vertices: 3 })
            .unwrap();
        registry.retain(h).unwrap();
        assert_eq!(registry.use_count(h).unwrap(), 2);
        assert_eq!(registry.guid_of(h).unwrap(), guid);
        assert_eq!(registry.find_by_guid::<Mesh>(guid).unwrap(), h);

        registry.release(h).unwrap();
        registry.release(h).unwrap();
        assert!(!registry.valid(h).unwrap());
        assert!(registry.find_by_guid::<Mesh>(guid).unwrap().is_null());
    }

    #[test]
    fn for_all_visits_one_type_only() {
        let registry = ResourceRegistry::new();

        for vertices in [3u64, 6, 9] {
            let _ = registry.add(Mesh { vertices }).unwrap();
        }
        let _ = registry
            .add(Texture { side: 16, levels: 1 })
            .unwrap();

        let mut total = 0;
        registry
            .for_all::<Mesh>(|_, mesh| total += mesh.vertices)
            .unwrap();
        assert_eq!(total, 18);

        registry
            .for_all_mut::<Mesh>(|_, mesh| mesh.vertices += 1)
            .unwrap();
        let mut bumped = Vec::new();
        registry
            .for_all::<Mesh>(|_, mesh| bumped.push(mesh.vertices))
            .unwrap();
        assert_eq!(bumped, [4, 7, 10]);
    }

    #[test]
    fn mutation_through_with_mut() {
        let registry = ResourceRegistry::new();
        let h = registry.add(Texture { side: 4, levels: 1 }).unwrap();

        registry.with_mut(h, |t| t.levels = 3).unwrap();
        assert_eq!(registry.with(h, |t| t.levels).unwrap(), 3);
    }

    #[test]
    fn global_registry_is_shared() {
        let h = ResourceRegistry::global().add(0xabcdu64).unwrap();
        assert!(ResourceRegistry::global().valid(h).unwrap());
        ResourceRegistry::global().release(h).unwrap();
    }

    /// The load → save → reload shape: a loader binds guids, a serializer
    /// walks the pool and records them, and a fresh session re-establishes
    /// the same logical handles from the guids alone.
    #[test]
    fn guids_survive_a_reload() {
        let loaded = ResourceRegistry::new();
        let sources = [(Guid::from_u128(0x10), 24u64), (Guid::from_u128(0x20), 36)];
        for (guid, vertices) in sources {
            let _ = loaded
                .add_with_guid(guid, Mesh { vertices })
                .unwrap();
        }

        // Serialize. The pool lock is held inside `for_all`, so only raw
        // handles are collected there; guids are read back afterwards.
        let mut walked = Vec::new();
        loaded
            .for_all::<Mesh>(|handle, mesh| walked.push((handle.as_raw(), mesh.vertices)))
            .unwrap();
        let saved: Vec<(Guid, u64)> = walked
            .iter()
            .map(|(raw, vertices)| {
                let handle = unsafe { Handle::<Mesh>::from_raw(*raw) };
                (loaded.guid_of(handle).unwrap(), *vertices)
            })
            .collect();
        assert_eq!(saved.len(), 2);
        assert!(saved.iter().all(|(guid, _)| guid.is_valid()));

        // Reload into a fresh registry; handles differ, guids agree.
        let reloaded = ResourceRegistry::new();
        for (guid, vertices) in &saved {
            let _ = reloaded
                .add_with_guid(*guid, Mesh { vertices: *vertices })
                .unwrap();
        }
        for (guid, vertices) in &saved {
            let handle = reloaded.find_by_guid::<Mesh>(*guid).unwrap();
            assert!(!handle.is_null());
            assert_eq!(reloaded.with(handle, |m| m.vertices).unwrap(), *vertices);
        }
    }

}
