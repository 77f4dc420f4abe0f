//! Process-wide object registry.
//!
//! Public objects (contexts, branches, timers, ...) are created through
//! factories, registered here and referenced through opaque [`Handle`]s. The
//! registry holds the owning strong reference; destruction fails while any
//! other strong reference exists.

use std::any::Any;
use std::collections::HashMap;
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;
use yogi_primitives::Duration;

use crate::context::Context;
use crate::errors::{Error, ErrorKind, Result};

/// Opaque handle to a registered object.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Handle(NonZeroU64);

/// Discriminates the registered object types.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ObjectKind {
    Context,
    Logger,
    Timer,
    Branch,
    Configuration,
    SignalSet,
}

/// Implemented by every object that can live in the registry.
pub trait ExposedObject: Send + Sync + 'static {
    fn kind(&self) -> ObjectKind;

    /// Upcast used by the typed getters.
    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

static OBJECTS: Lazy<Mutex<HashMap<Handle, Arc<dyn ExposedObject>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

/// The registry itself; all methods operate on the process-wide table.
pub struct ObjectRegistry;

impl ObjectRegistry {
    pub fn register(obj: Arc<dyn ExposedObject>) -> Handle {
        let raw = NEXT_HANDLE.fetch_add(1, Ordering::Relaxed);
        let handle = Handle(NonZeroU64::new(raw).expect("handle counter starts at one"));

        let mut objects = OBJECTS.lock().expect("Mutex poisoned");
        objects.insert(handle, obj);

        handle
    }

    /// Typed lookup; fails with `InvalidHandle` or `WrongObjectType`.
    pub fn get<T: ExposedObject>(handle: Handle) -> Result<Arc<T>> {
        let objects = OBJECTS.lock().expect("Mutex poisoned");
        let obj = objects
            .get(&handle)
            .cloned()
            .ok_or(Error::new(ErrorKind::InvalidHandle))?;
        drop(objects);

        obj.as_any_arc()
            .downcast::<T>()
            .map_err(|_| Error::new(ErrorKind::WrongObjectType))
    }

    /// All registered objects of type `T` matching `pred`.
    pub fn get_matching<T, P>(pred: P) -> Vec<Arc<T>>
    where
        T: ExposedObject,
        P: Fn(&Arc<T>) -> bool,
    {
        let objects = OBJECTS.lock().expect("Mutex poisoned");
        objects
            .values()
            .filter_map(|obj| Arc::clone(obj).as_any_arc().downcast::<T>().ok())
            .filter(|obj| pred(obj))
            .collect()
    }

    pub fn get_all<T: ExposedObject>() -> Vec<Arc<T>> {
        Self::get_matching(|_| true)
    }

    /// Destroys a single object.
    ///
    /// Fails with `ObjectStillUsed` while any strong reference besides the
    /// registry's own exists.
    pub fn destroy(handle: Handle) -> Result<()> {
        // Hold the object so it is dropped after the lock is released.
        let obj;

        {
            let mut objects = OBJECTS.lock().expect("Mutex poisoned");
            let entry = objects
                .get(&handle)
                .ok_or(Error::new(ErrorKind::InvalidHandle))?;

            if Arc::strong_count(entry) > 1 {
                return Err(Error::new(ErrorKind::ObjectStillUsed));
            }

            obj = objects.remove(&handle);
        }

        drop(obj);
        Ok(())
    }

    /// Destroys all registered objects.
    ///
    /// Stops every context, then repeatedly drops objects that have become
    /// uniquely held and polls the remaining contexts so that pending
    /// handlers can release their references. Fails with `ObjectStillUsed`
    /// if a steady state with residual holders is reached.
    pub fn destroy_all() -> Result<()> {
        let mut objs: Vec<Arc<dyn ExposedObject>> = {
            let mut objects = OBJECTS.lock().expect("Mutex poisoned");
            objects.drain().map(|(_, obj)| obj).collect()
        };

        for context in all_contexts(&objs) {
            context.stop();
            context.wait_for_stopped(Duration::inf());
        }

        loop {
            let mut destroyed_some = false;
            objs.retain(|obj| {
                if Arc::strong_count(obj) == 1 {
                    destroyed_some = true;
                    false
                } else {
                    true
                }
            });

            let mut polled_some = false;
            for context in all_contexts(&objs) {
                if context.poll().unwrap_or(0) > 0 {
                    polled_some = true;
                }
            }

            if !destroyed_some && !polled_some {
                break;
            }
        }

        if objs.is_empty() {
            Ok(())
        } else {
            Err(Error::new(ErrorKind::ObjectStillUsed))
        }
    }
}

fn all_contexts(objs: &[Arc<dyn ExposedObject>]) -> Vec<Arc<Context>> {
    objs.iter()
        .filter(|obj| obj.kind() == ObjectKind::Context)
        .filter_map(|obj| Arc::clone(obj).as_any_arc().downcast::<Context>().ok())
        .collect()
}
