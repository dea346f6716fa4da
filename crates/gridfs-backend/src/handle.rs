//! Type-erased database handle.

use std::any::Any;
use std::sync::Arc;

/// Opaque connection handle shared by every stream of a store.
///
/// Backends recognise their own handles by downcasting; nothing else about
/// the concrete type is visible to the streaming layer.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<dyn Any + Send + Sync>,
    type_name: &'static str,
}

impl DbHandle {
    /// Wrap a concrete connection value.
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            inner: Arc::new(value),
            type_name: std::any::type_name::<T>(),
        }
    }

    /// Borrow the wrapped value if it is a `T`.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.inner.downcast_ref::<T>()
    }

    /// Whether the wrapped value is a `T`.
    pub fn is<T: Any>(&self) -> bool {
        self.inner.is::<T>()
    }

    /// Rust type name of the wrapped value, for diagnostics.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }
}

impl std::fmt::Debug for DbHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("DbHandle").field(&self.type_name).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fake(u32);

    #[test]
    fn test_downcast() {
        let handle = DbHandle::new(Fake(7));
        assert!(handle.is::<Fake>());
        assert_eq!(handle.downcast_ref::<Fake>().map(|f| f.0), Some(7));
        assert!(handle.downcast_ref::<String>().is_none());
        assert!(handle.type_name().ends_with("Fake"));
    }

    #[test]
    fn test_clones_share_value() {
        let handle = DbHandle::new(String::from("conn"));
        let other = handle.clone();
        let a = handle.downcast_ref::<String>().map(|s| s.as_ptr());
        let b = other.downcast_ref::<String>().map(|s| s.as_ptr());
        assert_eq!(a, b);
    }
}
