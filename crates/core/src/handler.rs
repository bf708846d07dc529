//! Notification capability invoked by the reconciliation loop.

/// Callbacks run synchronously on the single consumer, after the store commit.
/// Implementations must not block for long: they hold up every other key.
pub trait ResourceEventHandler<T>: Send + Sync {
    fn on_add(&self, obj: &T);
    fn on_update(&self, old: &T, new: &T);
    /// `obj` is the last state the mirror knew about.
    fn on_delete(&self, obj: &T);
}

type ObjFn<T> = Box<dyn Fn(&T) + Send + Sync>;
type PairFn<T> = Box<dyn Fn(&T, &T) + Send + Sync>;

/// Handler assembled from independent closures; missing ones are no-ops.
pub struct HandlerFns<T> {
    add: Option<ObjFn<T>>,
    update: Option<PairFn<T>>,
    delete: Option<ObjFn<T>>,
}

impl<T> Default for HandlerFns<T> {
    fn default() -> Self { Self { add: None, update: None, delete: None } }
}

impl<T> HandlerFns<T> {
    pub fn new() -> Self { Self::default() }

    pub fn with_add(mut self, f: impl Fn(&T) + Send + Sync + 'static) -> Self {
        self.add = Some(Box::new(f));
        self
    }

    pub fn with_update(mut self, f: impl Fn(&T, &T) + Send + Sync + 'static) -> Self {
        self.update = Some(Box::new(f));
        self
    }

    pub fn with_delete(mut self, f: impl Fn(&T) + Send + Sync + 'static) -> Self {
        self.delete = Some(Box::new(f));
        self
    }
}

impl<T> ResourceEventHandler<T> for HandlerFns<T> {
    fn on_add(&self, obj: &T) {
        if let Some(f) = &self.add { f(obj) }
    }

    fn on_update(&self, old: &T, new: &T) {
        if let Some(f) = &self.update { f(old, new) }
    }

    fn on_delete(&self, obj: &T) {
        if let Some(f) = &self.delete { f(obj) }
    }
}
