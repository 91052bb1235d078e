//! Main/current context resolution.
//!
//! # Responsibility
//! - Own the single main context of a store.
//! - Resolve the context for the calling thread.
//!
//! # Invariants
//! - Exactly one main context exists per registry.
//! - Off the primary thread, `current_context` never returns the main
//!   context unless the thread explicitly entered it.
//! - Entered contexts are thread-local and scoped by `ContextGuard`.

use super::{Context, ContextId, ContextRole};
use crate::store::Store;
use log::debug;
use std::cell::RefCell;
use std::marker::PhantomData;
use std::sync::Arc;
use std::thread::{self, ThreadId};

thread_local! {
    static ENTERED: RefCell<Vec<Context>> = const { RefCell::new(Vec::new()) };
}

/// Resolves contexts for execution units sharing one store.
#[derive(Debug)]
pub struct ContextRegistry {
    store: Arc<Store>,
    main: Context,
    primary_thread: ThreadId,
}

impl ContextRegistry {
    /// Creates the registry with the calling thread as primary thread.
    pub fn new(store: Arc<Store>) -> Self {
        Self::with_primary_thread(store, thread::current().id())
    }

    pub fn with_primary_thread(store: Arc<Store>, primary_thread: ThreadId) -> Self {
        let main = Context::new(&store, ContextRole::Main);
        Self {
            store,
            main,
            primary_thread,
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn main_context(&self) -> Context {
        self.main.clone()
    }

    pub fn is_primary_thread(&self) -> bool {
        thread::current().id() == self.primary_thread
    }

    pub fn new_background_context(&self) -> Context {
        Context::background(&self.store)
    }

    /// Context for the calling thread.
    ///
    /// Returns the innermost context entered on this thread, else the main
    /// context on the primary thread, else a fresh background context (a new
    /// one per call).
    pub fn current_context(&self) -> Context {
        if let Some(context) = entered_context(&self.store) {
            return context;
        }
        if self.is_primary_thread() {
            return self.main_context();
        }
        let context = self.new_background_context();
        debug!(
            "event=context_resolve module=context status=ok context={} source=new_background",
            context.id()
        );
        context
    }

    /// Runs `f` against the current context.
    pub fn with_current<R>(&self, f: impl FnOnce(&Context) -> R) -> R {
        let context = self.current_context();
        f(&context)
    }

    /// Makes `context` the current context of this thread until the guard
    /// is dropped.
    pub fn enter(&self, context: &Context) -> ContextGuard {
        ENTERED.with(|stack| stack.borrow_mut().push(context.clone()));
        ContextGuard {
            context_id: context.id(),
            _not_send: PhantomData,
        }
    }
}

fn entered_context(store: &Arc<Store>) -> Option<Context> {
    ENTERED.with(|stack| {
        stack
            .borrow()
            .iter()
            .rev()
            .find(|context| Arc::ptr_eq(context.store(), store))
            .cloned()
    })
}

/// Scope of a context entered on the current thread.
#[must_use = "the context is left when the guard is dropped"]
pub struct ContextGuard {
    context_id: ContextId,
    _not_send: PhantomData<*const ()>,
}

impl ContextGuard {
    pub fn context_id(&self) -> ContextId {
        self.context_id
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        ENTERED.with(|stack| {
            let mut stack = stack.borrow_mut();
            if let Some(position) = stack
                .iter()
                .rposition(|context| context.id() == self.context_id)
            {
                stack.remove(position);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::ContextRegistry;
    use crate::model::schema::Model;
    use crate::store::Store;
    use std::thread;

    fn registry() -> ContextRegistry {
        let store = Store::open_in_memory(Model::new("Model")).unwrap();
        ContextRegistry::new(store)
    }

    #[test]
    fn primary_thread_resolves_main_context() {
        let registry = registry();
        let current = registry.current_context();
        assert!(current.is_main());
        assert!(current.ptr_eq(&registry.main_context()));
    }

    #[test]
    fn other_threads_get_fresh_background_contexts() {
        let registry = registry();
        thread::scope(|scope| {
            scope
                .spawn(|| {
                    let first = registry.current_context();
                    let second = registry.current_context();
                    assert!(!first.is_main());
                    assert!(!first.ptr_eq(&second));
                })
                .join()
                .unwrap();
        });
    }

    #[test]
    fn entered_context_overrides_resolution_until_guard_drops() {
        let registry = registry();
        thread::scope(|scope| {
            scope
                .spawn(|| {
                    let background = registry.new_background_context();
                    {
                        let _guard = registry.enter(&background);
                        assert!(registry.current_context().ptr_eq(&background));
                        assert!(registry.with_current(|ctx| ctx.ptr_eq(&background)));
                    }
                    assert!(!registry.current_context().ptr_eq(&background));
                })
                .join()
                .unwrap();
        });
    }
}
