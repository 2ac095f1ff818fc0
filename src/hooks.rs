//! Typed pre/post hook pipeline wrapped around every pool operation
//! (`spec.md` §4.5).
//!
//! Grounded on the teacher's `with_timeout` helper
//! (`postgres/src/connection.rs`) for the per-hook timeout wrapper, and on
//! the same file's `PostgresTransaction`/`PostgresConnection` method
//! bodies for the "run this, but isolate failures from the caller" shape.
//! Hooks additionally need panic isolation, which the teacher's
//! single-future methods don't: we get that by running each hook inside
//! its own `tokio::spawn`ed task and inspecting `JoinError::is_panic()`.

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use crate::{config::HookKind, error::Error, value::MetadataMap};

/// The data made available to a hook invocation.
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    pub operation: &'static str,
    pub tenant_id: Option<String>,
    pub metadata: MetadataMap,
    pub error: Option<String>,
    pub duration: Option<Duration>,
}

impl ExecutionContext {
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            ..Default::default()
        }
    }
}

/// Outcome a hook returns to the pipeline.
///
/// `spec.md` §4.5 names three distinct outcomes: proceed normally, abort
/// with an error, or abort without one (the hook itself decided execution
/// should stop, with no failure to report).
#[derive(Debug)]
pub enum HookOutcome {
    Continue,
    StopWithError(Error),
    StopSilently,
}

#[async_trait]
pub trait Hook: Send + Sync {
    fn name(&self) -> &str;
    async fn call(&self, ctx: &ExecutionContext) -> HookOutcome;
}

struct FnHook<F> {
    name: String,
    f: F,
}

#[async_trait]
impl<F> Hook for FnHook<F>
where
    F: Fn(&ExecutionContext) -> HookOutcome + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(&self, ctx: &ExecutionContext) -> HookOutcome {
        (self.f)(ctx)
    }
}

/// Builds a synchronous hook from a plain closure — most built-in hooks
/// don't need to `.await` anything.
pub fn sync_hook(
    name: impl Into<String>,
    f: impl Fn(&ExecutionContext) -> HookOutcome + Send + Sync + 'static,
) -> Arc<dyn Hook> {
    Arc::new(FnHook { name: name.into(), f })
}

struct Registration {
    kind: HookKind,
    hook: Arc<dyn Hook>,
}

/// Registers and drives hooks around pool operations.
///
/// Default hooks (registered via [`HookManager::with_default_hooks`]) run
/// in registration order ahead of user-registered custom hooks, which run
/// in the order they were added under their own name key.
pub struct HookManager {
    enabled: RwLock<bool>,
    default_hooks: Mutex<Vec<Registration>>,
    custom_hooks: Mutex<HashMap<String, Registration>>,
    custom_order: Mutex<Vec<String>>,
    hook_timeout: Duration,
}

impl HookManager {
    pub fn new(hook_timeout: Duration) -> Self {
        Self {
            enabled: RwLock::new(true),
            default_hooks: Mutex::new(Vec::new()),
            custom_hooks: Mutex::new(HashMap::new()),
            custom_order: Mutex::new(Vec::new()),
            hook_timeout,
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        *self.enabled.write() = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        *self.enabled.read()
    }

    pub fn register_default(&self, kind: HookKind, hook: Arc<dyn Hook>) {
        self.default_hooks.lock().push(Registration { kind, hook });
    }

    /// Registers or replaces a named custom hook (`spec.md` §6: custom
    /// hooks are addressed by name, default hooks are not). `spec.md`
    /// §4.5: "Register rejects null hooks / empty names" — a blank name
    /// is a no-op rather than a registered, unaddressable hook.
    pub fn register_custom(&self, name: impl Into<String>, kind: HookKind, hook: Arc<dyn Hook>) {
        let name = name.into();
        if name.is_empty() {
            return;
        }
        let mut order = self.custom_order.lock();
        if !order.contains(&name) {
            order.push(name.clone());
        }
        self.custom_hooks.lock().insert(name, Registration { kind, hook });
    }

    pub fn unregister_custom(&self, name: &str) {
        self.custom_hooks.lock().remove(name);
        self.custom_order.lock().retain(|n| n != name);
    }

    /// Deep-copies the currently registered hook names for kind `kind`
    /// (`spec.md` §6: `ListHooks` "returns a defensive copy").
    pub fn list_hooks(&self, kind: HookKind) -> Vec<String>
    where
        HookKind: PartialEq,
    {
        let mut names: Vec<String> = self
            .default_hooks
            .lock()
            .iter()
            .filter(|r| r.kind == kind)
            .map(|r| r.hook.name().to_owned())
            .collect();
        let custom = self.custom_hooks.lock();
        for name in self.custom_order.lock().iter() {
            if let Some(reg) = custom.get(name) {
                if reg.kind == kind {
                    names.push(name.clone());
                }
            }
        }
        names
    }

    /// Runs every hook registered for `kind` in order, stopping at the
    /// first non-`Continue` outcome.
    ///
    /// Each hook runs inside its own task so a panicking hook can't bring
    /// down the calling operation; the task is additionally bounded by
    /// `hook_timeout` (`spec.md` §4.5: "each hook invocation is wrapped in
    /// its own timeout" / "a panicking hook must not crash the caller").
    pub async fn execute(&self, kind: HookKind, ctx: ExecutionContext) -> Result<(), Error>
    where
        HookKind: PartialEq,
    {
        if !self.is_enabled() {
            return Ok(());
        }

        let hooks: Vec<Arc<dyn Hook>> = {
            let mut matched: Vec<Arc<dyn Hook>> = self
                .default_hooks
                .lock()
                .iter()
                .filter(|r| r.kind == kind)
                .map(|r| r.hook.clone())
                .collect();
            let custom = self.custom_hooks.lock();
            for name in self.custom_order.lock().iter() {
                if let Some(reg) = custom.get(name) {
                    if reg.kind == kind {
                        matched.push(reg.hook.clone());
                    }
                }
            }
            matched
        };

        for hook in hooks {
            let ctx = ctx.clone();
            let hook = hook.clone();
            let future = async move { hook.call(&ctx).await };
            let join = tokio::spawn(future);
            let outcome = tokio::time::timeout(self.hook_timeout, join).await;
            match outcome {
                Err(_) => return Err(Error::HookTimeout(self.hook_timeout)),
                Ok(Err(join_err)) => {
                    if join_err.is_panic() {
                        return Err(Error::HookPanic(join_err.to_string()));
                    }
                    return Err(Error::HookPanic(format!("hook task canceled: {join_err}")));
                }
                Ok(Ok(HookOutcome::Continue)) => continue,
                Ok(Ok(HookOutcome::StopWithError(err))) => return Err(err),
                Ok(Ok(HookOutcome::StopSilently)) => return Err(Error::HookStopRequested),
            }
        }
        Ok(())
    }
}

impl PartialEq for HookKind {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (HookKind::Custom(a), HookKind::Custom(b)) => a == b,
            (a, b) => std::mem::discriminant(a) == std::mem::discriminant(b),
        }
    }
}

/// Builds a manager with the set of built-in hooks `spec.md` §4.5
/// describes: log-on-error, slow-query warning, and an exec audit hook.
pub fn default_hook_manager(hook_timeout: Duration) -> HookManager {
    let manager = HookManager::new(hook_timeout);

    manager.register_default(
        HookKind::OnError,
        sync_hook("log-on-error", |ctx| {
            if let Some(message) = &ctx.error {
                tracing::error!(operation = ctx.operation, error = %message, "operation failed");
            }
            HookOutcome::Continue
        }),
    );

    const SLOW_QUERY_THRESHOLD: Duration = Duration::from_secs(5);
    manager.register_default(
        HookKind::AfterQuery,
        sync_hook("slow-query-warning", |ctx| {
            if let Some(duration) = ctx.duration {
                if duration > SLOW_QUERY_THRESHOLD {
                    tracing::warn!(operation = ctx.operation, ?duration, "slow query");
                }
            }
            HookOutcome::Continue
        }),
    );

    manager.register_default(
        HookKind::BeforeExec,
        sync_hook("pre-exec-audit", |ctx| {
            if ctx.operation == "exec" {
                tracing::debug!(tenant = ?ctx.tenant_id, "exec audited");
            }
            HookOutcome::Continue
        }),
    );

    manager
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_manager_skips_all_hooks() {
        let manager = HookManager::new(Duration::from_secs(1));
        manager.set_enabled(false);
        manager.register_default(
            HookKind::BeforeQuery,
            sync_hook("should-not-run", |_| HookOutcome::StopWithError(Error::HookStopRequested)),
        );
        assert!(manager.execute(HookKind::BeforeQuery, ExecutionContext::new("query")).await.is_ok());
    }

    #[tokio::test]
    async fn error_outcome_aborts_with_original_error() {
        let manager = HookManager::new(Duration::from_secs(1));
        manager.register_default(
            HookKind::BeforeQuery,
            sync_hook("reject", |_| HookOutcome::StopWithError(Error::ValidationFailed("nope".into()))),
        );
        let err = manager.execute(HookKind::BeforeQuery, ExecutionContext::new("query")).await.unwrap_err();
        assert!(matches!(err, Error::ValidationFailed(_)));
    }

    #[tokio::test]
    async fn silent_stop_maps_to_stop_requested_error() {
        let manager = HookManager::new(Duration::from_secs(1));
        manager.register_default(HookKind::BeforeQuery, sync_hook("halt", |_| HookOutcome::StopSilently));
        let err = manager.execute(HookKind::BeforeQuery, ExecutionContext::new("query")).await.unwrap_err();
        assert!(matches!(err, Error::HookStopRequested));
    }

    #[tokio::test]
    async fn hook_timeout_is_reported() {
        struct SleepyHook;
        #[async_trait]
        impl Hook for SleepyHook {
            fn name(&self) -> &str {
                "sleepy"
            }
            async fn call(&self, _ctx: &ExecutionContext) -> HookOutcome {
                tokio::time::sleep(Duration::from_millis(50)).await;
                HookOutcome::Continue
            }
        }
        let manager = HookManager::new(Duration::from_millis(10));
        manager.register_default(HookKind::BeforeQuery, Arc::new(SleepyHook));
        let err = manager.execute(HookKind::BeforeQuery, ExecutionContext::new("query")).await.unwrap_err();
        assert!(matches!(err, Error::HookTimeout(_)));
    }

    #[tokio::test]
    async fn panicking_hook_is_isolated_and_reported() {
        struct PanicHook;
        #[async_trait]
        impl Hook for PanicHook {
            fn name(&self) -> &str {
                "panics"
            }
            async fn call(&self, _ctx: &ExecutionContext) -> HookOutcome {
                panic!("boom");
            }
        }
        let manager = HookManager::new(Duration::from_secs(1));
        manager.register_default(HookKind::BeforeQuery, Arc::new(PanicHook));
        let err = manager.execute(HookKind::BeforeQuery, ExecutionContext::new("query")).await.unwrap_err();
        assert!(matches!(err, Error::HookPanic(_)));
    }

    #[test]
    fn list_hooks_returns_defensive_copy_of_names() {
        let manager = HookManager::new(Duration::from_secs(1));
        manager.register_default(HookKind::BeforeQuery, sync_hook("a", |_| HookOutcome::Continue));
        manager.register_custom("b", HookKind::BeforeQuery, sync_hook("b", |_| HookOutcome::Continue));
        let names = manager.list_hooks(HookKind::BeforeQuery);
        assert_eq!(names, vec!["a".to_owned(), "b".to_owned()]);
    }

    #[test]
    fn register_custom_rejects_empty_name() {
        let manager = HookManager::new(Duration::from_secs(1));
        manager.register_custom("", HookKind::BeforeQuery, sync_hook("unreachable", |_| HookOutcome::Continue));
        assert!(manager.list_hooks(HookKind::BeforeQuery).is_empty());
    }

    #[test]
    fn default_hook_manager_preregisters_built_ins() {
        let manager = default_hook_manager(Duration::from_secs(1));
        assert_eq!(manager.list_hooks(HookKind::OnError), vec!["log-on-error".to_owned()]);
        assert_eq!(manager.list_hooks(HookKind::AfterQuery), vec!["slow-query-warning".to_owned()]);
        assert_eq!(manager.list_hooks(HookKind::BeforeExec), vec!["pre-exec-audit".to_owned()]);
    }
}
