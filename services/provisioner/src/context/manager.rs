//! Memoizing context manager.
//!
//! Each kind has a slot holding a shared build future. The slot mutex is held
//! only to clone the existing future or start a new one; construction runs on
//! its own task, so callers of other kinds never wait on it and a caller that
//! gives up does not cancel the build for everyone else.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::{
    ComputeOptions, ContextFactory, ContextKind, ProviderHandle, ResourceContext,
};
use crate::error::ContextError;

type ContextFuture = Shared<BoxFuture<'static, Result<ResourceContext, ContextError>>>;

type Slot = Mutex<Option<ContextFuture>>;

struct Inner {
    factory: Arc<dyn ContextFactory>,
    compute: Slot,
    lazy_compute: Slot,
    credential_store: Slot,
    closed: AtomicBool,
}

impl Inner {
    fn slot(&self, kind: ContextKind) -> &Slot {
        match kind {
            ContextKind::Compute => &self.compute,
            ContextKind::LazyCompute => &self.lazy_compute,
            ContextKind::CredentialStore => &self.credential_store,
        }
    }
}

/// Builds and memoizes one [`ResourceContext`] per [`ContextKind`].
#[derive(Clone)]
pub struct ContextManager {
    inner: Arc<Inner>,
}

impl ContextManager {
    pub fn new(factory: Arc<dyn ContextFactory>) -> Self {
        Self {
            inner: Arc::new(Inner {
                factory,
                compute: Mutex::new(None),
                lazy_compute: Mutex::new(None),
                credential_store: Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Get the context of `kind`, building it on first demand.
    ///
    /// Concurrent callers share one construction and receive the same handle
    /// or the same error. A failed build keeps being served until
    /// [`reset`](Self::reset).
    pub async fn get_context(&self, kind: ContextKind) -> Result<ResourceContext, ContextError> {
        if self.is_closed() {
            return Err(ContextError::Closed);
        }

        let future = {
            let mut slot = self.inner.slot(kind).lock().await;
            // close() may have drained this slot while we waited for the lock.
            if self.is_closed() {
                return Err(ContextError::Closed);
            }
            match slot.as_ref() {
                Some(existing) => existing.clone(),
                None => {
                    let started = self.start_build(kind);
                    *slot = Some(started.clone());
                    started
                }
            }
        };

        future.await
    }

    /// Drop a failed build so the next caller retries.
    ///
    /// Returns true if a failed build was cleared. Successful and in-flight
    /// builds are left alone.
    pub async fn reset(&self, kind: ContextKind) -> bool {
        let mut slot = self.inner.slot(kind).lock().await;
        let failed = matches!(
            slot.as_ref().and_then(|future| future.peek()),
            Some(Err(_))
        );
        if failed {
            info!(kind = %kind, "Clearing failed context build");
            *slot = None;
        }
        failed
    }

    /// Whether a context of `kind` was built successfully.
    pub async fn is_built(&self, kind: ContextKind) -> bool {
        let slot = self.inner.slot(kind).lock().await;
        matches!(slot.as_ref().and_then(|future| future.peek()), Some(Ok(_)))
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Tear down every built context once, compute sessions first.
    ///
    /// A failing teardown is logged and does not stop the others. Returns the
    /// kinds whose teardown failed.
    pub async fn close(&self) -> Vec<ContextKind> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            debug!("Context manager already closed");
            return Vec::new();
        }

        let mut failed = Vec::new();
        for kind in ContextKind::TEARDOWN_ORDER {
            let pending = self.inner.slot(kind).lock().await.take();
            let Some(future) = pending else {
                continue;
            };

            // An in-flight build is allowed to finish so its session can be released.
            let context = match future.await {
                Ok(context) => context,
                Err(e) => {
                    debug!(kind = %kind, error = %e, "Skipping teardown of failed context");
                    continue;
                }
            };

            match context.teardown().await {
                Ok(()) => info!(kind = %kind, "Context torn down"),
                Err(e) => {
                    error!(kind = %kind, error = %e, "Context teardown failed");
                    failed.push(kind);
                }
            }
        }
        failed
    }

    fn start_build(&self, kind: ContextKind) -> ContextFuture {
        let manager = self.clone();
        let task = tokio::spawn(async move { manager.build(kind).await });

        async move {
            match task.await {
                Ok(result) => result,
                Err(e) => Err(ContextError::Aborted {
                    kind,
                    message: e.to_string(),
                }),
            }
        }
        .boxed()
        .shared()
    }

    async fn build(&self, kind: ContextKind) -> Result<ResourceContext, ContextError> {
        info!(kind = %kind, "Building context");
        let start = Instant::now();

        let built = match kind {
            ContextKind::CredentialStore => self
                .inner
                .factory
                .build_credential_store()
                .await
                .map(ProviderHandle::CredentialStore),
            ContextKind::Compute | ContextKind::LazyCompute => {
                let store = self
                    .get_context(ContextKind::CredentialStore)
                    .await?
                    .credential_store()?;
                let options = ComputeOptions {
                    query_images: kind == ContextKind::Compute,
                };
                self.inner
                    .factory
                    .build_compute(options, store)
                    .await
                    .map(ProviderHandle::Compute)
            }
        };

        match built {
            Ok(handle) => {
                info!(
                    kind = %kind,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Context ready"
                );
                Ok(ResourceContext::new(kind, handle))
            }
            Err(e) => {
                warn!(kind = %kind, error = %e, "Context build failed");
                Err(ContextError::Build {
                    kind,
                    message: format!("{e:#}"),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures_util::future::join_all;

    use super::*;
    use crate::context::StaticContextFactory;

    #[tokio::test]
    async fn test_second_call_reuses_context() {
        let factory = Arc::new(StaticContextFactory::new());
        let manager = ContextManager::new(factory.clone());

        let first = manager.get_context(ContextKind::CredentialStore).await.unwrap();
        let second = manager.get_context(ContextKind::CredentialStore).await.unwrap();

        assert!(first.same_session(&second));
        assert_eq!(factory.builds(ContextKind::CredentialStore), 1);
    }

    #[tokio::test]
    async fn test_compute_pulls_in_credential_store() {
        let factory = Arc::new(StaticContextFactory::new());
        let manager = ContextManager::new(factory.clone());

        manager.get_context(ContextKind::LazyCompute).await.unwrap();

        assert_eq!(factory.builds(ContextKind::LazyCompute), 1);
        assert_eq!(factory.builds(ContextKind::CredentialStore), 1);
        assert!(manager.is_built(ContextKind::CredentialStore).await);
        assert!(!manager.is_built(ContextKind::Compute).await);
    }

    #[tokio::test]
    async fn test_failed_build_is_sticky_until_reset() {
        let factory = Arc::new(StaticContextFactory::new());
        factory.fail_builds(ContextKind::CredentialStore, "no endpoint");
        let manager = ContextManager::new(factory.clone());

        let first = manager.get_context(ContextKind::CredentialStore).await.unwrap_err();
        let second = manager.get_context(ContextKind::CredentialStore).await.unwrap_err();
        assert_eq!(first, second);
        assert_eq!(factory.builds(ContextKind::CredentialStore), 1);

        factory.clear_failure(ContextKind::CredentialStore);
        assert!(manager.reset(ContextKind::CredentialStore).await);
        manager.get_context(ContextKind::CredentialStore).await.unwrap();
        assert_eq!(factory.builds(ContextKind::CredentialStore), 2);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_failed_build() {
        let factory = Arc::new(StaticContextFactory::new().with_build_delay(Duration::from_millis(50)));
        factory.fail_builds(ContextKind::Compute, "quota exceeded");
        let manager = ContextManager::new(factory.clone());

        let results = join_all((0..8).map(|_| manager.get_context(ContextKind::Compute))).await;

        let errors: Vec<ContextError> = results.into_iter().map(Result::unwrap_err).collect();
        assert!(matches!(
            &errors[0],
            ContextError::Build { kind: ContextKind::Compute, message } if message.contains("quota exceeded")
        ));
        assert!(errors.iter().all(|e| *e == errors[0]));
        assert_eq!(factory.builds(ContextKind::Compute), 1);
        assert_eq!(factory.builds(ContextKind::CredentialStore), 1);
    }

    #[tokio::test]
    async fn test_build_racing_close_is_torn_down() {
        let factory = Arc::new(StaticContextFactory::new().with_build_delay(Duration::from_millis(20)));
        let manager = ContextManager::new(factory.clone());

        let (built, failed) = tokio::join!(
            manager.get_context(ContextKind::CredentialStore),
            manager.close()
        );

        assert!(failed.is_empty());
        match built {
            Ok(_) => assert_eq!(factory.credential_store().close_calls(), 1),
            Err(e) => {
                assert_eq!(e, ContextError::Closed);
                assert_eq!(factory.builds(ContextKind::CredentialStore), 0);
            }
        }
        assert_eq!(
            manager.get_context(ContextKind::CredentialStore).await.unwrap_err(),
            ContextError::Closed
        );
    }

    #[tokio::test]
    async fn test_reset_keeps_successful_context() {
        let factory = Arc::new(StaticContextFactory::new());
        let manager = ContextManager::new(factory.clone());

        manager.get_context(ContextKind::CredentialStore).await.unwrap();
        assert!(!manager.reset(ContextKind::CredentialStore).await);
        manager.get_context(ContextKind::CredentialStore).await.unwrap();

        assert_eq!(factory.builds(ContextKind::CredentialStore), 1);
    }

    #[tokio::test]
    async fn test_store_failure_fails_compute() {
        let factory = Arc::new(StaticContextFactory::new());
        factory.fail_builds(ContextKind::CredentialStore, "denied");
        let manager = ContextManager::new(factory.clone());

        let err = manager.get_context(ContextKind::Compute).await.unwrap_err();
        assert!(matches!(
            err,
            ContextError::Build {
                kind: ContextKind::CredentialStore,
                ..
            }
        ));
        assert_eq!(factory.builds(ContextKind::Compute), 0);
    }

    #[tokio::test]
    async fn test_close_tears_down_once_and_rejects_callers() {
        let factory = Arc::new(StaticContextFactory::new());
        let manager = ContextManager::new(factory.clone());
        manager.get_context(ContextKind::Compute).await.unwrap();

        assert!(manager.close().await.is_empty());
        assert!(manager.close().await.is_empty());

        assert_eq!(factory.compute().close_calls(), 1);
        assert_eq!(factory.credential_store().close_calls(), 1);
        assert_eq!(
            manager.get_context(ContextKind::Compute).await.unwrap_err(),
            ContextError::Closed
        );
    }

    #[tokio::test]
    async fn test_failing_teardown_does_not_block_others() {
        let factory = Arc::new(StaticContextFactory::new());
        factory.compute().fail_close();
        let manager = ContextManager::new(factory.clone());
        manager.get_context(ContextKind::Compute).await.unwrap();

        let failed = manager.close().await;

        assert_eq!(failed, vec![ContextKind::Compute]);
        assert_eq!(factory.credential_store().close_calls(), 1);
    }

    #[tokio::test]
    async fn test_dropped_caller_does_not_cancel_build() {
        let factory = Arc::new(StaticContextFactory::new().with_build_delay(Duration::from_millis(50)));
        let manager = ContextManager::new(factory.clone());

        let impatient = manager.clone();
        let result = tokio::time::timeout(Duration::from_millis(5), async move {
            impatient.get_context(ContextKind::CredentialStore).await
        })
        .await;
        assert!(result.is_err());

        manager.get_context(ContextKind::CredentialStore).await.unwrap();
        assert_eq!(factory.builds(ContextKind::CredentialStore), 1);
    }
}
