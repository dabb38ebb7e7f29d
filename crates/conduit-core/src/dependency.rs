//! Dependency resolver: ordered, scoped provider acquisition with guaranteed
//! reverse-order teardown on every exit path.

use std::any::Any;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex as AsyncMutex;

use crate::error::RpcError;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
type AnyValue = Box<dyn Any + Send + Sync>;
type TeardownFn = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// What a provider hands back: the resolved value plus an optional teardown
/// closure run when the request scope closes.
pub struct Acquired {
    pub value: AnyValue,
    pub teardown: Option<TeardownFn>,
}

impl Acquired {
    pub fn value_only(value: AnyValue) -> Self {
        Acquired {
            value,
            teardown: None,
        }
    }

    pub fn with_teardown(value: AnyValue, teardown: TeardownFn) -> Self {
        Acquired {
            value,
            teardown: Some(teardown),
        }
    }
}

/// A dependency provider bound to an endpoint.
///
/// Covers all four provider kinds from the data model: a plain function and
/// an async function both return `teardown: None`; a generator and an async
/// generator both return `teardown: Some(..)`. The distinction lives in how
/// the provider is constructed (see the `provider_fn`/`provider_generator`
/// helpers below), not in the trait itself.
pub trait Provider: Send + Sync {
    /// A stable name for this binding, used as the dependency's key within a
    /// request scope and in diagnostics.
    fn name(&self) -> &str;

    fn acquire(&self) -> BoxFuture<'_, Result<Acquired, RpcError>>;
}

/// Build a `Provider` from a plain synchronous or async function with no
/// teardown step.
pub fn provider_fn<F, Fut, T>(name: impl Into<String>, f: F) -> Arc<dyn Provider>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, RpcError>> + Send + 'static,
    T: Send + Sync + 'static,
{
    struct FnProvider<F> {
        name: String,
        f: F,
    }

    impl<F, Fut, T> Provider for FnProvider<F>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, RpcError>> + Send + 'static,
        T: Send + Sync + 'static,
    {
        fn name(&self) -> &str {
            &self.name
        }

        fn acquire(&self) -> BoxFuture<'_, Result<Acquired, RpcError>> {
            let fut = (self.f)();
            Box::pin(async move {
                let value = fut.await?;
                Ok(Acquired::value_only(Box::new(value)))
            })
        }
    }

    Arc::new(FnProvider {
        name: name.into(),
        f,
    })
}

/// Build a `Provider` from a generator-style function: it yields a value and
/// a teardown closure run when the request scope closes, regardless of how
/// the scope exits (success, error, or cancellation).
pub fn provider_generator<F, Fut, T, Td, TdFut>(
    name: impl Into<String>,
    f: F,
) -> Arc<dyn Provider>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(T, Td), RpcError>> + Send + 'static,
    T: Send + Sync + 'static,
    Td: FnOnce() -> TdFut + Send + 'static,
    TdFut: Future<Output = ()> + Send + 'static,
{
    struct GeneratorProvider<F> {
        name: String,
        f: F,
    }

    impl<F, Fut, T, Td, TdFut> Provider for GeneratorProvider<F>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(T, Td), RpcError>> + Send + 'static,
        T: Send + Sync + 'static,
        Td: FnOnce() -> TdFut + Send + 'static,
        TdFut: Future<Output = ()> + Send + 'static,
    {
        fn name(&self) -> &str {
            &self.name
        }

        fn acquire(&self) -> BoxFuture<'_, Result<Acquired, RpcError>> {
            let fut = (self.f)();
            Box::pin(async move {
                let (value, teardown) = fut.await?;
                let teardown: TeardownFn = Box::new(move || {
                    Box::pin(teardown()) as BoxFuture<'static, ()>
                });
                Ok(Acquired::with_teardown(Box::new(value), teardown))
            })
        }
    }

    Arc::new(GeneratorProvider {
        name: name.into(),
        f,
    })
}

/// Scoped instances resolved for one request, released in reverse
/// acquisition order when the scope ends.
///
/// Cheap to clone (an `Arc` bundle): a handler whose reply is a lazy stream
/// needs to hold on to its dependencies for the stream's whole lifetime,
/// which may outlive the call that created the handler future, so the
/// engine hands out clones rather than a borrow. Release is idempotent and
/// guarded by an atomic flag so a stream's natural end racing a transport
/// cancellation still tears down exactly once.
#[derive(Clone)]
pub struct DependencyScope {
    names: Arc<Vec<String>>,
    values: Arc<Vec<AnyValue>>,
    teardowns: Arc<AsyncMutex<Vec<Option<TeardownFn>>>>,
    released: Arc<AtomicBool>,
}

impl DependencyScope {
    fn empty() -> Self {
        DependencyScope {
            names: Arc::new(Vec::new()),
            values: Arc::new(Vec::new()),
            teardowns: Arc::new(AsyncMutex::new(Vec::new())),
            released: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Resolve every binding in order, tearing down everything already
    /// acquired if a later binding fails. Returns the fully resolved scope
    /// on success.
    pub async fn resolve(bindings: &[Arc<dyn Provider>]) -> Result<Self, RpcError> {
        let mut names = Vec::with_capacity(bindings.len());
        let mut values = Vec::with_capacity(bindings.len());
        let mut teardowns = Vec::with_capacity(bindings.len());

        for provider in bindings {
            match provider.acquire().await {
                Ok(acquired) => {
                    names.push(provider.name().to_string());
                    values.push(acquired.value);
                    teardowns.push(acquired.teardown);
                }
                Err(err) => {
                    let partial = DependencyScope {
                        names: Arc::new(names),
                        values: Arc::new(values),
                        teardowns: Arc::new(AsyncMutex::new(teardowns)),
                        released: Arc::new(AtomicBool::new(false)),
                    };
                    partial.release().await;
                    return Err(err);
                }
            }
        }

        Ok(DependencyScope {
            names: Arc::new(names),
            values: Arc::new(values),
            teardowns: Arc::new(AsyncMutex::new(teardowns)),
            released: Arc::new(AtomicBool::new(false)),
        })
    }

    /// A scope with no bindings, for endpoints that declare no dependencies.
    pub fn none() -> Self {
        Self::empty()
    }

    /// Look up a resolved dependency by binding name and downcast it.
    pub fn get<T: 'static>(&self, name: &str) -> Option<&T> {
        let idx = self.names.iter().position(|n| n == name)?;
        self.values[idx].downcast_ref::<T>()
    }

    /// Tear down every acquired dependency in reverse order. Safe to call
    /// from more than one place; only the first call runs teardown.
    pub async fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut teardowns = self.teardowns.lock().await;
        while let Some(teardown) = teardowns.pop() {
            if let Some(teardown) = teardown {
                teardown().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio_test_lite::test]
    async fn resolves_in_order_and_releases_in_reverse() {
        let log = Arc::new(parking_lot::Mutex::new(Vec::<&'static str>::new()));

        let log_a = log.clone();
        let a = provider_generator("a", move || {
            let log_a = log_a.clone();
            async move {
                log_a.lock().push("acquire a");
                let log_a2 = log_a.clone();
                Ok((1u32, move || async move {
                    log_a2.lock().push("release a");
                }))
            }
        });

        let log_b = log.clone();
        let b = provider_generator("b", move || {
            let log_b = log_b.clone();
            async move {
                log_b.lock().push("acquire b");
                let log_b2 = log_b.clone();
                Ok((2u32, move || async move {
                    log_b2.lock().push("release b");
                }))
            }
        });

        let scope = DependencyScope::resolve(&[a, b]).await.unwrap();
        assert_eq!(*scope.get::<u32>("a").unwrap(), 1);
        assert_eq!(*scope.get::<u32>("b").unwrap(), 2);

        scope.release().await;

        let events = log.lock().clone();
        assert_eq!(
            events,
            vec!["acquire a", "acquire b", "release b", "release a"]
        );
    }

    #[tokio_test_lite::test]
    async fn failure_tears_down_already_acquired_dependencies() {
        let released = Arc::new(AtomicUsize::new(0));

        let released_clone = released.clone();
        let a = provider_generator("a", move || {
            let released_clone = released_clone.clone();
            async move {
                Ok((1u32, move || async move {
                    released_clone.fetch_add(1, Ordering::SeqCst);
                }))
            }
        });

        let b: Arc<dyn Provider> =
            provider_fn("b", || async { Err::<u32, RpcError>(RpcError::Internal) });

        let result = DependencyScope::resolve(&[a, b]).await;
        assert!(result.is_err());
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }
}
