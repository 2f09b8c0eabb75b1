use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::data::remote_store::{ListenerDetach, RemoteStore, Snapshot, bounded};
use crate::domain::error::SyncError;

pub const GLOBAL_SCOPE: &str = "global";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionKey {
    pub resource_path: String,
    pub scope: String,
}

/// После терминальной ошибки подписка неактивна и сама не восстанавливается.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    key: SubscriptionKey,
    active: Arc<AtomicBool>,
    errors: Option<oneshot::Receiver<SyncError>>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> &SubscriptionKey {
        &self.key
    }

    pub fn resource_path(&self) -> &str {
        &self.key.resource_path
    }

    pub fn scope(&self) -> &str {
        &self.key.scope
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub async fn terminal_error(&mut self) -> Option<SyncError> {
        let errors = self.errors.take()?;
        errors.await.ok()
    }
}

struct ActiveListener {
    id: u64,
    active: Arc<AtomicBool>,
    detach: Arc<dyn ListenerDetach>,
    task: JoinHandle<()>,
}

impl ActiveListener {
    fn shutdown(self) {
        self.active.store(false, Ordering::SeqCst);
        self.detach.detach();
        self.task.abort();
    }
}

type Registry = Arc<Mutex<HashMap<SubscriptionKey, ActiveListener>>>;

/// Держит не больше одного живого слушателя на пару (путь, область).
pub struct SubscriptionManager<S: RemoteStore> {
    store: Arc<S>,
    attach_timeout: Duration,
    registry: Registry,
    next_id: AtomicU64,
}

impl<S: RemoteStore> SubscriptionManager<S> {
    pub fn new(store: Arc<S>, attach_timeout: Duration) -> Self {
        Self {
            store,
            attach_timeout,
            registry: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Прежняя подписка на ту же пару (путь, область) снимается до подключения новой.
    pub async fn subscribe<F>(
        &self,
        resource_path: &str,
        scope: &str,
        on_update: F,
    ) -> Result<Subscription, SyncError>
    where
        F: Fn(Snapshot) + Send + Sync + 'static,
    {
        let key = SubscriptionKey {
            resource_path: resource_path.to_string(),
            scope: scope.to_string(),
        };

        let previous = lock(&self.registry).remove(&key);
        if let Some(previous) = previous {
            debug!(resource_path, scope, id = previous.id, "replacing existing subscription");
            previous.shutdown();
        }

        let stream = bounded(
            self.attach_timeout,
            "listen attach",
            self.store.listen(resource_path),
        )
        .await?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let active = Arc::new(AtomicBool::new(true));
        let detach: Arc<dyn ListenerDetach> = Arc::from(stream.detach);
        let (error_tx, error_rx) = oneshot::channel();

        let task = tokio::spawn(pump(
            stream.updates,
            on_update,
            Pump {
                id,
                key: key.clone(),
                active: active.clone(),
                detach: detach.clone(),
                registry: self.registry.clone(),
                error_tx,
            },
        ));

        let raced = lock(&self.registry).insert(
            key.clone(),
            ActiveListener {
                id,
                active: active.clone(),
                detach,
                task,
            },
        );
        if let Some(raced) = raced {
            raced.shutdown();
        }

        info!(resource_path, scope, id, "subscription attached");
        Ok(Subscription {
            id,
            key,
            active,
            errors: Some(error_rx),
        })
    }

    pub fn unsubscribe(&self, subscription: &Subscription) -> bool {
        subscription.active.store(false, Ordering::SeqCst);

        let mut registry = lock(&self.registry);
        let owned = registry
            .get(&subscription.key)
            .is_some_and(|listener| listener.id == subscription.id);
        if !owned {
            return false;
        }
        if let Some(listener) = registry.remove(&subscription.key) {
            listener.shutdown();
        }
        info!(
            resource_path = %subscription.key.resource_path,
            scope = %subscription.key.scope,
            id = subscription.id,
            "subscription detached"
        );
        true
    }

    pub fn unsubscribe_scope(&self, scope: &str) -> usize {
        let mut registry = lock(&self.registry);
        let keys: Vec<SubscriptionKey> = registry
            .keys()
            .filter(|key| key.scope == scope)
            .cloned()
            .collect();
        for key in &keys {
            if let Some(listener) = registry.remove(key) {
                listener.shutdown();
            }
        }
        keys.len()
    }

    pub fn unsubscribe_all(&self) -> usize {
        let drained: Vec<ActiveListener> = lock(&self.registry).drain().map(|(_, l)| l).collect();
        let count = drained.len();
        for listener in drained {
            listener.shutdown();
        }
        count
    }

    pub fn active_count(&self) -> usize {
        lock(&self.registry).len()
    }

    pub fn is_subscribed(&self, resource_path: &str, scope: &str) -> bool {
        lock(&self.registry).contains_key(&SubscriptionKey {
            resource_path: resource_path.to_string(),
            scope: scope.to_string(),
        })
    }
}

impl<S: RemoteStore> Drop for SubscriptionManager<S> {
    fn drop(&mut self) {
        let detached = self.unsubscribe_all();
        if detached > 0 {
            debug!(detached, "detached listeners on teardown");
        }
    }
}

struct Pump {
    id: u64,
    key: SubscriptionKey,
    active: Arc<AtomicBool>,
    detach: Arc<dyn ListenerDetach>,
    registry: Registry,
    error_tx: oneshot::Sender<SyncError>,
}

async fn pump<F>(
    mut updates: mpsc::UnboundedReceiver<Result<Snapshot, SyncError>>,
    on_update: F,
    ctx: Pump,
) where
    F: Fn(Snapshot) + Send + Sync + 'static,
{
    while let Some(update) = updates.recv().await {
        match update {
            Ok(snapshot) => on_update(snapshot),
            Err(err) => {
                warn!(
                    resource_path = %ctx.key.resource_path,
                    scope = %ctx.key.scope,
                    error = %err,
                    "subscription stream failed"
                );
                ctx.active.store(false, Ordering::SeqCst);
                ctx.detach.detach();
                {
                    let mut registry = lock(&ctx.registry);
                    if registry
                        .get(&ctx.key)
                        .is_some_and(|listener| listener.id == ctx.id)
                    {
                        registry.remove(&ctx.key);
                    }
                }
                let _ = ctx.error_tx.send(err);
                return;
            }
        }
    }
    ctx.active.store(false, Ordering::SeqCst);
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
