//! Observer arena with stable unsubscribe tokens.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Registry<T> {
    next_token: u64,
    entries: Vec<(u64, Callback<T>)>,
}

impl<T> Registry<T> {
    fn contains(&self, token: u64) -> bool {
        self.entries.iter().any(|(t, _)| *t == token)
    }

    fn remove(&mut self, token: u64) {
        self.entries.retain(|(t, _)| *t != token);
    }
}

/// Ordered list of listeners notified synchronously.
///
/// Listeners run in subscription order without the registry lock held, so a
/// listener may subscribe or unsubscribe while a notification is running. A
/// listener removed mid-dispatch is skipped for the rest of that dispatch.
pub struct ObserverList<T> {
    registry: Arc<Mutex<Registry<T>>>,
}

impl<T: 'static> ObserverList<T> {
    /// Create an empty list.
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry {
                next_token: 0,
                entries: Vec::new(),
            })),
        }
    }

    /// Register a listener. It stays registered until the returned handle is
    /// dropped or unsubscribed.
    pub fn subscribe(&self, callback: impl Fn(&T) + Send + Sync + 'static) -> Subscription {
        let token = {
            let mut registry = lock(&self.registry);
            registry.next_token += 1;
            let token = registry.next_token;
            registry.entries.push((token, Arc::new(callback)));
            token
        };

        let weak: Weak<Mutex<Registry<T>>> = Arc::downgrade(&self.registry);
        Subscription {
            token,
            detach: Some(Box::new(move || {
                if let Some(registry) = weak.upgrade() {
                    lock(&registry).remove(token);
                }
            })),
        }
    }

    /// Invoke every listener with `value`.
    pub fn notify(&self, value: &T) {
        let snapshot: Vec<(u64, Callback<T>)> = lock(&self.registry).entries.clone();
        for (token, callback) in snapshot {
            if lock(&self.registry).contains(token) {
                callback(value);
            }
        }
    }

    /// Number of registered listeners.
    pub fn len(&self) -> usize {
        lock(&self.registry).entries.len()
    }

    /// Whether no listener is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: 'static> Default for ObserverList<T> {
    fn default() -> Self {
        Self::new()
    }
}

// The registry only holds callbacks, so a panic in another holder leaves it
// consistent.
fn lock<T>(registry: &Mutex<Registry<T>>) -> MutexGuard<'_, Registry<T>> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle to a registered listener.
///
/// Dropping the handle unsubscribes the listener.
#[must_use = "dropping a Subscription unsubscribes the listener"]
pub struct Subscription {
    token: u64,
    detach: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Stable token of this subscription.
    pub fn token(&self) -> u64 {
        self.token
    }

    /// Remove the listener now.
    pub fn unsubscribe(mut self) {
        self.detach_now();
    }

    fn detach_now(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.detach_now();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("token", &self.token)
            .field("active", &self.detach.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_notify_in_subscription_order() {
        let list = ObserverList::<u32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let subs: Vec<_> = (0..3)
            .map(|i| {
                let seen = Arc::clone(&seen);
                list.subscribe(move |value: &u32| seen.lock().unwrap().push((i, *value)))
            })
            .collect();

        list.notify(&7);
        assert_eq!(*seen.lock().unwrap(), vec![(0, 7), (1, 7), (2, 7)]);
        assert_eq!(subs.len(), 3);
    }

    #[test]
    fn test_drop_unsubscribes() {
        let list = ObserverList::<()>::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let sub = list.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        list.notify(&());
        drop(sub);
        list.notify(&());

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(list.is_empty());
    }

    #[test]
    fn test_unsubscribe_during_dispatch_skips_later_listener() {
        let list = ObserverList::<()>::new();
        let second_calls = Arc::new(AtomicUsize::new(0));
        let victim: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

        let slot = Arc::clone(&victim);
        let _first = list.subscribe(move |_| {
            if let Some(sub) = slot.lock().unwrap().take() {
                sub.unsubscribe();
            }
        });

        let counter = Arc::clone(&second_calls);
        let second = list.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        *victim.lock().unwrap() = Some(second);

        list.notify(&());
        assert_eq!(second_calls.load(Ordering::SeqCst), 0);
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn test_tokens_are_stable_and_unique() {
        let list = ObserverList::<()>::new();
        let a = list.subscribe(|_| {});
        let b = list.subscribe(|_| {});
        assert_ne!(a.token(), b.token());

        let b_token = b.token();
        a.unsubscribe();
        let c = list.subscribe(|_| {});
        assert_ne!(c.token(), b_token);
        assert_eq!(list.len(), 2);
    }
}
