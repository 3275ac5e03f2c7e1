//! Synchronous subscribe/unsubscribe notification registry.
//!
//! Shared by the document, awareness and AI overlay so every UI layer
//! consumes changes the same way: callbacks run in subscription order,
//! on the caller's thread, right after the change is applied.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

type Callback<E> = Box<dyn FnMut(&E) + Send>;

pub struct Observers<E> {
    next_id: u64,
    callbacks: Vec<(SubscriptionId, Callback<E>)>,
}

impl<E> Observers<E> {
    pub fn new() -> Self {
        Self {
            next_id: 0,
            callbacks: Vec::new(),
        }
    }

    pub fn subscribe<F>(&mut self, callback: F) -> SubscriptionId
    where
        F: FnMut(&E) + Send + 'static,
    {
        self.next_id += 1;
        let id = SubscriptionId(self.next_id);
        self.callbacks.push((id, Box::new(callback)));
        id
    }

    /// Returns `false` if the subscription was already gone.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.callbacks.len();
        self.callbacks.retain(|(sid, _)| *sid != id);
        self.callbacks.len() != before
    }

    pub fn emit(&mut self, event: &E) {
        for (_, callback) in &mut self.callbacks {
            callback(event);
        }
    }

    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }
}

impl<E> Default for Observers<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> fmt::Debug for Observers<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observers")
            .field("subscriptions", &self.callbacks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_emit_reaches_subscribers_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut observers = Observers::new();
        for tag in ["a", "b"] {
            let seen = seen.clone();
            observers.subscribe(move |n: &u32| seen.lock().unwrap().push(format!("{tag}{n}")));
        }
        observers.emit(&1);
        assert_eq!(*seen.lock().unwrap(), vec!["a1", "b1"]);
    }

    #[test]
    fn test_unsubscribe() {
        let count = Arc::new(Mutex::new(0));
        let mut observers = Observers::new();
        let c = count.clone();
        let id = observers.subscribe(move |_: &()| *c.lock().unwrap() += 1);
        observers.emit(&());
        assert!(observers.unsubscribe(id));
        assert!(!observers.unsubscribe(id));
        observers.emit(&());
        assert_eq!(*count.lock().unwrap(), 1);
        assert!(observers.is_empty());
    }
}
