//! Deferred sequences that can be iterated any number of times.
//!
//! A [`Replayable`] wraps a zero-argument producer. The producer runs at
//! most once, on first realization; its output is cached in a buffer
//! shared by every clone, so a fetched page or a path match can be handed
//! to several independent extraction rules without re-running the work.
//!
//! ```rust
//! use commcare_sync_core::replay::Replayable;
//!
//! let seq = Replayable::new(|| vec![1, 2, 3]);
//! assert_eq!(seq.iterate().unwrap().sum::<i32>(), 6);
//! assert_eq!(seq.to_list().unwrap(), vec![1, 2, 3]);
//! ```

use std::fmt;
use std::sync::{Arc, Mutex, OnceLock};

use serde::ser::{Serialize, SerializeSeq, Serializer};

pub use crate::error::ReplayError;

type Producer<T> = Box<dyn FnOnce() -> Result<Vec<T>, ReplayError> + Send>;

struct Inner<T> {
    producer: Mutex<Option<Producer<T>>>,
    realized: OnceLock<Result<Vec<T>, ReplayError>>,
}

/// A side-effect-once, restartable sequence.
///
/// Cloning is cheap and shares the materialization.
pub struct Replayable<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Replayable<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Replayable<T> {
    /// Wrap an infallible producer.
    pub fn new<F, I>(producer: F) -> Self
    where
        F: FnOnce() -> I + Send + 'static,
        I: IntoIterator<Item = T>,
    {
        Self::from_producer(Box::new(move || Ok(producer().into_iter().collect())))
    }

    /// Wrap a fallible producer. The error is rendered into a
    /// [`ReplayError`] and returned to every caller that forces
    /// realization.
    pub fn try_new<F, I, E>(producer: F) -> Self
    where
        F: FnOnce() -> Result<I, E> + Send + 'static,
        I: IntoIterator<Item = T>,
        E: fmt::Display,
    {
        Self::from_producer(Box::new(move || {
            producer()
                .map(|items| items.into_iter().collect())
                .map_err(|e| ReplayError::new(e.to_string()))
        }))
    }

    /// An already-realized sequence.
    pub fn from_vec(items: Vec<T>) -> Self {
        let realized = OnceLock::new();
        let _ = realized.set(Ok(items));
        Self {
            inner: Arc::new(Inner {
                producer: Mutex::new(None),
                realized,
            }),
        }
    }

    fn from_producer(producer: Producer<T>) -> Self {
        Self {
            inner: Arc::new(Inner {
                producer: Mutex::new(Some(producer)),
                realized: OnceLock::new(),
            }),
        }
    }

    fn realize(&self) -> &Result<Vec<T>, ReplayError> {
        self.inner.realized.get_or_init(|| {
            let producer = self
                .inner
                .producer
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .take();
            match producer {
                Some(produce) => produce(),
                None => Err(ReplayError::new("producer was lost before realization")),
            }
        })
    }

    /// Iterate the full sequence. Every call starts from the beginning.
    pub fn iterate(&self) -> Result<std::slice::Iter<'_, T>, ReplayError> {
        match self.realize() {
            Ok(items) => Ok(items.iter()),
            Err(e) => Err(e.clone()),
        }
    }

    /// The fully realized, ordered sequence.
    pub fn to_list(&self) -> Result<Vec<T>, ReplayError>
    where
        T: Clone,
    {
        self.iterate().map(|items| items.cloned().collect())
    }

    /// Whether the producer has already run.
    pub fn is_realized(&self) -> bool {
        self.inner.realized.get().is_some()
    }
}

impl<T: Serialize> Replayable<T> {
    /// Convert to a plain JSON value, expanding nested replayable
    /// sequences into arrays. Other values use their own `Serialize`.
    pub fn to_plain_value(&self) -> Result<serde_json::Value, ReplayError> {
        serde_json::to_value(self).map_err(|e| ReplayError::new(e.to_string()))
    }
}

impl<T: Serialize> Serialize for Replayable<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let items = self.iterate().map_err(serde::ser::Error::custom)?;
        let mut seq = serializer.serialize_seq(Some(items.len()))?;
        for item in items {
            seq.serialize_element(item)?;
        }
        seq.end()
    }
}

impl<T: fmt::Debug> fmt::Debug for Replayable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.realized.get() {
            Some(Ok(items)) => f.debug_tuple("Replayable").field(items).finish(),
            Some(Err(e)) => f.debug_tuple("Replayable").field(e).finish(),
            None => f.write_str("Replayable(<deferred>)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counted(counter: &Arc<AtomicUsize>) -> Replayable<u32> {
        let counter = Arc::clone(counter);
        Replayable::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            vec![10, 20, 30]
        })
    }

    #[test]
    fn test_producer_runs_once() {
        let counter = Arc::new(AtomicUsize::new(0));
        let seq = counted(&counter);
        assert!(!seq.is_realized());
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        for _ in 0..5 {
            assert_eq!(seq.iterate().unwrap().count(), 3);
        }
        assert_eq!(seq.to_list().unwrap(), vec![10, 20, 30]);
        assert_eq!(seq.to_list().unwrap(), vec![10, 20, 30]);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(seq.is_realized());
    }

    #[test]
    fn test_clones_share_materialization() {
        let counter = Arc::new(AtomicUsize::new(0));
        let seq = counted(&counter);
        let other = seq.clone();
        assert_eq!(other.to_list().unwrap(), vec![10, 20, 30]);
        assert!(seq.is_realized());
        assert_eq!(seq.iterate().unwrap().copied().collect::<Vec<_>>(), vec![10, 20, 30]);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failure_is_sticky() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        let seq: Replayable<u32> = Replayable::try_new(move || {
            c.fetch_add(1, Ordering::SeqCst);
            Err::<Vec<u32>, _>("boom")
        });

        let first = seq.iterate().unwrap_err();
        let second = seq.to_list().unwrap_err();
        assert_eq!(first, second);
        assert!(first.message.contains("boom"));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_serializes_nested_sequences() {
        let inner = Replayable::new(|| vec![1, 2]);
        let outer = Replayable::new(move || vec![inner.clone(), Replayable::from_vec(vec![3])]);
        assert_eq!(
            outer.to_plain_value().unwrap(),
            serde_json::json!([[1, 2], [3]])
        );
    }

    #[test]
    fn test_serialize_reports_failure() {
        let seq: Replayable<u32> = Replayable::try_new(|| Err::<Vec<u32>, _>("offline"));
        let err = serde_json::to_string(&seq).unwrap_err();
        assert!(err.to_string().contains("offline"));
    }

    #[test]
    fn test_debug_shows_deferred() {
        let seq = Replayable::new(|| vec![1]);
        assert_eq!(format!("{:?}", seq), "Replayable(<deferred>)");
        seq.iterate().unwrap();
        assert_eq!(format!("{:?}", seq), "Replayable([1])");
    }
}
