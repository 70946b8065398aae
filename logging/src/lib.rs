//! Typed, buffered loggers shared between the threads of a host.
//!
//! A `Registry` maps names to actions. Asking the registry for a logger of a name produces a
//! `Logger<T, E>`, a cloneable handle that timestamps events, tags them with an identifier of
//! type `E`, and buffers them. Buffers are handed to the action when they fill, when the
//! logger is flushed, and when the last handle is dropped.

#![forbid(missing_docs)]

use std::any::Any;
use std::collections::HashMap;
use std::fmt::Debug;
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Number of events buffered before the action is invoked.
const DEFAULT_CAPACITY: usize = 1024;

/// A batch of timestamped, identified events.
pub type Batch<T, E> = Vec<(Duration, E, T)>;

/// A map from names to logging actions.
pub struct Registry<E> {
    /// The instant all timestamps are relative to.
    time: Instant,
    /// Type-erased actions, each an `Arc<Mutex<Box<dyn FnMut(..)>>>` for some event type.
    map: HashMap<String, Box<dyn Any + Send>>,
    /// Identifier stamped onto every event.
    identifier: E,
}

/// A shared action applied to batches of events of type `T`.
pub type Action<T, E> = Arc<Mutex<Box<dyn FnMut(&Duration, &mut Batch<T, E>) + Send>>>;

/// Wraps a closure as a shareable action.
pub fn into_action<T, E, F>(action: F) -> Action<T, E>
where
    F: FnMut(&Duration, &mut Batch<T, E>) + Send + 'static,
{
    let boxed: Box<dyn FnMut(&Duration, &mut Batch<T, E>) + Send> = Box::new(action);
    Arc::new(Mutex::new(boxed))
}

impl<E: Clone + Send + 'static> Registry<E> {

    /// Creates a new registry, relative to `time`, tagging events with `identifier`.
    pub fn new(time: Instant, identifier: E) -> Self {
        Registry {
            time,
            map: HashMap::new(),
            identifier,
        }
    }

    /// Binds a log name to an action on log event batches.
    ///
    /// Returns true when a previous binding was replaced. Loggers handed out before the
    /// replacement keep their old action.
    pub fn insert<T: Send + 'static, F>(&mut self, name: &str, action: F) -> bool
    where
        F: FnMut(&Duration, &mut Batch<T, E>) + Send + 'static,
    {
        self.map.insert(name.to_owned(), Box::new(into_action(action))).is_some()
    }

    /// Removes a bound logger; returns true if one existed.
    pub fn remove(&mut self, name: &str) -> bool {
        self.map.remove(name).is_some()
    }

    /// Retrieves a shared logger, if one has been inserted under `name` for event type `T`.
    pub fn get<T: Send + 'static>(&self, name: &str) -> Option<Logger<T, E>> {
        let action = self.map.get(name)?.downcast_ref::<Action<T, E>>()?;
        Some(Logger::new(self.time, self.identifier.clone(), Arc::clone(action)))
    }
}

/// A cloneable, thread-safe handle that buffers events of type `T`.
pub struct Logger<T, E> {
    inner: Arc<Mutex<LoggerInner<T, E>>>,
}

impl<T, E> Clone for Logger<T, E> {
    fn clone(&self) -> Self {
        Logger { inner: Arc::clone(&self.inner) }
    }
}

struct LoggerInner<T, E> {
    time: Instant,
    identifier: E,
    buffer: Batch<T, E>,
    action: Action<T, E>,
}

impl<T, E: Clone> Logger<T, E> {

    /// Allocates a new shareable logger bound to a write destination.
    pub fn new(time: Instant, identifier: E, action: Action<T, E>) -> Self {
        let inner = LoggerInner {
            time,
            identifier,
            buffer: Vec::with_capacity(DEFAULT_CAPACITY),
            action,
        };
        Logger { inner: Arc::new(Mutex::new(inner)) }
    }

    /// Logs an event.
    ///
    /// The event has its timestamp recorded at the moment of logging, but it may be delayed
    /// due to buffering. It will be written when the logger is next flushed, either due to
    /// the buffer reaching capacity or a direct call to flush.
    pub fn log<S: Into<T>>(&self, event: S) {
        self.log_many(Some(event));
    }

    /// Logs multiple events, all with the same timestamp.
    pub fn log_many<I>(&self, events: I)
    where
        I: IntoIterator,
        I::Item: Into<T>,
    {
        if let Ok(mut inner) = self.inner.lock() {
            let elapsed = inner.time.elapsed();
            let identifier = inner.identifier.clone();
            inner.buffer.extend(events.into_iter().map(|e| (elapsed, identifier.clone(), e.into())));
            if inner.buffer.len() >= DEFAULT_CAPACITY {
                inner.flush();
            }
        }
    }

    /// Flushes logged messages and communicates the new minimal timestamp.
    pub fn flush(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.flush();
        }
    }
}

impl<T, E> LoggerInner<T, E> {
    fn flush(&mut self) {
        let elapsed = self.time.elapsed();
        if let Ok(mut action) = self.action.lock() {
            if !self.buffer.is_empty() {
                (action)(&elapsed, &mut self.buffer);
            }
        }
        self.buffer.clear();
    }
}

impl<T, E> Drop for LoggerInner<T, E> {
    fn drop(&mut self) {
        self.flush();
    }
}

/// An action writing each event as one `Debug` formatted line.
///
/// Intended for the `SLUICE_LOG` file sink; write errors drop the batch.
pub fn line_writer<T: Debug, E: Debug, W: Write + Send + 'static>(writer: W) -> impl FnMut(&Duration, &mut Batch<T, E>) + Send {
    let mut writer = std::io::BufWriter::new(writer);
    move |_time, batch| {
        for (elapsed, identifier, event) in batch.drain(..) {
            if writeln!(writer, "{:?}\t{:?}\t{:?}", elapsed, identifier, event).is_err() {
                return;
            }
        }
        let _ = writer.flush();
    }
}
