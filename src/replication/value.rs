//! Single-writer authoritative value

/// Previous and current value after a write that changed something
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Change<T> {
    pub previous: T,
    pub current: T,
}

/// Authoritative value owned by exactly one writer
///
/// `set` only reports a change; propagating it is up to the writer, so the
/// write and the notification happen in one step from the writer's view.
#[derive(Debug, Clone)]
pub struct Replicated<T> {
    value: T,
}

impl<T: Clone + PartialEq> Replicated<T> {
    pub fn new(value: T) -> Self {
        Self { value }
    }

    pub fn get(&self) -> &T {
        &self.value
    }

    /// Write a value, returning the change if it differs from the current one
    pub fn set(&mut self, value: T) -> Option<Change<T>> {
        if self.value == value {
            return None;
        }
        let previous = std::mem::replace(&mut self.value, value);
        Some(Change {
            previous,
            current: self.value.clone(),
        })
    }
}

impl<T: Clone + PartialEq + Default> Default for Replicated<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}
