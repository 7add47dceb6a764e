//! Per-key protocol state.
//!
//! Accounts are keyed by their CAIP-10 string, subscribe attempts by
//! `{account}/{app domain}` and live subscriptions by topic. Keys without an
//! entry are in whatever state the caller derives from storage.

use {
    super::error::NotifyClientError,
    parking_lot::Mutex,
    std::collections::HashMap,
    tracing::debug,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    Idle,
    Registering,
    Registered,
    Subscribing,
    Active,
    Updating,
    Deleting,
    Removed,
}

impl LifecycleState {
    /// A round trip is in flight for the key.
    pub fn is_in_progress(self) -> bool {
        matches!(
            self,
            Self::Registering | Self::Subscribing | Self::Updating | Self::Deleting
        )
    }

    fn permits(self, next: Self) -> bool {
        use LifecycleState::*;
        matches!(
            (self, next),
            (Idle | Registered, Registering) | (Idle, Subscribing) | (Active, Updating | Deleting)
        )
    }
}

#[derive(Debug, Default)]
pub struct Lifecycle {
    states: Mutex<HashMap<String, LifecycleState>>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, key: &str) -> Option<LifecycleState> {
        self.states.lock().get(key).copied()
    }

    pub fn set(&self, key: impl Into<String>, state: LifecycleState) {
        self.states.lock().insert(key.into(), state);
    }

    pub fn forget(&self, key: &str) {
        self.states.lock().remove(key);
    }

    /// Moves `key` into the in-progress state `during`. `fallback` is the
    /// state assumed when nothing is recorded for the key.
    ///
    /// The returned [`Transition`] puts the key back where it was unless it is
    /// completed, so an error, a timeout or a dropped future all revert.
    pub fn begin(
        &self,
        key: impl Into<String>,
        fallback: LifecycleState,
        during: LifecycleState,
    ) -> Result<Transition<'_>, NotifyClientError> {
        let key = key.into();
        let mut states = self.states.lock();
        let previous = states.get(&key).copied();
        let current = previous.unwrap_or(fallback);

        if current.is_in_progress() {
            return Err(NotifyClientError::OperationInProgress(key));
        }
        if !current.permits(during) {
            return Err(NotifyClientError::InvalidTransition {
                key,
                from: current,
                to: during,
            });
        }

        debug!("{key}: {current:?} -> {during:?}");
        states.insert(key.clone(), during);
        Ok(Transition {
            lifecycle: self,
            key,
            previous,
            done: false,
        })
    }
}

#[must_use = "dropping a transition reverts it"]
pub struct Transition<'a> {
    lifecycle: &'a Lifecycle,
    key: String,
    previous: Option<LifecycleState>,
    done: bool,
}

impl Transition<'_> {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Ends the operation in `state`, or with no recorded state for `None`.
    pub fn complete(mut self, state: Option<LifecycleState>) {
        debug!("{}: done, now {state:?}", self.key);
        self.done = true;
        self.settle(state);
    }

    fn settle(&self, state: Option<LifecycleState>) {
        let mut states = self.lifecycle.states.lock();
        match state {
            Some(state) => states.insert(self.key.clone(), state),
            None => states.remove(&self.key),
        };
    }
}

impl Drop for Transition<'_> {
    fn drop(&mut self) {
        if !self.done {
            debug!("{}: abandoned, back to {:?}", self.key, self.previous);
            self.settle(self.previous);
        }
    }
}
