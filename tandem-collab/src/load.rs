//! Load-once gate shared by server documents and server queries.
//!
//! ```text
//!   Unloaded ──claim──► Loading ──finish(Ok)──► Loaded
//!       ▲                  │
//!       └──── retry ───────┴──finish(Err)──► Failed
//! ```
//!
//! The first caller to claim the gate performs the load; every caller that
//! arrives while it is in flight waits for the same outcome instead of
//! starting a second load.

use tokio::sync::watch;

use crate::storage::StoreError;

#[derive(Debug, Clone, PartialEq)]
pub enum LoadState<E> {
    Unloaded,
    Loading,
    Loaded,
    Failed(E),
}

/// Outcome of [`LoadGate::claim`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// The caller owns the load and must call [`LoadGate::finish`].
    Owner,
    /// Already loaded.
    Ready,
}

pub struct LoadGate<E = StoreError> {
    state: watch::Sender<LoadState<E>>,
}

impl<E: Clone + From<StoreError>> Default for LoadGate<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Clone + From<StoreError>> LoadGate<E> {
    pub fn new() -> Self {
        let (state, _) = watch::channel(LoadState::Unloaded);
        Self { state }
    }

    pub fn state(&self) -> LoadState<E> {
        self.state.borrow().clone()
    }

    pub fn is_loaded(&self) -> bool {
        matches!(*self.state.borrow(), LoadState::Loaded)
    }

    pub fn is_loading(&self) -> bool {
        matches!(*self.state.borrow(), LoadState::Loading)
    }

    /// Claim the load, or wait for the one in flight.
    ///
    /// A failed load may be claimed again by a later caller; a caller that
    /// waited on the failed attempt gets its error.
    pub async fn claim(&self) -> Result<Claim, E> {
        let mut rx = self.state.subscribe();
        let mut waited = false;
        loop {
            let current = rx.borrow_and_update().clone();
            match current {
                LoadState::Loaded => return Ok(Claim::Ready),
                LoadState::Failed(e) if waited => return Err(e),
                LoadState::Loading => {
                    waited = true;
                    rx.changed()
                        .await
                        .map_err(|_| E::from(StoreError::DatabaseError("load abandoned".into())))?;
                }
                LoadState::Unloaded | LoadState::Failed(_) => {
                    let claimed = self.state.send_if_modified(|state| {
                        if matches!(state, LoadState::Unloaded | LoadState::Failed(_)) {
                            *state = LoadState::Loading;
                            true
                        } else {
                            false
                        }
                    });
                    if claimed {
                        return Ok(Claim::Owner);
                    }
                }
            }
        }
    }

    /// Publish the outcome of an owned load.
    pub fn finish(&self, result: &Result<(), E>) {
        self.state.send_replace(match result {
            Ok(()) => LoadState::Loaded,
            Err(e) => LoadState::Failed(e.clone()),
        });
    }
}
