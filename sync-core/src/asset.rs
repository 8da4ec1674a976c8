//! Per-entity asset state machine.
//!
//! ```text
//! NoAsset → PendingDownload → Downloaded → Attached
//!                 ↓
//!              Failed → PendingDownload (next run) ... → Retired
//! ```
//!
//! Pure: the async reconciler in `sync-client` performs the downloads,
//! persistence and entity saves named by the returned [`AssetAction`]s.

use sync_types::PendingAsset;

/// Retry bound for asset downloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssetPolicy {
    /// Download attempts, across runs, before the reference is dropped.
    pub max_attempts: u32,
}

impl Default for AssetPolicy {
    fn default() -> Self {
        Self { max_attempts: 3 }
    }
}

/// Download state of one entity's asset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum AssetState {
    /// Nothing tracked.
    #[default]
    NoAsset,
    /// Download queued or in flight.
    PendingDownload {
        /// Remote URL.
        url: String,
        /// Attempts started, including this one.
        attempts: u32,
    },
    /// File on disk, not yet attached to the entity.
    Downloaded {
        /// Remote URL.
        url: String,
        /// Local file path.
        path: String,
    },
    /// Entity saved with the local path.
    Attached {
        /// Remote URL.
        url: String,
        /// Local file path.
        path: String,
    },
    /// Last attempt failed; retried on the next enqueue.
    Failed {
        /// Remote URL.
        url: String,
        /// Attempts started so far.
        attempts: u32,
        /// Last error.
        error: String,
    },
    /// Gave up; the reference was dropped from the entity.
    Retired {
        /// Remote URL that kept failing.
        url: String,
    },
}

/// Inputs to the asset state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssetEvent {
    /// Entity references `url`.
    Enqueue {
        /// Remote URL.
        url: String,
    },
    /// Download finished.
    DownloadSucceeded {
        /// URL that was downloaded.
        url: String,
        /// Where it was written.
        path: String,
    },
    /// Download failed.
    DownloadFailed {
        /// URL that failed.
        url: String,
        /// Error message.
        error: String,
    },
    /// Entity was saved with the downloaded path.
    Attached,
    /// Entity was removed.
    Cleared,
}

/// Side effects requested by a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssetAction {
    /// Queue a download of `url`.
    StartDownload {
        /// Remote URL.
        url: String,
    },
    /// Upsert the pending-asset row.
    PersistPending {
        /// Remote URL.
        url: String,
        /// Attempts started so far.
        attempts: u32,
    },
    /// Delete the pending-asset row.
    ClearPending,
    /// Save the entity with this local path.
    ScheduleAttach {
        /// Local file path.
        path: String,
    },
    /// Save the entity without its asset reference.
    DropReference,
}

impl AssetState {
    /// State rebuilt from a persisted pending row at startup.
    ///
    /// A row that survived a restart means an attempt was started and never
    /// completed, so it counts as failed.
    pub fn restored(pending: &PendingAsset) -> Self {
        Self::Failed {
            url: pending.url.clone(),
            attempts: pending.attempts,
            error: "interrupted".to_string(),
        }
    }

    /// Remote URL tracked by this state.
    pub fn url(&self) -> Option<&str> {
        match self {
            Self::NoAsset => None,
            Self::PendingDownload { url, .. }
            | Self::Downloaded { url, .. }
            | Self::Attached { url, .. }
            | Self::Failed { url, .. }
            | Self::Retired { url } => Some(url),
        }
    }

    /// True while a download is queued or in flight.
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::PendingDownload { .. })
    }

    /// Process an event and return the new state plus actions to execute.
    pub fn on_event(self, event: AssetEvent, policy: &AssetPolicy) -> (Self, Vec<AssetAction>) {
        match (self, event) {
            // A new URL always restarts the cycle
            (state, AssetEvent::Enqueue { url }) if state.url() != Some(url.as_str()) => {
                Self::start(url, 1)
            }

            // Same URL: idempotent while pending, downloaded, attached or retired
            (
                state @ (Self::PendingDownload { .. }
                | Self::Downloaded { .. }
                | Self::Attached { .. }
                | Self::Retired { .. }),
                AssetEvent::Enqueue { .. },
            ) => (state, vec![]),

            (Self::Failed { url, attempts, .. }, AssetEvent::Enqueue { .. }) => {
                if attempts >= policy.max_attempts {
                    (
                        Self::Retired { url },
                        vec![AssetAction::ClearPending, AssetAction::DropReference],
                    )
                } else {
                    Self::start(url, attempts.saturating_add(1))
                }
            }

            (Self::PendingDownload { url, .. }, AssetEvent::DownloadSucceeded { url: done, path })
                if url == done =>
            {
                (
                    Self::Downloaded {
                        url,
                        path: path.clone(),
                    },
                    vec![AssetAction::ScheduleAttach { path }],
                )
            }

            (
                Self::PendingDownload { url, attempts },
                AssetEvent::DownloadFailed { url: failed, error },
            ) if url == failed =>
            {
                if attempts >= policy.max_attempts {
                    (
                        Self::Retired { url },
                        vec![AssetAction::ClearPending, AssetAction::DropReference],
                    )
                } else {
                    (
                        Self::Failed {
                            url,
                            attempts,
                            error,
                        },
                        vec![],
                    )
                }
            }

            (Self::Downloaded { url, path }, AssetEvent::Attached) => {
                (Self::Attached { url, path }, vec![AssetAction::ClearPending])
            }

            (Self::NoAsset, AssetEvent::Cleared) => (Self::NoAsset, vec![]),
            (_, AssetEvent::Cleared) => (Self::NoAsset, vec![AssetAction::ClearPending]),

            // Stale completions and other invalid transitions - stay in current state
            (state, _) => (state, vec![]),
        }
    }

    fn start(url: String, attempts: u32) -> (Self, Vec<AssetAction>) {
        (
            Self::PendingDownload {
                url: url.clone(),
                attempts,
            },
            vec![
                AssetAction::PersistPending {
                    url: url.clone(),
                    attempts,
                },
                AssetAction::StartDownload { url },
            ],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const URL: &str = "https://cdn/avatar.jpg";

    fn enqueue(url: &str) -> AssetEvent {
        AssetEvent::Enqueue { url: url.into() }
    }

    fn failed(url: &str) -> AssetEvent {
        AssetEvent::DownloadFailed {
            url: url.into(),
            error: "404".into(),
        }
    }

    fn succeeded(url: &str, path: &str) -> AssetEvent {
        AssetEvent::DownloadSucceeded {
            url: url.into(),
            path: path.into(),
        }
    }

    fn has_download(actions: &[AssetAction]) -> bool {
        actions
            .iter()
            .any(|a| matches!(a, AssetAction::StartDownload { .. }))
    }

    #[test]
    fn enqueue_starts_download() {
        let (state, actions) = AssetState::NoAsset.on_event(enqueue(URL), &AssetPolicy::default());

        assert_eq!(
            state,
            AssetState::PendingDownload {
                url: URL.into(),
                attempts: 1
            }
        );
        assert!(has_download(&actions));
        assert!(actions.contains(&AssetAction::PersistPending {
            url: URL.into(),
            attempts: 1
        }));
    }

    #[test]
    fn double_enqueue_before_completion_is_one_download() {
        let policy = AssetPolicy::default();
        let (state, first) = AssetState::NoAsset.on_event(enqueue(URL), &policy);
        let (state, second) = state.on_event(enqueue(URL), &policy);

        assert!(state.is_pending());
        assert!(has_download(&first));
        assert!(second.is_empty());
    }

    #[test]
    fn happy_path_to_attached() {
        let policy = AssetPolicy::default();
        let (state, _) = AssetState::NoAsset.on_event(enqueue(URL), &policy);
        let (state, actions) = state.on_event(succeeded(URL, "/a/1.jpg"), &policy);

        assert!(matches!(state, AssetState::Downloaded { .. }));
        assert_eq!(
            actions,
            vec![AssetAction::ScheduleAttach {
                path: "/a/1.jpg".into()
            }]
        );

        let (state, actions) = state.on_event(AssetEvent::Attached, &policy);
        assert!(matches!(state, AssetState::Attached { .. }));
        assert_eq!(actions, vec![AssetAction::ClearPending]);

        // Same URL again is a no-op
        let (state, actions) = state.on_event(enqueue(URL), &policy);
        assert!(matches!(state, AssetState::Attached { .. }));
        assert!(actions.is_empty());
    }

    #[test]
    fn changed_url_restarts_from_attached() {
        let policy = AssetPolicy::default();
        let attached = AssetState::Attached {
            url: URL.into(),
            path: "/a/1.jpg".into(),
        };
        let (state, actions) = attached.on_event(enqueue("https://cdn/new.jpg"), &policy);

        assert_eq!(
            state,
            AssetState::PendingDownload {
                url: "https://cdn/new.jpg".into(),
                attempts: 1
            }
        );
        assert!(has_download(&actions));
    }

    #[test]
    fn failures_retire_after_max_attempts() {
        let policy = AssetPolicy { max_attempts: 2 };

        // Run 1
        let (state, _) = AssetState::NoAsset.on_event(enqueue(URL), &policy);
        let (state, actions) = state.on_event(failed(URL), &policy);
        assert!(matches!(state, AssetState::Failed { attempts: 1, .. }));
        assert!(actions.is_empty());

        // Run 2
        let (state, actions) = state.on_event(enqueue(URL), &policy);
        assert!(matches!(state, AssetState::PendingDownload { attempts: 2, .. }));
        assert!(has_download(&actions));

        let (state, actions) = state.on_event(failed(URL), &policy);
        assert_eq!(state, AssetState::Retired { url: URL.into() });
        assert!(actions.contains(&AssetAction::DropReference));
        assert!(actions.contains(&AssetAction::ClearPending));

        // Retired stays retired for the same URL
        let (state, actions) = state.on_event(enqueue(URL), &policy);
        assert!(matches!(state, AssetState::Retired { .. }));
        assert!(actions.is_empty());
    }

    #[test]
    fn restored_row_at_bound_retires_on_enqueue() {
        let policy = AssetPolicy { max_attempts: 3 };
        let restored = AssetState::restored(&PendingAsset {
            url: URL.into(),
            attempts: 3,
        });

        let (state, actions) = restored.on_event(enqueue(URL), &policy);

        assert!(matches!(state, AssetState::Retired { .. }));
        assert!(actions.contains(&AssetAction::DropReference));
    }

    #[test]
    fn restored_row_below_bound_retries() {
        let policy = AssetPolicy { max_attempts: 3 };
        let restored = AssetState::restored(&PendingAsset {
            url: URL.into(),
            attempts: 1,
        });

        let (state, actions) = restored.on_event(enqueue(URL), &policy);

        assert!(matches!(state, AssetState::PendingDownload { attempts: 2, .. }));
        assert!(has_download(&actions));
    }

    #[test]
    fn stale_completion_for_old_url_is_ignored() {
        let policy = AssetPolicy::default();
        let pending = AssetState::PendingDownload {
            url: "https://cdn/new.jpg".into(),
            attempts: 1,
        };
        let (state, actions) = pending.clone().on_event(succeeded(URL, "/a/old.jpg"), &policy);

        assert_eq!(state, pending);
        assert!(actions.is_empty());
    }

    #[test]
    fn cleared_forgets_pending_row() {
        let policy = AssetPolicy::default();
        let pending = AssetState::PendingDownload {
            url: URL.into(),
            attempts: 1,
        };
        let (state, actions) = pending.on_event(AssetEvent::Cleared, &policy);

        assert_eq!(state, AssetState::NoAsset);
        assert_eq!(actions, vec![AssetAction::ClearPending]);
    }
}
