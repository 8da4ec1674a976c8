//! Orchestration phase machine for socialsync.
//!
//! This module provides a pure, side-effect-free state machine for one sync
//! run over an (account, collection) pair. The machine takes events as input
//! and produces a new phase plus a list of actions to execute.
//!
//! The actual I/O is performed by the orchestrator in sync-client. In
//! particular the checkpoint is only committed when the machine emits
//! [`PhaseAction::CommitCheckpoint`], which is reachable only through a
//! complete fetch/apply/upload sequence.

/// Phase of a sync run - NO I/O, just state transitions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SyncPhase {
    /// No run in progress.
    #[default]
    Idle,
    /// Obtaining an access token.
    Authenticating,
    /// Paging through the remote collection.
    FetchingRemote {
        /// Pages fetched so far in this attempt.
        pages: u32,
    },
    /// Diffing the fetch against the previous snapshot.
    ComputingDelta,
    /// Merging and saving remote changes locally.
    ApplyingRemoteDelta,
    /// Reading the local change log.
    ComputingLocalDelta,
    /// Pushing local changes in batches.
    UploadingLocal {
        /// Batches acknowledged so far.
        batches: u32,
    },
    /// Draining the asset queue.
    ReconcilingAssets,
    /// Persisting the new checkpoint.
    Committing,
    /// The run failed; the checkpoint was discarded.
    Error {
        /// Why the run failed.
        reason: String,
    },
}

impl SyncPhase {
    /// Create a new machine in the Idle phase.
    pub fn new() -> Self {
        Self::Idle
    }

    /// Process an event and return the new phase plus actions to execute.
    ///
    /// This is a pure function - no side effects. The caller (sync-client)
    /// is responsible for executing the returned actions.
    pub fn on_event(self, event: PhaseEvent) -> (Self, Vec<PhaseAction>) {
        match (self, event) {
            (Self::Idle, PhaseEvent::SyncRequested) => (
                Self::Authenticating,
                vec![
                    PhaseAction::Authenticate,
                    PhaseAction::EmitEvent(SyncEvent::Started),
                ],
            ),

            (Self::Authenticating, PhaseEvent::Authenticated) => {
                (Self::FetchingRemote { pages: 0 }, vec![PhaseAction::FetchPage])
            }

            // From FetchingRemote
            (Self::FetchingRemote { pages }, PhaseEvent::PageFetched) => {
                let pages = pages.saturating_add(1);
                (
                    Self::FetchingRemote { pages },
                    vec![
                        PhaseAction::FetchPage,
                        PhaseAction::EmitEvent(SyncEvent::FetchProgress { pages }),
                    ],
                )
            }
            (Self::FetchingRemote { .. }, PhaseEvent::TokenExpired) => (
                Self::Authenticating,
                vec![PhaseAction::InvalidateToken, PhaseAction::Authenticate],
            ),
            (Self::FetchingRemote { .. }, PhaseEvent::FetchExhausted) => {
                (Self::ComputingDelta, vec![PhaseAction::ComputeDelta])
            }

            (
                Self::ComputingDelta,
                PhaseEvent::DeltaComputed {
                    added,
                    modified,
                    removed,
                },
            ) => (
                Self::ApplyingRemoteDelta,
                vec![
                    PhaseAction::ApplyRemoteDelta,
                    PhaseAction::EmitEvent(SyncEvent::DeltaComputed {
                        added,
                        modified,
                        removed,
                    }),
                ],
            ),

            (Self::ApplyingRemoteDelta, PhaseEvent::RemoteApplied) => {
                (Self::ComputingLocalDelta, vec![PhaseAction::ComputeLocalDelta])
            }

            (Self::ComputingLocalDelta, PhaseEvent::LocalDeltaComputed) => (
                Self::UploadingLocal { batches: 0 },
                vec![PhaseAction::UploadNextBatch],
            ),

            // From UploadingLocal
            (Self::UploadingLocal { batches }, PhaseEvent::BatchUploaded) => (
                Self::UploadingLocal {
                    batches: batches.saturating_add(1),
                },
                vec![PhaseAction::UploadNextBatch],
            ),
            (Self::UploadingLocal { batches }, PhaseEvent::UploadsFinished) => (
                Self::ReconcilingAssets,
                vec![
                    PhaseAction::ReconcileAssets,
                    PhaseAction::EmitEvent(SyncEvent::Uploaded { batches }),
                ],
            ),

            (Self::ReconcilingAssets, PhaseEvent::AssetsDrained) => {
                (Self::Committing, vec![PhaseAction::CommitCheckpoint])
            }

            (Self::Committing, PhaseEvent::Committed) => {
                (Self::Idle, vec![PhaseAction::EmitEvent(SyncEvent::Completed)])
            }

            // Error is reachable from every non-idle phase
            (state, PhaseEvent::Failed { reason, resync }) if state.is_running() => {
                let mut actions = vec![PhaseAction::DiscardCheckpoint];
                if resync {
                    actions.push(PhaseAction::PurgeCheckpoint);
                }
                actions.push(PhaseAction::EmitEvent(SyncEvent::Failed {
                    reason: reason.clone(),
                    resync,
                }));
                (Self::Error { reason }, actions)
            }

            (Self::Error { .. }, PhaseEvent::Reset) => (Self::Idle, vec![]),

            // Invalid transitions - stay in current phase
            (state, _) => (state, vec![]),
        }
    }

    /// True between `SyncRequested` and the terminal transition.
    pub fn is_running(&self) -> bool {
        !matches!(self, Self::Idle | Self::Error { .. })
    }

    /// Short label for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Authenticating => "authenticating",
            Self::FetchingRemote { .. } => "fetching_remote",
            Self::ComputingDelta => "computing_delta",
            Self::ApplyingRemoteDelta => "applying_remote_delta",
            Self::ComputingLocalDelta => "computing_local_delta",
            Self::UploadingLocal { .. } => "uploading_local",
            Self::ReconcilingAssets => "reconciling_assets",
            Self::Committing => "committing",
            Self::Error { .. } => "error",
        }
    }
}

/// Events that drive a sync run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseEvent {
    /// External sync request.
    SyncRequested,
    /// Access token obtained.
    Authenticated,
    /// One remote page fetched; more may follow.
    PageFetched,
    /// Remote token expired mid-fetch; re-authenticate and restart.
    TokenExpired,
    /// Remote pages exhausted.
    FetchExhausted,
    /// Remote delta computed.
    DeltaComputed {
        /// Entities added remotely.
        added: usize,
        /// Entities modified remotely.
        modified: usize,
        /// Entities removed remotely.
        removed: usize,
    },
    /// Remote delta saved locally.
    RemoteApplied,
    /// Local change log read and filtered.
    LocalDeltaComputed,
    /// One upload batch acknowledged.
    BatchUploaded,
    /// No more upload batches.
    UploadsFinished,
    /// Asset queue drained (or its time budget spent).
    AssetsDrained,
    /// Checkpoint persisted.
    Committed,
    /// Run-level failure.
    Failed {
        /// Error message.
        reason: String,
        /// Purge the stored checkpoint so the next run fully resyncs.
        resync: bool,
    },
    /// Acknowledge a failure and return to Idle.
    Reset,
}

/// Actions to be executed by the orchestrator.
///
/// These are instructions, not side effects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseAction {
    /// Obtain an access token.
    Authenticate,
    /// Drop the cached token before re-authenticating.
    InvalidateToken,
    /// Fetch the next remote page.
    FetchPage,
    /// Diff the fetch against the previous snapshot.
    ComputeDelta,
    /// Apply the remote delta to the local store.
    ApplyRemoteDelta,
    /// Read the local change log.
    ComputeLocalDelta,
    /// Upload the next batch of local changes.
    UploadNextBatch,
    /// Drain pending asset downloads.
    ReconcileAssets,
    /// Persist the in-memory checkpoint.
    CommitCheckpoint,
    /// Throw away the in-memory checkpoint.
    DiscardCheckpoint,
    /// Delete the stored checkpoint.
    PurgeCheckpoint,
    /// Emit an event to observers.
    EmitEvent(SyncEvent),
}

/// Events emitted to the application layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// A run started.
    Started,
    /// Pages fetched so far.
    FetchProgress {
        /// Page count.
        pages: u32,
    },
    /// Remote delta sizes.
    DeltaComputed {
        /// Added count.
        added: usize,
        /// Modified count.
        modified: usize,
        /// Removed count.
        removed: usize,
    },
    /// Local changes pushed.
    Uploaded {
        /// Batches acknowledged.
        batches: u32,
    },
    /// Checkpoint committed.
    Completed,
    /// The run failed; it will be retried at the next scheduled interval.
    Failed {
        /// Error message.
        reason: String,
        /// Whether the checkpoint was purged.
        resync: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn has(actions: &[PhaseAction], wanted: &PhaseAction) -> bool {
        actions.iter().any(|a| a == wanted)
    }

    /// Drive a machine through `events`, collecting every action.
    fn run(events: Vec<PhaseEvent>) -> (SyncPhase, Vec<PhaseAction>) {
        let mut phase = SyncPhase::new();
        let mut all = Vec::new();
        for event in events {
            let (next, actions) = phase.on_event(event);
            phase = next;
            all.extend(actions);
        }
        (phase, all)
    }

    fn happy_path() -> Vec<PhaseEvent> {
        vec![
            PhaseEvent::SyncRequested,
            PhaseEvent::Authenticated,
            PhaseEvent::PageFetched,
            PhaseEvent::PageFetched,
            PhaseEvent::FetchExhausted,
            PhaseEvent::DeltaComputed {
                added: 1,
                modified: 2,
                removed: 0,
            },
            PhaseEvent::RemoteApplied,
            PhaseEvent::LocalDeltaComputed,
            PhaseEvent::BatchUploaded,
            PhaseEvent::UploadsFinished,
            PhaseEvent::AssetsDrained,
            PhaseEvent::Committed,
        ]
    }

    #[test]
    fn starts_idle() {
        assert_eq!(SyncPhase::new(), SyncPhase::Idle);
        assert!(!SyncPhase::new().is_running());
    }

    #[test]
    fn happy_path_commits_and_returns_to_idle() {
        let (phase, actions) = run(happy_path());

        assert_eq!(phase, SyncPhase::Idle);
        assert!(has(&actions, &PhaseAction::CommitCheckpoint));
        assert!(has(&actions, &PhaseAction::EmitEvent(SyncEvent::Completed)));
        assert!(has(
            &actions,
            &PhaseAction::EmitEvent(SyncEvent::Uploaded { batches: 1 })
        ));
        assert!(!has(&actions, &PhaseAction::DiscardCheckpoint));
    }

    #[test]
    fn fetch_counts_pages() {
        let (phase, _) = run(vec![
            PhaseEvent::SyncRequested,
            PhaseEvent::Authenticated,
            PhaseEvent::PageFetched,
            PhaseEvent::PageFetched,
        ]);
        assert_eq!(phase, SyncPhase::FetchingRemote { pages: 2 });
    }

    #[test]
    fn token_expiry_restarts_fetch_from_first_page() {
        let (phase, actions) = run(vec![
            PhaseEvent::SyncRequested,
            PhaseEvent::Authenticated,
            PhaseEvent::PageFetched,
            PhaseEvent::TokenExpired,
        ]);
        assert_eq!(phase, SyncPhase::Authenticating);
        assert!(has(&actions, &PhaseAction::InvalidateToken));

        let (phase, _) = phase.on_event(PhaseEvent::Authenticated);
        assert_eq!(phase, SyncPhase::FetchingRemote { pages: 0 });
    }

    #[test]
    fn failure_discards_without_commit() {
        let mut events = happy_path();
        events.truncate(6); // through DeltaComputed
        events.push(PhaseEvent::Failed {
            reason: "store unavailable".into(),
            resync: false,
        });

        let (phase, actions) = run(events);

        assert!(matches!(phase, SyncPhase::Error { .. }));
        assert!(has(&actions, &PhaseAction::DiscardCheckpoint));
        assert!(!has(&actions, &PhaseAction::CommitCheckpoint));
        assert!(!has(&actions, &PhaseAction::PurgeCheckpoint));
    }

    #[test]
    fn resync_failure_purges() {
        let (_, actions) = run(vec![
            PhaseEvent::SyncRequested,
            PhaseEvent::Authenticated,
            PhaseEvent::Failed {
                reason: "sync token expired".into(),
                resync: true,
            },
        ]);
        assert!(has(&actions, &PhaseAction::PurgeCheckpoint));
    }

    #[test]
    fn error_reachable_from_every_running_phase() {
        let running = vec![
            SyncPhase::Authenticating,
            SyncPhase::FetchingRemote { pages: 3 },
            SyncPhase::ComputingDelta,
            SyncPhase::ApplyingRemoteDelta,
            SyncPhase::ComputingLocalDelta,
            SyncPhase::UploadingLocal { batches: 1 },
            SyncPhase::ReconcilingAssets,
            SyncPhase::Committing,
        ];
        for phase in running {
            let (next, _) = phase.on_event(PhaseEvent::Failed {
                reason: "x".into(),
                resync: false,
            });
            assert!(matches!(next, SyncPhase::Error { .. }));
        }
    }

    #[test]
    fn failure_while_idle_is_ignored() {
        let (phase, actions) = SyncPhase::Idle.on_event(PhaseEvent::Failed {
            reason: "x".into(),
            resync: false,
        });
        assert_eq!(phase, SyncPhase::Idle);
        assert!(actions.is_empty());
    }

    #[test]
    fn commit_unreachable_by_skipping_upload() {
        let (phase, actions) = run(vec![
            PhaseEvent::SyncRequested,
            PhaseEvent::Authenticated,
            PhaseEvent::FetchExhausted,
            PhaseEvent::DeltaComputed {
                added: 0,
                modified: 0,
                removed: 0,
            },
            PhaseEvent::AssetsDrained,
        ]);
        assert_eq!(phase, SyncPhase::ApplyingRemoteDelta);
        assert!(!has(&actions, &PhaseAction::CommitCheckpoint));
    }

    #[test]
    fn reset_returns_error_to_idle() {
        let phase = SyncPhase::Error {
            reason: "x".into(),
        };
        let (phase, _) = phase.on_event(PhaseEvent::Reset);
        assert_eq!(phase, SyncPhase::Idle);
    }

    #[test]
    fn names_are_stable() {
        assert_eq!(SyncPhase::Committing.name(), "committing");
        assert_eq!(SyncPhase::FetchingRemote { pages: 1 }.name(), "fetching_remote");
    }
}
