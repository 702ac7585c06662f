use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;

use crate::library::{LibraryIdentifier, SyncObject};

/// A library-level conflict the user has to decide.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Conflict {
    /// The group was removed remotely while local data for it exists.
    GroupRemoved { group_id: i64, name: String },
    /// Remote write permission was revoked while local changes are pending.
    GroupWriteDenied { group_id: i64, name: String },
}

/// The user's answer to a [`Conflict`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictResolution {
    DeleteGroup(i64),
    MarkGroupAsLocalOnly(i64),
    RevertLibraryToOriginal(LibraryIdentifier),
    MarkChangesAsResolved(LibraryIdentifier),
}

/// A live UI surface that may be displaying a synced object.
#[async_trait]
pub trait ConflictReceiver: Send + Sync {
    /// Key of the object of the given type this surface currently shows in
    /// the given library, if any.
    fn shows(&self, object: SyncObject, library: LibraryIdentifier) -> Option<String>;

    /// Whether the currently shown object may be deleted out from under the
    /// user. Suspends until the user answers.
    async fn can_delete_object(&self) -> bool;
}

/// Presents one modal library-conflict decision at a time.
#[async_trait]
pub trait ConflictPresenter: Send + Sync {
    async fn resolve(&self, conflict: Conflict) -> Option<ConflictResolution>;
}

/// Outcome of the receiver queue for one set of remote deletions.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RemoteDeletionOutcome {
    pub delete_collections: Vec<String>,
    pub restore_collections: Vec<String>,
    pub delete_items: Vec<String>,
    pub restore_items: Vec<String>,
}

/// Registry of weakly held UI surfaces plus the modal conflict presenter.
///
/// Receivers are asked in registration order and strictly one at a time;
/// handles whose surface was torn down are skipped transparently. With no
/// live receiver the queue completes immediately, defaulting to allowing
/// deletions. Sync never deadlocks on absent UI.
pub struct ConflictResolver {
    receivers: Mutex<Vec<Weak<dyn ConflictReceiver>>>,
    presenter: Mutex<Option<Arc<dyn ConflictPresenter>>>,
    /// Serializes modal presentation; two prompts must never overlap.
    presentation_lock: tokio::sync::Mutex<()>,
}

impl ConflictResolver {
    pub fn new() -> Self {
        Self {
            receivers: Mutex::new(Vec::new()),
            presenter: Mutex::new(None),
            presentation_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn register(&self, receiver: &Arc<dyn ConflictReceiver>) {
        self.receivers.lock().unwrap().push(Arc::downgrade(receiver));
    }

    pub fn set_presenter(&self, presenter: Arc<dyn ConflictPresenter>) {
        *self.presenter.lock().unwrap() = Some(presenter);
    }

    /// Detach the presenter (e.g. on logout). Pending conflicts are paused
    /// until a new presenter is attached.
    pub fn clear_presenter(&self) {
        *self.presenter.lock().unwrap() = None;
    }

    pub fn has_presenter(&self) -> bool {
        self.presenter.lock().unwrap().is_some()
    }

    /// Snapshot the live receivers, dropping dead handles from the registry.
    fn live_receivers(&self) -> Vec<Arc<dyn ConflictReceiver>> {
        let mut receivers = self.receivers.lock().unwrap();
        receivers.retain(|weak| weak.strong_count() > 0);
        receivers.iter().filter_map(Weak::upgrade).collect()
    }

    /// Ask every live receiver whether the remote deletions it is displaying
    /// may proceed. Declined keys move from the delete set to the restore
    /// set (the local copy is kept and re-marked as needing upload).
    pub async fn resolve_remote_deletions(
        &self,
        library: LibraryIdentifier,
        collections: Vec<String>,
        items: Vec<String>,
    ) -> RemoteDeletionOutcome {
        let mut outcome = RemoteDeletionOutcome {
            delete_collections: collections,
            restore_collections: Vec::new(),
            delete_items: items,
            restore_items: Vec::new(),
        };

        for receiver in self.live_receivers() {
            if let Some(key) = receiver.shows(SyncObject::Collection, library) {
                if outcome.delete_collections.contains(&key) && !receiver.can_delete_object().await {
                    log::info!("ConflictResolver: keeping displayed collection {}", key);
                    outcome.delete_collections.retain(|candidate| candidate != &key);
                    outcome.restore_collections.push(key);
                    continue;
                }
            }
            if let Some(key) = receiver.shows(SyncObject::Item, library) {
                if outcome.delete_items.contains(&key) && !receiver.can_delete_object().await {
                    log::info!("ConflictResolver: keeping displayed item {}", key);
                    outcome.delete_items.retain(|candidate| candidate != &key);
                    outcome.restore_items.push(key);
                }
            }
        }

        outcome
    }

    /// Present one library conflict. Returns `None` when no presenter is
    /// attached; callers pause the conflict rather than failing.
    pub async fn present(&self, conflict: Conflict) -> Option<ConflictResolution> {
        let presenter = self.presenter.lock().unwrap().clone()?;
        let _guard = self.presentation_lock.lock().await;
        presenter.resolve(conflict).await
    }
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct TestReceiver {
        object: SyncObject,
        key: String,
        allow: bool,
        asked: AtomicUsize,
    }

    impl TestReceiver {
        fn new(object: SyncObject, key: &str, allow: bool) -> Arc<dyn ConflictReceiver> {
            Arc::new(Self {
                object,
                key: key.to_string(),
                allow,
                asked: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ConflictReceiver for TestReceiver {
        fn shows(&self, object: SyncObject, _library: LibraryIdentifier) -> Option<String> {
            (object == self.object).then(|| self.key.clone())
        }

        async fn can_delete_object(&self) -> bool {
            self.asked.fetch_add(1, Ordering::SeqCst);
            self.allow
        }
    }

    fn user() -> LibraryIdentifier {
        LibraryIdentifier::Custom(crate::library::CustomLibraryKind::MyLibrary)
    }

    #[tokio::test]
    async fn declined_key_moves_to_restore_set() {
        let resolver = ConflictResolver::new();
        let first = TestReceiver::new(SyncObject::Item, "AAAA1111", true);
        let second = TestReceiver::new(SyncObject::Item, "KKKK1111", false);
        let third = TestReceiver::new(SyncObject::Item, "ZZZZ1111", true);
        resolver.register(&first);
        resolver.register(&second);
        resolver.register(&third);

        let outcome = resolver
            .resolve_remote_deletions(
                user(),
                vec![],
                vec![
                    "AAAA1111".to_string(),
                    "KKKK1111".to_string(),
                    "ZZZZ1111".to_string(),
                ],
            )
            .await;

        assert_eq!(
            outcome.delete_items,
            vec!["AAAA1111".to_string(), "ZZZZ1111".to_string()]
        );
        assert_eq!(outcome.restore_items, vec!["KKKK1111".to_string()]);
        assert!(outcome.restore_collections.is_empty());
    }

    #[tokio::test]
    async fn every_live_receiver_is_asked_at_most_once() {
        let resolver = ConflictResolver::new();
        let first = Arc::new(TestReceiver {
            object: SyncObject::Item,
            key: "KKKK1111".to_string(),
            allow: true,
            asked: AtomicUsize::new(0),
        });
        let second = Arc::new(TestReceiver {
            object: SyncObject::Item,
            key: "KKKK1111".to_string(),
            allow: false,
            asked: AtomicUsize::new(0),
        });
        let third = Arc::new(TestReceiver {
            object: SyncObject::Item,
            key: "KKKK1111".to_string(),
            allow: true,
            asked: AtomicUsize::new(0),
        });
        for receiver in [&first, &second, &third] {
            let handle: Arc<dyn ConflictReceiver> = receiver.clone();
            resolver.register(&handle);
        }

        let outcome = resolver
            .resolve_remote_deletions(user(), vec![], vec!["KKKK1111".to_string()])
            .await;

        assert!(outcome.delete_items.is_empty());
        assert_eq!(outcome.restore_items, vec!["KKKK1111".to_string()]);
        assert_eq!(first.asked.load(Ordering::SeqCst), 1);
        assert_eq!(second.asked.load(Ordering::SeqCst), 1);
        // Receiver #2 already moved the key to the restore set, so #3 has
        // nothing left to answer for.
        assert_eq!(third.asked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn dead_receivers_are_skipped() {
        let resolver = ConflictResolver::new();
        let live = TestReceiver::new(SyncObject::Collection, "CCCC1111", true);
        {
            let dead = TestReceiver::new(SyncObject::Collection, "CCCC1111", false);
            resolver.register(&dead);
            // dropped here
        }
        resolver.register(&live);

        let outcome = resolver
            .resolve_remote_deletions(user(), vec!["CCCC1111".to_string()], vec![])
            .await;

        // Only the live receiver answered, and it allowed the deletion
        assert_eq!(outcome.delete_collections, vec!["CCCC1111".to_string()]);
        assert!(outcome.restore_collections.is_empty());
    }

    #[tokio::test]
    async fn no_receivers_defaults_to_allowing() {
        let resolver = ConflictResolver::new();
        let outcome = resolver
            .resolve_remote_deletions(user(), vec!["CCCC1111".to_string()], vec![])
            .await;
        assert_eq!(outcome.delete_collections, vec!["CCCC1111".to_string()]);
    }

    struct CountingPresenter {
        active: AtomicUsize,
        max_active: AtomicUsize,
    }

    #[async_trait]
    impl ConflictPresenter for CountingPresenter {
        async fn resolve(&self, conflict: Conflict) -> Option<ConflictResolution> {
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(active, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            match conflict {
                Conflict::GroupRemoved { group_id, .. } => {
                    Some(ConflictResolution::DeleteGroup(group_id))
                }
                Conflict::GroupWriteDenied { group_id, .. } => Some(
                    ConflictResolution::RevertLibraryToOriginal(LibraryIdentifier::Group(group_id)),
                ),
            }
        }
    }

    #[tokio::test]
    async fn prompts_are_strictly_sequential() {
        let resolver = Arc::new(ConflictResolver::new());
        let presenter = Arc::new(CountingPresenter {
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        });
        resolver.set_presenter(presenter.clone());

        let mut handles = Vec::new();
        for group_id in 0..4 {
            let resolver = resolver.clone();
            handles.push(tokio::spawn(async move {
                resolver
                    .present(Conflict::GroupRemoved {
                        group_id,
                        name: format!("group-{}", group_id),
                    })
                    .await
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_some());
        }

        assert_eq!(presenter.max_active.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn absent_presenter_yields_none() {
        let resolver = ConflictResolver::new();
        let resolution = resolver
            .present(Conflict::GroupWriteDenied {
                group_id: 7,
                name: "shared".to_string(),
            })
            .await;
        assert!(resolution.is_none());
    }
}
