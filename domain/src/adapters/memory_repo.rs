use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;
use std::time::SystemTime;

use crate::filter::apply_page;
use crate::validate::{validate_filter, validate_options};
use crate::{
    CallContext, ListResult, RepoError, ResolvedFilter, ScopedOptions, User, UserDraft, UserId,
    UserPatch, UserRepository,
};

#[derive(Clone, Debug, Default)]
struct State {
    users: BTreeMap<UserId, User>,
    /// Bumped by every write that changes `users`.
    version: u64,
}

/// Simple in-memory repository for tests and local runs. Every call takes the
/// internal mutex, so it serializes all access.
pub struct InMemoryRepo {
    state: Mutex<State>,
    // Shared by live and transactional creates so an id is never handed out twice.
    next_id: AtomicI64,
}

/// Snapshot transaction: calls bound to it act on a private copy, which
/// `InMemoryRepo::commit` publishes if nothing else wrote in the meantime.
/// Dropping it discards the changes.
pub struct MemoryTx {
    base_version: u64,
    staged: Mutex<State>,
}

impl InMemoryRepo {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            next_id: AtomicI64::new(0),
        }
    }

    pub fn begin(&self) -> Result<MemoryTx, RepoError> {
        let state = self
            .state
            .lock()
            .map_err(|_| RepoError::storage("mutex poisoned"))?;
        Ok(MemoryTx {
            base_version: state.version,
            staged: Mutex::new(state.clone()),
        })
    }

    /// Publish the transaction's snapshot. Fails without touching the live
    /// data when another write landed after `begin`.
    pub fn commit(&self, tx: MemoryTx) -> Result<(), RepoError> {
        let staged = tx
            .staged
            .into_inner()
            .map_err(|_| RepoError::storage("mutex poisoned"))?;
        let mut state = self
            .state
            .lock()
            .map_err(|_| RepoError::storage("mutex poisoned"))?;
        if state.version != tx.base_version {
            return Err(RepoError::storage(
                "transaction conflicts with a write committed after it began",
            ));
        }
        if staged.version != tx.base_version {
            state.users = staged.users;
            state.version += 1;
        }
        Ok(())
    }

    fn allocate_id(&self) -> UserId {
        UserId::new(self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn with_state<T>(
        &self,
        ctx: &CallContext,
        opts: &ScopedOptions<'_, MemoryTx>,
        f: impl FnOnce(&mut State) -> Result<T, RepoError>,
    ) -> Result<T, RepoError> {
        ctx.check()?;
        validate_options(opts)?;
        let target = match opts.tx {
            Some(tx) => &tx.staged,
            None => &self.state,
        };
        let mut state = target
            .lock()
            .map_err(|_| RepoError::storage("mutex poisoned"))?;
        f(&mut state)
    }
}

impl Default for InMemoryRepo {
    fn default() -> Self {
        Self::new()
    }
}

impl UserRepository for InMemoryRepo {
    type Tx = MemoryTx;

    fn get_by_id(
        &self,
        ctx: &CallContext,
        id: UserId,
        opts: &ScopedOptions<'_, MemoryTx>,
    ) -> Result<Option<User>, RepoError> {
        self.with_state(ctx, opts, |state| Ok(state.users.get(&id).cloned()))
    }

    fn get_all(
        &self,
        ctx: &CallContext,
        filter: &ResolvedFilter,
        opts: &ScopedOptions<'_, MemoryTx>,
    ) -> Result<ListResult<User>, RepoError> {
        validate_filter(filter)?;
        self.with_state(ctx, opts, |state| {
            let matches: Vec<User> = state
                .users
                .values()
                .filter(|u| filter.matches(u))
                .cloned()
                .collect();
            Ok(apply_page(matches, filter))
        })
    }

    fn create(
        &self,
        ctx: &CallContext,
        draft: &UserDraft,
        opts: &ScopedOptions<'_, MemoryTx>,
    ) -> Result<User, RepoError> {
        self.with_state(ctx, opts, |state| {
            let user = draft.clone().into_user(self.allocate_id());
            state.users.insert(user.id, user.clone());
            state.version += 1;
            Ok(user)
        })
    }

    fn update(
        &self,
        ctx: &CallContext,
        id: UserId,
        patch: &UserPatch,
        updated_at: SystemTime,
        opts: &ScopedOptions<'_, MemoryTx>,
    ) -> Result<(), RepoError> {
        self.with_state(ctx, opts, |state| match state.users.get_mut(&id) {
            Some(user) => {
                patch.apply(user, updated_at);
                state.version += 1;
                Ok(())
            }
            None => Err(RepoError::NotFound),
        })
    }

    fn delete(
        &self,
        ctx: &CallContext,
        ids: &[UserId],
        opts: &ScopedOptions<'_, MemoryTx>,
    ) -> Result<u64, RepoError> {
        self.with_state(ctx, opts, |state| {
            let mut removed = 0;
            for id in ids {
                if state.users.remove(id).is_some() {
                    removed += 1;
                }
            }
            if removed > 0 {
                state.version += 1;
            }
            Ok(removed)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conformance;
    use crate::NewUser;
    use std::time::UNIX_EPOCH;

    fn draft(name: &str) -> UserDraft {
        NewUser::new(name, 20).stamp(UNIX_EPOCH)
    }

    #[test]
    fn conformance_suite() {
        conformance::run_all(InMemoryRepo::new);
    }

    #[test]
    fn ids_are_sequential() {
        let repo = InMemoryRepo::new();
        let ctx = CallContext::new();
        let a = repo.create(&ctx, &draft("a"), &ScopedOptions::new()).unwrap();
        let b = repo.create(&ctx, &draft("b"), &ScopedOptions::new()).unwrap();
        assert_eq!(a.id, UserId::new(1));
        assert_eq!(b.id, UserId::new(2));
    }

    #[test]
    fn tx_changes_invisible_until_commit() {
        let repo = InMemoryRepo::new();
        let ctx = CallContext::new();
        let tx = repo.begin().unwrap();
        let user = repo
            .create(&ctx, &draft("staged"), &ScopedOptions::new().in_tx(&tx))
            .unwrap();

        assert!(repo.get_by_id(&ctx, user.id, &ScopedOptions::new()).unwrap().is_none());
        assert!(repo
            .get_by_id(&ctx, user.id, &ScopedOptions::new().in_tx(&tx).for_update())
            .unwrap()
            .is_some());

        repo.commit(tx).unwrap();
        assert!(repo.get_by_id(&ctx, user.id, &ScopedOptions::new()).unwrap().is_some());
    }

    #[test]
    fn commit_after_outside_write_is_rejected() {
        let repo = InMemoryRepo::new();
        let ctx = CallContext::new();
        let tx = repo.begin().unwrap();
        let outside = repo
            .create(&ctx, &draft("outside"), &ScopedOptions::new())
            .unwrap();
        let inside = repo
            .create(&ctx, &draft("inside"), &ScopedOptions::new().in_tx(&tx))
            .unwrap();
        assert_ne!(outside.id, inside.id);

        assert!(matches!(repo.commit(tx), Err(RepoError::Storage(_))));
        let kept = repo.get_by_id(&ctx, outside.id, &ScopedOptions::new()).unwrap();
        assert_eq!(kept.map(|u| u.name), Some("outside".to_string()));
        assert!(repo.get_by_id(&ctx, inside.id, &ScopedOptions::new()).unwrap().is_none());
    }

    #[test]
    fn ids_stay_unique_across_discarded_tx() {
        let repo = InMemoryRepo::new();
        let ctx = CallContext::new();
        let staged = {
            let tx = repo.begin().unwrap();
            repo.create(&ctx, &draft("gone"), &ScopedOptions::new().in_tx(&tx))
                .unwrap()
        };
        let live = repo.create(&ctx, &draft("live"), &ScopedOptions::new()).unwrap();
        assert!(live.id > staged.id);
    }

    #[test]
    fn read_only_tx_commits_alongside_reads() {
        let repo = InMemoryRepo::new();
        let ctx = CallContext::new();
        let user = repo.create(&ctx, &draft("a"), &ScopedOptions::new()).unwrap();
        let tx = repo.begin().unwrap();
        repo.get_by_id(&ctx, user.id, &ScopedOptions::new()).unwrap();
        repo.get_by_id(&ctx, user.id, &ScopedOptions::new().in_tx(&tx).for_update())
            .unwrap();
        repo.commit(tx).unwrap();
        assert!(repo.get_by_id(&ctx, user.id, &ScopedOptions::new()).unwrap().is_some());
    }

    #[test]
    fn dropped_tx_discards_changes() {
        let repo = InMemoryRepo::new();
        let ctx = CallContext::new();
        {
            let tx = repo.begin().unwrap();
            repo.create(&ctx, &draft("gone"), &ScopedOptions::new().in_tx(&tx))
                .unwrap();
        }
        let filter = crate::FilterSpec::new()
            .created_at_gte(UNIX_EPOCH)
            .resolve(UNIX_EPOCH);
        let page = repo.get_all(&ctx, &filter, &ScopedOptions::new()).unwrap();
        assert_eq!(page.total, 0);
    }
}
