use tracing::debug;

use crate::validate::{validate_name, validate_patch};
use crate::{
    CallContext, Clock, FilterSpec, ListResult, NewUser, RepoError, ResolvedFilter,
    ScopedOptions, User, UserId, UserPatch, UserRepository,
};

/// Backend-agnostic operation surface over users.
///
/// Generic over the repository and the clock. It resolves filters against the
/// clock, stamps timestamps, validates caller input, and hands everything else
/// to the repository unchanged. Holds no per-call state, so one instance can
/// serve concurrent callers.
pub struct UserService<R: UserRepository, C: Clock> {
    repo: R,
    clock: C,
}

impl<R: UserRepository, C: Clock> UserService<R, C> {
    pub fn new(repo: R, clock: C) -> Self {
        Self { repo, clock }
    }

    pub fn repo(&self) -> &R {
        &self.repo
    }

    /// The plan `get_all` would run for this spec right now.
    pub fn resolve(&self, spec: &FilterSpec) -> ResolvedFilter {
        spec.resolve(self.clock.now())
    }

    /// Look up a user. A missing record is `Ok(None)`, not an error.
    pub fn get_by_id(
        &self,
        ctx: &CallContext,
        id: UserId,
        opts: &ScopedOptions<'_, R::Tx>,
    ) -> Result<Option<User>, RepoError> {
        let found = self.repo.get_by_id(ctx, id, opts)?;
        debug!(%id, found = found.is_some(), "get_by_id");
        Ok(found)
    }

    /// List users matching `spec`, with the total ignoring pagination.
    pub fn get_all(
        &self,
        ctx: &CallContext,
        spec: &FilterSpec,
        opts: &ScopedOptions<'_, R::Tx>,
    ) -> Result<ListResult<User>, RepoError> {
        let filter = self.resolve(spec);
        let page = self.repo.get_all(ctx, &filter, opts)?;
        debug!(
            limit = filter.limit,
            offset = filter.offset,
            order_by = filter.order_by.as_str(),
            ids = filter.ids.len(),
            returned = page.items.len(),
            total = page.total,
            "get_all"
        );
        Ok(page)
    }

    /// Create a user; storage assigns the id.
    pub fn create(
        &self,
        ctx: &CallContext,
        input: NewUser,
        opts: &ScopedOptions<'_, R::Tx>,
    ) -> Result<User, RepoError> {
        validate_name(&input.name)?;
        let draft = input.stamp(self.clock.now());
        let user = self.repo.create(ctx, &draft, opts)?;
        debug!(id = %user.id, "create");
        Ok(user)
    }

    /// Change only the fields set in `patch`; `updated_at` follows the clock.
    ///
    /// A missing id is `RepoError::NotFound` rather than a silent no-op, so
    /// callers can tell an applied patch from one that matched nothing.
    pub fn update(
        &self,
        ctx: &CallContext,
        id: UserId,
        patch: &UserPatch,
        opts: &ScopedOptions<'_, R::Tx>,
    ) -> Result<(), RepoError> {
        validate_patch(patch)?;
        self.repo.update(ctx, id, patch, self.clock.now(), opts)?;
        debug!(%id, name = patch.name.is_some(), age = patch.age.is_some(), "update");
        Ok(())
    }

    /// Delete every listed user; returns how many existed.
    pub fn delete(
        &self,
        ctx: &CallContext,
        ids: &[UserId],
        opts: &ScopedOptions<'_, R::Tx>,
    ) -> Result<u64, RepoError> {
        ctx.check()?;
        if ids.is_empty() {
            return Ok(0);
        }
        let removed = self.repo.delete(ctx, ids, opts)?;
        debug!(requested = ids.len(), removed, "delete");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory_repo::InMemoryRepo;
    use crate::FixedClock;
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    fn now() -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(1_713_312_000)
    }

    fn svc() -> UserService<InMemoryRepo, FixedClock> {
        UserService::new(InMemoryRepo::new(), FixedClock(now()))
    }

    #[test]
    fn create_stamps_from_clock() {
        let svc = svc();
        let ctx = CallContext::new();
        let user = svc
            .create(&ctx, NewUser::new("ann", 30), &ScopedOptions::new())
            .unwrap();
        assert_eq!(user.created_at, now());
        assert_eq!(user.updated_at, now());
    }

    #[test]
    fn create_rejects_blank_name() {
        let svc = svc();
        let err = svc
            .create(&CallContext::new(), NewUser::new(" ", 30), &ScopedOptions::new())
            .unwrap_err();
        assert!(matches!(err, RepoError::Validation(_)));
    }

    #[test]
    fn update_rejects_empty_patch() {
        let svc = svc();
        let ctx = CallContext::new();
        let user = svc
            .create(&ctx, NewUser::new("ann", 30), &ScopedOptions::new())
            .unwrap();
        let err = svc
            .update(&ctx, user.id, &UserPatch::new(), &ScopedOptions::new())
            .unwrap_err();
        assert!(matches!(err, RepoError::Validation(_)));
    }

    #[test]
    fn delete_empty_batch_is_noop() {
        let svc = svc();
        let removed = svc
            .delete(&CallContext::new(), &[], &ScopedOptions::new())
            .unwrap();
        assert_eq!(removed, 0);
    }

    #[test]
    fn delete_empty_batch_honors_cancellation() {
        let svc = svc();
        let ctx = CallContext::new();
        ctx.cancel();
        let err = svc.delete(&ctx, &[], &ScopedOptions::new()).unwrap_err();
        assert!(matches!(err, RepoError::Cancelled));
    }

    #[test]
    fn resolve_uses_injected_clock() {
        let svc = svc();
        let plan = svc.resolve(&FilterSpec::new());
        assert_eq!(plan.created_at_lte, now());
    }
}
