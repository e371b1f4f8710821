//! Lightweight input validation helpers. Keep logic minimal and deterministic.

use crate::{RepoError, ResolvedFilter, ScopedOptions, UserPatch};

/// Longest accepted user name, in characters.
pub const MAX_NAME_LEN: usize = 255;
/// Most identifiers accepted in one filter or batch.
pub const MAX_FILTER_IDS: usize = 100;

/// A name must be non-blank and at most `MAX_NAME_LEN` characters.
pub fn validate_name(name: &str) -> Result<(), RepoError> {
    if name.trim().is_empty() {
        return Err(RepoError::Validation("name must not be empty".into()));
    }
    if name.chars().count() > MAX_NAME_LEN {
        return Err(RepoError::Validation(format!(
            "name longer than {MAX_NAME_LEN} characters"
        )));
    }
    Ok(())
}

/// A patch must change at least one field, and every changed field must be valid.
pub fn validate_patch(patch: &UserPatch) -> Result<(), RepoError> {
    if patch.is_empty() {
        return Err(RepoError::Validation("patch has no fields".into()));
    }
    if let Some(name) = &patch.name {
        validate_name(name)?;
    }
    Ok(())
}

/// Reject filter combinations that can never match or that a backend cannot express.
pub fn validate_filter(filter: &ResolvedFilter) -> Result<(), RepoError> {
    if filter.created_at_gte > filter.created_at_lte {
        return Err(RepoError::Validation(
            "created_at_gte is after created_at_lte".into(),
        ));
    }
    if let (Some(min), Some(max)) = (filter.age_gte, filter.age_lte) {
        if min > max {
            return Err(RepoError::Validation(format!(
                "age_gte ({min}) is greater than age_lte ({max})"
            )));
        }
    }
    if filter.ids.len() > MAX_FILTER_IDS {
        return Err(RepoError::Validation(format!(
            "at most {MAX_FILTER_IDS} ids per filter"
        )));
    }
    Ok(())
}

/// A lock is only meaningful inside a caller-owned transaction.
pub fn validate_options<Tx>(opts: &ScopedOptions<'_, Tx>) -> Result<(), RepoError> {
    if opts.lock && opts.tx.is_none() {
        return Err(RepoError::Validation(
            "lock requires a bound transaction".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FilterSpec, UserId};
    use std::time::{Duration, UNIX_EPOCH};

    #[test]
    fn name_validation_basic() {
        assert!(validate_name("ann").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("   ").is_err());
        assert!(validate_name(&"x".repeat(MAX_NAME_LEN)).is_ok());
        assert!(validate_name(&"x".repeat(MAX_NAME_LEN + 1)).is_err());
    }

    #[test]
    fn patch_validation() {
        assert!(validate_patch(&UserPatch::new()).is_err());
        assert!(validate_patch(&UserPatch::new().name(" ")).is_err());
        assert!(validate_patch(&UserPatch::new().age(0)).is_ok());
    }

    #[test]
    fn filter_validation() {
        let now = UNIX_EPOCH + Duration::from_secs(1_000);
        assert!(validate_filter(&FilterSpec::new().resolve(now)).is_ok());

        let inverted = FilterSpec::new()
            .created_at_gte(now)
            .created_at_lte(now - Duration::from_secs(1))
            .resolve(now);
        assert!(matches!(
            validate_filter(&inverted),
            Err(RepoError::Validation(_))
        ));

        let ages = FilterSpec::new().age_gte(50).age_lte(20).resolve(now);
        assert!(validate_filter(&ages).is_err());

        let many = FilterSpec::new()
            .ids((0..=MAX_FILTER_IDS as i64).map(UserId::new))
            .resolve(now);
        assert!(validate_filter(&many).is_err());
    }

    #[test]
    fn lock_requires_tx() {
        let tx = ();
        assert!(validate_options(&ScopedOptions::<()>::new().for_update()).is_err());
        assert!(validate_options(&ScopedOptions::new().in_tx(&tx).for_update()).is_ok());
        assert!(validate_options(&ScopedOptions::<()>::new().from_primary()).is_ok());
    }
}
