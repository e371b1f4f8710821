//! Document-store translation: filters become scan filter expressions and
//! patches become update expressions.
//!
//! Attribute names always go through `#placeholders` (`name` is a reserved
//! word in DynamoDB) and values through `:placeholders`.

use std::collections::HashMap;
use std::time::SystemTime;

use aws_sdk_dynamodb::types::AttributeValue;
use domain::validate::validate_filter;
use domain::{RepoError, ResolvedFilter, UserPatch};

use crate::to_nanos;

/// Filter expression plus its placeholder maps.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Expression {
    pub expression: String,
    pub names: HashMap<String, String>,
    pub values: HashMap<String, AttributeValue>,
}

impl Expression {
    fn name(&mut self, attr: &str) -> String {
        let placeholder = format!("#{attr}");
        self.names.insert(placeholder.clone(), attr.to_string());
        placeholder
    }

    fn value(&mut self, key: &str, v: AttributeValue) -> String {
        let placeholder = format!(":{key}");
        self.values.insert(placeholder.clone(), v);
        placeholder
    }
}

fn number(n: impl ToString) -> AttributeValue {
    AttributeValue::N(n.to_string())
}

/// Scan filter for `filter`. Ordering and pagination happen after the scan.
pub fn translate(filter: &ResolvedFilter) -> Result<Expression, RepoError> {
    validate_filter(filter)?;

    let mut expr = Expression::default();
    let mut conditions = Vec::new();

    let created = expr.name("created_at");
    let from = expr.value("created_from", number(to_nanos(filter.created_at_gte)));
    let to = expr.value("created_to", number(to_nanos(filter.created_at_lte)));
    conditions.push(format!("{created} BETWEEN {from} AND {to}"));

    if let Some(min) = filter.age_gte {
        let age = expr.name("age");
        let v = expr.value("age_min", number(min));
        conditions.push(format!("{age} >= {v}"));
    }
    if let Some(max) = filter.age_lte {
        let age = expr.name("age");
        let v = expr.value("age_max", number(max));
        conditions.push(format!("{age} <= {v}"));
    }
    if !filter.ids.is_empty() {
        let id = expr.name("id");
        let operands: Vec<String> = filter
            .ids
            .iter()
            .enumerate()
            .map(|(i, uid)| expr.value(&format!("id{i}"), number(uid.get())))
            .collect();
        conditions.push(format!("{id} IN ({})", operands.join(", ")));
    }

    expr.expression = conditions.join(" AND ");
    Ok(expr)
}

/// `SET` expression for the patched attributes plus `updated_at`, guarded so
/// a missing item fails the condition instead of being created.
pub fn update(patch: &UserPatch, updated_at: SystemTime) -> (Expression, String) {
    let mut expr = Expression::default();
    let mut sets = Vec::new();

    if let Some(name) = &patch.name {
        let n = expr.name("name");
        let v = expr.value("name", AttributeValue::S(name.clone()));
        sets.push(format!("{n} = {v}"));
    }
    if let Some(age) = patch.age {
        let n = expr.name("age");
        let v = expr.value("age", number(age));
        sets.push(format!("{n} = {v}"));
    }
    let n = expr.name("updated_at");
    let v = expr.value("updated_at", number(to_nanos(updated_at)));
    sets.push(format!("{n} = {v}"));

    let id = expr.name("id");
    expr.expression = format!("SET {}", sets.join(", "));
    (expr, format!("attribute_exists({id})"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::{FilterSpec, UserId};
    use std::time::{Duration, UNIX_EPOCH};

    fn now() -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(1_713_312_000)
    }

    #[test]
    fn default_scan_filters_window() {
        let expr = translate(&FilterSpec::new().resolve(now())).unwrap();
        assert_eq!(
            expr.expression,
            "#created_at BETWEEN :created_from AND :created_to"
        );
        assert_eq!(expr.names["#created_at"], "created_at");
        assert_eq!(
            expr.values[":created_to"],
            AttributeValue::N("1713312000000000000".into())
        );
        assert_eq!(
            expr.values[":created_from"],
            AttributeValue::N("1710720000000000000".into())
        );
    }

    #[test]
    fn ages_and_ids_are_conjoined() {
        let filter = FilterSpec::new()
            .age_gte(0)
            .age_lte(45)
            .ids([9, 2].map(UserId::new))
            .resolve(now());
        let expr = translate(&filter).unwrap();
        assert_eq!(
            expr.expression,
            "#created_at BETWEEN :created_from AND :created_to AND #age >= :age_min \
             AND #age <= :age_max AND #id IN (:id0, :id1)"
        );
        assert_eq!(expr.values[":age_min"], AttributeValue::N("0".into()));
        assert_eq!(expr.values[":id0"], AttributeValue::N("2".into()));
        assert_eq!(expr.values[":id1"], AttributeValue::N("9".into()));
    }

    #[test]
    fn inverted_ages_are_rejected() {
        let filter = FilterSpec::new().age_gte(50).age_lte(10).resolve(now());
        assert!(matches!(translate(&filter), Err(RepoError::Validation(_))));
    }

    #[test]
    fn update_sets_only_patched_attributes() {
        let (expr, condition) = update(&UserPatch::new().age(31), now());
        assert_eq!(expr.expression, "SET #age = :age, #updated_at = :updated_at");
        assert_eq!(condition, "attribute_exists(#id)");
        assert!(!expr.names.contains_key("#name"));
        assert_eq!(expr.names["#id"], "id");
    }
}
