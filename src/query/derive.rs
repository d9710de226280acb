//! Query derivation from repository method names.
//!
//! `findByUsernameAndAgeGreaterThan` becomes
//! `SELECT m.* FROM member m WHERE m.username = ?1 AND m.age > ?2`.
//! Parameters are numbered in the order their properties appear in the
//! name. Everything is checked here so a bad name fails when the repository
//! method is built, not when it is called.

use lazy_static::lazy_static;
use regex::Regex;

use crate::core::{DbError, Result};
use crate::mapping::EntityMeta;
use crate::statement::{ColumnRef, CompareOp, Condition, Direction, OrderBy, Operand, Param};

use super::descriptor::{Projection, SelectDescriptor};

lazy_static! {
    static ref METHOD: Regex =
        Regex::new(r"^(find|read|get|query|count)([A-Z][A-Za-z0-9]*?)??(?:By([A-Z][A-Za-z0-9]*))?$")
            .unwrap();
    static ref WORD: Regex = Regex::new(r"[A-Z][a-z0-9]*").unwrap();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Comparator {
    Compare(CompareOp),
    In { negated: bool },
    IsNull { negated: bool },
}

/// Suffixes after a property, longest first so `GreaterThanEqual` wins over
/// `GreaterThan` and `IsNotNull` over `Not`.
const COMPARATORS: &[(&[&str], Comparator)] = &[
    (&["Is", "Not", "Null"], Comparator::IsNull { negated: true }),
    (&["Greater", "Than", "Equal"], Comparator::Compare(CompareOp::Ge)),
    (&["Less", "Than", "Equal"], Comparator::Compare(CompareOp::Le)),
    (&["Not", "Null"], Comparator::IsNull { negated: true }),
    (&["Is", "Null"], Comparator::IsNull { negated: false }),
    (&["Greater", "Than"], Comparator::Compare(CompareOp::Gt)),
    (&["Less", "Than"], Comparator::Compare(CompareOp::Lt)),
    (&["Not", "In"], Comparator::In { negated: true }),
    (&["Is", "Not"], Comparator::Compare(CompareOp::NotEq)),
    (&["In"], Comparator::In { negated: false }),
    (&["Not"], Comparator::Compare(CompareOp::NotEq)),
    (&["Equals"], Comparator::Compare(CompareOp::Eq)),
    (&["Is"], Comparator::Compare(CompareOp::Eq)),
];

/// Alias used for the root entity of derived queries: `m` for `Member`.
pub fn root_alias(meta: &EntityMeta) -> String {
    meta.name
        .chars()
        .next()
        .map(|c| c.to_ascii_lowercase().to_string())
        .unwrap_or_else(|| "e".to_string())
}

/// Parses `method` into a select over `meta`.
pub fn derive(meta: &'static EntityMeta, method: &str) -> Result<SelectDescriptor> {
    let captures = METHOD.captures(method).ok_or_else(|| {
        DbError::Validation(format!(
            "'{}' is not a query method; expected find/read/get/query/count ...By<Property>",
            method
        ))
    })?;

    let mut parser = Parser {
        method,
        descriptor: SelectDescriptor::new(method, meta, root_alias(meta)),
        next_param: 1,
    };
    if &captures[1] == "count" {
        parser.descriptor.projection = Projection::Count;
    }

    if let Some(predicate) = captures.get(3) {
        let words = parser.words(predicate.as_str())?;
        let (criteria, ordering) = match words.windows(2).position(|pair| pair == ["Order", "By"]) {
            Some(at) => (&words[..at], Some(&words[at + 2..])),
            None => (&words[..], None),
        };
        if !criteria.is_empty() {
            let filter = parser.disjunction(criteria)?;
            parser.descriptor.select.filter = Some(filter);
        }
        if let Some(ordering) = ordering {
            let order_by = parser.ordering(ordering)?;
            parser.descriptor.select.order_by = order_by;
        }
    }

    let mut descriptor = parser.descriptor;
    descriptor.finish()?;
    tracing::trace!(method, query = %descriptor.select, "derived query");
    Ok(descriptor)
}

struct Parser<'a> {
    method: &'a str,
    descriptor: SelectDescriptor,
    next_param: usize,
}

impl<'a> Parser<'a> {
    fn invalid(&self, message: String) -> DbError {
        DbError::Validation(format!("'{}': {}", self.method, message))
    }

    fn words<'t>(&self, text: &'t str) -> Result<Vec<&'t str>> {
        let words: Vec<&str> = WORD.find_iter(text).map(|m| m.as_str()).collect();
        if words.concat().len() != text.len() {
            return Err(self.invalid(format!("cannot split '{}' into properties", text)));
        }
        Ok(words)
    }

    fn disjunction(&mut self, words: &[&str]) -> Result<Condition> {
        let mut branches = Vec::new();
        for branch in words.split(|word| *word == "Or") {
            branches.push(self.conjunction(branch, "Or")?);
        }
        Ok(match branches.len() {
            1 => branches.remove(0),
            _ => Condition::Or(branches),
        })
    }

    fn conjunction(&mut self, words: &[&str], joiner: &str) -> Result<Condition> {
        if words.is_empty() {
            return Err(self.invalid(format!("'{}' has no property on one side", joiner)));
        }
        let mut terms = Vec::new();
        for part in words.split(|word| *word == "And") {
            if part.is_empty() {
                return Err(self.invalid("'And' has no property on one side".to_string()));
            }
            terms.push(self.criterion(part)?);
        }
        Ok(Condition::all(terms).unwrap_or(Condition::And(Vec::new())))
    }

    fn criterion(&mut self, words: &[&str]) -> Result<Condition> {
        let (property, comparator) = COMPARATORS
            .iter()
            .find(|(suffix, _)| words.len() > suffix.len() && words.ends_with(suffix))
            .map(|(suffix, comparator)| (&words[..words.len() - suffix.len()], *comparator))
            .unwrap_or((words, Comparator::Compare(CompareOp::Eq)));

        let column = self.property(property)?;
        let operand = Operand::Column(column);
        let condition = match comparator {
            Comparator::Compare(op) => Condition::Compare {
                left: operand,
                op,
                right: Operand::Param(self.param()),
            },
            Comparator::In { negated } => Condition::In {
                operand,
                list: Operand::Param(self.param()),
                negated,
            },
            Comparator::IsNull { negated } => Condition::IsNull { operand, negated },
        };
        Ok(condition)
    }

    fn param(&mut self) -> Param {
        let param = Param::Positional(self.next_param);
        self.next_param += 1;
        param
    }

    /// `TeamId` -> field `team_id` on the root entity.
    fn property(&self, words: &[&str]) -> Result<ColumnRef> {
        let field = words
            .iter()
            .map(|word| word.to_ascii_lowercase())
            .collect::<Vec<_>>()
            .join("_");
        let meta = self.descriptor.root;
        match meta.column_for(&field) {
            Some(column) => Ok(ColumnRef::new(self.descriptor.alias.clone(), column)),
            None => Err(self.invalid(format!(
                "no property '{}' ({}) on {}; known: {}",
                words.concat(),
                field,
                meta.name,
                meta.field_names().join(", ")
            ))),
        }
    }

    fn ordering(&self, words: &[&str]) -> Result<Vec<OrderBy>> {
        let mut orders = Vec::new();
        let mut property: Vec<&str> = Vec::new();
        for word in words {
            let direction = match *word {
                "Asc" => Some(Direction::Asc),
                "Desc" => Some(Direction::Desc),
                _ => None,
            };
            match direction {
                Some(direction) => {
                    if property.is_empty() {
                        return Err(self.invalid(format!("'{}' without a property in OrderBy", word)));
                    }
                    orders.push(OrderBy {
                        column: self.property(&property)?,
                        direction,
                    });
                    property.clear();
                }
                None => property.push(word),
            }
        }
        if !property.is_empty() {
            orders.push(OrderBy {
                column: self.property(&property)?,
                direction: Direction::Asc,
            });
        }
        if orders.is_empty() {
            return Err(self.invalid("OrderBy names no property".to_string()));
        }
        Ok(orders)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::DataType;
    use crate::mapping::FieldMeta;

    static PERSON: EntityMeta = EntityMeta {
        name: "Person",
        table: "person",
        id_field: "id",
        id_column: "person_id",
        fields: &[
            FieldMeta::new("username", "username", DataType::Text),
            FieldMeta::new("age", "age", DataType::Integer),
            FieldMeta::new("team_id", "team_id", DataType::Integer),
        ],
        relations: &[],
        version_field: None,
        graphs: &[],
    };

    fn sql(method: &str) -> String {
        derive(&PERSON, method).unwrap().select.to_string()
    }

    #[test]
    fn test_equality_and_comparison() {
        assert_eq!(
            sql("findByUsernameAndAgeGreaterThan"),
            "SELECT p.* FROM person p WHERE p.username = ?1 AND p.age > ?2"
        );
        assert_eq!(
            sql("findByAgeGreaterThanEqual"),
            "SELECT p.* FROM person p WHERE p.age >= ?1"
        );
    }

    #[test]
    fn test_subject_is_ignored() {
        assert_eq!(sql("findListByUsername"), sql("findByUsername"));
        assert_eq!(sql("findReadOnlyByUsername"), sql("findByUsername"));
    }

    #[test]
    fn test_or_binds_looser_than_and() {
        assert_eq!(
            sql("findByUsernameOrAgeLessThanAndTeamIdIsNull"),
            "SELECT p.* FROM person p WHERE p.username = ?1 OR (p.age < ?2 AND p.team_id IS NULL)"
        );
    }

    #[test]
    fn test_in_and_null_checks() {
        assert_eq!(
            sql("findByUsernameInAndTeamIdIsNotNull"),
            "SELECT p.* FROM person p WHERE p.username IN ?1 AND p.team_id IS NOT NULL"
        );
        assert_eq!(
            sql("findByAgeNotIn"),
            "SELECT p.* FROM person p WHERE p.age NOT IN ?1"
        );
    }

    #[test]
    fn test_order_by_suffix() {
        assert_eq!(
            sql("findByAgeOrderByUsernameDescIdAsc"),
            "SELECT p.* FROM person p WHERE p.age = ?1 ORDER BY p.username DESC, p.person_id ASC"
        );
    }

    #[test]
    fn test_count_and_find_all() {
        assert_eq!(
            sql("countByAge"),
            "SELECT COUNT(*) FROM person p WHERE p.age = ?1"
        );
        assert_eq!(sql("findAll"), "SELECT p.* FROM person p");
    }

    #[test]
    fn test_unknown_property_names_token() {
        let err = derive(&PERSON, "findByNicknameAndAge").unwrap_err();
        match err {
            DbError::Validation(message) => {
                assert!(message.contains("Nickname"), "{}", message);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_malformed_names() {
        assert!(derive(&PERSON, "fetchByUsername").is_err());
        assert!(derive(&PERSON, "findByUsernameAnd").is_err());
        assert!(derive(&PERSON, "findByOrAge").is_err());
        assert!(derive(&PERSON, "findByAgeOrderBy").is_err());
        assert!(derive(&PERSON, "findByGreaterThan").is_err());
    }
}
