//! A small entity query language over registered entities.
//!
//! ```text
//! select m from Member m left join fetch m.team where m.age >= :age order by m.username desc
//! select new MemberDto(m.id, m.username, t.name) from Member m join m.team t
//! select count(m) from Member m where m.age = ?1
//! update Member m set m.age = m.age + 1 where m.age >= :age
//! delete from Member m where m.username in :names
//! ```
//!
//! Names in the text are entity and field names, never tables or columns.
//! Parsing resolves every name against the [`EntityRegistry`], so a typo
//! fails when the query is registered.

use crate::core::{DbError, Result, Value};
use crate::mapping::EntityRegistry;
use crate::statement::{
    ArithOp, Assignment, ColumnRef, CompareOp, Condition, Delete, Direction, Expr, JoinKind,
    Operand, OrderBy, Param, Statement, TableRef, Update,
};

use super::descriptor::{BulkDescriptor, Projection, QueryDescriptor, SelectDescriptor};

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Integer(i64),
    Float(f64),
    Text(String),
    Named(String),
    Positional(usize),
    Symbol(&'static str),
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Token::Ident(name) => write!(f, "{}", name),
            Token::Integer(n) => write!(f, "{}", n),
            Token::Float(n) => write!(f, "{}", n),
            Token::Text(text) => write!(f, "'{}'", text),
            Token::Named(name) => write!(f, ":{}", name),
            Token::Positional(index) => write!(f, "?{}", index),
            Token::Symbol(symbol) => f.write_str(symbol),
        }
    }
}

const RESERVED: &[&str] = &[
    "select", "from", "where", "join", "left", "inner", "outer", "fetch", "order", "by", "and",
    "or", "not", "in", "is", "null", "set", "update", "delete", "new", "count", "asc", "desc",
    "distinct", "as", "true", "false",
];

fn is_reserved(word: &str) -> bool {
    RESERVED.iter().any(|reserved| reserved.eq_ignore_ascii_case(word))
}

fn invalid(text: &str, message: impl std::fmt::Display) -> DbError {
    DbError::Validation(format!("'{}': {}", text, message))
}

fn tokenize(text: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = text.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }

        if c.is_ascii_digit() {
            let start = i;
            while i < chars.len() && chars[i].is_ascii_digit() {
                i += 1;
            }
            let mut float = false;
            if i + 1 < chars.len() && chars[i] == '.' && chars[i + 1].is_ascii_digit() {
                float = true;
                i += 1;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
            }
            let literal: String = chars[start..i].iter().collect();
            if i < chars.len() && (chars[i].is_alphabetic() || chars[i] == '_') {
                let rest: String = chars[i..]
                    .iter()
                    .take_while(|c| c.is_alphanumeric() || **c == '_')
                    .collect();
                return Err(invalid(
                    text,
                    format!(
                        "numeric literal {} runs into '{}' at offset {}; missing whitespace?",
                        literal, rest, start
                    ),
                ));
            }
            let token = if float {
                literal.parse().map(Token::Float).ok()
            } else {
                literal.parse().map(Token::Integer).ok()
            };
            tokens.push(token.ok_or_else(|| {
                invalid(text, format!("numeric literal {} is out of range", literal))
            })?);
            continue;
        }

        if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            tokens.push(Token::Ident(chars[start..i].iter().collect()));
            continue;
        }

        match c {
            '\'' => {
                let mut literal = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(invalid(text, "unterminated string literal")),
                        Some('\'') if chars.get(i + 1) == Some(&'\'') => {
                            literal.push('\'');
                            i += 2;
                        }
                        Some('\'') => {
                            i += 1;
                            break;
                        }
                        Some(other) => {
                            literal.push(*other);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Text(literal));
            }
            ':' => {
                let start = i + 1;
                i = start;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                if i == start {
                    return Err(invalid(text, format!("empty parameter name at offset {}", start)));
                }
                tokens.push(Token::Named(chars[start..i].iter().collect()));
            }
            '?' => {
                let start = i + 1;
                i = start;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
                let index: String = chars[start..i].iter().collect();
                match index.parse::<usize>() {
                    Ok(index) if index > 0 => tokens.push(Token::Positional(index)),
                    _ => {
                        return Err(invalid(
                            text,
                            format!("positional parameter at offset {} needs an index from 1", start - 1),
                        ));
                    }
                }
            }
            '<' | '>' | '!' => {
                let next = chars.get(i + 1).copied();
                let (symbol, width) = match (c, next) {
                    ('<', Some('=')) => ("<=", 2),
                    ('<', Some('>')) => ("<>", 2),
                    ('>', Some('=')) => (">=", 2),
                    ('!', Some('=')) => ("<>", 2),
                    ('<', _) => ("<", 1),
                    ('>', _) => (">", 1),
                    _ => return Err(invalid(text, format!("unexpected '!' at offset {}", i))),
                };
                tokens.push(Token::Symbol(symbol));
                i += width;
            }
            _ => {
                let symbol = match c {
                    ',' => ",",
                    '.' => ".",
                    '(' => "(",
                    ')' => ")",
                    '=' => "=",
                    '+' => "+",
                    '-' => "-",
                    '*' => "*",
                    other => {
                        return Err(invalid(
                            text,
                            format!("unexpected character '{}' at offset {}", other, i),
                        ));
                    }
                };
                tokens.push(Token::Symbol(symbol));
                i += 1;
            }
        }
    }
    Ok(tokens)
}

/// `alias.field` as written in the text.
#[derive(Debug, Clone)]
struct Path {
    alias: String,
    field: String,
}

#[derive(Debug)]
enum SelectList {
    Alias(String),
    Count(Option<String>),
    Constructor(String, Vec<Path>),
    Paths(Vec<Path>),
}

/// Parses `text` into a descriptor.
pub fn parse(registry: &EntityRegistry, text: &str) -> Result<QueryDescriptor> {
    let tokens = tokenize(text)?;
    let mut parser = Parser {
        registry,
        text,
        tokens,
        pos: 0,
    };
    let descriptor = if parser.peek_keyword("select") {
        QueryDescriptor::Select(parser.select()?)
    } else if parser.peek_keyword("update") {
        QueryDescriptor::Bulk(parser.update()?)
    } else if parser.peek_keyword("delete") {
        QueryDescriptor::Bulk(parser.delete()?)
    } else {
        return Err(invalid(text, "expected select, update or delete"));
    };
    if let Some(token) = parser.tokens.get(parser.pos) {
        return Err(invalid(text, format!("unexpected '{}' after the query", token)));
    }
    Ok(descriptor)
}

struct Parser<'a> {
    registry: &'a EntityRegistry,
    text: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn invalid(&self, message: impl std::fmt::Display) -> DbError {
        invalid(self.text, message)
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn describe_next(&self) -> String {
        match self.peek() {
            Some(token) => format!("'{}'", token),
            None => "end of query".to_string(),
        }
    }

    fn peek_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Some(Token::Ident(word)) if word.eq_ignore_ascii_case(keyword))
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        let found = self.peek_keyword(keyword);
        if found {
            self.pos += 1;
        }
        found
    }

    fn expect_keyword(&mut self, keyword: &str) -> Result<()> {
        if self.eat_keyword(keyword) {
            return Ok(());
        }
        Err(self.invalid(format!("expected '{}', found {}", keyword, self.describe_next())))
    }

    fn peek_symbol(&self, symbol: &str) -> bool {
        matches!(self.peek(), Some(Token::Symbol(s)) if *s == symbol)
    }

    fn eat_symbol(&mut self, symbol: &str) -> bool {
        let found = self.peek_symbol(symbol);
        if found {
            self.pos += 1;
        }
        found
    }

    fn expect_symbol(&mut self, symbol: &str) -> Result<()> {
        if self.eat_symbol(symbol) {
            return Ok(());
        }
        Err(self.invalid(format!("expected '{}', found {}", symbol, self.describe_next())))
    }

    /// Any identifier that is not a keyword.
    fn name(&mut self, what: &str) -> Result<String> {
        match self.peek() {
            Some(Token::Ident(word)) if !is_reserved(word) => {
                let word = word.clone();
                self.pos += 1;
                Ok(word)
            }
            _ => Err(self.invalid(format!("expected {}, found {}", what, self.describe_next()))),
        }
    }

    fn peek_name(&self) -> bool {
        matches!(self.peek(), Some(Token::Ident(word)) if !is_reserved(word))
    }

    fn path(&mut self) -> Result<Path> {
        let alias = self.name("an alias")?;
        self.expect_symbol(".")?;
        let field = self.name("a field name")?;
        if self.peek_symbol(".") {
            return Err(self.invalid(format!(
                "path {}.{}.* navigates a relation; join it and use the join alias",
                alias, field
            )));
        }
        Ok(Path { alias, field })
    }

    /// `Member m` or `Member as m`.
    fn root(&mut self) -> Result<SelectDescriptor> {
        let entity = self.name("an entity name")?;
        let meta = self
            .registry
            .meta(&entity)
            .map_err(|_| self.invalid(format!("unknown entity '{}'", entity)))?;
        self.eat_keyword("as");
        let alias = self.name(&format!("an alias for {}", entity))?;
        Ok(SelectDescriptor::new(self.text, meta, alias))
    }

    fn select(&mut self) -> Result<SelectDescriptor> {
        self.expect_keyword("select")?;
        // Roots are always returned once each.
        self.eat_keyword("distinct");
        let list = self.select_list()?;
        self.expect_keyword("from")?;
        let mut descriptor = self.root()?;

        self.joins(&mut descriptor)?;
        if self.eat_keyword("where") {
            descriptor.select.filter = Some(self.disjunction(&descriptor)?);
        }
        if self.eat_keyword("order") {
            self.expect_keyword("by")?;
            descriptor.select.order_by = self.order_list(&descriptor)?;
        }

        descriptor.projection = match list {
            SelectList::Alias(alias) if alias == descriptor.alias => Projection::Entity,
            SelectList::Alias(alias) => {
                return Err(self.invalid(format!(
                    "select '{}' must name the root alias '{}'",
                    alias, descriptor.alias
                )));
            }
            SelectList::Count(alias) => {
                if let Some(alias) = alias
                    && descriptor.entity_for(&alias).is_none()
                {
                    return Err(self.invalid(format!("count({}) names an unknown alias", alias)));
                }
                if !descriptor.fetches.is_empty() {
                    return Err(self.invalid("count queries cannot fetch relations"));
                }
                Projection::Count
            }
            SelectList::Constructor(name, paths) => {
                tracing::trace!(view = %name, columns = paths.len(), "constructor projection");
                Projection::Columns(self.columns(&descriptor, &paths)?)
            }
            SelectList::Paths(paths) => Projection::Columns(self.columns(&descriptor, &paths)?),
        };
        descriptor.finish()?;
        Ok(descriptor)
    }

    fn select_list(&mut self) -> Result<SelectList> {
        if self.eat_keyword("count") {
            self.expect_symbol("(")?;
            let alias = if self.eat_symbol("*") {
                None
            } else {
                Some(self.name("an alias")?)
            };
            self.expect_symbol(")")?;
            return Ok(SelectList::Count(alias));
        }
        if self.eat_keyword("new") {
            // Package-qualified names are accepted; only the last segment matters.
            let mut name = self.name("a view name")?;
            while self.eat_symbol(".") {
                name = self.name("a view name")?;
            }
            self.expect_symbol("(")?;
            let paths = self.path_list()?;
            self.expect_symbol(")")?;
            return Ok(SelectList::Constructor(name, paths));
        }
        let alias = self.name("a select list")?;
        if !self.peek_symbol(".") {
            return Ok(SelectList::Alias(alias));
        }
        self.pos -= 1;
        Ok(SelectList::Paths(self.path_list()?))
    }

    fn path_list(&mut self) -> Result<Vec<Path>> {
        let mut paths = vec![self.path()?];
        while self.eat_symbol(",") {
            paths.push(self.path()?);
        }
        Ok(paths)
    }

    fn columns(&self, descriptor: &SelectDescriptor, paths: &[Path]) -> Result<Vec<ColumnRef>> {
        paths
            .iter()
            .map(|path| self.column(descriptor, path))
            .collect()
    }

    fn column(&self, descriptor: &SelectDescriptor, path: &Path) -> Result<ColumnRef> {
        descriptor
            .column(&path.alias, &path.field)
            .map_err(|_| match descriptor.entity_for(&path.alias) {
                Some(meta) => self.invalid(format!(
                    "{} has no field '{}' (fields: {})",
                    meta.name,
                    path.field,
                    meta.field_names().join(", ")
                )),
                None => self.invalid(format!("unknown alias '{}'", path.alias)),
            })
    }

    fn joins(&mut self, descriptor: &mut SelectDescriptor) -> Result<()> {
        loop {
            let kind = if self.eat_keyword("left") {
                self.eat_keyword("outer");
                self.expect_keyword("join")?;
                JoinKind::Left
            } else if self.eat_keyword("inner") {
                self.expect_keyword("join")?;
                JoinKind::Inner
            } else if self.eat_keyword("join") {
                JoinKind::Inner
            } else {
                return Ok(());
            };
            let fetch = self.eat_keyword("fetch");
            let owner = self.name("an alias")?;
            self.expect_symbol(".")?;
            let relation = self.name("a relation name")?;
            self.eat_keyword("as");
            let alias = if self.peek_name() {
                self.name("a join alias")?
            } else if fetch {
                format!("{}_{}", owner, relation)
            } else {
                return Err(self.invalid(format!("join {}.{} needs an alias", owner, relation)));
            };
            descriptor.join(self.registry, &owner, &relation, &alias, kind, fetch)?;
        }
    }

    fn order_list(&mut self, descriptor: &SelectDescriptor) -> Result<Vec<OrderBy>> {
        let mut orders = Vec::new();
        loop {
            let path = self.path()?;
            let direction = if self.eat_keyword("desc") {
                Direction::Desc
            } else {
                self.eat_keyword("asc");
                Direction::Asc
            };
            orders.push(OrderBy {
                column: self.column(descriptor, &path)?,
                direction,
            });
            if !self.eat_symbol(",") {
                return Ok(orders);
            }
        }
    }

    fn disjunction(&mut self, scope: &SelectDescriptor) -> Result<Condition> {
        let mut terms = vec![self.conjunction(scope)?];
        while self.eat_keyword("or") {
            terms.push(self.conjunction(scope)?);
        }
        Ok(if terms.len() == 1 {
            terms.remove(0)
        } else {
            Condition::Or(terms)
        })
    }

    fn conjunction(&mut self, scope: &SelectDescriptor) -> Result<Condition> {
        let mut terms = vec![self.negation(scope)?];
        while self.eat_keyword("and") {
            terms.push(self.negation(scope)?);
        }
        Ok(if terms.len() == 1 {
            terms.remove(0)
        } else {
            Condition::And(terms)
        })
    }

    fn negation(&mut self, scope: &SelectDescriptor) -> Result<Condition> {
        if self.eat_keyword("not") {
            return Ok(negate(self.negation(scope)?));
        }
        if self.eat_symbol("(") {
            let inner = self.disjunction(scope)?;
            self.expect_symbol(")")?;
            return Ok(inner);
        }
        self.comparison(scope)
    }

    fn comparison(&mut self, scope: &SelectDescriptor) -> Result<Condition> {
        let left = self.operand(scope)?;

        if self.eat_keyword("is") {
            let negated = self.eat_keyword("not");
            self.expect_keyword("null")?;
            return Ok(Condition::IsNull {
                operand: left,
                negated,
            });
        }

        let negated = self.eat_keyword("not");
        if self.eat_keyword("in") {
            let list = if self.eat_symbol("(") {
                let mut values = vec![self.literal()?];
                while self.eat_symbol(",") {
                    values.push(self.literal()?);
                }
                self.expect_symbol(")")?;
                Operand::Value(Value::List(values))
            } else {
                match self.operand(scope)? {
                    param @ Operand::Param(_) => param,
                    _ => return Err(self.invalid("'in' expects a parameter or a value list")),
                }
            };
            return Ok(Condition::In {
                operand: left,
                list,
                negated,
            });
        }
        if negated {
            return Err(self.invalid(format!("expected 'in' after 'not', found {}", self.describe_next())));
        }

        let op = match self.peek() {
            Some(Token::Symbol("=")) => CompareOp::Eq,
            Some(Token::Symbol("<>")) => CompareOp::NotEq,
            Some(Token::Symbol(">")) => CompareOp::Gt,
            Some(Token::Symbol(">=")) => CompareOp::Ge,
            Some(Token::Symbol("<")) => CompareOp::Lt,
            Some(Token::Symbol("<=")) => CompareOp::Le,
            _ => {
                return Err(self.invalid(format!(
                    "expected a comparison, found {}",
                    self.describe_next()
                )));
            }
        };
        self.pos += 1;
        let right = self.operand(scope)?;
        Ok(Condition::Compare { left, op, right })
    }

    fn operand(&mut self, scope: &SelectDescriptor) -> Result<Operand> {
        match self.peek().cloned() {
            Some(Token::Named(name)) => {
                self.pos += 1;
                Ok(Operand::Param(Param::Named(name)))
            }
            Some(Token::Positional(index)) => {
                self.pos += 1;
                Ok(Operand::Param(Param::Positional(index)))
            }
            Some(Token::Ident(word)) if !is_reserved(&word) => {
                let path = self.path()?;
                Ok(Operand::Column(self.column(scope, &path)?))
            }
            _ => Ok(Operand::Value(self.literal()?)),
        }
    }

    fn literal(&mut self) -> Result<Value> {
        let negative = self.eat_symbol("-");
        let value = match self.peek().cloned() {
            Some(Token::Integer(n)) => Value::Integer(if negative { -n } else { n }),
            Some(Token::Float(n)) => Value::Float(if negative { -n } else { n }),
            Some(Token::Text(text)) if !negative => Value::Text(text),
            Some(Token::Ident(word)) if !negative && word.eq_ignore_ascii_case("true") => {
                Value::Boolean(true)
            }
            Some(Token::Ident(word)) if !negative && word.eq_ignore_ascii_case("false") => {
                Value::Boolean(false)
            }
            Some(Token::Ident(word)) if !negative && word.eq_ignore_ascii_case("null") => Value::Null,
            _ => {
                return Err(self.invalid(format!("expected a value, found {}", self.describe_next())));
            }
        };
        self.pos += 1;
        Ok(value)
    }

    fn update(&mut self) -> Result<BulkDescriptor> {
        self.expect_keyword("update")?;
        let scope = self.root()?;
        self.expect_keyword("set")?;

        let mut assignments = Vec::new();
        loop {
            let target = self.path()?;
            if target.alias != scope.alias {
                return Err(self.invalid(format!(
                    "set {}.{}: only fields of '{}' can be assigned",
                    target.alias, target.field, scope.alias
                )));
            }
            if target.field == scope.root.id_field {
                return Err(self.invalid(format!("set {}.{}: the key cannot be assigned", target.alias, target.field)));
            }
            let column = self.column(&scope, &target)?;
            self.expect_symbol("=")?;
            let value = self.expression(&scope)?;
            assignments.push(Assignment {
                column: column.column,
                value,
            });
            if !self.eat_symbol(",") {
                break;
            }
        }

        let filter = if self.eat_keyword("where") {
            Some(self.disjunction(&scope)?)
        } else {
            None
        };
        Ok(BulkDescriptor {
            name: self.text.to_string(),
            root: scope.root,
            statement: Statement::Update(Update {
                table: TableRef::new(scope.root.table, scope.alias.clone()),
                assignments,
                filter,
            }),
        })
    }

    fn expression(&mut self, scope: &SelectDescriptor) -> Result<Expr> {
        let mut expr = Expr::Operand(self.operand(scope)?);
        loop {
            let op = if self.eat_symbol("+") {
                ArithOp::Add
            } else if self.eat_symbol("-") {
                ArithOp::Sub
            } else {
                return Ok(expr);
            };
            let right = Expr::Operand(self.operand(scope)?);
            expr = Expr::Arith {
                left: Box::new(expr),
                op,
                right: Box::new(right),
            };
        }
    }

    fn delete(&mut self) -> Result<BulkDescriptor> {
        self.expect_keyword("delete")?;
        self.eat_keyword("from");
        let scope = self.root()?;
        let filter = if self.eat_keyword("where") {
            Some(self.disjunction(&scope)?)
        } else {
            None
        };
        Ok(BulkDescriptor {
            name: self.text.to_string(),
            root: scope.root,
            statement: Statement::Delete(Delete {
                table: TableRef::new(scope.root.table, scope.alias.clone()),
                filter,
            }),
        })
    }
}

/// Pushes a `not` down to the leaves.
fn negate(condition: Condition) -> Condition {
    match condition {
        Condition::Compare { left, op, right } => Condition::Compare {
            left,
            op: match op {
                CompareOp::Eq => CompareOp::NotEq,
                CompareOp::NotEq => CompareOp::Eq,
                CompareOp::Gt => CompareOp::Le,
                CompareOp::Ge => CompareOp::Lt,
                CompareOp::Lt => CompareOp::Ge,
                CompareOp::Le => CompareOp::Gt,
            },
            right,
        },
        Condition::In {
            operand,
            list,
            negated,
        } => Condition::In {
            operand,
            list,
            negated: !negated,
        },
        Condition::IsNull { operand, negated } => Condition::IsNull {
            operand,
            negated: !negated,
        },
        Condition::And(terms) => Condition::Or(terms.into_iter().map(negate).collect()),
        Condition::Or(terms) => Condition::And(terms.into_iter().map(negate).collect()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{DataType, Record};
    use crate::mapping::{Entity, EntityMeta, FieldMeta, NamedGraph, RelationKind, RelationMeta};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    static CLUB: EntityMeta = EntityMeta {
        name: "Club",
        table: "club",
        id_field: "id",
        id_column: "club_id",
        fields: &[FieldMeta::new("name", "name", DataType::Text)],
        relations: &[RelationMeta {
            name: "players",
            target: "Player",
            kind: RelationKind::OneToMany { mapped_by: "club" },
        }],
        version_field: None,
        graphs: &[],
    };

    static PLAYER: EntityMeta = EntityMeta {
        name: "Player",
        table: "player",
        id_field: "id",
        id_column: "player_id",
        fields: &[
            FieldMeta::new("username", "username", DataType::Text),
            FieldMeta::new("age", "age", DataType::Integer),
            FieldMeta::new("club_id", "club_id", DataType::Integer),
        ],
        relations: &[RelationMeta {
            name: "club",
            target: "Club",
            kind: RelationKind::ManyToOne { fk_field: "club_id" },
        }],
        version_field: None,
        graphs: &[NamedGraph {
            name: "Player.club",
            paths: &["club"],
        }],
    };

    macro_rules! plain_entity {
        ($name:ident, $meta:ident) => {
            #[derive(Debug, Clone)]
            struct $name {
                id: Option<i64>,
            }

            impl Entity for $name {
                fn meta() -> &'static EntityMeta {
                    &$meta
                }
                fn id(&self) -> Option<i64> {
                    self.id
                }
                fn set_id(&mut self, id: i64) {
                    self.id = Some(id);
                }
                fn to_record(&self) -> Record {
                    Record::new()
                }
                fn from_record(record: &Record) -> Result<Self> {
                    Ok(Self {
                        id: record.get(Self::meta().id_column).and_then(Value::as_i64),
                    })
                }
                fn set_field(&mut self, field: &str, _value: Value) -> Result<()> {
                    Err(crate::mapping::unknown_field(Self::meta(), field))
                }
            }
        };
    }

    plain_entity!(Club, CLUB);
    plain_entity!(Player, PLAYER);

    fn registry() -> Arc<EntityRegistry> {
        EntityRegistry::new()
            .register::<Club>()
            .register::<Player>()
            .build()
            .unwrap()
    }

    fn select_sql(text: &str) -> String {
        match parse(&registry(), text).unwrap() {
            QueryDescriptor::Select(select) => select.select.to_string(),
            QueryDescriptor::Bulk(bulk) => panic!("expected a select, got {}", bulk.statement),
        }
    }

    fn validation(text: &str) -> String {
        match parse(&registry(), text) {
            Err(DbError::Validation(message)) => message,
            other => panic!("expected a validation error for {}, got {:?}", text, other),
        }
    }

    #[test]
    fn test_named_parameters() {
        assert_eq!(
            select_sql("select p from Player p where p.username = :username and p.age = :age"),
            "SELECT p.* FROM player p WHERE p.username = :username AND p.age = :age"
        );
    }

    #[test]
    fn test_fetch_join_without_alias() {
        let registry = registry();
        let QueryDescriptor::Select(select) =
            parse(&registry, "select p from Player p left join fetch p.club").unwrap()
        else {
            panic!("expected a select");
        };
        assert_eq!(select.fetches.len(), 1);
        assert_eq!(
            select.select.to_string(),
            "SELECT p.*, p_club.* FROM player p LEFT JOIN club p_club ON p.club_id = p_club.club_id"
        );
    }

    #[test]
    fn test_constructor_projection() {
        let registry = registry();
        let QueryDescriptor::Select(select) = parse(
            &registry,
            "select new com.example.PlayerDto(p.id, p.username, c.name) from Player p join p.club c",
        )
        .unwrap() else {
            panic!("expected a select");
        };
        assert_eq!(
            select.projection,
            Projection::Columns(vec![
                ColumnRef::new("p", "player_id"),
                ColumnRef::new("p", "username"),
                ColumnRef::new("c", "name"),
            ])
        );
    }

    #[test]
    fn test_count_in_and_order() {
        assert_eq!(
            select_sql("select count(p) from Player p where p.age = ?1"),
            "SELECT COUNT(*) FROM player p WHERE p.age = ?1"
        );
        assert_eq!(
            select_sql("select p from Player p where p.username in :names order by p.age desc, p.id"),
            "SELECT p.* FROM player p WHERE p.username IN :names ORDER BY p.age DESC, p.player_id ASC"
        );
        assert_eq!(
            select_sql("select p from Player p where not (p.age > 3 or p.username is null)"),
            "SELECT p.* FROM player p WHERE p.age <= 3 AND p.username IS NOT NULL"
        );
    }

    #[test]
    fn test_bulk_update() {
        let QueryDescriptor::Bulk(bulk) =
            parse(&registry(), "update Player p set p.age = p.age + 1 where p.age >= :age").unwrap()
        else {
            panic!("expected a bulk statement");
        };
        assert_eq!(
            bulk.statement.to_string(),
            "UPDATE player p SET age = p.age + 1 WHERE p.age >= :age"
        );
        assert_eq!(bulk.params(), vec![Param::Named("age".into())]);
    }

    #[test]
    fn test_missing_whitespace_before_where_is_rejected() {
        let message = validation("update Player p set p.age = p.age + 1where p.age >= :age");
        assert!(message.contains("1where") || message.contains("'where'"), "{}", message);
    }

    #[test]
    fn test_unknown_names_are_reported() {
        assert!(validation("select x from Ghost x").contains("Ghost"));
        assert!(validation("select p from Player p where p.nickname = :n").contains("nickname"));
        assert!(validation("select p from Player p join p.coach c").contains("coach"));
        assert!(validation("select q from Player p").contains("'q'"));
    }

    #[test]
    fn test_malformed_text() {
        validation("select p from Player p where p.username = 'open");
        validation("select p from Player p where");
        validation("select p from Player p order p.age");
        validation("select p from Player p where p.age = :age extra");
        validation("update Player p set p.id = 3");
        validation("select count(p) from Player p left join fetch p.club");
    }
}
