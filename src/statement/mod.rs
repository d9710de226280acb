//! Store-level statements.
//!
//! The session and the query executor never talk to the store in text: they
//! build these structures, bind parameters into them and hand them to a
//! [`Store`](crate::storage::Store). `Display` renders the SQL equivalent for
//! logs and tests.

mod params;
mod render;

pub use params::Params;

use crate::core::{DbError, Result, Value};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ColumnRef {
    pub alias: String,
    pub column: String,
}

impl ColumnRef {
    pub fn new(alias: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
            column: column.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Param {
    Named(String),
    /// 1-based, as written `?1` in query text.
    Positional(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Column(ColumnRef),
    Value(Value),
    Param(Param),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    NotEq,
    Gt,
    Ge,
    Lt,
    Le,
}

impl CompareOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::NotEq => "<>",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Compare {
        left: Operand,
        op: CompareOp,
        right: Operand,
    },
    In {
        operand: Operand,
        list: Operand,
        negated: bool,
    },
    IsNull {
        operand: Operand,
        negated: bool,
    },
    And(Vec<Condition>),
    Or(Vec<Condition>),
}

impl Condition {
    pub fn eq(left: Operand, right: Operand) -> Self {
        Condition::Compare {
            left,
            op: CompareOp::Eq,
            right,
        }
    }

    /// Conjunction that flattens nested ANDs and drops the wrapper for a
    /// single term.
    pub fn all(conditions: Vec<Condition>) -> Option<Condition> {
        let mut flat = Vec::with_capacity(conditions.len());
        for condition in conditions {
            match condition {
                Condition::And(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        match flat.len() {
            0 => None,
            1 => flat.pop(),
            _ => Some(Condition::And(flat)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Operand(Operand),
    Arith {
        left: Box<Expr>,
        op: ArithOp,
        right: Box<Expr>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    pub table: String,
    pub alias: String,
}

impl TableRef {
    pub fn new(table: impl Into<String>, alias: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            alias: alias.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    Left,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Join {
    pub kind: JoinKind,
    pub table: TableRef,
    pub left: ColumnRef,
    pub right: ColumnRef,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SelectItem {
    /// `alias.*`, returned as `alias.column` result columns.
    AllColumns(String),
    Column(ColumnRef),
    CountAll,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderBy {
    pub column: ColumnRef,
    pub direction: Direction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowLock {
    ForUpdate,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Select {
    pub items: Vec<SelectItem>,
    pub from: TableRef,
    pub joins: Vec<Join>,
    pub filter: Option<Condition>,
    pub order_by: Vec<OrderBy>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub lock: Option<RowLock>,
}

impl Select {
    pub fn from(from: TableRef) -> Self {
        Self {
            items: Vec::new(),
            from,
            joins: Vec::new(),
            filter: None,
            order_by: Vec::new(),
            limit: None,
            offset: None,
            lock: None,
        }
    }

    /// The same row source and filter, counting instead of projecting.
    pub fn to_count(&self) -> Select {
        Select {
            items: vec![SelectItem::CountAll],
            from: self.from.clone(),
            joins: self.joins.clone(),
            filter: self.filter.clone(),
            order_by: Vec::new(),
            limit: None,
            offset: None,
            lock: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Insert {
    pub table: String,
    pub columns: Vec<String>,
    pub values: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub column: String,
    pub value: Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Update {
    pub table: TableRef,
    pub assignments: Vec<Assignment>,
    pub filter: Option<Condition>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Delete {
    pub table: TableRef,
    pub filter: Option<Condition>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Select(Select),
    Insert(Insert),
    Update(Update),
    Delete(Delete),
}

impl Statement {
    pub fn is_write(&self) -> bool {
        !matches!(self, Statement::Select(_))
    }
}

/// Replaces parameter placeholders with bound values.
pub trait Bind: Sized {
    fn bind(&self, params: &Params) -> Result<Self>;

    /// Placeholders referenced by this node, in first-use order.
    fn collect_params(&self, out: &mut Vec<Param>);
}

fn push_unique(out: &mut Vec<Param>, param: &Param) {
    if !out.contains(param) {
        out.push(param.clone());
    }
}

impl Bind for Operand {
    fn bind(&self, params: &Params) -> Result<Self> {
        match self {
            Operand::Param(param) => Ok(Operand::Value(params.get(param)?.clone())),
            other => Ok(other.clone()),
        }
    }

    fn collect_params(&self, out: &mut Vec<Param>) {
        if let Operand::Param(param) = self {
            push_unique(out, param);
        }
    }
}

impl Bind for Condition {
    fn bind(&self, params: &Params) -> Result<Self> {
        Ok(match self {
            Condition::Compare { left, op, right } => Condition::Compare {
                left: left.bind(params)?,
                op: *op,
                right: right.bind(params)?,
            },
            Condition::In {
                operand,
                list,
                negated,
            } => {
                let list = list.bind(params)?;
                if let Operand::Value(value) = &list
                    && !matches!(value, Value::List(_))
                {
                    return Err(DbError::TypeMismatch(format!(
                        "IN expects a collection parameter, got {}",
                        value.type_name()
                    )));
                }
                Condition::In {
                    operand: operand.bind(params)?,
                    list,
                    negated: *negated,
                }
            }
            Condition::IsNull { operand, negated } => Condition::IsNull {
                operand: operand.bind(params)?,
                negated: *negated,
            },
            Condition::And(terms) => Condition::And(
                terms
                    .iter()
                    .map(|term| term.bind(params))
                    .collect::<Result<_>>()?,
            ),
            Condition::Or(terms) => Condition::Or(
                terms
                    .iter()
                    .map(|term| term.bind(params))
                    .collect::<Result<_>>()?,
            ),
        })
    }

    fn collect_params(&self, out: &mut Vec<Param>) {
        match self {
            Condition::Compare { left, right, .. } => {
                left.collect_params(out);
                right.collect_params(out);
            }
            Condition::In { operand, list, .. } => {
                operand.collect_params(out);
                list.collect_params(out);
            }
            Condition::IsNull { operand, .. } => operand.collect_params(out),
            Condition::And(terms) | Condition::Or(terms) => {
                for term in terms {
                    term.collect_params(out);
                }
            }
        }
    }
}

impl Bind for Expr {
    fn bind(&self, params: &Params) -> Result<Self> {
        Ok(match self {
            Expr::Operand(operand) => Expr::Operand(operand.bind(params)?),
            Expr::Arith { left, op, right } => Expr::Arith {
                left: Box::new(left.bind(params)?),
                op: *op,
                right: Box::new(right.bind(params)?),
            },
        })
    }

    fn collect_params(&self, out: &mut Vec<Param>) {
        match self {
            Expr::Operand(operand) => operand.collect_params(out),
            Expr::Arith { left, right, .. } => {
                left.collect_params(out);
                right.collect_params(out);
            }
        }
    }
}

fn bind_filter(filter: &Option<Condition>, params: &Params) -> Result<Option<Condition>> {
    filter.as_ref().map(|f| f.bind(params)).transpose()
}

impl Bind for Select {
    fn bind(&self, params: &Params) -> Result<Self> {
        Ok(Select {
            filter: bind_filter(&self.filter, params)?,
            ..self.clone()
        })
    }

    fn collect_params(&self, out: &mut Vec<Param>) {
        if let Some(filter) = &self.filter {
            filter.collect_params(out);
        }
    }
}

impl Bind for Update {
    fn bind(&self, params: &Params) -> Result<Self> {
        Ok(Update {
            table: self.table.clone(),
            assignments: self
                .assignments
                .iter()
                .map(|assignment| {
                    Ok(Assignment {
                        column: assignment.column.clone(),
                        value: assignment.value.bind(params)?,
                    })
                })
                .collect::<Result<_>>()?,
            filter: bind_filter(&self.filter, params)?,
        })
    }

    fn collect_params(&self, out: &mut Vec<Param>) {
        for assignment in &self.assignments {
            assignment.value.collect_params(out);
        }
        if let Some(filter) = &self.filter {
            filter.collect_params(out);
        }
    }
}

impl Bind for Delete {
    fn bind(&self, params: &Params) -> Result<Self> {
        Ok(Delete {
            table: self.table.clone(),
            filter: bind_filter(&self.filter, params)?,
        })
    }

    fn collect_params(&self, out: &mut Vec<Param>) {
        if let Some(filter) = &self.filter {
            filter.collect_params(out);
        }
    }
}

impl Bind for Statement {
    fn bind(&self, params: &Params) -> Result<Self> {
        Ok(match self {
            Statement::Select(select) => Statement::Select(select.bind(params)?),
            Statement::Insert(insert) => Statement::Insert(insert.clone()),
            Statement::Update(update) => Statement::Update(update.bind(params)?),
            Statement::Delete(delete) => Statement::Delete(delete.bind(params)?),
        })
    }

    fn collect_params(&self, out: &mut Vec<Param>) {
        match self {
            Statement::Select(select) => select.collect_params(out),
            Statement::Insert(_) => {}
            Statement::Update(update) => update.collect_params(out),
            Statement::Delete(delete) => delete.collect_params(out),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_replaces_named_and_positional() {
        let condition = Condition::And(vec![
            Condition::eq(
                Operand::Column(ColumnRef::new("m", "username")),
                Operand::Param(Param::Named("username".into())),
            ),
            Condition::Compare {
                left: Operand::Column(ColumnRef::new("m", "age")),
                op: CompareOp::Gt,
                right: Operand::Param(Param::Positional(1)),
            },
        ]);
        let params = Params::new().with("username", "AAA").push(15);
        let bound = condition.bind(&params).unwrap();

        let mut remaining = Vec::new();
        bound.collect_params(&mut remaining);
        assert!(remaining.is_empty());
    }

    #[test]
    fn test_bind_reports_missing_parameter() {
        let condition = Condition::eq(
            Operand::Column(ColumnRef::new("m", "age")),
            Operand::Param(Param::Named("age".into())),
        );
        let err = condition.bind(&Params::new()).unwrap_err();
        assert!(matches!(err, DbError::MissingParameter(name) if name == "age"));
    }

    #[test]
    fn test_in_requires_collection() {
        let condition = Condition::In {
            operand: Operand::Column(ColumnRef::new("m", "username")),
            list: Operand::Param(Param::Named("names".into())),
            negated: false,
        };
        assert!(condition.bind(&Params::new().with("names", "AAA")).is_err());
        assert!(
            condition
                .bind(&Params::new().with("names", vec!["AAA", "BBB"]))
                .is_ok()
        );
    }

    #[test]
    fn test_all_flattens() {
        let a = Condition::IsNull {
            operand: Operand::Column(ColumnRef::new("m", "team_id")),
            negated: false,
        };
        assert_eq!(Condition::all(vec![a.clone()]), Some(a.clone()));
        assert_eq!(Condition::all(vec![]), None);
        let nested = Condition::all(vec![Condition::And(vec![a.clone(), a.clone()]), a.clone()]);
        assert!(matches!(nested, Some(Condition::And(terms)) if terms.len() == 3));
    }
}
