use std::fmt;

use super::{
    ArithOp, ColumnRef, Condition, Delete, Direction, Expr, Insert, Join, JoinKind, Operand,
    Param, RowLock, Select, SelectItem, Statement, Update,
};

impl fmt::Display for ColumnRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.alias, self.column)
    }
}

impl fmt::Display for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Param::Named(name) => write!(f, ":{}", name),
            Param::Positional(index) => write!(f, "?{}", index),
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Column(column) => write!(f, "{}", column),
            Operand::Value(value) => write!(f, "{}", value.to_sql_literal()),
            Operand::Param(param) => write!(f, "{}", param),
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::Compare { left, op, right } => {
                write!(f, "{} {} {}", left, op.symbol(), right)
            }
            Condition::In {
                operand,
                list,
                negated,
            } => {
                let keyword = if *negated { "NOT IN" } else { "IN" };
                write!(f, "{} {} {}", operand, keyword, list)
            }
            Condition::IsNull { operand, negated } => {
                let keyword = if *negated { "IS NOT NULL" } else { "IS NULL" };
                write!(f, "{} {}", operand, keyword)
            }
            Condition::And(terms) => write_terms(f, terms, " AND "),
            Condition::Or(terms) => write_terms(f, terms, " OR "),
        }
    }
}

fn write_terms(f: &mut fmt::Formatter<'_>, terms: &[Condition], separator: &str) -> fmt::Result {
    for (idx, term) in terms.iter().enumerate() {
        if idx > 0 {
            f.write_str(separator)?;
        }
        match term {
            Condition::And(_) | Condition::Or(_) => write!(f, "({})", term)?,
            _ => write!(f, "{}", term)?,
        }
    }
    Ok(())
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Operand(operand) => write!(f, "{}", operand),
            Expr::Arith { left, op, right } => {
                let symbol = match op {
                    ArithOp::Add => "+",
                    ArithOp::Sub => "-",
                };
                write!(f, "{} {} {}", left, symbol, right)
            }
        }
    }
}

impl fmt::Display for SelectItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectItem::AllColumns(alias) => write!(f, "{}.*", alias),
            SelectItem::Column(column) => write!(f, "{}", column),
            SelectItem::CountAll => write!(f, "COUNT(*)"),
        }
    }
}

impl fmt::Display for Join {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keyword = match self.kind {
            JoinKind::Inner => "JOIN",
            JoinKind::Left => "LEFT JOIN",
        };
        write!(
            f,
            "{} {} {} ON {} = {}",
            keyword, self.table.table, self.table.alias, self.left, self.right
        )
    }
}

impl fmt::Display for Select {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let items: Vec<String> = self.items.iter().map(|item| item.to_string()).collect();
        write!(
            f,
            "SELECT {} FROM {} {}",
            items.join(", "),
            self.from.table,
            self.from.alias
        )?;
        for join in &self.joins {
            write!(f, " {}", join)?;
        }
        if let Some(filter) = &self.filter {
            write!(f, " WHERE {}", filter)?;
        }
        if !self.order_by.is_empty() {
            let orders: Vec<String> = self
                .order_by
                .iter()
                .map(|order| {
                    let direction = match order.direction {
                        Direction::Asc => "ASC",
                        Direction::Desc => "DESC",
                    };
                    format!("{} {}", order.column, direction)
                })
                .collect();
            write!(f, " ORDER BY {}", orders.join(", "))?;
        }
        if let Some(limit) = self.limit {
            write!(f, " LIMIT {}", limit)?;
        }
        if let Some(offset) = self.offset {
            write!(f, " OFFSET {}", offset)?;
        }
        if let Some(RowLock::ForUpdate) = self.lock {
            write!(f, " FOR UPDATE")?;
        }
        Ok(())
    }
}

impl fmt::Display for Insert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let values: Vec<String> = self.values.iter().map(|v| v.to_sql_literal()).collect();
        write!(
            f,
            "INSERT INTO {} ({}) VALUES ({})",
            self.table,
            self.columns.join(", "),
            values.join(", ")
        )
    }
}

impl fmt::Display for Update {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let assignments: Vec<String> = self
            .assignments
            .iter()
            .map(|assignment| format!("{} = {}", assignment.column, assignment.value))
            .collect();
        write!(
            f,
            "UPDATE {} {} SET {}",
            self.table.table,
            self.table.alias,
            assignments.join(", ")
        )?;
        if let Some(filter) = &self.filter {
            write!(f, " WHERE {}", filter)?;
        }
        Ok(())
    }
}

impl fmt::Display for Delete {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DELETE FROM {} {}", self.table.table, self.table.alias)?;
        if let Some(filter) = &self.filter {
            write!(f, " WHERE {}", filter)?;
        }
        Ok(())
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Statement::Select(select) => write!(f, "{}", select),
            Statement::Insert(insert) => write!(f, "{}", insert),
            Statement::Update(update) => write!(f, "{}", update),
            Statement::Delete(delete) => write!(f, "{}", delete),
        }
    }
}
