//! Dotted join paths such as `a.b.c`.
//!
//! Every segment but the last names a foreign-key column whose value is resolved to a row of
//! the referenced table; the last segment is read from the final row. A null anywhere along
//! the path evaluates to [`Value::Null`].
use std::{cmp::Ordering, fmt, sync::Arc};

use crate::{ClientError, protocol::TableId};

use super::{Row, Value};

/// Resolves foreign keys while walking a [`JoinPath`].
pub trait Resolver {
    /// Table referenced by `column` of `table`, if that column is a foreign key.
    fn foreign_key(&self, table: TableId, column: &str) -> Option<TableId>;

    /// Row of `table` whose primary key equals `key`.
    fn resolve(&self, table: TableId, key: &Value) -> Result<Option<Arc<dyn Row>>, ClientError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinPath {
    segments: Vec<String>,
}

impl JoinPath {
    pub fn parse(path: &str) -> Result<Self, ClientError> {
        let segments = path
            .split('.')
            .map(|s| s.trim().to_string())
            .collect::<Vec<String>>();
        if segments.iter().any(String::is_empty) {
            return Err(ClientError::InvalidExpression {
                path: path.to_string(),
                reason: "empty path segment".into(),
            });
        }
        Ok(Self { segments })
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    fn invalid(&self, reason: String) -> ClientError {
        ClientError::InvalidExpression {
            path: self.to_string(),
            reason,
        }
    }

    /// Evaluates the path starting at `row` of `table`.
    pub fn evaluate(
        &self,
        table: TableId,
        row: &dyn Row,
        resolver: &dyn Resolver,
    ) -> Result<Value, ClientError> {
        let mut table = table;
        let mut joined: Option<Arc<dyn Row>> = None;

        for (i, segment) in self.segments.iter().enumerate() {
            let current: &dyn Row = match &joined {
                Some(joined) => joined.as_ref(),
                None => row,
            };
            let value = current
                .column(segment)
                .ok_or_else(|| self.invalid(format!("no column '{segment}' in table {table}")))?;

            if i + 1 == self.segments.len() || value.is_null() {
                return Ok(value);
            }

            let target = resolver
                .foreign_key(table, segment)
                .ok_or_else(|| self.invalid(format!("'{segment}' is not a foreign key")))?;
            let next = resolver.resolve(target, &value)?.ok_or_else(|| {
                ClientError::DataIntegrity(format!(
                    "{segment} = {value} has no matching row in table {target}"
                ))
            })?;
            joined = Some(next);
            table = target;
        }

        Ok(Value::Null)
    }
}

impl fmt::Display for JoinPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.segments.join("."))
    }
}

/// One `(joinPath, ascending)` pair of a default ordering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    pub path: JoinPath,
    pub ascending: bool,
}

impl OrderBy {
    pub fn asc(path: &str) -> Result<Self, ClientError> {
        Ok(Self {
            path: JoinPath::parse(path)?,
            ascending: true,
        })
    }

    pub fn desc(path: &str) -> Result<Self, ClientError> {
        Ok(Self {
            path: JoinPath::parse(path)?,
            ascending: false,
        })
    }
}

/// Stable sort of `rows` by the evaluated `order` expressions.
pub fn sort_rows<R: Row>(
    rows: Vec<Arc<R>>,
    order: &[OrderBy],
    table: TableId,
    resolver: &dyn Resolver,
) -> Result<Vec<Arc<R>>, ClientError> {
    let mut keyed = Vec::with_capacity(rows.len());
    for row in rows {
        let key = order
            .iter()
            .map(|o| o.path.evaluate(table, row.as_ref(), resolver))
            .collect::<Result<Vec<Value>, ClientError>>()?;
        keyed.push((key, row));
    }

    keyed.sort_by(|(a, _), (b, _)| {
        for (o, (x, y)) in order.iter().zip(a.iter().zip(b.iter())) {
            let ord = if o.ascending { x.cmp(y) } else { y.cmp(x) };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });

    Ok(keyed.into_iter().map(|(_, row)| row).collect())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[derive(Debug)]
    struct Node {
        id: i64,
        name: &'static str,
        parent: Option<i64>,
    }

    impl Row for Node {
        fn column(&self, name: &str) -> Option<Value> {
            match name {
                "id" => Some(Value::Int(self.id)),
                "name" => Some(Value::from(self.name)),
                "parent" => Some(Value::from(self.parent)),
                _ => None,
            }
        }
    }

    struct Nodes(HashMap<i64, Arc<Node>>);

    impl Resolver for Nodes {
        fn foreign_key(&self, table: TableId, column: &str) -> Option<TableId> {
            (column == "parent").then_some(table)
        }

        fn resolve(&self, _table: TableId, key: &Value) -> Result<Option<Arc<dyn Row>>, ClientError> {
            let Value::Int(id) = key else {
                return Ok(None);
            };
            Ok(self.0.get(id).map(|n| n.clone() as Arc<dyn Row>))
        }
    }

    fn nodes() -> (Vec<Arc<Node>>, Nodes) {
        let rows = vec![
            Arc::new(Node { id: 1, name: "root", parent: None }),
            Arc::new(Node { id: 2, name: "zeta", parent: Some(1) }),
            Arc::new(Node { id: 3, name: "alpha", parent: Some(2) }),
            Arc::new(Node { id: 4, name: "orphan", parent: Some(99) }),
        ];
        let map = rows.iter().map(|n| (n.id, n.clone())).collect();
        (rows, Nodes(map))
    }

    #[test]
    fn parse_rejects_empty_segments() {
        assert!(JoinPath::parse("a..b").is_err());
        assert_eq!(JoinPath::parse("a.b.c").unwrap().segments().len(), 3);
    }

    #[test]
    fn evaluates_joins() {
        let (rows, resolver) = nodes();
        let path = JoinPath::parse("parent.parent.name").unwrap();
        assert_eq!(
            path.evaluate(TableId(0), rows[2].as_ref(), &resolver).unwrap(),
            Value::from("root")
        );
        assert_eq!(
            path.evaluate(TableId(0), rows[0].as_ref(), &resolver).unwrap(),
            Value::Null
        );
    }

    #[test]
    fn dangling_foreign_key_is_integrity_error() {
        let (rows, resolver) = nodes();
        let path = JoinPath::parse("parent.name").unwrap();
        let err = path
            .evaluate(TableId(0), rows[3].as_ref(), &resolver)
            .unwrap_err();
        assert!(matches!(err, ClientError::DataIntegrity(_)));
    }

    #[test]
    fn unknown_column_is_invalid_expression() {
        let (rows, resolver) = nodes();
        let err = JoinPath::parse("name.length")
            .unwrap()
            .evaluate(TableId(0), rows[0].as_ref(), &resolver)
            .unwrap_err();
        assert!(matches!(err, ClientError::InvalidExpression { .. }));
    }

    #[test]
    fn sorts_by_multiple_keys() {
        let (rows, resolver) = nodes();
        let rows = rows.into_iter().take(3).collect::<Vec<_>>();
        let sorted = sort_rows(
            rows.clone(),
            &[OrderBy::asc("name").unwrap()],
            TableId(0),
            &resolver,
        )
        .unwrap();
        let names = sorted.iter().map(|n| n.name).collect::<Vec<_>>();
        assert_eq!(names, vec!["alpha", "root", "zeta"]);

        let sorted = sort_rows(
            rows,
            &[OrderBy::desc("parent").unwrap(), OrderBy::asc("id").unwrap()],
            TableId(0),
            &resolver,
        )
        .unwrap();
        let ids = sorted.iter().map(|n| n.id).collect::<Vec<_>>();
        assert_eq!(ids, vec![3, 2, 1]);
    }
}
