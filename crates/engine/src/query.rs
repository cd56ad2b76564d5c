use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use trinity_core::{AttributePath, Cardinality, EntityId, Value};

use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operator {
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Lte,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Gte,
    #[serde(rename = "in")]
    In,
    #[serde(rename = "nin")]
    Nin,
    #[serde(rename = "has")]
    Has,
    #[serde(rename = "!has")]
    NotHas,
    #[serde(rename = "like")]
    Like,
    #[serde(rename = "nlike")]
    NotLike,
    #[serde(rename = "isDefined")]
    IsDefined,
}

impl Operator {
    pub const ALL: [Operator; 13] = [
        Operator::Eq,
        Operator::Ne,
        Operator::Lt,
        Operator::Lte,
        Operator::Gt,
        Operator::Gte,
        Operator::In,
        Operator::Nin,
        Operator::Has,
        Operator::NotHas,
        Operator::Like,
        Operator::NotLike,
        Operator::IsDefined,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Operator::Eq => "=",
            Operator::Ne => "!=",
            Operator::Lt => "<",
            Operator::Lte => "<=",
            Operator::Gt => ">",
            Operator::Gte => ">=",
            Operator::In => "in",
            Operator::Nin => "nin",
            Operator::Has => "has",
            Operator::NotHas => "!has",
            Operator::Like => "like",
            Operator::NotLike => "nlike",
            Operator::IsDefined => "isDefined",
        }
    }

    pub fn parse(s: &str) -> Result<Self, EngineError> {
        Operator::ALL
            .into_iter()
            .find(|op| op.as_str() == s)
            .ok_or_else(|| EngineError::InvalidQuery(format!("unknown operator '{s}'")))
    }

    pub fn is_range(self) -> bool {
        matches!(
            self,
            Operator::Lt | Operator::Lte | Operator::Gt | Operator::Gte
        )
    }

    /// Operator that expresses the same relation with its operands swapped.
    /// `None` for operators that cannot be reversed.
    pub fn reversed(self) -> Option<Self> {
        match self {
            Operator::Eq => Some(Operator::Eq),
            Operator::Ne => Some(Operator::Ne),
            Operator::Lt => Some(Operator::Gt),
            Operator::Lte => Some(Operator::Gte),
            Operator::Gt => Some(Operator::Lt),
            Operator::Gte => Some(Operator::Lte),
            Operator::In => Some(Operator::Has),
            Operator::Has => Some(Operator::In),
            Operator::Nin => Some(Operator::NotHas),
            Operator::NotHas => Some(Operator::Nin),
            Operator::Like | Operator::NotLike | Operator::IsDefined => None,
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Right-hand side of a filter statement.
///
/// Variables are named without the leading `$`. A numeric head (`1.author_id`)
/// addresses an ancestor row that many levels up the execution stack; any other
/// name is looked up in the query and session variables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryValue {
    Value(Value),
    List(Vec<Value>),
    Variable(String),
}

impl QueryValue {
    pub fn var(name: &str) -> Self {
        QueryValue::Variable(name.trim_start_matches('$').to_string())
    }

    pub fn list<V: Into<Value>>(values: impl IntoIterator<Item = V>) -> Self {
        QueryValue::List(values.into_iter().map(Into::into).collect())
    }

    pub fn as_variable(&self) -> Option<&str> {
        match self {
            QueryValue::Variable(name) => Some(name),
            _ => None,
        }
    }
}

impl From<Value> for QueryValue {
    fn from(v: Value) -> Self {
        QueryValue::Value(v)
    }
}

impl From<Vec<Value>> for QueryValue {
    fn from(values: Vec<Value>) -> Self {
        QueryValue::List(values)
    }
}

macro_rules! scalar_query_value {
    ($($t:ty),*) => {
        $(impl From<$t> for QueryValue {
            fn from(v: $t) -> Self {
                QueryValue::Value(Value::from(v))
            }
        })*
    };
}

scalar_query_value!(&str, String, f64, i64, i32, bool);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterStatement {
    pub path: AttributePath,
    pub op: Operator,
    pub value: QueryValue,
}

impl FilterStatement {
    pub fn new(path: impl Into<AttributePath>, op: Operator, value: impl Into<QueryValue>) -> Self {
        Self {
            path: path.into(),
            op,
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupOp {
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationSubquery {
    pub subquery: Query,
    pub cardinality: Cardinality,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WhereFilter {
    Boolean(bool),
    Statement(FilterStatement),
    Group { op: GroupOp, filters: Vec<WhereFilter> },
    /// Satisfied when the subquery returns at least one row.
    Exists(Box<RelationSubquery>),
}

impl WhereFilter {
    pub fn statement(
        path: impl Into<AttributePath>,
        op: Operator,
        value: impl Into<QueryValue>,
    ) -> Self {
        WhereFilter::Statement(FilterStatement::new(path, op, value))
    }

    pub fn and(filters: Vec<WhereFilter>) -> Self {
        WhereFilter::Group {
            op: GroupOp::And,
            filters,
        }
    }

    pub fn or(filters: Vec<WhereFilter>) -> Self {
        WhereFilter::Group {
            op: GroupOp::Or,
            filters,
        }
    }

    pub fn exists(subquery: Query) -> Self {
        WhereFilter::Exists(Box::new(RelationSubquery {
            subquery,
            cardinality: Cardinality::Many,
        }))
    }

    pub fn is_relational(&self) -> bool {
        match self {
            WhereFilter::Exists(_) => true,
            WhereFilter::Group { filters, .. } => filters.iter().any(WhereFilter::is_relational),
            _ => false,
        }
    }

    /// Evaluation cost class: cheap scalar checks run before subqueries.
    pub(crate) fn cost(&self) -> u8 {
        match self {
            WhereFilter::Boolean(_) => 0,
            WhereFilter::Statement(s) if s.value.as_variable().is_none() => 1,
            WhereFilter::Statement(_) => 2,
            WhereFilter::Group { .. } if !self.is_relational() => 3,
            WhereFilter::Group { .. } => 4,
            WhereFilter::Exists(_) => 5,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderDirection {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    pub path: AttributePath,
    pub direction: OrderDirection,
    /// Set by preparation when the path starts at a relation: the related row is
    /// loaded through this subquery and `path` is read from it.
    #[serde(default)]
    pub relation: Option<Box<RelationSubquery>>,
}

/// Page boundary: the order values and id of the last row already seen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub values: Vec<Option<Value>>,
    pub id: EntityId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct After {
    pub cursor: Cursor,
    pub inclusive: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Include {
    /// Named relation attribute, resolved against the schema during preparation.
    Relation(String),
    Subquery(RelationSubquery),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    pub collection_name: String,
    pub select: Option<Vec<String>>,
    pub filters: Vec<WhereFilter>,
    pub order: Vec<OrderBy>,
    pub limit: Option<usize>,
    pub after: Option<After>,
    pub include: BTreeMap<String, Include>,
    pub vars: BTreeMap<String, Value>,
}

impl Query {
    pub fn new(collection: &str) -> Self {
        Self {
            collection_name: collection.to_string(),
            ..Default::default()
        }
    }

    pub fn filter(
        mut self,
        path: impl Into<AttributePath>,
        op: Operator,
        value: impl Into<QueryValue>,
    ) -> Self {
        self.filters.push(WhereFilter::statement(path, op, value));
        self
    }

    pub fn filter_with(mut self, filter: WhereFilter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn id(self, local_id: &str) -> Self {
        self.filter("id", Operator::Eq, local_id)
    }

    pub fn order(mut self, path: impl Into<AttributePath>, direction: OrderDirection) -> Self {
        self.order.push(OrderBy {
            path: path.into(),
            direction,
            relation: None,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn after(mut self, cursor: Cursor, inclusive: bool) -> Self {
        self.after = Some(After { cursor, inclusive });
        self
    }

    pub fn select<'a>(mut self, keys: impl IntoIterator<Item = &'a str>) -> Self {
        self.select = Some(keys.into_iter().map(str::to_string).collect());
        self
    }

    pub fn include(mut self, alias: &str) -> Self {
        self.include
            .insert(alias.to_string(), Include::Relation(alias.to_string()));
        self
    }

    pub fn include_subquery(mut self, alias: &str, subquery: RelationSubquery) -> Self {
        self.include
            .insert(alias.to_string(), Include::Subquery(subquery));
        self
    }

    pub fn var(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.vars.insert(name.to_string(), value.into());
        self
    }

    pub fn is_relational(&self) -> bool {
        !self.include.is_empty()
            || self.filters.iter().any(WhereFilter::is_relational)
            || self.order.iter().any(|o| o.relation.is_some())
    }

    /// Every collection reachable from this query through subqueries, root first.
    pub fn collections(&self) -> Vec<String> {
        let mut out = vec![self.collection_name.clone()];
        let mut push = |q: &Query| {
            for c in q.collections() {
                if !out.contains(&c) {
                    out.push(c);
                }
            }
        };
        for filter in &self.filters {
            visit_subqueries(filter, &mut push);
        }
        for include in self.include.values() {
            if let Include::Subquery(rs) = include {
                push(&rs.subquery);
            }
        }
        for order in &self.order {
            if let Some(rs) = &order.relation {
                push(&rs.subquery);
            }
        }
        out
    }
}

fn visit_subqueries(filter: &WhereFilter, f: &mut impl FnMut(&Query)) {
    match filter {
        WhereFilter::Exists(rs) => f(&rs.subquery),
        WhereFilter::Group { filters, .. } => {
            for child in filters {
                visit_subqueries(child, f);
            }
        }
        _ => {}
    }
}

/// Shift numeric variable scopes by `by` levels: `1.x` becomes `2.x` for `by = 1`.
pub(crate) fn bump_scope(name: &str, by: usize) -> String {
    match name.split_once('.') {
        Some((head, rest)) => match head.parse::<usize>() {
            Ok(level) => format!("{}.{rest}", level + by),
            Err(_) => name.to_string(),
        },
        None => name.to_string(),
    }
}

/// Split `N.rest` into the scope level and the remaining path.
pub(crate) fn scoped_variable(name: &str) -> Option<(usize, AttributePath)> {
    let (head, rest) = name.split_once('.')?;
    let level = head.parse::<usize>().ok()?;
    Some((level, AttributePath::parse(rest)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operator_round_trips_through_its_symbol() {
        for op in Operator::ALL {
            assert_eq!(Operator::parse(op.as_str()).unwrap(), op);
        }
        assert!(Operator::parse("~=").is_err());
    }

    #[test]
    fn reversal_table() {
        assert_eq!(Operator::Lt.reversed(), Some(Operator::Gt));
        assert_eq!(Operator::In.reversed(), Some(Operator::Has));
        assert_eq!(Operator::NotHas.reversed(), Some(Operator::Nin));
        assert_eq!(Operator::Like.reversed(), None);
    }

    #[test]
    fn scope_bumping_only_touches_numeric_heads() {
        assert_eq!(bump_scope("1.author_id", 1), "2.author_id");
        assert_eq!(bump_scope("global.user", 1), "global.user");
        assert_eq!(bump_scope("user", 1), "user");
    }

    #[test]
    fn collections_walks_subqueries() {
        let q = Query::new("posts").filter_with(WhereFilter::exists(Query::new("users")));
        assert_eq!(q.collections(), vec!["posts".to_string(), "users".to_string()]);
    }
}
