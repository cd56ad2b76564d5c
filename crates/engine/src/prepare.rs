use trinity_core::{AttributePath, DataType, RelationDef, SchemaResolver};

use crate::error::EngineError;
use crate::query::{
    FilterStatement, Include, Operator, OrderBy, Query, QueryValue, RelationSubquery, WhereFilter,
    bump_scope,
};

/// Resolve a caller query against the schema.
///
/// * `where` statements whose path starts at a relation become `Exists`
///   subqueries over the related collection.
/// * `include` references are replaced by the relation's subquery.
/// * order keys that start at a relation record the subquery that loads the
///   related row.
/// * operators are checked against the attribute type.
///
/// Without a schema only structural checks run and relation references are
/// left in place; executing such a query fails with `QueryNotPrepared`.
pub fn prepare_query(
    query: &Query,
    schema: Option<&dyn SchemaResolver>,
) -> Result<Query, EngineError> {
    if query.after.is_some() && query.order.is_empty() {
        return Err(EngineError::InvalidQuery(format!(
            "query on '{}' uses a cursor without an order",
            query.collection_name
        )));
    }
    if let Some(after) = &query.after
        && after.cursor.values.len() != query.order.len()
    {
        return Err(EngineError::InvalidQuery(format!(
            "cursor carries {} values for {} order keys",
            after.cursor.values.len(),
            query.order.len()
        )));
    }
    if let Some(schema) = schema
        && !schema.has_collection(&query.collection_name)
    {
        return Err(EngineError::InvalidQuery(format!(
            "unknown collection '{}'",
            query.collection_name
        )));
    }

    let mut prepared = query.clone();
    prepared.filters = query
        .filters
        .iter()
        .map(|f| prepare_filter(&query.collection_name, f, schema))
        .collect::<Result<_, _>>()?;

    prepared.order = query
        .order
        .iter()
        .map(|o| prepare_order(&query.collection_name, o, schema))
        .collect::<Result<_, _>>()?;

    for (alias, include) in prepared.include.iter_mut() {
        *include = match include {
            Include::Relation(name) => match schema {
                Some(schema) => {
                    let path = AttributePath::parse(name);
                    let def = relation_at(schema, &query.collection_name, &path).ok_or_else(|| {
                        EngineError::InvalidQuery(format!(
                            "include '{alias}': '{name}' is not a relation of '{}'",
                            query.collection_name
                        ))
                    })?;
                    let subquery = prepare_query(&relation_query(def)?, Some(schema))?;
                    Include::Subquery(RelationSubquery {
                        subquery,
                        cardinality: def.cardinality,
                    })
                }
                None => Include::Relation(name.clone()),
            },
            Include::Subquery(rs) => Include::Subquery(RelationSubquery {
                subquery: prepare_query(&rs.subquery, schema)?,
                cardinality: rs.cardinality,
            }),
        };
    }
    Ok(prepared)
}

fn prepare_filter(
    collection: &str,
    filter: &WhereFilter,
    schema: Option<&dyn SchemaResolver>,
) -> Result<WhereFilter, EngineError> {
    match filter {
        WhereFilter::Boolean(_) => Ok(filter.clone()),
        WhereFilter::Group { op, filters } => Ok(WhereFilter::Group {
            op: *op,
            filters: filters
                .iter()
                .map(|f| prepare_filter(collection, f, schema))
                .collect::<Result<_, _>>()?,
        }),
        WhereFilter::Exists(rs) => {
            validate_links(&rs.subquery)?;
            Ok(WhereFilter::Exists(Box::new(RelationSubquery {
                subquery: prepare_query(&rs.subquery, schema)?,
                cardinality: rs.cardinality,
            })))
        }
        WhereFilter::Statement(stmt) => prepare_statement(collection, stmt, schema),
    }
}

fn prepare_statement(
    collection: &str,
    stmt: &FilterStatement,
    schema: Option<&dyn SchemaResolver>,
) -> Result<WhereFilter, EngineError> {
    let Some(schema) = schema else {
        return Ok(WhereFilter::Statement(stmt.clone()));
    };
    let Some(head) = stmt.path.first().cloned() else {
        return Err(EngineError::InvalidQuery("empty filter path".into()));
    };
    let head = AttributePath::new(vec![head]);

    if let Some(def) = relation_at(schema, collection, &head) {
        if stmt.path.len() == 1 {
            return Err(EngineError::InvalidQuery(format!(
                "relation '{}' on '{collection}' needs a nested path",
                head.to_dotted()
            )));
        }
        // The statement moves one frame down, so outer references move with it.
        let value = match &stmt.value {
            QueryValue::Variable(name) => QueryValue::Variable(bump_scope(name, 1)),
            other => other.clone(),
        };
        let mut subquery = relation_query(def)?;
        subquery.filters.push(WhereFilter::Statement(FilterStatement {
            path: stmt.path.skip(1),
            op: stmt.op,
            value,
        }));
        return Ok(WhereFilter::Exists(Box::new(RelationSubquery {
            subquery: prepare_query(&subquery, Some(schema))?,
            cardinality: def.cardinality,
        })));
    }

    if let Some(data_type) = schema.attribute_type(collection, &stmt.path)
        && !data_type.supports(stmt.op.as_str())
    {
        return Err(EngineError::InvalidQuery(format!(
            "operator '{}' is not supported on {} attribute '{}'",
            stmt.op,
            data_type.type_name(),
            stmt.path
        )));
    }
    Ok(WhereFilter::Statement(stmt.clone()))
}

fn prepare_order(
    collection: &str,
    order: &OrderBy,
    schema: Option<&dyn SchemaResolver>,
) -> Result<OrderBy, EngineError> {
    let Some(schema) = schema else {
        return Ok(order.clone());
    };
    if order.relation.is_some() {
        return Ok(order.clone());
    }
    let Some(head) = order.path.first().cloned() else {
        return Err(EngineError::InvalidQuery("empty order path".into()));
    };
    match relation_at(schema, collection, &AttributePath::new(vec![head])) {
        Some(def) if order.path.len() > 1 => Ok(OrderBy {
            path: order.path.skip(1),
            direction: order.direction,
            relation: Some(Box::new(RelationSubquery {
                subquery: prepare_query(&relation_query(def)?, Some(schema))?,
                cardinality: def.cardinality,
            })),
        }),
        Some(_) => Err(EngineError::InvalidQuery(format!(
            "cannot order by relation '{}' itself",
            order.path
        ))),
        None => Ok(order.clone()),
    }
}

fn relation_at<'a>(
    schema: &'a dyn SchemaResolver,
    collection: &str,
    path: &AttributePath,
) -> Option<&'a RelationDef> {
    match schema.attribute_type(collection, path)? {
        DataType::Query(def) => Some(def),
        _ => None,
    }
}

/// Subquery over the related collection joined back through `$1`.
pub(crate) fn relation_query(def: &RelationDef) -> Result<Query, EngineError> {
    let mut query = Query::new(&def.collection);
    for link in &def.links {
        let op = Operator::parse(&link.op)?;
        if op.reversed().is_none() {
            return Err(EngineError::InvalidQuery(format!(
                "relation to '{}' joins with '{op}', which cannot be reversed",
                def.collection
            )));
        }
        query.filters.push(WhereFilter::Statement(FilterStatement {
            path: AttributePath::parse(&link.child),
            op,
            value: QueryValue::Variable(format!("1.{}", link.parent)),
        }));
    }
    Ok(query)
}

/// Every join back to the parent frame must use a reversible operator.
fn validate_links(subquery: &Query) -> Result<(), EngineError> {
    for filter in &subquery.filters {
        if let WhereFilter::Statement(stmt) = filter
            && let Some(name) = stmt.value.as_variable()
            && name.starts_with("1.")
            && stmt.op.reversed().is_none()
        {
            return Err(EngineError::InvalidQuery(format!(
                "join on '{}' uses '{}', which cannot be reversed",
                stmt.path, stmt.op
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use trinity_core::{Cardinality, Schema};

    fn schema() -> Schema {
        Schema::new()
            .collection(
                "posts",
                [
                    ("id", DataType::String),
                    ("title", DataType::String),
                    ("author_id", DataType::String),
                    ("tags", DataType::set_of(DataType::String)),
                    (
                        "author",
                        DataType::Query(
                            RelationDef::new("users", Cardinality::One).link("id", "=", "author_id"),
                        ),
                    ),
                    (
                        "fuzzy",
                        DataType::Query(
                            RelationDef::new("users", Cardinality::Many).link("name", "like", "title"),
                        ),
                    ),
                ],
            )
            .collection(
                "users",
                [("id", DataType::String), ("name", DataType::String), ("age", DataType::Number)],
            )
    }

    #[test]
    fn relational_path_becomes_exists() {
        let s = schema();
        let q = Query::new("posts").filter("author.name", Operator::Eq, "ada");
        let prepared = prepare_query(&q, Some(&s)).unwrap();

        let WhereFilter::Exists(rs) = &prepared.filters[0] else {
            panic!("expected exists, got {:?}", prepared.filters[0]);
        };
        assert_eq!(rs.subquery.collection_name, "users");
        assert_eq!(rs.cardinality, Cardinality::One);
        assert_eq!(
            rs.subquery.filters,
            vec![
                WhereFilter::statement("id", Operator::Eq, QueryValue::var("1.author_id")),
                WhereFilter::statement("name", Operator::Eq, "ada"),
            ]
        );
        assert!(prepared.is_relational());
    }

    #[test]
    fn outer_variables_shift_when_moved_into_subquery() {
        let s = schema();
        let q = Query::new("posts").filter("author.name", Operator::Eq, QueryValue::var("1.owner"));
        let prepared = prepare_query(&q, Some(&s)).unwrap();
        let WhereFilter::Exists(rs) = &prepared.filters[0] else {
            panic!("expected exists");
        };
        assert_eq!(
            rs.subquery.filters[1],
            WhereFilter::statement("name", Operator::Eq, QueryValue::var("2.owner"))
        );
    }

    #[test]
    fn include_resolves_to_relation_subquery() {
        let s = schema();
        let prepared = prepare_query(&Query::new("posts").include("author"), Some(&s)).unwrap();
        match &prepared.include["author"] {
            Include::Subquery(rs) => assert_eq!(rs.subquery.collection_name, "users"),
            other => panic!("unexpected include {other:?}"),
        }

        let err = prepare_query(&Query::new("posts").include("title"), Some(&s)).unwrap_err();
        assert!(matches!(err, EngineError::InvalidQuery(_)));
    }

    #[test]
    fn unsupported_operator_is_rejected() {
        let s = schema();
        let q = Query::new("posts").filter("tags", Operator::Like, "x%");
        assert!(matches!(
            prepare_query(&q, Some(&s)),
            Err(EngineError::InvalidQuery(_))
        ));
    }

    #[test]
    fn irreversible_join_operator_is_rejected() {
        let s = schema();
        let q = Query::new("posts").filter("fuzzy.age", Operator::Gt, 3);
        assert!(matches!(
            prepare_query(&q, Some(&s)),
            Err(EngineError::InvalidQuery(_))
        ));
    }

    #[test]
    fn cursor_requires_order() {
        let q = Query::new("posts").after(
            crate::query::Cursor {
                values: vec![],
                id: trinity_core::EntityId::new("posts", "1"),
            },
            false,
        );
        assert!(matches!(prepare_query(&q, None), Err(EngineError::InvalidQuery(_))));
    }

    #[test]
    fn relational_order_records_subquery() {
        let s = schema();
        let q = Query::new("posts").order("author.age", crate::query::OrderDirection::Desc);
        let prepared = prepare_query(&q, Some(&s)).unwrap();
        assert_eq!(prepared.order[0].path, AttributePath::parse("age"));
        assert!(prepared.order[0].relation.is_some());
    }
}
