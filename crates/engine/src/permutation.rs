use trinity_core::AttributePath;

use crate::error::EngineError;
use crate::query::{
    FilterStatement, Include, Query, QueryValue, RelationSubquery, WhereFilter, scoped_variable,
};

/// Re-root a relational query at every collection it reaches.
///
/// The first entry is the query itself. Every other entry selects rows of a
/// nested collection that take part in a match of the original query: the
/// former parent hangs below it as an `Exists`, joined through the reversed
/// link operators. Edges are `Exists` filters (also inside `and`/`or`
/// groups), include subqueries and relational order paths. Only membership
/// is preserved; order, limit and includes of the original root are dropped.
pub fn generate_query_root_permutations(query: &Query) -> Result<Vec<Query>, EngineError> {
    let mut out = vec![query.clone()];
    reroot(query, None, &mut out)?;
    Ok(out)
}

/// Where a subquery hangs off its parent.
enum Edge {
    /// Index path through the filter tree to an `Exists`.
    Filter(Vec<usize>),
    Include,
    Order,
}

/// `query`'s own rows joined to whatever already hangs above it (`above`,
/// already rewritten to be nested under `query`).
fn reroot(query: &Query, above: Option<&Query>, out: &mut Vec<Query>) -> Result<(), EngineError> {
    for (edge, rs) in edges(query) {
        let (links, rest) = split_links(&rs.subquery.filters)?;

        // The former parent, minus the edge we are walking down, joined back to the child.
        let mut parent = membership_only(without_edge(query, &edge));
        if let Some(above) = above {
            parent.filters.push(WhereFilter::exists(above.clone()));
        }
        for link in &links {
            parent.filters.push(WhereFilter::Statement(reverse_link(link)?));
        }

        let mut child = rs.subquery.clone();
        child.filters = rest;

        let mut rooted = membership_only(child.clone());
        rooted.filters.push(WhereFilter::exists(parent.clone()));
        out.push(rooted);

        reroot(&child, Some(&parent), out)?;
    }
    Ok(())
}

fn edges(query: &Query) -> Vec<(Edge, &RelationSubquery)> {
    let mut out = Vec::new();
    for (i, filter) in query.filters.iter().enumerate() {
        filter_edges(filter, vec![i], &mut out);
    }
    for include in query.include.values() {
        if let Include::Subquery(rs) = include {
            out.push((Edge::Include, rs));
        }
    }
    for order in &query.order {
        if let Some(rs) = &order.relation {
            out.push((Edge::Order, rs.as_ref()));
        }
    }
    out
}

fn filter_edges<'q>(filter: &'q WhereFilter, path: Vec<usize>, out: &mut Vec<(Edge, &'q RelationSubquery)>) {
    match filter {
        WhereFilter::Exists(rs) => out.push((Edge::Filter(path), rs.as_ref())),
        WhereFilter::Group { filters, .. } => {
            for (i, child) in filters.iter().enumerate() {
                let mut nested = path.clone();
                nested.push(i);
                filter_edges(child, nested, out);
            }
        }
        _ => {}
    }
}

/// `query` with the walked edge taken as satisfied. A top-level `Exists` is
/// dropped; one inside a group becomes `true` so the rest of the group still
/// applies. Include and order edges only shape output.
fn without_edge(query: &Query, edge: &Edge) -> Query {
    let mut query = query.clone();
    if let Edge::Filter(path) = edge {
        match path.as_slice() {
            [i] => {
                query.filters.remove(*i);
            }
            _ => {
                if let Some(node) = filter_at_mut(&mut query.filters, path) {
                    *node = WhereFilter::Boolean(true);
                }
            }
        }
    }
    query
}

fn filter_at_mut<'a>(filters: &'a mut [WhereFilter], path: &[usize]) -> Option<&'a mut WhereFilter> {
    let (first, rest) = path.split_first()?;
    let mut node = filters.get_mut(*first)?;
    for i in rest {
        node = match node {
            WhereFilter::Group { filters, .. } => filters.get_mut(*i)?,
            _ => return None,
        };
    }
    Some(node)
}

pub(crate) fn membership_only(mut query: Query) -> Query {
    query.order.clear();
    query.limit = None;
    query.after = None;
    query.include.clear();
    query.select = None;
    query
}

/// Separate `child op $1.parent` joins from the subquery's own filters.
fn split_links(filters: &[WhereFilter]) -> Result<(Vec<FilterStatement>, Vec<WhereFilter>), EngineError> {
    let mut links = Vec::new();
    let mut rest = Vec::new();
    for filter in filters {
        match filter {
            WhereFilter::Statement(stmt) if parent_reference(stmt).is_some() => {
                links.push(stmt.clone());
            }
            other => {
                if references_outer(other, 0) {
                    return Err(EngineError::InvalidQuery(
                        "cannot re-root a subquery that references outer rows outside its join"
                            .into(),
                    ));
                }
                rest.push(other.clone());
            }
        }
    }
    Ok((links, rest))
}

fn parent_reference(stmt: &FilterStatement) -> Option<AttributePath> {
    let name = stmt.value.as_variable()?;
    match scoped_variable(name)? {
        (1, path) => Some(path),
        _ => None,
    }
}

/// True when a filter reads a frame above the subquery it sits in.
fn references_outer(filter: &WhereFilter, depth: usize) -> bool {
    match filter {
        WhereFilter::Boolean(_) => false,
        WhereFilter::Statement(stmt) => stmt
            .value
            .as_variable()
            .and_then(scoped_variable)
            .is_some_and(|(level, _)| level > depth),
        WhereFilter::Group { filters, .. } => filters.iter().any(|f| references_outer(f, depth)),
        WhereFilter::Exists(rs) => rs
            .subquery
            .filters
            .iter()
            .any(|f| references_outer(f, depth + 1)),
    }
}

/// `child op $1.parent` seen from the parent: `parent op' $1.child`.
fn reverse_link(link: &FilterStatement) -> Result<FilterStatement, EngineError> {
    let parent_path = parent_reference(link)
        .ok_or_else(|| EngineError::InvalidQuery(format!("'{}' is not a join", link.path)))?;
    let op = link.op.reversed().ok_or_else(|| {
        EngineError::InvalidQuery(format!("join operator '{}' cannot be reversed", link.op))
    })?;
    Ok(FilterStatement {
        path: parent_path,
        op,
        value: QueryValue::Variable(format!("1.{}", link.path.to_dotted())),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{Operator, OrderDirection};
    use trinity_core::Cardinality;

    fn statements(query: &Query) -> Vec<(String, Operator, QueryValue)> {
        query
            .filters
            .iter()
            .filter_map(|f| match f {
                WhereFilter::Statement(s) => Some((s.path.to_dotted(), s.op, s.value.clone())),
                _ => None,
            })
            .collect()
    }

    fn exists(query: &Query) -> Vec<&Query> {
        query
            .filters
            .iter()
            .filter_map(|f| match f {
                WhereFilter::Exists(rs) => Some(&rs.subquery),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn single_hop_reverses_the_join() {
        let users = Query::new("users")
            .filter("id", Operator::Eq, QueryValue::var("1.author_id"))
            .filter("age", Operator::Gt, 30);
        let posts = Query::new("posts")
            .filter("published", Operator::Eq, true)
            .filter_with(WhereFilter::exists(users))
            .order("title", OrderDirection::Asc)
            .limit(5);

        let perms = generate_query_root_permutations(&posts).unwrap();
        assert_eq!(perms.len(), 2);
        assert_eq!(perms[0], posts);

        let rooted = &perms[1];
        assert_eq!(rooted.collection_name, "users");
        assert_eq!(
            statements(rooted),
            vec![("age".to_string(), Operator::Gt, QueryValue::from(30))]
        );
        let parent = exists(rooted);
        assert_eq!(parent.len(), 1);
        assert_eq!(parent[0].collection_name, "posts");
        assert!(parent[0].order.is_empty());
        assert_eq!(parent[0].limit, None);
        assert_eq!(
            statements(parent[0]),
            vec![
                ("published".to_string(), Operator::Eq, QueryValue::from(true)),
                ("author_id".to_string(), Operator::Eq, QueryValue::var("1.id")),
            ]
        );
    }

    #[test]
    fn two_hops_chain_back_to_the_root() {
        let orgs = Query::new("orgs").filter("id", Operator::In, QueryValue::var("1.org_ids"));
        let users = Query::new("users")
            .filter("id", Operator::Lt, QueryValue::var("1.author_id"))
            .filter_with(WhereFilter::exists(orgs));
        let posts = Query::new("posts").filter_with(WhereFilter::exists(users));

        let perms = generate_query_root_permutations(&posts).unwrap();
        let roots: Vec<&str> = perms.iter().map(|q| q.collection_name.as_str()).collect();
        assert_eq!(roots, vec!["posts", "users", "orgs"]);

        let orgs_root = &perms[2];
        assert!(statements(orgs_root).is_empty());
        let users_mid = exists(orgs_root)[0];
        assert_eq!(users_mid.collection_name, "users");
        assert_eq!(
            statements(users_mid),
            vec![("org_ids".to_string(), Operator::Has, QueryValue::var("1.id"))]
        );
        let posts_top = exists(users_mid)[0];
        assert_eq!(posts_top.collection_name, "posts");
        assert_eq!(
            statements(posts_top),
            vec![("author_id".to_string(), Operator::Gt, QueryValue::var("1.id"))]
        );
    }

    #[test]
    fn include_subquery_is_a_root() {
        let author = Query::new("users").filter("id", Operator::Eq, QueryValue::var("1.author_id"));
        let posts = Query::new("posts").filter("published", Operator::Eq, true).include_subquery(
            "author",
            RelationSubquery {
                subquery: author,
                cardinality: Cardinality::One,
            },
        );

        let perms = generate_query_root_permutations(&posts).unwrap();
        assert_eq!(perms.len(), 2);
        let rooted = &perms[1];
        assert_eq!(rooted.collection_name, "users");
        assert!(statements(rooted).is_empty());
        let parent = exists(rooted)[0];
        assert!(parent.include.is_empty());
        assert_eq!(
            statements(parent),
            vec![
                ("published".to_string(), Operator::Eq, QueryValue::from(true)),
                ("author_id".to_string(), Operator::Eq, QueryValue::var("1.id")),
            ]
        );
    }

    #[test]
    fn exists_inside_or_keeps_the_other_branches() {
        let users = Query::new("users")
            .filter("id", Operator::Eq, QueryValue::var("1.author_id"))
            .filter("age", Operator::Gt, 30);
        let posts = Query::new("posts").filter_with(WhereFilter::or(vec![
            WhereFilter::exists(users),
            WhereFilter::statement("id", Operator::Eq, "nope"),
        ]));

        let perms = generate_query_root_permutations(&posts).unwrap();
        assert_eq!(perms.len(), 2);
        let rooted = &perms[1];
        assert_eq!(rooted.collection_name, "users");
        assert_eq!(
            statements(rooted),
            vec![("age".to_string(), Operator::Gt, QueryValue::from(30))]
        );
        let parent = exists(rooted)[0];
        assert_eq!(
            parent.filters[0],
            WhereFilter::or(vec![
                WhereFilter::Boolean(true),
                WhereFilter::statement("id", Operator::Eq, "nope"),
            ])
        );
        assert_eq!(
            statements(parent),
            vec![("author_id".to_string(), Operator::Eq, QueryValue::var("1.id"))]
        );
    }

    #[test]
    fn relational_order_is_a_root() {
        let author = Query::new("users").filter("id", Operator::Eq, QueryValue::var("1.author_id"));
        let mut posts = Query::new("posts").order("author.name", OrderDirection::Asc);
        posts.order[0].relation = Some(Box::new(RelationSubquery {
            subquery: author,
            cardinality: Cardinality::One,
        }));

        let perms = generate_query_root_permutations(&posts).unwrap();
        let roots: Vec<&str> = perms.iter().map(|q| q.collection_name.as_str()).collect();
        assert_eq!(roots, vec!["posts", "users"]);
        assert!(exists(&perms[1])[0].order.is_empty());
    }

    #[test]
    fn irreversible_join_is_rejected() {
        let users = Query::new("users").filter("name", Operator::Like, QueryValue::var("1.pattern"));
        let posts = Query::new("posts").filter_with(WhereFilter::exists(users));
        assert!(matches!(
            generate_query_root_permutations(&posts),
            Err(EngineError::InvalidQuery(_))
        ));
    }
}
