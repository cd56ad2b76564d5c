use std::collections::BTreeMap;

use tracing::debug;
use trinity_core::{EntityId, StateVector, Triple};
use trinity_storage::{TimestampOp, TripleReader, client_order};

use crate::error::EngineError;
use crate::execution::{ExecutionContext, ExecutionOptions, load_query};
use crate::permutation::{generate_query_root_permutations, membership_only};
use crate::query::{Operator, Query};

/// Triples a client at `state_vector` is missing for `query`.
///
/// Every write the vector does not cover is grouped by entity. An entity's
/// writes are returned when it belongs to the query either as it stood at the
/// vector or as it stands now; relational queries test membership through
/// each re-rooted permutation so a change deep in a relation still reaches
/// the root query. Output is in client-timestamp order.
pub fn fetch_delta_triples<R: TripleReader + ?Sized>(
    reader: &R,
    query: &Query,
    state_vector: &StateVector,
    opts: &ExecutionOptions,
) -> Result<Vec<Triple>, EngineError> {
    let collections = query.collections();
    let mut changed: BTreeMap<EntityId, Vec<Triple>> = BTreeMap::new();
    for client in reader.find_all_client_ids()? {
        let unseen = match state_vector.get(&client) {
            Some(tick) => reader.find_by_client_timestamp(&client, TimestampOp::Gt, tick)?,
            None => reader.find_by_client_timestamp(&client, TimestampOp::Gte, 0)?,
        };
        for triple in unseen {
            if collections.iter().any(|c| c == triple.id.collection()) {
                changed.entry(triple.id.clone()).or_default().push(triple);
            }
        }
    }
    if changed.is_empty() {
        return Ok(Vec::new());
    }

    let roots = if query.is_relational() {
        generate_query_root_permutations(query)?
            .into_iter()
            .map(membership_only)
            .collect()
    } else {
        vec![membership_only(query.clone())]
    };
    let before = ExecutionOptions {
        state_vector: Some(state_vector.clone()),
        ..opts.clone()
    };
    let after = ExecutionOptions {
        state_vector: None,
        ..opts.clone()
    };

    let mut out = Vec::new();
    for (id, triples) in changed {
        let mut relevant = false;
        for root in roots.iter().filter(|q| q.collection_name == id.collection()) {
            if is_member(reader, root, &id, &before)? || is_member(reader, root, &id, &after)? {
                relevant = true;
                break;
            }
        }
        if relevant {
            out.extend(triples);
        }
    }
    out.sort_by(client_order);
    debug!(collection = %query.collection_name, triples = out.len(), "delta computed");
    Ok(out)
}

fn is_member<R: TripleReader + ?Sized>(
    reader: &R,
    query: &Query,
    id: &EntityId,
    opts: &ExecutionOptions,
) -> Result<bool, EngineError> {
    let single = query.clone().id(id.local_id());
    let mut ctx = ExecutionContext::default();
    Ok(!load_query(reader, &single, &mut ctx, opts)?.is_empty())
}
