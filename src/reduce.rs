//! Merging the partial responses that meet at a join.
//!
//! A join receives one slot per predecessor, in `needs` order. Slots are
//! empty when the branch never answered (the request deadline passed). The
//! local strategies live here; `reducer_exec` needs an executor call and is
//! driven by the dispatcher, which only hands complete matrices over.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use prost_types::value::Kind;
use prost_types::{Struct, Value};

use crate::error::{GatewayError, Result};
use crate::flow::MergeStrategy;
use crate::params::RESULTS_KEY;
use crate::proto::{RouteProto, StatusProto};
use crate::request::routes::ts_key;
use crate::request::{DataRequest, DataRequestBody};

/// One predecessor's contribution to a join.
#[derive(Debug, Clone)]
pub struct Slot {
    /// Name of the predecessor the partial comes from.
    pub from: String,
    pub partial: Option<DataRequest>,
}

impl Slot {
    pub fn arrived(from: impl Into<String>, partial: DataRequest) -> Self {
        Self {
            from: from.into(),
            partial: Some(partial),
        }
    }

    pub fn missing(from: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            partial: None,
        }
    }
}

/// A merge usable at a join in place of the configured strategy.
pub trait Reduce: Send + Sync {
    fn reduce(&self, slots: Vec<Slot>) -> Result<DataRequest>;
}

pub struct ConcatDocs;

impl Reduce for ConcatDocs {
    fn reduce(&self, slots: Vec<Slot>) -> Result<DataRequest> {
        concat_docs(slots)
    }
}

pub struct FirstNonEmpty;

impl Reduce for FirstNonEmpty {
    fn reduce(&self, slots: Vec<Slot>) -> Result<DataRequest> {
        first_non_empty(slots)
    }
}

/// Per-join overrides of the configured merge strategy, keyed by the join's
/// deployment name (`__exit__` for the exit join).
#[derive(Clone, Default)]
pub struct Reducers {
    overrides: HashMap<String, Arc<dyn Reduce>>,
}

impl Reducers {
    pub fn with_override(mut self, join: impl Into<String>, reducer: Arc<dyn Reduce>) -> Self {
        self.overrides.insert(join.into(), reducer);
        self
    }

    pub fn get(&self, join: &str) -> Option<&Arc<dyn Reduce>> {
        self.overrides.get(join)
    }

    /// Merges with the override for `join` if one is registered, else with
    /// the local `strategy`.
    pub fn merge(&self, join: &str, strategy: MergeStrategy, slots: Vec<Slot>) -> Result<DataRequest> {
        if let Some(reducer) = self.overrides.get(join) {
            return reducer.reduce(slots);
        }
        match strategy {
            MergeStrategy::ConcatDocs => concat_docs(slots),
            MergeStrategy::FirstNonEmpty => first_non_empty(slots),
            MergeStrategy::ReducerExec => Err(GatewayError::Internal(format!(
                "join `{join}` uses reducer_exec, which is not a local merge"
            ))),
        }
    }
}

impl std::fmt::Debug for Reducers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.overrides.keys()).finish()
    }
}

/// Description recorded for a branch that never answered.
pub fn missing_description(from: &str) -> String {
    format!("deadline exceeded before `{from}` answered")
}

struct Arrived {
    from: String,
    body: DataRequestBody,
}

fn split(slots: Vec<Slot>) -> Result<(Vec<Arrived>, Vec<String>)> {
    let mut arrived = Vec::with_capacity(slots.len());
    let mut missing = Vec::new();
    for slot in slots {
        match slot.partial {
            Some(partial) => arrived.push(Arrived {
                from: slot.from,
                body: partial.into_body()?,
            }),
            None => missing.push(slot.from),
        }
    }
    Ok((arrived, missing))
}

/// Status of the merged request: SUCCESS when every branch succeeded, ERROR
/// when none did, ERROR_CHAINED otherwise. Descriptions come from the first
/// failing branch in predecessor order.
fn merged_status(arrived: &[Arrived], missing: &[String], order: &[String]) -> Option<StatusProto> {
    let failed: Vec<&StatusProto> = arrived
        .iter()
        .filter_map(|a| a.body.status.as_ref().filter(|s| s.is_error()))
        .collect();
    if failed.is_empty() && missing.is_empty() {
        return None;
    }

    // first failing branch in `needs` order, missing ones included
    let first_failure = order.iter().find_map(|name| {
        if missing.contains(name) {
            return Some((missing_description(name), None));
        }
        arrived
            .iter()
            .find(|a| &a.from == name)
            .and_then(|a| a.body.status.as_ref())
            .filter(|s| s.is_error())
            .map(|s| (s.description.clone(), s.exception.clone()))
    });
    let (description, exception) = first_failure.unwrap_or_default();

    let succeeded = arrived.len() - failed.len();
    let mut status = if succeeded == 0 {
        StatusProto::error(description)
    } else {
        StatusProto::error_chained(description)
    };
    status.exception = exception;
    Some(status)
}

/// Routes deduplicated by executor, pod and times, in start order.
pub fn union_routes<'a>(routes: impl IntoIterator<Item = &'a RouteProto>) -> Vec<RouteProto> {
    let mut seen = HashSet::new();
    let mut routes: Vec<RouteProto> = routes
        .into_iter()
        .filter(|r| {
            seen.insert((
                r.executor.clone(),
                r.pod_id.clone(),
                ts_key(r.start_time.as_ref()),
                ts_key(r.end_time.as_ref()),
            ))
        })
        .cloned()
        .collect();
    routes.sort_by_key(|r| ts_key(r.start_time.as_ref()));
    routes
}

/// Routes of every partial that arrived, deduplicated and in start order.
pub fn slot_routes(slots: &[Slot]) -> Vec<RouteProto> {
    union_routes(
        slots
            .iter()
            .filter_map(|s| s.partial.as_ref())
            .filter_map(|p| p.body().ok())
            .flat_map(|b| b.routes.iter()),
    )
}

/// Merges the `__results__` objects of all partials into `params`.
fn union_results(params: &mut Struct, arrived: &[Arrived]) {
    let mut results: Struct = Struct::default();
    for a in arrived {
        let Some(Value {
            kind: Some(Kind::StructValue(partial)),
        }) = a.body.parameters.as_ref().and_then(|p| p.fields.get(RESULTS_KEY))
        else {
            continue;
        };
        for (executor, value) in &partial.fields {
            results.fields.entry(executor.clone()).or_insert_with(|| value.clone());
        }
    }
    if !results.fields.is_empty() {
        params.fields.insert(
            RESULTS_KEY.to_string(),
            Value {
                kind: Some(Kind::StructValue(results)),
            },
        );
    }
}

fn merge_into_first(arrived: Vec<Arrived>, missing: &[String], order: &[String]) -> Result<DataRequest> {
    let status = merged_status(&arrived, missing, order);
    let routes = union_routes(arrived.iter().flat_map(|a| a.body.routes.iter()));
    let mut iter = arrived.iter();
    let Some(first) = iter.next() else {
        // every branch is missing
        let mut body = DataRequestBody {
            status,
            ..Default::default()
        };
        body.routes = routes;
        return Ok(DataRequest::from_body(body));
    };
    let mut body = first.body.clone();
    // failed branches contribute no documents, unless nothing succeeded
    if arrived.iter().any(|a| !a.body.is_error()) {
        body.data = arrived
            .iter()
            .filter(|a| !a.body.is_error())
            .flat_map(|a| a.body.data.iter().cloned())
            .collect();
    } else {
        for other in iter {
            body.data.extend(other.body.data.iter().cloned());
        }
    }
    body.routes = routes;
    union_results(body.parameters_mut(), &arrived);
    body.status = status;
    Ok(DataRequest::from_body(body))
}

/// Concatenates the data of successful partials in predecessor order. A
/// join with a single slot that arrived returns it untouched.
pub fn concat_docs(slots: Vec<Slot>) -> Result<DataRequest> {
    if let [Slot {
        partial: Some(_), ..
    }] = slots.as_slice()
    {
        return Ok(slots.into_iter().next().and_then(|s| s.partial).unwrap_or_default());
    }
    let order: Vec<String> = slots.iter().map(|s| s.from.clone()).collect();
    let (arrived, missing) = split(slots)?;
    merge_into_first(arrived, &missing, &order)
}

/// The first successful partial with documents, carrying the routes of
/// every branch. Falls back to `concat_docs` when no branch qualifies.
pub fn first_non_empty(slots: Vec<Slot>) -> Result<DataRequest> {
    let order: Vec<String> = slots.iter().map(|s| s.from.clone()).collect();
    let (arrived, missing) = split(slots)?;
    let Some(pick) = arrived
        .iter()
        .position(|a| !a.body.is_error() && !a.body.data.is_empty())
    else {
        return merge_into_first(arrived, &missing, &order);
    };
    let routes = union_routes(arrived.iter().flat_map(|a| a.body.routes.iter()));
    let mut body = arrived[pick].body.clone();
    body.routes = routes;
    union_results(body.parameters_mut(), &arrived);
    Ok(DataRequest::from_body(body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{DocumentProto, StatusCode};

    fn partial(id: &str, docs: &[&str], status: Option<StatusProto>) -> DataRequest {
        let mut body = DataRequestBody {
            data: docs
                .iter()
                .map(|d| {
                    DocumentProto {
                        id: d.to_string(),
                        ..Default::default()
                    }
                    .into()
                })
                .collect(),
            status,
            ..Default::default()
        };
        body.set_request_id(id);
        DataRequest::from_body(body)
    }

    fn ids(request: &DataRequest) -> Vec<String> {
        request.body().unwrap().data.iter().map(|d| d.id.clone()).collect()
    }

    #[test]
    fn single_partial_is_identity() {
        let body = DataRequestBody {
            exec_endpoint: "/x".into(),
            ..Default::default()
        };
        let bytes = bytes::Bytes::from(prost::Message::encode_to_vec(&body));
        let only = DataRequest::from_bytes(bytes.clone());
        let merged = concat_docs(vec![Slot::arrived("a", only)]).unwrap();
        assert!(!merged.is_dirty());
        assert_eq!(merged.to_bytes(), bytes);
    }

    #[test]
    fn concatenates_in_predecessor_order() {
        let merged = concat_docs(vec![
            Slot::arrived("a", partial("r2", &["a1"], None)),
            Slot::arrived("b", partial("r2", &["b1", "b2"], None)),
        ])
        .unwrap();
        assert_eq!(ids(&merged), ["a1", "b1", "b2"]);
        assert_eq!(merged.request_id().unwrap(), "r2");
        assert_eq!(merged.body().unwrap().status_code(), StatusCode::Success);
    }

    #[test]
    fn partial_failure_is_chained() {
        let merged = concat_docs(vec![
            Slot::arrived("a", partial("r", &["a1"], None)),
            Slot::arrived("b", partial("r", &[], Some(StatusProto::error("shard down")))),
        ])
        .unwrap();
        let body = merged.body().unwrap();
        assert_eq!(body.status_code(), StatusCode::ErrorChained);
        assert_eq!(body.status.as_ref().unwrap().description, "shard down");
        assert_eq!(ids(&merged), ["a1"]);

        // the failed partial still carries its input documents
        let merged = concat_docs(vec![
            Slot::arrived("a", partial("r", &["in"], Some(StatusProto::error("down")))),
            Slot::arrived("b", partial("r", &["b1"], None)),
        ])
        .unwrap();
        assert_eq!(ids(&merged), ["b1"]);
    }

    #[test]
    fn all_failed_is_error_with_first_description() {
        let merged = concat_docs(vec![
            Slot::arrived("a", partial("r", &[], Some(StatusProto::error("first")))),
            Slot::arrived("b", partial("r", &[], Some(StatusProto::error("second")))),
        ])
        .unwrap();
        let status = merged.body().unwrap().status.clone().unwrap();
        assert_eq!(status.code(), StatusCode::Error);
        assert_eq!(status.description, "first");
    }

    #[test]
    fn missing_branch_is_recorded() {
        let merged = concat_docs(vec![
            Slot::missing("a"),
            Slot::arrived("b", partial("r", &["b1"], None)),
        ])
        .unwrap();
        let status = merged.body().unwrap().status.clone().unwrap();
        assert_eq!(status.code(), StatusCode::ErrorChained);
        assert!(status.description.contains("`a`"));
        assert_eq!(ids(&merged), ["b1"]);

        let merged = concat_docs(vec![Slot::missing("a"), Slot::missing("b")]).unwrap();
        assert_eq!(merged.body().unwrap().status_code(), StatusCode::Error);
    }

    #[test]
    fn routes_are_unioned_and_sorted() {
        let shared = RouteProto::begin("a", "a/0/0").finish();
        let mut left = partial("r", &[], None);
        let mut right = partial("r", &[], None);
        left.add_route(shared.clone());
        right.add_route(shared);
        std::thread::sleep(std::time::Duration::from_millis(1));
        let c = RouteProto::begin("c", "c/0/0").finish();
        let b = RouteProto::begin("b", "b/0/0").finish();
        right.add_route(c);
        left.add_route(b);
        let merged = concat_docs(vec![Slot::arrived("b", left), Slot::arrived("c", right)]).unwrap();
        let executors: Vec<_> = merged
            .body()
            .unwrap()
            .routes
            .iter()
            .map(|r| r.executor.clone())
            .collect();
        assert_eq!(executors, ["a", "c", "b"]);
    }

    #[test]
    fn first_non_empty_picks_first_useful_partial() {
        let merged = first_non_empty(vec![
            Slot::arrived("a", partial("r", &[], None)),
            Slot::arrived("b", partial("r", &["x"], Some(StatusProto::error("bad")))),
            Slot::arrived("c", partial("r", &["c1"], None)),
            Slot::arrived("d", partial("r", &["d1"], None)),
        ])
        .unwrap();
        assert_eq!(ids(&merged), ["c1"]);

        let merged = first_non_empty(vec![
            Slot::arrived("a", partial("r", &[], None)),
            Slot::arrived("b", partial("r", &[], None)),
        ])
        .unwrap();
        assert!(ids(&merged).is_empty());
    }

    #[test]
    fn results_are_merged() {
        use crate::params::json_to_struct;
        use serde_json::json;

        let with_results = |executor: &str| {
            let mut request = partial("r", &[], None);
            let params = json!({ RESULTS_KEY: { executor: {"n": 1} } });
            request.body_mut().unwrap().parameters =
                Some(json_to_struct(params.as_object().unwrap()));
            request
        };
        let merged = concat_docs(vec![
            Slot::arrived("a", with_results("a")),
            Slot::arrived("b", with_results("b")),
        ])
        .unwrap();
        let params = merged.body().unwrap().parameters.clone().unwrap();
        let Some(Kind::StructValue(results)) = &params.fields[RESULTS_KEY].kind else {
            panic!("results missing");
        };
        assert!(results.fields.contains_key("a"));
        assert!(results.fields.contains_key("b"));
    }

    #[test]
    fn overrides_take_precedence() {
        struct KeepLast;
        impl Reduce for KeepLast {
            fn reduce(&self, slots: Vec<Slot>) -> Result<DataRequest> {
                slots
                    .into_iter()
                    .rev()
                    .find_map(|s| s.partial)
                    .ok_or_else(|| GatewayError::Internal("empty".into()))
            }
        }
        let reducers = Reducers::default().with_override("join", Arc::new(KeepLast));
        let merged = reducers
            .merge(
                "join",
                MergeStrategy::ConcatDocs,
                vec![
                    Slot::arrived("a", partial("r", &["a1"], None)),
                    Slot::arrived("b", partial("r", &["b1"], None)),
                ],
            )
            .unwrap();
        assert_eq!(ids(&merged), ["b1"]);
        assert!(reducers
            .merge("other", MergeStrategy::ReducerExec, vec![])
            .is_err());
    }
}
