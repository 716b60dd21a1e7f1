//! Route records: one per executor visited, plus the gateway's own entry
//! which brackets all of them.

use chrono::{DateTime, Utc};
use prost_types::Timestamp;

use crate::proto::RouteProto;

/// Executor name of the gateway's route entry.
pub const GATEWAY_ROUTE: &str = "gateway";

pub fn timestamp(at: DateTime<Utc>) -> Timestamp {
    Timestamp {
        seconds: at.timestamp(),
        nanos: at.timestamp_subsec_nanos() as i32,
    }
}

pub fn now() -> Timestamp {
    timestamp(Utc::now())
}

/// Sort key of a timestamp; unset sorts first.
pub fn ts_key(ts: Option<&Timestamp>) -> (i64, i32) {
    ts.map_or((i64::MIN, 0), |t| (t.seconds, t.nanos))
}

pub fn to_datetime(ts: &Timestamp) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(ts.seconds, ts.nanos.max(0) as u32)
}

impl RouteProto {
    /// A route opened now, to be closed with [`RouteProto::finish`].
    pub fn begin(executor: impl Into<String>, pod_id: impl Into<String>) -> Self {
        Self {
            executor: executor.into(),
            start_time: Some(now()),
            end_time: None,
            pod_id: pod_id.into(),
        }
    }

    pub fn finish(mut self) -> Self {
        self.end_time = Some(now());
        self
    }

    pub fn is_gateway(&self) -> bool {
        self.executor == GATEWAY_ROUTE
    }
}

/// Checks the ordering every egress response guarantees: each route ends
/// after it starts, and the gateway entry brackets every executor entry.
pub fn well_ordered(routes: &[RouteProto]) -> bool {
    let each_ordered = routes.iter().all(|r| match (&r.start_time, &r.end_time) {
        (Some(start), Some(end)) => ts_key(Some(start)) <= ts_key(Some(end)),
        _ => false,
    });
    let Some(gateway) = routes.iter().find(|r| r.is_gateway()) else {
        return each_ordered;
    };
    let (gw_start, gw_end) = (
        ts_key(gateway.start_time.as_ref()),
        ts_key(gateway.end_time.as_ref()),
    );
    each_ordered
        && routes.iter().filter(|r| !r.is_gateway()).all(|r| {
            gw_start <= ts_key(r.start_time.as_ref()) && ts_key(r.end_time.as_ref()) <= gw_end
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_brackets_executors() {
        let gateway = RouteProto::begin(GATEWAY_ROUTE, "gateway");
        let a = RouteProto::begin("a", "a/0/0").finish();
        let gateway = gateway.finish();
        assert!(well_ordered(&[gateway.clone(), a.clone()]));

        std::thread::sleep(std::time::Duration::from_millis(2));
        let late = RouteProto::begin("b", "b/0/0").finish();
        assert!(!well_ordered(&[gateway, a, late]));
    }

    #[test]
    fn open_routes_are_not_well_ordered() {
        assert!(!well_ordered(&[RouteProto::begin("a", "a/0/0")]));
    }

    #[test]
    fn timestamp_round_trips_through_chrono() {
        let at = Utc::now();
        assert_eq!(to_datetime(&timestamp(at)), Some(at));
    }
}
