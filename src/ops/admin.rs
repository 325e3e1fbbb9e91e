//! Admin operations over the session registry: distribution snapshots and
//! forced client rejection.

use crate::core::time::Clock;
use crate::group::mapping::ClientSessionGroupMapping;

/// One client as the admin surface reports it.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ClientView {
    pub client: String,
    pub remote_addr: String,
    pub purpose: String,
    pub heartbeat_age_ms: u64,
}

/// Membership summary for one group.
#[derive(Debug, Clone, serde::Serialize)]
pub struct GroupDistribution {
    pub group: String,
    pub consumer_count: usize,
    pub producer_count: usize,
    pub topics: Vec<String>,
}

/// Snapshot of every group and session the node currently hosts.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DistributionReport {
    pub session_count: usize,
    pub groups: Vec<GroupDistribution>,
}

/// Build the distribution snapshot. Groups come out sorted so repeated
/// queries are comparable.
pub fn session_distribution<C: Clock>(
    mapping: &ClientSessionGroupMapping<C>,
) -> DistributionReport {
    let mut groups: Vec<GroupDistribution> = mapping
        .groups()
        .into_iter()
        .map(|wrapper| {
            let mut topics = wrapper.subscribed_topics();
            topics.sort();
            GroupDistribution {
                group: wrapper.group().to_string(),
                consumer_count: wrapper.consumer_count(),
                producer_count: wrapper.producer_count(),
                topics,
            }
        })
        .collect();
    groups.sort_by(|a, b| a.group.cmp(&b.group));
    DistributionReport {
        session_count: mapping.session_count(),
        groups,
    }
}

/// Sessions matching a subsystem, for targeted diagnostics.
pub fn clients_by_subsystem<C: Clock>(
    mapping: &ClientSessionGroupMapping<C>,
    subsystem: &str,
) -> Vec<ClientView> {
    mapping
        .sessions()
        .into_iter()
        .filter(|s| s.client().subsystem == subsystem)
        .map(|s| ClientView {
            client: s.client().to_string(),
            remote_addr: s.remote_addr().to_string(),
            purpose: s.client().purpose.as_str().to_string(),
            heartbeat_age_ms: s.heartbeat_age_ms(),
        })
        .collect()
}

/// Sessions currently listening on a topic, across all groups.
pub fn listeners_by_topic<C: Clock>(
    mapping: &ClientSessionGroupMapping<C>,
    topic: &str,
) -> Vec<ClientView> {
    let mut views = Vec::new();
    for wrapper in mapping.groups() {
        for session in wrapper.sessions_for_topic(topic) {
            views.push(ClientView {
                client: session.client().to_string(),
                remote_addr: session.remote_addr().to_string(),
                purpose: session.client().purpose.as_str().to_string(),
                heartbeat_age_ms: session.heartbeat_age_ms(),
            });
        }
    }
    views
}

/// Force-close every session. Returns how many were closed.
pub fn reject_all_clients<C: Clock>(mapping: &ClientSessionGroupMapping<C>) -> usize {
    let sessions = mapping.sessions();
    let count = sessions.len();
    tracing::warn!(count, "rejecting all clients by admin request");
    for session in sessions {
        mapping.close_session(&session);
    }
    count
}

/// Force-close sessions from one peer IP. Returns how many were closed.
pub fn reject_clients_by_ip<C: Clock>(
    mapping: &ClientSessionGroupMapping<C>,
    ip: &str,
) -> usize {
    let targets: Vec<_> = mapping
        .sessions()
        .into_iter()
        .filter(|s| s.remote_addr().ip().to_string() == ip)
        .collect();
    let count = targets.len();
    if count > 0 {
        tracing::warn!(count, ip, "rejecting clients by admin request");
    }
    for session in targets {
        mapping.close_session(&session);
    }
    count
}

/// Force-close sessions from one subsystem. Returns how many were closed.
pub fn reject_clients_by_subsystem<C: Clock>(
    mapping: &ClientSessionGroupMapping<C>,
    subsystem: &str,
) -> usize {
    let targets: Vec<_> = mapping
        .sessions()
        .into_iter()
        .filter(|s| s.client().subsystem == subsystem)
        .collect();
    let count = targets.len();
    if count > 0 {
        tracing::warn!(count, subsystem, "rejecting clients by admin request");
    }
    for session in targets {
        mapping.close_session(&session);
    }
    count
}
