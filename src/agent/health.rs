//! Answer to the relay's `healthcheck` request.

use std::collections::BTreeSet;

use reqwest::Method;
use serde::Deserialize;
use tracing::warn;

use super::kube::KubeClient;
use crate::error::{Error, Result};
use crate::message::control::AliveCheckMessage;

const CLUSTER_ROLE_BINDINGS: &str = "/apis/rbac.authorization.k8s.io/v1/clusterrolebindings";
const ROLE_BINDINGS: &str = "/apis/rbac.authorization.k8s.io/v1/rolebindings";

#[derive(Debug, Deserialize)]
struct BindingList {
    #[serde(default)]
    items: Vec<Binding>,
}

#[derive(Debug, Deserialize)]
struct Binding {
    #[serde(default)]
    subjects: Vec<Subject>,
}

#[derive(Debug, Deserialize)]
struct Subject {
    kind: String,
    name: String,
}

/// Alive, plus every user the cluster's role bindings name. An RBAC
/// listing failure still reports alive.
pub async fn alive_check(kube: &KubeClient) -> AliveCheckMessage {
    let cluster_users = match cluster_users(kube).await {
        Ok(users) => users,
        Err(e) => {
            warn!("Health: could not list cluster users: {e}");
            Vec::new()
        }
    };
    AliveCheckMessage {
        alive: true,
        cluster_users,
    }
}

async fn cluster_users(kube: &KubeClient) -> Result<Vec<String>> {
    let mut lists = Vec::with_capacity(2);
    for endpoint in [CLUSTER_ROLE_BINDINGS, ROLE_BINDINGS] {
        let response = kube.as_agent(Method::GET, endpoint).send().await?;
        if !response.status().is_success() {
            return Err(Error::execution(format!(
                "listing {endpoint} failed with status {}",
                response.status()
            )));
        }
        lists.push(response.json::<BindingList>().await?);
    }
    Ok(users_from(&lists))
}

/// Sorted, de-duplicated `User` subjects, skipping `prefix:name` system
/// identities.
fn users_from(lists: &[BindingList]) -> Vec<String> {
    lists
        .iter()
        .flat_map(|l| &l.items)
        .flat_map(|b| &b.subjects)
        .filter(|s| s.kind == "User" && !s.name.contains(':'))
        .map(|s| s.name.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_users_filtered_sorted_and_unique() {
        let cluster: BindingList = serde_json::from_value(json!({
            "items": [
                {"subjects": [
                    {"kind": "User", "name": "zoe@example.com"},
                    {"kind": "Group", "name": "admins"},
                    {"kind": "User", "name": "system:kube-scheduler"}
                ]},
                {"metadata": {"name": "no-subjects"}}
            ]
        }))
        .unwrap();
        let namespaced: BindingList = serde_json::from_value(json!({
            "items": [{"subjects": [
                {"kind": "User", "name": "amy@example.com"},
                {"kind": "User", "name": "zoe@example.com"},
                {"kind": "ServiceAccount", "name": "default"}
            ]}]
        }))
        .unwrap();

        assert_eq!(
            users_from(&[cluster, namespaced]),
            vec!["amy@example.com", "zoe@example.com"]
        );
    }

    #[tokio::test]
    async fn test_unreachable_cluster_still_alive() {
        let kube = KubeClient::new("http://127.0.0.1:9", "t", "ns", None).unwrap();
        let reply = alive_check(&kube).await;
        assert!(reply.alive);
        assert!(reply.cluster_users.is_empty());
    }
}
