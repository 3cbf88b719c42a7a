//! Desired-state reconciliation of managed RBAC bindings
//!
//! Given a user's LDAP group DNs and the LdapGroupBinding snapshot, the
//! reconciler computes the set of bindings the user should have, diffs it
//! against the managed bindings currently on the cluster, and converges by
//! creating, updating, and deleting through the binding manager. Creates and
//! updates run before deletes so a user is never transiently stripped of all
//! permissions, and each phase walks names in sorted order so passes are
//! reproducible and log-auditable.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use k8s_openapi::api::rbac::v1::RoleRef;
use kube::ResourceExt;
use tracing::{info, warn};

use crate::bindings::{gen_binding_name, BindingManager};
use crate::crd::{LdapGroupBinding, KIND_ROLE};
use crate::Result;

/// A ClusterRoleBinding the user should have
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DesiredClusterBinding {
    /// Referenced ClusterRole name
    pub role: String,
    /// Name of the LdapGroupBinding granting it
    pub group_binding: String,
}

/// A RoleBinding the user should have
#[derive(Clone, Debug, PartialEq)]
pub struct DesiredRoleBinding {
    /// Namespace the binding lives in
    pub namespace: String,
    /// Full role reference (name, kind, apiGroup)
    pub role_ref: RoleRef,
    /// Name of the LdapGroupBinding granting it
    pub group_binding: String,
}

/// Desired bindings keyed by deterministic binding name
pub type DesiredState = (
    BTreeMap<String, DesiredClusterBinding>,
    BTreeMap<String, DesiredRoleBinding>,
);

/// Compute the bindings implied by (user groups ∩ group bindings)
///
/// Group membership is an exact string match on the group DN. Malformed
/// items (Role without a namespace) and unknown kinds are skipped with a
/// warning and have no effect on the diff.
pub fn desired_state(
    sa: &str,
    user_groups: &HashSet<String>,
    snapshot: &[LdapGroupBinding],
) -> DesiredState {
    let mut cluster = BTreeMap::new();
    let mut namespaced = BTreeMap::new();

    for lgb in snapshot {
        if !user_groups.contains(&lgb.spec.ldap_group_dn) {
            continue;
        }
        let lgb_name = lgb.name_any();

        for item in &lgb.spec.bindings {
            if item.is_cluster_role() {
                cluster.insert(
                    gen_binding_name(sa, &item.name, &lgb_name),
                    DesiredClusterBinding {
                        role: item.name.clone(),
                        group_binding: lgb_name.clone(),
                    },
                );
            } else if item.kind == KIND_ROLE {
                match item.role_namespace() {
                    Some(ns) => {
                        namespaced.insert(
                            gen_binding_name(sa, &item.name, &lgb_name),
                            DesiredRoleBinding {
                                namespace: ns.to_string(),
                                role_ref: RoleRef {
                                    api_group: item.api_group.clone(),
                                    kind: KIND_ROLE.to_string(),
                                    name: item.name.clone(),
                                },
                                group_binding: lgb_name.clone(),
                            },
                        );
                    }
                    None => warn!(
                        group_binding = %lgb_name,
                        role = %item.name,
                        "skipping Role binding without a namespace"
                    ),
                }
            } else {
                warn!(
                    group_binding = %lgb_name,
                    kind = %item.kind,
                    name = %item.name,
                    "skipping binding with unknown kind"
                );
            }
        }
    }

    (cluster, namespaced)
}

/// Counts of writes performed by one reconciliation pass
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    /// Bindings created
    pub created: usize,
    /// Bindings repointed at a different role
    pub updated: usize,
    /// Stale bindings removed
    pub deleted: usize,
}

impl ReconcileSummary {
    /// Total number of API writes in the pass
    pub fn writes(&self) -> usize {
        self.created + self.updated + self.deleted
    }
}

/// Converges managed bindings toward the desired state
pub struct Reconciler {
    bindings: Arc<dyn BindingManager>,
}

impl Reconciler {
    /// Create a reconciler writing through the given manager
    pub fn new(bindings: Arc<dyn BindingManager>) -> Self {
        Self { bindings }
    }

    /// Run one reconciliation pass for a ServiceAccount
    ///
    /// The first write error aborts the pass; nothing is rolled back and the
    /// next pass converges from whatever state was reached.
    pub async fn reconcile(
        &self,
        sa: &str,
        user_groups: &HashSet<String>,
        snapshot: &[LdapGroupBinding],
    ) -> Result<ReconcileSummary> {
        let (desired_cluster, desired_namespaced) = desired_state(sa, user_groups, snapshot);

        let current_cluster: BTreeMap<String, _> = self
            .bindings
            .list_managed_cluster_role_bindings(sa)
            .await?
            .into_iter()
            .map(|b| (b.name_any(), b))
            .collect();
        let current_namespaced: BTreeMap<String, _> = self
            .bindings
            .list_managed_role_bindings(sa)
            .await?
            .into_iter()
            .map(|b| (b.name_any(), b))
            .collect();

        let mut summary = ReconcileSummary::default();

        // Phase one: creates and updates, so permissions are granted before
        // anything is revoked.
        for (name, want) in &desired_cluster {
            match current_cluster.get(name) {
                None => {
                    self.bindings
                        .create_cluster_role_binding(sa, &want.role, &want.group_binding)
                        .await?;
                    summary.created += 1;
                }
                Some(current) if current.role_ref.name != want.role => {
                    self.bindings
                        .update_cluster_role_binding(sa, &want.role, &want.group_binding)
                        .await?;
                    summary.updated += 1;
                }
                Some(_) => {}
            }
        }

        for (name, want) in &desired_namespaced {
            match current_namespaced.get(name) {
                None => {
                    self.bindings
                        .create_role_binding(
                            sa,
                            &want.namespace,
                            &want.group_binding,
                            want.role_ref.clone(),
                        )
                        .await?;
                    summary.created += 1;
                }
                Some(current) if role_ref_differs(&current.role_ref, &want.role_ref) => {
                    self.bindings
                        .update_role_binding(
                            sa,
                            &want.namespace,
                            want.role_ref.clone(),
                            &want.group_binding,
                        )
                        .await?;
                    summary.updated += 1;
                }
                Some(_) => {}
            }
        }

        // Phase two: deletes of bindings no longer implied by any group.
        for name in current_cluster.keys() {
            if !desired_cluster.contains_key(name) {
                self.bindings.delete_cluster_role_binding(name).await?;
                summary.deleted += 1;
            }
        }

        for (name, current) in &current_namespaced {
            if !desired_namespaced.contains_key(name) {
                let namespace = current.metadata.namespace.clone().unwrap_or_default();
                self.bindings.delete_role_binding(&namespace, name).await?;
                summary.deleted += 1;
            }
        }

        info!(
            sa = %sa,
            created = summary.created,
            updated = summary.updated,
            deleted = summary.deleted,
            "reconciled managed bindings"
        );
        Ok(summary)
    }
}

/// RoleBinding update predicate: any drift in the full role reference
fn role_ref_differs(current: &RoleRef, desired: &RoleRef) -> bool {
    current.name != desired.name
        || current.kind != desired.kind
        || current.api_group != desired.api_group
}
