//! ServiceAccount and RBAC binding manager
//!
//! Owns every Kubernetes write this system performs: ServiceAccount upserts,
//! bound token issuance, and CRUD on the managed ClusterRoleBindings and
//! RoleBindings. Binding names are deterministic and every created object
//! carries the managed label; update and delete refuse to touch objects
//! without it.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::authentication::v1::{TokenRequest, TokenRequestSpec};
use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::api::rbac::v1::{ClusterRoleBinding, RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::Client;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use crate::error::Error;
use crate::{Result, MANAGED_LABEL, MANAGED_LABEL_VALUE, RBAC_API_GROUP};

/// Subject kind every managed binding references
const SERVICE_ACCOUNT_KIND: &str = "ServiceAccount";

/// A token minted through the TokenRequest subresource
#[derive(Clone, Debug)]
pub struct IssuedToken {
    /// The bearer token
    pub token: String,
    /// Server-reported expiry
    pub expiration: Option<DateTime<Utc>>,
}

/// Deterministic name of a managed binding
///
/// The name encodes the (service account, group binding, role) triple so a
/// binding can never be shared between triples and reconciliation diffs are
/// pure string-set operations.
pub fn gen_binding_name(sa: &str, role: &str, group_binding: &str) -> String {
    format!("kerbernetes:{sa}:{group_binding}:{role}")
}

/// Kubernetes operations the auth flow and reconciler depend on
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BindingManager: Send + Sync {
    /// Get or create the ServiceAccount named after a principal
    async fn upsert_service_account(&self, name: &str) -> Result<ServiceAccount>;

    /// Mint a bound token for the ServiceAccount
    async fn issue_token(&self, name: &str) -> Result<IssuedToken>;

    /// Managed ClusterRoleBindings whose subject is this ServiceAccount
    async fn list_managed_cluster_role_bindings(&self, sa: &str) -> Result<Vec<ClusterRoleBinding>>;

    /// Managed RoleBindings across all namespaces whose subject is this
    /// ServiceAccount
    async fn list_managed_role_bindings(&self, sa: &str) -> Result<Vec<RoleBinding>>;

    /// Create a managed ClusterRoleBinding granting `role` to the SA
    async fn create_cluster_role_binding(
        &self,
        sa: &str,
        role: &str,
        group_binding: &str,
    ) -> Result<()>;

    /// Repoint an existing managed ClusterRoleBinding at `role`
    ///
    /// The API server rejects `roleRef` mutation on existing bindings, so
    /// this is implemented as delete-and-recreate under the same name.
    async fn update_cluster_role_binding(
        &self,
        sa: &str,
        role: &str,
        group_binding: &str,
    ) -> Result<()>;

    /// Delete a managed ClusterRoleBinding by name
    async fn delete_cluster_role_binding(&self, name: &str) -> Result<()>;

    /// Create a managed RoleBinding in `namespace` granting `role_ref`
    async fn create_role_binding(
        &self,
        sa: &str,
        namespace: &str,
        group_binding: &str,
        role_ref: RoleRef,
    ) -> Result<()>;

    /// Repoint an existing managed RoleBinding at `role_ref`
    ///
    /// Delete-and-recreate, same as the cluster-scoped variant.
    async fn update_role_binding(
        &self,
        sa: &str,
        namespace: &str,
        role_ref: RoleRef,
        group_binding: &str,
    ) -> Result<()>;

    /// Delete a managed RoleBinding by namespace and name
    async fn delete_role_binding(&self, namespace: &str, name: &str) -> Result<()>;
}

/// Production implementation backed by the cluster
pub struct KubeBindingManager {
    client: Client,
    namespace: String,
    token_audience: String,
    token_duration: i64,
}

impl KubeBindingManager {
    /// Create a manager operating in the given namespace
    pub fn new(client: Client, namespace: String, token_audience: String, token_duration: i64) -> Self {
        Self {
            client,
            namespace,
            token_audience,
            token_duration,
        }
    }

    fn service_accounts(&self) -> Api<ServiceAccount> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn cluster_role_bindings(&self) -> Api<ClusterRoleBinding> {
        Api::all(self.client.clone())
    }

    fn role_bindings(&self, namespace: &str) -> Api<RoleBinding> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn managed_selector() -> ListParams {
        ListParams::default().labels(&format!("{MANAGED_LABEL}={MANAGED_LABEL_VALUE}"))
    }
}

#[async_trait]
impl BindingManager for KubeBindingManager {
    async fn upsert_service_account(&self, name: &str) -> Result<ServiceAccount> {
        let api = self.service_accounts();

        match api.get(name).await {
            Ok(sa) => {
                debug!(name = %name, namespace = %self.namespace, "found existing service account");
                Ok(sa)
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                let sa = ServiceAccount {
                    metadata: ObjectMeta {
                        name: Some(name.to_string()),
                        ..Default::default()
                    },
                    ..Default::default()
                };
                match api.create(&PostParams::default(), &sa).await {
                    Ok(created) => {
                        info!(name = %name, namespace = %self.namespace, "created service account");
                        Ok(created)
                    }
                    // Lost a create race with a concurrent request for the
                    // same principal; the account exists now.
                    Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(api.get(name).await?),
                    Err(e) => Err(e.into()),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn issue_token(&self, name: &str) -> Result<IssuedToken> {
        let request = TokenRequest {
            spec: TokenRequestSpec {
                audiences: vec![self.token_audience.clone()],
                expiration_seconds: Some(self.token_duration),
                bound_object_ref: None,
            },
            ..Default::default()
        };

        let response = self
            .service_accounts()
            .create_token_request(name, &PostParams::default(), &request)
            .await?;

        let status = response
            .status
            .ok_or_else(|| Error::internal(format!("token request for {name} returned no status")))?;

        info!(name = %name, namespace = %self.namespace, "issued service account token");
        Ok(IssuedToken {
            token: status.token,
            expiration: Some(status.expiration_timestamp.0),
        })
    }

    async fn list_managed_cluster_role_bindings(&self, sa: &str) -> Result<Vec<ClusterRoleBinding>> {
        let list = self
            .cluster_role_bindings()
            .list(&Self::managed_selector())
            .await?;

        let bindings: Vec<_> = list
            .items
            .into_iter()
            .filter(|b| has_sa_subject(b.subjects.as_deref(), sa, &self.namespace))
            .collect();

        debug!(sa = %sa, count = bindings.len(), "listed managed cluster role bindings");
        Ok(bindings)
    }

    async fn list_managed_role_bindings(&self, sa: &str) -> Result<Vec<RoleBinding>> {
        // Empty-namespace Api lists across every namespace.
        let list = Api::<RoleBinding>::all(self.client.clone())
            .list(&Self::managed_selector())
            .await?;

        let bindings: Vec<_> = list
            .items
            .into_iter()
            .filter(|b| has_sa_subject(b.subjects.as_deref(), sa, &self.namespace))
            .collect();

        debug!(sa = %sa, count = bindings.len(), "listed managed role bindings");
        Ok(bindings)
    }

    async fn create_cluster_role_binding(
        &self,
        sa: &str,
        role: &str,
        group_binding: &str,
    ) -> Result<()> {
        let binding = build_cluster_role_binding(sa, &self.namespace, role, group_binding);
        let name = binding.metadata.name.clone().unwrap_or_default();

        match self
            .cluster_role_bindings()
            .create(&PostParams::default(), &binding)
            .await
        {
            Ok(_) => {
                info!(name = %name, role = %role, "created cluster role binding");
                Ok(())
            }
            // A concurrent reconciliation for the same principal got here
            // first; final state is identical.
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                debug!(name = %name, "cluster role binding already exists");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn update_cluster_role_binding(
        &self,
        sa: &str,
        role: &str,
        group_binding: &str,
    ) -> Result<()> {
        let name = gen_binding_name(sa, role, group_binding);
        let api = self.cluster_role_bindings();

        match api.get(&name).await {
            Ok(existing) => {
                ensure_managed(&existing.metadata, &name)?;
                api.delete(&name, &DeleteParams::default()).await?;
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => {}
            Err(e) => return Err(e.into()),
        }

        self.create_cluster_role_binding(sa, role, group_binding).await?;
        info!(name = %name, role = %role, "updated cluster role binding");
        Ok(())
    }

    async fn delete_cluster_role_binding(&self, name: &str) -> Result<()> {
        let api = self.cluster_role_bindings();

        match api.get(name).await {
            Ok(existing) => ensure_managed(&existing.metadata, name)?,
            // Already gone; deletion is idempotent.
            Err(kube::Error::Api(ae)) if ae.code == 404 => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        api.delete(name, &DeleteParams::default()).await?;
        info!(name = %name, "deleted cluster role binding");
        Ok(())
    }

    async fn create_role_binding(
        &self,
        sa: &str,
        namespace: &str,
        group_binding: &str,
        role_ref: RoleRef,
    ) -> Result<()> {
        let binding = build_role_binding(sa, &self.namespace, namespace, group_binding, role_ref);
        let name = binding.metadata.name.clone().unwrap_or_default();

        match self
            .role_bindings(namespace)
            .create(&PostParams::default(), &binding)
            .await
        {
            Ok(_) => {
                info!(name = %name, namespace = %namespace, "created role binding");
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                debug!(name = %name, namespace = %namespace, "role binding already exists");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn update_role_binding(
        &self,
        sa: &str,
        namespace: &str,
        role_ref: RoleRef,
        group_binding: &str,
    ) -> Result<()> {
        let name = gen_binding_name(sa, &role_ref.name, group_binding);
        let api = self.role_bindings(namespace);

        match api.get(&name).await {
            Ok(existing) => {
                ensure_managed(&existing.metadata, &name)?;
                api.delete(&name, &DeleteParams::default()).await?;
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => {}
            Err(e) => return Err(e.into()),
        }

        self.create_role_binding(sa, namespace, group_binding, role_ref)
            .await?;
        info!(name = %name, namespace = %namespace, "updated role binding");
        Ok(())
    }

    async fn delete_role_binding(&self, namespace: &str, name: &str) -> Result<()> {
        let api = self.role_bindings(namespace);

        match api.get(name).await {
            Ok(existing) => ensure_managed(&existing.metadata, name)?,
            Err(kube::Error::Api(ae)) if ae.code == 404 => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        api.delete(name, &DeleteParams::default()).await?;
        info!(name = %name, namespace = %namespace, "deleted role binding");
        Ok(())
    }
}

/// True when one of the subjects is the given ServiceAccount in the
/// operating namespace
pub fn has_sa_subject(subjects: Option<&[Subject]>, sa: &str, namespace: &str) -> bool {
    subjects.unwrap_or_default().iter().any(|s| {
        s.kind == SERVICE_ACCOUNT_KIND
            && s.name == sa
            && s.namespace.as_deref() == Some(namespace)
    })
}

/// Refuse to touch an object that does not carry the managed label
fn ensure_managed(metadata: &ObjectMeta, name: &str) -> Result<()> {
    let managed = metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(MANAGED_LABEL))
        .is_some_and(|v| v == MANAGED_LABEL_VALUE);

    if managed {
        Ok(())
    } else {
        Err(Error::internal(format!(
            "refusing to modify {name}: object is not managed by kerbernetes"
        )))
    }
}

fn managed_labels() -> BTreeMap<String, String> {
    BTreeMap::from([(MANAGED_LABEL.to_string(), MANAGED_LABEL_VALUE.to_string())])
}

fn sa_subject(sa: &str, namespace: &str) -> Subject {
    Subject {
        kind: SERVICE_ACCOUNT_KIND.to_string(),
        name: sa.to_string(),
        namespace: Some(namespace.to_string()),
        ..Default::default()
    }
}

/// Build a managed ClusterRoleBinding for the SA
fn build_cluster_role_binding(
    sa: &str,
    operating_namespace: &str,
    role: &str,
    group_binding: &str,
) -> ClusterRoleBinding {
    ClusterRoleBinding {
        metadata: ObjectMeta {
            name: Some(gen_binding_name(sa, role, group_binding)),
            labels: Some(managed_labels()),
            ..Default::default()
        },
        subjects: Some(vec![sa_subject(sa, operating_namespace)]),
        role_ref: RoleRef {
            api_group: RBAC_API_GROUP.to_string(),
            kind: "ClusterRole".to_string(),
            name: role.to_string(),
        },
    }
}

/// Build a managed RoleBinding in `target_namespace` for the SA
fn build_role_binding(
    sa: &str,
    operating_namespace: &str,
    target_namespace: &str,
    group_binding: &str,
    role_ref: RoleRef,
) -> RoleBinding {
    RoleBinding {
        metadata: ObjectMeta {
            name: Some(gen_binding_name(sa, &role_ref.name, group_binding)),
            namespace: Some(target_namespace.to_string()),
            labels: Some(managed_labels()),
            ..Default::default()
        },
        subjects: Some(vec![sa_subject(sa, operating_namespace)]),
        role_ref,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn role_ref(name: &str) -> RoleRef {
        RoleRef {
            api_group: RBAC_API_GROUP.to_string(),
            kind: "Role".to_string(),
            name: name.to_string(),
        }
    }

    /// Story: binding names encode the full triple deterministically
    #[test]
    fn story_binding_name_encodes_sa_group_binding_and_role() {
        assert_eq!(
            gen_binding_name("alice@EXAMPLE.COM", "view", "dev-policy"),
            "kerbernetes:alice@EXAMPLE.COM:dev-policy:view"
        );
    }

    /// Story: every created binding carries the label, subject, and name
    ///
    /// These are the invariants the whole safety model rests on: the label
    /// is the list filter and the delete fence, the subject scopes the
    /// binding to one SA, and the name ties it to its policy triple.
    #[test]
    fn story_created_cluster_role_binding_satisfies_invariants() {
        let b = build_cluster_role_binding("alice@EXAMPLE.COM", "kerb-system", "view", "dev-policy");

        assert_eq!(
            b.metadata.name.as_deref(),
            Some("kerbernetes:alice@EXAMPLE.COM:dev-policy:view")
        );
        assert_eq!(
            b.metadata.labels.as_ref().unwrap().get(MANAGED_LABEL).map(String::as_str),
            Some(MANAGED_LABEL_VALUE)
        );
        let subjects = b.subjects.as_deref().unwrap();
        assert_eq!(subjects.len(), 1);
        assert_eq!(subjects[0].kind, "ServiceAccount");
        assert_eq!(subjects[0].name, "alice@EXAMPLE.COM");
        assert_eq!(subjects[0].namespace.as_deref(), Some("kerb-system"));
        assert_eq!(b.role_ref.kind, "ClusterRole");
        assert_eq!(b.role_ref.name, "view");
        assert_eq!(b.role_ref.api_group, RBAC_API_GROUP);
    }

    /// Story: a RoleBinding lands in the target namespace but its subject
    /// stays in the operating namespace
    #[test]
    fn story_role_binding_subject_references_operating_namespace() {
        let b = build_role_binding(
            "alice@EXAMPLE.COM",
            "kerb-system",
            "team-a",
            "dev-policy",
            role_ref("edit"),
        );

        assert_eq!(b.metadata.namespace.as_deref(), Some("team-a"));
        let subjects = b.subjects.as_deref().unwrap();
        assert_eq!(subjects[0].namespace.as_deref(), Some("kerb-system"));
        assert_eq!(b.role_ref.name, "edit");
    }

    /// Story: listing filters out bindings belonging to other accounts
    ///
    /// An earlier implementation built this filtered list and then returned
    /// the unfiltered one, silently reconciling against every managed
    /// binding in the cluster. The subject filter is load-bearing.
    #[test]
    fn story_lists_exclude_other_subjects() {
        let mine = build_cluster_role_binding("alice@EXAMPLE.COM", "default", "view", "p");
        let other_sa = build_cluster_role_binding("bob@EXAMPLE.COM", "default", "view", "p");
        let other_ns = build_cluster_role_binding("alice@EXAMPLE.COM", "elsewhere", "view", "p");

        let all = [mine, other_sa, other_ns];
        let filtered: Vec<_> = all
            .iter()
            .filter(|b| has_sa_subject(b.subjects.as_deref(), "alice@EXAMPLE.COM", "default"))
            .collect();

        assert_eq!(filtered.len(), 1);
        assert_eq!(
            filtered[0].metadata.name.as_deref(),
            Some("kerbernetes:alice@EXAMPLE.COM:p:view")
        );
    }

    #[test]
    fn subjectless_bindings_never_match() {
        assert!(!has_sa_subject(None, "alice@EXAMPLE.COM", "default"));
        assert!(!has_sa_subject(Some(&[]), "alice@EXAMPLE.COM", "default"));
    }

    /// Story: the fence rejects objects missing the managed label
    #[test]
    fn story_unmanaged_objects_are_fenced_off() {
        let unmanaged = ObjectMeta {
            name: Some("kerbernetes:x:y:z".into()),
            ..Default::default()
        };
        assert!(ensure_managed(&unmanaged, "kerbernetes:x:y:z").is_err());

        let wrong_value = ObjectMeta {
            labels: Some(BTreeMap::from([(MANAGED_LABEL.to_string(), "false".to_string())])),
            ..Default::default()
        };
        assert!(ensure_managed(&wrong_value, "x").is_err());

        let managed = ObjectMeta {
            labels: Some(managed_labels()),
            ..Default::default()
        };
        assert!(ensure_managed(&managed, "x").is_ok());
    }
}
