//! LdapGroupBinding Custom Resource Definition
//!
//! An `LdapGroupBinding` maps one LDAP group DN to a list of RBAC role
//! bindings. The reconciler treats the cluster's set of these resources as
//! the authoritative desired policy and never mutates them.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Kind accepted for cluster-wide bindings
pub const KIND_CLUSTER_ROLE: &str = "ClusterRole";

/// Kind accepted for namespaced bindings
pub const KIND_ROLE: &str = "Role";

/// Specification for an LdapGroupBinding
///
/// Cluster-scoped: policy applies to users regardless of which namespace
/// their ServiceAccount lives in.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "rbac.kerbernetes.io",
    version = "v1",
    kind = "LdapGroupBinding",
    plural = "ldapgroupbindings",
    shortname = "lgb",
    printcolumn = r#"{"name":"Group DN","type":"string","jsonPath":".spec.ldapGroupDN"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct LdapGroupBindingSpec {
    /// Distinguished name of the LDAP group this policy applies to.
    /// Matched against the user's group DNs by exact string comparison.
    #[serde(rename = "ldapGroupDN")]
    pub ldap_group_dn: String,

    /// Role bindings granted to members of the group
    pub bindings: Vec<BindingTarget>,
}

/// One role binding granted by an [`LdapGroupBindingSpec`]
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BindingTarget {
    /// `ClusterRole` or `Role`; anything else is skipped with a warning
    pub kind: String,

    /// Name of the referenced role
    pub name: String,

    /// Target namespace; required iff `kind == "Role"`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// API group of the referenced role
    #[serde(default)]
    pub api_group: String,
}

impl BindingTarget {
    /// Returns true for a well-formed cluster-wide target
    pub fn is_cluster_role(&self) -> bool {
        self.kind == KIND_CLUSTER_ROLE
    }

    /// Returns the target namespace for a well-formed namespaced target
    ///
    /// `None` means this is not a usable Role target: either the kind is
    /// something else, or the namespace is missing/empty (a spec error the
    /// reconciler skips with a warning).
    pub fn role_namespace(&self) -> Option<&str> {
        if self.kind != KIND_ROLE {
            return None;
        }
        match self.namespace.as_deref() {
            Some("") | None => None,
            Some(ns) => Some(ns),
        }
    }
}
