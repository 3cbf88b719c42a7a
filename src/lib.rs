//! Kerbernetes - Kerberos/SPNEGO authentication bridge for Kubernetes
//!
//! Kerbernetes lets a workstation user with a valid Kerberos ticket obtain a
//! short-lived Kubernetes credential. The server verifies the SPNEGO token,
//! resolves the principal's group memberships in LDAP, converges a managed
//! ServiceAccount and the RBAC bindings implied by `LdapGroupBinding`
//! resources, and returns a bound ServiceAccount token as an `ExecCredential`
//! consumable by the standard client exec plugin protocol.
//!
//! # Request flow
//!
//! 1. The SPNEGO middleware verifies `Authorization: Negotiate` against the
//!    service keytab and attaches the authenticated principal.
//! 2. The auth endpoint upserts a ServiceAccount named after the principal.
//! 3. When LDAP is enabled, the principal's group DNs are resolved and the
//!    reconciler diffs the managed ClusterRoleBindings/RoleBindings against
//!    the desired state implied by the `LdapGroupBinding` cache.
//! 4. A token is minted via the TokenRequest subresource and returned.
//!
//! # Modules
//!
//! - [`config`] - Environment-driven configuration
//! - [`crd`] - The `LdapGroupBinding` custom resource
//! - [`spnego`] - SPNEGO/GSSAPI authentication middleware
//! - [`ldap`] - LDAP directory adapter
//! - [`k8s`] - Kubernetes client holder
//! - [`cache`] - Watch-fed `LdapGroupBinding` cache
//! - [`bindings`] - ServiceAccount and RBAC binding manager
//! - [`reconciler`] - Desired-state reconciliation
//! - [`auth`] - The `/auth/kerberos` endpoint
//! - [`credentials`] - ExecCredential wire format
//! - [`server`] - Router assembly and shared state
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod auth;
pub mod bindings;
pub mod cache;
pub mod config;
pub mod crd;
pub mod credentials;
pub mod error;
pub mod k8s;
pub mod ldap;
pub mod reconciler;
pub mod server;
pub mod spnego;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Label applied to every binding this system creates.
///
/// The label is both the list filter and the safety fence: no object lacking
/// it is ever created, updated, or deleted by the reconciler.
pub const MANAGED_LABEL: &str = "kerbernetes.io/managed";

/// Value carried by [`MANAGED_LABEL`] on managed objects
pub const MANAGED_LABEL_VALUE: &str = "true";

/// API group of Kubernetes RBAC role references
pub const RBAC_API_GROUP: &str = "rbac.authorization.k8s.io";
