//! Router assembly and shared request state
//!
//! Wires the auth endpoint under the configured API prefix, guards it with
//! the SPNEGO middleware, and logs each request at the boundary.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::Request;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use tracing::info;

use crate::bindings::BindingManager;
use crate::cache::GroupBindingCache;
use crate::ldap::LdapDirectory;
use crate::reconciler::Reconciler;
use crate::spnego::{spnego_auth, SpnegoGate};

/// Shared state handed to every request handler
#[derive(Clone)]
pub struct AppState {
    /// ServiceAccount and binding operations
    pub bindings: Arc<dyn BindingManager>,
    /// Directory adapter; `None` when LDAP is disabled
    pub ldap: Option<Arc<dyn LdapDirectory>>,
    /// LdapGroupBinding snapshot source
    pub cache: Arc<GroupBindingCache>,
    /// Binding reconciler
    pub reconciler: Arc<Reconciler>,
}

/// The authenticated API surface, without the SPNEGO gate
///
/// Split out so tests can drive handlers with a synthetic principal.
pub fn api_router(state: AppState) -> Router {
    Router::new()
        .route("/auth/kerberos", get(crate::auth::kerberos_auth))
        .with_state(state)
}

/// Full router: API surface nested under the prefix, SPNEGO in front,
/// request logging outermost
pub fn router(state: AppState, gate: Arc<SpnegoGate>, api_prefix: &str) -> Router {
    let api = api_router(state).layer(middleware::from_fn_with_state(gate, spnego_auth));

    Router::new()
        .nest(api_prefix, api)
        .layer(middleware::from_fn(log_requests))
}

/// Boundary request log: one line per request with method, path, status
async fn log_requests(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let start = Instant::now();

    let response = next.run(request).await;

    info!(
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "handled request"
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bindings::{IssuedToken, MockBindingManager};
    use crate::crd::{BindingTarget, LdapGroupBinding, LdapGroupBindingSpec};
    use crate::credentials::ExecCredential;
    use crate::error::Error;
    use crate::ldap::{LdapUser, MockLdapDirectory};
    use crate::spnego::Principal;
    use crate::RBAC_API_GROUP;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use chrono::{TimeZone, Utc};
    use http_body_util::BodyExt;
    use k8s_openapi::api::core::v1::ServiceAccount;
    use kube::runtime::watcher::Event;
    use std::collections::HashMap;
    use tower::ServiceExt;

    const SA: &str = "alice@EXAMPLE.COM";
    const ALICE_DN: &str = "uid=alice,ou=users,dc=x";
    const DEVS: &str = "cn=devs,ou=groups,dc=x";

    fn sa_object() -> ServiceAccount {
        ServiceAccount {
            metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
                name: Some(SA.into()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn issued_token() -> IssuedToken {
        IssuedToken {
            token: "bound-token".into(),
            expiration: Some(Utc.with_ymd_and_hms(2024, 5, 1, 12, 40, 0).unwrap()),
        }
    }

    async fn dev_policy_cache() -> Arc<GroupBindingCache> {
        let cache = GroupBindingCache::new();
        let mut relist = HashMap::new();
        cache.apply(Event::Init, &mut relist).await;
        cache
            .apply(
                Event::InitApply(LdapGroupBinding::new(
                    "dev-policy",
                    LdapGroupBindingSpec {
                        ldap_group_dn: DEVS.into(),
                        bindings: vec![
                            BindingTarget {
                                kind: "ClusterRole".into(),
                                name: "view".into(),
                                namespace: None,
                                api_group: RBAC_API_GROUP.into(),
                            },
                            BindingTarget {
                                kind: "Role".into(),
                                name: "edit".into(),
                                namespace: Some("team-a".into()),
                                api_group: RBAC_API_GROUP.into(),
                            },
                        ],
                    },
                )),
                &mut relist,
            )
            .await;
        cache.apply(Event::InitDone, &mut relist).await;
        cache
    }

    fn state(
        bindings: MockBindingManager,
        ldap: Option<MockLdapDirectory>,
        cache: Arc<GroupBindingCache>,
    ) -> AppState {
        let bindings: Arc<dyn crate::bindings::BindingManager> = Arc::new(bindings);
        AppState {
            reconciler: Arc::new(Reconciler::new(bindings.clone())),
            bindings,
            ldap: ldap.map(|l| Arc::new(l) as Arc<dyn LdapDirectory>),
            cache,
        }
    }

    fn authenticated_request() -> Request<Body> {
        Request::builder()
            .uri("/auth/kerberos")
            .extension(Principal(SA.into()))
            .body(Body::empty())
            .unwrap()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    /// Story: with LDAP disabled, a first login just gets a token
    ///
    /// The ServiceAccount is created, no binding is touched, and the
    /// response carries the server-reported expiry.
    #[tokio::test]
    async fn story_ldap_disabled_issues_token_without_touching_bindings() {
        let mut bindings = MockBindingManager::new();
        bindings
            .expect_upsert_service_account()
            .withf(|name| name == SA)
            .times(1)
            .returning(|_| Ok(sa_object()));
        bindings
            .expect_issue_token()
            .withf(|name| name == SA)
            .times(1)
            .returning(|_| Ok(issued_token()));
        bindings.expect_list_managed_cluster_role_bindings().times(0);
        bindings.expect_list_managed_role_bindings().times(0);

        let app = api_router(state(bindings, None, GroupBindingCache::new()));
        let response = app.oneshot(authenticated_request()).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        let cred: ExecCredential = serde_json::from_value(body).unwrap();
        assert_eq!(cred.kind, "ExecCredential");
        let status = cred.status.unwrap();
        assert_eq!(status.token, "bound-token");
        assert_eq!(status.expiration_timestamp.as_deref(), Some("2024-05-01T12:40:00Z"));
    }

    /// Story: a developer's first LDAP-backed login converges the bindings
    ///
    /// alice is in cn=devs; dev-policy grants ClusterRole view plus Role
    /// edit in team-a. Both managed bindings are created, then the token is
    /// issued.
    #[tokio::test]
    async fn story_ldap_login_creates_policy_bindings() {
        let mut bindings = MockBindingManager::new();
        bindings
            .expect_upsert_service_account()
            .times(1)
            .returning(|_| Ok(sa_object()));
        bindings
            .expect_list_managed_cluster_role_bindings()
            .times(1)
            .returning(|_| Ok(vec![]));
        bindings
            .expect_list_managed_role_bindings()
            .times(1)
            .returning(|_| Ok(vec![]));
        bindings
            .expect_create_cluster_role_binding()
            .withf(|sa, role, lgb| sa == SA && role == "view" && lgb == "dev-policy")
            .times(1)
            .returning(|_, _, _| Ok(()));
        bindings
            .expect_create_role_binding()
            .withf(|sa, ns, lgb, role_ref| {
                sa == SA && ns == "team-a" && lgb == "dev-policy" && role_ref.name == "edit"
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));
        bindings
            .expect_issue_token()
            .times(1)
            .returning(|_| Ok(issued_token()));

        let mut ldap = MockLdapDirectory::new();
        ldap.expect_get_user()
            .withf(|username| username == "alice")
            .times(1)
            .returning(|_| Ok(LdapUser { dn: ALICE_DN.into() }));
        ldap.expect_get_user_groups()
            .withf(|dn| dn == ALICE_DN)
            .times(1)
            .returning(|_| Ok(vec![DEVS.into()]));

        let app = api_router(state(bindings, Some(ldap), dev_policy_cache().await));
        let response = app.oneshot(authenticated_request()).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"]["token"], "bound-token");
    }

    /// Story: an ambiguous directory lookup refuses authentication
    ///
    /// Two entries match the user filter. No token is issued and no binding
    /// is touched; only the prior SA upsert has happened.
    #[tokio::test]
    async fn story_ambiguous_user_is_unauthorized() {
        let mut bindings = MockBindingManager::new();
        bindings
            .expect_upsert_service_account()
            .times(1)
            .returning(|_| Ok(sa_object()));
        bindings.expect_issue_token().times(0);
        bindings.expect_list_managed_cluster_role_bindings().times(0);

        let mut ldap = MockLdapDirectory::new();
        ldap.expect_get_user()
            .times(1)
            .returning(|u| Err(Error::unauthorized(format!("ambiguous directory result for {u}: 2 entries"))));

        let app = api_router(state(bindings, Some(ldap), GroupBindingCache::new()));
        let response = app.oneshot(authenticated_request()).await.unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    /// Story: reconciliation failure surfaces as an internal error
    #[tokio::test]
    async fn story_reconcile_failure_is_internal_error() {
        let mut bindings = MockBindingManager::new();
        bindings
            .expect_upsert_service_account()
            .times(1)
            .returning(|_| Ok(sa_object()));
        bindings
            .expect_list_managed_cluster_role_bindings()
            .times(1)
            .returning(|_| Err(Error::internal("api server unavailable")));
        bindings.expect_issue_token().times(0);

        let mut ldap = MockLdapDirectory::new();
        ldap.expect_get_user()
            .times(1)
            .returning(|_| Ok(LdapUser { dn: ALICE_DN.into() }));
        ldap.expect_get_user_groups()
            .times(1)
            .returning(|_| Ok(vec![DEVS.into()]));

        let app = api_router(state(bindings, Some(ldap), dev_policy_cache().await));
        let response = app.oneshot(authenticated_request()).await.unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    /// Story: a request that slipped past authentication is forbidden
    ///
    /// Without a principal extension the handler never runs and the client
    /// gets 403, not a token.
    #[tokio::test]
    async fn story_request_without_principal_is_forbidden() {
        let bindings = MockBindingManager::new();
        let app = api_router(state(bindings, None, GroupBindingCache::new()));

        let request = Request::builder()
            .uri("/auth/kerberos")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }
}
