//! The kerberos auth endpoint
//!
//! Orchestrates one authenticated request: upsert the principal's
//! ServiceAccount, resolve directory groups and reconcile bindings when LDAP
//! is enabled, mint a bound token, and hand back the exec credential.

use std::collections::HashSet;

use axum::extract::State;
use axum::Json;
use tracing::{debug, info};

use crate::credentials::ExecCredential;
use crate::server::AppState;
use crate::spnego::Principal;
use crate::Result;

impl Principal {
    /// Directory username: the principal with its realm stripped
    ///
    /// LDAP entries are keyed by the bare username (`uid=alice`), while the
    /// ServiceAccount keeps the full `alice@EXAMPLE.COM` form.
    pub fn username(&self) -> &str {
        match self.0.rsplit_once('@') {
            Some((name, _realm)) => name,
            None => &self.0,
        }
    }
}

/// `GET /auth/kerberos`
///
/// Guarded by the SPNEGO middleware; reaching this handler without a
/// principal fails closed with 403 via the [`Principal`] extractor. When
/// LDAP is disabled the user still gets a bound token with whatever
/// bindings already exist.
pub async fn kerberos_auth(
    State(state): State<AppState>,
    principal: Principal,
) -> Result<Json<ExecCredential>> {
    let sa_name = principal.as_str();
    info!(principal = %sa_name, "authenticated kerberos principal");

    state.bindings.upsert_service_account(sa_name).await?;

    if let Some(ldap) = &state.ldap {
        let user = ldap.get_user(principal.username()).await?;
        let groups: HashSet<String> = ldap.get_user_groups(&user.dn).await?.into_iter().collect();
        debug!(principal = %sa_name, dn = %user.dn, groups = groups.len(), "resolved directory identity");

        let snapshot = state.cache.snapshot().await;
        state.reconciler.reconcile(sa_name, &groups, &snapshot).await?;
    } else {
        debug!(principal = %sa_name, "ldap disabled, skipping reconciliation");
    }

    let issued = state.bindings.issue_token(sa_name).await?;
    Ok(Json(ExecCredential::new(issued.token, issued.expiration)))
}
