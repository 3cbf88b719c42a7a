//! Environment-driven configuration
//!
//! Every option is an environment variable with a CLI flag twin, so the same
//! binary runs unchanged in a pod (env) and on a workstation (flags).

use clap::Parser;

use crate::error::Error;
use crate::Result;

/// Configuration for the Kerbernetes API server
#[derive(Parser, Clone, Debug)]
#[command(name = "kerbernetes", version, about = "Kerberos/SPNEGO authentication bridge for Kubernetes")]
pub struct Config {
    /// Port the HTTP server listens on
    #[arg(long, env = "HTTP_PORT", default_value_t = 3000)]
    pub http_port: u16,

    /// Path prefix all API routes are nested under
    #[arg(long, env = "API_PREFIX", default_value = "/api")]
    pub api_prefix: String,

    /// Path to the service keytab used to accept SPNEGO tokens
    #[arg(long, env = "KEYTAB_PATH", default_value = "/etc/krb5.keytab")]
    pub keytab_path: String,

    /// Operating namespace fallback when not running in a pod
    #[arg(long, env = "NAMESPACE", default_value = "default")]
    pub namespace: String,

    /// Lifetime in seconds of issued ServiceAccount tokens
    #[arg(long, env = "TOKEN_DURATION", default_value_t = 600)]
    pub token_duration: i64,

    /// Audience bound into issued tokens
    #[arg(
        long,
        env = "TOKEN_AUDIENCE",
        default_value = "https://kubernetes.default.svc.cluster.local"
    )]
    pub token_audience: String,

    /// Enable LDAP group resolution and RBAC reconciliation
    #[arg(long, env = "LDAP_ENABLED")]
    pub ldap_enabled: bool,

    /// LDAP server URL, e.g. ldaps://ldap.example.com
    #[arg(long, env = "LDAP_URL", default_value = "")]
    pub ldap_url: String,

    /// DN the adapter binds as for directory searches
    #[arg(long, env = "LDAP_BIND_DN", default_value = "")]
    pub ldap_bind_dn: String,

    /// Password for the bind DN
    #[arg(long, env = "LDAP_BIND_PASSWORD", default_value = "")]
    pub ldap_bind_password: String,

    /// Base DN for user searches
    #[arg(long, env = "LDAP_USER_BASE_DN", default_value = "ou=users")]
    pub ldap_user_base_dn: String,

    /// User search filter; must contain exactly one `%s`
    #[arg(long, env = "LDAP_USER_FILTER", default_value = "(uid=%s)")]
    pub ldap_user_filter: String,

    /// Base DN for group searches
    #[arg(long, env = "LDAP_GROUP_BASE_DN", default_value = "ou=groups")]
    pub ldap_group_base_dn: String,

    /// Group search filter; must contain exactly one `%s`
    #[arg(long, env = "LDAP_GROUP_FILTER", default_value = "(member=%s)")]
    pub ldap_group_filter: String,
}

impl Config {
    /// Validate the configuration before anything touches the network
    ///
    /// LDAP settings are only checked when LDAP is enabled, so a token-only
    /// deployment does not need to care about filter syntax.
    pub fn validate(&self) -> Result<()> {
        if self.api_prefix.is_empty() || !self.api_prefix.starts_with('/') {
            return Err(Error::config(format!(
                "API_PREFIX must start with '/': {:?}",
                self.api_prefix
            )));
        }

        if !self.ldap_enabled {
            return Ok(());
        }

        if self.ldap_url.is_empty() {
            return Err(Error::config("LDAP_ENABLED=true requires LDAP_URL"));
        }

        validate_filter("LDAP_USER_FILTER", &self.ldap_user_filter)?;
        validate_filter("LDAP_GROUP_FILTER", &self.ldap_group_filter)?;

        Ok(())
    }
}

/// Check that a search filter template is well-formed: exactly one `%s`
/// substitution and balanced parentheses
fn validate_filter(name: &str, filter: &str) -> Result<()> {
    let substitutions = filter.matches("%s").count();
    if substitutions != 1 {
        return Err(Error::config(format!(
            "{name} must contain exactly one %s, found {substitutions}: {filter:?}"
        )));
    }

    let mut depth: i32 = 0;
    for c in filter.chars() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth < 0 {
                    return Err(Error::config(format!(
                        "{name} has unbalanced parentheses: {filter:?}"
                    )));
                }
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(Error::config(format!(
            "{name} has unbalanced parentheses: {filter:?}"
        )));
    }

    Ok(())
}
