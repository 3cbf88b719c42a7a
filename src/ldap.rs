//! LDAP directory adapter
//!
//! Resolves an authenticated username to its directory entry and group
//! memberships. Every call opens a fresh connection, binds with the
//! configured service credentials, runs a single subtree search, and closes
//! the connection on all exit paths, so failures stay isolated to one
//! request and credential changes take effect on the next call.

use async_trait::async_trait;
use ldap3::{ldap_escape, Ldap, LdapConnAsync, Scope, SearchEntry};
use tracing::{debug, instrument, warn};

#[cfg(test)]
use mockall::automock;

use crate::config::Config;
use crate::error::Error;
use crate::Result;

/// A user entry resolved from the directory
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LdapUser {
    /// Distinguished name of the user entry
    pub dn: String,
}

/// Directory lookups needed by the auth flow
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LdapDirectory: Send + Sync {
    /// Resolve a username to its sole directory entry
    ///
    /// Zero matches and multiple matches are both authentication failures:
    /// the caller cannot safely pick an identity.
    async fn get_user(&self, username: &str) -> Result<LdapUser>;

    /// Resolve the group DNs a user entry is a member of
    async fn get_user_groups(&self, user_dn: &str) -> Result<Vec<String>>;
}

/// Production adapter: one connect + simple bind per operation
pub struct BindLdapDirectory {
    url: String,
    bind_dn: String,
    bind_password: String,
    user_base_dn: String,
    user_filter: String,
    group_base_dn: String,
    group_filter: String,
}

impl BindLdapDirectory {
    /// Build the adapter from validated configuration
    pub fn new(config: &Config) -> Self {
        Self {
            url: config.ldap_url.clone(),
            bind_dn: config.ldap_bind_dn.clone(),
            bind_password: config.ldap_bind_password.clone(),
            user_base_dn: config.ldap_user_base_dn.clone(),
            user_filter: config.ldap_user_filter.clone(),
            group_base_dn: config.ldap_group_base_dn.clone(),
            group_filter: config.ldap_group_filter.clone(),
        }
    }

    /// Open a connection and bind with the service credentials
    async fn connect(&self) -> Result<Ldap> {
        let (conn, mut ldap) = LdapConnAsync::new(&self.url)
            .await
            .map_err(|e| Error::internal(format!("ldap connect to {}: {e}", self.url)))?;
        ldap3::drive!(conn);

        let bind = ldap
            .simple_bind(&self.bind_dn, &self.bind_password)
            .await
            .map_err(|e| Error::internal(format!("ldap bind transport: {e}")))?;
        if let Err(e) = bind.success() {
            let _ = ldap.unbind().await;
            return Err(Error::unauthorized(format!("ldap bind failed: {e}")));
        }

        Ok(ldap)
    }

    async fn search_dns(&self, ldap: &mut Ldap, base: &str, filter: &str) -> Result<Vec<String>> {
        let (entries, _res) = ldap
            .search(base, Scope::Subtree, filter, vec!["dn"])
            .await
            .map_err(|e| Error::internal(format!("ldap search transport: {e}")))?
            .success()
            .map_err(|e| Error::internal(format!("ldap search failed: {e}")))?;

        Ok(entries
            .into_iter()
            .map(|e| SearchEntry::construct(e).dn)
            .collect())
    }
}

#[async_trait]
impl LdapDirectory for BindLdapDirectory {
    #[instrument(skip(self))]
    async fn get_user(&self, username: &str) -> Result<LdapUser> {
        let filter = render_filter(&self.user_filter, username);
        let mut ldap = self.connect().await?;

        let result = self.search_dns(&mut ldap, &self.user_base_dn, &filter).await;
        let _ = ldap.unbind().await;

        sole_user(result?, username)
    }

    #[instrument(skip(self))]
    async fn get_user_groups(&self, user_dn: &str) -> Result<Vec<String>> {
        let filter = render_filter(&self.group_filter, user_dn);
        let mut ldap = self.connect().await?;

        let result = self.search_dns(&mut ldap, &self.group_base_dn, &filter).await;
        let _ = ldap.unbind().await;

        let groups = result?;
        debug!(user_dn = %user_dn, count = groups.len(), "resolved user groups");
        Ok(groups)
    }
}

/// Substitute the single `%s` in a filter template, RFC 4515-escaping the
/// value so directory metacharacters in usernames or DNs cannot alter the
/// filter structure
fn render_filter(template: &str, value: &str) -> String {
    template.replacen("%s", &ldap_escape(value), 1)
}

/// Enforce the sole-entry rule for user lookups
fn sole_user(mut dns: Vec<String>, username: &str) -> Result<LdapUser> {
    match dns.len() {
        0 => Err(Error::unauthorized(format!("user not found: {username}"))),
        1 => Ok(LdapUser { dn: dns.remove(0) }),
        n => {
            warn!(username = %username, matches = n, "ambiguous user filter result");
            Err(Error::unauthorized(format!(
                "ambiguous directory result for {username}: {n} entries"
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Story: a username is substituted into the configured filter
    #[test]
    fn story_filter_substitution_uses_single_placeholder() {
        assert_eq!(render_filter("(uid=%s)", "alice"), "(uid=alice)");
        assert_eq!(
            render_filter("(member=%s)", "uid=alice,ou=users,dc=x"),
            "(member=uid=alice,ou=users,dc=x)"
        );
    }

    /// Story: a hostile username cannot rewrite the filter
    ///
    /// `*` and parentheses are LDAP filter metacharacters; an unescaped
    /// `admin)(uid=*` would widen the search to every entry.
    #[test]
    fn story_metacharacters_are_escaped_before_substitution() {
        let filter = render_filter("(uid=%s)", "admin)(uid=*");
        assert_eq!(filter, r"(uid=admin\29\28uid=\2a)");
    }

    /// Story: exactly one directory entry identifies the user
    #[test]
    fn story_sole_entry_rule() {
        let ok = sole_user(vec!["uid=alice,ou=users,dc=x".into()], "alice").unwrap();
        assert_eq!(ok.dn, "uid=alice,ou=users,dc=x");

        let none = sole_user(vec![], "bob").unwrap_err();
        assert!(matches!(none, Error::Unauthorized(_)));
        assert!(none.to_string().contains("not found"));

        let many = sole_user(
            vec!["uid=carol,ou=a,dc=x".into(), "uid=carol,ou=b,dc=x".into()],
            "carol",
        )
        .unwrap_err();
        assert!(matches!(many, Error::Unauthorized(_)));
        assert!(many.to_string().contains("ambiguous"));
    }

    #[test]
    fn backslash_in_dn_is_escaped() {
        let filter = render_filter("(member=%s)", r"cn=Smith\, John,ou=users,dc=x");
        assert!(filter.contains(r"\5c"), "backslash must be escaped: {filter}");
    }
}
