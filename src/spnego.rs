//! SPNEGO/GSSAPI authentication middleware
//!
//! Wraps the API routes with RFC 4559 `Negotiate` authentication. The
//! acceptor credential is acquired once at startup from the configured
//! keytab; a failure there is fatal. Each request steps a fresh acceptor
//! context, so no negotiation state is held between requests (workstation
//! clients complete Kerberos SPNEGO in a single round trip). Replay
//! protection is the krb5 mechanism's built-in acceptor replay cache.
//!
//! PAC decoding is not performed; the principal is taken from the GSSAPI
//! source name.

use std::sync::Arc;

use axum::extract::{FromRequestParts, Request, State};
use axum::http::header::{AUTHORIZATION, WWW_AUTHENTICATE};
use axum::http::request::Parts;
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use libgssapi::context::{SecurityContext, ServerCtx};
use libgssapi::credential::{Cred, CredUsage};
use libgssapi::oid::{OidSet, GSS_MECH_KRB5};
use tracing::{debug, info, warn};

use crate::error::Error;
use crate::Result;

/// Authenticated Kerberos principal, e.g. `alice@EXAMPLE.COM`
///
/// Attached to request extensions by the middleware; handlers extract it and
/// use it verbatim as the ServiceAccount name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Principal(pub String);

impl Principal {
    /// The principal string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<S> FromRequestParts<S> for Principal
where
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self> {
        parts
            .extensions
            .get::<Principal>()
            .cloned()
            .ok_or_else(|| Error::forbidden("no authenticated principal in request context"))
    }
}

/// Outcome of a successful token acceptance
pub struct Accepted {
    /// Verified source principal
    pub principal: String,
    /// Mutual-authentication reply token, if the mechanism produced one
    pub reply: Option<Vec<u8>>,
}

/// Keytab-backed SPNEGO acceptor
pub struct SpnegoGate {
    cred: Cred,
}

impl SpnegoGate {
    /// Acquire the acceptor credential from a keytab
    ///
    /// Points the krb5 mechanism at `keytab_path` and acquires an accept-side
    /// credential for any principal in it. Called once at startup; errors
    /// here must abort the process.
    pub fn from_keytab(keytab_path: &str) -> Result<Self> {
        std::env::set_var("KRB5_KTNAME", keytab_path);

        let mut mechs = OidSet::new()
            .map_err(|e| Error::keytab(format!("failed to allocate mechanism set: {e}")))?;
        mechs
            .add(&GSS_MECH_KRB5)
            .map_err(|e| Error::keytab(format!("failed to select krb5 mechanism: {e}")))?;

        let cred = Cred::acquire(None, None, CredUsage::Accept, Some(&mechs)).map_err(|e| {
            Error::keytab(format!(
                "failed to acquire acceptor credential from {keytab_path}: {e}"
            ))
        })?;

        info!(keytab = %keytab_path, "SPNEGO acceptor initialized");
        Ok(Self { cred })
    }

    /// Verify one client token and return the authenticated principal
    pub fn accept(&self, token: &[u8]) -> Result<Accepted> {
        let mut ctx = ServerCtx::new(Some(self.cred.clone()));

        let reply = ctx
            .step(token)
            .map_err(|e| Error::unauthorized(format!("SPNEGO token rejected: {e}")))?;

        if !ctx.is_complete() {
            return Err(Error::unauthorized(
                "SPNEGO negotiation did not complete in one round trip",
            ));
        }

        let name = ctx
            .source_name()
            .and_then(|n| n.display_name())
            .map_err(|e| Error::unauthorized(format!("failed to read source principal: {e}")))?;

        let principal = String::from_utf8(name.to_vec())
            .map_err(|_| Error::unauthorized("source principal is not valid UTF-8"))?;

        Ok(Accepted {
            principal,
            reply: reply.map(|b| b.to_vec()),
        })
    }
}

/// Pull the base64 GSSAPI blob out of an `Authorization: Negotiate` header
fn parse_negotiate_header(value: &str) -> Result<Vec<u8>> {
    let blob = value
        .strip_prefix("Negotiate ")
        .ok_or_else(|| Error::unauthorized("authorization scheme is not Negotiate"))?;

    BASE64
        .decode(blob.trim())
        .map_err(|_| Error::unauthorized("Negotiate token is not valid base64"))
}

/// Axum middleware enforcing SPNEGO authentication
///
/// On success the verified [`Principal`] is attached to request extensions
/// and any mutual-auth reply token is echoed on the response. All failures
/// produce 401 with the `Negotiate` challenge.
pub async fn spnego_auth(
    State(gate): State<Arc<SpnegoGate>>,
    mut request: Request,
    next: Next,
) -> Response {
    let header = match request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    {
        Some(value) => value.to_string(),
        None => {
            debug!("request without authorization header, challenging");
            return Error::unauthorized("authentication required").into_response();
        }
    };

    let accepted = match parse_negotiate_header(&header).and_then(|token| gate.accept(&token)) {
        Ok(accepted) => accepted,
        Err(e) => {
            warn!(error = %e, "SPNEGO authentication failed");
            return e.into_response();
        }
    };

    debug!(principal = %accepted.principal, "SPNEGO authentication succeeded");
    request
        .extensions_mut()
        .insert(Principal(accepted.principal));

    let mut response = next.run(request).await;

    if let Some(reply) = accepted.reply {
        let value = format!("Negotiate {}", BASE64.encode(reply));
        if let Ok(value) = HeaderValue::from_str(&value) {
            response.headers_mut().insert(WWW_AUTHENTICATE, value);
        }
    }

    response
}
