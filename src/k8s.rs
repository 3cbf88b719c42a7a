//! Kubernetes client holder
//!
//! One place acquires the REST client and decides the operating namespace;
//! everything downstream borrows from here.

use kube::Client;
use tracing::info;

use crate::error::Error;
use crate::Result;

/// Path the kubelet projects the pod's namespace into
const NAMESPACE_FILE: &str = "/var/run/secrets/kubernetes.io/serviceaccount/namespace";

/// Holds the Kubernetes client and the namespace this instance operates in
///
/// Managed ServiceAccounts live in the operating namespace, and every managed
/// binding's subject references it.
#[derive(Clone)]
pub struct KubeHolder {
    /// Shared Kubernetes client (cheap to clone, internally pooled)
    pub client: Client,
    /// Namespace ServiceAccounts are managed in
    pub namespace: String,
}

impl KubeHolder {
    /// Connect to the cluster and determine the operating namespace
    ///
    /// The client is inferred the standard way: in-cluster configuration
    /// first, then the kubeconfig loading rules. Failure of both is fatal to
    /// startup. The namespace comes from the projected serviceaccount file
    /// when running in a pod, otherwise from the configured fallback.
    pub async fn connect(fallback_namespace: &str) -> Result<Self> {
        let client = Client::try_default()
            .await
            .map_err(|e| Error::config(format!("no usable kubernetes config: {e}")))?;

        let namespace = detect_namespace(fallback_namespace).await;
        info!(namespace = %namespace, "connected to kubernetes");

        Ok(Self { client, namespace })
    }
}

/// Resolve the operating namespace: projected pod file, then fallback
async fn detect_namespace(fallback: &str) -> String {
    match tokio::fs::read_to_string(NAMESPACE_FILE).await {
        Ok(ns) if !ns.trim().is_empty() => ns.trim().to_string(),
        _ => fallback.to_string(),
    }
}
