//! Cluster-control CLI helpers

use std::path::{Path, PathBuf};

use serde_json::Value;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use super::process::Invocation;
use crate::domain::cluster::{ClusterCredential, ClusterRecord};
use crate::error::{Error, Result};

/// How a kubectl invocation authenticates
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KubeAccess {
    /// Use whatever the process environment provides
    Ambient,
    Kubeconfig(String),
    Token {
        server: String,
        token: String,
        /// CA bundle file; system roots when unset
        ca_file: Option<String>,
        insecure: bool,
    },
}

impl KubeAccess {
    pub fn token(server: impl Into<String>, token: impl Into<String>) -> Self {
        KubeAccess::Token {
            server: server.into(),
            token: token.into(),
            ca_file: None,
            insecure: false,
        }
    }
}

/// Builds kubectl invocations bound to one set of credentials
#[derive(Debug, Clone)]
pub struct Kubectl {
    bin: String,
    access: KubeAccess,
}

impl Kubectl {
    pub fn new(bin: impl Into<String>, access: KubeAccess) -> Self {
        Self {
            bin: bin.into(),
            access,
        }
    }

    pub fn access(&self) -> &KubeAccess {
        &self.access
    }

    /// Invocation with credential flags followed by `args`
    pub fn invocation<I, S>(&self, args: I) -> Invocation
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let inv = Invocation::new(&self.bin);
        let inv = match &self.access {
            KubeAccess::Ambient => inv,
            KubeAccess::Kubeconfig(path) => inv.arg("--kubeconfig").arg(path),
            KubeAccess::Token {
                server,
                token,
                ca_file,
                insecure,
            } => {
                let mut inv = inv.arg("--server").arg(server).arg("--token").arg(token);
                if let Some(ca_file) = ca_file {
                    inv = inv.arg("--certificate-authority").arg(ca_file);
                }
                if *insecure {
                    inv = inv.arg("--insecure-skip-tls-verify=true");
                }
                inv
            }
        };
        inv.args(args)
    }
}

/// Write `contents` to `dir/file_name` readable by the owner only
///
/// The file is written under a temporary name and renamed into place, so
/// concurrent readers see either the old or the new document.
pub async fn write_private(dir: &str, file_name: &str, contents: &str) -> Result<String> {
    fs::create_dir_all(dir).await?;
    let path: PathBuf = Path::new(dir).join(file_name);
    let tmp: PathBuf = Path::new(dir).join(format!(".{}.{}.tmp", file_name, Uuid::new_v4()));

    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o600);

    let written = async {
        let mut file = options.open(&tmp).await?;
        file.write_all(contents.as_bytes()).await?;
        file.sync_all().await?;
        fs::rename(&tmp, &path).await
    }
    .await;
    if let Err(e) = written {
        let _ = fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(path.to_string_lossy().to_string())
}

/// Write a kubeconfig document to `dir/name.kubeconfig` and return its path
pub async fn write_kubeconfig(dir: &str, name: &str, contents: &str) -> Result<String> {
    write_private(dir, &format!("{}.kubeconfig", name), contents).await
}

/// Remove a file written by [`write_private`]; missing files are fine
pub async fn remove_kubeconfig(path: &str) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Scratch files [`access_for_cluster`] and [`kubeconfig_for`] may leave for a cluster
pub fn cluster_scratch_files(scratch_dir: &str, cluster_id: &str) -> Vec<String> {
    [
        format!("cluster-{}.kubeconfig", cluster_id),
        format!("cluster-{}-token.kubeconfig", cluster_id),
        format!("cluster-{}.ca.crt", cluster_id),
    ]
    .into_iter()
    .map(|name| Path::new(scratch_dir).join(name).to_string_lossy().to_string())
    .collect()
}

/// Resolve kubectl access for a registered cluster
pub async fn access_for_cluster(record: &ClusterRecord, scratch_dir: &str) -> Result<KubeAccess> {
    match &record.credential {
        ClusterCredential::Kubeconfig(contents) => {
            let path = write_kubeconfig(scratch_dir, &format!("cluster-{}", record.id), contents).await?;
            Ok(KubeAccess::Kubeconfig(path))
        }
        ClusterCredential::Token(credential) => {
            let ca_file = match &credential.certificate_authority {
                Some(pem) => Some(
                    write_private(scratch_dir, &format!("cluster-{}.ca.crt", record.id), pem).await?,
                ),
                None => None,
            };
            Ok(KubeAccess::Token {
                server: record.endpoint.clone(),
                token: credential.token.clone(),
                ca_file,
                insecure: credential.insecure_skip_tls_verify,
            })
        }
    }
}

/// Kubeconfig document for bearer-token access, for tools without token flags
pub fn token_kubeconfig(
    server: &str,
    token: &str,
    ca_file: Option<&str>,
    insecure: bool,
) -> String {
    let mut trust = String::new();
    if let Some(ca_file) = ca_file {
        trust.push_str(&format!("    certificate-authority: {ca_file}\n"));
    }
    if insecure {
        trust.push_str("    insecure-skip-tls-verify: true\n");
    }
    format!(
        "apiVersion: v1
kind: Config
clusters:
- name: target
  cluster:
    server: {server}
{trust}users:
- name: target
  user:
    token: {token}
contexts:
- name: target
  context:
    cluster: target
    user: target
current-context: target
"
    )
}

/// Kubeconfig path equivalent to `access`; `None` for ambient credentials
pub async fn kubeconfig_for(access: &KubeAccess, dir: &str, name: &str) -> Result<Option<String>> {
    match access {
        KubeAccess::Ambient => Ok(None),
        KubeAccess::Kubeconfig(path) => Ok(Some(path.clone())),
        KubeAccess::Token {
            server,
            token,
            ca_file,
            insecure,
        } => {
            let doc = token_kubeconfig(server, token, ca_file.as_deref(), *insecure);
            Ok(Some(write_kubeconfig(dir, name, &doc).await?))
        }
    }
}

/// First `server:` entry of a kubeconfig document
pub fn server_from_kubeconfig(contents: &str) -> Option<String> {
    contents.lines().find_map(|line| {
        line.trim()
            .strip_prefix("server:")
            .map(|s| s.trim().trim_matches('"').to_string())
            .filter(|s| !s.is_empty())
    })
}

/// Parse kubectl `-o json` output
pub fn parse_json(stdout: &str) -> Result<Value> {
    serde_json::from_str(stdout)
        .map_err(|e| Error::ValidationError(format!("Unparseable kubectl output: {}", e)))
}

/// `items` array of a kubectl list response
pub fn items(list: &Value) -> &[Value] {
    list.get("items")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}
