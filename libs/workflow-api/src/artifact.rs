//! Artifact identity and storage locations

use serde::{Deserialize, Serialize};

use crate::meta::{ConfigMapKeySelector, SecretKeySelector};

/// An input or output artifact of a template
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub name: String,

    /// Path inside the container
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,

    /// Permission bits applied after loading
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<u32>,

    /// Reference to an upstream output (`{{steps.x.outputs.artifacts.y}}`)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub from: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub from_expression: String,

    #[serde(flatten)]
    pub location: ArtifactLocation,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive: Option<ArchiveStrategy>,

    #[serde(default, skip_serializing_if = "is_false")]
    pub optional: bool,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sub_path: String,

    #[serde(default, skip_serializing_if = "is_false")]
    pub recurse_mode: bool,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub global_name: String,

    #[serde(default, skip_serializing_if = "is_false")]
    pub deleted: bool,
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl Artifact {
    pub fn has_location(&self) -> bool {
        self.location.has_location()
    }

    /// Name of the artifact plugin serving this artifact, if any
    pub fn plugin_name(&self) -> Option<&str> {
        self.location.plugin.as_ref().map(|p| p.name.as_str())
    }

    /// Effective archive strategy; tar is the default
    pub fn archive_strategy(&self) -> ArchiveStrategy {
        match &self.archive {
            Some(strategy) if strategy.none.is_some() || strategy.zip.is_some() || strategy.tar.is_some() => {
                strategy.clone()
            }
            _ => ArchiveStrategy::tar_default(),
        }
    }
}

/// Storage kinds an artifact location can resolve to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocationKind {
    Git,
    Artifactory,
    Hdfs,
    Http,
    Raw,
    Volume,
    Plugin,
}

impl std::fmt::Display for LocationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LocationKind::Git => "git",
            LocationKind::Artifactory => "artifactory",
            LocationKind::Hdfs => "hdfs",
            LocationKind::Http => "http",
            LocationKind::Raw => "raw",
            LocationKind::Volume => "volume",
            LocationKind::Plugin => "plugin",
        };
        f.write_str(name)
    }
}

/// Where an artifact is stored. Exactly one field may be set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactLocation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_logs: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git: Option<GitArtifact>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifactory: Option<ArtifactoryArtifact>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hdfs: Option<HdfsArtifact>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpArtifact>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<RawArtifact>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<VolumeArtifact>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin: Option<PluginArtifact>,
}

impl ArtifactLocation {
    /// The single populated location kind; errors when more than one is set
    pub fn kind(&self) -> Result<Option<LocationKind>, String> {
        let mut kinds = Vec::new();
        if self.git.is_some() {
            kinds.push(LocationKind::Git);
        }
        if self.artifactory.is_some() {
            kinds.push(LocationKind::Artifactory);
        }
        if self.hdfs.is_some() {
            kinds.push(LocationKind::Hdfs);
        }
        if self.http.is_some() {
            kinds.push(LocationKind::Http);
        }
        if self.raw.is_some() {
            kinds.push(LocationKind::Raw);
        }
        if self.volume.is_some() {
            kinds.push(LocationKind::Volume);
        }
        if self.plugin.is_some() {
            kinds.push(LocationKind::Plugin);
        }
        match kinds.len() {
            0 => Ok(None),
            1 => Ok(Some(kinds[0])),
            _ => Err(format!(
                "artifact location has multiple kinds set: {}",
                kinds.iter().map(|k| k.to_string()).collect::<Vec<_>>().join(", ")
            )),
        }
    }

    pub fn has_location(&self) -> bool {
        match self.kind() {
            Ok(Some(LocationKind::Git)) => self.git.as_ref().is_some_and(|g| !g.repo.is_empty()),
            Ok(Some(LocationKind::Artifactory)) => {
                self.artifactory.as_ref().is_some_and(|a| !a.url.is_empty())
            }
            Ok(Some(LocationKind::Hdfs)) => self.hdfs.as_ref().is_some_and(|h| !h.addresses.is_empty()),
            Ok(Some(LocationKind::Http)) => self.http.as_ref().is_some_and(|h| !h.url.is_empty()),
            Ok(Some(LocationKind::Raw)) => true,
            Ok(Some(LocationKind::Volume)) => self.volume.as_ref().is_some_and(|v| !v.name.is_empty()),
            Ok(Some(LocationKind::Plugin)) => self.plugin.as_ref().is_some_and(|p| !p.name.is_empty()),
            _ => false,
        }
    }

    /// Object key inside the location, when the kind has one
    pub fn key(&self) -> Option<String> {
        if let Some(a) = &self.artifactory {
            return url_path(&a.url);
        }
        if let Some(h) = &self.http {
            return url_path(&h.url);
        }
        if let Some(h) = &self.hdfs {
            return Some(h.path.clone());
        }
        if let Some(v) = &self.volume {
            return Some(v.path.clone());
        }
        if let Some(p) = &self.plugin {
            return Some(p.key.clone());
        }
        None
    }

    /// Replace the object key; errors for kinds without keys
    pub fn set_key(&mut self, key: &str) -> Result<(), String> {
        if let Some(a) = &mut self.artifactory {
            a.url = replace_url_path(&a.url, key);
            return Ok(());
        }
        if let Some(h) = &mut self.http {
            h.url = replace_url_path(&h.url, key);
            return Ok(());
        }
        if let Some(h) = &mut self.hdfs {
            h.path = key.to_string();
            return Ok(());
        }
        if let Some(v) = &mut self.volume {
            v.path = key.to_string();
            return Ok(());
        }
        if let Some(p) = &mut self.plugin {
            p.key = key.to_string();
            return Ok(());
        }
        Err("key unsupported for this artifact location".to_string())
    }
}

fn url_path(raw: &str) -> Option<String> {
    let rest = raw.split_once("://").map(|(_, rest)| rest).unwrap_or(raw);
    let path = rest.find('/').map(|i| &rest[i..]).unwrap_or("/");
    Some(path.split(['?', '#']).next().unwrap_or("").to_string())
}

fn replace_url_path(raw: &str, key: &str) -> String {
    let (scheme, rest) = match raw.split_once("://") {
        Some((scheme, rest)) => (format!("{}://", scheme), rest),
        None => (String::new(), raw),
    };
    let host = rest.split('/').next().unwrap_or("");
    format!("{}{}/{}", scheme, host, key.trim_start_matches('/'))
}

/// Git repository checkout
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitArtifact {
    pub repo: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub revision: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depth: Option<u64>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fetch: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_secret: Option<SecretKeySelector>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_secret: Option<SecretKeySelector>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_private_key_secret: Option<SecretKeySelector>,

    #[serde(default, skip_serializing_if = "is_false")]
    pub insecure_ignore_host_key: bool,

    #[serde(default, skip_serializing_if = "is_false")]
    pub disable_submodules: bool,

    #[serde(default, skip_serializing_if = "is_false")]
    pub single_branch: bool,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub branch: String,
}

/// Artifactory URL with basic-auth credentials
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactoryArtifact {
    pub url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_secret: Option<SecretKeySelector>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_secret: Option<SecretKeySelector>,
}

/// HDFS file or directory
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HdfsArtifact {
    #[serde(default)]
    pub addresses: Vec<String>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hdfs_user: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub krb_c_cache_secret: Option<SecretKeySelector>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub krb_keytab_secret: Option<SecretKeySelector>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub krb_username: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub krb_realm: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub krb_config_config_map: Option<ConfigMapKeySelector>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub krb_service_principal_name: String,

    pub path: String,

    #[serde(default, skip_serializing_if = "is_false")]
    pub force: bool,
}

/// Plain HTTP(S) location
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpArtifact {
    pub url: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<Header>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<HttpAuth>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Header {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpAuth {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub basic_auth: Option<BasicAuth>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BasicAuth {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_secret: Option<SecretKeySelector>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_secret: Option<SecretKeySelector>,
}

/// Inline artifact content
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawArtifact {
    pub data: String,
}

/// File on a volume mounted at `/mnt/<name>`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeArtifact {
    pub name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
}

/// Artifact served by a plugin over gRPC
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginArtifact {
    pub name: String,

    /// Opaque configuration passed through to the plugin
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub configuration: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_timeout_seconds: Option<i32>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub key: String,
}

/// How an output artifact is packed before upload
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveStrategy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tar: Option<TarStrategy>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub none: Option<NoneStrategy>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zip: Option<ZipStrategy>,
}

impl ArchiveStrategy {
    pub fn tar_default() -> Self {
        Self {
            tar: Some(TarStrategy::default()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TarStrategy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression_level: Option<i32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NoneStrategy {}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ZipStrategy {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_location_kind_rejects_multiple() {
        let location = ArtifactLocation {
            git: Some(GitArtifact {
                repo: "https://github.com/argoproj/argo-workflows".to_string(),
                ..Default::default()
            }),
            raw: Some(RawArtifact { data: "x".to_string() }),
            ..Default::default()
        };
        assert!(location.kind().is_err());
        assert!(!location.has_location());
    }

    #[test]
    fn test_flattened_location_deserializes() {
        let artifact: Artifact = serde_json::from_str(
            r#"{"name":"src","path":"/src","git":{"repo":"https://example.com/repo.git","depth":1}}"#,
        )
        .unwrap();
        assert_eq!(artifact.location.kind().unwrap(), Some(LocationKind::Git));
        assert_eq!(artifact.location.git.unwrap().depth, Some(1));
    }

    #[test]
    fn test_http_key() {
        let mut location = ArtifactLocation {
            http: Some(HttpArtifact {
                url: "https://example.com/a/b.tgz?x=1".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(location.key().as_deref(), Some("/a/b.tgz"));
        location.set_key("c/d.tgz").unwrap();
        assert_eq!(location.http.unwrap().url, "https://example.com/c/d.tgz");
    }

    #[test]
    fn test_default_archive_is_tar() {
        let artifact = Artifact::default();
        assert!(artifact.archive_strategy().tar.is_some());
    }
}
