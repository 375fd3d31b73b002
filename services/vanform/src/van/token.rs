//! Token Model
//!
//! A token pairs a `Link` (connection descriptor) with the `Secret`
//! holding its TLS credentials. It grants `target_zone` the ability to
//! connect into `site_zone` of the site named `site_name`.
//!
//! Published tokens are a two-document YAML payload: the secret first,
//! then the link.

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{CustomResource, Resource};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{Result, VanFormError};

/// Marks resources created and managed by VAN Form
pub const LABEL_AUTO_VAN: &str = "skupper.io/auto-van";
pub const LABEL_SITE_NAME: &str = "skupper.io/site-name";
pub const LABEL_SITE_ZONE: &str = "skupper.io/site-zone";
pub const LABEL_TARGET_ZONE: &str = "skupper.io/target-zone";

/// Document boundary used between the secret and the link
const DOCUMENT_SEPARATOR: &str = "---\n";

/// Connection descriptor for a remote site
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[kube(
    group = "skupper.io",
    version = "v2alpha1",
    kind = "Link",
    namespaced,
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct LinkSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub endpoints: Vec<Endpoint>,
    /// Name of the secret holding the credential bundle
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tls_credentials: String,
    #[serde(default)]
    pub cost: i32,
}

/// A named endpoint exposed by a site
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub host: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub port: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub group: String,
}

/// Name of the link generated for `zone` on `site` for an endpoint group
pub fn link_name_for(zone: &str, site: &str, group: &str) -> String {
    if group.is_empty() {
        format!("{}-{}", zone, site)
    } else {
        format!("{}-{}-{}", zone, site, group)
    }
}

/// The exchange unit between sites
#[derive(Debug, Clone)]
pub struct Token {
    pub site_name: String,
    pub site_zone: String,
    pub target_zone: String,
    pub link: Link,
    pub secret: Secret,
}

impl Token {
    pub fn new(
        site_name: impl Into<String>,
        site_zone: impl Into<String>,
        target_zone: impl Into<String>,
        link: Link,
        secret: Secret,
    ) -> Self {
        Self {
            site_name: site_name.into(),
            site_zone: site_zone.into(),
            target_zone: target_zone.into(),
            link,
            secret,
        }
    }

    /// Rebuild a token from local resources using their provenance labels
    pub fn from_resources(link: Link, secret: Secret) -> Self {
        let label = |key: &str| {
            link.metadata
                .labels
                .as_ref()
                .and_then(|labels| labels.get(key))
                .cloned()
                .unwrap_or_default()
        };
        Self {
            site_name: label(LABEL_SITE_NAME),
            site_zone: label(LABEL_SITE_ZONE),
            target_zone: label(LABEL_TARGET_ZONE),
            link,
            secret,
        }
    }

    pub fn link_name(&self) -> &str {
        self.link.metadata.name.as_deref().unwrap_or_default()
    }

    pub fn secret_name(&self) -> &str {
        self.secret.metadata.name.as_deref().unwrap_or_default()
    }

    /// Secret referenced by the link, falling back to the link name
    pub fn credentials_name(&self) -> &str {
        if self.link.spec.tls_credentials.is_empty() {
            self.link_name()
        } else {
            &self.link.spec.tls_credentials
        }
    }

    /// Whether a resource carries the label marking it as VAN Form managed
    pub fn is_managed(meta: &ObjectMeta) -> bool {
        meta.labels
            .as_ref()
            .is_some_and(|labels| labels.contains_key(LABEL_AUTO_VAN))
    }

    /// Stamp provenance labels and strip transient system metadata so that
    /// serialization is deterministic.
    pub fn prepare(&mut self) {
        let labels = self.provenance_labels();
        for meta in [&mut self.link.metadata, &mut self.secret.metadata] {
            meta.labels
                .get_or_insert_with(BTreeMap::new)
                .extend(labels.clone());
            meta.managed_fields = None;
            meta.owner_references = None;
            meta.resource_version = None;
            meta.uid = None;
        }
    }

    fn provenance_labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (LABEL_AUTO_VAN.to_string(), "true".to_string()),
            (LABEL_SITE_NAME.to_string(), self.site_name.clone()),
            (LABEL_SITE_ZONE.to_string(), self.site_zone.clone()),
            (LABEL_TARGET_ZONE.to_string(), self.target_zone.clone()),
        ])
    }

    /// Serialize as a two-document YAML payload (secret, then link)
    pub fn marshal(&self) -> Result<String> {
        let secret = serde_yaml::to_string(&self.secret)
            .map_err(|e| VanFormError::Decode(format!("error encoding secret: {}", e)))?;
        let link = serde_yaml::to_string(&self.link)
            .map_err(|e| VanFormError::Decode(format!("error encoding link: {}", e)))?;

        let mut out = String::with_capacity(secret.len() + link.len() + 8);
        out.push_str(DOCUMENT_SEPARATOR);
        out.push_str(&secret);
        out.push_str(DOCUMENT_SEPARATOR);
        out.push_str(&link);
        Ok(out)
    }

    /// Decode a payload produced by [`Token::marshal`].
    ///
    /// Both documents must be present and the link must reference the
    /// secret by name. Site identity comes from the link's labels.
    pub fn unmarshal(data: &str) -> Result<Self> {
        let mut link = None;
        let mut secret = None;

        for document in serde_yaml::Deserializer::from_str(data) {
            let value = serde_yaml::Value::deserialize(document)?;
            if value.is_null() {
                continue;
            }
            match TokenDocument::decode(value)? {
                TokenDocument::Secret(s) => secret = Some(*s),
                TokenDocument::Link(l) => link = Some(*l),
            }
        }

        let link = link.ok_or_else(|| VanFormError::Decode("token has no Link".to_string()))?;
        let secret =
            secret.ok_or_else(|| VanFormError::Decode("token has no Secret".to_string()))?;

        let token = Token::from_resources(link, secret);
        if token.credentials_name() != token.secret_name() {
            return Err(VanFormError::Decode(format!(
                "link {} references secret {} but token carries {}",
                token.link_name(),
                token.credentials_name(),
                token.secret_name()
            )));
        }
        Ok(token)
    }
}

/// Equality covers identity, the link's functional fields and the
/// credential payload. Labels and system metadata are ignored.
impl PartialEq for Token {
    fn eq(&self, other: &Self) -> bool {
        self.site_name == other.site_name
            && self.site_zone == other.site_zone
            && self.target_zone == other.target_zone
            && self.link.spec == other.link.spec
            && self.secret.data == other.secret.data
    }
}

/// Document kinds accepted inside a token payload
enum TokenDocument {
    Secret(Box<Secret>),
    Link(Box<Link>),
}

#[derive(Deserialize)]
struct DocumentHeader {
    #[serde(rename = "apiVersion", default)]
    api_version: String,
    #[serde(default)]
    kind: String,
}

impl TokenDocument {
    fn decode(value: serde_yaml::Value) -> Result<Self> {
        let header: DocumentHeader = serde_yaml::from_value(value.clone())?;
        let secret_api = <Secret as k8s_openapi::Resource>::API_VERSION;
        let secret_kind = <Secret as k8s_openapi::Resource>::KIND;

        if header.api_version == secret_api && header.kind == secret_kind {
            return Ok(TokenDocument::Secret(Box::new(serde_yaml::from_value(value)?)));
        }
        if header.api_version == Link::api_version(&()) && header.kind == Link::kind(&()) {
            return Ok(TokenDocument::Link(Box::new(serde_yaml::from_value(value)?)));
        }
        Err(VanFormError::Decode(format!(
            "unexpected document kind {:?} ({:?})",
            header.kind, header.api_version
        )))
    }
}
