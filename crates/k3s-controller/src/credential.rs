//! The certificate authority backed credential chain for each cluster.
//!
//! Every `K3s` gets one long-lived CA, persisted in `<name>-kubeconfig` the
//! first time it is needed and reused forever after, and an admin client
//! certificate signed by that CA, kept in `<name>-kubeconfig-client`. The two
//! are packaged into a kubeconfig stored next to the CA.
//!
//! CA creation is create-if-absent: when two reconciliations race, the loser
//! discards what it generated and re-reads the stored CA.
use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::ResourceExt;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, PKCS_ECDSA_P256_SHA256,
};
use tracing::{debug, info};

use crate::api::{K3s, API_PORT};
use crate::error::{Error, Result};
use crate::kubeconfig;
use crate::secret::{data_bytes, data_string, Created, SecretStore};

/// Key holding a PEM certificate.
pub const TLS_CERT_KEY: &str = "tls.crt";
/// Key holding a PEM private key.
pub const TLS_KEY_KEY: &str = "tls.key";
/// Key holding the issuing CA on the client secret.
pub const CA_CERT_KEY: &str = "ca.crt";
/// Key holding the kubeconfig on the CA secret.
pub const KUBECONFIG_KEY: &str = "value";

const SECRET_TYPE: &str = "kubernetes.io/tls";
const CA_VALIDITY_DAYS: i64 = 3650;
const CLIENT_VALIDITY_DAYS: i64 = 365;
/// Client certificates closer than this to expiry are reissued.
const CLIENT_RENEW_BEFORE_DAYS: i64 = 30;
const ADMIN_USER: &str = "system:admin";
const ADMIN_GROUP: &str = "system:masters";

/// Name and namespace of a cluster; everything credential related is keyed on it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    pub name: String,
    pub namespace: String,
}

impl Identity {
    pub fn new(name: &str, namespace: &str) -> Self {
        Identity {
            name: name.to_string(),
            namespace: namespace.to_string(),
        }
    }

    /// Identity of a `K3s` resource. Fails if the resource has no namespace.
    pub fn of(k3s: &K3s) -> Result<Self> {
        let namespace = k3s
            .namespace()
            .ok_or(Error::MissingMetadata("namespace"))?;
        Ok(Identity {
            name: k3s.name(),
            namespace,
        })
    }

    pub fn ca_secret_name(&self) -> String {
        format!("{}-kubeconfig", self.name)
    }

    pub fn client_secret_name(&self) -> String {
        format!("{}-kubeconfig-client", self.name)
    }

    /// In-cluster address of the cluster's API server.
    pub fn server_url(&self) -> String {
        format!("https://{}.{}:{}", self.name, self.namespace, API_PORT)
    }
}

/// A PEM encoded certificate and its private key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PemPair {
    pub cert: String,
    pub key: String,
}

/// CA and admin client material for one cluster, plus the kubeconfig tying
/// them together.
#[derive(Debug, Clone, PartialEq)]
pub struct CredentialBundle {
    pub identity: Identity,
    pub ca: PemPair,
    pub client: PemPair,
    pub kubeconfig: Vec<u8>,
}

impl CredentialBundle {
    /// Secret holding the CA pair and the kubeconfig.
    pub fn ca_secret(&self) -> Secret {
        let mut data = pem_data(&self.ca);
        data.insert(
            KUBECONFIG_KEY.to_string(),
            ByteString(self.kubeconfig.clone()),
        );
        tls_secret(&self.identity, self.identity.ca_secret_name(), data)
    }

    /// Secret holding the client pair and the CA that issued it.
    pub fn client_secret(&self) -> Secret {
        client_secret(&self.identity, &self.client, &self.ca.cert)
    }
}

/// Something that can hand out a credential bundle for a cluster identity.
#[async_trait::async_trait]
pub trait CredentialSource: Send + Sync {
    /// Loads the bundle for `identity`, creating the CA on first use.
    async fn load_or_create(&self, identity: &Identity) -> Result<CredentialBundle>;
}

/// [`CredentialSource`] persisting its CA through a [`SecretStore`].
///
/// No retries happen here; failures go back to the reconciler.
#[derive(Clone)]
pub struct CredentialManager {
    store: Arc<dyn SecretStore>,
}

impl CredentialManager {
    pub fn new(store: Arc<dyn SecretStore>) -> Self {
        CredentialManager { store }
    }

    async fn load_or_create_ca(&self, identity: &Identity) -> Result<PemPair> {
        let name = identity.ca_secret_name();
        if let Some(secret) = self.store.get(&identity.namespace, &name).await? {
            return read_pair(&secret);
        }

        debug!(name = %name, namespace = %identity.namespace, "Generating certificate authority");
        let generated = generate_ca(identity)?;
        let secret = tls_secret(identity, name.clone(), pem_data(&generated));
        match self.store.create(&secret).await? {
            Created::Created => {
                info!(name = %name, namespace = %identity.namespace, "Created certificate authority");
                Ok(generated)
            }
            Created::AlreadyExists => {
                debug!(name = %name, namespace = %identity.namespace, "Lost CA creation race, re-reading");
                let secret = self
                    .store
                    .get(&identity.namespace, &name)
                    .await?
                    .ok_or_else(|| Error::InvalidSecret {
                        namespace: identity.namespace.clone(),
                        name: name.clone(),
                        reason: "reported as existing but could not be read".to_string(),
                    })?;
                read_pair(&secret)
            }
        }
    }

    async fn load_or_issue_client(&self, identity: &Identity, ca: &PemPair) -> Result<PemPair> {
        let name = identity.client_secret_name();
        if let Some(secret) = self.store.get(&identity.namespace, &name).await? {
            if let Some(pair) = issued_by(&secret, ca)? {
                return Ok(pair);
            }
            // Stale or expiring client. The fresh one reaches storage through
            // the apply of the child set.
            debug!(name = %name, namespace = %identity.namespace, "Client certificate is from another CA or expiring, reissuing");
            return issue_client(ca);
        }

        let issued = issue_client(ca)?;
        match self
            .store
            .create(&client_secret(identity, &issued, &ca.cert))
            .await?
        {
            Created::Created => Ok(issued),
            Created::AlreadyExists => match self.store.get(&identity.namespace, &name).await? {
                Some(secret) => Ok(issued_by(&secret, ca)?.unwrap_or(issued)),
                None => Ok(issued),
            },
        }
    }
}

#[async_trait::async_trait]
impl CredentialSource for CredentialManager {
    async fn load_or_create(&self, identity: &Identity) -> Result<CredentialBundle> {
        let ca = self.load_or_create_ca(identity).await?;
        let client = self.load_or_issue_client(identity, &ca).await?;
        let kubeconfig =
            kubeconfig::render(&identity.server_url(), &ca.cert, &client.cert, &client.key)?;
        Ok(CredentialBundle {
            identity: identity.clone(),
            ca,
            client,
            kubeconfig,
        })
    }
}

fn read_pair(secret: &Secret) -> Result<PemPair> {
    Ok(PemPair {
        cert: data_string(secret, TLS_CERT_KEY)?,
        key: data_string(secret, TLS_KEY_KEY)?,
    })
}

/// The stored client pair, if it was recorded as issued by `ca` and is not
/// about to expire.
fn issued_by(secret: &Secret, ca: &PemPair) -> Result<Option<PemPair>> {
    match data_bytes(secret, CA_CERT_KEY) {
        Some(issuer) if issuer == ca.cert.as_bytes() => {
            let pair = read_pair(secret)?;
            let renew_at = Utc::now() + Duration::days(CLIENT_RENEW_BEFORE_DAYS);
            match not_after(&pair.cert) {
                Some(expiry) if expiry > renew_at => Ok(Some(pair)),
                _ => Ok(None),
            }
        }
        _ => Ok(None),
    }
}

/// Expiry of a PEM certificate; `None` if it cannot be parsed.
fn not_after(cert: &str) -> Option<DateTime<Utc>> {
    let (_, pem) = x509_parser::pem::parse_x509_pem(cert.as_bytes()).ok()?;
    let parsed = pem.parse_x509().ok()?;
    Utc.timestamp_opt(parsed.validity().not_after.timestamp(), 0)
        .single()
}

fn pem_data(pair: &PemPair) -> BTreeMap<String, ByteString> {
    let mut data = BTreeMap::new();
    data.insert(
        TLS_CERT_KEY.to_string(),
        ByteString(pair.cert.as_bytes().to_vec()),
    );
    data.insert(
        TLS_KEY_KEY.to_string(),
        ByteString(pair.key.as_bytes().to_vec()),
    );
    data
}

fn client_secret(identity: &Identity, client: &PemPair, ca_cert: &str) -> Secret {
    let mut data = pem_data(client);
    data.insert(
        CA_CERT_KEY.to_string(),
        ByteString(ca_cert.as_bytes().to_vec()),
    );
    tls_secret(identity, identity.client_secret_name(), data)
}

fn tls_secret(identity: &Identity, name: String, data: BTreeMap<String, ByteString>) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(identity.namespace.clone()),
            ..Default::default()
        },
        data: Some(data),
        type_: Some(SECRET_TYPE.to_string()),
        ..Default::default()
    }
}

fn generate_ca(identity: &Identity) -> Result<PemPair> {
    let mut params = CertificateParams::default();
    params.not_before = Utc::now();
    params.not_after = Utc::now() + Duration::days(CA_VALIDITY_DAYS);
    let mut distinguished_name = DistinguishedName::new();
    distinguished_name.push(DnType::OrganizationName, "k3s");
    distinguished_name.push(
        DnType::CommonName,
        &format!("k3s-client-ca@{}.{}", identity.namespace, identity.name),
    );
    params.distinguished_name = distinguished_name;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params
        .key_pair
        .replace(KeyPair::generate(&PKCS_ECDSA_P256_SHA256)?);
    params.alg = &PKCS_ECDSA_P256_SHA256;

    let cert = Certificate::from_params(params)?;
    Ok(PemPair {
        cert: cert.serialize_pem()?,
        key: cert.serialize_private_key_pem(),
    })
}

fn issue_client(ca: &PemPair) -> Result<PemPair> {
    issue_client_until(ca, Utc::now() + Duration::days(CLIENT_VALIDITY_DAYS))
}

fn issue_client_until(ca: &PemPair, expiry: DateTime<Utc>) -> Result<PemPair> {
    let ca_key = KeyPair::from_pem(&ca.key)?;
    let issuer = Certificate::from_params(CertificateParams::from_ca_cert_pem(&ca.cert, ca_key)?)?;

    let mut params = CertificateParams::default();
    params.not_before = expiry - Duration::days(CLIENT_VALIDITY_DAYS);
    params.not_after = expiry;
    let mut distinguished_name = DistinguishedName::new();
    distinguished_name.push(DnType::OrganizationName, ADMIN_GROUP);
    distinguished_name.push(DnType::CommonName, ADMIN_USER);
    params.distinguished_name = distinguished_name;
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
    params
        .key_pair
        .replace(KeyPair::generate(&PKCS_ECDSA_P256_SHA256)?);
    params.alg = &PKCS_ECDSA_P256_SHA256;

    let cert = Certificate::from_params(params)?;
    Ok(PemPair {
        cert: cert.serialize_pem_with_signer(&issuer)?,
        key: cert.serialize_private_key_pem(),
    })
}
