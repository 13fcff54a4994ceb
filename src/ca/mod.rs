//! Certificate authority for TLS interception
//!
//! A root CA is generated on first use and persisted as PEM in the data
//! directory so that, once trusted by the operating system or browser, it stays
//! trusted across runs. Per-host leaf certificates are minted on demand, signed
//! by the root and cached in memory for the lifetime of the process.

use crate::error::{CaError, ExportError};
use crate::tls::{crypto_provider, HTTP1_ALPN};
use dashmap::DashMap;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tokio::fs;
use tokio::sync::OnceCell;
use x509_parser::parse_x509_certificate;

const CA_CERT_FILE: &str = "ca.pem";
const CA_KEY_FILE: &str = "ca-key.pem";

const ROOT_VALIDITY_DAYS: i64 = 3650;
const LEAF_VALIDITY_DAYS: i64 = 365;
/// Backdating applied to `not_before` to tolerate client clock skew
const NOT_BEFORE_SKEW: Duration = Duration::seconds(60);
/// Certificates this close to expiry are treated as expired
const RENEW_MARGIN: Duration = Duration::seconds(60);

/// The self-signed root, as persisted on disk
pub struct RootCertificate {
    cert_pem: String,
    cert_der: CertificateDer<'static>,
    not_after: OffsetDateTime,
}

impl RootCertificate {
    pub fn pem(&self) -> &str {
        &self.cert_pem
    }

    pub fn der(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }

    pub fn not_after(&self) -> OffsetDateTime {
        self.not_after
    }
}

/// A per-host certificate signed by the root, with a ready server config
pub struct LeafCertificate {
    hostname: String,
    cert_der: CertificateDer<'static>,
    not_after: OffsetDateTime,
    server_config: Arc<ServerConfig>,
}

impl LeafCertificate {
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn cert_der(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }

    pub fn not_after(&self) -> OffsetDateTime {
        self.not_after
    }

    /// Server config presenting `[leaf, root]` and offering HTTP/1.1 only.
    pub fn server_config(&self) -> Arc<ServerConfig> {
        self.server_config.clone()
    }

    fn is_fresh(&self) -> bool {
        self.not_after > OffsetDateTime::now_utc() + RENEW_MARGIN
    }
}

impl std::fmt::Debug for LeafCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeafCertificate")
            .field("hostname", &self.hostname)
            .field("not_after", &self.not_after)
            .finish_non_exhaustive()
    }
}

/// One slot per hostname so concurrent first requests mint a single certificate.
type LeafSlot = Arc<OnceCell<Arc<LeafCertificate>>>;

pub struct CertificateAuthority {
    root: RootCertificate,
    issuer: Arc<Issuer<'static, KeyPair>>,
    cert_path: PathBuf,
    leaves: DashMap<String, LeafSlot>,
}

impl CertificateAuthority {
    /// Load the root CA from `data_dir`, or generate and persist a new one.
    ///
    /// A root that is missing or expired is replaced. A root that exists but
    /// cannot be parsed is an error, never silently overwritten.
    pub async fn initialize(data_dir: impl AsRef<Path>) -> Result<Self, CaError> {
        let data_dir = data_dir.as_ref();
        fs::create_dir_all(data_dir).await.map_err(|source| CaError::Io {
            path: data_dir.to_path_buf(),
            source,
        })?;

        let cert_path = data_dir.join(CA_CERT_FILE);
        let key_path = data_dir.join(CA_KEY_FILE);

        let loaded = if cert_path.exists() && key_path.exists() {
            Self::load_root(&cert_path, &key_path).await?
        } else {
            None
        };

        let (root, key_pair) = match loaded {
            Some(loaded) => {
                tracing::info!(path = %cert_path.display(), "Loaded existing root CA");
                loaded
            }
            None => {
                tracing::info!(path = %cert_path.display(), "Generating new root CA");
                Self::generate_root(&cert_path, &key_path).await?
            }
        };

        Self::assemble(root, key_pair, cert_path)
    }

    fn assemble(root: RootCertificate, key_pair: KeyPair, cert_path: PathBuf) -> Result<Self, CaError> {
        let issuer = Issuer::from_ca_cert_pem(&root.cert_pem, key_pair).map_err(|e| {
            CaError::Corrupt {
                path: cert_path.clone(),
                reason: e.to_string(),
            }
        })?;

        Ok(Self {
            root,
            issuer: Arc::new(issuer),
            cert_path,
            leaves: DashMap::new(),
        })
    }

    async fn load_root(
        cert_path: &Path,
        key_path: &Path,
    ) -> Result<Option<(RootCertificate, KeyPair)>, CaError> {
        let cert_pem = read_pem(cert_path).await?;
        let key_pem = read_pem(key_path).await?;

        let corrupt = |path: &Path, reason: String| CaError::Corrupt {
            path: path.to_path_buf(),
            reason,
        };

        let cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
            .next()
            .ok_or_else(|| corrupt(cert_path, "no certificate in PEM".into()))?
            .map_err(|e| corrupt(cert_path, e.to_string()))?;

        let not_after = {
            let (_, parsed) = parse_x509_certificate(cert_der.as_ref())
                .map_err(|e| corrupt(cert_path, e.to_string()))?;
            parsed.validity().not_after.to_datetime()
        };
        if not_after <= OffsetDateTime::now_utc() + RENEW_MARGIN {
            tracing::warn!(
                path = %cert_path.display(),
                %not_after,
                "Root CA has expired, generating a replacement"
            );
            return Ok(None);
        }

        let key_pair =
            KeyPair::from_pem(&key_pem).map_err(|e| corrupt(key_path, e.to_string()))?;

        let root = RootCertificate {
            cert_pem,
            cert_der,
            not_after,
        };
        Ok(Some((root, key_pair)))
    }

    async fn generate_root(
        cert_path: &Path,
        key_path: &Path,
    ) -> Result<(RootCertificate, KeyPair), CaError> {
        let now = OffsetDateTime::now_utc();
        let (root, key_pair) =
            self_signed_root(now - NOT_BEFORE_SKEW, now + Duration::days(ROOT_VALIDITY_DAYS))?;

        write_file(key_path, key_pair.serialize_pem().as_bytes()).await?;
        restrict_permissions(key_path).await?;
        write_file(cert_path, root.cert_pem.as_bytes()).await?;

        Ok((root, key_pair))
    }

    /// Return the cached leaf for `hostname`, minting one if needed.
    pub async fn issue_leaf(&self, hostname: &str) -> Result<Arc<LeafCertificate>, CaError> {
        let hostname = normalize_hostname(hostname)?;

        loop {
            // Leaves are capped at the root's expiry, so a dying root could only mint stale ones.
            if self.root.not_after <= OffsetDateTime::now_utc() + RENEW_MARGIN {
                return Err(CaError::RootExpiring {
                    not_after: self.root.not_after,
                });
            }

            let slot = self.leaves.entry(hostname.clone()).or_default().clone();
            let leaf = match slot.get_or_try_init(|| self.mint_leaf(&hostname)).await {
                Ok(leaf) => leaf.clone(),
                Err(e) => {
                    self.leaves.remove_if(&hostname, |_, current| {
                        Arc::ptr_eq(current, &slot) && !current.initialized()
                    });
                    return Err(e);
                }
            };

            if leaf.is_fresh() {
                return Ok(leaf);
            }

            // Only the caller that still sees the stale slot evicts it.
            self.leaves
                .remove_if(&hostname, |_, current| Arc::ptr_eq(current, &slot));
        }
    }

    /// Key generation and signing run on the blocking pool.
    async fn mint_leaf(&self, hostname: &str) -> Result<Arc<LeafCertificate>, CaError> {
        let issuer = self.issuer.clone();
        let root_der = self.root.cert_der.clone();
        let root_not_after = self.root.not_after;
        let hostname = hostname.to_string();

        tokio::task::spawn_blocking(move || mint(&issuer, root_der, root_not_after, hostname))
            .await?
    }

    /// Write the root certificate (never the key) as PEM to `path`.
    pub async fn export(&self, path: impl AsRef<Path>) -> Result<(), ExportError> {
        let path = path.as_ref();
        let write_err = |source| ExportError::Write {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await.map_err(write_err)?;
        }
        fs::write(path, self.root.cert_pem.as_bytes())
            .await
            .map_err(write_err)?;

        tracing::info!(path = %path.display(), "Exported root CA certificate");
        Ok(())
    }

    pub fn root(&self) -> &RootCertificate {
        &self.root
    }

    pub fn root_pem(&self) -> &str {
        self.root.pem()
    }

    pub fn root_der(&self) -> &CertificateDer<'static> {
        self.root.der()
    }

    pub fn not_after(&self) -> OffsetDateTime {
        self.root.not_after()
    }

    /// Path of the persisted root certificate
    pub fn cert_path(&self) -> &Path {
        &self.cert_path
    }

    /// Number of hostnames with a cached leaf slot
    pub fn cached_leaves(&self) -> usize {
        self.leaves.len()
    }
}

fn self_signed_root(
    not_before: OffsetDateTime,
    not_after: OffsetDateTime,
) -> Result<(RootCertificate, KeyPair), CaError> {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "termtap Capture Proxy CA");
    dn.push(DnType::OrganizationName, "termtap");
    params.distinguished_name = dn;

    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    params.not_before = not_before;
    params.not_after = not_after;

    let key_pair = KeyPair::generate()?;
    let cert = params.self_signed(&key_pair)?;

    let root = RootCertificate {
        cert_pem: cert.pem(),
        cert_der: CertificateDer::from(cert.der().to_vec()),
        not_after,
    };
    Ok((root, key_pair))
}

fn mint(
    issuer: &Issuer<'static, KeyPair>,
    root_der: CertificateDer<'static>,
    root_not_after: OffsetDateTime,
    hostname: String,
) -> Result<Arc<LeafCertificate>, CaError> {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, hostname.as_str());
    params.distinguished_name = dn;
    params.subject_alt_names = subject_alt_names(&hostname)?;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    params.use_authority_key_identifier_extension = true;

    let now = OffsetDateTime::now_utc();
    params.not_before = now - NOT_BEFORE_SKEW;
    params.not_after = std::cmp::min(now + Duration::days(LEAF_VALIDITY_DAYS), root_not_after);

    let key_pair = KeyPair::generate()?;
    let cert = params.signed_by(&key_pair, issuer)?;

    let cert_der = CertificateDer::from(cert.der().to_vec());
    let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));

    let mut server_config = ServerConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(vec![cert_der.clone(), root_der], key_der)?;
    server_config.alpn_protocols = vec![HTTP1_ALPN.to_vec()];

    tracing::debug!(%hostname, "Minted leaf certificate");

    Ok(Arc::new(LeafCertificate {
        hostname,
        cert_der,
        not_after: params.not_after,
        server_config: Arc::new(server_config),
    }))
}

fn normalize_hostname(hostname: &str) -> Result<String, CaError> {
    let host = hostname
        .trim()
        .trim_end_matches('.')
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_ascii_lowercase();
    if host.is_empty() {
        return Err(CaError::InvalidHostname(hostname.to_string()));
    }
    Ok(host)
}

/// IP literals get both an IP and a DNS SAN; some clients check one, some the other.
fn subject_alt_names(hostname: &str) -> Result<Vec<SanType>, CaError> {
    let dns_name = || {
        hostname
            .try_into()
            .map(SanType::DnsName)
            .map_err(|_| CaError::InvalidHostname(hostname.to_string()))
    };

    match hostname.parse::<IpAddr>() {
        Ok(ip) => {
            let mut sans = vec![SanType::IpAddress(ip)];
            if let Ok(san) = dns_name() {
                sans.push(san);
            }
            Ok(sans)
        }
        Err(_) => Ok(vec![dns_name()?]),
    }
}

async fn read_pem(path: &Path) -> Result<String, CaError> {
    fs::read_to_string(path).await.map_err(|source| CaError::Io {
        path: path.to_path_buf(),
        source,
    })
}

async fn write_file(path: &Path, contents: &[u8]) -> Result<(), CaError> {
    fs::write(path, contents).await.map_err(|source| CaError::Io {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(unix)]
async fn restrict_permissions(path: &Path) -> Result<(), CaError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .await
        .map_err(|source| CaError::Io {
            path: path.to_path_buf(),
            source,
        })
}

#[cfg(not(unix))]
async fn restrict_permissions(_path: &Path) -> Result<(), CaError> {
    Ok(())
}
