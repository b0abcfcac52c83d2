use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::BufReader;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::WebPkiClientVerifier;
use rustls::{DigitallySignedStruct, DistinguishedName, RootCertStore, SignatureScheme};

use crate::protocol::VERIFY_DEPTH;

pub fn config_dir() -> PathBuf {
    #[cfg(windows)]
    {
        if let Ok(appdata) = std::env::var("APPDATA") { return PathBuf::from(appdata).join("Blindkey"); }
    }
    // Unix-like default
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".config").join("blindkey");
    }
    PathBuf::from(".blindkey")
}

/// Trusted root plus this peer's own certificate and key
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TlsPaths {
    pub ca_cert: PathBuf,
    pub cert: PathBuf,
    pub key: PathBuf,
}

impl TlsPaths {
    pub fn default_server() -> Self {
        let dir = config_dir();
        Self { ca_cert: dir.join("ca-cert.pem"), cert: dir.join("server-cert.pem"), key: dir.join("server-key.pem") }
    }

    pub fn default_client() -> Self {
        let dir = config_dir();
        Self { ca_cert: dir.join("ca-cert.pem"), cert: dir.join("client-cert.pem"), key: dir.join("client-key.pem") }
    }
}

pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let mut rd = BufReader::new(
        fs::File::open(path).with_context(|| format!("open cert {}", path.display()))?,
    );
    let mut out = Vec::new();
    for c in rustls_pemfile::certs(&mut rd) {
        out.push(c.with_context(|| format!("read cert {}", path.display()))?);
    }
    if out.is_empty() {
        return Err(anyhow!("no certificates found in {}", path.display()));
    }
    Ok(out)
}

pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let mut rd = BufReader::new(
        fs::File::open(path).with_context(|| format!("open key {}", path.display()))?,
    );
    rustls_pemfile::private_key(&mut rd)
        .with_context(|| format!("read key {}", path.display()))?
        .ok_or_else(|| anyhow!("no private key found in {}", path.display()))
}

pub fn load_root_store(path: &Path) -> Result<Arc<RootCertStore>> {
    root_store(&load_certs(path)?)
}

fn root_store(anchors: &[CertificateDer<'static>]) -> Result<Arc<RootCertStore>> {
    let mut roots = RootCertStore::empty();
    for cert in anchors {
        roots.add(cert.clone()).context("add trusted root")?;
    }
    Ok(Arc::new(roots))
}

/// Server side: client certificate required and verified against the root
pub fn build_server_config(paths: &TlsPaths) -> Result<rustls::ServerConfig> {
    let verifier = DepthLimitedClientVerifier::new(load_certs(&paths.ca_cert)?)?;

    let certs = load_certs(&paths.cert)?;
    let key = load_private_key(&paths.key)?;
    let cfg = rustls::ServerConfig::builder()
        .with_client_cert_verifier(Arc::new(verifier))
        .with_single_cert(certs, key)
        .context("build server tls config")?;
    Ok(cfg)
}

/// Client side: present our certificate, verify the server against the root
pub fn build_client_config(paths: &TlsPaths) -> Result<rustls::ClientConfig> {
    let verifier = DepthLimitedServerVerifier::new(load_certs(&paths.ca_cert)?)?;

    let certs = load_certs(&paths.cert)?;
    let key = load_private_key(&paths.key)?;
    let cfg = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_client_auth_cert(certs, key)
        .context("build client tls config")?;
    Ok(cfg)
}

/// Issuer certificates the peer sent, minus copies of a trusted root.
/// PEM bundles often carry the root next to the leaf; that costs no depth.
fn chain_issuers<'a>(
    intermediates: &[CertificateDer<'a>],
    anchors: &[CertificateDer<'static>],
) -> Vec<CertificateDer<'a>> {
    intermediates
        .iter()
        .filter(|c| !anchors.iter().any(|a| a.as_ref() == c.as_ref()))
        .cloned()
        .collect()
}

fn check_depth(issuers: &[CertificateDer<'_>]) -> std::result::Result<(), rustls::Error> {
    // depth counts CA certificates between the leaf and the trust anchor
    if issuers.len() > VERIFY_DEPTH {
        return Err(rustls::Error::General(format!(
            "certificate chain too deep: {} intermediates (verify depth {})",
            issuers.len(),
            VERIFY_DEPTH
        )));
    }
    Ok(())
}

#[derive(Debug)]
struct DepthLimitedClientVerifier {
    inner: Arc<dyn ClientCertVerifier>,
    anchors: Vec<CertificateDer<'static>>,
}

impl DepthLimitedClientVerifier {
    fn new(anchors: Vec<CertificateDer<'static>>) -> Result<Self> {
        let inner = WebPkiClientVerifier::builder(root_store(&anchors)?)
            .build()
            .context("build client certificate verifier")?;
        Ok(Self { inner, anchors })
    }
}

impl ClientCertVerifier for DepthLimitedClientVerifier {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        true
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        self.inner.root_hint_subjects()
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> std::result::Result<ClientCertVerified, rustls::Error> {
        let issuers = chain_issuers(intermediates, &self.anchors);
        check_depth(&issuers)?;
        self.inner.verify_client_cert(end_entity, &issuers, now)
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

#[derive(Debug)]
struct DepthLimitedServerVerifier {
    inner: Arc<WebPkiServerVerifier>,
    anchors: Vec<CertificateDer<'static>>,
}

impl DepthLimitedServerVerifier {
    fn new(anchors: Vec<CertificateDer<'static>>) -> Result<Self> {
        let inner = WebPkiServerVerifier::builder(root_store(&anchors)?)
            .build()
            .context("build server certificate verifier")?;
        Ok(Self { inner, anchors })
    }
}

impl ServerCertVerifier for DepthLimitedServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        let issuers = chain_issuers(intermediates, &self.anchors);
        check_depth(&issuers)?;
        self.inner.verify_server_cert(end_entity, &issuers, server_name, ocsp, now)
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

pub fn server_name_for(host: &str) -> Result<ServerName<'static>> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ServerName::IpAddress(ip.into()));
    }
    ServerName::try_from(host.to_string()).map_err(|e| anyhow!("invalid server name {host:?}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{
        BasicConstraints, Certificate, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa,
    };

    #[test]
    fn test_server_name_for_ip_and_dns() {
        assert!(matches!(server_name_for("127.0.0.1").unwrap(), ServerName::IpAddress(_)));
        assert!(matches!(server_name_for("::1").unwrap(), ServerName::IpAddress(_)));
        assert!(matches!(server_name_for("oracle.local").unwrap(), ServerName::DnsName(_)));
        assert!(server_name_for("not a hostname!").is_err());
    }

    #[test]
    fn test_depth_allows_one_intermediate() {
        let fake = |b: u8| CertificateDer::from(vec![b; 4]);
        assert!(check_depth(&[]).is_ok());
        assert!(check_depth(&[fake(1)]).is_ok());
        assert!(check_depth(&[fake(1), fake(2)]).is_err());
        // a bundled copy of the trust anchor is not an intermediate
        let issuers = chain_issuers(&[fake(9), fake(1)], &[fake(9)]);
        assert_eq!(issuers, vec![fake(1)]);
    }

    fn ca(name: &str) -> Certificate {
        let mut params = CertificateParams::new(Vec::<String>::new());
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.distinguished_name.push(DnType::CommonName, name);
        Certificate::from_params(params).unwrap()
    }

    fn leaf(name: &str, purpose: ExtendedKeyUsagePurpose) -> Certificate {
        let mut params = CertificateParams::new(vec!["localhost".to_string()]);
        params.distinguished_name.push(DnType::CommonName, name);
        params.extended_key_usages = vec![purpose];
        Certificate::from_params(params).unwrap()
    }

    fn der(bytes: Vec<u8>) -> CertificateDer<'static> {
        CertificateDer::from(bytes)
    }

    struct Chains {
        root: CertificateDer<'static>,
        direct: CertificateDer<'static>,
        via_inter: CertificateDer<'static>,
        inter: CertificateDer<'static>,
        via_two: CertificateDer<'static>,
        inter2: CertificateDer<'static>,
    }

    fn chains(purpose: ExtendedKeyUsagePurpose) -> Chains {
        let root = ca("depth root");
        let inter = ca("depth intermediate");
        let inter2 = ca("depth second intermediate");
        Chains {
            root: der(root.serialize_der().unwrap()),
            direct: der(leaf("direct", purpose.clone()).serialize_der_with_signer(&root).unwrap()),
            via_inter: der(leaf("one hop", purpose.clone()).serialize_der_with_signer(&inter).unwrap()),
            inter: der(inter.serialize_der_with_signer(&root).unwrap()),
            via_two: der(leaf("two hops", purpose).serialize_der_with_signer(&inter2).unwrap()),
            inter2: der(inter2.serialize_der_with_signer(&inter).unwrap()),
        }
    }

    #[test]
    fn test_client_verifier_depth_one() {
        let c = chains(ExtendedKeyUsagePurpose::ClientAuth);
        let v = DepthLimitedClientVerifier::new(vec![c.root.clone()]).unwrap();
        let now = UnixTime::now();

        assert!(v.verify_client_cert(&c.direct, &[], now).is_ok());
        assert!(v.verify_client_cert(&c.direct, &[c.root.clone()], now).is_ok());
        assert!(v.verify_client_cert(&c.via_inter, &[c.inter.clone()], now).is_ok());
        assert!(v
            .verify_client_cert(&c.via_inter, &[c.inter.clone(), c.root.clone()], now)
            .is_ok());
        assert!(v
            .verify_client_cert(&c.via_two, &[c.inter2.clone(), c.inter.clone()], now)
            .is_err());
        // missing issuer
        assert!(v.verify_client_cert(&c.via_inter, &[], now).is_err());
    }

    #[test]
    fn test_server_verifier_depth_one() {
        let c = chains(ExtendedKeyUsagePurpose::ServerAuth);
        let v = DepthLimitedServerVerifier::new(vec![c.root.clone()]).unwrap();
        let name = server_name_for("localhost").unwrap();
        let now = UnixTime::now();

        assert!(v.verify_server_cert(&c.direct, &[c.root.clone()], &name, &[], now).is_ok());
        assert!(v.verify_server_cert(&c.via_inter, &[c.inter.clone()], &name, &[], now).is_ok());
        assert!(v
            .verify_server_cert(&c.via_two, &[c.inter2.clone(), c.inter.clone()], &name, &[], now)
            .is_err());
    }

    #[test]
    fn test_untrusted_root_is_rejected_even_when_bundled() {
        let c = chains(ExtendedKeyUsagePurpose::ClientAuth);
        let other = ca("unrelated root");
        let v = DepthLimitedClientVerifier::new(vec![der(other.serialize_der().unwrap())]).unwrap();
        assert!(v.verify_client_cert(&c.direct, &[c.root.clone()], UnixTime::now()).is_err());
    }

    #[test]
    fn test_load_certs_missing_and_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_certs(&dir.path().join("nope.pem")).is_err());

        let empty = dir.path().join("empty.pem");
        fs::write(&empty, "").unwrap();
        assert!(load_certs(&empty).is_err());
        assert!(load_private_key(&empty).is_err());
    }

    #[test]
    fn test_default_paths_share_root() {
        let s = TlsPaths::default_server();
        let c = TlsPaths::default_client();
        assert_eq!(s.ca_cert, c.ca_cert);
        assert_ne!(s.cert, c.cert);
    }
}
