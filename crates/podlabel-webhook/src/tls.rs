use miette::{Context, IntoDiagnostic};
use rcgen::{BasicConstraints, CertificateParams, ExtendedKeyUsagePurpose, IsCa, KeyPair};
use std::path::{Path, PathBuf};
use tracing::info;

pub const CERT_FILE: &str = "tls.crt";
pub const KEY_FILE: &str = "tls.key";
pub const CA_FILE: &str = "ca.crt";

/// How the webhook listener gets its certificate
#[derive(Debug, Clone)]
pub enum TlsMode {
    /// Plain HTTP, for local testing only
    Disabled,
    /// Self-signed CA and serving certificate written to `cert_dir` and
    /// reused on restart
    AutoGenerate {
        cert_dir: PathBuf,
        san_entries: Vec<String>,
    },
    /// Mounted PEM certificate and key
    Provided {
        cert_path: PathBuf,
        key_path: PathBuf,
    },
}

impl TlsMode {
    /// `tls.crt`/`tls.key` inside a mounted certificate directory
    pub fn from_cert_dir(cert_dir: impl AsRef<Path>) -> Self {
        let cert_dir = cert_dir.as_ref();
        TlsMode::Provided {
            cert_path: cert_dir.join(CERT_FILE),
            key_path: cert_dir.join(KEY_FILE),
        }
    }

    /// Certificate and key paths backing this mode, if file-backed
    pub fn file_paths(&self) -> Option<(PathBuf, PathBuf)> {
        match self {
            TlsMode::Disabled => None,
            TlsMode::AutoGenerate { cert_dir, .. } => {
                Some((cert_dir.join(CERT_FILE), cert_dir.join(KEY_FILE)))
            }
            TlsMode::Provided {
                cert_path,
                key_path,
            } => Some((cert_path.clone(), key_path.clone())),
        }
    }
}

/// PEM material ready for the listener
#[derive(Debug, Clone)]
pub struct TlsMaterial {
    pub cert_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
    /// CA certificate to register as the webhook's `caBundle`; only for generated material
    pub ca_path: Option<PathBuf>,
}

/// Resolve TLS material for the given mode. `Disabled` yields `None`.
pub fn resolve_tls(mode: &TlsMode) -> miette::Result<Option<TlsMaterial>> {
    match mode {
        TlsMode::Disabled => Ok(None),
        TlsMode::AutoGenerate {
            cert_dir,
            san_entries,
        } => {
            let ca_path = cert_dir.join(CA_FILE);
            let cert_path = cert_dir.join(CERT_FILE);
            let key_path = cert_dir.join(KEY_FILE);

            if ca_path.exists() && cert_path.exists() && key_path.exists() {
                info!("Loading existing webhook certificates from {}", cert_dir.display());
                let mut material = read_pair(&cert_path, &key_path)?;
                material.ca_path = Some(ca_path);
                Ok(Some(material))
            } else {
                info!(
                    "Generating self-signed webhook certificates in {}",
                    cert_dir.display()
                );
                generate_self_signed(cert_dir, san_entries).map(Some)
            }
        }
        TlsMode::Provided {
            cert_path,
            key_path,
        } => read_pair(cert_path, key_path).map(Some),
    }
}

/// Whether the certificate and key can still be read from disk
pub fn files_readable(cert_path: &Path, key_path: &Path) -> bool {
    std::fs::File::open(cert_path).is_ok() && std::fs::File::open(key_path).is_ok()
}

fn read_pem(path: &Path, what: &str) -> miette::Result<Vec<u8>> {
    std::fs::read(path)
        .into_diagnostic()
        .wrap_err_with(|| format!("failed to read {} at {}", what, path.display()))
}

fn read_pair(cert_path: &Path, key_path: &Path) -> miette::Result<TlsMaterial> {
    Ok(TlsMaterial {
        cert_pem: read_pem(cert_path, "TLS certificate")?,
        key_pem: read_pem(key_path, "TLS key")?,
        ca_path: None,
    })
}

fn generate_self_signed(cert_dir: &Path, san_entries: &[String]) -> miette::Result<TlsMaterial> {
    std::fs::create_dir_all(cert_dir)
        .into_diagnostic()
        .wrap_err_with(|| format!("failed to create certificate directory {}", cert_dir.display()))?;

    let ca_key = KeyPair::generate()
        .into_diagnostic()
        .wrap_err("failed to generate CA key pair")?;
    let mut ca_params = CertificateParams::new(vec!["Podlabel Webhook CA".to_string()])
        .into_diagnostic()
        .wrap_err("failed to create CA certificate params")?;
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    let ca_cert = ca_params
        .self_signed(&ca_key)
        .into_diagnostic()
        .wrap_err("failed to self-sign CA certificate")?;

    let server_key = KeyPair::generate()
        .into_diagnostic()
        .wrap_err("failed to generate serving key pair")?;
    let mut server_params = CertificateParams::new(san_entries.to_vec())
        .into_diagnostic()
        .wrap_err("failed to create serving certificate params")?;
    server_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    let server_cert = server_params
        .signed_by(&server_key, &ca_cert, &ca_key)
        .into_diagnostic()
        .wrap_err("failed to sign serving certificate")?;

    let material = TlsMaterial {
        cert_pem: server_cert.pem().into_bytes(),
        key_pem: server_key.serialize_pem().into_bytes(),
        ca_path: Some(cert_dir.join(CA_FILE)),
    };

    let ca_pem = ca_cert.pem();
    for (file, pem) in [
        (CA_FILE, ca_pem.as_bytes()),
        (CERT_FILE, material.cert_pem.as_slice()),
        (KEY_FILE, material.key_pem.as_slice()),
    ] {
        let path = cert_dir.join(file);
        std::fs::write(&path, pem)
            .into_diagnostic()
            .wrap_err_with(|| format!("failed to write {}", path.display()))?;
    }

    info!(
        "Webhook certificates written to {} ({}, {}, {})",
        cert_dir.display(),
        CA_FILE,
        CERT_FILE,
        KEY_FILE
    );

    Ok(material)
}
