use crate::error::{Result, TunnelError};
use rustls::pki_types::{CertificateDer, ServerName};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::{rustls, TlsConnector};
use tracing::debug;

/// 出站 TLS 升级参数
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsSettings {
    /// SNI 名称，缺省使用连接的主机名
    pub server_name: Option<String>,
    /// 跳过证书验证（仅用于测试）
    pub skip_verify: bool,
    /// 自定义 CA 证书
    pub ca_cert_path: Option<PathBuf>,
}

impl TlsSettings {
    pub fn insecure() -> Self {
        Self {
            skip_verify: true,
            ..Self::default()
        }
    }
}

/// 构建客户端 TLS 配置
pub fn load_client_config(
    ca_cert_path: Option<&Path>,
    skip_verify: bool,
) -> Result<Arc<rustls::ClientConfig>> {
    let mut root_store = rustls::RootCertStore::empty();

    if let Some(ca_path) = ca_cert_path {
        for cert in read_certificates(ca_path)? {
            root_store
                .add(cert)
                .map_err(|e| TunnelError::tls(format!("Failed to add CA certificate: {}", e)))?;
        }
    } else if !skip_verify {
        let native_certs = rustls_native_certs::load_native_certs();
        for cert in native_certs.certs {
            root_store.add(cert).ok();
        }
    }

    let mut config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    if skip_verify {
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(NoCertificateVerification));
    }

    Ok(Arc::new(config))
}

fn read_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).map_err(|e| {
        TunnelError::tls(format!("Failed to open CA cert file {:?}: {}", path, e))
    })?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| TunnelError::tls(format!("Failed to parse CA certificates: {}", e)))
}

/// 在已建立的 TCP 连接上完成 TLS 握手
pub async fn upgrade(
    stream: TcpStream,
    host: &str,
    settings: &TlsSettings,
) -> Result<TlsStream<TcpStream>> {
    let config = load_client_config(settings.ca_cert_path.as_deref(), settings.skip_verify)?;
    let name = settings.server_name.as_deref().unwrap_or(host).to_string();
    let server_name = ServerName::try_from(name.clone())
        .map_err(|e| TunnelError::tls(format!("Invalid server name '{}': {}", name, e)))?;

    debug!("Starting TLS handshake with {}", name);
    let stream = TlsConnector::from(config)
        .connect(server_name, stream)
        .await
        .map_err(|e| TunnelError::tls(format!("TLS handshake with {} failed: {}", name, e)))?;
    Ok(stream)
}

/// 不验证证书的验证器（仅用于测试）
#[derive(Debug)]
struct NoCertificateVerification;

impl rustls::client::danger::ServerCertVerifier for NoCertificateVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer,
        _intermediates: &[CertificateDer],
        _server_name: &ServerName,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        use rustls::SignatureScheme::*;
        vec![
            RSA_PKCS1_SHA256,
            RSA_PKCS1_SHA384,
            RSA_PKCS1_SHA512,
            ECDSA_NISTP256_SHA256,
            ECDSA_NISTP384_SHA384,
            ECDSA_NISTP521_SHA512,
            ED25519,
            RSA_PSS_SHA256,
            RSA_PSS_SHA384,
            RSA_PSS_SHA512,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insecure_config() {
        let config = load_client_config(None, true).unwrap();
        assert!(config.alpn_protocols.is_empty());
    }

    #[test]
    fn test_missing_ca_file() {
        let err = load_client_config(Some(Path::new("/nonexistent/ca.pem")), false).unwrap_err();
        assert!(matches!(err, TunnelError::Tls(_)));
    }
}
