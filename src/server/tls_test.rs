//! Tests for loading the serving certificate

use super::*;
use tempfile::TempDir;

fn write_self_signed(dir: &TempDir) -> (std::path::PathBuf, std::path::PathBuf) {
    let key_pair = rcgen::KeyPair::generate().unwrap();
    let cert = rcgen::CertificateParams::new(vec!["injector.test.svc".to_string()])
        .unwrap()
        .self_signed(&key_pair)
        .unwrap();

    let cert_path = dir.path().join("tls.crt");
    let key_path = dir.path().join("tls.key");
    std::fs::write(&cert_path, cert.pem()).unwrap();
    std::fs::write(&key_path, key_pair.serialize_pem()).unwrap();
    (cert_path, key_path)
}

/// Test: a PEM cert/key pair loads into a server config
#[test]
fn test_load_server_config() {
    // Install ring as the default crypto provider for rustls; install_default
    // is idempotent so concurrent tests are fine
    let _ = rustls::crypto::ring::default_provider().install_default();

    let dir = TempDir::new().unwrap();
    let (cert_path, key_path) = write_self_signed(&dir);

    let config = load_server_config(&cert_path, &key_path).unwrap();

    assert!(Arc::strong_count(&config) >= 1);
}

/// Test: a missing certificate file is an Io error
#[test]
fn test_missing_cert_file() {
    let dir = TempDir::new().unwrap();

    let result = load_server_config(&dir.path().join("nope.crt"), &dir.path().join("nope.key"));

    assert!(matches!(result, Err(TlsError::Io { .. })));
}

/// Test: a key file without a private key is rejected
#[test]
fn test_key_file_without_key() {
    let _ = rustls::crypto::ring::default_provider().install_default();

    let dir = TempDir::new().unwrap();
    let (cert_path, _) = write_self_signed(&dir);
    let empty_key = dir.path().join("empty.key");
    std::fs::write(&empty_key, "").unwrap();

    let result = load_server_config(&cert_path, &empty_key);

    assert!(matches!(result, Err(TlsError::NoPrivateKey(_))));
}
