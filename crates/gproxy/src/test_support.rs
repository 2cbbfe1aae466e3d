//! Helpers shared by the unit tests.

use std::fs;
use std::path::{Path, PathBuf};

use hudsucker::rcgen::{
    date_time_ymd, BasicConstraints, CertificateParams, IsCa, KeyPair, KeyUsagePurpose,
};

/// Validity window of a generated test CA.
#[derive(Debug, Clone, Copy)]
pub enum CaWindow {
    Current,
    Expired,
    NotYetValid,
}

/// Writes a self-signed CA into `dir` and returns `(key_path, cert_path)`.
pub fn write_ca(dir: &Path, window: CaWindow) -> (PathBuf, PathBuf) {
    let key_pair = KeyPair::generate().unwrap();
    let mut params = CertificateParams::new(vec!["gproxy test CA".to_string()]).unwrap();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];

    let (not_before, not_after) = match window {
        CaWindow::Current => (date_time_ymd(2020, 1, 1), date_time_ymd(2090, 1, 1)),
        CaWindow::Expired => (date_time_ymd(2000, 1, 1), date_time_ymd(2001, 1, 1)),
        CaWindow::NotYetValid => (date_time_ymd(2090, 1, 1), date_time_ymd(2091, 1, 1)),
    };
    params.not_before = not_before;
    params.not_after = not_after;

    let cert = params.self_signed(&key_pair).unwrap();

    let key_path = dir.join("ca.key");
    let cert_path = dir.join("ca.crt");
    fs::write(&key_path, key_pair.serialize_pem()).unwrap();
    fs::write(&cert_path, cert.pem()).unwrap();

    (key_path, cert_path)
}
