use crate::imap;
use anyhow::Context as _;
use std::{fs, io, path, sync, time};

pub fn server_config(
  certificate: &path::Path,
  key: &path::Path,
) -> anyhow::Result<sync::Arc<rustls::ServerConfig>> {
  let mut reader = io::BufReader::new(
    fs::File::open(certificate).with_context(|| format!("couldn't open {certificate:?}"))?,
  );
  let certificates: Vec<_> = rustls_pemfile::certs(&mut reader)
    .with_context(|| format!("couldn't parse {certificate:?}"))?
    .into_iter()
    .map(rustls::Certificate)
    .collect();
  anyhow::ensure!(!certificates.is_empty(), "no certificate in {certificate:?}");

  let mut reader =
    io::BufReader::new(fs::File::open(key).with_context(|| format!("couldn't open {key:?}"))?);
  let key = loop {
    match rustls_pemfile::read_one(&mut reader).with_context(|| format!("couldn't parse {key:?}"))? {
      Some(rustls_pemfile::Item::PKCS8Key(key))
      | Some(rustls_pemfile::Item::RSAKey(key))
      | Some(rustls_pemfile::Item::ECKey(key)) => break rustls::PrivateKey(key),
      Some(_) => continue,
      None => anyhow::bail!("no private key in {key:?}"),
    }
  };

  Ok(sync::Arc::new(
    rustls::ServerConfig::builder()
      .with_safe_defaults()
      .with_no_client_auth()
      .with_single_cert(certificates, key)?,
  ))
}

pub fn native_client_config() -> anyhow::Result<sync::Arc<rustls::ClientConfig>> {
  let mut root_store = rustls::RootCertStore::empty();
  for certificate in rustls_native_certs::load_native_certs()? {
    root_store.add(&rustls::Certificate(certificate.0))?
  }
  Ok(sync::Arc::new(
    rustls::ClientConfig::builder()
      .with_safe_defaults()
      .with_root_certificates(root_store)
      .with_no_client_auth(),
  ))
}

// The remote authenticator is usually reached through an internal name with a self-signed
// certificate.
struct NoVerification;

impl rustls::client::ServerCertVerifier for NoVerification {
  fn verify_server_cert(
    &self,
    _end_entity: &rustls::Certificate,
    _intermediates: &[rustls::Certificate],
    _server_name: &rustls::ServerName,
    _scts: &mut dyn Iterator<Item = &[u8]>,
    _ocsp_response: &[u8],
    _now: time::SystemTime,
  ) -> Result<rustls::client::ServerCertVerified, rustls::Error> {
    Ok(rustls::client::ServerCertVerified::assertion())
  }
}

pub fn insecure_client_config() -> sync::Arc<rustls::ClientConfig> {
  sync::Arc::new(
    rustls::ClientConfig::builder()
      .with_safe_defaults()
      .with_custom_certificate_verifier(sync::Arc::new(NoVerification))
      .with_no_client_auth(),
  )
}

// The handshake happens lazily, on the first read or write.
pub fn accept<T>(
  config: sync::Arc<rustls::ServerConfig>,
  transport: T,
) -> anyhow::Result<rustls::StreamOwned<rustls::ServerConnection, T>>
where
  T: imap::Transport,
{
  Ok(rustls::StreamOwned::new(
    rustls::ServerConnection::new(config)?,
    transport,
  ))
}

impl<T> imap::Transport for rustls::StreamOwned<rustls::ServerConnection, T>
where
  T: imap::Transport,
{
  fn set_read_timeout(&self, timeout: Option<time::Duration>) -> io::Result<()> {
    self.sock.set_read_timeout(timeout)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Write as _;

  #[test]
  fn missing_files() {
    let directory = tempfile::tempdir().unwrap();
    let error = server_config(
      &directory.path().join("certificate.pem"),
      &directory.path().join("key.pem"),
    )
    .unwrap_err();
    assert!(error.to_string().starts_with("couldn't open"), "{error}");
  }

  #[test]
  fn no_certificate() -> anyhow::Result<()> {
    let directory = tempfile::tempdir()?;
    let certificate = directory.path().join("certificate.pem");
    fs::File::create(&certificate)?.write_all(b"not a certificate\n")?;
    let error = server_config(&certificate, &certificate).unwrap_err();
    assert!(error.to_string().starts_with("no certificate"), "{error}");
    Ok(())
  }

  #[test]
  fn insecure() {
    // Building it must not require any root certificate.
    let config = insecure_client_config();
    assert!(config.alpn_protocols.is_empty());
  }
}
