use std::fs::File;
use std::io::{self, BufReader, ErrorKind};
use std::path::Path;
use std::sync::Arc;

use pgwire::tokio::tokio_rustls::rustls::ServerConfig;
use pgwire::tokio::TlsAcceptor;

use crate::config::TlsFiles;

/// Build the acceptor for connections that request SSL. `None` serves
/// plaintext only.
pub fn load_tls_acceptor(files: Option<&TlsFiles>) -> io::Result<Option<TlsAcceptor>> {
    let Some(files) = files else {
        return Ok(None);
    };
    let config = server_config(&files.cert, &files.key)?;
    Ok(Some(TlsAcceptor::from(Arc::new(config))))
}

fn server_config(cert: &Path, key: &Path) -> io::Result<ServerConfig> {
    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(File::open(cert)?))
        .collect::<Result<_, _>>()?;
    if certs.is_empty() {
        return Err(io::Error::new(
            ErrorKind::InvalidInput,
            format!("no certificates in {}", cert.display()),
        ));
    }

    let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key)?))?
        .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "no private key found in key file"))?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| io::Error::new(ErrorKind::InvalidInput, e))?;
    config.alpn_protocols = vec![b"postgresql".to_vec()];
    Ok(config)
}
