use std::{sync::OnceLock, time::Duration};

use tracing::debug;

use crate::Result;

/// User agent sent to symbol servers; msdl serves SymSrv-shaped clients.
pub const SYMBOL_USER_AGENT: &str = concat!("Microsoft-Symbol-Server/10.0 wsus-bam/", env!("CARGO_PKG_VERSION"));

pub fn install_rustls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}

/// Build the client used for symbol downloads.
///
/// A zero `request_timeout` leaves reqwest's default (none).
pub fn build_symbol_client(request_timeout: Duration) -> Result<reqwest::Client> {
    install_rustls_provider();

    let mut builder = reqwest::Client::builder()
        .user_agent(SYMBOL_USER_AGENT)
        .connect_timeout(Duration::from_secs(15));

    if request_timeout > Duration::ZERO {
        builder = builder.timeout(request_timeout);
    }

    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_builds_twice() {
        build_symbol_client(Duration::from_secs(5)).unwrap();
        build_symbol_client(Duration::ZERO).unwrap();
    }
}
