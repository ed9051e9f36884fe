//! Front-door TLS via ACME DNS-01
//!
//! Domain ownership is proven by provisioning `_acme-challenge.<domain>` TXT
//! records through a DNS API. Certificates and the ACME account are cached
//! under the configured cache directory; private keys are written with
//! owner-only permissions. A renewal loop reissues the certificate when it
//! is less than 30 days from expiry.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, LetsEncrypt,
    NewAccount, NewOrder, Order, OrderStatus,
};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, PKCS_ECDSA_P256_SHA256};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::config::LetsEncryptConfig;

/// How often the renewal loop inspects the cached certificate
const RENEWAL_CHECK_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Remaining validity below which the certificate is reissued
const RENEWAL_THRESHOLD_DAYS: i64 = 30;

/// Cadence and cap for polling ACME order milestones
const ORDER_POLL_INTERVAL: Duration = Duration::from_secs(2);
const ORDER_POLL_ROUNDS: u32 = 30;

pub struct CertManager {
    config: LetsEncryptConfig,
    cache_dir: PathBuf,
    dns: DnsApiClient,
}

impl CertManager {
    pub fn new(config: LetsEncryptConfig) -> anyhow::Result<Self> {
        let cache_dir = PathBuf::from(&config.cache_dir);
        if !cache_dir.exists() {
            std::fs::create_dir_all(&cache_dir)?;
        }

        let dns = DnsApiClient::new(&config.dns_api_token)?;

        Ok(Self {
            config,
            cache_dir,
            dns,
        })
    }

    /// Ensure a certificate exists, build the TLS config, bind the listener
    /// and hand both to `serve_fn`
    pub async fn listen_and_serve_tls<F, Fut>(
        &self,
        hostname: &str,
        port: u16,
        serve_fn: F,
    ) -> anyhow::Result<()>
    where
        F: FnOnce(TcpListener, Arc<rustls::ServerConfig>) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let (certs, key) = match self.load_cached_cert() {
            Some(pair) => pair,
            None => {
                info!(domain = %self.config.domain_name, "No valid cached certificate, requesting");
                self.obtain_and_cache().await?
            }
        };

        let mut tls_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| anyhow::anyhow!("TLS configuration error: {}", e))?;
        tls_config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

        let addr = format!("{}:{}", hostname, port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| anyhow::anyhow!("listening on {}: {}", addr, e))?;

        serve_fn(listener, Arc::new(tls_config)).await
    }

    /// Renewal loop: every 24 h examine the cached certificate and reissue
    /// when it expires within 30 days
    pub async fn run_renewal(&self, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(RENEWAL_CHECK_INTERVAL) => {
                    info!("Checking certificate expiry");

                    let remaining = self
                        .load_cert_chain()
                        .and_then(|certs| certs.first().and_then(|c| days_until_expiry(c).ok()));
                    let needs_renewal = match remaining {
                        Some(days) => days < RENEWAL_THRESHOLD_DAYS,
                        None => true,
                    };

                    if needs_renewal {
                        info!(domain = %self.config.domain_name, "Certificate expiring soon, renewing");
                        match self.obtain_and_cache().await {
                            Ok(_) => info!("Certificate renewed successfully"),
                            Err(e) => error!(error = %e, "Failed to renew certificate"),
                        }
                    } else {
                        debug!("Certificate is valid for more than 30 days");
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Certificate renewal process stopped");
                        break;
                    }
                }
            }
        }
    }

    fn cert_path(&self) -> PathBuf {
        self.cache_dir
            .join(format!("{}.crt", self.config.domain_name))
    }

    fn key_path(&self) -> PathBuf {
        self.cache_dir
            .join(format!("{}.key", self.config.domain_name))
    }

    fn load_cert_chain(&self) -> Option<Vec<CertificateDer<'static>>> {
        let data = std::fs::read(self.cert_path()).ok()?;
        let certs: Vec<CertificateDer<'static>> =
            rustls_pemfile::certs(&mut std::io::BufReader::new(&data[..]))
                .filter_map(|c| c.ok())
                .collect();
        if certs.is_empty() {
            return None;
        }
        Some(certs)
    }

    /// Cached certificate, only when valid for at least 30 more days
    fn load_cached_cert(&self) -> Option<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
        let certs = self.load_cert_chain()?;
        let key_data = std::fs::read(self.key_path()).ok()?;
        let key = load_private_key(&key_data)?;

        match certs.first().and_then(|c| days_until_expiry(c).ok()) {
            Some(days) if days >= RENEWAL_THRESHOLD_DAYS => {}
            Some(days) => {
                info!(days, "Cached certificate expires soon, will renew");
                return None;
            }
            None => return None,
        }

        info!(path = %self.cert_path().display(), "Loaded cached certificate");
        Some((certs, key))
    }

    async fn obtain_and_cache(
        &self,
    ) -> anyhow::Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
        let account = self.get_or_create_account().await?;
        let (certs, key, cert_pem, key_pem) = self.obtain_certificate(&account).await?;
        self.save_cert(&cert_pem, &key_pem)?;
        Ok((certs, key))
    }

    async fn get_or_create_account(&self) -> anyhow::Result<Account> {
        let account_path = self.cache_dir.join("account.json");

        if account_path.exists() {
            debug!(path = %account_path.display(), "Loading existing ACME account");
            let data = std::fs::read_to_string(&account_path)?;
            let credentials: AccountCredentials = serde_json::from_str(&data)?;
            let account = Account::from_credentials(credentials).await?;
            return Ok(account);
        }

        info!("Creating new ACME account");
        let (account, credentials) = Account::create(
            &NewAccount {
                contact: &[],
                terms_of_service_agreed: true,
                only_return_existing: false,
            },
            LetsEncrypt::Production.url(),
            None,
        )
        .await?;

        let data = serde_json::to_string_pretty(&credentials)?;
        std::fs::write(&account_path, data)?;
        info!(path = %account_path.display(), "ACME account credentials saved");

        Ok(account)
    }

    /// Obtain a certificate for the configured domain via DNS-01
    async fn obtain_certificate(
        &self,
        account: &Account,
    ) -> anyhow::Result<(
        Vec<CertificateDer<'static>>,
        PrivateKeyDer<'static>,
        String,
        String,
    )> {
        let domain = self.config.domain_name.clone();
        info!(domain = %domain, "Requesting new certificate");

        let zone_id = self.dns.zone_id(&domain).await?;

        let identifiers = vec![Identifier::Dns(domain.clone())];
        let mut order = account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await?;

        for authz in order.authorizations().await? {
            if authz.status == AuthorizationStatus::Valid {
                continue;
            }

            let identifier = match &authz.identifier {
                Identifier::Dns(domain) => domain.clone(),
            };

            let challenge = authz
                .challenges
                .iter()
                .find(|c| c.r#type == ChallengeType::Dns01)
                .ok_or_else(|| {
                    anyhow::anyhow!("DNS-01 challenge not available for {}", identifier)
                })?;

            let key_auth = order.key_authorization(challenge);
            let record_name = format!("_acme-challenge.{}", identifier);

            info!(domain = %identifier, record = %record_name, "Provisioning DNS challenge record");
            self.dns
                .create_txt_record(&zone_id, &record_name, &key_auth.dns_value())
                .await?;

            order.set_challenge_ready(&challenge.url).await?;
            let outcome =
                await_order(&mut order, OrderWait::Authorization(identifier.as_str())).await;

            // The challenge record never outlives the attempt
            if let Err(e) = self.dns.delete_txt_records(&zone_id, &record_name).await {
                error!(record = %record_name, error = %e, "Failed to clean up DNS challenge record");
            }
            outcome?;
            info!(domain = %identifier, "Authorization valid");
        }

        await_order(&mut order, OrderWait::Ready).await?;

        // Finalize with a fresh key and CSR
        let mut params = CertificateParams::new(vec![domain.clone()])?;
        params.distinguished_name = DistinguishedName::new();
        params.distinguished_name.push(DnType::CommonName, domain);

        let private_key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;
        let csr = params.serialize_request(&private_key)?;
        order.finalize(csr.der()).await?;

        let cert_chain_pem = await_order(&mut order, OrderWait::Certificate)
            .await?
            .ok_or_else(|| anyhow::anyhow!("order valid but no certificate returned"))?;

        let private_key_pem = private_key.serialize_pem();

        let certs: Vec<CertificateDer<'static>> =
            rustls_pemfile::certs(&mut std::io::BufReader::new(cert_chain_pem.as_bytes()))
                .filter_map(|c| c.ok())
                .collect();
        let key = PrivateKeyDer::try_from(private_key.serialize_der())
            .map_err(|e| anyhow::anyhow!("failed to parse private key: {}", e))?;

        info!(domain = %self.config.domain_name, "Certificate obtained successfully");
        Ok((certs, key, cert_chain_pem, private_key_pem))
    }

    fn save_cert(&self, cert_chain_pem: &str, private_key_pem: &str) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.cache_dir)?;
        std::fs::write(self.cert_path(), cert_chain_pem)?;

        // The private key is owner-readable only
        #[cfg(unix)]
        {
            use std::io::Write;
            use std::os::unix::fs::OpenOptionsExt;
            let mut file = std::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(self.key_path())?;
            file.write_all(private_key_pem.as_bytes())?;
        }
        #[cfg(not(unix))]
        {
            std::fs::write(self.key_path(), private_key_pem)?;
        }

        info!(path = %self.cert_path().display(), "Certificate saved to cache");
        Ok(())
    }
}

/// Token-authenticated client for the DNS provider's REST API
struct DnsApiClient {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct DnsListResponse<T> {
    result: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct DnsZone {
    id: String,
}

#[derive(Debug, Deserialize)]
struct DnsRecord {
    id: String,
}

impl DnsApiClient {
    const DEFAULT_BASE_URL: &'static str = "https://api.cloudflare.com/client/v4";

    fn new(api_token: &str) -> anyhow::Result<Self> {
        use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};

        let mut headers = HeaderMap::new();
        let mut auth = HeaderValue::from_str(&format!("Bearer {}", api_token))
            .map_err(|e| anyhow::anyhow!("invalid DNS API token: {}", e))?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            http,
            base_url: Self::DEFAULT_BASE_URL.to_string(),
        })
    }

    /// Zone id for the domain the certificate is issued on
    async fn zone_id(&self, domain: &str) -> anyhow::Result<String> {
        let response: DnsListResponse<DnsZone> = self
            .http
            .get(format!("{}/zones", self.base_url))
            .query(&[("name", domain)])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        response
            .result
            .into_iter()
            .next()
            .map(|zone| zone.id)
            .ok_or_else(|| anyhow::anyhow!("no DNS zone found for {}", domain))
    }

    async fn create_txt_record(
        &self,
        zone_id: &str,
        name: &str,
        content: &str,
    ) -> anyhow::Result<()> {
        info!(record = %name, "Creating TXT record");
        self.http
            .post(format!("{}/zones/{}/dns_records", self.base_url, zone_id))
            .json(&serde_json::json!({
                "type": "TXT",
                "name": name,
                "content": content,
                "ttl": 60,
                "proxied": false,
            }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Delete every TXT record with the given name
    async fn delete_txt_records(&self, zone_id: &str, name: &str) -> anyhow::Result<()> {
        info!(record = %name, "Deleting TXT records");
        let records: DnsListResponse<DnsRecord> = self
            .http
            .get(format!("{}/zones/{}/dns_records", self.base_url, zone_id))
            .query(&[("type", "TXT"), ("name", name)])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        for record in records.result {
            self.http
                .delete(format!(
                    "{}/zones/{}/dns_records/{}",
                    self.base_url, zone_id, record.id
                ))
                .send()
                .await?
                .error_for_status()?;
        }
        Ok(())
    }
}

/// Milestones awaited while driving an ACME order
enum OrderWait<'a> {
    /// The named domain's authorization turns valid
    Authorization(&'a str),
    /// The order accepts a CSR
    Ready,
    /// The signed chain is issued; yields its PEM
    Certificate,
}

impl OrderWait<'_> {
    fn label(&self) -> &'static str {
        match self {
            OrderWait::Authorization(_) => "authorization",
            OrderWait::Ready => "order readiness",
            OrderWait::Certificate => "certificate issuance",
        }
    }
}

/// Poll one milestone of an ACME order on a fixed cadence. Only
/// `Certificate` produces a value.
async fn await_order(order: &mut Order, wait: OrderWait<'_>) -> anyhow::Result<Option<String>> {
    for round in 0..ORDER_POLL_ROUNDS {
        if round > 0 {
            tokio::time::sleep(ORDER_POLL_INTERVAL).await;
        }

        match &wait {
            OrderWait::Authorization(domain) => {
                order.refresh().await?;
                let auths = order.authorizations().await?;
                let status = auths
                    .iter()
                    .find(|a| matches!(&a.identifier, Identifier::Dns(d) if d.as_str() == *domain))
                    .map(|a| &a.status);
                match status {
                    Some(AuthorizationStatus::Valid) => return Ok(None),
                    Some(AuthorizationStatus::Invalid) => {
                        anyhow::bail!("authorization failed for {}", domain)
                    }
                    Some(_) => {}
                    None => anyhow::bail!("authorization disappeared for {}", domain),
                }
            }
            OrderWait::Ready => match order.state().status {
                OrderStatus::Ready | OrderStatus::Valid => return Ok(None),
                OrderStatus::Pending | OrderStatus::Processing => {
                    order.refresh().await?;
                }
                OrderStatus::Invalid => anyhow::bail!("order invalid"),
            },
            OrderWait::Certificate => {
                order.refresh().await?;
                match order.state().status {
                    OrderStatus::Valid => {
                        if let Some(chain) = order.certificate().await? {
                            return Ok(Some(chain));
                        }
                        anyhow::bail!("order valid but no certificate returned");
                    }
                    OrderStatus::Processing => {}
                    status => anyhow::bail!("unexpected order status: {:?}", status),
                }
            }
        }

        debug!(milestone = wait.label(), round, "acme order still pending");
    }

    anyhow::bail!("{} did not complete in time", wait.label())
}

/// First private key of any supported PEM kind
fn load_private_key(data: &[u8]) -> Option<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut std::io::BufReader::new(data))
        .ok()
        .flatten()
}

/// Whole days until the certificate's notAfter; negative once expired
fn days_until_expiry(cert: &CertificateDer<'_>) -> anyhow::Result<i64> {
    let (_, parsed) = x509_parser::parse_x509_certificate(cert.as_ref())
        .map_err(|e| anyhow::anyhow!("parsing certificate: {}", e))?;

    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);

    Ok((parsed.validity().not_after.timestamp() - now) / 86_400)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{generate_simple_self_signed, CertifiedKey};

    #[test]
    fn test_days_until_expiry() {
        let CertifiedKey { cert, .. } =
            generate_simple_self_signed(vec!["example.com".to_string()]).unwrap();
        let der = CertificateDer::from(cert.der().to_vec());

        // rcgen's default validity is well past the renewal threshold but
        // under a century
        let days = days_until_expiry(&der).unwrap();
        assert!(days >= RENEWAL_THRESHOLD_DAYS);
        assert!(days < 365 * 100);

        assert!(days_until_expiry(&CertificateDer::from(vec![0u8; 8])).is_err());
    }

    #[test]
    fn test_load_private_key_pem() {
        let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256).unwrap();
        let pem = key_pair.serialize_pem();
        assert!(load_private_key(pem.as_bytes()).is_some());
        assert!(load_private_key(b"not a key").is_none());
    }

    #[test]
    fn test_cert_paths_follow_domain() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CertManager::new(LetsEncryptConfig {
            enabled: true,
            dns_api_token: "token".into(),
            domain_name: "proxy.example.com".into(),
            cache_dir: dir.path().to_string_lossy().into_owned(),
        })
        .unwrap();

        assert!(manager.cert_path().ends_with("proxy.example.com.crt"));
        assert!(manager.key_path().ends_with("proxy.example.com.key"));
        assert!(manager.load_cached_cert().is_none());
    }
}
