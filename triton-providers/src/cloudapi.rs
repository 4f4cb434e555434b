use crate::types::{CreateMachineOpts, Machine, SshKey};
use crate::CloudApi;
use anyhow::{Context, Result};
use async_trait::async_trait;
use openssl::base64;
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private};
use openssl::sign::Signer;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};
use reqwest::{Client, StatusCode};
use std::time::Duration;

const API_VERSION: &str = "~8";

pub struct CloudApiClient {
    client: Client,
    endpoint: String,
    account: String,
    key_id: String,
    key: PKey<Private>,
}

impl CloudApiClient {
    /// Build a client from an endpoint, account login, key id and the PEM
    /// private key material registered for that key id.
    pub fn new(endpoint: &str, account: &str, key_id: &str, key_pem: &[u8]) -> Result<Self> {
        // The default reqwest client has no overall timeout. If CloudAPI
        // stalls, a reconciliation round would hang forever.
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(30))
            .build()?;
        let key = PKey::private_key_from_pem(key_pem)
            .context("private key is not a valid PEM RSA key")?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            account: account.trim().to_string(),
            key_id: key_id.trim().to_string(),
            key,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}{}", self.endpoint, self.account, path)
    }

    /// HTTP Signature auth over the Date header, as CloudAPI expects:
    /// `Authorization: Signature keyId="/<account>/keys/<key-id>",
    /// algorithm="rsa-sha256",signature="<base64>"`.
    fn headers(&self) -> Result<HeaderMap> {
        let date = chrono::Utc::now()
            .format("%a, %d %b %Y %H:%M:%S GMT")
            .to_string();
        let mut signer = Signer::new(MessageDigest::sha256(), &self.key)?;
        signer.update(format!("date: {}", date).as_bytes())?;
        let signature = base64::encode_block(&signer.sign_to_vec()?);
        let authorization = format!(
            "Signature keyId=\"/{}/keys/{}\",algorithm=\"rsa-sha256\",signature=\"{}\"",
            self.account, self.key_id, signature
        );

        let mut headers = HeaderMap::new();
        headers.insert("Date", HeaderValue::from_str(&date)?);
        headers.insert(AUTHORIZATION, HeaderValue::from_str(&authorization)?);
        headers.insert("Api-Version", HeaderValue::from_static(API_VERSION));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        Ok(headers)
    }

    /// `POST /:account/machines/:id?action=<start|stop|reboot>`.
    async fn machine_action(&self, id: &str, action: &str) -> Result<()> {
        let url = self.url(&format!("/machines/{}", id));
        eprintln!("🔵 [CloudAPI] POST {}?action={}", url, action);
        let resp = self
            .client
            .post(&url)
            .headers(self.headers()?)
            .query(&[("action", action)])
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            eprintln!(
                "❌ [CloudAPI] POST {}?action={} failed: status={} body={}",
                url,
                action,
                status.as_u16(),
                body
            );
            return Err(anyhow::anyhow!(
                "CloudAPI {} failed: status={} body={}",
                action,
                status.as_u16(),
                body
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl CloudApi for CloudApiClient {
    async fn create_machine(&self, opts: &CreateMachineOpts) -> Result<Machine> {
        let url = self.url("/machines");
        eprintln!(
            "🔵 [CloudAPI] POST {} - creating machine: name={}, package={}, image={}",
            url, opts.name, opts.package, opts.image
        );
        let resp = self
            .client
            .post(&url)
            .headers(self.headers()?)
            .json(opts)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            eprintln!(
                "❌ [CloudAPI] POST {} failed: status={} body={}",
                url,
                status.as_u16(),
                body
            );
            return Err(anyhow::anyhow!(
                "CloudAPI create machine failed: status={} body={}",
                status.as_u16(),
                body
            ));
        }
        let machine: Machine = resp.json().await?;
        eprintln!(
            "✅ [CloudAPI] machine created: id={}, name={}, state={}",
            machine.id, machine.name, machine.state
        );
        Ok(machine)
    }

    async fn get_machine(&self, id: &str) -> Result<Option<Machine>> {
        let url = self.url(&format!("/machines/{}", id));
        let resp = self.client.get(&url).headers(self.headers()?).send().await?;
        let status = resp.status();
        // CloudAPI answers 410 Gone for deleted machines, 404 for unknown ids.
        if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
            return Ok(None);
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!(
                "CloudAPI get machine {} failed: status={} body={}",
                id,
                status.as_u16(),
                body
            ));
        }
        Ok(Some(resp.json().await?))
    }

    async fn list_machines(&self, name: Option<&str>) -> Result<Vec<Machine>> {
        let url = self.url("/machines");
        let mut req = self.client.get(&url).headers(self.headers()?);
        if let Some(name) = name {
            req = req.query(&[("name", name)]);
        }
        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!(
                "CloudAPI list machines failed: status={} body={}",
                status.as_u16(),
                body
            ));
        }
        Ok(resp.json().await?)
    }

    async fn delete_machine(&self, id: &str) -> Result<()> {
        let url = self.url(&format!("/machines/{}", id));
        eprintln!("🔵 [CloudAPI] DELETE {}", url);
        let resp = self
            .client
            .delete(&url)
            .headers(self.headers()?)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            eprintln!(
                "❌ [CloudAPI] DELETE {} failed: status={} body={}",
                url,
                status.as_u16(),
                body
            );
            return Err(anyhow::anyhow!(
                "CloudAPI delete machine {} failed: status={} body={}",
                id,
                status.as_u16(),
                body
            ));
        }
        eprintln!("✅ [CloudAPI] machine {} deletion accepted", id);
        Ok(())
    }

    async fn start_machine(&self, id: &str) -> Result<()> {
        self.machine_action(id, "start").await
    }

    async fn stop_machine(&self, id: &str) -> Result<()> {
        self.machine_action(id, "stop").await
    }

    async fn reboot_machine(&self, id: &str) -> Result<()> {
        self.machine_action(id, "reboot").await
    }

    async fn list_keys(&self) -> Result<Vec<SshKey>> {
        let url = self.url("/keys");
        let resp = self.client.get(&url).headers(self.headers()?).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!(
                "CloudAPI list keys failed: status={} body={}",
                status.as_u16(),
                body
            ));
        }
        Ok(resp.json().await?)
    }
}
