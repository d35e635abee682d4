use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Client for the panel's helper API. Authorization is entirely delegated:
/// the agent asks, the panel decides. Any transport failure or non-2xx
/// answer counts as a denial.
#[derive(Clone)]
pub struct RemoteClient {
    base: String,
    token: String,
    http: reqwest::Client,
    /// The SFTP credential channel tolerates self-signed panels.
    insecure: reqwest::Client,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AdminRequest<'a> {
    token: &'a str,
    user_uuid: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AdminResponse {
    is_admin: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PermissionRequest<'a> {
    token: &'a str,
    user_uuid: &'a str,
    server_uuid: &'a str,
}

#[derive(Debug, Deserialize)]
struct PermissionResponse {
    permission: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VerifySftpRequest<'a> {
    token: &'a str,
    user_name: &'a str,
    password: &'a str,
    server_uuid: &'a str,
}

#[derive(Debug, Deserialize)]
pub struct PortsResponse {
    pub port: u16,
    pub sftp: u16,
    #[serde(default)]
    pub ssl: bool,
}

fn helper_url(base: &str, endpoint: &str) -> String {
    format!("{}/api/nodes/helper/{endpoint}", base.trim_end_matches('/'))
}

impl RemoteClient {
    pub fn new(base: impl Into<String>, token: impl Into<String>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("build helper http client")?;
        let insecure = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .danger_accept_invalid_certs(true)
            .build()
            .context("build sftp verification client")?;
        Ok(Self {
            base: base.into(),
            token: token.into(),
            http,
            insecure,
        })
    }

    async fn post_json<B: Serialize, R: for<'de> Deserialize<'de>>(
        client: &reqwest::Client,
        url: &str,
        body: &B,
    ) -> anyhow::Result<R> {
        let response = client
            .post(url)
            .json(body)
            .send()
            .await
            .with_context(|| format!("POST {url}"))?
            .error_for_status()
            .with_context(|| format!("POST {url}"))?;
        response.json().await.with_context(|| format!("decode {url}"))
    }

    pub async fn is_admin(&self, user_uuid: &str) -> bool {
        let url = helper_url(&self.base, "admin-permission");
        let body = AdminRequest {
            token: &self.token,
            user_uuid,
        };
        match Self::post_json::<_, AdminResponse>(&self.http, &url, &body).await {
            Ok(resp) => resp.is_admin,
            Err(err) => {
                tracing::warn!(%err, "admin permission check failed; denying");
                false
            }
        }
    }

    pub async fn has_permission(&self, user_uuid: &str, server_uuid: &str) -> bool {
        let url = helper_url(&self.base, "permission");
        let body = PermissionRequest {
            token: &self.token,
            user_uuid,
            server_uuid,
        };
        match Self::post_json::<_, PermissionResponse>(&self.http, &url, &body).await {
            Ok(resp) => resp.permission,
            Err(err) => {
                tracing::warn!(%err, "permission check failed; denying");
                false
            }
        }
    }

    pub async fn verify_sftp(&self, user_name: &str, password: &str, server_uuid: &str) -> bool {
        let url = helper_url(&self.base, "verify-sftp");
        let body = VerifySftpRequest {
            token: &self.token,
            user_name,
            password,
            server_uuid,
        };
        match Self::post_json::<_, PermissionResponse>(&self.insecure, &url, &body).await {
            Ok(resp) => resp.permission,
            Err(err) => {
                tracing::warn!(%err, "sftp verification failed; denying");
                false
            }
        }
    }
}

/// Configure-time exchange: asks the panel which ports this node owns.
pub async fn fetch_ports(base: &str, uuid: &str, token: &str) -> anyhow::Result<PortsResponse> {
    #[derive(Serialize)]
    struct FetchPortsRequest<'a> {
        uuid: &'a str,
        token: &'a str,
    }

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .context("build configure http client")?;
    let url = helper_url(base, "fetch-ports");
    RemoteClient::post_json(&client, &url, &FetchPortsRequest { uuid, token }).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn helper_urls_are_rooted_at_the_panel() {
        assert_eq!(
            helper_url("https://panel.example", "permission"),
            "https://panel.example/api/nodes/helper/permission"
        );
        assert_eq!(
            helper_url("https://panel.example/", "fetch-ports"),
            "https://panel.example/api/nodes/helper/fetch-ports"
        );
    }
}
