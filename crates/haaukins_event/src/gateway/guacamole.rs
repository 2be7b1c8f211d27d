// SPDX-License-Identifier: AGPL-3.0-only
// Copyright Authors of haaukins

use crate::gateway::{Gateway, GatewayError, GatewayUser, RdpConnection};
use async_trait::async_trait;
use color_eyre::eyre;
use futures::future::join_all;
use haaukins_common::server::runtime::GatewayConfig;
use haaukins_virtual::container::{Container, ContainerConfig, ContainerRuntime};
use haaukins_virtual::{get_available_port, Closer};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

const ADMIN_USER: &str = "guacadmin";
const DEFAULT_ADMIN_PASSWORD: &str = "guacadmin";
const READY_ATTEMPTS: usize = 120;
const ACTION_ATTEMPTS: usize = 3;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const PERMISSION_DENIED: &str = "Permission Denied.";

#[derive(Deserialize)]
struct TokenResponse {
    #[serde(rename = "authToken", default)]
    auth_token: String,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Deserialize)]
struct MessageResponse {
    #[serde(default)]
    message: Option<String>,
}

#[derive(Deserialize)]
struct ConnectionResponse {
    identifier: String,
}

/// The Guacamole REST API, used with the administrator account.
pub struct GuacamoleClient {
    http: reqwest::Client,
    /// `http://127.0.0.1:<port>/guacamole`
    base: String,
    admin_password: RwLock<String>,
    token: Mutex<Option<String>>,
    retry_delay: Duration,
}

impl GuacamoleClient {
    pub fn new(base: impl Into<String>) -> Result<GuacamoleClient, GatewayError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(GuacamoleClient {
            http,
            base: base.into(),
            admin_password: RwLock::new(DEFAULT_ADMIN_PASSWORD.to_string()),
            token: Mutex::new(None),
            retry_delay: Duration::from_secs(1),
        })
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    async fn post_login(&self, username: &str, password: &str) -> Result<String, GatewayError> {
        let res = self
            .http
            .post(format!("{}/api/tokens", self.base))
            .form(&[("username", username), ("password", password)])
            .send()
            .await?;
        if !res.status().is_success() {
            return Err(GatewayError::UnexpectedStatus(res.status().as_u16()));
        }
        Ok(res.text().await?)
    }

    /// Logs in and returns the raw token document.
    pub async fn raw_login(&self, username: &str, password: &str) -> Result<String, GatewayError> {
        let body = self.post_login(username, password).await?;
        let token: TokenResponse = serde_json::from_str(&body)?;
        match token.message {
            Some(message) if !message.is_empty() => Err(GatewayError::Remote(message)),
            _ if token.auth_token.is_empty() => {
                Err(GatewayError::Remote("empty authentication token".to_string()))
            }
            _ => Ok(body),
        }
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<String, GatewayError> {
        let body = self.raw_login(username, password).await?;
        let token: TokenResponse = serde_json::from_str(&body)?;
        Ok(token.auth_token)
    }

    /// Polls the API with the default administrator credentials until it answers.
    pub async fn wait_ready(&self, attempts: usize) -> Result<(), GatewayError> {
        for attempt in 0..attempts {
            if attempt > 0 {
                tokio::time::sleep(self.retry_delay).await;
            }
            match self.login(ADMIN_USER, DEFAULT_ADMIN_PASSWORD).await {
                Ok(token) => {
                    *self.token.lock().await = Some(token);
                    return Ok(());
                }
                Err(error) => debug!(?error, attempt, "gateway is not ready yet"),
            }
        }
        Err(GatewayError::NotReady)
    }

    pub async fn change_admin_password(&self, new_password: &str) -> Result<(), GatewayError> {
        let old_password = self.admin_password.read().await.clone();
        let url = format!(
            "{}/api/session/data/mysql/users/{ADMIN_USER}/password",
            self.base
        );
        let body = json!({
            "oldPassword": old_password,
            "newPassword": new_password,
        });
        self.auth_action(|token| self.http.put(&url).query(&[("token", token)]).json(&body))
            .await?;
        *self.admin_password.write().await = new_password.to_string();
        Ok(())
    }

    async fn admin_token(&self) -> Result<String, GatewayError> {
        let mut token = self.token.lock().await;
        if let Some(token) = token.as_ref() {
            return Ok(token.clone());
        }
        let password = self.admin_password.read().await.clone();
        let fresh = self.login(ADMIN_USER, &password).await?;
        *token = Some(fresh.clone());
        Ok(fresh)
    }

    async fn forget_token(&self) {
        *self.token.lock().await = None;
    }

    /// Runs an administrator request, logging in again when the session was rejected.
    async fn auth_action<F>(&self, build: F) -> Result<Vec<u8>, GatewayError>
    where
        F: Fn(&str) -> reqwest::RequestBuilder + Send + Sync,
    {
        let mut last_error = GatewayError::NotReady;
        for attempt in 0..ACTION_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(self.retry_delay).await;
            }
            let token = match self.admin_token().await {
                Ok(token) => token,
                Err(error) => {
                    last_error = error;
                    continue;
                }
            };
            let res = match build(&token).send().await {
                Ok(res) => res,
                Err(error) => {
                    last_error = error.into();
                    continue;
                }
            };

            let status = res.status();
            if status == StatusCode::FORBIDDEN {
                self.forget_token().await;
                last_error = GatewayError::UnexpectedStatus(status.as_u16());
                continue;
            }
            if !(200..=302).contains(&status.as_u16()) {
                last_error = GatewayError::UnexpectedStatus(status.as_u16());
                continue;
            }

            let body = res.bytes().await?.to_vec();
            if let Ok(MessageResponse {
                message: Some(message),
            }) = serde_json::from_slice(&body)
            {
                if message == PERMISSION_DENIED {
                    self.forget_token().await;
                    last_error = GatewayError::Remote(message);
                    continue;
                }
                if !message.is_empty() {
                    return Err(GatewayError::Remote(message));
                }
            }
            return Ok(body);
        }
        Err(last_error)
    }

    pub async fn create_user(&self, username: &str, password: &str) -> Result<(), GatewayError> {
        let url = format!("{}/api/session/data/mysql/users", self.base);
        let body = json!({
            "username": username,
            "password": password,
            "attributes": {
                "disabled": "",
                "expired": "",
                "access-window-start": "",
                "access-window-end": "",
                "valid-from": "",
                "valid-until": "",
                "timezone": null,
            },
        });
        self.auth_action(|token| self.http.post(&url).query(&[("token", token)]).json(&body))
            .await?;
        Ok(())
    }

    pub async fn create_rdp_conn(&self, conn: &RdpConnection) -> Result<(), GatewayError> {
        let conn = conn.clone().normalized()?;
        let url = format!("{}/api/session/data/mysql/connections", self.base);
        let body = json!({
            "name": conn.name,
            "parentIdentifier": "ROOT",
            "protocol": "rdp",
            "attributes": {
                "max-connections": conn.max_connections.to_string(),
                "max-connections-per-user": conn.max_connections.to_string(),
            },
            "parameters": {
                "hostname": conn.host,
                "port": conn.port.to_string(),
                "width": conn.width.to_string(),
                "height": conn.height.to_string(),
                "color-depth": conn.color_depth.to_string(),
                "username": conn.username.clone().unwrap_or_default(),
                "password": conn.password.clone().unwrap_or_default(),
                "enable-wallpaper": conn.enable_wallpaper.to_string(),
            },
        });
        let created = self
            .auth_action(|token| self.http.post(&url).query(&[("token", token)]).json(&body))
            .await?;
        let created: ConnectionResponse = serde_json::from_slice(&created)?;

        let url = format!(
            "{}/api/session/data/mysql/users/{}/permissions",
            self.base, conn.gateway_user
        );
        let body = json!([{
            "op": "add",
            "path": format!("/connectionPermissions/{}", created.identifier),
            "value": "READ",
        }]);
        self.auth_action(|token| {
            self.http
                .patch(&url)
                .query(&[("token", token)])
                .json(&body)
        })
        .await?;
        debug!(connection = %conn.name, identifier = %created.identifier, "created rdp connection");
        Ok(())
    }
}

/// A Guacamole deployment of three containers: guacd, its database and the web application.
pub struct Guacamole {
    runtime: Arc<dyn ContainerRuntime>,
    config: GatewayConfig,
    web_port: u16,
    admin_password: String,
    client: GuacamoleClient,
    containers: Mutex<Vec<Container>>,
    ready_attempts: usize,
}

impl Guacamole {
    pub async fn new(
        runtime: Arc<dyn ContainerRuntime>,
        config: GatewayConfig,
    ) -> Result<Guacamole, GatewayError> {
        let web_port = get_available_port().await?;
        Self::with_port(runtime, config, web_port)
    }

    pub fn with_port(
        runtime: Arc<dyn ContainerRuntime>,
        config: GatewayConfig,
        web_port: u16,
    ) -> Result<Guacamole, GatewayError> {
        let admin_password = config
            .admin_password
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
        Ok(Guacamole {
            runtime,
            config,
            web_port,
            admin_password,
            client: GuacamoleClient::new(format!("http://127.0.0.1:{web_port}/guacamole"))?,
            containers: Mutex::new(Vec::new()),
            ready_attempts: READY_ATTEMPTS,
        })
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.client = self.client.with_retry_delay(retry_delay);
        self
    }

    async fn run_container(
        &self,
        config: ContainerConfig,
        alias: &str,
    ) -> Result<(), GatewayError> {
        let container = Container::new(self.runtime.clone(), config);
        let created = container.run().await;
        // Failed containers are kept for close.
        self.containers.lock().await.push(container);
        created?;
        if let Some(container) = self.containers.lock().await.last() {
            container.bridge_alias(alias).await?;
        }
        Ok(())
    }
}

fn labels(role: &str) -> BTreeMap<String, String> {
    BTreeMap::from([("hkn".to_string(), format!("guacamole_{role}"))])
}

fn random_alias() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

#[async_trait]
impl Gateway for Guacamole {
    #[instrument(skip_all, fields(port = self.web_port))]
    async fn start(&self) -> Result<(), GatewayError> {
        let db_password = uuid::Uuid::new_v4().simple().to_string();
        let guacd_alias = random_alias();
        let db_alias = random_alias();

        self.run_container(
            ContainerConfig {
                image: self.config.guacd_image.clone(),
                labels: labels("guacd"),
                use_bridge: true,
                ..Default::default()
            },
            &guacd_alias,
        )
        .await?;

        let database_env = [
            ("MYSQL_DATABASE", "guacamole_db".to_string()),
            ("MYSQL_USER", "guacamole_user".to_string()),
            ("MYSQL_PASSWORD", db_password.clone()),
        ];
        let mut db_env: BTreeMap<String, String> = database_env
            .iter()
            .map(|(key, value)| (key.to_string(), value.clone()))
            .collect();
        db_env.insert(
            "MYSQL_ROOT_PASSWORD".to_string(),
            uuid::Uuid::new_v4().simple().to_string(),
        );
        self.run_container(
            ContainerConfig {
                image: self.config.db_image.clone(),
                env: db_env,
                labels: labels("db"),
                use_bridge: true,
                ..Default::default()
            },
            &db_alias,
        )
        .await?;

        let mut web_env: BTreeMap<String, String> = database_env
            .iter()
            .map(|(key, value)| (key.to_string(), value.clone()))
            .collect();
        web_env.insert("GUACD_HOSTNAME".to_string(), guacd_alias);
        web_env.insert("MYSQL_HOSTNAME".to_string(), db_alias);
        self.run_container(
            ContainerConfig {
                image: self.config.web_image.clone(),
                env: web_env,
                port_bindings: BTreeMap::from([(
                    "8080/tcp".to_string(),
                    format!("127.0.0.1:{}", self.web_port),
                )]),
                labels: labels("web"),
                use_bridge: true,
                ..Default::default()
            },
            &random_alias(),
        )
        .await?;

        self.client.wait_ready(self.ready_attempts).await?;
        self.client
            .change_admin_password(&self.admin_password)
            .await?;
        info!("gateway is ready");
        Ok(())
    }

    async fn create_user(&self, user: &GatewayUser) -> Result<(), GatewayError> {
        self.client
            .create_user(&user.username, &user.password)
            .await
    }

    async fn create_rdp_conn(&self, conn: &RdpConnection) -> Result<(), GatewayError> {
        self.client.create_rdp_conn(conn).await
    }

    async fn raw_login(&self, user: &GatewayUser) -> Result<String, GatewayError> {
        self.client.raw_login(&user.username, &user.password).await
    }

    fn web_port(&self) -> u16 {
        self.web_port
    }
}

#[async_trait]
impl Closer for Guacamole {
    async fn close(&self) -> eyre::Result<()> {
        let containers: Vec<Container> = self.containers.lock().await.drain(..).collect();
        for result in join_all(containers.iter().map(|c| c.remove())).await {
            if let Err(error) = result {
                warn!(?error, "unable to remove gateway container");
            }
        }
        Ok(())
    }
}
