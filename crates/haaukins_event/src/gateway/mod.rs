// SPDX-License-Identifier: AGPL-3.0-only
// Copyright Authors of haaukins

//! The browser-facing RDP gateway of an event.

mod guacamole;

pub use guacamole::{Guacamole, GuacamoleClient};

use async_trait::async_trait;
use dashmap::DashMap;
use haaukins_virtual::{Closer, VirtualError};
use std::sync::Arc;

#[derive(thiserror::Error, Debug)]
pub enum GatewayError {
    #[error(transparent)]
    Virtual(#[from] VirtualError),
    #[error("gateway request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unable to decode gateway response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("unexpected status code {0}")]
    UnexpectedStatus(u16),
    #[error("gateway error: {0}")]
    Remote(String),
    #[error("gateway did not become ready in time")]
    NotReady,
    #[error("host is missing")]
    NoHost,
    #[error("port is missing")]
    NoPort,
    #[error("name is missing")]
    NoName,
    #[error("color depth can only be a multiple of 8 up to 32")]
    InvalidColorDepth,
    #[error("team {0} has no gateway user")]
    UnknownUser(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayUser {
    pub username: String,
    pub password: String,
}

/// An RDP connection offered to a gateway user. Zero values take the defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RdpConnection {
    pub name: String,
    pub host: String,
    pub port: u16,
    /// The gateway user allowed to open the connection
    pub gateway_user: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub width: u32,
    pub height: u32,
    pub max_connections: u32,
    pub color_depth: u32,
    pub enable_wallpaper: bool,
}

impl RdpConnection {
    pub fn normalized(mut self) -> Result<RdpConnection, GatewayError> {
        if self.host.is_empty() {
            return Err(GatewayError::NoHost);
        }
        if self.port == 0 {
            return Err(GatewayError::NoPort);
        }
        if self.name.is_empty() {
            return Err(GatewayError::NoName);
        }
        if self.width == 0 || self.height == 0 {
            self.width = 1920;
            self.height = 1080;
        }
        if self.max_connections == 0 {
            self.max_connections = 10;
        }
        match self.color_depth {
            0 => self.color_depth = 16,
            depth if depth % 8 != 0 || depth > 32 => return Err(GatewayError::InvalidColorDepth),
            _ => {}
        }
        Ok(self)
    }
}

#[async_trait]
pub trait Gateway: Closer {
    async fn start(&self) -> Result<(), GatewayError>;
    async fn create_user(&self, user: &GatewayUser) -> Result<(), GatewayError>;
    async fn create_rdp_conn(&self, conn: &RdpConnection) -> Result<(), GatewayError>;
    /// Logs `user` in and returns the raw token document the gateway's web client expects.
    async fn raw_login(&self, user: &GatewayUser) -> Result<String, GatewayError>;
    /// The local port of the gateway's web application.
    fn web_port(&self) -> u16;
}

/// Gateway users by team id.
#[derive(Clone, Default)]
pub struct GatewayUserStore {
    users: Arc<DashMap<String, GatewayUser>>,
}

impl GatewayUserStore {
    pub fn create_user_for_team(&self, team_id: &str, user: GatewayUser) {
        self.users.insert(team_id.to_string(), user);
    }

    pub fn get_user_for_team(&self, team_id: &str) -> Result<GatewayUser, GatewayError> {
        self.users
            .get(team_id)
            .map(|user| user.value().clone())
            .ok_or_else(|| GatewayError::UnknownUser(team_id.to_string()))
    }
}
