// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

extern crate config as _;

use std::path::Path;
use std::time::Duration;

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

use super::{AppError, AppResult};

pub static GLOBAL_CONFIG: OnceCell<AppConfig> = OnceCell::new();

/// Returns the process wide configuration, falling back to defaults when
/// the binary did not install one (library users and tests).
pub fn global_config() -> &'static AppConfig {
    GLOBAL_CONFIG.get_or_init(AppConfig::default)
}

/// How completed packets and connection events reach application code.
#[derive(Debug, Default, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// events are queued and delivered from `NetworkManager::update`
    #[default]
    Queued,
    /// events are delivered on the poller thread that produced them
    Immediate,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct NetworkConfig {
    /// size of the per connection temporary receive buffer
    pub receive_buffer_size: usize,
    /// declared payload lengths above this disconnect the peer
    pub max_packet_size: u32,
    pub dispatch_mode: DispatchMode,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            receive_buffer_size: 5 * 1024 * 1024,
            max_packet_size: 0x00A0_0000,
            dispatch_mode: DispatchMode::Queued,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct PollerConfig {
    /// 0 means the platform `FD_SETSIZE`
    pub max_sockets_per_thread: usize,
    pub poll_timeout_ms: u64,
    pub connect_timeout_ms: u64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        PollerConfig {
            max_sockets_per_thread: 0,
            poll_timeout_ms: 2000,
            connect_timeout_ms: 10_000,
        }
    }
}

impl PollerConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn socket_capacity(&self) -> usize {
        if self.max_sockets_per_thread == 0 {
            libc::FD_SETSIZE as usize
        } else {
            self.max_sockets_per_thread
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ConnectionConfig {
    pub auto_reconnect: bool,
    pub reconnect_delay_ms: u64,
    pub queue_while_disconnected: bool,
    pub discard_queue_on_disconnect: bool,
    /// 0 disables the backlog callback
    pub backlog_threshold: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            auto_reconnect: false,
            reconnect_delay_ms: 5000,
            queue_while_disconnected: true,
            discard_queue_on_disconnect: false,
            backlog_threshold: 0,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub ip: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            ip: "ANY".to_string(),
            port: 9090,
        }
    }
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    pub network: NetworkConfig,
    pub poller: PollerConfig,
    pub connection: ConnectionConfig,
    pub server: ServerConfig,
}

impl AppConfig {
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<AppConfig> {
        let path_str = path
            .as_ref()
            .to_str()
            .ok_or(AppError::InvalidValue(format!(
                "config file path: {}",
                path.as_ref().to_string_lossy()
            )))?;
        let config = config::Config::builder()
            .add_source(config::File::with_name(path_str))
            .build()?;

        let app_config: AppConfig = config.try_deserialize()?;
        if app_config.network.receive_buffer_size == 0 {
            return Err(AppError::InvalidValue(
                "network.receive_buffer_size must be greater than 0".to_string(),
            ));
        }

        Ok(app_config)
    }
}
