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

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// general errors
    #[error("illegal state: {0}")]
    IllegalStateError(String),

    #[error("malformed protocol : {0}")]
    MalformedProtocol(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("I/O error: {0}")]
    DetailedIoError(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("config file error: {0}")]
    ConfigFileError(#[from] config::ConfigError),

    #[error("tracing setup error: {0}")]
    TracingError(String),

    /// connection details errors
    #[error("invalid connection details: {0}")]
    InvalidConnectionDetails(String),

    #[error("unsupported connection type: {0}")]
    UnsupportedConnectionType(String),

    #[error("unable to resolve address: {0}")]
    AddressResolution(String),

    /// packet errors
    #[error("packet type {0:#010x} is reserved")]
    ReservedPacketType(u32),

    #[error("packet too large: {0}")]
    PacketTooLarge(String),
}

impl From<tracing_subscriber::util::TryInitError> for AppError {
    fn from(value: tracing_subscriber::util::TryInitError) -> Self {
        AppError::TracingError(value.to_string())
    }
}
