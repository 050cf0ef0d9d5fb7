/* This file is part of proxyscan
 *
 * Copyright (C) 2020-2026 Dyne.org foundation
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as
 * published by the Free Software Foundation, either version 3 of the
 * License, or (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

// Hello developer. Please add your error to the according subsection
// that is commented, or make a new subsection. Keep it clean.

/// Main result type used throughout the codebase.
pub type Result<T> = std::result::Result<T, Error>;

/// General library errors used throughout the codebase.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    // ==============
    // Address errors
    // ==============
    #[error("Invalid address: {0}")]
    AddressError(String),

    #[error("Unknown probe dialect: {0}")]
    UnknownDialect(String),

    #[error("Invalid scan target: {0}")]
    InvalidScanTarget(String),

    // ===============
    // Endpoint errors
    // ===============
    #[error("Connection failed: {0}")]
    ConnectFailed(String),

    #[error("Timeout Error")]
    Timeout,

    #[error("Socket error: {0}")]
    SocketError(String),

    #[error("Endpoint closed")]
    EndpointClosed,

    #[error("Connection closed by peer")]
    PeerClosed,

    #[error("Unknown endpoint")]
    UnknownEndpoint,

    #[error("Create listener bound to {0} failed")]
    BindFailed(String),

    // ============
    // Probe errors
    // ============
    #[error("Protocol mismatch: {0}")]
    ProtocolMismatch(String),

    #[error("Relay refused the request: {0}")]
    RelayDenied(String),

    #[error("Probe service stopped")]
    ServiceStopped,

    // =============
    // System errors
    // =============
    #[error("IO error: {0:?}")]
    Io(std::io::ErrorKind),

    #[error("Configuration file not found")]
    ConfigNotFound,

    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("SetLogger (log crate) failed: {0}")]
    SetLoggerError(String),
}

impl Error {
    /// Returns `true` for errors raised by an expired endpoint deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.kind())
    }
}

impl From<log::SetLoggerError> for Error {
    fn from(err: log::SetLoggerError) -> Self {
        Self::SetLoggerError(err.to_string())
    }
}

impl<T> From<smol::channel::SendError<T>> for Error {
    fn from(_err: smol::channel::SendError<T>) -> Self {
        Self::ServiceStopped
    }
}

impl<T> From<smol::channel::TrySendError<T>> for Error {
    fn from(_err: smol::channel::TrySendError<T>) -> Self {
        Self::ServiceStopped
    }
}

impl From<smol::channel::RecvError> for Error {
    fn from(_err: smol::channel::RecvError) -> Self {
        Self::ServiceStopped
    }
}
