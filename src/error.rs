// Copyright 2020 - 2021 Alex Dukhno
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

//! SQLSTATE-carrying error type shared by every layer of the wire protocol.

use std::fmt::{self, Display, Formatter};
use std::io::{self, Write};

use crate::frame::Writer;
use crate::messages;

/// Result alias used across the crate.
pub type WireResult<T> = Result<T, WireError>;

/// Severity that accompanies an `ErrorResponse`/`NoticeResponse`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Fatal,
    Panic,
    Warning,
    Notice,
    Debug,
    Info,
    Log,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Error => "ERROR",
            Severity::Fatal => "FATAL",
            Severity::Panic => "PANIC",
            Severity::Warning => "WARNING",
            Severity::Notice => "NOTICE",
            Severity::Debug => "DEBUG",
            Severity::Info => "INFO",
            Severity::Log => "LOG",
        }
    }
}

/// A single protocol-level error, carrying the Postgres SQLSTATE code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireError {
    pub code: &'static str,
    pub severity: Severity,
    pub message: String,
    pub hint: Option<String>,
    pub detail: Option<String>,
}

impl WireError {
    fn new(code: &'static str, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            code,
            severity,
            message: message.into(),
            hint: None,
            detail: None,
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn protocol_violation(message: impl Into<String>) -> Self {
        Self::new("08P01", Severity::Fatal, message)
    }

    pub fn message_size_exceeded(max: usize, size: usize) -> Self {
        Self::new(
            "54000",
            Severity::Error,
            format!("message of size {} exceeds the maximum of {} bytes", size, max),
        )
    }

    pub fn missing_nul_terminator() -> Self {
        Self::new("XX000", Severity::Fatal, "string argument is missing a NUL terminator")
    }

    pub fn insufficient_data(len: usize) -> Self {
        Self::new(
            "XX000",
            Severity::Fatal,
            format!("expected at least {} more bytes in the message", len),
        )
    }

    pub fn invalid_prepared_statement(name: &str) -> Self {
        Self::new(
            "26000",
            Severity::Error,
            format!("prepared statement \"{}\" does not exist", name),
        )
    }

    pub fn invalid_cursor_name(name: &str) -> Self {
        Self::new("34000", Severity::Error, format!("portal \"{}\" does not exist", name))
    }

    pub fn syntax(message: impl Into<String>) -> Self {
        Self::new("42601", Severity::Error, message)
    }

    pub fn invalid_password() -> Self {
        Self::new(
            "28P01",
            Severity::Fatal,
            "password authentication failed",
        )
    }

    pub fn feature_not_supported(message: impl Into<String>) -> Self {
        Self::new("0A000", Severity::Error, message)
    }

    pub fn query_canceled() -> Self {
        Self::new("57014", Severity::Error, "canceling statement due to user request")
    }

    pub fn bad_copy_file_format(message: impl Into<String>) -> Self {
        Self::new("22P04", Severity::Error, message)
    }

    pub fn uncategorized(message: impl Into<String>) -> Self {
        Self::new("XXUUU", Severity::Error, message)
    }

    pub fn handler_panicked() -> Self {
        Self::new("XX000", Severity::Error, "panic during execution of a query handler")
    }

    pub fn io(err: &io::Error) -> Self {
        Self::new("08006", Severity::Fatal, format!("connection error: {}", err))
    }

    /// Most-specific-wins combination used when the same batch produces more than
    /// one error (e.g. closing a connection while an error was already queued).
    /// `XX*` internal codes always dominate the outer code.
    pub fn combine_codes(outer: WireError, inner: WireError) -> WireError {
        if inner.code.starts_with("XX") {
            inner
        } else {
            outer
        }
    }
}

/// Writes an `ErrorResponse` ('E') or `NoticeResponse` ('N') frame for `err`.
pub fn write_error_response<W: Write>(out: &mut W, writer: &mut Writer, tag: u8, err: &WireError) -> io::Result<()> {
    writer.start(tag);
    writer.byte(messages::FIELD_SEVERITY).cstr(err.severity.as_str());
    writer.byte(messages::FIELD_CODE).cstr(err.code);
    writer.byte(messages::FIELD_MESSAGE).cstr(&err.message);
    if let Some(hint) = &err.hint {
        writer.byte(messages::FIELD_HINT).cstr(hint);
    }
    if let Some(detail) = &err.detail {
        writer.byte(messages::FIELD_DETAIL).cstr(detail);
    }
    writer.byte(0);
    writer.end(out)
}

impl Display for WireError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.severity.as_str(), self.code, self.message)
    }
}

impl std::error::Error for WireError {}

impl From<io::Error> for WireError {
    fn from(err: io::Error) -> Self {
        match err.get_ref().and_then(|e| e.downcast_ref::<WireError>()) {
            Some(inner) => inner.clone(),
            None => WireError::io(&err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xx_code_dominates_combination() {
        let outer = WireError::syntax("outer");
        let inner = WireError::handler_panicked();
        let combined = WireError::combine_codes(outer, inner.clone());
        assert_eq!(combined.code, inner.code);
    }

    #[test]
    fn non_xx_inner_keeps_outer() {
        let outer = WireError::syntax("outer");
        let inner = WireError::invalid_cursor_name("p1");
        let combined = WireError::combine_codes(outer.clone(), inner);
        assert_eq!(combined.code, outer.code);
    }
}
