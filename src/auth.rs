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

//! Authentication strategies offered during the handshake.

use std::sync::Arc;

/// Validates a cleartext password against `(database, user, password)`.
pub trait PasswordValidator: Send + Sync {
    fn validate(&self, database: &str, user: &str, password: &str) -> bool;
}

impl<F> PasswordValidator for F
where
    F: Fn(&str, &str, &str) -> bool + Send + Sync,
{
    fn validate(&self, database: &str, user: &str, password: &str) -> bool {
        (self)(database, user, password)
    }
}

/// Authentication policy applied to every new connection.
#[derive(Clone)]
pub enum AuthStrategy {
    /// No credentials requested; every connection is accepted (the teacher's
    /// `wire_protocol` crate default behavior).
    Ok,
    /// Request a cleartext password and check it with the supplied validator.
    CleartextPassword(Arc<dyn PasswordValidator>),
}

impl Default for AuthStrategy {
    fn default() -> Self {
        AuthStrategy::Ok
    }
}

impl std::fmt::Debug for AuthStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthStrategy::Ok => write!(f, "AuthStrategy::Ok"),
            AuthStrategy::CleartextPassword(_) => write!(f, "AuthStrategy::CleartextPassword(..)"),
        }
    }
}
