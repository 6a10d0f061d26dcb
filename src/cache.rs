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

//! Statement and portal caches, keyed by name (the empty name is the
//! "unnamed" slot, silently overwritten by each Parse/Bind).

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

use crate::column::{Columns, FormatCode};
use crate::engine::{DataWriter, Handler};
use crate::error::WireError;
use crate::types::Parameter;

/// A parsed, cacheable query, as returned by the application's parse callback.
pub struct Statement {
    pub handler: Arc<Handler>,
    pub parameter_oids: Vec<i32>,
    pub columns: Columns,
}

impl Statement {
    pub fn new(handler: Arc<Handler>, parameter_oids: Vec<i32>, columns: Columns) -> Self {
        Self {
            handler,
            parameter_oids,
            columns,
        }
    }
}

/// A bound statement, ready for Execute.
pub struct Portal {
    pub statement: Arc<Statement>,
    pub params: Vec<Parameter>,
    pub result_formats: Vec<FormatCode>,
}

/// Named storage for prepared statements.
pub trait StatementCache: Send + Sync {
    fn set(&self, name: String, statement: Statement);
    fn get(&self, name: &str) -> Option<Arc<Statement>>;
    fn close(&self, name: &str);
}

/// Named storage for bound portals.
pub trait PortalCache: Send + Sync {
    fn bind(&self, name: String, statement: Arc<Statement>, params: Vec<Parameter>, result_formats: Vec<FormatCode>);
    fn get(&self, name: &str) -> Option<Arc<Portal>>;
    fn close(&self, name: &str);

    /// Invokes the portal's handler synchronously against a live writer,
    /// recovering from a handler panic as a fatal internal error.
    fn execute(&self, name: &str, writer: &mut dyn DataWriter) -> Result<(), WireError> {
        let portal = self.get(name).ok_or_else(|| WireError::invalid_cursor_name(name))?;
        let handler = Arc::clone(&portal.statement.handler);
        let params = portal.params.clone();
        catch_unwind(AssertUnwindSafe(|| (handler)(writer, &params)))
            .unwrap_or_else(|_| Err(WireError::handler_panicked()))
    }
}

/// `RwLock<HashMap<..>>`-backed default, mirroring the teacher's in-memory
/// catalog stores.
#[derive(Default)]
pub struct InMemoryStatementCache {
    statements: RwLock<HashMap<String, Arc<Statement>>>,
}

impl StatementCache for InMemoryStatementCache {
    fn set(&self, name: String, statement: Statement) {
        self.statements.write().expect("to acquire write lock").insert(name, Arc::new(statement));
    }

    fn get(&self, name: &str) -> Option<Arc<Statement>> {
        self.statements.read().expect("to acquire read lock").get(name).cloned()
    }

    fn close(&self, name: &str) {
        self.statements.write().expect("to acquire write lock").remove(name);
    }
}

#[derive(Default)]
pub struct InMemoryPortalCache {
    portals: RwLock<HashMap<String, Arc<Portal>>>,
}

impl PortalCache for InMemoryPortalCache {
    fn bind(&self, name: String, statement: Arc<Statement>, params: Vec<Parameter>, result_formats: Vec<FormatCode>) {
        self.portals.write().expect("to acquire write lock").insert(
            name,
            Arc::new(Portal {
                statement,
                params,
                result_formats,
            }),
        );
    }

    fn get(&self, name: &str) -> Option<Arc<Portal>> {
        self.portals.read().expect("to acquire read lock").get(name).cloned()
    }

    fn close(&self, name: &str) {
        self.portals.write().expect("to acquire write lock").remove(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::column::Column;
    use crate::types::{BuiltinTypeMap, Value};

    fn handler() -> Arc<Handler> {
        Arc::new(|writer: &mut dyn DataWriter, _: &[Parameter]| {
            writer.row(vec![Value::Int32(1)])?;
            writer.complete("SELECT 1")
        })
    }

    #[test]
    fn unnamed_statement_is_overwritten() {
        let cache = InMemoryStatementCache::default();
        cache.set(String::new(), Statement::new(handler(), vec![], Columns::new(vec![Column::new("n", 23, 4)])));
        assert_eq!(cache.get("").unwrap().columns.len(), 1);
        cache.set(String::new(), Statement::new(handler(), vec![], Columns::default()));
        assert_eq!(cache.get("").unwrap().columns.len(), 0);
    }

    #[test]
    fn portal_keeps_statement_alive_after_cache_replacement() {
        let statements = InMemoryStatementCache::default();
        let portals = InMemoryPortalCache::default();
        statements.set("s1".into(), Statement::new(handler(), vec![], Columns::default()));
        let stmt = statements.get("s1").unwrap();
        portals.bind("p1".into(), Arc::clone(&stmt), vec![], vec![]);
        statements.set("s1".into(), Statement::new(handler(), vec![], Columns::default()));

        assert!(portals.get("p1").is_some());
        let _ = Value::Null;
    }

    #[test]
    fn missing_portal_is_invalid_cursor() {
        let portals = InMemoryPortalCache::default();
        let columns = Columns::default();
        let type_map: Arc<dyn crate::types::TypeMap> = Arc::new(BuiltinTypeMap::default());
        let socket = crate::test_support::DuplexSocket::pair().0;
        let mut reader = crate::frame::Reader::new(socket);
        let mut writer = crate::engine::LiveDataWriter::new(&mut reader, &columns, &[], type_map);
        let err = portals.execute("absent", &mut writer).unwrap_err();
        assert_eq!(err.code, "34000");
    }
}
