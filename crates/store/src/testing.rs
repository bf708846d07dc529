use std::sync::Arc;

use mirra_core::Resource;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Obj {
    pub ns: String,
    pub name: String,
    pub rv: String,
}

impl Resource for Obj {
    fn namespace(&self) -> Option<&str> { Some(&self.ns) }
    fn name(&self) -> Option<&str> { Some(&self.name) }
    fn resource_version(&self) -> Option<&str> { Some(&self.rv) }
}

pub fn obj(ns: &str, name: &str, rv: &str) -> Arc<Obj> {
    Arc::new(Obj { ns: ns.to_string(), name: name.to_string(), rv: rv.to_string() })
}
