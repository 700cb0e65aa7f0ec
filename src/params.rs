//! Module parameters: tagged integer values with access groups

use crate::error::{ModuleError, ModuleResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Type tag of a parameter value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ParamType::U8 => "u8",
            ParamType::U16 => "u16",
            ParamType::U32 => "u32",
            ParamType::U64 => "u64",
            ParamType::I8 => "i8",
            ParamType::I16 => "i16",
            ParamType::I32 => "i32",
            ParamType::I64 => "i64",
        };
        write!(f, "{}", name)
    }
}

/// Access group for one side (read or write) of a parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ParamAccess {
    /// Accessible from anywhere
    Public,
    /// Accessible from instances holding a dependency on the owner
    Dependency,
    /// Accessible only from the owning instance
    #[default]
    Private,
}

/// Relationship of a caller to the parameter's owning instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AccessClass {
    /// The owning instance itself
    Owner,
    /// An instance holding a dependency edge to the owner
    Dependent,
    /// Anyone else
    Foreign,
}

impl ParamAccess {
    fn permits(self, class: AccessClass) -> bool {
        match self {
            ParamAccess::Public => true,
            ParamAccess::Dependency => matches!(class, AccessClass::Owner | AccessClass::Dependent),
            ParamAccess::Private => matches!(class, AccessClass::Owner),
        }
    }
}

/// A typed parameter value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamValue {
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
}

impl ParamValue {
    /// The value's type tag
    pub fn param_type(&self) -> ParamType {
        match self {
            ParamValue::U8(_) => ParamType::U8,
            ParamValue::U16(_) => ParamType::U16,
            ParamValue::U32(_) => ParamType::U32,
            ParamValue::U64(_) => ParamType::U64,
            ParamValue::I8(_) => ParamType::I8,
            ParamValue::I16(_) => ParamType::I16,
            ParamValue::I32(_) => ParamType::I32,
            ParamValue::I64(_) => ParamType::I64,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::U8(v) => write!(f, "{}", v),
            ParamValue::U16(v) => write!(f, "{}", v),
            ParamValue::U32(v) => write!(f, "{}", v),
            ParamValue::U64(v) => write!(f, "{}", v),
            ParamValue::I8(v) => write!(f, "{}", v),
            ParamValue::I16(v) => write!(f, "{}", v),
            ParamValue::I32(v) => write!(f, "{}", v),
            ParamValue::I64(v) => write!(f, "{}", v),
        }
    }
}

/// Parameter declaration carried by a module export
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterDecl {
    /// Parameter name, unique within the module
    pub name: String,
    /// Read access group
    pub read: ParamAccess,
    /// Write access group
    pub write: ParamAccess,
    /// Default installed at load time
    pub default: ParamValue,
}

impl ParameterDecl {
    /// Convenience constructor
    pub fn new(
        name: impl Into<String>,
        read: ParamAccess,
        write: ParamAccess,
        default: ParamValue,
    ) -> Self {
        Self {
            name: name.into(),
            read,
            write,
            default,
        }
    }
}

struct Parameter {
    ty: ParamType,
    read: ParamAccess,
    write: ParamAccess,
    value: Mutex<ParamValue>,
}

/// Live parameter storage of one instance
pub(crate) struct ParamTable {
    owner: String,
    params: HashMap<String, Parameter>,
}

impl ParamTable {
    pub(crate) fn new(owner: &str, decls: &[ParameterDecl]) -> Self {
        let params = decls
            .iter()
            .map(|decl| {
                (
                    decl.name.clone(),
                    Parameter {
                        ty: decl.default.param_type(),
                        read: decl.read,
                        write: decl.write,
                        value: Mutex::new(decl.default),
                    },
                )
            })
            .collect();
        Self {
            owner: owner.to_string(),
            params,
        }
    }

    fn get(&self, name: &str) -> ModuleResult<&Parameter> {
        self.params
            .get(name)
            .ok_or_else(|| ModuleError::ParameterNotFound {
                module: self.owner.clone(),
                param: name.to_string(),
            })
    }

    pub(crate) fn read(&self, name: &str, class: AccessClass) -> ModuleResult<ParamValue> {
        let param = self.get(name)?;
        if !param.read.permits(class) {
            return Err(ModuleError::AccessDenied(format!(
                "read of parameter '{}' on module {}",
                name, self.owner
            )));
        }
        Ok(*param.value.lock())
    }

    pub(crate) fn write(
        &self,
        name: &str,
        value: ParamValue,
        class: AccessClass,
    ) -> ModuleResult<()> {
        let param = self.get(name)?;
        if !param.write.permits(class) {
            return Err(ModuleError::AccessDenied(format!(
                "write of parameter '{}' on module {}",
                name, self.owner
            )));
        }
        if value.param_type() != param.ty {
            return Err(ModuleError::ParameterTypeMismatch {
                param: name.to_string(),
                expected: param.ty.to_string(),
                requested: value.param_type().to_string(),
            });
        }
        *param.value.lock() = value;
        Ok(())
    }
}
