//! Declarative parameter validation.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON type a parameter must have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
    Any,
}

impl ParamType {
    fn matches(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Boolean => value.is_boolean(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
            Self::Any => true,
        }
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
            Self::Object => "object",
            Self::Array => "array",
            Self::Any => "any",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamField {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: ParamType,
    #[serde(default)]
    pub required: bool,
}

/// Expected shape of a command's parameters object.
///
/// An empty schema accepts any parameters. A non-empty schema requires the
/// parameters to be a JSON object; undeclared keys are allowed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterSchema {
    pub fields: Vec<ParamField>,
}

impl ParameterSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn required(mut self, name: impl Into<String>, ty: ParamType) -> Self {
        self.fields.push(ParamField {
            name: name.into(),
            ty,
            required: true,
        });
        self
    }

    pub fn optional(mut self, name: impl Into<String>, ty: ParamType) -> Self {
        self.fields.push(ParamField {
            name: name.into(),
            ty,
            required: false,
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Check `parameters`, returning a reason naming the first bad field.
    pub fn validate(&self, parameters: &Value) -> Result<(), String> {
        if self.fields.is_empty() {
            return Ok(());
        }
        let Some(object) = parameters.as_object() else {
            return Err("Parameters must be an object".to_string());
        };

        for field in &self.fields {
            match object.get(&field.name) {
                None | Some(Value::Null) if field.required => {
                    return Err(format!("Missing required parameter '{}'", field.name));
                }
                None | Some(Value::Null) => {}
                Some(value) if !field.ty.matches(value) => {
                    return Err(format!(
                        "Parameter '{}' must be of type {}",
                        field.name, field.ty
                    ));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}
