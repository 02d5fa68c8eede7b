use serde::{Deserialize, Serialize};

use crate::error::{DataTreeError, DataTreeResult};

/// Declared type of a single field.
///
/// Primitive names are lowercase; anything else is a reference to another
/// configured type, optionally suffixed with `[]` to mark an array of
/// references. The string form is what schemas persist and what callers
/// write when declaring fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum FieldType {
    String,
    Boolean,
    Number,
    Date,
    /// A nested plain object described by the owning field's child schemas.
    Object,
    /// A single reference to a record of the named type.
    Reference(String),
    /// An array of references to records of the named type.
    ReferenceArray(String),
}

impl FieldType {
    /// Parses the declared string form of a field type.
    pub fn parse(declared: &str) -> DataTreeResult<Self> {
        match declared {
            "string" => Ok(Self::String),
            "boolean" => Ok(Self::Boolean),
            "number" => Ok(Self::Number),
            "date" => Ok(Self::Date),
            "object" => Ok(Self::Object),
            "" => Err(DataTreeError::Validation(
                "field type cannot be empty".to_string(),
            )),
            other => {
                if let Some(name) = other.strip_suffix("[]") {
                    if name.is_empty() {
                        return Err(DataTreeError::Validation(
                            "array field type is missing the referenced type name".to_string(),
                        ));
                    }
                    Ok(Self::ReferenceArray(name.to_string()))
                } else {
                    Ok(Self::Reference(other.to_string()))
                }
            }
        }
    }

    /// The type name a reference (or array of references) points at.
    pub fn referenced_type(&self) -> Option<&str> {
        match self {
            Self::Reference(name) | Self::ReferenceArray(name) => Some(name),
            _ => None,
        }
    }

    pub fn is_reference(&self) -> bool {
        matches!(self, Self::Reference(_) | Self::ReferenceArray(_))
    }
}

impl TryFrom<String> for FieldType {
    type Error = DataTreeError;

    fn try_from(value: String) -> DataTreeResult<Self> {
        Self::parse(&value)
    }
}

impl From<FieldType> for String {
    fn from(value: FieldType) -> Self {
        match value {
            FieldType::String => "string".to_string(),
            FieldType::Boolean => "boolean".to_string(),
            FieldType::Number => "number".to_string(),
            FieldType::Date => "date".to_string(),
            FieldType::Object => "object".to_string(),
            FieldType::Reference(name) => name,
            FieldType::ReferenceArray(name) => format!("{}[]", name),
        }
    }
}

/// Definition of one field of a type: declared type, required-ness, cascade
/// policy, storage path override, and (for `object` fields) the nested shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSchema {
    pub name: String,
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
    /// Meaningful only on reference fields: soft-deleting the owning record
    /// also soft-deletes the records this field points at.
    #[serde(default)]
    pub cascade_delete: bool,
    /// Where the field's value is written, relative to the record location.
    /// Defaults to the field name; may contain `/` separators to nest under
    /// sub-keys.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_path: Option<String>,
    /// Child field schemas, present only when `field_type` is `Object`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<FieldSchema>,
}

impl FieldSchema {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: false,
            cascade_delete: false,
            storage_path: None,
            children: Vec::new(),
        }
    }

    /// Convenience constructor taking the declared string form of the type.
    pub fn declared(name: impl Into<String>, declared: &str) -> DataTreeResult<Self> {
        Ok(Self::new(name, FieldType::parse(declared)?))
    }

    #[must_use]
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    #[must_use]
    pub fn cascade_delete(mut self) -> Self {
        self.cascade_delete = true;
        self
    }

    #[must_use]
    pub fn with_storage_path(mut self, path: impl Into<String>) -> Self {
        self.storage_path = Some(path.into());
        self
    }

    #[must_use]
    pub fn with_children(mut self, children: Vec<FieldSchema>) -> Self {
        self.children = children;
        self
    }

    /// The path this field is stored under, relative to the record location.
    pub fn storage_path(&self) -> &str {
        self.storage_path.as_deref().unwrap_or(&self.name)
    }
}

/// Named definition of a record type: an ordered list of field schemas plus
/// an optional storage path override for the type as a whole.
///
/// Declaration order is preserved for deterministic persistence; it carries
/// no other meaning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypeSchema {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_path: Option<String>,
    pub fields: Vec<FieldSchema>,
}

impl TypeSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            storage_path: None,
            fields: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_storage_path(mut self, path: impl Into<String>) -> Self {
        self.storage_path = Some(path.into());
        self
    }

    #[must_use]
    pub fn with_field(mut self, field: FieldSchema) -> Self {
        self.fields.push(field);
        self
    }

    /// The location records of this type live under. Defaults to the type
    /// name itself.
    pub fn storage_path(&self) -> &str {
        self.storage_path.as_deref().unwrap_or(&self.name)
    }

    /// Looks up a field schema by field name.
    pub fn field(&self, name: &str) -> Option<&FieldSchema> {
        self.fields.iter().find(|f| f.name == name)
    }
}
