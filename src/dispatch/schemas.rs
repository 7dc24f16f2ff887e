//! Declarative payload schemas: required fields with per-field JSON types,
//! checked before any resolver runs.

use serde_json::Value;

use crate::error::{VfsError, VfsResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Str,
    UInt,
    Bool,
    Object,
}

impl FieldType {
    fn matches(&self, value: &Value) -> bool {
        match self {
            FieldType::Str => value.is_string(),
            FieldType::UInt => value.is_u64(),
            FieldType::Bool => value.is_boolean(),
            FieldType::Object => value.is_object(),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            FieldType::Str => "string",
            FieldType::UInt => "unsigned integer",
            FieldType::Bool => "boolean",
            FieldType::Object => "object",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Field {
    pub name: &'static str,
    pub kind: FieldType,
    pub required: bool,
}

pub const fn required(name: &'static str, kind: FieldType) -> Field {
    Field {
        name,
        kind,
        required: true,
    }
}

pub const fn optional(name: &'static str, kind: FieldType) -> Field {
    Field {
        name,
        kind,
        required: false,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Schema {
    pub fields: &'static [Field],
}

impl Schema {
    pub fn validate(&self, payload: &Value) -> VfsResult<()> {
        if !payload.is_object() {
            return Err(VfsError::InvalidArgument(
                "payload must be a JSON object".to_string(),
            ));
        }

        for field in self.fields {
            match payload.get(field.name) {
                None | Some(Value::Null) => {
                    if field.required {
                        return Err(VfsError::InvalidArgument(format!(
                            "missing field {:?}",
                            field.name
                        )));
                    }
                }
                Some(value) => {
                    if !field.kind.matches(value) {
                        return Err(VfsError::InvalidArgument(format!(
                            "field {:?} must be a {}",
                            field.name,
                            field.kind.name()
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

pub const CONTAINER_CREATE: Schema = Schema {
    fields: &[
        required("container_id", FieldType::Str),
        required("user_id", FieldType::Str),
        required("data_path", FieldType::Str),
        optional("namespace", FieldType::Str),
        optional("labels", FieldType::Object),
        optional("memory_capacity", FieldType::UInt),
        optional("storage_quota", FieldType::UInt),
        optional("max_open_files", FieldType::UInt),
    ],
};

pub const CONTAINER_TARGET: Schema = Schema {
    fields: &[
        required("container_id", FieldType::Str),
        required("user_id", FieldType::Str),
    ],
};

pub const CONTAINER_FILES: Schema = Schema {
    fields: &[
        required("container_id", FieldType::Str),
        required("user_id", FieldType::Str),
        optional("path", FieldType::Str),
    ],
};

pub const FILE_CREATE: Schema = Schema {
    fields: &[
        required("container_id", FieldType::Str),
        required("user_id", FieldType::Str),
        required("path", FieldType::Str),
        required("content", FieldType::Str),
    ],
};

pub const FILE_DELETE: Schema = Schema {
    fields: &[
        required("container_id", FieldType::Str),
        required("user_id", FieldType::Str),
        required("path", FieldType::Str),
    ],
};

pub const SEMANTIC_SEARCH: Schema = Schema {
    fields: &[
        required("container_id", FieldType::Str),
        required("user_id", FieldType::Str),
        required("query", FieldType::Str),
        optional("limit", FieldType::UInt),
    ],
};

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn missing_required_field_is_invalid() {
        let payload = json!({"container_id": "c1", "user_id": "alice"});
        assert!(FILE_CREATE.validate(&payload).is_err());
    }

    #[test]
    fn wrong_type_is_invalid() {
        let payload = json!({
            "container_id": "c1",
            "user_id": "alice",
            "query": 42,
        });
        assert!(SEMANTIC_SEARCH.validate(&payload).is_err());
    }

    #[test]
    fn optional_fields_may_be_absent() {
        let payload = json!({
            "container_id": "c1",
            "user_id": "alice",
            "query": "docs",
        });
        SEMANTIC_SEARCH.validate(&payload).unwrap();
    }

    #[test]
    fn optional_fields_are_still_typed() {
        let payload = json!({
            "container_id": "c1",
            "user_id": "alice",
            "query": "docs",
            "limit": "five",
        });
        assert!(SEMANTIC_SEARCH.validate(&payload).is_err());
    }

    #[test]
    fn non_object_payload_is_invalid() {
        assert!(CONTAINER_TARGET.validate(&json!("nope")).is_err());
    }
}
