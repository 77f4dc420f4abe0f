//! Built-in JSON schemas (draft-07).
//!
//! The branch property definitions are shared between the schemas, so they
//! are assembled from one fragment table instead of `$ref`s across schema
//! files.

use std::fmt::Write as _;

use jsonschema::Validator;
use once_cell::sync::Lazy;
use serde_json::{json, Value};

use crate::{ConfigError, Result};

/// The available schema resources.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Schema {
    /// Configuration accepted when creating a branch.
    BranchConfig,
    /// Property definitions shared by the other branch schemas.
    BranchProperties,
    /// Information about a remote branch.
    RemoteBranchInfo,
    /// Information about the local branch.
    LocalBranchInfo,
    /// Payload of a branch event.
    BranchEvent,
}

fn property(name: &str) -> Value {
    let props = branch_properties();
    props[name].clone()
}

fn branch_properties() -> Value {
    json!({
        "uuid": {
            "description": "UUID of the branch",
            "type": "string"
        },
        "name": {
            "description": "Name of the branch",
            "type": "string"
        },
        "description": {
            "description": "Description of the branch",
            "type": "string"
        },
        "network_name": {
            "description": "Name of the network to join",
            "type": "string"
        },
        "network_password": {
            "description": "Password for the network",
            "type": "string"
        },
        "path": {
            "description": "Path of the branch in the virtual terminal tree",
            "type": "string",
            "pattern": "^/.+$"
        },
        "hostname": {
            "description": "Name of the host the branch is running on",
            "type": "string"
        },
        "pid": {
            "description": "Process ID",
            "type": "integer"
        },
        "advertising_interfaces": {
            "description": "Network interfaces to use for advertising",
            "type": "array",
            "items": { "type": "string" },
            "minItems": 1
        },
        "advertising_address": {
            "description": "Multicast address to use for advertising",
            "type": "string",
            "minLength": 1
        },
        "advertising_port": {
            "description": "Port to use for advertising",
            "type": "integer",
            "minimum": 1,
            "maximum": 65535
        },
        "advertising_interval": {
            "description": "Time between advertising messages in seconds; null for infinity",
            "anyOf": [
                { "type": "null" },
                { "type": "number", "minimum": 0.001 }
            ]
        },
        "timeout": {
            "description": "Connection timeout in seconds; null for infinity",
            "anyOf": [
                { "type": "null" },
                { "type": "number", "minimum": 0.001 }
            ]
        },
        "ghost_mode": {
            "description": "Observe the network without joining it",
            "type": "boolean"
        },
        "tcp_server_address": {
            "description": "Address of the branch's TCP server",
            "type": "string"
        },
        "tcp_server_port": {
            "description": "Port of the branch's TCP server",
            "type": "integer",
            "minimum": 1,
            "maximum": 65535
        },
        "start_time": {
            "description": "Time when the branch was started",
            "type": "string"
        },
        "tx_queue_size": {
            "description": "Size of the send queue per remote branch",
            "type": "integer",
            "minimum": 35000,
            "maximum": 10000000
        },
        "rx_queue_size": {
            "description": "Size of the receive queue per remote branch",
            "type": "integer",
            "minimum": 35000,
            "maximum": 10000000
        }
    })
}

fn schema_json(schema: Schema) -> Value {
    match schema {
        Schema::BranchProperties => json!({
            "$schema": "http://json-schema.org/draft-07/schema#",
            "title": "Branch properties",
            "type": "object",
            "properties": branch_properties()
        }),
        Schema::BranchConfig => json!({
            "$schema": "http://json-schema.org/draft-07/schema#",
            "title": "Branch configuration",
            "type": "object",
            "properties": {
                "name": property("name"),
                "description": property("description"),
                "path": property("path"),
                "network_name": property("network_name"),
                "network_password": property("network_password"),
                "advertising_interfaces": property("advertising_interfaces"),
                "advertising_address": property("advertising_address"),
                "advertising_port": property("advertising_port"),
                "advertising_interval": property("advertising_interval"),
                "timeout": property("timeout"),
                "ghost_mode": property("ghost_mode"),
                "tx_queue_size": property("tx_queue_size"),
                "rx_queue_size": property("rx_queue_size")
            }
        }),
        Schema::RemoteBranchInfo => json!({
            "$schema": "http://json-schema.org/draft-07/schema#",
            "title": "Remote branch information",
            "type": "object",
            "properties": {
                "uuid": property("uuid"),
                "name": property("name"),
                "description": property("description"),
                "network_name": property("network_name"),
                "path": property("path"),
                "hostname": property("hostname"),
                "pid": property("pid"),
                "tcp_server_address": property("tcp_server_address"),
                "tcp_server_port": property("tcp_server_port"),
                "start_time": property("start_time"),
                "timeout": property("timeout"),
                "advertising_interval": property("advertising_interval"),
                "ghost_mode": property("ghost_mode")
            },
            "required": [
                "uuid", "name", "network_name", "path", "hostname", "pid",
                "tcp_server_address", "tcp_server_port", "start_time"
            ]
        }),
        Schema::LocalBranchInfo => json!({
            "$schema": "http://json-schema.org/draft-07/schema#",
            "title": "Local branch information",
            "type": "object",
            "properties": {
                "uuid": property("uuid"),
                "name": property("name"),
                "description": property("description"),
                "network_name": property("network_name"),
                "path": property("path"),
                "hostname": property("hostname"),
                "pid": property("pid"),
                "advertising_interfaces": property("advertising_interfaces"),
                "advertising_address": property("advertising_address"),
                "advertising_port": property("advertising_port"),
                "advertising_interval": property("advertising_interval"),
                "tcp_server_port": property("tcp_server_port"),
                "start_time": property("start_time"),
                "timeout": property("timeout"),
                "ghost_mode": property("ghost_mode"),
                "tx_queue_size": property("tx_queue_size"),
                "rx_queue_size": property("rx_queue_size")
            },
            "required": ["uuid", "name", "network_name", "path", "hostname", "pid"]
        }),
        Schema::BranchEvent => json!({
            "$schema": "http://json-schema.org/draft-07/schema#",
            "title": "Branch event",
            "type": "object",
            "properties": {
                "uuid": property("uuid"),
                "tcp_server_address": property("tcp_server_address"),
                "tcp_server_port": property("tcp_server_port")
            },
            "required": ["uuid"]
        }),
    }
}

/// Returns the schema document itself.
pub fn get(schema: Schema) -> &'static Value {
    macro_rules! cached {
        ($variant:expr) => {{
            static DOC: Lazy<Value> = Lazy::new(|| schema_json($variant));
            &DOC
        }};
    }

    match schema {
        Schema::BranchConfig => cached!(Schema::BranchConfig),
        Schema::BranchProperties => cached!(Schema::BranchProperties),
        Schema::RemoteBranchInfo => cached!(Schema::RemoteBranchInfo),
        Schema::LocalBranchInfo => cached!(Schema::LocalBranchInfo),
        Schema::BranchEvent => cached!(Schema::BranchEvent),
    }
}

fn validator(schema: Schema) -> &'static Validator {
    macro_rules! cached {
        ($variant:expr) => {{
            static VALIDATOR: Lazy<Validator> = Lazy::new(|| {
                jsonschema::validator_for(get($variant)).expect("built-in schema is valid")
            });
            &VALIDATOR
        }};
    }

    match schema {
        Schema::BranchConfig => cached!(Schema::BranchConfig),
        Schema::BranchProperties => cached!(Schema::BranchProperties),
        Schema::RemoteBranchInfo => cached!(Schema::RemoteBranchInfo),
        Schema::LocalBranchInfo => cached!(Schema::LocalBranchInfo),
        Schema::BranchEvent => cached!(Schema::BranchEvent),
    }
}

/// Validates `json` against one of the built-in schemas.
pub fn validate(json: &Value, schema: Schema) -> Result<()> {
    let mut errors = String::new();
    for error in validator(schema).iter_errors(json) {
        if !errors.is_empty() {
            errors.push_str("; ");
        }
        let _ = write!(errors, "{} (at instance path {})", error, error.instance_path);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::ValidationFailed(errors))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_branch_config_passes() {
        let cfg = json!({
            "name": "a",
            "path": "/a",
            "advertising_port": 13531,
            "advertising_interval": 1.0,
            "timeout": null,
            "tx_queue_size": 35000
        });
        validate(&cfg, Schema::BranchConfig).unwrap();
    }

    #[test]
    fn path_must_start_with_slash() {
        let cfg = json!({"path": "no-slash"});
        assert!(matches!(
            validate(&cfg, Schema::BranchConfig),
            Err(ConfigError::ValidationFailed(_))
        ));
    }

    #[test]
    fn queue_sizes_are_bounded() {
        for size in [34999, 10_000_001] {
            let cfg = json!({"tx_queue_size": size});
            assert!(validate(&cfg, Schema::BranchConfig).is_err(), "size {size}");
        }
        let cfg = json!({"rx_queue_size": 35000});
        validate(&cfg, Schema::BranchConfig).unwrap();
    }

    #[test]
    fn intervals_allow_null_but_not_tiny_values() {
        validate(&json!({"advertising_interval": null}), Schema::BranchConfig).unwrap();
        validate(&json!({"timeout": 0.001}), Schema::BranchConfig).unwrap();
        assert!(validate(&json!({"timeout": 0.0001}), Schema::BranchConfig).is_err());
        assert!(validate(&json!({"advertising_port": 0}), Schema::BranchConfig).is_err());
    }

    #[test]
    fn remote_branch_info_requires_identity() {
        let info = json!({"name": "a"});
        assert!(validate(&info, Schema::RemoteBranchInfo).is_err());
    }

    #[test]
    fn all_schemas_compile() {
        for schema in [
            Schema::BranchConfig,
            Schema::BranchProperties,
            Schema::RemoteBranchInfo,
            Schema::LocalBranchInfo,
            Schema::BranchEvent,
        ] {
            assert!(get(schema).is_object());
            validator(schema);
        }
    }
}
