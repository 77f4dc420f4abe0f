//! Yogi configuration.
//!
//! A [`Configuration`] is a mutable JSON document updated by merge-patch from
//! strings, files and the command line. Command-line `--override` options go
//! into an immutable overlay that is re-applied on every later update unless
//! the configuration was created with a mutable command line. String values
//! may reference `${variables}` which resolve against the `/variables`
//! section of the document.

use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use serde_json::{json, Value};
use thiserror::Error;

pub mod cmdline;
pub mod schemas;

pub use cmdline::CommandLineOptions;
pub use schemas::Schema;

/// Errors produced by the configuration subsystem.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Parsing a JSON string failed
    #[error("Parsing a JSON string failed: {0}")]
    ParsingJsonFailed(String),
    /// Parsing a configuration file failed
    #[error("Parsing a configuration file failed: {0}")]
    ParsingFileFailed(String),
    /// Parsing the command line failed
    #[error("Parsing the command line failed: {0}")]
    ParsingCmdlineFailed(String),
    /// The configuration is not valid
    #[error("The configuration is not valid: {0}")]
    ConfigNotValid(String),
    /// Help/usage text requested; the payload is the usage text
    #[error("Help/usage text requested")]
    HelpRequested(String),
    /// One or more configuration variables are undefined or circular
    #[error("One or more configuration variables are undefined or could not be resolved: {0}")]
    UndefinedVariables(String),
    /// Support for configuration variables has been disabled
    #[error("Support for configuration variables has been disabled")]
    NoVariableSupport,
    /// A configuration variable has been used in a key
    #[error("A configuration variable has been used in a key: {0}")]
    VariableUsedInKey(String),
    /// The section could not be found in the configuration
    #[error("The section could not be found in the configuration: {0}")]
    SectionNotFound(String),
    /// Validating the configuration against a schema failed
    #[error("Validating the configuration failed: {0}")]
    ValidationFailed(String),
    /// Invalid parameter
    #[error("Invalid parameter: {0}")]
    InvalidParam(String),
    /// Could not write to file
    #[error("Could not write to file: {0}")]
    WriteFileFailed(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Creation flags for [`Configuration`].
#[derive(Clone, Copy, Default, Debug)]
pub struct ConfigurationFlags {
    /// Disables `${variable}` resolution entirely.
    pub disable_variables: bool,
    /// Makes later updates able to override command-line `--override` values.
    pub mutable_cmdline: bool,
}

/// A mutable JSON configuration document.
#[derive(Debug, Clone)]
pub struct Configuration {
    variables_supported: bool,
    mutable_cmdline: bool,
    json: Value,
    immutable_json: Value,
}

impl Default for Configuration {
    fn default() -> Self {
        Configuration::new(ConfigurationFlags::default())
    }
}

impl Configuration {
    pub fn new(flags: ConfigurationFlags) -> Configuration {
        Configuration {
            variables_supported: !flags.disable_variables,
            mutable_cmdline: flags.mutable_cmdline,
            json: json!({}),
            immutable_json: json!({}),
        }
    }

    /// Parses the command line and merges the result.
    ///
    /// `args` are the program arguments including the program name. Which
    /// options are recognized is controlled by `options`. Unless the
    /// configuration was created with a mutable command line, the direct
    /// options become the immutable overlay re-applied on every later update.
    pub fn update_from_cmdline<I, S>(&mut self, args: I, options: CommandLineOptions) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let parsed = cmdline::parse(args, options)?;

        self.verify_and_merge(&parsed.files_json, &parsed.direct_json)?;

        if !self.mutable_cmdline {
            self.immutable_json = parsed.direct_json;
        }

        Ok(())
    }

    /// Parses `json_str` and merges it into the document.
    pub fn update_from_string(&mut self, json_str: &str) -> Result<()> {
        let json: Value = serde_json::from_str(json_str)
            .map_err(|e| ConfigError::ParsingJsonFailed(format!("Could not parse JSON string: {e}")))?;

        let immutable = self.immutable_json.clone();
        self.verify_and_merge(&json, &immutable)
    }

    /// Merges an already-parsed JSON value into the document.
    pub fn update_from_json(&mut self, json: &Value) -> Result<()> {
        let immutable = self.immutable_json.clone();
        self.verify_and_merge(json, &immutable)
    }

    /// Reads and merges a JSON file.
    pub fn update_from_file(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|e| {
            ConfigError::ParsingFileFailed(format!("Could not open {}: {e}", path.display()))
        })?;

        let json: Value = serde_json::from_str(&contents).map_err(|e| {
            ConfigError::ParsingFileFailed(format!("Could not parse {}: {e}", path.display()))
        })?;

        let immutable = self.immutable_json.clone();
        self.verify_and_merge(&json, &immutable)
    }

    /// Returns the document or one of its sections, with variables resolved
    /// when supported.
    ///
    /// `section` is a JSON pointer; the addressed value must be an object.
    pub fn get_json(&self, section: Option<&str>) -> Result<Value> {
        self.get_json_with_resolution(self.variables_supported, section)
    }

    /// Like [`Configuration::get_json`] with explicit variable resolution.
    pub fn get_json_with_resolution(&self, resolve: bool, section: Option<&str>) -> Result<Value> {
        let doc = if resolve {
            if !self.variables_supported {
                return Err(ConfigError::NoVariableSupport);
            }
            resolve_variables(&self.json)?
        } else {
            self.json.clone()
        };

        let json = match section {
            None | Some("") => Some(&doc),
            Some(pointer) => {
                if !pointer.starts_with('/') {
                    return Err(ConfigError::InvalidParam(format!(
                        "Could not parse JSON pointer \"{pointer}\""
                    )));
                }
                doc.pointer(pointer)
            }
        };

        match json {
            Some(value) if value.is_object() => Ok(value.clone()),
            _ => Err(ConfigError::SectionNotFound(format!(
                "Could not find section \"{}\" in the configuration",
                section.unwrap_or("")
            ))),
        }
    }

    /// Serializes the document; `indent = None` produces a single line.
    pub fn dump(&self, resolve: bool, indent: Option<usize>) -> Result<String> {
        let json = self.get_json_with_resolution(resolve, None)?;
        Ok(dump_value(&json, indent))
    }

    /// Writes the document to `path`.
    pub fn write_to_file(
        &self,
        path: impl AsRef<Path>,
        resolve: bool,
        indent: Option<usize>,
    ) -> Result<()> {
        let mut contents = self.dump(resolve, indent)?;
        if indent.is_some() {
            contents.push('\n');
        }

        fs::write(path.as_ref(), contents)
            .map_err(|e| ConfigError::WriteFileFailed(e.to_string()))
    }

    /// Validates a section against one of the built-in schemas.
    pub fn validate(&self, section: Option<&str>, schema: Schema) -> Result<()> {
        let json = self.get_json(section)?;
        schemas::validate(&json, schema)
    }

    fn verify_and_merge(&mut self, json_to_merge: &Value, immutable_json: &Value) -> Result<()> {
        let mut new_json = self.json.clone();
        merge_patch_value(&mut new_json, json_to_merge);
        merge_patch_value(&mut new_json, immutable_json);

        if self.variables_supported {
            check_variables_only_used_in_values(&new_json)?;
            let resolved = resolve_variables(&new_json)?;
            check_all_variables_are_resolved(&resolved)?;
        }

        self.json = new_json;
        Ok(())
    }
}

/// Serializes `value` like the document dump does (compact or indented).
pub fn dump_value(value: &Value, indent: Option<usize>) -> String {
    match indent {
        None => value.to_string(),
        Some(width) => {
            let spaces = " ".repeat(width.min(16));
            let mut buf = Vec::new();
            let fmt = serde_json::ser::PrettyFormatter::with_indent(spaces.as_bytes());
            let mut ser = serde_json::Serializer::with_formatter(&mut buf, fmt);
            serde::Serialize::serialize(value, &mut ser).expect("JSON value always serializes");
            String::from_utf8(buf).expect("serde_json produces UTF-8")
        }
    }
}

/// RFC 7386 merge-patch.
pub(crate) fn merge_patch_value(target: &mut Value, patch: &Value) {
    if let Value::Object(patch_obj) = patch {
        if !target.is_object() {
            *target = json!({});
        }
        let target_obj = target.as_object_mut().expect("just ensured object");

        for (key, value) in patch_obj {
            if value.is_null() {
                target_obj.remove(key);
            } else {
                merge_patch_value(target_obj.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    } else {
        *target = patch.clone();
    }
}

/// Calls `f` for every key/value pair in the document, depth-first.
fn walk_all_elements<'a, F>(json: &'a Value, f: &mut F)
where
    F: FnMut(&str, &'a Value),
{
    match json {
        Value::Object(obj) => {
            for (key, value) in obj {
                if value.is_object() || value.is_array() {
                    walk_all_elements(value, f);
                }
                f(key, value);
            }
        }
        Value::Array(arr) => {
            for value in arr {
                if value.is_object() || value.is_array() {
                    walk_all_elements(value, f);
                }
                f("", value);
            }
        }
        _ => {}
    }
}

fn resolve_single_variable(elem: &mut Value, var_ref: &str, var_val: &Value) {
    let Some(s) = elem.as_str() else { return };

    if s == var_ref {
        *elem = var_val.clone();
    } else if s.contains(var_ref) {
        let replacement = match var_val.as_str() {
            Some(s) => s.to_string(),
            None => var_val.to_string(),
        };
        *elem = Value::String(s.replace(var_ref, &replacement));
    }
}

/// Returns a copy of `doc` with every `${name}` reference replaced by the
/// corresponding value under `/variables`.
fn resolve_variables(doc: &Value) -> Result<Value> {
    let mut json = doc.clone();

    let names: Vec<String> = match json.get("variables").and_then(Value::as_object) {
        Some(vars) => vars.keys().cloned().collect(),
        None => return Ok(json),
    };

    // Resolve references between the variables themselves first. Each
    // variable is applied with its current (possibly already substituted)
    // value, so chains like B = "${A}y" work regardless of key order.
    for name in &names {
        let var_ref = format!("${{{name}}}");
        let value = json["variables"][name.as_str()].clone();

        if let Some(s) = value.as_str() {
            if s.contains(&var_ref) {
                return Err(ConfigError::UndefinedVariables(format!(
                    "Circular dependency in variable \"{name}\""
                )));
            }
        }

        if let Some(vars) = json.get_mut("variables").and_then(Value::as_object_mut) {
            for elem in vars.values_mut() {
                resolve_single_variable(elem, &var_ref, &value);
            }
        }
    }

    for name in &names {
        let var_ref = format!("${{{name}}}");
        let value = json["variables"][name.as_str()].clone();
        replace_everywhere(&mut json, &var_ref, &value);
    }

    Ok(json)
}

fn replace_everywhere(json: &mut Value, var_ref: &str, var_val: &Value) {
    match json {
        Value::Object(obj) => {
            for value in obj.values_mut() {
                replace_everywhere(value, var_ref, var_val);
            }
        }
        Value::Array(arr) => {
            for value in arr.iter_mut() {
                replace_everywhere(value, var_ref, var_val);
            }
        }
        _ => resolve_single_variable(json, var_ref, var_val),
    }
}

fn check_variables_only_used_in_values(json: &Value) -> Result<()> {
    let mut bad_key = None;
    walk_all_elements(json, &mut |key, _| {
        if bad_key.is_none() && key.contains("${") {
            bad_key = Some(key.to_string());
        }
    });

    match bad_key {
        Some(key) => Err(ConfigError::VariableUsedInKey(format!(
            "Found syntax for variable in key: {key}"
        ))),
        None => Ok(()),
    }
}

fn check_all_variables_are_resolved(json: &Value) -> Result<()> {
    let mut unresolved = None;
    walk_all_elements(json, &mut |_, value| {
        if unresolved.is_some() {
            return;
        }
        let Some(s) = value.as_str() else { return };
        if let Some(pos) = s.find("${") {
            let rest = &s[pos + 2..];
            let name = rest.split('}').next().unwrap_or(rest);
            unresolved = Some(name.to_string());
        }
    });

    match unresolved {
        Some(name) => {
            let mut details = String::new();
            let _ = write!(details, "Variable \"{name}\" could not be resolved");
            Err(ConfigError::UndefinedVariables(details))
        }
        None => Ok(()),
    }
}
