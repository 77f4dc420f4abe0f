//! Command-line parsing into configuration JSON.
//!
//! The caller picks which option groups are recognized via
//! [`CommandLineOptions`]. Options either contribute to the *files*
//! configuration (positional glob patterns naming JSON files) or to the
//! *direct* configuration (everything else), which can become the immutable
//! overlay of a [`crate::Configuration`].

use std::ops::BitOr;

use clap::{Arg, ArgAction, Command};
use serde_json::{json, Value};

use crate::{ConfigError, Result};

/// Bitmask selecting the recognized command-line options.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct CommandLineOptions(u32);

impl CommandLineOptions {
    pub const NONE: CommandLineOptions = CommandLineOptions(0);
    /// `--log-file`, `--log-console`, `--log-color`, `--log-fmt`,
    /// `--log-time-fmt` and `--log-verbosity`.
    pub const LOGGING: CommandLineOptions = CommandLineOptions(1 << 0);
    /// `--name`.
    pub const BRANCH_NAME: CommandLineOptions = CommandLineOptions(1 << 1);
    /// `--description`.
    pub const BRANCH_DESCRIPTION: CommandLineOptions = CommandLineOptions(1 << 2);
    /// `--network`.
    pub const BRANCH_NETWORK: CommandLineOptions = CommandLineOptions(1 << 3);
    /// `--password`.
    pub const BRANCH_PASSWORD: CommandLineOptions = CommandLineOptions(1 << 4);
    /// `--path`.
    pub const BRANCH_PATH: CommandLineOptions = CommandLineOptions(1 << 5);
    /// `--adv-ifs`.
    pub const BRANCH_ADV_IFS: CommandLineOptions = CommandLineOptions(1 << 6);
    /// `--adv-addr`.
    pub const BRANCH_ADV_ADDR: CommandLineOptions = CommandLineOptions(1 << 7);
    /// `--adv-port`.
    pub const BRANCH_ADV_PORT: CommandLineOptions = CommandLineOptions(1 << 8);
    /// `--adv-int`.
    pub const BRANCH_ADV_INT: CommandLineOptions = CommandLineOptions(1 << 9);
    /// `--timeout`.
    pub const BRANCH_TIMEOUT: CommandLineOptions = CommandLineOptions(1 << 10);
    /// `--ghost`.
    pub const BRANCH_GHOST_MODE: CommandLineOptions = CommandLineOptions(1 << 11);
    /// Positional configuration file glob patterns.
    pub const FILES: CommandLineOptions = CommandLineOptions(1 << 12);
    /// Like [`Self::FILES`] but at least one matching file must be given.
    pub const FILES_REQUIRED: CommandLineOptions = CommandLineOptions(1 << 13);
    /// `--override`/`-o`.
    pub const OVERRIDES: CommandLineOptions = CommandLineOptions(1 << 14);
    /// `--var`/`-v`.
    pub const VARIABLES: CommandLineOptions = CommandLineOptions(1 << 15);

    /// All branch-related options.
    pub const BRANCH_ALL: CommandLineOptions = CommandLineOptions(
        Self::BRANCH_NAME.0
            | Self::BRANCH_DESCRIPTION.0
            | Self::BRANCH_NETWORK.0
            | Self::BRANCH_PASSWORD.0
            | Self::BRANCH_PATH.0
            | Self::BRANCH_ADV_IFS.0
            | Self::BRANCH_ADV_ADDR.0
            | Self::BRANCH_ADV_PORT.0
            | Self::BRANCH_ADV_INT.0
            | Self::BRANCH_TIMEOUT.0
            | Self::BRANCH_GHOST_MODE.0,
    );

    /// Everything.
    pub const ALL: CommandLineOptions = CommandLineOptions(
        Self::LOGGING.0
            | Self::BRANCH_ALL.0
            | Self::FILES.0
            | Self::FILES_REQUIRED.0
            | Self::OVERRIDES.0
            | Self::VARIABLES.0,
    );

    pub fn contains(self, other: CommandLineOptions) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for CommandLineOptions {
    type Output = CommandLineOptions;

    fn bitor(self, rhs: CommandLineOptions) -> CommandLineOptions {
        CommandLineOptions(self.0 | rhs.0)
    }
}

/// Result of a successful parse.
#[derive(Debug, Default)]
pub struct ParsedCommandLine {
    /// Merged contents of the configuration files, in argument order.
    pub files_json: Value,
    /// Configuration assembled from the direct options.
    pub direct_json: Value,
}

fn build_command(options: CommandLineOptions) -> Command {
    let mut cmd = Command::new("yogi").disable_version_flag(true);

    if options.contains(CommandLineOptions::LOGGING) {
        cmd = cmd
            .arg(
                Arg::new("log-file")
                    .long("log-file")
                    .value_name("FILE")
                    .help("Log file; time placeholders are substituted"),
            )
            .arg(
                Arg::new("log-console")
                    .long("log-console")
                    .value_name("STREAM")
                    .value_parser(["STDOUT", "STDERR"])
                    .help("Log to the given console stream"),
            )
            .arg(
                Arg::new("log-color")
                    .long("log-color")
                    .num_args(0..=1)
                    .default_missing_value("true")
                    .value_parser(clap::value_parser!(bool))
                    .value_name("BOOL")
                    .help("Colorize console log output"),
            )
            .arg(
                Arg::new("log-fmt")
                    .long("log-fmt")
                    .value_name("FORMAT")
                    .help("Format of log entries"),
            )
            .arg(
                Arg::new("log-time-fmt")
                    .long("log-time-fmt")
                    .value_name("FORMAT")
                    .help("Format of log entry timestamps"),
            )
            .arg(
                Arg::new("log-verbosity")
                    .long("log-verbosity")
                    .action(ArgAction::Append)
                    .value_name("COMPONENT=LEVEL")
                    .help("Verbosity for components matching a pattern"),
            );
    }

    if options.contains(CommandLineOptions::BRANCH_NAME) {
        cmd = cmd.arg(Arg::new("name").long("name").value_name("NAME").help("Branch name"));
    }
    if options.contains(CommandLineOptions::BRANCH_DESCRIPTION) {
        cmd = cmd.arg(
            Arg::new("description")
                .long("description")
                .value_name("TEXT")
                .help("Branch description"),
        );
    }
    if options.contains(CommandLineOptions::BRANCH_NETWORK) {
        cmd = cmd.arg(
            Arg::new("network")
                .long("network")
                .value_name("NAME")
                .help("Network name"),
        );
    }
    if options.contains(CommandLineOptions::BRANCH_PASSWORD) {
        cmd = cmd.arg(
            Arg::new("password")
                .long("password")
                .value_name("PASSWORD")
                .help("Network password"),
        );
    }
    if options.contains(CommandLineOptions::BRANCH_PATH) {
        cmd = cmd.arg(Arg::new("path").long("path").value_name("PATH").help("Branch path"));
    }
    if options.contains(CommandLineOptions::BRANCH_ADV_IFS) {
        cmd = cmd.arg(
            Arg::new("adv-ifs")
                .long("adv-ifs")
                .action(ArgAction::Append)
                .value_name("INTERFACE")
                .help("Advertising interface (repeatable)"),
        );
    }
    if options.contains(CommandLineOptions::BRANCH_ADV_ADDR) {
        cmd = cmd.arg(
            Arg::new("adv-addr")
                .long("adv-addr")
                .value_name("ADDRESS")
                .help("Advertising multicast address"),
        );
    }
    if options.contains(CommandLineOptions::BRANCH_ADV_PORT) {
        cmd = cmd.arg(
            Arg::new("adv-port")
                .long("adv-port")
                .value_parser(clap::value_parser!(u16).range(1..))
                .value_name("PORT")
                .help("Advertising port"),
        );
    }
    if options.contains(CommandLineOptions::BRANCH_ADV_INT) {
        cmd = cmd.arg(
            Arg::new("adv-int")
                .long("adv-int")
                .value_name("SECONDS")
                .help("Advertising interval in seconds (\"inf\" to disable)"),
        );
    }
    if options.contains(CommandLineOptions::BRANCH_TIMEOUT) {
        cmd = cmd.arg(
            Arg::new("timeout")
                .long("timeout")
                .value_name("SECONDS")
                .help("Connection timeout in seconds (\"inf\" to disable)"),
        );
    }
    if options.contains(CommandLineOptions::BRANCH_GHOST_MODE) {
        cmd = cmd.arg(
            Arg::new("ghost")
                .long("ghost")
                .num_args(0..=1)
                .default_missing_value("true")
                .value_parser(clap::value_parser!(bool))
                .value_name("BOOL")
                .help("Ghost mode (observe only)"),
        );
    }
    if options.contains(CommandLineOptions::FILES)
        || options.contains(CommandLineOptions::FILES_REQUIRED)
    {
        cmd = cmd.arg(
            Arg::new("files")
                .action(ArgAction::Append)
                .value_name("CONFIG_FILES")
                .help("Configuration files (glob patterns, merged in order)"),
        );
    }
    if options.contains(CommandLineOptions::OVERRIDES) {
        cmd = cmd.arg(
            Arg::new("override")
                .long("override")
                .short('o')
                .action(ArgAction::Append)
                .value_name("OVERRIDE")
                .help("Override in the form {\"json\": ...} or /pointer=value"),
        );
    }
    if options.contains(CommandLineOptions::VARIABLES) {
        cmd = cmd.arg(
            Arg::new("var")
                .long("var")
                .short('v')
                .action(ArgAction::Append)
                .value_name("NAME=VALUE")
                .help("Configuration variable"),
        );
    }

    cmd
}

/// Parses `value` as JSON, falling back to a plain string.
fn json_or_string(value: &str) -> Value {
    serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()))
}

/// Stores `value` at `pointer`, creating intermediate objects.
fn set_at_pointer(doc: &mut Value, pointer: &str, value: Value) -> Result<()> {
    if !pointer.starts_with('/') {
        return Err(ConfigError::ParsingCmdlineFailed(format!(
            "Invalid JSON pointer \"{pointer}\""
        )));
    }

    let mut current = doc;
    let mut tokens = pointer[1..].split('/').peekable();
    while let Some(token) = tokens.next() {
        let token = token.replace("~1", "/").replace("~0", "~");

        if !current.is_object() {
            *current = json!({});
        }
        let obj = current.as_object_mut().expect("just ensured object");

        if tokens.peek().is_none() {
            obj.insert(token, value);
            return Ok(());
        }

        current = obj.entry(token).or_insert(json!({}));
    }

    Ok(())
}

fn parse_seconds_or_inf(value: &str, option: &str) -> Result<Value> {
    if value.eq_ignore_ascii_case("inf") {
        return Ok(Value::Null);
    }

    value
        .parse::<f64>()
        .ok()
        .and_then(serde_json::Number::from_f64)
        .map(Value::Number)
        .ok_or_else(|| {
            ConfigError::ParsingCmdlineFailed(format!("Invalid value \"{value}\" for {option}"))
        })
}

fn load_config_files(patterns: &[String], required: bool) -> Result<Value> {
    let mut matched = Vec::new();
    for pattern in patterns {
        let paths = glob::glob(pattern).map_err(|e| {
            ConfigError::ParsingCmdlineFailed(format!("Invalid file pattern \"{pattern}\": {e}"))
        })?;

        for path in paths.flatten() {
            matched.push(path);
        }
    }

    if matched.is_empty() && required {
        return Err(ConfigError::ParsingCmdlineFailed(
            "No configuration files specified".to_string(),
        ));
    }

    let mut files_json = json!({});
    for path in matched {
        let contents = std::fs::read_to_string(&path).map_err(|e| {
            ConfigError::ParsingFileFailed(format!("Could not open {}: {e}", path.display()))
        })?;
        let json: Value = serde_json::from_str(&contents).map_err(|e| {
            ConfigError::ParsingFileFailed(format!("Could not parse {}: {e}", path.display()))
        })?;

        crate::merge_patch_value(&mut files_json, &json);
    }

    Ok(files_json)
}

/// Parses the command line per the selected `options`.
pub fn parse<I, S>(args: I, options: CommandLineOptions) -> Result<ParsedCommandLine>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let args: Vec<String> = args.into_iter().map(Into::into).collect();
    let cmd = build_command(options);

    let matches = cmd.try_get_matches_from(&args).map_err(|e| {
        use clap::error::ErrorKind;
        match e.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                ConfigError::HelpRequested(e.to_string())
            }
            _ => ConfigError::ParsingCmdlineFailed(e.to_string()),
        }
    })?;

    let mut direct = json!({});

    if options.contains(CommandLineOptions::LOGGING) {
        if let Some(file) = matches.get_one::<String>("log-file") {
            set_at_pointer(&mut direct, "/logging/file", json!(file))?;
        }
        if let Some(console) = matches.get_one::<String>("log-console") {
            set_at_pointer(&mut direct, "/logging/console", json!(console))?;
        }
        if let Some(color) = matches.get_one::<bool>("log-color") {
            set_at_pointer(&mut direct, "/logging/color", json!(color))?;
        }
        if let Some(fmt) = matches.get_one::<String>("log-fmt") {
            set_at_pointer(&mut direct, "/logging/entry_format", json!(fmt))?;
        }
        if let Some(fmt) = matches.get_one::<String>("log-time-fmt") {
            set_at_pointer(&mut direct, "/logging/time_format", json!(fmt))?;
        }
        if let Some(entries) = matches.get_many::<String>("log-verbosity") {
            for entry in entries {
                let (component, level) = entry.split_once('=').ok_or_else(|| {
                    ConfigError::ParsingCmdlineFailed(format!(
                        "Invalid log verbosity \"{entry}\"; expected COMPONENT=LEVEL"
                    ))
                })?;
                let pointer = format!("/logging/verbosity/{}", component.replace('/', "~1"));
                set_at_pointer(&mut direct, &pointer, json!(level))?;
            }
        }
    }

    let string_options = [
        ("name", "/branch/name"),
        ("description", "/branch/description"),
        ("network", "/branch/network"),
        ("password", "/branch/password"),
        ("path", "/branch/path"),
        ("adv-addr", "/branch/advertising_address"),
    ];
    for (id, pointer) in string_options {
        if matches.try_contains_id(id).unwrap_or(false) {
            if let Some(value) = matches.get_one::<String>(id) {
                set_at_pointer(&mut direct, pointer, json!(value))?;
            }
        }
    }

    if matches.try_contains_id("adv-ifs").unwrap_or(false) {
        if let Some(ifs) = matches.get_many::<String>("adv-ifs") {
            let ifs: Vec<&String> = ifs.collect();
            set_at_pointer(&mut direct, "/branch/advertising_interfaces", json!(ifs))?;
        }
    }
    if matches.try_contains_id("adv-port").unwrap_or(false) {
        if let Some(port) = matches.get_one::<u16>("adv-port") {
            set_at_pointer(&mut direct, "/branch/advertising_port", json!(port))?;
        }
    }
    if matches.try_contains_id("adv-int").unwrap_or(false) {
        if let Some(value) = matches.get_one::<String>("adv-int") {
            let value = parse_seconds_or_inf(value, "--adv-int")?;
            set_at_pointer(&mut direct, "/branch/advertising_interval", value)?;
        }
    }
    if matches.try_contains_id("timeout").unwrap_or(false) {
        if let Some(value) = matches.get_one::<String>("timeout") {
            let value = parse_seconds_or_inf(value, "--timeout")?;
            set_at_pointer(&mut direct, "/branch/timeout", value)?;
        }
    }
    if matches.try_contains_id("ghost").unwrap_or(false) {
        if let Some(ghost) = matches.get_one::<bool>("ghost") {
            set_at_pointer(&mut direct, "/branch/ghost_mode", json!(ghost))?;
        }
    }

    if options.contains(CommandLineOptions::VARIABLES) {
        if let Some(vars) = matches.get_many::<String>("var") {
            for var in vars {
                let (name, value) = var.split_once('=').ok_or_else(|| {
                    ConfigError::ParsingCmdlineFailed(format!(
                        "Invalid variable \"{var}\"; expected NAME=VALUE"
                    ))
                })?;
                if name.is_empty() {
                    return Err(ConfigError::ParsingCmdlineFailed(format!(
                        "Invalid variable \"{var}\"; empty name"
                    )));
                }
                let pointer = format!("/variables/{}", name.replace('/', "~1"));
                set_at_pointer(&mut direct, &pointer, json_or_string(value))?;
            }
        }
    }

    if options.contains(CommandLineOptions::OVERRIDES) {
        if let Some(overrides) = matches.get_many::<String>("override") {
            for entry in overrides {
                if entry.trim_start().starts_with('{') {
                    let json: Value = serde_json::from_str(entry).map_err(|e| {
                        ConfigError::ParsingCmdlineFailed(format!(
                            "Invalid override \"{entry}\": {e}"
                        ))
                    })?;
                    crate::merge_patch_value(&mut direct, &json);
                } else {
                    let (pointer, value) = entry.split_once('=').ok_or_else(|| {
                        ConfigError::ParsingCmdlineFailed(format!(
                            "Invalid override \"{entry}\"; expected /pointer=value"
                        ))
                    })?;
                    set_at_pointer(&mut direct, pointer, json_or_string(value))?;
                }
            }
        }
    }

    let mut files_json = json!({});
    if options.contains(CommandLineOptions::FILES)
        || options.contains(CommandLineOptions::FILES_REQUIRED)
    {
        let patterns: Vec<String> = matches
            .get_many::<String>("files")
            .map(|values| values.cloned().collect())
            .unwrap_or_default();
        files_json = load_config_files(
            &patterns,
            options.contains(CommandLineOptions::FILES_REQUIRED),
        )?;
    }

    Ok(ParsedCommandLine {
        files_json,
        direct_json: direct,
    })
}
