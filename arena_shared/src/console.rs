//! Operator console.
//!
//! Holds typed console variables and runs the built-in commands (`echo`,
//! `help`, `history`, `cvarlist`, `set`, `reset`). Anything else is handed back to the
//! caller as a parsed [`CommandLine`] so the server can act on its own state.
//!
//! ```ignore
//! let mut console = Console::new();
//! console.register_cvar("sv_maxclients", CvarValue::Int(16), "max connections", CvarFlags::NOTIFY);
//! match console.exec("kick 3")? {
//!     Exec::Output(lines) => print(lines),
//!     Exec::Forward(cmd) => server.run(cmd),
//! }
//! ```

use std::collections::{BTreeMap, VecDeque};
use std::fmt;

use anyhow::{bail, Context};

/// Console variable value. A cvar keeps the type it was registered with.
#[derive(Debug, Clone, PartialEq)]
pub enum CvarValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Text(String),
}

impl CvarValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            CvarValue::Int(v) => Some(*v),
            CvarValue::Float(v) => Some(*v as i64),
            CvarValue::Bool(v) => Some(i64::from(*v)),
            CvarValue::Text(_) => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            CvarValue::Float(v) => Some(*v),
            CvarValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> bool {
        match self {
            CvarValue::Bool(v) => *v,
            CvarValue::Int(v) => *v != 0,
            CvarValue::Float(v) => *v != 0.0,
            CvarValue::Text(s) => !s.is_empty() && s != "0",
        }
    }

    /// Parses `raw` into the same variant as `self`.
    fn parse_like(&self, raw: &str) -> anyhow::Result<Self> {
        Ok(match self {
            CvarValue::Int(_) => CvarValue::Int(raw.parse().with_context(|| format!("{raw:?} is not an integer"))?),
            CvarValue::Float(_) => CvarValue::Float(raw.parse().with_context(|| format!("{raw:?} is not a number"))?),
            CvarValue::Bool(_) => CvarValue::Bool(match raw {
                "1" | "true" | "on" => true,
                "0" | "false" | "off" => false,
                _ => bail!("{raw:?} is not a boolean"),
            }),
            CvarValue::Text(_) => CvarValue::Text(raw.to_owned()),
        })
    }
}

impl fmt::Display for CvarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CvarValue::Int(v) => write!(f, "{v}"),
            CvarValue::Float(v) => write!(f, "{v}"),
            CvarValue::Bool(v) => write!(f, "{}", if *v { 1 } else { 0 }),
            CvarValue::Text(v) => write!(f, "\"{v}\""),
        }
    }
}

bitflags::bitflags! {
    /// Cvar flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CvarFlags: u32 {
        /// Cannot be changed from the console.
        const READ_ONLY = 1 << 0;
        /// Changes are logged.
        const NOTIFY = 1 << 1;
    }
}

#[derive(Debug, Clone)]
pub struct Cvar {
    pub value: CvarValue,
    pub default: CvarValue,
    pub description: String,
    pub flags: CvarFlags,
}

/// A tokenized command the console does not handle itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub name: String,
    pub args: Vec<String>,
}

impl CommandLine {
    pub fn arg(&self, i: usize) -> Option<&str> {
        self.args.get(i).map(String::as_str)
    }
}

/// Result of [`Console::exec`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Exec {
    Output(Vec<String>),
    Forward(CommandLine),
}

const BUILTINS: &[(&str, &str)] = &[
    ("echo", "echo <text>: print text"),
    ("help", "help: list commands"),
    ("history", "history: list recent console lines"),
    ("cvarlist", "cvarlist: list variables"),
    ("set", "set <cvar> <value>: change a variable"),
    ("reset", "reset <cvar>: restore a variable's default"),
];

pub struct Console {
    cvars: BTreeMap<String, Cvar>,
    /// Extra command names registered by the host, for `help`.
    external: Vec<(String, String)>,
    history: VecDeque<String>,
    max_history: usize,
}

impl Default for Console {
    fn default() -> Self {
        Self::new()
    }
}

impl Console {
    pub fn new() -> Self {
        Self {
            cvars: BTreeMap::new(),
            external: Vec::new(),
            history: VecDeque::new(),
            max_history: 64,
        }
    }

    pub fn register_cvar(&mut self, name: &str, default: CvarValue, description: &str, flags: CvarFlags) {
        self.cvars.insert(
            name.to_owned(),
            Cvar {
                value: default.clone(),
                default,
                description: description.to_owned(),
                flags,
            },
        );
    }

    /// Lists a host-handled command in `help`.
    pub fn describe_command(&mut self, name: &str, usage: &str) {
        self.external.push((name.to_owned(), usage.to_owned()));
    }

    pub fn get(&self, name: &str) -> Option<&CvarValue> {
        self.cvars.get(name).map(|c| &c.value)
    }

    pub fn get_int(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(CvarValue::as_int)
    }

    pub fn get_float(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(CvarValue::as_float)
    }

    /// Sets a cvar from its textual form, keeping its type.
    pub fn set(&mut self, name: &str, raw: &str) -> anyhow::Result<&CvarValue> {
        let Some(cvar) = self.cvars.get_mut(name) else {
            bail!("unknown cvar: {name}");
        };
        if cvar.flags.contains(CvarFlags::READ_ONLY) {
            bail!("{name} is read-only");
        }
        cvar.value = cvar.default.parse_like(raw).with_context(|| format!("set {name}"))?;
        if cvar.flags.contains(CvarFlags::NOTIFY) {
            tracing::info!(cvar = name, value = %cvar.value, "cvar changed");
        }
        Ok(&cvar.value)
    }

    /// Recent lines, oldest first, capped at the history depth.
    pub fn history(&self) -> impl Iterator<Item = &str> {
        self.history.iter().map(String::as_str)
    }

    /// Runs one console line.
    pub fn exec(&mut self, line: &str) -> anyhow::Result<Exec> {
        let line = line.trim();
        if line.is_empty() || line.starts_with("//") {
            return Ok(Exec::Output(Vec::new()));
        }
        self.history.push_back(line.to_owned());
        if self.history.len() > self.max_history {
            self.history.pop_front();
        }

        let mut tokens = parse_command_line(line).into_iter();
        let Some(name) = tokens.next() else {
            return Ok(Exec::Output(Vec::new()));
        };
        let args: Vec<String> = tokens.collect();

        let out = match name.as_str() {
            "echo" => vec![args.join(" ")],
            "help" => BUILTINS
                .iter()
                .map(|(_, usage)| (*usage).to_owned())
                .chain(self.external.iter().map(|(_, usage)| usage.clone()))
                .collect(),
            // The line being run is the newest entry.
            "history" => self
                .history
                .iter()
                .take(self.history.len() - 1)
                .enumerate()
                .map(|(i, line)| format!("{:>3}  {line}", i + 1))
                .collect(),
            "cvarlist" => self
                .cvars
                .iter()
                .map(|(name, c)| format!("  {name} = {} (default {}) {}", c.value, c.default, c.description))
                .collect(),
            "set" => {
                let [cvar, value] = args.as_slice() else {
                    bail!("usage: set <cvar> <value>");
                };
                let v = self.set(cvar, value)?;
                vec![format!("{cvar} = {v}")]
            }
            "reset" => {
                let [cvar] = args.as_slice() else {
                    bail!("usage: reset <cvar>");
                };
                let default = match self.cvars.get(cvar.as_str()) {
                    Some(c) => c.default.to_string(),
                    None => bail!("unknown cvar: {cvar}"),
                };
                let v = self.set(cvar, default.trim_matches('"'))?;
                vec![format!("{cvar} = {v}")]
            }
            cvar if self.cvars.contains_key(cvar) => match args.as_slice() {
                [] => {
                    let c = &self.cvars[cvar];
                    vec![format!("{cvar} = {} (default {})", c.value, c.default)]
                }
                [value] => {
                    let v = self.set(cvar, value)?;
                    vec![format!("{cvar} = {v}")]
                }
                _ => bail!("usage: {cvar} [value]"),
            },
            _ => {
                return Ok(Exec::Forward(CommandLine {
                    name: name.clone(),
                    args,
                }))
            }
        };
        Ok(Exec::Output(out))
    }
}

/// Splits a line on whitespace; double quotes group words.
pub fn parse_command_line(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut quoted = false;

    for c in line.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                quoted = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() || quoted {
                    tokens.push(std::mem::take(&mut current));
                }
                quoted = false;
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() || quoted {
        tokens.push(current);
    }
    tokens
}
