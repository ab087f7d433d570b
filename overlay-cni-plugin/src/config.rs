use std::collections::BTreeMap;
use std::path::PathBuf;

use clap::Parser;

use crate::{Error, Result};

/// Longest interface name the kernel accepts, IFNAMSIZ without the nul.
const IFNAME_MAX: usize = 15;

#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Possible values are ADD, DEL, CHECK, STATUS, GC, VERSION
    #[arg(long, env = "CNI_COMMAND", value_parser = parse_command)]
    pub command: Command,

    /// Container ID
    #[arg(long, env = "CNI_CONTAINERID")]
    pub container_id: Option<String>,

    /// Path to the network namespace
    #[arg(long, env = "CNI_NETNS")]
    pub net_ns: Option<PathBuf>,

    /// Name of the interface inside the container
    #[arg(long, env = "CNI_IFNAME")]
    pub ifname: Option<String>,

    /// Key-value pair seperated by semi-colons
    #[arg(long, env = "CNI_ARGS", value_parser = parse_key_value, default_value = "")]
    pub args: BTreeMap<String, String>,

    /// List of paths to search, seperated by colons
    #[arg(long, env = "CNI_PATH", default_value = "")]
    pub paths: String,
}

fn parse_key_value(s: &str) -> Result<BTreeMap<String, String>> {
    let mut kv = BTreeMap::new();

    if s.is_empty() {
        return Ok(kv);
    };

    for split in s.split(';') {
        if let Some((k, v)) = split.split_once('=') {
            kv.insert(k.to_owned(), v.to_owned());
        }
    }

    Ok(kv)
}

fn parse_command(s: &str) -> Result<Command> {
    let cmd = match s {
        "ADD" => Command::Add,
        "DEL" => Command::Delete,
        "CHECK" => Command::Check,
        "STATUS" => Command::Status,
        "VERSION" => Command::Version,
        "GC" => Command::Gc,
        _ => return Err(Error::Parse(format!("command {s} not supported"))),
    };
    Ok(cmd)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    Add,
    Delete,
    Check,
    Status,
    Version,
    Gc,
}

impl Args {
    /// Checks that every variable `command` needs is present and well formed.
    pub fn validate(&self) -> Result<()> {
        if !matches!(self.command, Command::Add | Command::Delete | Command::Check) {
            return Ok(());
        }
        validate_container_id(self.container_id()?)?;
        validate_ifname(self.ifname()?)?;
        if self.search_paths().is_empty() {
            return Err(Error::InvalidRequiredEnvVariables("CNI_PATH is required".into()));
        }
        if matches!(self.command, Command::Add | Command::Check) {
            self.net_ns()?;
        }
        Ok(())
    }

    pub fn container_id(&self) -> Result<&str> {
        required(self.container_id.as_deref(), "CNI_CONTAINERID")
    }

    pub fn ifname(&self) -> Result<&str> {
        required(self.ifname.as_deref(), "CNI_IFNAME")
    }

    pub fn net_ns(&self) -> Result<&PathBuf> {
        self.net_ns
            .as_ref()
            .filter(|p| !p.as_os_str().is_empty())
            .ok_or_else(|| Error::InvalidRequiredEnvVariables("CNI_NETNS is required".into()))
    }

    pub fn search_paths(&self) -> Vec<PathBuf> {
        self.paths
            .split(':')
            .filter(|p| !p.is_empty())
            .map(PathBuf::from)
            .collect()
    }
}

fn required<'a>(value: Option<&'a str>, name: &str) -> Result<&'a str> {
    value
        .filter(|v| !v.is_empty())
        .ok_or_else(|| Error::InvalidRequiredEnvVariables(format!("{name} is required")))
}

/// Container ids start with an alphanumeric and continue with alphanumerics,
/// `_`, `.` or `-`.
pub fn validate_container_id(id: &str) -> Result<()> {
    let mut chars = id.chars();
    let valid = match chars.next() {
        Some(first) => {
            first.is_ascii_alphanumeric()
                && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        }
        None => false,
    };
    if !valid {
        return Err(Error::InvalidRequiredEnvVariables(format!(
            "invalid characters in container id {id:?}"
        )));
    }
    Ok(())
}

pub fn validate_ifname(name: &str) -> Result<()> {
    let reason = if name.is_empty() {
        Some("is empty")
    } else if name.len() > IFNAME_MAX {
        Some("is longer than 15 bytes")
    } else if name == "." || name == ".." {
        Some("is reserved")
    } else if name
        .chars()
        .any(|c| c == '/' || c == ':' || c.is_whitespace())
    {
        Some("contains '/', ':' or whitespace")
    } else {
        None
    };
    match reason {
        Some(reason) => Err(Error::InvalidRequiredEnvVariables(format!(
            "interface name {name:?} {reason}"
        ))),
        None => Ok(()),
    }
}
