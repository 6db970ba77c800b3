//! Procfile loading.
//!
//! Turns a Procfile into the ordered list of `ProcessSpec`s the supervisor consumes,
//! assigning color indices and ports along the way.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::output::PALETTE;
use crate::process::ProcessSpec;

/// Where specs come from and how ports are assigned. Kept around so a reload
/// re-reads the file with the same rules.
#[derive(Debug, Clone)]
pub struct SpecSource {
    pub path: PathBuf,
    pub set_ports: bool,
    pub base_port: u16,
}

/// Distance between ports assigned to consecutive entries.
pub const PORT_STEP: u16 = 100;

impl SpecSource {
    pub fn load(&self) -> Result<Vec<ProcessSpec>> {
        let content = read_procfile(&self.path)?;
        parse(&content, self.set_ports.then_some(self.base_port))
    }
}

fn read_procfile(path: &Path) -> Result<String> {
    if !path.exists() {
        return Err(Error::MissingProcfile {
            path: path.to_path_buf(),
        });
    }
    std::fs::read_to_string(path)
        .map_err(|err| Error::Config(format!("failed to read {}: {}", path.display(), err)))
}

/// Parses Procfile text. `base_port` enables port assignment.
pub fn parse(content: &str, base_port: Option<u16>) -> Result<Vec<ProcessSpec>> {
    let mut specs = Vec::new();
    let mut seen = HashSet::new();
    for line in content.lines() {
        let Some((name, cmdline)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim();
        let cmdline = cmdline.trim();
        if name.is_empty() || name.starts_with('#') {
            continue;
        }
        if cmdline.is_empty() {
            return Err(Error::Config(format!("empty command for {}", name)));
        }
        shell_words::split(cmdline)
            .map_err(|err| Error::Config(format!("invalid command for {}: {}", name, err)))?;
        if !seen.insert(name.to_string()) {
            return Err(Error::DuplicateName(name.to_string()));
        }
        let port = base_port
            .map(|base| {
                u16::try_from(specs.len())
                    .ok()
                    .and_then(|idx| idx.checked_mul(PORT_STEP))
                    .and_then(|offset| base.checked_add(offset))
                    .ok_or_else(|| Error::Config(format!("no port left for {}", name)))
            })
            .transpose()?;
        specs.push(ProcessSpec {
            name: name.to_string(),
            cmdline: cmdline.to_string(),
            color_index: specs.len() % PALETTE.len(),
            port,
        });
    }
    if specs.is_empty() {
        return Err(Error::EmptySpec);
    }
    Ok(specs)
}

/// Restricts `specs` to `names`, in the order given. A name may appear once.
pub fn select(specs: Vec<ProcessSpec>, names: &[String]) -> Result<Vec<ProcessSpec>> {
    if names.is_empty() {
        return Ok(specs);
    }
    let mut seen = HashSet::new();
    names
        .iter()
        .map(|name| {
            if !seen.insert(name.as_str()) {
                return Err(Error::DuplicateName(name.clone()));
            }
            specs
                .iter()
                .find(|spec| &spec.name == name)
                .cloned()
                .ok_or_else(|| Error::UnknownProcess(name.clone()))
        })
        .collect()
}

/// Summary line printed by `check`.
pub fn check_summary(specs: &[ProcessSpec]) -> String {
    let mut names: Vec<&str> = specs.iter().map(|spec| spec.name.as_str()).collect();
    names.sort_unstable();
    format!("valid procfile detected ({})", names.join(", "))
}
