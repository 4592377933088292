// Copyright (c) 2024, VURM Contributors.
// All rights reserved.
//
// This VURM Software is licensed under the BSD-3-Clause license.
// Please see the LICENSE file for more details.

//! INI configuration loading into a typed [`Settings`] record.
//!
//! Mirrors the sections and keys from the original `vurm.conf` format:
//! `vurm`, `vurmctld`, `vurm-client`, `multilocal`, `libvirt`,
//! `vurmd-libvirt`. Every binary parses only the sections it needs, so a
//! single config file can be shared across the fleet.

use std::path::{Path, PathBuf};

use ini::Ini;
use log::debug;

use crate::error::{Error, Result};

/// `[vurm]` — settings shared by every binary.
#[derive(Debug, Clone, Default)]
pub struct VurmSection {
    pub debug: bool,
}

/// `[vurmctld]` — the controller daemon.
#[derive(Debug, Clone)]
pub struct VurmctldSection {
    pub endpoint: String,
    pub slurmconfig: PathBuf,
    pub reconfigure: String,
}

/// `[vurm-client]` — the operator CLI.
#[derive(Debug, Clone)]
pub struct VurmClientSection {
    pub endpoint: String,
}

/// `[multilocal]` — the local-multi provisioner.
#[derive(Debug, Clone)]
pub struct MultilocalSection {
    pub baseport: u16,
    pub slurmd: String,
}

/// `[libvirt]` — the remote-virt provisioner, as seen by the controller.
#[derive(Debug, Clone)]
pub struct LibvirtSection {
    pub nodes: Vec<String>,
    pub domain_xml: PathBuf,
}

/// `[vurmd-libvirt]` — the hypervisor-side agent.
#[derive(Debug, Clone)]
pub struct VurmdLibvirtSection {
    pub endpoint: String,
    pub hypervisor: String,
    pub key: PathBuf,
    pub clonedir: PathBuf,
    pub clonebin: String,
    pub username: String,
    pub sshport: u16,
    pub slurmconfig: PathBuf,
    pub slurmd: String,
}

/// Parsed configuration. Each section is `Option` because the binary reading
/// it only requires the sections relevant to its role; accessors that need a
/// section return [`Error::MissingConfigKey`] when absent.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub vurm: VurmSection,
    pub vurmctld: Option<VurmctldSection>,
    pub vurm_client: Option<VurmClientSection>,
    pub multilocal: Option<MultilocalSection>,
    pub libvirt: Option<LibvirtSection>,
    pub vurmd_libvirt: Option<VurmdLibvirtSection>,
}

impl Settings {
    pub fn vurmctld(&self) -> Result<&VurmctldSection> {
        self.vurmctld.as_ref().ok_or_else(|| Error::MissingConfigKey {
            section: "vurmctld".to_string(),
            key: "*".to_string(),
        })
    }

    pub fn vurm_client(&self) -> Result<&VurmClientSection> {
        self.vurm_client
            .as_ref()
            .ok_or_else(|| Error::MissingConfigKey {
                section: "vurm-client".to_string(),
                key: "*".to_string(),
            })
    }

    pub fn multilocal(&self) -> Result<&MultilocalSection> {
        self.multilocal
            .as_ref()
            .ok_or_else(|| Error::MissingConfigKey {
                section: "multilocal".to_string(),
                key: "*".to_string(),
            })
    }

    pub fn libvirt(&self) -> Result<&LibvirtSection> {
        self.libvirt.as_ref().ok_or_else(|| Error::MissingConfigKey {
            section: "libvirt".to_string(),
            key: "*".to_string(),
        })
    }

    pub fn vurmd_libvirt(&self) -> Result<&VurmdLibvirtSection> {
        self.vurmd_libvirt
            .as_ref()
            .ok_or_else(|| Error::MissingConfigKey {
                section: "vurmd-libvirt".to_string(),
                key: "*".to_string(),
            })
    }
}

/// Default search path when no `-c/--config` is given: `/etc/vurm/vurm.conf`
/// first, then `~/.vurm.conf`. The first file that exists wins.
pub fn default_search_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from("/etc/vurm/vurm.conf")];
    if let Some(home) = dirs_home() {
        paths.push(home.join(".vurm.conf"));
    }
    paths
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

/// Loads settings from `path` if given, otherwise from the first existing
/// default search path.
pub fn load(path: Option<&Path>) -> Result<Settings> {
    let resolved = match path {
        Some(p) => p.to_path_buf(),
        None => {
            let candidates = default_search_paths();
            candidates
                .iter()
                .find(|p| p.exists())
                .cloned()
                .ok_or(Error::ConfigNotFound(candidates))?
        }
    };

    debug!("loading configuration from {resolved:?}");
    let ini = Ini::load_from_file(&resolved)?;
    parse(&ini)
}

fn get<'a>(ini: &'a Ini, section: &str, key: &str) -> Option<&'a str> {
    ini.section(Some(section)).and_then(|s| s.get(key))
}

fn require<'a>(ini: &'a Ini, section: &str, key: &str) -> Result<&'a str> {
    get(ini, section, key).ok_or_else(|| Error::MissingConfigKey {
        section: section.to_string(),
        key: key.to_string(),
    })
}

fn parse_bool(section: &str, key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        _ => Err(Error::InvalidConfigValue {
            section: section.to_string(),
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

fn parse_int<T: std::str::FromStr>(section: &str, key: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| Error::InvalidConfigValue {
        section: section.to_string(),
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse(ini: &Ini) -> Result<Settings> {
    let debug = match get(ini, "vurm", "debug") {
        Some(v) => parse_bool("vurm", "debug", v)?,
        None => false,
    };

    let vurmctld = if ini.section(Some("vurmctld")).is_some() {
        Some(VurmctldSection {
            endpoint: require(ini, "vurmctld", "endpoint")?.to_string(),
            slurmconfig: PathBuf::from(require(ini, "vurmctld", "slurmconfig")?),
            reconfigure: require(ini, "vurmctld", "reconfigure")?.to_string(),
        })
    } else {
        None
    };

    let vurm_client = if ini.section(Some("vurm-client")).is_some() {
        Some(VurmClientSection {
            endpoint: require(ini, "vurm-client", "endpoint")?.to_string(),
        })
    } else {
        None
    };

    let multilocal = if ini.section(Some("multilocal")).is_some() {
        Some(MultilocalSection {
            baseport: parse_int("multilocal", "baseport", require(ini, "multilocal", "baseport")?)?,
            slurmd: require(ini, "multilocal", "slurmd")?.to_string(),
        })
    } else {
        None
    };

    let libvirt = if ini.section(Some("libvirt")).is_some() {
        Some(LibvirtSection {
            nodes: require(ini, "libvirt", "nodes")?
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect(),
            domain_xml: PathBuf::from(require(ini, "libvirt", "domainXML")?),
        })
    } else {
        None
    };

    let vurmd_libvirt = if ini.section(Some("vurmd-libvirt")).is_some() {
        Some(VurmdLibvirtSection {
            endpoint: require(ini, "vurmd-libvirt", "endpoint")?.to_string(),
            hypervisor: require(ini, "vurmd-libvirt", "hypervisor")?.to_string(),
            key: PathBuf::from(require(ini, "vurmd-libvirt", "key")?),
            clonedir: PathBuf::from(require(ini, "vurmd-libvirt", "clonedir")?),
            clonebin: require(ini, "vurmd-libvirt", "clonebin")?.to_string(),
            username: require(ini, "vurmd-libvirt", "username")?.to_string(),
            sshport: parse_int(
                "vurmd-libvirt",
                "sshport",
                require(ini, "vurmd-libvirt", "sshport")?,
            )?,
            slurmconfig: PathBuf::from(require(ini, "vurmd-libvirt", "slurmconfig")?),
            slurmd: require(ini, "vurmd-libvirt", "slurmd")?.to_string(),
        })
    } else {
        None
    };

    Ok(Settings {
        vurm: VurmSection { debug },
        vurmctld,
        vurm_client,
        multilocal,
        libvirt,
        vurmd_libvirt,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_multilocal_section() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[vurm]\ndebug=true\n\n[vurmctld]\nendpoint=tcp:port=9000\nslurmconfig=/tmp/slurm.conf\nreconfigure=scontrol reconfigure\n\n[multilocal]\nbaseport=20000\nslurmd=echo {{nodeName}} {{hostname}} {{port}}\n"
        )
        .unwrap();

        let settings = load(Some(file.path())).unwrap();
        assert!(settings.vurm.debug);
        assert_eq!(settings.vurmctld().unwrap().endpoint, "tcp:port=9000");
        assert_eq!(settings.multilocal().unwrap().baseport, 20000);
    }

    #[test]
    fn missing_section_reports_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[vurm]\ndebug=false\n").unwrap();

        let settings = load(Some(file.path())).unwrap();
        assert!(matches!(
            settings.vurmctld(),
            Err(Error::MissingConfigKey { .. })
        ));
    }
}
