//! Session persistence
//!
//! The session file is a flat JSON record of the last configured VM. A
//! missing or unparseable file is treated as "no session" so a malformed
//! edit never blocks the tool; a fresh interview simply replaces it.

use std::process::Command;

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::eyre::{eyre, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::command_run::CommandRunExt;
use crate::distro::{Arch, Distro, Family};
use crate::prompt::Prompt;

/// Network attachment mode for the VM
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum NetworkMode {
    /// NAT through the libvirt default network
    Default,
    /// Direct (macvtap) attachment to a host interface
    Bridge,
}

/// Durable record of the VM currently being managed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub vm_name: String,
    pub hostname: String,
    pub username: String,
    pub distro: Distro,
    pub arch: Arch,
    pub ssh_key: Utf8PathBuf,
    pub hashed_password: String,
    pub network: NetworkMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bridge_interface: Option<String>,
}

/// Load/save access to the session file
#[derive(Debug, Clone)]
pub struct SessionStore {
    path: Utf8PathBuf,
}

impl SessionStore {
    pub fn new(path: impl Into<Utf8PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Load the persisted session. Missing or corrupt files yield `None`,
    /// never an error.
    pub fn load(&self) -> Option<Session> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) => {
                debug!("no session file at {}: {}", self.path, e);
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(session) => Some(session),
            Err(e) => {
                debug!("ignoring unparseable session file {}: {}", self.path, e);
                None
            }
        }
    }

    /// Persist a session, fully replacing any prior record. The write goes
    /// through a temporary file in the same directory and a rename so a
    /// crash mid-write leaves the previous record intact.
    pub fn save(&self, session: &Session) -> Result<()> {
        let json = serde_json::to_string_pretty(session)?;
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_str().is_empty())
            .unwrap_or(Utf8Path::new("."));
        let tmp = tempfile::NamedTempFile::new_in(dir)
            .with_context(|| format!("Failed to create temp file in {dir}"))?;
        std::fs::write(tmp.path(), json.as_bytes())?;
        tmp.persist(&self.path)
            .with_context(|| format!("Failed to write session file {}", self.path))?;
        Ok(())
    }

    /// Remove the session file if present.
    pub fn clear(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {}", self.path)),
        }
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }
}

/// Hash a password with the external `mkpasswd` tool (sha-512 crypt).
fn hash_password(password: &str) -> Result<String> {
    let hashed = Command::new("mkpasswd")
        .args(["-m", "sha-512", password])
        .run_get_string()
        .map_err(|e| {
            eyre!("mkpasswd failed (install it with 'apt install whois'): {e}")
        })?;
    Ok(hashed.trim().to_string())
}

/// List public SSH keys in `~/.ssh`, sorted by file name.
fn list_ssh_pub_keys() -> Result<Vec<Utf8PathBuf>> {
    let home = std::env::var("HOME").context("HOME is not set")?;
    let ssh_dir = Utf8PathBuf::from(home).join(".ssh");
    let mut keys = Vec::new();
    let entries = match ssh_dir.read_dir_utf8() {
        Ok(entries) => entries,
        Err(_) => return Ok(keys),
    };
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if path.extension() == Some("pub") && path.is_file() {
            keys.push(path.to_path_buf());
        }
    }
    keys.sort();
    Ok(keys)
}

/// Supported distribution choices offered by the interview
const DISTRO_CHOICES: &[(&str, Family, &str)] = &[
    ("debian/13", Family::Debian, "13"),
    ("debian/12", Family::Debian, "12"),
    ("ubuntu/24.04", Family::Ubuntu, "24.04"),
    ("ubuntu/22.04", Family::Ubuntu, "22.04"),
];

/// Interactively collect the parameters for a new VM.
pub fn interview(prompt: &mut dyn Prompt) -> Result<Session> {
    let pub_keys = list_ssh_pub_keys()?;
    collect_parameters(prompt, pub_keys, hash_password)
}

/// Interview core, parameterized over the available SSH keys and the
/// password hasher so it can run under a scripted prompt.
fn collect_parameters(
    prompt: &mut dyn Prompt,
    pub_keys: Vec<Utf8PathBuf>,
    hash: impl Fn(&str) -> Result<String>,
) -> Result<Session> {
    println!("\n--- New VM parameters ---");

    let arch_idx = prompt.select(
        "Target architecture",
        &["amd64 (x86_64)", "arm64 (aarch64)"],
        0,
    )?;
    let arch = if arch_idx == 1 { Arch::Arm64 } else { Arch::Amd64 };

    let distro_labels: Vec<&str> = DISTRO_CHOICES.iter().map(|(label, _, _)| *label).collect();
    let distro_idx = prompt.select("Distribution", &distro_labels, 0)?;
    let (_, family, version) = DISTRO_CHOICES[distro_idx];
    let distro = Distro::new(family, version);

    let vm_name = loop {
        let name = prompt.input("VM name", "debian13")?;
        if !name.trim().is_empty() {
            break name.trim().to_string();
        }
        println!("The VM name must not be empty.");
    };
    let hostname = vm_name.clone();
    let username = prompt.input("Username", "admin")?;

    let password = prompt.password("Password for the user")?;
    println!("Hashing password...");
    let hashed_password = hash(&password)?;

    let ssh_key = match pub_keys.len() {
        0 => return Err(eyre!("No public SSH keys (*.pub) found in ~/.ssh")),
        1 => {
            println!("Using the only available key: {}", pub_keys[0]);
            pub_keys[0].clone()
        }
        _ => {
            let names: Vec<&str> = pub_keys.iter().map(|p| p.as_str()).collect();
            let idx = prompt.select("SSH key", &names, 0)?;
            pub_keys[idx].clone()
        }
    };

    let (network, bridge_interface) = if prompt.confirm(
        "Attach the VM network directly to a host interface (bridge)? (No = default NAT)",
        false,
    )? {
        let iface = prompt.input("Bridge interface", "enp3s0")?;
        (NetworkMode::Bridge, Some(iface))
    } else {
        (NetworkMode::Default, None)
    };

    Ok(Session {
        vm_name,
        hostname,
        username,
        distro,
        arch,
        ssh_key,
        hashed_password,
        network,
        bridge_interface,
    })
}

/// Load the persisted session or run the interview and persist the result.
///
/// Returns the session and whether it came from the store.
pub fn load_or_create(store: &SessionStore, prompt: &mut dyn Prompt) -> Result<(Session, bool)> {
    if let Some(session) = store.load() {
        println!(
            "Session loaded: {} ({}, {})",
            session.vm_name, session.distro, session.arch
        );
        return Ok((session, true));
    }

    let session = interview(prompt)?;
    store.save(&session)?;
    Ok((session, false))
}
