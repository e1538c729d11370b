//! cloud-init artifact generation
//!
//! Builds the boot configuration bundle the NoCloud datasource consumes:
//! the merged user-data document, the instance meta-data, and (for Ubuntu)
//! a separate early-stage network-config. The network-config must be a
//! standalone artifact: cloud-init applies it in the local stage, before
//! the network-dependent `runcmd` steps, while a `network:` key inside
//! user-data would only take effect in the config stage. Ubuntu cloud
//! images ship a netplan config for `ens3` (i440fx naming), but under
//! q35/virtio the NIC is `enp1s0`, so we match all `en*` interfaces.

use std::collections::BTreeMap;

use camino::Utf8Path;
use color_eyre::eyre::{eyre, Context, Result};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;

use crate::config::Config;
use crate::distro::{Distro, Family};
use crate::prompt::Prompt;
use crate::session::Session;
use crate::storage;

/// Interface matcher inside a netplan ethernet entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchConfig {
    pub name: String,
}

/// One netplan ethernet entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EthernetConfig {
    #[serde(rename = "match")]
    pub match_: MatchConfig,
    pub dhcp4: bool,
    pub dhcp6: bool,
}

/// Early-stage network configuration document (netplan schema v2)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub version: u32,
    pub ethernets: BTreeMap<String, EthernetConfig>,
}

/// Build the network-config document for a distribution.
///
/// Debian images boot correctly with their default network behavior and
/// get no document; Ubuntu images get DHCPv4 on every `en*` interface.
pub fn build_network_config(distro: &Distro) -> Option<NetworkConfig> {
    match distro.family {
        Family::Debian => None,
        Family::Ubuntu => {
            let mut ethernets = BTreeMap::new();
            ethernets.insert(
                "all-en".to_string(),
                EthernetConfig {
                    match_: MatchConfig {
                        name: "en*".to_string(),
                    },
                    dhcp4: true,
                    dhcp6: false,
                },
            );
            Some(NetworkConfig {
                version: 2,
                ethernets,
            })
        }
    }
}

/// Write the network-config document when one applies; returns its path.
pub fn write_network_config(cfg: &Config, distro: &Distro) -> Result<Option<camino::Utf8PathBuf>> {
    let Some(net) = build_network_config(distro) else {
        return Ok(None);
    };
    let path = cfg.network_config_path();
    let body = serde_yaml::to_string(&net)?;
    std::fs::write(&path, body).with_context(|| format!("Failed to write {path}"))?;
    println!("network-config written for Ubuntu ({path}).");
    Ok(Some(path))
}

/// Render the instance meta-data document.
///
/// The unix timestamp inside the instance id makes every (re)provisioning
/// a logically new instance even when the VM name is reused.
pub fn build_metadata(vm_name: &str, hostname: Option<&str>, unix_ts: i64) -> String {
    let hostname = hostname.unwrap_or(vm_name);
    format!("instance-id: {vm_name}-{unix_ts}\nlocal-hostname: {hostname}\n")
}

/// Write the meta-data document stamped with the current time.
pub fn write_metadata(cfg: &Config, vm_name: &str, hostname: Option<&str>) -> Result<()> {
    let path = cfg.meta_data_path();
    let body = build_metadata(vm_name, hostname, chrono::Utc::now().timestamp());
    std::fs::write(&path, body).with_context(|| format!("Failed to write {path}"))?;
    println!("meta-data written (hostname: {}).", hostname.unwrap_or(vm_name));
    Ok(())
}

/// Merge the static cloud-init template with the user/credential section
/// and the run commands, returning the full `#cloud-config` document.
pub fn render_user_data(
    template: &str,
    session: &Session,
    ssh_key_content: &str,
    package_runcmd: &[String],
    scripts: &[String],
) -> Result<String> {
    let mut doc: Value = if template.trim().is_empty() {
        Value::Mapping(Default::default())
    } else {
        serde_yaml::from_str(template).context("Failed to parse the cloud-init template")?
    };
    let map = doc
        .as_mapping_mut()
        .ok_or_else(|| eyre!("The cloud-init template must be a YAML mapping"))?;

    let user = serde_yaml::to_value(UserEntry {
        name: session.username.clone(),
        passwd: session.hashed_password.clone(),
        groups: vec!["sudo".into()],
        shell: "/bin/bash".into(),
        sudo: vec!["ALL=(ALL) NOPASSWD:ALL".into()],
        ssh_authorized_keys: vec![ssh_key_content.trim().to_string()],
    })?;
    map.insert("users".into(), Value::Sequence(vec![user]));

    let mut runcmd: Vec<Value> = package_runcmd
        .iter()
        .filter(|line| !line.trim().is_empty())
        .map(|line| Value::String(line.trim().to_string()))
        .collect();
    runcmd.extend(scripts.iter().map(|s| Value::String(s.clone())));
    map.insert("runcmd".into(), Value::Sequence(runcmd));

    let body = serde_yaml::to_string(&doc)?;
    Ok(format!("#cloud-config\n{body}"))
}

#[derive(Debug, Serialize)]
struct UserEntry {
    name: String,
    passwd: String,
    groups: Vec<String>,
    shell: String,
    sudo: Vec<String>,
    ssh_authorized_keys: Vec<String>,
}

/// Validate that a written document parses as YAML.
pub fn validate_yaml(path: &Utf8Path) -> Result<()> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("Failed to read {path}"))?;
    serde_yaml::from_str::<Value>(&raw)
        .map(|_| ())
        .with_context(|| format!("Invalid YAML document: {path}"))
}

/// Template files feeding the user-data merge
pub struct Templates {
    pub template: String,
    pub package_runcmd: Vec<String>,
    pub scripts: Vec<String>,
}

/// URL the provisioning tools script can be fetched from when missing
const TOOLS_SCRIPT_URL: &str =
    "https://github.com/wlanboy/vagrantkind/raw/refs/heads/main/amd64-tools.sh";

/// Load the template and config snippets from the templates directory.
///
/// The tools script may be downloaded on confirmation; the other files are
/// hard prerequisites.
pub fn load_templates(cfg: &Config, prompt: &mut dyn Prompt) -> Result<Templates> {
    let template_file = cfg.templates_dir.join("cloud-init-template.yml");
    let package_file = cfg.templates_dir.join("package-config.txt");
    let system_file = cfg.templates_dir.join("system-config.txt");
    let tools_file = cfg.templates_dir.join("amd64-tools.sh");

    if !storage::ensure_file(&template_file, None, prompt)? {
        return Err(eyre!("Missing template: {template_file}"));
    }
    if !storage::ensure_file(&package_file, None, prompt)? {
        return Err(eyre!("Missing template: {package_file}"));
    }
    if !storage::ensure_file(&system_file, None, prompt)? {
        return Err(eyre!("Missing template: {system_file}"));
    }
    storage::ensure_file(&tools_file, Some(TOOLS_SCRIPT_URL), prompt)?;

    let template = std::fs::read_to_string(&template_file)?;
    let package_runcmd = std::fs::read_to_string(&package_file)?
        .lines()
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .collect();
    let scripts = vec![
        std::fs::read_to_string(&tools_file)?,
        std::fs::read_to_string(&system_file)?,
    ];

    Ok(Templates {
        template,
        package_runcmd,
        scripts,
    })
}

/// Render user-data into the shared image directory and validate it.
pub fn write_user_data(
    cfg: &Config,
    session: &Session,
    templates: &Templates,
) -> Result<()> {
    let ssh_key_content = std::fs::read_to_string(&session.ssh_key)
        .with_context(|| format!("Failed to read SSH key {}", session.ssh_key))?;
    let body = render_user_data(
        &templates.template,
        session,
        &ssh_key_content,
        &templates.package_runcmd,
        &templates.scripts,
    )?;
    let path = cfg.user_data_path();
    std::fs::write(&path, body).with_context(|| format!("Failed to write {path}"))?;
    validate_yaml(&path)?;
    println!("cloud-init user-data written: {path}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::NetworkMode;
    use camino::Utf8PathBuf;

    fn ubuntu() -> Distro {
        Distro::new(Family::Ubuntu, "24.04")
    }

    fn debian() -> Distro {
        Distro::new(Family::Debian, "13")
    }

    fn sample_session() -> Session {
        Session {
            vm_name: "vm1".into(),
            hostname: "vm1".into(),
            username: "admin".into(),
            distro: debian(),
            arch: crate::distro::Arch::Amd64,
            ssh_key: Utf8PathBuf::from("/dev/null"),
            hashed_password: "$6$salt$hash".into(),
            network: NetworkMode::Default,
            bridge_interface: None,
        }
    }

    #[test]
    fn test_network_config_none_for_debian() {
        assert!(build_network_config(&debian()).is_none());
        assert!(build_network_config(&Distro::new(Family::Debian, "12")).is_none());
    }

    #[test]
    fn test_network_config_shape_for_ubuntu() {
        let net = build_network_config(&ubuntu()).unwrap();
        assert_eq!(net.version, 2);
        assert_eq!(net.ethernets.len(), 1);
        let eth = net.ethernets.get("all-en").unwrap();
        assert_eq!(eth.match_.name, "en*");
        assert!(eth.dhcp4);
        assert!(!eth.dhcp6);
    }

    #[test]
    fn test_network_config_yaml_roundtrip() {
        let net = build_network_config(&ubuntu()).unwrap();
        let yaml = serde_yaml::to_string(&net).unwrap();
        let parsed: NetworkConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed, net);
        assert!(yaml.contains("version: 2"));
        assert!(yaml.contains("name: en*"));
    }

    #[test]
    fn test_metadata_hostname_defaults_to_vm_name() {
        let body = build_metadata("myvm", None, 12345);
        assert!(body.contains("instance-id: myvm-12345"));
        assert!(body.contains("local-hostname: myvm"));
    }

    #[test]
    fn test_metadata_explicit_hostname_keeps_vm_instance_id() {
        let body = build_metadata("myvm", Some("custom-host"), 99999);
        assert!(body.contains("instance-id: myvm-99999"));
        assert!(body.contains("local-hostname: custom-host"));
    }

    #[test]
    fn test_render_user_data_shape() {
        let template = "package_update: true\n";
        let runcmd = vec!["apt-get install -y curl".to_string()];
        let scripts = vec!["#!/bin/bash\necho tools\n".to_string()];
        let body = render_user_data(
            template,
            &sample_session(),
            "ssh-ed25519 AAAA test@host\n",
            &runcmd,
            &scripts,
        )
        .unwrap();

        assert!(body.starts_with("#cloud-config\n"));
        let doc: Value = serde_yaml::from_str(&body).unwrap();
        assert_eq!(doc["package_update"], Value::Bool(true));
        let users = doc["users"].as_sequence().unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0]["name"], Value::String("admin".into()));
        assert_eq!(users[0]["passwd"], Value::String("$6$salt$hash".into()));
        assert_eq!(
            users[0]["ssh_authorized_keys"][0],
            Value::String("ssh-ed25519 AAAA test@host".into())
        );
        let cmds = doc["runcmd"].as_sequence().unwrap();
        assert_eq!(cmds.len(), 2);
        assert_eq!(cmds[0], Value::String("apt-get install -y curl".into()));
    }

    #[test]
    fn test_render_user_data_empty_template() {
        let body =
            render_user_data("", &sample_session(), "key", &[], &[]).unwrap();
        let doc: Value = serde_yaml::from_str(&body).unwrap();
        assert!(doc["users"].as_sequence().is_some());
    }

    #[test]
    fn test_render_user_data_non_mapping_template_fails() {
        let err = render_user_data("- just\n- a\n- list\n", &sample_session(), "key", &[], &[])
            .unwrap_err();
        assert!(err.to_string().contains("mapping"));
    }

    #[test]
    fn test_validate_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        let good = root.join("good.yml");
        std::fs::write(&good, "key: value\n").unwrap();
        assert!(validate_yaml(&good).is_ok());

        let bad = root.join("bad.yml");
        std::fs::write(&bad, "key: [\nbroken: {unclosed").unwrap();
        assert!(validate_yaml(&bad).is_err());
    }
}
