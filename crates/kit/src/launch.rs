//! virt-install invocation
//!
//! Translates a configured session into a virt-install argument list and
//! runs it. The argument list is built as a pure function so the per-arch
//! and per-network wiring can be tested without a hypervisor.

use std::process::Command;

use camino::Utf8Path;
use color_eyre::eyre::{Context, Result};
use tracing::debug;

use crate::command_run::CommandRunExt;
use crate::config::Config;
use crate::distro::{self, Arch, Family};
use crate::prompt::Prompt;
use crate::session::{NetworkMode, Session};

/// Default VM memory in MiB
const MEMORY_MIB: u32 = 4096;

/// Default VM vcpu count
const VCPUS: u32 = 2;

/// Virtualization, machine and CPU settings for an architecture
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchPolicy {
    pub virt_type: &'static str,
    pub machine: &'static str,
    pub cpu: &'static str,
    pub arch: &'static str,
}

/// Pick virtualization settings for the target architecture.
///
/// arm64 guests are emulated (the host is assumed x86_64), so they get
/// qemu with the generic virt machine and the max CPU model. Everything
/// else runs KVM-accelerated with host passthrough.
pub fn arch_policy(arch: Arch) -> ArchPolicy {
    match arch {
        Arch::Arm64 => ArchPolicy {
            virt_type: "qemu",
            machine: "virt",
            cpu: "max",
            arch: "aarch64",
        },
        Arch::Amd64 => ArchPolicy {
            virt_type: "kvm",
            machine: "q35",
            cpu: "host-passthrough",
            arch: "x86_64",
        },
    }
}

/// The `--network` argument for the session's network mode.
pub fn network_arg(session: &Session) -> String {
    match session.network {
        NetworkMode::Bridge => {
            let iface = session.bridge_interface.as_deref().unwrap_or("enp3s0");
            format!("type=direct,source={iface},source_mode=bridge,model=virtio")
        }
        NetworkMode::Default => "network=default,model=virtio".to_string(),
    }
}

/// Build the full virt-install argument list for a session.
///
/// Ubuntu guests boot from a seed ISO attached as a scsi cdrom; their
/// cloud images ignore the inline `--cloud-init` channel for network
/// configuration. Debian guests take user-data and meta-data inline.
pub fn build_virt_install_args(cfg: &Config, session: &Session) -> Vec<String> {
    let policy = arch_policy(session.arch);
    let overlay = cfg.overlay_path(&session.vm_name);
    let os_variant = distro::resolve(&session.distro, session.arch).os_variant;

    let mut args: Vec<String> = vec![
        "--name".into(),
        session.vm_name.clone(),
        "--memory".into(),
        MEMORY_MIB.to_string(),
        "--vcpus".into(),
        VCPUS.to_string(),
        "--arch".into(),
        policy.arch.into(),
        "--machine".into(),
        policy.machine.into(),
        "--virt-type".into(),
        policy.virt_type.into(),
        "--cpu".into(),
        policy.cpu.into(),
        "--disk".into(),
        format!("{overlay},device=disk,bus=virtio"),
        "--os-variant".into(),
        os_variant,
        "--network".into(),
        network_arg(session),
    ];

    match session.distro.family {
        Family::Ubuntu => {
            let seed = cfg.seed_iso_path(&session.vm_name);
            args.push("--disk".into());
            args.push(format!("{seed},device=cdrom,bus=scsi"));
        }
        Family::Debian => {
            args.push("--cloud-init".into());
            args.push(format!(
                "user-data={},meta-data={}",
                cfg.user_data_path(),
                cfg.meta_data_path()
            ));
        }
    }

    args.extend(
        [
            "--graphics",
            "none",
            "--console",
            "pty,target_type=serial",
            "--boot",
            "uefi",
            "--noautoconsole",
            "--import",
        ]
        .map(String::from),
    );
    args
}

/// Build the cloud-init seed ISO for an Ubuntu guest.
///
/// The NoCloud datasource requires the fixed file names `user-data`,
/// `meta-data` and `network-config` inside a volume labelled `cidata`,
/// so the documents are staged under those names first.
pub fn create_seed_iso(cfg: &Config, vm_name: &str) -> Result<()> {
    let staging = tempfile::tempdir().context("Failed to create seed staging directory")?;
    let staging_path = Utf8Path::from_path(staging.path())
        .ok_or_else(|| color_eyre::eyre::eyre!("Non-UTF-8 temporary directory path"))?;

    let stage = |src: camino::Utf8PathBuf, name: &str| -> Result<()> {
        std::fs::copy(&src, staging_path.join(name))
            .with_context(|| format!("Failed to stage {src} as {name}"))?;
        Ok(())
    };
    stage(cfg.user_data_path(), "user-data")?;
    stage(cfg.meta_data_path(), "meta-data")?;
    stage(cfg.network_config_path(), "network-config")?;

    let seed = cfg.seed_iso_path(vm_name);
    Command::new("genisoimage")
        .args(["-output", seed.as_str()])
        .args(["-volid", "cidata"])
        .args(["-joliet", "-rock"])
        .arg(staging_path)
        .run()
        .context("genisoimage failed")?;
    println!("Seed ISO created: {seed}");
    Ok(())
}

/// Define and start the VM, after confirmation.
///
/// Returns false when the user declines; nothing has been touched then.
pub fn launch(cfg: &Config, session: &Session, prompt: &mut dyn Prompt) -> Result<bool> {
    if !prompt.confirm(&format!("Create and start VM '{}'?", session.vm_name), true)? {
        println!("VM creation skipped.");
        return Ok(false);
    }

    if session.distro.family == Family::Ubuntu {
        create_seed_iso(cfg, &session.vm_name)?;
    }

    let args = build_virt_install_args(cfg, session);
    debug!("virt-install args: {args:?}");
    let mut cmd = Command::new("virt-install");
    if let Some(uri) = &cfg.connect {
        cmd.args(["--connect", uri]);
    }
    cmd.args(&args).run().context("virt-install failed")?;
    println!("VM '{}' started.", session.vm_name);
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distro::Distro;
    use crate::prompt::testing::{Answer, ScriptedPrompt};
    use camino::Utf8PathBuf;

    fn session(family: Family, arch: Arch, network: NetworkMode) -> Session {
        Session {
            vm_name: "vm1".into(),
            hostname: "vm1".into(),
            username: "admin".into(),
            distro: match family {
                Family::Debian => Distro::new(Family::Debian, "13"),
                Family::Ubuntu => Distro::new(Family::Ubuntu, "24.04"),
            },
            arch,
            ssh_key: Utf8PathBuf::from("/home/u/.ssh/id_ed25519.pub"),
            hashed_password: "$6$x$y".into(),
            network,
            bridge_interface: match network {
                NetworkMode::Bridge => Some("enp3s0".into()),
                NetworkMode::Default => None,
            },
        }
    }

    fn cfg() -> Config {
        Config::for_tests(Utf8Path::new("/tmp/t"))
    }

    fn pair_after(args: &[String], flag: &str) -> String {
        let idx = args.iter().position(|a| a == flag).unwrap();
        args[idx + 1].clone()
    }

    #[test]
    fn test_arch_policy_amd64() {
        let p = arch_policy(Arch::Amd64);
        assert_eq!(p.virt_type, "kvm");
        assert_eq!(p.machine, "q35");
        assert_eq!(p.cpu, "host-passthrough");
        assert_eq!(p.arch, "x86_64");
    }

    #[test]
    fn test_arch_policy_arm64_is_emulated() {
        let p = arch_policy(Arch::Arm64);
        assert_eq!(p.virt_type, "qemu");
        assert_eq!(p.machine, "virt");
        assert_eq!(p.cpu, "max");
        assert_eq!(p.arch, "aarch64");
    }

    #[test]
    fn test_network_arg_default() {
        let s = session(Family::Debian, Arch::Amd64, NetworkMode::Default);
        assert_eq!(network_arg(&s), "network=default,model=virtio");
    }

    #[test]
    fn test_network_arg_bridge() {
        let s = session(Family::Debian, Arch::Amd64, NetworkMode::Bridge);
        assert_eq!(
            network_arg(&s),
            "type=direct,source=enp3s0,source_mode=bridge,model=virtio"
        );
    }

    #[test]
    fn test_args_debian_uses_inline_cloud_init() {
        let args = build_virt_install_args(&cfg(), &session(Family::Debian, Arch::Amd64, NetworkMode::Default));
        let ci = pair_after(&args, "--cloud-init");
        assert!(ci.contains("user-data=/tmp/t/isos/cloud-init.yml"));
        assert!(ci.contains("meta-data=/tmp/t/isos/meta-data.yml"));
        assert!(!args.iter().any(|a| a.contains("seed.iso")));
    }

    #[test]
    fn test_args_ubuntu_attaches_seed_cdrom() {
        let args = build_virt_install_args(&cfg(), &session(Family::Ubuntu, Arch::Amd64, NetworkMode::Default));
        assert!(args
            .iter()
            .any(|a| a == "/tmp/t/isos/vm1-seed.iso,device=cdrom,bus=scsi"));
        assert!(!args.iter().any(|a| a == "--cloud-init"));
    }

    #[test]
    fn test_args_common_shape() {
        let args = build_virt_install_args(&cfg(), &session(Family::Debian, Arch::Amd64, NetworkMode::Default));
        assert_eq!(pair_after(&args, "--name"), "vm1");
        assert_eq!(pair_after(&args, "--memory"), "4096");
        assert_eq!(pair_after(&args, "--vcpus"), "2");
        assert_eq!(pair_after(&args, "--os-variant"), "debian13");
        assert_eq!(pair_after(&args, "--graphics"), "none");
        assert_eq!(pair_after(&args, "--console"), "pty,target_type=serial");
        assert_eq!(pair_after(&args, "--boot"), "uefi");
        assert_eq!(
            pair_after(&args, "--disk"),
            "/tmp/t/isos/vm1.qcow2,device=disk,bus=virtio"
        );
        assert!(args.contains(&"--noautoconsole".to_string()));
        assert!(args.contains(&"--import".to_string()));
    }

    #[test]
    fn test_args_arm64_wiring() {
        let args = build_virt_install_args(&cfg(), &session(Family::Debian, Arch::Arm64, NetworkMode::Default));
        assert_eq!(pair_after(&args, "--arch"), "aarch64");
        assert_eq!(pair_after(&args, "--virt-type"), "qemu");
        assert_eq!(pair_after(&args, "--machine"), "virt");
        assert_eq!(pair_after(&args, "--cpu"), "max");
    }

    #[test]
    fn test_launch_declined_is_clean_noop() {
        let s = session(Family::Debian, Arch::Amd64, NetworkMode::Default);
        let mut prompt = ScriptedPrompt::new([Answer::Confirm(false)]);
        let launched = launch(&cfg(), &s, &mut prompt).unwrap();
        assert!(!launched);
    }

    #[test]
    fn test_launch_declined_stages_no_seed_iso_for_ubuntu() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        let cfg = Config::for_tests(root);
        std::fs::create_dir_all(&cfg.image_dir).unwrap();

        let s = session(Family::Ubuntu, Arch::Amd64, NetworkMode::Default);
        let mut prompt = ScriptedPrompt::new([Answer::Confirm(false)]);
        let launched = launch(&cfg, &s, &mut prompt).unwrap();

        assert!(!launched);
        // The confirmation is asked first; nothing is written on decline.
        assert_eq!(prompt.asked.len(), 1);
        assert!(!cfg.seed_iso_path(&s.vm_name).exists());
    }
}
