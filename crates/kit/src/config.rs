//! Explicit tool configuration
//!
//! Every path the tool touches (shared image directory, session file,
//! templates directory) is carried in a [`Config`] value threaded through
//! the components, so tests can point each run at an isolated directory.

use camino::Utf8PathBuf;
use clap::Parser;

/// Default shared image directory on the hypervisor host
pub const DEFAULT_IMAGE_DIR: &str = "/isos";

/// Environment variable overriding the shared image directory
pub const IMAGE_DIR_ENV: &str = "VIRTUP_IMAGE_DIR";

/// Global CLI options shared by all subcommands
#[derive(Debug, Parser, Clone)]
pub struct GlobalOpts {
    /// Shared image directory holding base images, overlays and seed ISOs
    #[clap(long, env = IMAGE_DIR_ENV, default_value = DEFAULT_IMAGE_DIR)]
    pub image_dir: Utf8PathBuf,

    /// Session file recording the last configured VM
    #[clap(long, default_value = ".session")]
    pub session_file: Utf8PathBuf,

    /// Directory with the cloud-init template and config snippets
    #[clap(long, default_value = "templates")]
    pub templates_dir: Utf8PathBuf,

    /// Hypervisor connection URI (e.g. qemu:///system)
    #[clap(short = 'c', long = "connect", global = true)]
    pub connect: Option<String>,
}

/// Resolved configuration threaded through every component
#[derive(Debug, Clone)]
pub struct Config {
    pub image_dir: Utf8PathBuf,
    pub session_file: Utf8PathBuf,
    pub templates_dir: Utf8PathBuf,
    pub connect: Option<String>,
}

impl From<GlobalOpts> for Config {
    fn from(opts: GlobalOpts) -> Self {
        Self {
            image_dir: opts.image_dir,
            session_file: opts.session_file,
            templates_dir: opts.templates_dir,
            connect: opts.connect,
        }
    }
}

impl Config {
    /// Configuration rooted at a single directory, for tests.
    #[cfg(test)]
    pub fn for_tests(root: &camino::Utf8Path) -> Self {
        Self {
            image_dir: root.join("isos"),
            session_file: root.join(".session"),
            templates_dir: root.join("templates"),
            connect: None,
        }
    }

    /// Per-VM copy-on-write overlay image path
    pub fn overlay_path(&self, vm_name: &str) -> Utf8PathBuf {
        self.image_dir.join(format!("{vm_name}.qcow2"))
    }

    /// Per-VM cloud-init seed ISO path
    pub fn seed_iso_path(&self, vm_name: &str) -> Utf8PathBuf {
        self.image_dir.join(format!("{vm_name}-seed.iso"))
    }

    /// Merged cloud-init user-data document
    pub fn user_data_path(&self) -> Utf8PathBuf {
        self.image_dir.join("cloud-init.yml")
    }

    /// Instance metadata document
    pub fn meta_data_path(&self) -> Utf8PathBuf {
        self.image_dir.join("meta-data.yml")
    }

    /// Early-stage network configuration document (Ubuntu only)
    pub fn network_config_path(&self) -> Utf8PathBuf {
        self.image_dir.join("network-config.yml")
    }
}
