//! Shared image directory and disk image preparation
//!
//! Ensures the shared image directory exists with the expected ownership
//! (current user, `kvm` group), fetches missing base cloud images after
//! confirmation, and maintains the per-VM qcow2 overlay on top of the
//! immutable base image.

use std::os::unix::fs::MetadataExt;
use std::process::Command;

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::eyre::{eyre, Context, Result};
use tracing::debug;

use crate::command_run::CommandRunExt;
use crate::config::Config;
use crate::distro::{self, Arch, Distro};
use crate::prompt::Prompt;

/// Fixed capacity of every VM overlay image
const OVERLAY_SIZE: &str = "30G";

/// Group expected to co-own the shared image directory
const IMAGE_DIR_GROUP: &str = "kvm";

/// Parse one `getent group` line (`name:x:gid:members`) into its gid.
pub(crate) fn parse_group_line(line: &str) -> Option<u32> {
    line.split(':').nth(2)?.trim().parse().ok()
}

/// Look up a group id via the `getent` tool.
fn group_gid(name: &str) -> Result<u32> {
    let line = Command::new("getent")
        .args(["group", name])
        .run_get_string()
        .with_context(|| format!("Failed to look up group '{name}'"))?;
    parse_group_line(&line).ok_or_else(|| eyre!("Unparseable getent output for group '{name}'"))
}

/// Ensure the shared image directory exists and is owned by the current
/// user and the `kvm` group. Creation and ownership fixes go through sudo
/// after confirmation; declining either is fatal.
pub fn ensure_image_dir(cfg: &Config, prompt: &mut dyn Prompt) -> Result<()> {
    let dir = &cfg.image_dir;
    let uid = rustix::process::getuid().as_raw();

    if dir.exists() {
        let meta = std::fs::metadata(dir)?;
        let kvm_gid = group_gid(IMAGE_DIR_GROUP)?;
        if meta.uid() == uid && meta.gid() == kvm_gid {
            debug!("{dir} exists with expected ownership");
            return Ok(());
        }
        println!("{dir} exists but is not owned by uid {uid} and group {IMAGE_DIR_GROUP}.");
        if !prompt.confirm("Fix ownership?", true)? {
            return Err(eyre!("Aborted: {dir} has wrong ownership"));
        }
        Command::new("sudo")
            .args(["chown", &format!("{uid}:{IMAGE_DIR_GROUP}"), dir.as_str()])
            .run()?;
        println!("Ownership of {dir} corrected.");
        return Ok(());
    }

    println!("{dir} does not exist.");
    if !prompt.confirm(&format!("Create {dir}?"), true)? {
        return Err(eyre!("Aborted: {dir} is required"));
    }
    Command::new("sudo").args(["mkdir", "-p", dir.as_str()]).run()?;
    Command::new("sudo")
        .args(["chown", &format!("{uid}:{IMAGE_DIR_GROUP}"), dir.as_str()])
        .run()?;
    println!("{dir} created.");
    Ok(())
}

/// Ensure a file exists, offering a download when a URL is known.
///
/// Missing file without a URL returns `false`; a declined or failed
/// download is fatal.
pub fn ensure_file(path: &Utf8Path, download_url: Option<&str>, prompt: &mut dyn Prompt) -> Result<bool> {
    if path.is_file() {
        return Ok(true);
    }
    println!("Missing file: {path}");
    let Some(url) = download_url else {
        return Ok(false);
    };
    println!("Available for download from:\n  {url}");
    if !prompt.confirm("Download now?", true)? {
        return Err(eyre!("Aborted: {path} is required"));
    }
    println!("Downloading {}...", path.file_name().unwrap_or("file"));
    Command::new("wget")
        .args(["-O", path.as_str(), url])
        .run()
        .with_context(|| format!("Download of {url} failed"))?;
    println!("Download finished.");
    Ok(true)
}

/// Ensure the base cloud image for (distro, arch) is present, downloading
/// it after confirmation. Returns the base image path.
pub fn ensure_base_image(
    cfg: &Config,
    prompt: &mut dyn Prompt,
    distro: &Distro,
    arch: Arch,
) -> Result<Utf8PathBuf> {
    let src = distro::resolve(distro, arch);
    let path = cfg.image_dir.join(&src.file_name);

    if path.exists() {
        println!("Base image for {distro} ({arch}) present.");
        return Ok(path);
    }

    println!("Base image for {distro} ({arch}) is missing.");
    if !prompt.confirm(
        &format!("Download the {distro} {arch} cloud image?"),
        true,
    )? {
        return Err(eyre!("Aborted: base image is required"));
    }
    Command::new("wget")
        .args(["-O", path.as_str(), &src.url])
        .run()
        .with_context(|| format!("Download of {} failed", src.url))?;
    println!("Base image downloaded: {path}");
    Ok(path)
}

/// Ensure the per-VM copy-on-write overlay exists on top of the base image.
///
/// The base image must already exist, no matter whether an overlay file is
/// present. An existing overlay may be kept as-is (not an error) or
/// deleted and recreated.
pub fn ensure_overlay_image(
    cfg: &Config,
    prompt: &mut dyn Prompt,
    vm_name: &str,
    distro: &Distro,
    arch: Arch,
) -> Result<Utf8PathBuf> {
    let overlay = cfg.overlay_path(vm_name);
    let src = distro::resolve(distro, arch);
    let base = cfg.image_dir.join(&src.file_name);

    if !base.exists() {
        return Err(eyre!("Base image for {distro} ({arch}) not found at {base}"));
    }

    if overlay.exists() {
        println!("Overlay image already exists: {overlay}");
        if !prompt.confirm("Delete and recreate it?", true)? {
            return Ok(overlay);
        }
        std::fs::remove_file(&overlay)
            .with_context(|| format!("Failed to remove {overlay}"))?;
    }

    println!("Creating overlay image ({arch})...");
    Command::new("qemu-img")
        .args([
            "create",
            "-f",
            "qcow2",
            "-F",
            "qcow2",
            "-b",
            base.as_str(),
            overlay.as_str(),
            OVERLAY_SIZE,
        ])
        .run()?;
    println!("Overlay image created: {overlay} (base: {})", src.file_name);
    Ok(overlay)
}
