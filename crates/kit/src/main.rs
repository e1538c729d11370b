//! virtup - interactive provisioning of cloud-init based VMs on libvirt

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Report, Result};

mod cloudinit;
mod command_run;
mod config;
mod distro;
mod launch;
mod lifecycle;
mod prompt;
mod session;
mod storage;
mod virsh;
mod wait;

use config::{Config, GlobalOpts};
use prompt::{Prompt, TermPrompt};
use session::SessionStore;
use virsh::Virsh;
use wait::WaitPolicy;

/// Provision and manage cloud-init based VMs on a local libvirt host.
///
/// virtup walks through an interactive interview once, persists the
/// answers as a session, and from then on reconciles the named VM against
/// the hypervisor: download the base cloud image, build the overlay and
/// cloud-init artifacts, define and start the domain, and report its SSH
/// address.
#[derive(Parser)]
#[command(version)]
struct Cli {
    #[clap(flatten)]
    global: GlobalOpts,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Bring the configured VM up (interview on first run)
    Up,
    /// Resolve and print the running VM's SSH address
    Ip,
    /// Destroy the configured VM and its disk artifacts
    Rm,
    /// Inspect or clear the persisted session
    Session {
        #[command(subcommand)]
        command: SessionCmds,
    },
}

#[derive(Subcommand)]
enum SessionCmds {
    /// Print the persisted session
    Show,
    /// Forget the persisted session (the VM itself is untouched)
    Clear,
}

/// Build the VM from scratch: artifacts, disks, domain.
fn provision(
    cfg: &Config,
    hv: &Virsh,
    prompt: &mut dyn Prompt,
    session: &session::Session,
) -> Result<()> {
    let templates = cloudinit::load_templates(cfg, prompt)?;

    storage::ensure_image_dir(cfg, prompt)?;
    cloudinit::write_user_data(cfg, session, &templates)?;
    cloudinit::write_metadata(cfg, &session.vm_name, Some(session.hostname.as_str()))?;
    cloudinit::write_network_config(cfg, &session.distro)?;

    storage::ensure_base_image(cfg, prompt, &session.distro, session.arch)?;
    storage::ensure_overlay_image(cfg, prompt, &session.vm_name, &session.distro, session.arch)?;

    if !launch::launch(cfg, session, prompt)? {
        return Ok(());
    }

    if prompt.confirm("Wait for the VM to boot and resolve its address?", true)? {
        wait::wait_for_running(hv, &session.vm_name, WaitPolicy::running())?;
        let ip = wait::resolve_ip(hv, &session.vm_name, WaitPolicy::address())?;
        wait::print_ssh_command(&session.username, &ip);
    }
    Ok(())
}

fn cmd_up(cfg: &Config, prompt: &mut dyn Prompt) -> Result<()> {
    let store = SessionStore::new(cfg.session_file.clone());
    let hv = Virsh::new(cfg.connect.clone());

    let (session, persisted) = session::load_or_create(&store, prompt)?;
    if persisted {
        match lifecycle::reconcile(&hv, prompt, cfg, &session, WaitPolicy::address())? {
            lifecycle::Reconciled::Done => return Ok(()),
            lifecycle::Reconciled::Provision => {}
        }
    }
    provision(cfg, &hv, prompt, &session)
}

fn cmd_ip(cfg: &Config) -> Result<()> {
    let store = SessionStore::new(cfg.session_file.clone());
    let session = store
        .load()
        .ok_or_else(|| eyre!("No session found; run 'virtup up' first"))?;
    let hv = Virsh::new(cfg.connect.clone());

    wait::wait_for_running(&hv, &session.vm_name, WaitPolicy::running())?;
    let ip = wait::resolve_ip(&hv, &session.vm_name, WaitPolicy::address())?;
    wait::print_ssh_command(&session.username, &ip);
    Ok(())
}

fn cmd_rm(cfg: &Config, prompt: &mut dyn Prompt) -> Result<()> {
    let store = SessionStore::new(cfg.session_file.clone());
    let session = store
        .load()
        .ok_or_else(|| eyre!("No session found; nothing to remove"))?;

    if !prompt.confirm(
        &format!("Destroy VM '{}' and delete its disks?", session.vm_name),
        false,
    )? {
        println!("Nothing removed.");
        return Ok(());
    }
    let hv = Virsh::new(cfg.connect.clone());
    lifecycle::delete_domain(&hv, cfg, &session.vm_name)?;
    println!("VM '{}' removed.", session.vm_name);
    Ok(())
}

fn cmd_session(cfg: &Config, command: SessionCmds) -> Result<()> {
    let store = SessionStore::new(cfg.session_file.clone());
    match command {
        SessionCmds::Show => match store.load() {
            Some(session) => {
                println!("{}", serde_json::to_string_pretty(&session)?);
                Ok(())
            }
            None => Err(eyre!("No session found at {}", store.path())),
        },
        SessionCmds::Clear => {
            store.clear()?;
            println!("Session cleared.");
            Ok(())
        }
    }
}

fn install_tracing() {
    use tracing_error::ErrorLayer;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let format = fmt::format().without_time().with_target(false).compact();

    let fmt_layer = fmt::layer()
        .event_format(format)
        .with_writer(std::io::stderr);
    let filter_layer = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .with(ErrorLayer::default())
        .init();
}

fn main() -> Result<(), Report> {
    install_tracing();
    color_eyre::install()?;

    let cli = Cli::parse();
    let cfg = Config::from(cli.global);
    let mut prompt = TermPrompt;

    match cli.command {
        Commands::Up => cmd_up(&cfg, &mut prompt)?,
        Commands::Ip => cmd_ip(&cfg)?,
        Commands::Rm => cmd_rm(&cfg, &mut prompt)?,
        Commands::Session { command } => cmd_session(&cfg, command)?,
    }
    Ok(())
}
