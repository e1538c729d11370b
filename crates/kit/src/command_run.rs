//! Helpers intended for [`std::process::Command`].
//!
//! Every external tool (virsh, qemu-img, virt-install, genisoimage, wget,
//! mkpasswd) is invoked through these helpers with an explicit argument
//! list, never a shell string.

use std::process::Command;

use color_eyre::eyre::{eyre, Context, Result};

/// Keep only the trailing bytes of captured stderr to avoid pathological
/// error messages.
const MAX_STDERR_BYTES: usize = 1024;

pub(crate) fn tail_utf8(buf: &[u8], max: usize) -> String {
    let start = buf.len().saturating_sub(max);
    String::from_utf8_lossy(&buf[start..]).trim().to_string()
}

/// Helpers for running external tools.
pub trait CommandRunExt {
    /// Execute the child process, discarding stdout. A non-zero exit status
    /// is an error carrying the tail of stderr.
    fn run(&mut self) -> Result<()>;

    /// Execute the child process and capture stdout as a string. A non-zero
    /// exit status is an error.
    fn run_get_string(&mut self) -> Result<String>;

    /// Execute the child process and return captured stdout on success, or
    /// `None` if it exited non-zero. For queries where failure is an
    /// expected outcome (e.g. asking about a domain that does not exist).
    fn run_get_string_optional(&mut self) -> Result<Option<String>>;
}

impl CommandRunExt for Command {
    fn run(&mut self) -> Result<()> {
        tracing::debug!("exec: {self:?}");
        let output = self
            .output()
            .with_context(|| format!("Failed to execute {:?}", self.get_program()))?;
        if !output.status.success() {
            let stderr = tail_utf8(&output.stderr, MAX_STDERR_BYTES);
            return Err(eyre!(
                "{:?} failed ({}): {}",
                self.get_program(),
                output.status,
                stderr
            ));
        }
        Ok(())
    }

    fn run_get_string(&mut self) -> Result<String> {
        self.run_get_string_optional()?
            .ok_or_else(|| eyre!("{:?} exited with a non-zero status", self.get_program()))
    }

    fn run_get_string_optional(&mut self) -> Result<Option<String>> {
        tracing::debug!("exec: {self:?}");
        let output = self
            .output()
            .with_context(|| format!("Failed to execute {:?}", self.get_program()))?;
        if !output.status.success() {
            tracing::debug!(
                "{:?} exited {}: {}",
                self.get_program(),
                output.status,
                tail_utf8(&output.stderr, MAX_STDERR_BYTES)
            );
            return Ok(None);
        }
        let stdout = String::from_utf8(output.stdout)
            .with_context(|| format!("Invalid UTF-8 in {:?} output", self.get_program()))?;
        Ok(Some(stdout))
    }
}
