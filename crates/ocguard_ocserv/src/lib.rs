//! Control of a local ocserv instance through `occtl` and `ocpasswd`.

use std::{
    path::{Path, PathBuf},
    process::Output,
};

use tokio::{io::AsyncWriteExt, process::Command};
use tracing::{debug, info};

pub mod error;
pub mod session;

pub use crate::{
    error::OcservError,
    session::{OcservSession, parse_sessions},
};

const OCCTL: &str = "occtl";
const OCPASSWD: &str = "ocpasswd";
const OCSERV: &str = "ocserv";

/// Operations on the running VPN server needed to enforce quotas.
///
/// None of the calls are retried; dropping a returned future kills the
/// underlying process.
#[trait_variant::make(Send)]
pub trait VpnControl {
    /// Snapshot of currently connected sessions.
    async fn list_sessions(&self) -> Result<Vec<OcservSession>, OcservError>;

    /// Drop every session of a user.
    async fn disconnect_user(&self, username: &str) -> Result<(), OcservError>;

    /// Drop a single session.
    async fn disconnect_session(&self, session_id: &str) -> Result<(), OcservError>;

    /// Prevent a user from logging in again.
    async fn lock_user(&self, username: &str) -> Result<(), OcservError>;

    async fn unlock_user(&self, username: &str) -> Result<(), OcservError>;

    /// Stop the VPN server immediately.
    async fn stop_server(&self) -> Result<(), OcservError>;
}

/// Account credentials stored in the ocserv password file.
#[trait_variant::make(Send)]
pub trait VpnAccounts {
    async fn create_user(&self, username: &str, password: &str) -> Result<(), OcservError>;

    async fn change_password(&self, username: &str, password: &str) -> Result<(), OcservError>;
}

#[derive(Clone, Debug)]
pub struct OcservClient {
    password_file: PathBuf,
}

impl OcservClient {
    #[must_use]
    pub fn new<P: Into<PathBuf>>(password_file: P) -> Self {
        Self {
            password_file: password_file.into(),
        }
    }

    #[must_use]
    pub fn password_file(&self) -> &Path {
        &self.password_file
    }

    fn ocpasswd(&self) -> Command {
        let mut command = Command::new(OCPASSWD);
        command.arg("-c").arg(&self.password_file);
        command
    }
}

/// Verify that ocserv and its management tools can be executed.
pub async fn check_installation() -> Result<(), OcservError> {
    for binary in [OCSERV, OCCTL, OCPASSWD] {
        debug!("Checking if {binary} is installed");
        match Command::new(binary)
            .arg("--version")
            .kill_on_drop(true)
            .output()
            .await
        {
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(OcservError::MissingBinary(binary));
            }
            Err(source) => {
                return Err(OcservError::ProcessError {
                    command: binary.to_string(),
                    source,
                });
            }
        }
    }

    Ok(())
}

fn describe(command: &Command) -> String {
    let command = command.as_std();
    let mut description = command.get_program().to_string_lossy().into_owned();
    for arg in command.get_args() {
        description.push(' ');
        description.push_str(&arg.to_string_lossy());
    }
    description
}

fn check_status(description: String, output: Output) -> Result<Output, OcservError> {
    if output.status.success() {
        Ok(output)
    } else {
        Err(OcservError::CommandFailed {
            command: description,
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

/// Run a command to completion and fail on non-zero exit status.
async fn run(mut command: Command) -> Result<Output, OcservError> {
    let description = describe(&command);
    debug!("Running `{description}`");
    let output = command
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|source| OcservError::ProcessError {
            command: description.clone(),
            source,
        })?;

    check_status(description, output)
}

/// Run a command feeding `input` to its standard input.
async fn run_with_input(mut command: Command, input: &str) -> Result<Output, OcservError> {
    let description = describe(&command);
    debug!("Running `{description}`");
    let process_error = |source| OcservError::ProcessError {
        command: description.clone(),
        source,
    };
    let mut child = command
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(process_error)?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(input.as_bytes())
            .await
            .map_err(process_error)?;
        // closing stdin lets the process finish
        drop(stdin);
    }

    let output = child.wait_with_output().await.map_err(process_error)?;
    check_status(description, output)
}

fn occtl<I, S>(args: I) -> Command
where
    I: IntoIterator<Item = S>,
    S: AsRef<std::ffi::OsStr>,
{
    let mut command = Command::new(OCCTL);
    command.args(args);
    command
}

impl VpnControl for OcservClient {
    async fn list_sessions(&self) -> Result<Vec<OcservSession>, OcservError> {
        let output = run(occtl(["-j", "show", "users"])).await?;
        let sessions = parse_sessions(&output.stdout)?;
        debug!("occtl reported {} live sessions", sessions.len());
        Ok(sessions)
    }

    async fn disconnect_user(&self, username: &str) -> Result<(), OcservError> {
        info!("Disconnecting all sessions of user {username}");
        run(occtl(["disconnect", "user", username])).await?;
        Ok(())
    }

    async fn disconnect_session(&self, session_id: &str) -> Result<(), OcservError> {
        info!("Disconnecting session {session_id}");
        run(occtl(["disconnect", "id", session_id])).await?;
        Ok(())
    }

    async fn lock_user(&self, username: &str) -> Result<(), OcservError> {
        info!("Locking ocserv account {username}");
        let mut command = self.ocpasswd();
        command.args(["-l", username]);
        run(command).await?;
        Ok(())
    }

    async fn unlock_user(&self, username: &str) -> Result<(), OcservError> {
        info!("Unlocking ocserv account {username}");
        let mut command = self.ocpasswd();
        command.args(["-u", username]);
        run(command).await?;
        Ok(())
    }

    async fn stop_server(&self) -> Result<(), OcservError> {
        info!("Stopping ocserv");
        run(occtl(["stop", "now"])).await?;
        Ok(())
    }
}

impl VpnAccounts for OcservClient {
    async fn create_user(&self, username: &str, password: &str) -> Result<(), OcservError> {
        info!("Creating ocserv account {username}");
        let mut command = self.ocpasswd();
        command.arg(username);
        // ocpasswd asks for the password twice
        run_with_input(command, &format!("{password}\n{password}\n")).await?;
        Ok(())
    }

    async fn change_password(&self, username: &str, password: &str) -> Result<(), OcservError> {
        info!("Changing password of ocserv account {username}");
        let mut command = self.ocpasswd();
        command.args(["-d", username]);
        run(command).await?;
        self.create_user(username, password).await
    }
}
