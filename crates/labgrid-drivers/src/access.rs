//! Access methods: how an operator or participant reaches a node of a
//! deployed environment.
//!
//! A method only builds the command line; running it (and proxying the
//! terminal) is up to the caller. The method of a node is chosen by its
//! [`ACCESS_METHOD_LABEL`], defaulting to `ssh`.

use std::collections::BTreeMap;

use labgrid_state::ContainerDetail;

use crate::error::{DriverError, DriverResult};

pub const ACCESS_METHOD_LABEL: &str = "labgrid.io/access-method";
pub const EXEC_COMMAND_LABEL: &str = "labgrid.io/exec-command";
pub const EXEC_COMMAND_ADMIN_LABEL: &str = "labgrid.io/exec-command-admin";
pub const SSH_USERNAME_LABEL: &str = "labgrid.io/ssh-username";
pub const SSH_USERNAME_ADMIN_LABEL: &str = "labgrid.io/ssh-username-admin";
pub const SSH_PORT_LABEL: &str = "labgrid.io/ssh-port";

pub const DEFAULT_ACCESS_METHOD: &str = "ssh";
pub const DEFAULT_EXEC_COMMAND: &str = "sh";
pub const DEFAULT_SSH_USERNAME: &str = "admin";
pub const DEFAULT_SSH_PORT: u16 = 22;

/// A node to connect to.
#[derive(Debug, Clone, Copy)]
pub struct AccessTarget<'a> {
    /// Labels of the node in the topology definition.
    pub labels: &'a BTreeMap<String, String>,
    pub container: &'a ContainerDetail,
    /// Admins may get a different login or command.
    pub admin: bool,
}

impl AccessTarget<'_> {
    /// Name of the access method the node asks for.
    pub fn method(&self) -> &str {
        self.labels
            .get(ACCESS_METHOD_LABEL)
            .map(String::as_str)
            .unwrap_or(DEFAULT_ACCESS_METHOD)
    }

    /// The admin label when accessing as admin and set, else the plain one.
    fn label(&self, plain: &str, admin: &str) -> Option<&str> {
        let admin_value = self.admin.then(|| self.labels.get(admin)).flatten();
        admin_value.or_else(|| self.labels.get(plain)).map(String::as_str)
    }
}

/// Program and arguments to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessCommand {
    pub program: String,
    pub args: Vec<String>,
}

pub trait AccessMethod: Send + Sync {
    fn command(&self, target: &AccessTarget<'_>) -> DriverResult<AccessCommand>;
}

/// `docker exec` into the node's container.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExecAccess;

impl ExecAccess {
    pub const NAME: &'static str = "exec";
}

impl AccessMethod for ExecAccess {
    fn command(&self, target: &AccessTarget<'_>) -> DriverResult<AccessCommand> {
        let container = &target.container.container_name;
        if container.is_empty() {
            return Err(DriverError::Failed(format!(
                "node {} has no container",
                target.container.name
            )));
        }
        let command = target
            .label(EXEC_COMMAND_LABEL, EXEC_COMMAND_ADMIN_LABEL)
            .unwrap_or(DEFAULT_EXEC_COMMAND);

        let mut args = vec!["exec".to_string(), "-it".to_string(), container.clone()];
        args.extend(command.split_whitespace().map(str::to_string));
        Ok(AccessCommand {
            program: "docker".to_string(),
            args,
        })
    }
}

/// `ssh` to the node's management address.
#[derive(Debug, Default, Clone, Copy)]
pub struct SshAccess;

impl SshAccess {
    pub const NAME: &'static str = "ssh";
}

impl AccessMethod for SshAccess {
    fn command(&self, target: &AccessTarget<'_>) -> DriverResult<AccessCommand> {
        // Management addresses are reported in CIDR form.
        let address = target.container.management_ip_address.as_str();
        let host = address.split('/').next().unwrap_or(address);
        if host.is_empty() {
            return Err(DriverError::Failed(format!(
                "node {} has no management address",
                target.container.name
            )));
        }

        let user = target
            .label(SSH_USERNAME_LABEL, SSH_USERNAME_ADMIN_LABEL)
            .unwrap_or(DEFAULT_SSH_USERNAME);
        let port = match target.labels.get(SSH_PORT_LABEL) {
            Some(value) => value.parse::<u16>().map_err(|_| DriverError::InvalidLabel {
                label: SSH_PORT_LABEL.to_string(),
                value: value.clone(),
            })?,
            None => DEFAULT_SSH_PORT,
        };

        Ok(AccessCommand {
            program: "ssh".to_string(),
            args: vec![
                "-p".to_string(),
                port.to_string(),
                "-o".to_string(),
                "StrictHostKeyChecking=no".to_string(),
                format!("{user}@{host}"),
            ],
        })
    }
}
