//! Platform JVM command builder
//!
//! Assembles the `java` launch command for a platform process. Argument
//! order is fixed and load-bearing: the launcher reads system properties
//! positionally sensitive to JVM flag ordering.

use std::process::ExitStatus;

use crate::deployment::Deployment;
use crate::document::{ConfigKind, PlatformProcessView};
use crate::runner::RunContext;

use super::{spawn_command, write_start_script, ArgumentList, BuildError, Builder, CommandBuilder, CommandLine};

/// Entry-point class launched for every platform application
const LAUNCHER_MAIN: &str = "com.redi.platform.launcher.application.LauncherMain";

/// Builds and executes the platform JVM launch command
#[derive(Debug, Clone, Default)]
pub struct PlatformCommandBuilder {
    text_admin_port: u16,
}

impl PlatformCommandBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the text-admin port instead of reading it from
    /// configuration
    pub fn with_text_admin_port(port: u16) -> Self {
        Self { text_admin_port: port }
    }

    fn append_memory(arguments: &mut ArgumentList, view: &PlatformProcessView<'_>) {
        if let Some(min_heap) = view.min_heap() {
            arguments.push(format!("-Xms{}", min_heap));
        }
        if let Some(max_heap) = view.max_heap() {
            arguments.push(format!("-Xmx{}", max_heap));
        }
    }

    fn append_base_args(arguments: &mut ArgumentList, view: &PlatformProcessView<'_>) {
        for base_arg in view.base_args() {
            arguments.push(base_arg);
        }
    }

    fn append_platform_properties(arguments: &mut ArgumentList, view: &PlatformProcessView<'_>) {
        for (key, value) in view.platform_properties() {
            arguments.push(format!("-Dplatform.{}={}", key, value));
        }
    }

    /// Pick the text-admin port from configuration or the builder
    /// override; the configured value wins when both are set.
    fn text_admin_port(&self, view: &PlatformProcessView<'_>) -> Result<i64, BuildError> {
        let configured = view.text_admin_port().unwrap_or(0);
        let own = i64::from(self.text_admin_port);

        let port = if configured > 0 && own > 0 {
            if configured == own {
                tracing::warn!(port = configured, "text admin port specified by both builder and configuration");
            }
            configured
        } else if own > 0 {
            own
        } else {
            configured
        };

        if port > 0 {
            Ok(port)
        } else if port < 0 {
            Err(BuildError::NonPositiveTextAdminPort { port })
        } else {
            Err(BuildError::MissingTextAdminPort)
        }
    }

    fn append_connections(arguments: &mut ArgumentList, view: &PlatformProcessView<'_>) {
        if let Some(discovery) = view.discovery_url() {
            arguments.push(format!("-DdiscoveryUrl={}", discovery));
        }
        if let Some(status) = view.status_url() {
            arguments.push(format!("-Dstatus.target={}", status));
        }
    }

    fn append_udp_log(arguments: &mut ArgumentList, view: &PlatformProcessView<'_>) {
        match view.udp_log() {
            Some(udp) => {
                arguments.push(format!(
                    "-Dmain.log.udp=true -Dudp.log.target={} -Dudp.log.port={}",
                    udp.target, udp.port
                ));
            }
            None => {
                arguments.push("-Dmain.log.udp=false");
            }
        }
    }

    fn append_remote_debug(arguments: &mut ArgumentList, view: &PlatformProcessView<'_>) {
        if let Some(debug) = view.remote_debug() {
            arguments.push(format!("{},address={}", debug.args, debug.port));
        }
    }

    fn append_application_name(arguments: &mut ArgumentList, application_name: &str) {
        arguments.push(format!("-DprocessName={}", application_name));
        arguments.push(r#"-cp "libs/*""#);
        arguments.push(LAUNCHER_MAIN);
        arguments.push(format!("{}.commands", application_name));
    }
}

impl Builder for PlatformCommandBuilder {
    fn emit(&self, deployment: &Deployment) -> Result<(), BuildError> {
        let command = self.assemble(deployment)?;
        let document = deployment
            .configuration(ConfigKind::PlatformProcess)
            .map_err(|err| BuildError::Configuration(err.to_string()))?;
        write_start_script(
            deployment,
            document.start_script_filename(),
            &command,
            &["echo -n 'Current directory is: '", "pwd"],
        )?;
        Ok(())
    }
}

impl CommandBuilder for PlatformCommandBuilder {
    fn executable(&self) -> &str {
        "java"
    }

    fn assemble(&self, deployment: &Deployment) -> Result<CommandLine, BuildError> {
        let document = deployment
            .configuration(ConfigKind::PlatformProcess)
            .map_err(|err| BuildError::Configuration(err.to_string()))?;
        let view = document.platform_process();
        let application_name = document.app_name().unwrap_or(deployment.stripe());

        let mut arguments = ArgumentList::new();
        Self::append_memory(&mut arguments, &view);
        Self::append_base_args(&mut arguments, &view);
        Self::append_platform_properties(&mut arguments, &view);
        arguments.push(format!("-Dtextadmin.listenPort={}", self.text_admin_port(&view)?));
        Self::append_connections(&mut arguments, &view);
        Self::append_udp_log(&mut arguments, &view);
        Self::append_remote_debug(&mut arguments, &view);
        arguments.push("-DPackageScanner.ignoreManifest=true");
        Self::append_application_name(&mut arguments, application_name);

        Ok(CommandLine::new(self.executable(), arguments))
    }

    fn execute(&self, deployment: &Deployment, run: &RunContext) -> Result<ExitStatus, BuildError> {
        let command = self.assemble(deployment)?;
        spawn_command(&command, &run.run_directory)
    }
}
