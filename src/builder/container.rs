//! Container command builder
//!
//! Assembles the `docker run` command for a containerized instance. The
//! container is named and hostnamed from the identity tuple; ports and
//! volumes come from the container configuration in declared order.

use std::process::{Command, ExitStatus};

use crate::deployment::Deployment;
use crate::document::{ConfigKind, PortMapping};
use crate::runner::RunContext;

use super::{spawn_command, write_start_script, ArgumentList, BuildError, Builder, CommandBuilder, CommandLine};

/// Builds and executes the container launch command
#[derive(Debug, Clone, Default)]
pub struct ContainerCommandBuilder;

impl ContainerCommandBuilder {
    pub fn new() -> Self {
        Self
    }

    fn append_ports(arguments: &mut ArgumentList, ports: &[PortMapping]) {
        for port in ports {
            match port {
                PortMapping::Plain(port) => {
                    arguments.push(format!("--publish {}", port));
                }
                PortMapping::HostContainer { host, container } => {
                    arguments.push(format!("--publish {}:{}", host, container));
                }
            }
        }
    }

    fn pull_image(image: &str) -> Result<ExitStatus, BuildError> {
        tracing::info!(image, "pulling container image");
        Ok(Command::new("docker").args(["pull", image]).status()?)
    }
}

impl Builder for ContainerCommandBuilder {
    fn emit(&self, deployment: &Deployment) -> Result<(), BuildError> {
        let command = self.assemble(deployment)?;
        let document = deployment
            .configuration(ConfigKind::Container)
            .map_err(|err| BuildError::Configuration(err.to_string()))?;
        write_start_script(deployment, document.start_script_filename(), &command, &[])?;
        Ok(())
    }
}

impl CommandBuilder for ContainerCommandBuilder {
    fn executable(&self) -> &str {
        "docker run"
    }

    fn assemble(&self, deployment: &Deployment) -> Result<CommandLine, BuildError> {
        let document = deployment
            .configuration(ConfigKind::Container)
            .map_err(|err| BuildError::Configuration(err.to_string()))?;
        let view = document.container();
        let identity = deployment.identity();

        let mut arguments = ArgumentList::new();
        arguments.push("--detach");
        arguments.push(format!("--hostname {}", identity.qualified_hostname()));
        arguments.push(format!("--name {}", identity.short_name()));
        Self::append_ports(&mut arguments, &view.ports()?);
        for volume in view.volumes()? {
            arguments.push(format!("--volume {}:{}", volume.host, volume.container));
        }

        Ok(CommandLine::new(self.executable(), arguments))
    }

    /// Pull the image, then launch the container from the run directory
    /// with the working-directory flag, image reference, and rendered
    /// start script appended.
    fn execute(&self, deployment: &Deployment, run: &RunContext) -> Result<ExitStatus, BuildError> {
        let document = deployment
            .configuration(ConfigKind::Container)
            .map_err(|err| BuildError::Configuration(err.to_string()))?;
        let image = run
            .image_reference()
            .or_else(|| document.container().image())
            .ok_or(BuildError::MissingContainerImage)?;
        Self::pull_image(&image)?;

        let workdir = run
            .run_directory
            .strip_prefix(&run.root)
            .unwrap_or(&run.run_directory)
            .to_path_buf();
        let script = format!("scripts/{}", document.start_script_filename());
        let command = self.assemble(deployment)?.with_trailing([
            "--workdir".to_string(),
            workdir.display().to_string(),
            image,
            script,
        ]);
        spawn_command(&command, &run.run_directory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deployment::Identity;
    use serde_json::json;
    use std::fs;
    use tempfile::TempDir;

    fn deployment_with(app_params: serde_json::Value) -> (TempDir, Deployment) {
        let dir = TempDir::new().unwrap();
        let common = dir.path().join("common/qa/EM2");
        fs::create_dir_all(&common).unwrap();
        fs::write(common.join("historic.properties"), "").unwrap();

        let overrides = dir.path().join("overrides/historic/HDS01/backup");
        fs::create_dir_all(&overrides).unwrap();
        fs::write(overrides.join("app_params.json"), app_params.to_string()).unwrap();

        let identity = Identity {
            environment: "qa".to_string(),
            data_center: "EM2".to_string(),
            application: "historic".to_string(),
            stripe: "HDS01".to_string(),
            instance: "backup".to_string(),
        };
        let deployment = Deployment::new(dir.path(), identity).unwrap();
        (dir, deployment)
    }

    #[test]
    fn test_argument_order() {
        let (_dir, deployment) = deployment_with(json!({
            "dockerContainer": {
                "ports": [80, {"host": 8080, "container": 80}],
                "volumes": [{"host": "/data", "container": "/var/data"}]
            }
        }));

        let command = ContainerCommandBuilder::new().assemble(&deployment).unwrap();
        assert_eq!(
            command.tokens(),
            &[
                "docker",
                "run",
                "--detach",
                "--hostname",
                "qa-EM2-historic-HDS01-backup.rdti.com",
                "--name",
                "historic-HDS01-backup",
                "--publish",
                "80",
                "--publish",
                "8080:80",
                "--volume",
                "/data:/var/data",
            ]
        );
    }

    #[test]
    fn test_ports_preserve_declared_order() {
        let (_dir, deployment) = deployment_with(json!({
            "dockerContainer": {"ports": [{"host": 9000, "container": 90}, 81]}
        }));

        let command = ContainerCommandBuilder::new().assemble(&deployment).unwrap();
        let tokens = command.tokens();
        let mapped = tokens.iter().position(|t| t == "9000:90").unwrap();
        let bare = tokens.iter().position(|t| t == "81").unwrap();
        assert!(mapped < bare);
    }

    #[test]
    fn test_empty_container_section() {
        let (_dir, deployment) = deployment_with(json!({}));

        let command = ContainerCommandBuilder::new().assemble(&deployment).unwrap();
        assert_eq!(
            command.tokens(),
            &[
                "docker",
                "run",
                "--detach",
                "--hostname",
                "qa-EM2-historic-HDS01-backup.rdti.com",
                "--name",
                "historic-HDS01-backup",
            ]
        );
    }

    #[test]
    fn test_emit_writes_script() {
        let (_dir, deployment) = deployment_with(json!({
            "dockerContainer": {"ports": [80]},
            "startScript": "start_container.sh"
        }));
        fs::create_dir_all(deployment.output_directory()).unwrap();

        ContainerCommandBuilder::new().emit(&deployment).unwrap();

        let script = deployment.output_directory().join("scripts/start_container.sh");
        let contents = fs::read_to_string(script).unwrap();
        assert!(contents.contains("docker run --detach"));
        assert!(contents.contains("--publish 80"));
    }
}
